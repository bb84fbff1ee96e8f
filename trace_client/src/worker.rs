// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The background worker: one thread owned by the facade that keeps the
//! daemon relationship alive without ever blocking an application call.
//!
//! Each tick it (1) reattempts the daemon connection when disconnected,
//! (2) registers the trace-metadata region and arms the trace path,
//! (3) replays pending client and shared-memory registrations, and
//! (4) runs the consumer-side job-processing step. On stop it unregisters
//! and unlinks the metadata region and closes the ring buffer.

use log::*;

use std::os::fd::AsFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use shm_ring::SharedMemoryRegion;

use crate::registry::{PendingShm, ShmSource};
use crate::stop::StopToken;
use crate::LibraryShared;

pub(crate) fn spawn(
    shared: Arc<LibraryShared>,
    stop: StopToken,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("trace-library-worker".into())
        .spawn(move || run(shared, stop))
}

fn run(shared: Arc<LibraryShared>, stop: StopToken) {
    debug!("trace library worker started");
    while !stop.stop_requested() {
        tick(&shared, &stop);
        if stop.wait_timeout(shared.config.poll_interval) {
            break;
        }
    }
    shutdown(&shared);
    debug!("trace library worker stopped");
}

fn tick(shared: &Arc<LibraryShared>, stop: &StopToken) {
    if !shared.communicator.is_connected() {
        if let Err(e) = shared.communicator.connect() {
            trace!("daemon connect attempt failed: {e}");
            return;
        }
    }

    if !shared.metadata_registered.load(Ordering::Acquire) {
        let name = shared.allocator.metadata_name().to_owned();
        match shared.communicator.register_shm_object_path(&name) {
            Ok(handle) => {
                shared.allocator.set_metadata_handle(handle);
                shared.metadata_registered.store(true, Ordering::Release);
            }
            Err(e) => {
                debug!("registering trace-metadata region failed: {e}");
                if e.is_fatal() {
                    shared.gate.record_err(e);
                }
                return;
            }
        }
    }

    replay_pending(shared, stop);

    if let Err(e) = shared.processor.process_jobs() {
        debug!("trace job processing failed: {e}");
    }
}

/// Forward cached registrations that accumulated while the daemon was
/// unreachable. A recoverable failure or a stop request aborts the sweep;
/// every entry not completed (or permanently failed) goes back to pending,
/// so nothing taken into flight here is ever orphaned.
fn replay_pending(shared: &Arc<LibraryShared>, stop: &StopToken) {
    let mut clients = shared.registry.take_pending_clients().into_iter();
    while let Some(pending) = clients.next() {
        if stop.stop_requested() {
            shared.registry.requeue_client(pending.local_id);
            break;
        }
        match shared
            .communicator
            .register_client(pending.binding, pending.app_id_prefix)
        {
            Ok(remote_id) => {
                debug!(
                    "replayed client registration {} -> remote {remote_id}",
                    pending.local_id
                );
                shared.registry.complete_client(pending.local_id, remote_id);
            }
            Err(e) if e.is_fatal() => {
                warn!(
                    "replaying client registration {} failed permanently: {e}",
                    pending.local_id
                );
                shared.registry.requeue_client(pending.local_id);
                shared.gate.record_err(e);
                break;
            }
            Err(e) => {
                trace!("client replay deferred: {e}");
                shared.registry.requeue_client(pending.local_id);
                break;
            }
        }
    }
    for not_attempted in clients {
        shared.registry.requeue_client(not_attempted.local_id);
    }

    let mut shm_entries = shared.registry.take_pending_shm().into_iter();
    while let Some(pending) = shm_entries.next() {
        if stop.stop_requested() {
            shared.registry.requeue_shm(pending.local_handle);
            break;
        }
        let PendingShm {
            local_handle,
            client,
            source,
        } = pending;
        let result = match &source {
            ShmSource::Fd(fd) => shared.communicator.register_shm_object_fd(fd.as_fd()),
            ShmSource::Path(path) => shared.communicator.register_shm_object_path(path),
        };
        match result {
            Ok(remote_handle) => {
                debug!(
                    "replayed shm registration for client {client} -> handle {remote_handle}"
                );
                shared.registry.complete_shm(local_handle, remote_handle);
            }
            Err(e) if e.is_fatal() => {
                warn!("replaying shm registration for client {client} failed permanently: {e}");
                shared.registry.remove_shm(local_handle);
                shared.gate.record_err(e);
                break;
            }
            Err(e) => {
                trace!("shm replay deferred: {e}");
                shared.registry.requeue_shm(local_handle);
                break;
            }
        }
    }
    for not_attempted in shm_entries {
        shared.registry.requeue_shm(not_attempted.local_handle);
    }
}

fn shutdown(shared: &Arc<LibraryShared>) {
    if shared.metadata_registered.swap(false, Ordering::AcqRel) {
        if let Some(handle) = shared.allocator.metadata_handle() {
            if let Err(e) = shared.communicator.unregister_shm_object(handle) {
                debug!("unregistering trace-metadata region failed: {e}");
            }
        }
    }
    SharedMemoryRegion::unlink(shared.allocator.metadata_name());
    shared.allocator.close_ring_buffer();
    shared.communicator.close();
}

/// Reaction to a detected daemon death, installed as the communicator's
/// termination callback by the facade: disarm the trace path, drop queued
/// jobs, wipe the ring when last participant, and put every registered
/// entry back on the replay path. The worker reconnects on its next tick.
pub(crate) fn on_daemon_terminated(shared: &LibraryShared) {
    shared.allocator.mark_disconnected();
    shared.metadata_registered.store(false, Ordering::Release);
    shared.processor.clean_pending_jobs();
    shared.allocator.reset_ring_buffer();
    shared.registry.mark_all_pending();
}

