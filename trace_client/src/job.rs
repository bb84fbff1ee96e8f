// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Trace-job production and consumption around the shared ring.
//!
//! The [`TraceJobAllocator`] is the producer side used by application
//! threads: it claims a ring slot, copies the job's meta info into the
//! per-process trace-metadata region (one metadata slot per ring slot), and
//! publishes the descriptor. It refuses to produce until the worker has
//! registered the metadata region with the daemon ("armed" it) and while a
//! daemon death is unresolved.
//!
//! The [`TraceJobProcessor`] is the consumer-side step the background worker
//! ticks: it drains ready slots into the daemon's trace path and fires the
//! per-client trace-done callbacks.

use log::*;

use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use shm_ring::{
    SharedMemoryRegion, ShmChunk, ShmRingBuffer, TraceJobDescriptor,
};
use trace_protocol::{ErrorCode, ShmObjectHandle, TraceClientId, TraceContextId, TraceResult};

use crate::registry::CLIENT_CAPACITY;
use crate::scoped::TraceDoneCallback;

/// Bytes of meta info (plus inline local payload) each trace job may carry.
pub const TMD_SLOT_SIZE: usize = 256;

const READINESS_NEVER_CONNECTED: u8 = 0;
const READINESS_READY: u8 = 1;
const READINESS_DISCONNECTED: u8 = 2;

/// The per-process `/dev_tmd_<pid>` region holding one meta-info slot per
/// ring slot.
pub struct TraceMetadataRegion {
    region: SharedMemoryRegion,
    slot_count: u16,
}

impl TraceMetadataRegion {
    /// Shared-memory file name for this process.
    pub fn name_for_pid(pid: i32) -> String {
        format!("/dev_tmd_{pid}")
    }

    /// Create the region fresh, replacing any leftover from an earlier
    /// process with the same pid.
    pub fn create(pid: i32, slot_count: u16) -> nix::Result<Self> {
        let name = Self::name_for_pid(pid);
        SharedMemoryRegion::unlink(&name);
        let region = SharedMemoryRegion::create(&name, slot_count as usize * TMD_SLOT_SIZE)?;
        Ok(Self { region, slot_count })
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    fn write_slot(&self, slot: u16, meta: &[u8], payload: &[u8]) -> TraceResult<()> {
        debug_assert!(slot < self.slot_count);
        // Layout per slot: meta length, meta bytes, payload length, payload
        // bytes. Both length fields are u16.
        if 4 + meta.len() + payload.len() > TMD_SLOT_SIZE {
            return Err(ErrorCode::InvalidArgument);
        }

        let base = unsafe { self.region.as_ptr().add(slot as usize * TMD_SLOT_SIZE) };
        // SAFETY: in-bounds writes inside this slot; the ring protocol hands
        // each slot to exactly one producer at a time.
        unsafe {
            let meta_len = (meta.len() as u16).to_ne_bytes();
            base.copy_from_nonoverlapping(meta_len.as_ptr(), 2);
            base.add(2).copy_from_nonoverlapping(meta.as_ptr(), meta.len());
            let payload_len = (payload.len() as u16).to_ne_bytes();
            base.add(2 + meta.len())
                .copy_from_nonoverlapping(payload_len.as_ptr(), 2);
            base.add(4 + meta.len())
                .copy_from_nonoverlapping(payload.as_ptr(), payload.len());
        }
        Ok(())
    }
}

/// Producer side of the trace path.
pub struct TraceJobAllocator {
    ring: Arc<ShmRingBuffer>,
    metadata: TraceMetadataRegion,
    readiness: AtomicU8,
    metadata_handle: AtomicI32,
}

impl TraceJobAllocator {
    pub fn new(ring: Arc<ShmRingBuffer>, metadata: TraceMetadataRegion) -> Self {
        Self {
            ring,
            metadata,
            readiness: AtomicU8::new(READINESS_NEVER_CONNECTED),
            metadata_handle: AtomicI32::new(-1),
        }
    }

    pub fn metadata_name(&self) -> &str {
        self.metadata.name()
    }

    /// Arm the trace path: the worker stores the daemon handle of the
    /// metadata region once it is registered.
    pub fn set_metadata_handle(&self, handle: ShmObjectHandle) {
        self.metadata_handle.store(handle, Ordering::Release);
        self.readiness.store(READINESS_READY, Ordering::Release);
        info!("trace path armed (metadata handle {handle})");
    }

    pub fn metadata_handle(&self) -> Option<ShmObjectHandle> {
        let handle = self.metadata_handle.load(Ordering::Acquire);
        (handle >= 0).then_some(handle)
    }

    /// Disarm after a detected daemon death; producers see
    /// `DaemonIsDisconnected` until the worker re-arms.
    pub fn mark_disconnected(&self) {
        self.readiness
            .store(READINESS_DISCONNECTED, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.load(Ordering::Acquire) == READINESS_READY
    }

    fn check_ready(&self) -> TraceResult<()> {
        match self.readiness.load(Ordering::Acquire) {
            READINESS_READY => Ok(()),
            READINESS_DISCONNECTED => Err(ErrorCode::DaemonIsDisconnected),
            _ => Err(ErrorCode::DaemonNotConnected),
        }
    }

    /// Queue a job whose payload is shared by reference.
    pub fn allocate_shm_job(
        &self,
        client: TraceClientId,
        meta: &[u8],
        chunks: &[ShmChunk],
        context_id: TraceContextId,
    ) -> TraceResult<()> {
        self.check_ready()?;

        let slot = self.ring.acquire_empty_slot()?;
        let index = self.ring.slot_index(slot);
        if let Err(e) = self.metadata.write_slot(index, meta, &[]) {
            slot.abandon();
            return Err(e);
        }
        match TraceJobDescriptor::shm_job(client, index as u32, chunks, context_id) {
            Ok(descriptor) => {
                slot.publish(descriptor);
                Ok(())
            }
            Err(e) => {
                slot.abandon();
                Err(e)
            }
        }
    }

    /// Queue a job whose payload is copied inline.
    pub fn allocate_local_job(
        &self,
        client: TraceClientId,
        meta: &[u8],
        payload: &[u8],
    ) -> TraceResult<()> {
        self.check_ready()?;

        let slot = self.ring.acquire_empty_slot()?;
        let index = self.ring.slot_index(slot);
        if let Err(e) = self.metadata.write_slot(index, meta, payload) {
            slot.abandon();
            return Err(e);
        }
        slot.publish(TraceJobDescriptor::local_job(
            client,
            index as u32,
            payload.len() as u32,
        ));
        Ok(())
    }

    /// Wipe the queue after a daemon death (when this library is the last
    /// live participant).
    pub fn reset_ring_buffer(&self) {
        self.ring.reset();
    }

    /// Producer-side shutdown.
    pub fn close_ring_buffer(&self) {
        self.ring.close();
    }

    pub fn ring(&self) -> &ShmRingBuffer {
        &self.ring
    }
}

/// Consumer side of the trace path plus the trace-done callback store.
pub struct TraceJobProcessor {
    ring: Arc<ShmRingBuffer>,
    callbacks: RwLock<Vec<Option<TraceDoneCallback>>>,
}

impl TraceJobProcessor {
    pub fn new(ring: Arc<ShmRingBuffer>) -> Self {
        let mut callbacks = Vec::new();
        callbacks.resize_with(CLIENT_CAPACITY, || None);
        Self {
            ring,
            callbacks: RwLock::new(callbacks),
        }
    }

    /// Store the trace-done callback for a client. At most one per client;
    /// neither replacement nor an already-expired callback is accepted.
    pub fn save_callback(
        &self,
        client: TraceClientId,
        callback: TraceDoneCallback,
    ) -> TraceResult<()> {
        let index = callback_index(client)?;
        if callback.is_expired() {
            return Err(ErrorCode::InvalidArgument);
        }
        let mut callbacks = self.callbacks.write().unwrap();
        if callbacks[index].is_some() {
            return Err(ErrorCode::InvalidArgument);
        }
        callbacks[index] = Some(callback);
        Ok(())
    }

    pub fn remove_callback(&self, client: TraceClientId) {
        if let Ok(index) = callback_index(client) {
            self.callbacks.write().unwrap()[index] = None;
        }
    }

    pub fn has_callback(&self, client: TraceClientId) -> bool {
        callback_index(client)
            .map(|index| self.callbacks.read().unwrap()[index].is_some())
            .unwrap_or(false)
    }

    /// Drain ready slots into the daemon's trace path, completing each job
    /// through its client's trace-done callback.
    pub fn process_jobs(&self) -> TraceResult<()> {
        loop {
            let slot = match self.ring.fetch_ready_slot() {
                Ok(slot) => slot,
                Err(ErrorCode::RingBufferEmpty) | Err(ErrorCode::RingBufferNoReadyElement) => {
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let descriptor = slot.read_payload();
            slot.release();
            self.complete(&descriptor);
        }
    }

    fn complete(&self, descriptor: &TraceJobDescriptor) {
        trace!(
            "dispatched trace job (client {}, meta slot {})",
            descriptor.client_id,
            descriptor.meta_slot
        );
        let Some(context_id) = descriptor.context_id() else {
            return;
        };
        let Ok(index) = callback_index(descriptor.client_id) else {
            return;
        };
        let callback = {
            let callbacks = self.callbacks.read().unwrap();
            callbacks[index].clone()
        };
        if let Some(callback) = callback {
            if !callback.invoke(context_id) {
                debug!(
                    "trace-done callback for client {} expired",
                    descriptor.client_id
                );
            }
        }
    }

    /// Drop everything still queued without completing it; called when the
    /// daemon died and the jobs will never be traced.
    pub fn clean_pending_jobs(&self) {
        let mut dropped = 0u32;
        while let Ok(slot) = self.ring.fetch_ready_slot() {
            slot.release();
            dropped += 1;
        }
        if dropped > 0 {
            debug!("dropped {dropped} queued trace jobs after daemon death");
        }
    }
}

fn callback_index(client: TraceClientId) -> TraceResult<usize> {
    let index = client as usize;
    if index == 0 || index > CLIENT_CAPACITY {
        return Err(ErrorCode::ClientNotFound);
    }
    Ok(index - 1)
}
