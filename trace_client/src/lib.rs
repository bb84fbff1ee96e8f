// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Client library for submitting trace payloads to the out-of-process trace
//! daemon.
//!
//! The [`TraceLibrary`] facade exposes a stable synchronous API regardless
//! of daemon state: registrations are cached locally and replayed by a
//! background worker once the daemon is reachable, trace jobs travel
//! through a lock-free shared-memory ring, and a daemon crash is detected
//! asynchronously and healed by reconnect-and-replay. No public call ever
//! blocks on daemon I/O.
//!
//! One fatal condition poisons the facade instance: every call after it
//! reports [`ErrorCode::DaemonNotAvailable`].

use log::*;

use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub mod communicator;
pub mod job;
pub mod registry;
pub mod scoped;
pub mod stop;
mod worker;

pub use communicator::{Communicator, ConnectionState, DaemonCommunicator, TerminationCallback};
pub use job::{TraceJobAllocator, TraceJobProcessor, TraceMetadataRegion, TMD_SLOT_SIZE};
pub use registry::{Registry, CLIENT_CAPACITY, SHM_CAPACITY};
pub use scoped::{Scope, ScopedCallback, TraceDoneCallback};
pub use stop::{StopSource, StopToken};

pub use shm_ring::{
    MemoryValidator, PosixMemoryValidator, RingBufferStatistics, ShmChunk, ShmRingBuffer,
};
pub use trace_protocol::{
    BindingType, ErrorCode, Severity, ShmObjectHandle, TraceClientId, TraceContextId, TraceResult,
};

use registry::{ShmKey, ShmSource};
use trace_protocol::app_id_prefix;

/// Default path the daemon publishes its service socket under.
pub const DEFAULT_DAEMON_SERVICE_PATH: &str = "/tmp/tracing_daemond.sock";

/// Tuning knobs of a facade instance. Paths are configurable so test
/// harnesses can isolate their daemons and rings; the defaults are the
/// system-wide names every tracing participant shares.
#[derive(Clone, Debug)]
pub struct Config {
    pub daemon_service_path: PathBuf,
    pub ring_buffer_path: String,
    /// `None` disables statistics collection.
    pub statistics_path: Option<String>,
    pub ring_capacity: usize,
    /// Background worker tick period.
    pub poll_interval: Duration,
    /// Bound on every IPC send/receive.
    pub io_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon_service_path: PathBuf::from(DEFAULT_DAEMON_SERVICE_PATH),
            ring_buffer_path: shm_ring::DEFAULT_RING_BUFFER_PATH.into(),
            statistics_path: Some(shm_ring::DEFAULT_STATISTICS_PATH.into()),
            ring_capacity: 1024,
            poll_interval: Duration::from_millis(10),
            io_timeout: Duration::from_millis(100),
        }
    }
}

/// The sticky global error gate. The first fatal error wins; afterwards
/// every public call short-circuits.
pub(crate) struct ErrorGate {
    code: AtomicU16,
}

impl ErrorGate {
    fn new() -> Self {
        Self {
            code: AtomicU16::new(0),
        }
    }

    fn check(&self) -> TraceResult<()> {
        if self.code.load(Ordering::Acquire) != 0 {
            return Err(ErrorCode::DaemonNotAvailable);
        }
        Ok(())
    }

    fn record<T>(&self, result: TraceResult<T>) -> TraceResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.record_err(*e);
            }
        }
        result
    }

    pub(crate) fn record_err(&self, error: ErrorCode) {
        debug_assert!(error.is_fatal());
        if self
            .code
            .compare_exchange(0, error.to_wire(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            error!("trace library poisoned by fatal error: {error}");
        }
    }

    fn current(&self) -> Option<ErrorCode> {
        let raw = self.code.load(Ordering::Acquire);
        (raw != 0).then(|| ErrorCode::from_wire(raw))
    }
}

pub(crate) struct LibraryShared {
    pub(crate) config: Config,
    pub(crate) gate: ErrorGate,
    pub(crate) registry: Registry,
    pub(crate) communicator: Arc<dyn Communicator>,
    pub(crate) validator: Arc<dyn MemoryValidator>,
    pub(crate) allocator: TraceJobAllocator,
    pub(crate) processor: TraceJobProcessor,
    pub(crate) metadata_registered: AtomicBool,
}

/// The facade. Owns the registries, the daemon communicator, the ring
/// buffer handles, and the background worker thread; everything is wound
/// down on drop.
pub struct TraceLibrary {
    shared: Arc<LibraryShared>,
    stop: StopSource,
    worker: Option<JoinHandle<()>>,
}

impl TraceLibrary {
    /// Construct against the real daemon communicator and the POSIX memory
    /// validator.
    pub fn new(config: Config) -> TraceResult<Self> {
        let communicator = Arc::new(DaemonCommunicator::new(
            config.daemon_service_path.clone(),
            config.io_timeout,
        ));
        Self::with_parts(config, communicator, Arc::new(PosixMemoryValidator))
    }

    /// Construct with injected collaborators; the seam the test suites use
    /// to run without a real daemon.
    pub fn with_parts(
        config: Config,
        communicator: Arc<dyn Communicator>,
        validator: Arc<dyn MemoryValidator>,
    ) -> TraceResult<Self> {
        if config.ring_capacity == 0 || config.ring_capacity > shm_ring::MAX_RING_CAPACITY {
            return Err(ErrorCode::InvalidArgument);
        }

        let pid = nix::unistd::getpid().as_raw();
        let metadata = TraceMetadataRegion::create(pid, config.ring_capacity as u16)
            .map_err(|_| ErrorCode::SharedMemoryObjectRegistrationFailed)?;
        let metadata_name = metadata.name().to_owned();

        let construct = || -> TraceResult<Arc<LibraryShared>> {
            // The metadata region must live in typed memory or the daemon
            // cannot map the payloads it is told about.
            let metadata_fd = validator.open_shared_memory(&metadata_name)?;
            if !validator.is_shared_memory_typed(metadata_fd.as_fd())? {
                return Err(ErrorCode::SharedMemoryObjectRegistrationFailed);
            }
            drop(metadata_fd);

            let ring = Arc::new(
                ShmRingBuffer::create_or_open(
                    &config.ring_buffer_path,
                    config.ring_capacity,
                    false,
                    config.statistics_path.as_deref(),
                )
                .map_err(|e| {
                    warn!("ring buffer construction failed: {e}");
                    ErrorCode::TraceJobAllocatorInitializationFailed
                })?,
            );

            Ok(Arc::new(LibraryShared {
                gate: ErrorGate::new(),
                registry: Registry::new(),
                communicator: communicator.clone(),
                validator: validator.clone(),
                allocator: TraceJobAllocator::new(ring.clone(), metadata),
                processor: TraceJobProcessor::new(ring),
                metadata_registered: AtomicBool::new(false),
                config,
            }))
        };

        let shared = match construct() {
            Ok(shared) => shared,
            Err(e) => {
                shm_ring::SharedMemoryRegion::unlink(&metadata_name);
                return Err(e);
            }
        };

        let weak = Arc::downgrade(&shared);
        shared
            .communicator
            .subscribe_termination(Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    worker::on_daemon_terminated(&shared);
                }
            }));

        let stop = StopSource::new();
        let worker = worker::spawn(shared.clone(), stop.token()).map_err(|e| {
            error!("spawning background worker failed: {e}");
            shm_ring::SharedMemoryRegion::unlink(&metadata_name);
            ErrorCode::GenericError
        })?;

        Ok(Self {
            shared,
            stop,
            worker: Some(worker),
        })
    }

    /// Register a logical client. Idempotent per `(binding, app-id prefix)`;
    /// only the first 8 bytes of `app_id` take part in identity. The
    /// returned id stays valid until [`Self::unregister`], across daemon
    /// restarts.
    pub fn register_client(
        &self,
        binding: BindingType,
        app_id: &str,
    ) -> TraceResult<TraceClientId> {
        self.shared.gate.check()?;
        let result = self.register_client_inner(binding, app_id);
        self.shared.gate.record(result)
    }

    fn register_client_inner(
        &self,
        binding: BindingType,
        app_id: &str,
    ) -> TraceResult<TraceClientId> {
        if binding == BindingType::Undefined {
            return Err(ErrorCode::InvalidBindingType);
        }
        if app_id.is_empty() {
            return Err(ErrorCode::InvalidArgument);
        }

        let prefix = app_id_prefix(app_id);
        let (local_id, is_new) = self.shared.registry.register_client(binding, prefix)?;
        if !is_new {
            return Ok(local_id);
        }

        // Resolve synchronously when the daemon is already there; otherwise
        // the entry stays pending for the worker. The IPC happens outside
        // the registry lock.
        if self.shared.communicator.is_connected()
            && self.shared.registry.begin_client_registration(local_id).is_ok()
        {
            match self.shared.communicator.register_client(binding, prefix) {
                Ok(remote_id) => self.shared.registry.complete_client(local_id, remote_id),
                Err(e) if e.is_fatal() => {
                    self.shared.registry.remove_client(local_id);
                    return Err(e);
                }
                Err(_) => self.shared.registry.requeue_client(local_id),
            }
        }
        Ok(local_id)
    }

    /// Register a shared-memory object by descriptor. Returns the handle to
    /// pass in trace chunks: the daemon's handle when it was reachable, a
    /// placeholder (transparently upgraded later) otherwise.
    pub fn register_shm_object_fd(
        &self,
        client: TraceClientId,
        fd: BorrowedFd,
    ) -> TraceResult<ShmObjectHandle> {
        self.shared.gate.check()?;
        let result = self.register_shm_fd_inner(client, fd);
        self.shared.gate.record(result)
    }

    fn register_shm_fd_inner(
        &self,
        client: TraceClientId,
        fd: BorrowedFd,
    ) -> TraceResult<ShmObjectHandle> {
        if !self.shared.registry.client_exists(client) {
            return Err(ErrorCode::ClientNotFound);
        }

        if !self.shared.validator.is_shared_memory_typed(fd)? {
            return Err(ErrorCode::SharedMemoryObjectNotInTypedMemory);
        }

        let duplicate = fd
            .try_clone_to_owned()
            .map_err(|_| ErrorCode::BadFileDescriptor)?;
        self.register_shm_entry(
            client,
            ShmKey::Fd(fd.as_raw_fd()),
            ShmSource::Fd(duplicate),
            |communicator, source| match source {
                ShmSource::Fd(fd) => communicator.register_shm_object_fd(fd.as_fd()),
                ShmSource::Path(_) => unreachable!(),
            },
        )
    }

    /// Register a shared-memory object by path; the path is opened through
    /// the memory validator first.
    pub fn register_shm_object_path(
        &self,
        client: TraceClientId,
        path: &str,
    ) -> TraceResult<ShmObjectHandle> {
        self.shared.gate.check()?;
        let result = self.register_shm_path_inner(client, path);
        self.shared.gate.record(result)
    }

    fn register_shm_path_inner(
        &self,
        client: TraceClientId,
        path: &str,
    ) -> TraceResult<ShmObjectHandle> {
        if !self.shared.registry.client_exists(client) {
            return Err(ErrorCode::ClientNotFound);
        }

        let fd = self.shared.validator.open_shared_memory(path)?;
        if !self.shared.validator.is_shared_memory_typed(fd.as_fd())? {
            return Err(ErrorCode::SharedMemoryObjectNotInTypedMemory);
        }
        drop(fd);

        self.register_shm_entry(
            client,
            ShmKey::Path(path.to_owned()),
            ShmSource::Path(path.to_owned()),
            |communicator, source| match source {
                ShmSource::Path(path) => communicator.register_shm_object_path(path),
                ShmSource::Fd(_) => unreachable!(),
            },
        )
    }

    fn register_shm_entry(
        &self,
        client: TraceClientId,
        key: ShmKey,
        source: ShmSource,
        dispatch: impl Fn(&dyn Communicator, &ShmSource) -> TraceResult<ShmObjectHandle>,
    ) -> TraceResult<ShmObjectHandle> {
        let connected = self.shared.communicator.is_connected();
        let replay_source = source.try_clone()?;
        let local_handle = self
            .shared
            .registry
            .insert_shm(client, key, replay_source, connected)?;

        if !connected {
            return Ok(local_handle);
        }

        match dispatch(self.shared.communicator.as_ref(), &source) {
            Ok(remote_handle) => {
                self.shared.registry.complete_shm(local_handle, remote_handle);
                Ok(remote_handle)
            }
            Err(e) if e.is_fatal() => {
                self.shared.registry.remove_shm(local_handle);
                Err(e)
            }
            Err(_) => {
                // Worker finishes the job; the application can trace against
                // the placeholder meanwhile.
                self.shared.registry.requeue_shm(local_handle);
                Ok(local_handle)
            }
        }
    }

    /// Unregister a shared-memory object. Unknown handles succeed: removing
    /// what is not there is not an error.
    pub fn unregister_shm_object(
        &self,
        client: TraceClientId,
        handle: ShmObjectHandle,
    ) -> TraceResult<()> {
        self.shared.gate.check()?;
        let result = self.unregister_shm_inner(client, handle);
        self.shared.gate.record(result)
    }

    fn unregister_shm_inner(
        &self,
        client: TraceClientId,
        handle: ShmObjectHandle,
    ) -> TraceResult<()> {
        if !self.shared.registry.client_exists(client) {
            return Err(ErrorCode::ClientNotFound);
        }

        let Some((local_handle, remote_handle, state)) =
            self.shared.registry.find_shm(client, handle)
        else {
            return Ok(());
        };

        match state {
            // The daemon never learned about this entry; dropping it locally
            // is the whole job.
            registry::EntryState::Pending | registry::EntryState::InFlight => {
                self.shared.registry.remove_shm(local_handle);
                Ok(())
            }
            registry::EntryState::Registered => {
                if !self.shared.communicator.is_connected() {
                    return Err(ErrorCode::DaemonNotConnected);
                }
                let remote = remote_handle.unwrap_or(local_handle);
                match self.shared.communicator.unregister_shm_object(remote) {
                    Ok(()) => {
                        self.shared.registry.remove_shm(local_handle);
                        Ok(())
                    }
                    // Keep the entry so the application can retry.
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Store the trace-done callback for a client. One callback per client;
    /// a second registration or an expired callback is rejected.
    pub fn register_trace_done_callback(
        &self,
        client: TraceClientId,
        callback: TraceDoneCallback,
    ) -> TraceResult<()> {
        self.shared.gate.check()?;
        let result = if self.shared.registry.client_exists(client) {
            self.shared.processor.save_callback(client, callback)
        } else {
            Err(ErrorCode::ClientNotFound)
        };
        self.shared.gate.record(result)
    }

    /// Submit a trace job whose payload lives in registered shared memory.
    /// The context id is echoed to the client's trace-done callback once the
    /// job is consumed.
    pub fn trace_shm(
        &self,
        client: TraceClientId,
        meta: &[u8],
        chunks: &[ShmChunk],
        context_id: TraceContextId,
    ) -> TraceResult<()> {
        self.shared.gate.check()?;
        let result = self.trace_inner(client).and_then(|()| {
            self.shared
                .allocator
                .allocate_shm_job(client, meta, chunks, context_id)
        });
        self.shared.gate.record(result)
    }

    /// Submit a trace job whose payload is copied inline. No completion
    /// callback fires for copied payloads.
    pub fn trace_local(
        &self,
        client: TraceClientId,
        meta: &[u8],
        payload: &[u8],
    ) -> TraceResult<()> {
        self.shared.gate.check()?;
        let result = self.trace_inner(client).and_then(|()| {
            self.shared.allocator.allocate_local_job(client, meta, payload)
        });
        self.shared.gate.record(result)
    }

    fn trace_inner(&self, client: TraceClientId) -> TraceResult<()> {
        if !self.shared.registry.client_exists(client) {
            return Err(ErrorCode::ClientNotFound);
        }
        Ok(())
    }

    /// Drop a client: its id, its shared-memory registrations (best-effort
    /// unregistered with the daemon), and its callback.
    pub fn unregister(&self, client: TraceClientId) -> TraceResult<()> {
        self.shared.gate.check()?;
        if !self.shared.registry.client_exists(client) {
            return self.shared.gate.record(Err(ErrorCode::ClientNotFound));
        }

        for remote_handle in self.shared.registry.take_shm_for_client(client) {
            if let Err(e) = self.shared.communicator.unregister_shm_object(remote_handle) {
                debug!("unregistering shm handle {remote_handle} for dropped client: {e}");
            }
        }
        self.shared.processor.remove_callback(client);
        self.shared.registry.remove_client(client);
        Ok(())
    }

    /// Whether the worker has connected and armed the trace path.
    pub fn is_ready_to_trace(&self) -> bool {
        self.shared.allocator.is_ready()
    }

    /// The daemon-assigned id behind a local client id; `0` while the
    /// registration is still cached.
    pub fn remote_client_id(&self, client: TraceClientId) -> TraceResult<TraceClientId> {
        self.shared.registry.remote_id(client)
    }

    pub fn daemon_pid(&self) -> Option<i32> {
        self.shared.communicator.daemon_pid()
    }

    /// The fatal error currently poisoning this instance, if any.
    pub fn poisoned_by(&self) -> Option<ErrorCode> {
        self.shared.gate.current()
    }

    pub fn ring_statistics(&self) -> TraceResult<RingBufferStatistics> {
        self.shared.allocator.ring().statistics()
    }
}

impl Drop for TraceLibrary {
    fn drop(&mut self) {
        self.stop.request_stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
