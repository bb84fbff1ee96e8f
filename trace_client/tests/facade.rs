// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Facade behaviour with injected collaborators: caching, replay, the
//! sticky error gate, trace-done callbacks, and daemon-death recovery.

use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use trace_client::{
    BindingType, Communicator, Config, ErrorCode, MemoryValidator, Scope, ScopedCallback,
    ShmChunk, ShmObjectHandle, TerminationCallback, TraceClientId, TraceLibrary, TraceResult,
    CLIENT_CAPACITY, SHM_CAPACITY,
};
use trace_protocol::APP_ID_WIRE_LEN;

/// The trace-metadata region name is derived from the process id, so
/// facade instances within this test binary are serialised.
static LIB_LOCK: Mutex<()> = Mutex::new(());

fn lib_lock() -> MutexGuard<'static, ()> {
    LIB_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct StubValidator;

impl MemoryValidator for StubValidator {
    fn is_shared_memory_typed(&self, _fd: BorrowedFd) -> TraceResult<bool> {
        Ok(true)
    }

    fn open_shared_memory(&self, _path: &str) -> TraceResult<OwnedFd> {
        Ok(std::fs::File::open("/dev/null")
            .map_err(|_| ErrorCode::BadFileDescriptor)?
            .into())
    }
}

/// In-process daemon double: connection state is a pair of flags, ids and
/// handles are counters, and a kill fires the termination callback the way
/// the detector thread would.
struct StubCommunicator {
    daemon_up: AtomicBool,
    connected: AtomicBool,
    next_client_id: AtomicU8,
    next_handle: AtomicI32,
    termination: Mutex<Option<TerminationCallback>>,
}

impl StubCommunicator {
    fn new(daemon_up: bool) -> Arc<Self> {
        Arc::new(Self {
            daemon_up: AtomicBool::new(daemon_up),
            connected: AtomicBool::new(false),
            next_client_id: AtomicU8::new(10),
            next_handle: AtomicI32::new(0),
            termination: Mutex::new(None),
        })
    }

    fn start_daemon(&self) {
        self.daemon_up.store(true, Ordering::SeqCst);
    }

    fn kill_daemon(&self) {
        self.daemon_up.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let callback = self.termination.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn require_connected(&self) -> TraceResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ErrorCode::DaemonNotConnected);
        }
        Ok(())
    }
}

impl Communicator for StubCommunicator {
    fn connect(&self) -> TraceResult<()> {
        if !self.daemon_up.load(Ordering::SeqCst) {
            return Err(ErrorCode::ServerConnectionNameOpenFailed);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn daemon_pid(&self) -> Option<i32> {
        self.is_connected().then_some(4242)
    }

    fn register_client(
        &self,
        _binding: BindingType,
        _app_id: [u8; APP_ID_WIRE_LEN],
    ) -> TraceResult<TraceClientId> {
        self.require_connected()?;
        Ok(self.next_client_id.fetch_add(1, Ordering::SeqCst))
    }

    fn register_shm_object_fd(&self, _fd: BorrowedFd) -> TraceResult<ShmObjectHandle> {
        self.require_connected()?;
        Ok(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    fn register_shm_object_path(&self, _path: &str) -> TraceResult<ShmObjectHandle> {
        self.require_connected()?;
        Ok(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    fn unregister_shm_object(&self, _handle: ShmObjectHandle) -> TraceResult<()> {
        self.require_connected()
    }

    fn subscribe_termination(&self, callback: TerminationCallback) {
        *self.termination.lock().unwrap() = Some(callback);
    }
}

fn test_config(tag: &str) -> Config {
    let pid = std::process::id();
    Config {
        daemon_service_path: std::env::temp_dir().join(format!("unused_{pid}_{tag}")),
        ring_buffer_path: format!("/facade_ring_{pid}_{tag}"),
        statistics_path: Some(format!("/facade_stat_{pid}_{tag}")),
        ring_capacity: 64,
        poll_interval: Duration::from_millis(5),
        io_timeout: Duration::from_millis(50),
    }
}

fn build(tag: &str, daemon_up: bool) -> (TraceLibrary, Arc<StubCommunicator>) {
    let config = test_config(tag);
    shm_ring::SharedMemoryRegion::unlink(&config.ring_buffer_path);
    if let Some(stats) = &config.statistics_path {
        shm_ring::SharedMemoryRegion::unlink(stats);
    }
    let communicator = StubCommunicator::new(daemon_up);
    let library =
        TraceLibrary::with_parts(config, communicator.clone(), Arc::new(StubValidator)).unwrap();
    (library, communicator)
}

fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    predicate()
}

const WAIT: Duration = Duration::from_secs(2);

#[test]
fn empty_app_id_poisons_the_instance() {
    let _guard = lib_lock();
    let (library, _) = build("empty_app", true);

    assert_eq!(
        library.register_client(BindingType::VectorZeroCopy, ""),
        Err(ErrorCode::InvalidArgument)
    );
    assert_eq!(library.poisoned_by(), Some(ErrorCode::InvalidArgument));

    // Every subsequent call reports the poisoned substitute.
    assert_eq!(
        library.trace_local(1, b"meta", b"payload"),
        Err(ErrorCode::DaemonNotAvailable)
    );
    assert_eq!(
        library.register_client(BindingType::Vector, "fine"),
        Err(ErrorCode::DaemonNotAvailable)
    );
}

#[test]
fn undefined_binding_is_rejected_fatally() {
    let _guard = lib_lock();
    let (library, _) = build("undefined", true);

    assert_eq!(
        library.register_client(BindingType::Undefined, "app"),
        Err(ErrorCode::InvalidBindingType)
    );
    assert_eq!(
        library.register_client(BindingType::Vector, "app"),
        Err(ErrorCode::DaemonNotAvailable)
    );
}

#[test]
fn registration_caches_until_daemon_appears() {
    let _guard = lib_lock();
    let (library, communicator) = build("cached", false);

    let client = library
        .register_client(BindingType::VectorZeroCopy, "client")
        .unwrap();
    assert_eq!(library.remote_client_id(client), Ok(0));

    let shm_handle = library.register_shm_object_path(client, "/payload_region").unwrap();
    assert!(shm_handle >= 0);
    assert!(!library.is_ready_to_trace());

    communicator.start_daemon();

    assert!(wait_until(WAIT, || {
        library.remote_client_id(client).unwrap() != 0 && library.is_ready_to_trace()
    }));
    assert_ne!(library.remote_client_id(client), Ok(0));

    assert_eq!(library.trace_local(client, b"meta", b"payload"), Ok(()));
}

#[test]
fn daemon_death_disconnects_then_replay_heals() {
    let _guard = lib_lock();
    let (library, communicator) = build("death", true);

    let client = library
        .register_client(BindingType::VectorZeroCopy, "client")
        .unwrap();
    assert!(wait_until(WAIT, || library.is_ready_to_trace()));
    let first_remote = library.remote_client_id(client).unwrap();
    assert_ne!(first_remote, 0);
    assert_eq!(library.trace_local(client, b"meta", b"payload"), Ok(()));

    communicator.kill_daemon();
    assert_eq!(
        library.trace_local(client, b"meta", b"payload"),
        Err(ErrorCode::DaemonIsDisconnected)
    );
    // Recoverable: the gate stays clear.
    assert_eq!(library.poisoned_by(), None);

    communicator.start_daemon();
    assert!(wait_until(WAIT, || {
        library.is_ready_to_trace() && library.remote_client_id(client).unwrap() != first_remote
    }));

    // The surface-visible id survived; the mapping underneath moved on.
    assert_eq!(library.trace_local(client, b"meta", b"payload"), Ok(()));
}

#[test]
fn duplicate_shm_registration_is_recoverable() {
    let _guard = lib_lock();
    let (library, _) = build("dup_shm", true);

    let client = library
        .register_client(BindingType::Vector, "client")
        .unwrap();
    library.register_shm_object_path(client, "/foo").unwrap();
    assert_eq!(
        library.register_shm_object_path(client, "/foo"),
        Err(ErrorCode::SharedMemoryObjectAlreadyRegistered)
    );
    assert_eq!(library.poisoned_by(), None);
}

#[test]
fn trace_done_callback_registration_rules() {
    let _guard = lib_lock();
    let (library, _) = build("cb_rules", true);

    let client = library
        .register_client(BindingType::VectorZeroCopy, "client")
        .unwrap();

    let scope = Scope::new();
    assert_eq!(
        library.register_trace_done_callback(
            client + 1,
            ScopedCallback::new(&scope, |_| {})
        ),
        Err(ErrorCode::ClientNotFound)
    );

    library
        .register_trace_done_callback(client, ScopedCallback::new(&scope, |_| {}))
        .unwrap();

    // Replacement is rejected, and the rejection is fatal.
    assert_eq!(
        library.register_trace_done_callback(client, ScopedCallback::new(&scope, |_| {})),
        Err(ErrorCode::InvalidArgument)
    );
    assert_eq!(
        library.trace_local(client, b"m", b"p"),
        Err(ErrorCode::DaemonNotAvailable)
    );
}

#[test]
fn expired_callback_is_rejected() {
    let _guard = lib_lock();
    let (library, _) = build("cb_expired", true);

    let client = library
        .register_client(BindingType::VectorZeroCopy, "client")
        .unwrap();

    let scope = Scope::new();
    let callback = ScopedCallback::new(&scope, |_| {});
    scope.expire();
    assert_eq!(
        library.register_trace_done_callback(client, callback),
        Err(ErrorCode::InvalidArgument)
    );
}

#[test]
fn trace_done_callback_fires_with_context_id() {
    let _guard = lib_lock();
    let (library, _) = build("cb_fires", true);

    let client = library
        .register_client(BindingType::VectorZeroCopy, "client")
        .unwrap();
    assert!(wait_until(WAIT, || library.is_ready_to_trace()));

    let handle = library.register_shm_object_fd(client, open_payload_fd()).unwrap();

    let seen = Arc::new(AtomicU32::new(0));
    let sink = seen.clone();
    let scope = Scope::new();
    library
        .register_trace_done_callback(
            client,
            ScopedCallback::new(&scope, move |context_id| {
                sink.store(context_id, Ordering::SeqCst);
            }),
        )
        .unwrap();

    let chunks = [ShmChunk {
        handle,
        offset: 0,
        size: 128,
    }];
    library.trace_shm(client, b"meta", &chunks, 4242).unwrap();

    assert!(wait_until(WAIT, || seen.load(Ordering::SeqCst) == 4242));
}

#[test]
fn client_capacity_exhaustion_is_recoverable() {
    let _guard = lib_lock();
    let (library, _) = build("client_cap", true);

    for i in 0..CLIENT_CAPACITY {
        library
            .register_client(BindingType::Vector, &format!("app{i:04}"))
            .unwrap();
    }
    let err = library
        .register_client(BindingType::Vector, "overflow")
        .unwrap_err();
    assert!(!err.is_fatal());
    assert_eq!(library.poisoned_by(), None);
}

#[test]
fn shm_capacity_exhaustion_is_fatal() {
    let _guard = lib_lock();
    let (library, _) = build("shm_cap", false);

    let client = library
        .register_client(BindingType::Vector, "client")
        .unwrap();
    for i in 0..SHM_CAPACITY {
        library.register_shm_object_path(client, &format!("/obj{i}")).unwrap();
    }
    assert_eq!(
        library.register_shm_object_path(client, "/overflow"),
        Err(ErrorCode::NoMoreSpaceForNewShmObject)
    );
    assert_eq!(
        library.poisoned_by(),
        Some(ErrorCode::NoMoreSpaceForNewShmObject)
    );
}

#[test]
fn unregister_unknown_shm_handle_is_idempotent() {
    let _guard = lib_lock();
    let (library, _) = build("unreg_unknown", true);

    let client = library
        .register_client(BindingType::Vector, "client")
        .unwrap();
    assert_eq!(library.unregister_shm_object(client, 12345), Ok(()));
    assert_eq!(
        library.unregister_shm_object(client + 1, 12345),
        Err(ErrorCode::ClientNotFound)
    );
}

#[test]
fn register_then_unregister_round_trip() {
    let _guard = lib_lock();
    let (library, _) = build("shm_roundtrip", true);

    let client = library
        .register_client(BindingType::Vector, "client")
        .unwrap();
    assert!(wait_until(WAIT, || library.is_ready_to_trace()));

    let handle = library.register_shm_object_path(client, "/payload").unwrap();
    assert_eq!(library.unregister_shm_object(client, handle), Ok(()));
    // Gone now, so a second unregister is still success.
    assert_eq!(library.unregister_shm_object(client, handle), Ok(()));
    // And the key is free again.
    assert!(library.register_shm_object_path(client, "/payload").is_ok());
}

#[test]
fn pending_unregister_without_daemon_succeeds_locally() {
    let _guard = lib_lock();
    let (library, _) = build("unreg_pending", false);

    let client = library
        .register_client(BindingType::Vector, "client")
        .unwrap();
    let handle = library.register_shm_object_path(client, "/pending").unwrap();

    // The daemon never saw this entry; dropping it locally succeeds.
    assert_eq!(library.unregister_shm_object(client, handle), Ok(()));
}

#[test]
fn unregister_client_drops_its_state() {
    let _guard = lib_lock();
    let (library, _) = build("unreg_client", true);

    let client = library
        .register_client(BindingType::VectorZeroCopy, "client")
        .unwrap();
    assert!(wait_until(WAIT, || library.is_ready_to_trace()));

    let scope = Scope::new();
    library
        .register_trace_done_callback(client, ScopedCallback::new(&scope, |_| {}))
        .unwrap();
    library.register_shm_object_path(client, "/payload").unwrap();

    library.unregister(client).unwrap();
    assert_eq!(
        library.trace_local(client, b"m", b"p"),
        Err(ErrorCode::ClientNotFound)
    );
    assert_eq!(library.unregister(client), Err(ErrorCode::ClientNotFound));
}

#[test]
fn client_registration_identity_laws() {
    let _guard = lib_lock();
    let (library, _) = build("identity", true);

    let first = library
        .register_client(BindingType::VectorZeroCopy, "same_app_suffix_a")
        .unwrap();
    // Identity is the first 8 bytes plus the binding.
    let second = library
        .register_client(BindingType::VectorZeroCopy, "same_app_suffix_b")
        .unwrap();
    assert_eq!(first, second);

    let third = library
        .register_client(BindingType::Vector, "same_app_suffix_a")
        .unwrap();
    assert_ne!(first, third);
}

fn open_payload_fd() -> std::os::fd::BorrowedFd<'static> {
    use std::os::fd::AsRawFd;
    use std::sync::OnceLock;
    static PAYLOAD: OnceLock<std::fs::File> = OnceLock::new();
    let file = PAYLOAD.get_or_init(|| std::fs::File::open("/dev/null").unwrap());
    // SAFETY: the file lives in a static for the whole test process.
    unsafe { std::os::fd::BorrowedFd::borrow_raw(file.as_raw_fd()) }
}
