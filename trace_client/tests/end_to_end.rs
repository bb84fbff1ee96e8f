// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Full-stack behaviour: real communicator, real detector thread, real
//! shared-memory ring and metadata region, against a fake daemon serving
//! the wire protocol on a Unix socket.

use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use trace_protocol::channel::DaemonEndpoint;
use trace_protocol::{Request, Response};

use trace_client::{
    BindingType, Config, ErrorCode, Scope, ScopedCallback, ShmChunk, TraceLibrary,
};

/// Serves the daemon's side of the protocol, one connection at a time, for
/// as many connections as the library opens. A held clone of the active
/// stream lets the test sever it to simulate a daemon crash.
struct FakeDaemon {
    active: Arc<Mutex<Option<UnixStream>>>,
    next_client_id: Arc<AtomicU8>,
}

impl FakeDaemon {
    fn start(socket_path: &std::path::Path) -> Self {
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path).unwrap();
        let active = Arc::new(Mutex::new(None::<UnixStream>));
        let next_client_id = Arc::new(AtomicU8::new(20));

        let shared_active = active.clone();
        let client_ids = next_client_id.clone();
        std::thread::spawn(move || {
            let next_handle = AtomicI32::new(100);
            loop {
                let Ok(mut endpoint) = DaemonEndpoint::accept(&listener) else {
                    return;
                };
                *shared_active.lock().unwrap() = endpoint.stream().try_clone().ok();

                while let Ok(Some((request, _fd))) = endpoint.recv_request() {
                    let response = match request {
                        Request::DaemonProcessId => Response::DaemonProcessId {
                            daemon_process_id: 31337,
                        },
                        Request::RegisterClient { .. } => Response::RegisterClient {
                            trace_client_id: client_ids.fetch_add(1, Ordering::SeqCst),
                        },
                        Request::RegisterShm { .. } => Response::RegisterShm {
                            shm_object_index: next_handle.fetch_add(1, Ordering::SeqCst),
                        },
                        Request::UnregisterShm { .. } => Response::UnregisterShm {
                            is_unregister_successful: true,
                        },
                    };
                    if endpoint.send_response(&response).is_err() {
                        break;
                    }
                }
                shared_active.lock().unwrap().take();
            }
        });

        Self {
            active,
            next_client_id,
        }
    }

    /// Sever the live connection the way a crashing daemon would.
    fn crash(&self) {
        if let Some(stream) = self.active.lock().unwrap().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn trace_path_survives_a_daemon_restart() {
    let _ = env_logger::builder().is_test(true).try_init();

    let pid = std::process::id();
    let socket_path = std::env::temp_dir().join(format!("trace_e2e_{pid}.sock"));
    let daemon = FakeDaemon::start(&socket_path);

    let config = Config {
        daemon_service_path: socket_path.clone(),
        ring_buffer_path: format!("/e2e_ring_{pid}"),
        statistics_path: Some(format!("/e2e_stat_{pid}")),
        ring_capacity: 64,
        poll_interval: Duration::from_millis(10),
        io_timeout: Duration::from_millis(200),
    };
    shm_ring::SharedMemoryRegion::unlink(&config.ring_buffer_path);
    shm_ring::SharedMemoryRegion::unlink(config.statistics_path.as_deref().unwrap());

    let library = TraceLibrary::new(config).unwrap();

    let client = library
        .register_client(BindingType::VectorZeroCopy, "e2e_app")
        .unwrap();

    // The worker connects, registers the metadata region, and resolves the
    // cached client registration.
    assert!(wait_until(WAIT, || {
        library.is_ready_to_trace() && library.remote_client_id(client).unwrap() != 0
    }));
    assert_eq!(library.daemon_pid(), Some(31337));
    let first_remote = library.remote_client_id(client).unwrap();

    // A real tmpfs-backed payload region passes the typed-memory probe.
    let payload_name = format!("/e2e_payload_{pid}");
    shm_ring::SharedMemoryRegion::unlink(&payload_name);
    let _payload = shm_ring::SharedMemoryRegion::create(&payload_name, 4096).unwrap();
    let handle = library
        .register_shm_object_path(client, &payload_name)
        .unwrap();
    assert!(handle >= 0);

    let seen_context = Arc::new(AtomicU32::new(0));
    let sink = seen_context.clone();
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
        size: 512,
    }];
    library.trace_shm(client, b"first", &chunks, 7).unwrap();
    assert!(wait_until(WAIT, || seen_context.load(Ordering::SeqCst) == 7));

    // Daemon crashes: the detector notices, the library degrades to a
    // recoverable error, nothing is poisoned.
    daemon.crash();
    assert!(wait_until(WAIT, || {
        library.trace_shm(client, b"during outage", &chunks, 8)
            == Err(ErrorCode::DaemonIsDisconnected)
    }));
    assert_eq!(library.poisoned_by(), None);

    // The daemon "restarts" (the fake accepts the next connection); the
    // worker reconnects and replays every registration.
    let id_watermark = daemon.next_client_id.load(Ordering::SeqCst);
    assert!(wait_until(WAIT, || {
        library.is_ready_to_trace()
            && library.remote_client_id(client).unwrap() != first_remote
    }));
    assert!(daemon.next_client_id.load(Ordering::SeqCst) > id_watermark);

    library.trace_shm(client, b"after restart", &chunks, 9).unwrap();
    assert!(wait_until(WAIT, || seen_context.load(Ordering::SeqCst) == 9));

    let stats = library.ring_statistics().unwrap();
    assert!(stats.producer.call_count >= 2);

    drop(library);
    let _ = std::fs::remove_file(&socket_path);
    shm_ring::SharedMemoryRegion::unlink(&payload_name);
    shm_ring::SharedMemoryRegion::unlink(&format!("/e2e_ring_{pid}"));
    shm_ring::SharedMemoryRegion::unlink(&format!("/e2e_stat_{pid}"));
}
