// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Daemon communicator behaviour against an in-process fake daemon.

use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use trace_protocol::channel::DaemonEndpoint;
use trace_protocol::{app_id_prefix, BindingType, ErrorCode, Request, Response};

use trace_client::{Communicator, DaemonCommunicator};

const IO_TIMEOUT: Duration = Duration::from_millis(200);

fn socket_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("trace_comm_{}_{}", std::process::id(), tag))
}

/// Serve one accepted connection with `respond` until the peer hangs up.
fn fake_daemon(
    listener: UnixListener,
    respond: impl Fn(&Request) -> Response + Send + 'static,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let Ok(mut endpoint) = DaemonEndpoint::accept(&listener) else {
            return;
        };
        while let Ok(Some((request, _fd))) = endpoint.recv_request() {
            if endpoint.send_response(&respond(&request)).is_err() {
                return;
            }
        }
    })
}

fn handshake_response(request: &Request) -> Option<Response> {
    matches!(request, Request::DaemonProcessId).then_some(Response::DaemonProcessId {
        daemon_process_id: 777,
    })
}

#[test]
fn connect_handshakes_and_records_pid() {
    let path = socket_path("connect");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();
    let daemon = fake_daemon(listener, |request| {
        handshake_response(request).expect("only the handshake is expected")
    });

    let communicator = DaemonCommunicator::new(path.clone(), IO_TIMEOUT);
    assert!(!communicator.is_connected());
    assert_eq!(
        communicator.connection_state(),
        trace_client::ConnectionState::NeverConnected
    );

    communicator.connect().unwrap();
    assert!(communicator.is_connected());
    assert_eq!(communicator.daemon_pid(), Some(777));
    assert_eq!(
        communicator.connection_state(),
        trace_client::ConnectionState::Connected(777)
    );

    // Idempotent while open.
    communicator.connect().unwrap();

    drop(communicator);
    daemon.join().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn connect_without_daemon_is_a_name_open_failure() {
    let path = socket_path("absent");
    let _ = std::fs::remove_file(&path);

    let communicator = DaemonCommunicator::new(path, IO_TIMEOUT);
    assert_eq!(
        communicator.connect(),
        Err(ErrorCode::ServerConnectionNameOpenFailed)
    );
    assert!(!communicator.is_connected());
}

#[test]
fn register_client_round_trip_and_error_passthrough() {
    let path = socket_path("client");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();
    let daemon = fake_daemon(listener, |request| match request {
        Request::DaemonProcessId => Response::DaemonProcessId {
            daemon_process_id: 1,
        },
        Request::RegisterClient { binding, app_id } => {
            assert_eq!(*binding, BindingType::VectorZeroCopy);
            if app_id == &app_id_prefix("rejected") {
                Response::Error {
                    code: ErrorCode::NoMoreSpaceForNewShmObject,
                }
            } else {
                Response::RegisterClient { trace_client_id: 9 }
            }
        }
        other => panic!("unexpected request: {other:?}"),
    });

    let communicator = DaemonCommunicator::new(path, IO_TIMEOUT);

    // Local validation happens before any connection requirement.
    assert_eq!(
        communicator.register_client(BindingType::Undefined, app_id_prefix("x")),
        Err(ErrorCode::InvalidBindingType)
    );
    assert_eq!(
        communicator.register_client(BindingType::VectorZeroCopy, app_id_prefix("x")),
        Err(ErrorCode::DaemonNotConnected)
    );

    communicator.connect().unwrap();
    assert_eq!(
        communicator.register_client(BindingType::VectorZeroCopy, app_id_prefix("accepted")),
        Ok(9)
    );
    assert_eq!(
        communicator.register_client(BindingType::VectorZeroCopy, app_id_prefix("rejected")),
        Err(ErrorCode::NoMoreSpaceForNewShmObject)
    );

    drop(communicator);
    daemon.join().unwrap();
}

#[test]
fn negative_shm_handle_is_a_handle_creation_failure() {
    let path = socket_path("negative");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();
    let daemon = fake_daemon(listener, |request| {
        handshake_response(request).unwrap_or(Response::RegisterShm {
            shm_object_index: -1,
        })
    });

    let communicator = DaemonCommunicator::new(path, IO_TIMEOUT);
    communicator.connect().unwrap();
    assert_eq!(
        communicator.register_shm_object_path("/some_region"),
        Err(ErrorCode::SharedMemoryObjectHandleCreationFailed)
    );

    drop(communicator);
    daemon.join().unwrap();
}

#[test]
fn daemon_refusing_unregister_is_fatal_kind() {
    let path = socket_path("unreg");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();
    let daemon = fake_daemon(listener, |request| {
        handshake_response(request).unwrap_or(Response::UnregisterShm {
            is_unregister_successful: false,
        })
    });

    let communicator = DaemonCommunicator::new(path, IO_TIMEOUT);
    communicator.connect().unwrap();
    assert_eq!(
        communicator.unregister_shm_object(3),
        Err(ErrorCode::SharedMemoryObjectUnregisterFailed)
    );

    drop(communicator);
    daemon.join().unwrap();
}

#[test]
fn send_timeout_tears_the_connection_down() {
    let path = socket_path("timeout");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    // Answer the handshake, then go silent.
    let daemon = std::thread::spawn(move || {
        let mut endpoint = DaemonEndpoint::accept(&listener).unwrap();
        let (request, _) = endpoint.recv_request().unwrap().unwrap();
        assert_eq!(request, Request::DaemonProcessId);
        endpoint
            .send_response(&Response::DaemonProcessId {
                daemon_process_id: 1,
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(600));
    });

    let communicator = DaemonCommunicator::new(path, IO_TIMEOUT);
    communicator.connect().unwrap();

    assert_eq!(
        communicator.register_client(BindingType::Vector, app_id_prefix("app")),
        Err(ErrorCode::MessageSendFailed)
    );
    // The failed send closed the connection.
    assert!(!communicator.is_connected());

    drop(communicator);
    daemon.join().unwrap();
}

#[test]
fn daemon_death_fires_termination_callback_once() {
    let path = socket_path("death");
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let daemon = std::thread::spawn(move || {
        let mut endpoint = DaemonEndpoint::accept(&listener).unwrap();
        let (request, _) = endpoint.recv_request().unwrap().unwrap();
        assert_eq!(request, Request::DaemonProcessId);
        endpoint
            .send_response(&Response::DaemonProcessId {
                daemon_process_id: 1,
            })
            .unwrap();
        // Daemon "crashes": the connection drops.
    });

    let communicator = DaemonCommunicator::new(path, IO_TIMEOUT);
    let deaths = Arc::new(AtomicU32::new(0));
    let observed = deaths.clone();
    communicator.subscribe_termination(Arc::new(move || {
        observed.fetch_add(1, Ordering::SeqCst);
    }));

    communicator.connect().unwrap();
    daemon.join().unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while deaths.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(deaths.load(Ordering::SeqCst), 1);
    assert!(!communicator.is_connected());
    assert_eq!(
        communicator.connection_state(),
        trace_client::ConnectionState::Disconnected
    );
    assert_eq!(
        communicator.register_client(BindingType::Vector, app_id_prefix("app")),
        Err(ErrorCode::DaemonNotConnected)
    );

    // No further deaths are reported for the same lifetime.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(deaths.load(Ordering::SeqCst), 1);
}
