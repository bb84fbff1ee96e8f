// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use trace_protocol::*;

#[test]
fn register_client_request() {
    let msg = Request::RegisterClient {
        binding: BindingType::VectorZeroCopy,
        app_id: app_id_prefix("ecu_app_long_name"),
    };

    let bytes = msg.serialize_alloc();
    assert_eq!(bytes.len(), REQUEST_WIRE_LEN);

    let mut after = Request::default();
    after.deserialize(&mut bytes.as_slice()).unwrap();

    assert_eq!(msg, after);
}

#[test]
fn register_shm_request_by_path() {
    let msg = Request::register_shm_path("/dev_tmd_1234").unwrap();

    let bytes = msg.serialize_alloc();
    let mut after = Request::default();
    after.deserialize(&mut bytes.as_slice()).unwrap();

    assert_eq!(msg, after);
}

#[test]
fn register_shm_request_path_too_long() {
    let long = "x".repeat(SHM_PATH_WIRE_LEN + 1);
    assert!(Request::register_shm_path(&long).is_err());
}

#[test]
fn unregister_and_handshake_requests() {
    for msg in [Request::UnregisterShm { handle: -7 }, Request::DaemonProcessId] {
        let bytes = msg.serialize_alloc();
        let mut after = Request::default();
        after.deserialize(&mut bytes.as_slice()).unwrap();
        assert_eq!(msg, after);
    }
}

#[test]
fn responses() {
    let responses = [
        Response::RegisterClient { trace_client_id: 3 },
        Response::RegisterShm {
            shm_object_index: -1,
        },
        Response::UnregisterShm {
            is_unregister_successful: true,
        },
        Response::DaemonProcessId {
            daemon_process_id: 4242,
        },
        Response::Error {
            code: ErrorCode::SharedMemoryObjectAlreadyRegistered,
        },
    ];

    for msg in responses {
        let bytes = msg.serialize_alloc();
        assert_eq!(bytes.len(), RESPONSE_WIRE_LEN);

        let mut after = Response::default();
        after.deserialize(&mut bytes.as_slice()).unwrap();
        assert_eq!(msg, after);
    }
}

#[test]
fn truncated_record_is_rejected() {
    let bytes = Request::DaemonProcessId.serialize_alloc();
    let mut after = Request::default();
    assert!(after
        .deserialize(&mut &bytes[..REQUEST_WIRE_LEN - 1])
        .is_err());
}

#[test]
fn app_id_identity_uses_first_eight_bytes_only() {
    assert_eq!(
        app_id_prefix("adaptive_app_one"),
        app_id_prefix("adaptive_app_two")
    );
    assert_ne!(app_id_prefix("appA"), app_id_prefix("appB"));
}
