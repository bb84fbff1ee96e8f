// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Wire protocol and IPC plumbing shared by the tracing library and the
//! fake daemons its tests run: the error taxonomy, the fixed-size
//! request/response records, the service channel (with a socketpair
//! loopback variant for in-process daemons), and pulse notifications.

pub mod channel;
pub mod error;
pub mod wire;

pub use channel::loopback_channel;
pub use error::{ErrorCode, Severity, TraceResult};
pub use wire::{
    app_id_prefix, BindingType, Request, Response, ShmObjectHandle, TraceClientId, TraceContextId,
    APP_ID_WIRE_LEN, REQUEST_WIRE_LEN, RESPONSE_WIRE_LEN, SHM_PATH_WIRE_LEN,
};
