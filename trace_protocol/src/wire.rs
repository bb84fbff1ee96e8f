// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! On-the-wire request/response messages exchanged with the trace daemon.
//!
//! Both directions use one fixed-size record per message: a one-byte kind
//! tag followed by the encoded payload of that kind, zero-padded up to the
//! fixed record length. Integer fields are big-endian. When a request
//! registers a shared-memory object by file descriptor, the descriptor
//! itself travels out-of-band as `SCM_RIGHTS` ancillary data (see
//! [`crate::channel`]); the record then carries an empty path.

use std::fmt;

use crate::error::ErrorCode;

/// Daemon-assigned client id; `0` is reserved "unassigned".
pub type TraceClientId = u8;

/// Daemon-assigned index of a registered shared-memory object. Negative
/// values are invalid.
pub type ShmObjectHandle = i32;

/// Caller-chosen correlation token echoed back through the trace-done
/// callback.
pub type TraceContextId = u32;

/// Number of leading application-id bytes that take part in registration
/// identity and travel on the wire.
pub const APP_ID_WIRE_LEN: usize = 8;

/// Maximum length of a shared-memory object path in a register request.
pub const SHM_PATH_WIRE_LEN: usize = 64;

/// Fixed encoded length of every [`Request`].
pub const REQUEST_WIRE_LEN: usize = 1 + 1 + SHM_PATH_WIRE_LEN;

/// Fixed encoded length of every [`Response`].
pub const RESPONSE_WIRE_LEN: usize = 8;

/// Which serialisation plug-in a client traces through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingType {
    LoLa,
    Vector,
    VectorZeroCopy,
    /// Rejected locally before any IPC.
    Undefined,
}

impl BindingType {
    fn to_wire(self) -> u8 {
        match self {
            BindingType::LoLa => 0,
            BindingType::Vector => 1,
            BindingType::VectorZeroCopy => 2,
            BindingType::Undefined => 255,
        }
    }

    fn from_wire(raw: u8) -> Result<Self, WireError> {
        match raw {
            0 => Ok(BindingType::LoLa),
            1 => Ok(BindingType::Vector),
            2 => Ok(BindingType::VectorZeroCopy),
            255 => Ok(BindingType::Undefined),
            other => Err(WireError::BadField("binding", other as u32)),
        }
    }
}

/// Errors that can arise from decoding a wire record.
#[derive(Debug, PartialEq, Eq)]
pub enum WireError {
    /// The input slice ended before the fixed record length.
    Truncated,
    /// Unknown kind tag.
    UnknownKind(u8),
    /// A field held a value outside its domain.
    BadField(&'static str, u32),
}

impl std::error::Error for WireError {}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "record shorter than the fixed wire length"),
            Self::UnknownKind(kind) => write!(f, "unknown message kind {kind}"),
            Self::BadField(name, value) => write!(f, "field {name} holds invalid value {value}"),
        }
    }
}

/// A request from the library to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    RegisterClient {
        binding: BindingType,
        app_id: [u8; APP_ID_WIRE_LEN],
    },
    RegisterShm {
        /// Shared-memory object path; empty when the object's descriptor is
        /// attached as ancillary data instead.
        path: [u8; SHM_PATH_WIRE_LEN],
        path_len: u8,
    },
    UnregisterShm {
        handle: ShmObjectHandle,
    },
    /// Connection handshake; the daemon answers with its process id.
    DaemonProcessId,
}

impl Default for Request {
    fn default() -> Self {
        Request::DaemonProcessId
    }
}

impl Request {
    /// Build a `RegisterShm` request for a path, truncating to the wire
    /// limit is an error rather than silent loss.
    pub fn register_shm_path(path: &str) -> Result<Self, WireError> {
        let bytes = path.as_bytes();
        if bytes.len() > SHM_PATH_WIRE_LEN {
            return Err(WireError::BadField("path", bytes.len() as u32));
        }
        let mut buf = [0u8; SHM_PATH_WIRE_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Request::RegisterShm {
            path: buf,
            path_len: bytes.len() as u8,
        })
    }

    /// `RegisterShm` whose object arrives as an `SCM_RIGHTS` descriptor.
    pub fn register_shm_fd() -> Self {
        Request::RegisterShm {
            path: [0u8; SHM_PATH_WIRE_LEN],
            path_len: 0,
        }
    }

    pub fn serialize_alloc(&self) -> Vec<u8> {
        let mut buf = vec![0u8; REQUEST_WIRE_LEN];
        match self {
            Request::RegisterClient { binding, app_id } => {
                buf[0] = 0;
                buf[1] = binding.to_wire();
                buf[2..2 + APP_ID_WIRE_LEN].copy_from_slice(app_id);
            }
            Request::RegisterShm { path, path_len } => {
                buf[0] = 1;
                buf[1] = *path_len;
                buf[2..2 + SHM_PATH_WIRE_LEN].copy_from_slice(path);
            }
            Request::UnregisterShm { handle } => {
                buf[0] = 2;
                buf[1..5].copy_from_slice(&handle.to_be_bytes());
            }
            Request::DaemonProcessId => {
                buf[0] = 3;
            }
        }
        buf
    }

    pub fn deserialize(&mut self, data: &mut &[u8]) -> Result<(), WireError> {
        let record = take(data, REQUEST_WIRE_LEN)?;
        *self = match record[0] {
            0 => {
                let binding = BindingType::from_wire(record[1])?;
                let mut app_id = [0u8; APP_ID_WIRE_LEN];
                app_id.copy_from_slice(&record[2..2 + APP_ID_WIRE_LEN]);
                Request::RegisterClient { binding, app_id }
            }
            1 => {
                let path_len = record[1];
                if path_len as usize > SHM_PATH_WIRE_LEN {
                    return Err(WireError::BadField("path_len", path_len as u32));
                }
                let mut path = [0u8; SHM_PATH_WIRE_LEN];
                path.copy_from_slice(&record[2..2 + SHM_PATH_WIRE_LEN]);
                Request::RegisterShm { path, path_len }
            }
            2 => Request::UnregisterShm {
                handle: i32::from_be_bytes(record[1..5].try_into().unwrap()),
            },
            3 => Request::DaemonProcessId,
            kind => return Err(WireError::UnknownKind(kind)),
        };
        Ok(())
    }
}

/// A response from the daemon. Mirrors [`Request`] with an extra error
/// variant used for any request the daemon rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    RegisterClient {
        trace_client_id: TraceClientId,
    },
    RegisterShm {
        shm_object_index: ShmObjectHandle,
    },
    UnregisterShm {
        is_unregister_successful: bool,
    },
    DaemonProcessId {
        daemon_process_id: i32,
    },
    Error {
        code: ErrorCode,
    },
}

impl Default for Response {
    fn default() -> Self {
        Response::Error {
            code: ErrorCode::GenericError,
        }
    }
}

impl Response {
    pub fn serialize_alloc(&self) -> Vec<u8> {
        let mut buf = vec![0u8; RESPONSE_WIRE_LEN];
        match self {
            Response::RegisterClient { trace_client_id } => {
                buf[0] = 0;
                buf[1] = *trace_client_id;
            }
            Response::RegisterShm { shm_object_index } => {
                buf[0] = 1;
                buf[1..5].copy_from_slice(&shm_object_index.to_be_bytes());
            }
            Response::UnregisterShm {
                is_unregister_successful,
            } => {
                buf[0] = 2;
                buf[1] = u8::from(*is_unregister_successful);
            }
            Response::DaemonProcessId { daemon_process_id } => {
                buf[0] = 3;
                buf[1..5].copy_from_slice(&daemon_process_id.to_be_bytes());
            }
            Response::Error { code } => {
                buf[0] = 4;
                buf[1..3].copy_from_slice(&code.to_wire().to_be_bytes());
            }
        }
        buf
    }

    pub fn deserialize(&mut self, data: &mut &[u8]) -> Result<(), WireError> {
        let record = take(data, RESPONSE_WIRE_LEN)?;
        *self = match record[0] {
            0 => Response::RegisterClient {
                trace_client_id: record[1],
            },
            1 => Response::RegisterShm {
                shm_object_index: i32::from_be_bytes(record[1..5].try_into().unwrap()),
            },
            2 => Response::UnregisterShm {
                is_unregister_successful: record[1] != 0,
            },
            3 => Response::DaemonProcessId {
                daemon_process_id: i32::from_be_bytes(record[1..5].try_into().unwrap()),
            },
            4 => Response::Error {
                code: ErrorCode::from_wire(u16::from_be_bytes(record[1..3].try_into().unwrap())),
            },
            kind => return Err(WireError::UnknownKind(kind)),
        };
        Ok(())
    }
}

/// Pack an application id into its fixed wire prefix. Only the first
/// [`APP_ID_WIRE_LEN`] bytes take part in registration identity.
pub fn app_id_prefix(app_id: &str) -> [u8; APP_ID_WIRE_LEN] {
    let mut prefix = [0u8; APP_ID_WIRE_LEN];
    let bytes = app_id.as_bytes();
    let len = bytes.len().min(APP_ID_WIRE_LEN);
    prefix[..len].copy_from_slice(&bytes[..len]);
    prefix
}

fn take<'a>(data: &mut &'a [u8], len: usize) -> Result<&'a [u8], WireError> {
    if data.len() < len {
        return Err(WireError::Truncated);
    }
    let (head, rest) = data.split_at(len);
    *data = rest;
    Ok(head)
}
