// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

/// How an error affects the library instance that observed it.
///
/// A `Fatal` error poisons the facade's global error gate: every public call
/// after it fails with [`ErrorCode::DaemonNotAvailable`]. A `Recoverable`
/// error leaves the instance usable; the caller (or the background worker)
/// may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal,
    Recoverable,
}

/// Every error the tracing library can report, to the application or on the
/// wire from the daemon.
///
/// The discriminant values are part of the wire protocol (the daemon replies
/// with an `ErrorCode` response variant carrying one of these) and must not
/// be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    /// Permanently no daemon; the poisoned-gate substitute for all calls
    /// after any fatal error.
    DaemonNotAvailable = 1,
    /// Not currently connected; the worker keeps retrying.
    DaemonNotConnected = 2,
    /// Daemon death detected since the last successful operation.
    DaemonIsDisconnected = 3,
    /// The daemon-death detector could not be armed.
    DaemonTerminationDetectionFailed = 4,
    /// Resolving the daemon's published service name failed.
    ServerConnectionNameOpenFailed = 5,
    /// An IPC send failed or timed out.
    MessageSendFailed = 6,
    InvalidArgument = 7,
    InvalidBindingType = 8,
    ClientNotFound = 9,
    BadFileDescriptor = 10,
    SharedMemoryObjectRegistrationFailed = 11,
    /// The daemon returned a negative shared-memory handle.
    SharedMemoryObjectHandleCreationFailed = 12,
    /// The daemon reported that an unregister did not succeed.
    SharedMemoryObjectUnregisterFailed = 13,
    SharedMemoryObjectAlreadyRegistered = 14,
    SharedMemoryObjectNotInTypedMemory = 15,
    /// The validator could not probe the descriptor's flags.
    SharedMemoryObjectFlagsRetrievalFailed = 16,
    NoMoreSpaceForNewShmObject = 17,
    TraceJobAllocatorInitializationFailed = 18,
    RingBufferFull = 19,
    RingBufferEmpty = 20,
    RingBufferInvalidState = 21,
    RingBufferNoEmptyElement = 22,
    RingBufferNoReadyElement = 23,
    RingBufferNotInitialized = 24,
    RingBufferTooLarge = 25,
    RingBufferInvalidMemoryResource = 26,
    /// Catch-all for unexpected daemon responses.
    GenericError = 27,
}

/// Result alias used across the whole library surface.
pub type TraceResult<T> = Result<T, ErrorCode>;

impl ErrorCode {
    pub fn severity(self) -> Severity {
        match self {
            ErrorCode::DaemonNotAvailable
            | ErrorCode::DaemonTerminationDetectionFailed
            | ErrorCode::ServerConnectionNameOpenFailed
            | ErrorCode::InvalidArgument
            | ErrorCode::InvalidBindingType
            | ErrorCode::BadFileDescriptor
            | ErrorCode::SharedMemoryObjectRegistrationFailed
            | ErrorCode::SharedMemoryObjectHandleCreationFailed
            | ErrorCode::SharedMemoryObjectUnregisterFailed
            | ErrorCode::SharedMemoryObjectNotInTypedMemory
            | ErrorCode::SharedMemoryObjectFlagsRetrievalFailed
            | ErrorCode::NoMoreSpaceForNewShmObject
            | ErrorCode::TraceJobAllocatorInitializationFailed => Severity::Fatal,

            ErrorCode::DaemonNotConnected
            | ErrorCode::DaemonIsDisconnected
            | ErrorCode::MessageSendFailed
            | ErrorCode::ClientNotFound
            | ErrorCode::SharedMemoryObjectAlreadyRegistered
            | ErrorCode::RingBufferFull
            | ErrorCode::RingBufferEmpty
            | ErrorCode::RingBufferInvalidState
            | ErrorCode::RingBufferNoEmptyElement
            | ErrorCode::RingBufferNoReadyElement
            | ErrorCode::RingBufferNotInitialized
            | ErrorCode::RingBufferTooLarge
            | ErrorCode::RingBufferInvalidMemoryResource
            | ErrorCode::GenericError => Severity::Recoverable,
        }
    }

    pub fn is_fatal(self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// The on-wire representation carried in an error response.
    pub fn to_wire(self) -> u16 {
        self as u16
    }

    /// Decode a daemon-supplied error code. Unknown values collapse into
    /// `GenericError` rather than failing the whole response.
    pub fn from_wire(raw: u16) -> Self {
        match raw {
            1 => ErrorCode::DaemonNotAvailable,
            2 => ErrorCode::DaemonNotConnected,
            3 => ErrorCode::DaemonIsDisconnected,
            4 => ErrorCode::DaemonTerminationDetectionFailed,
            5 => ErrorCode::ServerConnectionNameOpenFailed,
            6 => ErrorCode::MessageSendFailed,
            7 => ErrorCode::InvalidArgument,
            8 => ErrorCode::InvalidBindingType,
            9 => ErrorCode::ClientNotFound,
            10 => ErrorCode::BadFileDescriptor,
            11 => ErrorCode::SharedMemoryObjectRegistrationFailed,
            12 => ErrorCode::SharedMemoryObjectHandleCreationFailed,
            13 => ErrorCode::SharedMemoryObjectUnregisterFailed,
            14 => ErrorCode::SharedMemoryObjectAlreadyRegistered,
            15 => ErrorCode::SharedMemoryObjectNotInTypedMemory,
            16 => ErrorCode::SharedMemoryObjectFlagsRetrievalFailed,
            17 => ErrorCode::NoMoreSpaceForNewShmObject,
            18 => ErrorCode::TraceJobAllocatorInitializationFailed,
            19 => ErrorCode::RingBufferFull,
            20 => ErrorCode::RingBufferEmpty,
            21 => ErrorCode::RingBufferInvalidState,
            22 => ErrorCode::RingBufferNoEmptyElement,
            23 => ErrorCode::RingBufferNoReadyElement,
            24 => ErrorCode::RingBufferNotInitialized,
            25 => ErrorCode::RingBufferTooLarge,
            26 => ErrorCode::RingBufferInvalidMemoryResource,
            _ => ErrorCode::GenericError,
        }
    }
}

impl std::error::Error for ErrorCode {}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            ErrorCode::DaemonNotAvailable => "trace daemon permanently unavailable",
            ErrorCode::DaemonNotConnected => "trace daemon not connected",
            ErrorCode::DaemonIsDisconnected => "trace daemon terminated since last operation",
            ErrorCode::DaemonTerminationDetectionFailed => {
                "could not arm daemon termination detection"
            }
            ErrorCode::ServerConnectionNameOpenFailed => "opening daemon service name failed",
            ErrorCode::MessageSendFailed => "IPC message send failed",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::InvalidBindingType => "invalid binding type",
            ErrorCode::ClientNotFound => "unknown trace client id",
            ErrorCode::BadFileDescriptor => "bad file descriptor",
            ErrorCode::SharedMemoryObjectRegistrationFailed => {
                "shared-memory object registration failed"
            }
            ErrorCode::SharedMemoryObjectHandleCreationFailed => {
                "daemon returned an invalid shared-memory handle"
            }
            ErrorCode::SharedMemoryObjectUnregisterFailed => {
                "daemon failed to unregister shared-memory object"
            }
            ErrorCode::SharedMemoryObjectAlreadyRegistered => {
                "shared-memory object already registered"
            }
            ErrorCode::SharedMemoryObjectNotInTypedMemory => {
                "shared-memory object not in typed memory"
            }
            ErrorCode::SharedMemoryObjectFlagsRetrievalFailed => {
                "could not retrieve shared-memory object flags"
            }
            ErrorCode::NoMoreSpaceForNewShmObject => "shared-memory object table full",
            ErrorCode::TraceJobAllocatorInitializationFailed => {
                "trace job allocator initialization failed"
            }
            ErrorCode::RingBufferFull => "ring buffer full",
            ErrorCode::RingBufferEmpty => "ring buffer empty",
            ErrorCode::RingBufferInvalidState => "ring buffer state invalid",
            ErrorCode::RingBufferNoEmptyElement => "no empty ring buffer element",
            ErrorCode::RingBufferNoReadyElement => "no ready ring buffer element",
            ErrorCode::RingBufferNotInitialized => "ring buffer not initialized",
            ErrorCode::RingBufferTooLarge => "requested ring buffer capacity too large",
            ErrorCode::RingBufferInvalidMemoryResource => "ring buffer memory resource invalid",
            ErrorCode::GenericError => "unexpected error",
        };
        write!(f, "{text}")
    }
}
