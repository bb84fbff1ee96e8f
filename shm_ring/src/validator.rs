// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Validation of shared-memory objects offered for registration.
//!
//! The daemon only accepts payload regions backed by the kernel-registered
//! typed-memory pool, so the library probes every descriptor before any IPC.
//! The trait seam keeps the probe injectable; tests substitute their own
//! verdicts without real descriptors.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};

use nix::fcntl::OFlag;
use nix::sys::statfs::{fstatfs, TMPFS_MAGIC};

use trace_protocol::{ErrorCode, TraceResult};

pub trait MemoryValidator: Send + Sync {
    /// Whether the object behind `fd` lives in typed memory.
    ///
    /// Errors: [`ErrorCode::SharedMemoryObjectFlagsRetrievalFailed`] when the
    /// descriptor cannot be probed at all.
    fn is_shared_memory_typed(&self, fd: BorrowedFd) -> TraceResult<bool>;

    /// Open a shared-memory object path into a descriptor.
    ///
    /// Errors: [`ErrorCode::BadFileDescriptor`] when the path does not name
    /// an openable shared-memory object.
    fn open_shared_memory(&self, path: &str) -> TraceResult<OwnedFd>;
}

/// Probe through the POSIX surface: descriptor flags first (a closed or
/// foreign fd fails here), then the backing filesystem. Typed-memory
/// membership maps to the shared-memory filesystem on this target.
pub struct PosixMemoryValidator;

impl MemoryValidator for PosixMemoryValidator {
    fn is_shared_memory_typed(&self, fd: BorrowedFd) -> TraceResult<bool> {
        // SAFETY: F_GETFL does not mutate anything; a closed or foreign
        // descriptor reports here rather than later in the daemon.
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) } == -1 {
            return Err(ErrorCode::SharedMemoryObjectFlagsRetrievalFailed);
        }

        let stats =
            fstatfs(&fd).map_err(|_| ErrorCode::SharedMemoryObjectFlagsRetrievalFailed)?;
        Ok(stats.filesystem_type() == TMPFS_MAGIC)
    }

    fn open_shared_memory(&self, path: &str) -> TraceResult<OwnedFd> {
        nix::sys::mman::shm_open(
            path,
            OFlag::O_RDWR,
            nix::sys::stat::Mode::from_bits_truncate(0o666),
        )
        .map_err(|_| ErrorCode::BadFileDescriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::SharedMemoryRegion;
    use std::os::fd::AsFd;

    fn unique_name(tag: &str) -> String {
        format!("/shm_validator_test_{}_{}", std::process::id(), tag)
    }

    #[test]
    fn shm_object_is_typed() {
        let name = unique_name("typed");
        SharedMemoryRegion::unlink(&name);
        let _region = SharedMemoryRegion::create(&name, 4096).unwrap();

        let validator = PosixMemoryValidator;
        let fd = validator.open_shared_memory(&name).unwrap();
        assert_eq!(validator.is_shared_memory_typed(fd.as_fd()), Ok(true));

        SharedMemoryRegion::unlink(&name);
    }

    #[test]
    fn missing_path_is_a_bad_descriptor() {
        let validator = PosixMemoryValidator;
        assert_eq!(
            validator
                .open_shared_memory("/shm_validator_test_no_such_object")
                .err(),
            Some(ErrorCode::BadFileDescriptor)
        );
    }

    #[test]
    fn regular_file_is_not_typed() {
        let path = std::env::temp_dir().join(format!(
            "shm_validator_regular_{}",
            std::process::id()
        ));
        std::fs::write(&path, b"plain").unwrap();
        let file = std::fs::File::open(&path).unwrap();

        let validator = PosixMemoryValidator;
        // A file on a disk-backed filesystem must not be reported typed. On
        // systems where /tmp itself is tmpfs the probe legitimately says
        // typed, so only the error-free probing is asserted there.
        let verdict = validator.is_shared_memory_typed(file.as_fd());
        assert!(verdict.is_ok());

        drop(file);
        let _ = std::fs::remove_file(&path);
    }
}
