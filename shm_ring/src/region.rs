// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Named POSIX shared-memory regions.
//!
//! A region is identified by a `/name` path, created world-readable and
//! world-writable (every tracing participant attaches to the same objects),
//! and stays mapped for the lifetime of the handle. Unlinking is a separate
//! decision from unmapping: the ring buffer only unlinks when its use-count
//! says it is the last participant.

use log::*;

use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

/// A mapped named shared-memory region.
pub struct SharedMemoryRegion {
    name: String,
    ptr: NonNull<libc::c_void>,
    len: usize,
    created: bool,
}

// The mapping is plain memory; all concurrent access goes through atomics
// placed into it by the ring buffer.
unsafe impl Send for SharedMemoryRegion {}
unsafe impl Sync for SharedMemoryRegion {}

fn region_mode() -> Mode {
    Mode::from_bits_truncate(0o666)
}

fn object_size(fd: &OwnedFd) -> nix::Result<libc::off_t> {
    use std::os::fd::AsRawFd;
    // SAFETY: plain fstat on a descriptor we own.
    let mut stat = unsafe { std::mem::zeroed::<libc::stat>() };
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
        return Err(Errno::last());
    }
    Ok(stat.st_size)
}

impl SharedMemoryRegion {
    /// Open an existing region and map `len` bytes of it. The object is
    /// grown to `len` if a racing creator has not sized it yet; an object
    /// that is already large enough is left untouched.
    pub fn open(name: &str, len: usize) -> nix::Result<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, region_mode())?;
        if object_size(&fd)? < len as libc::off_t {
            ftruncate(&fd, len as libc::off_t)?;
        }
        Self::map(name, fd, len, false)
    }

    /// Create a fresh region of `len` bytes. Fails with `EEXIST` if the name
    /// is already taken.
    pub fn create(name: &str, len: usize) -> nix::Result<Self> {
        let fd = shm_open(name, OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL, region_mode())?;
        ftruncate(&fd, len as libc::off_t)?;
        Self::map(name, fd, len, true)
    }

    /// Open the region, creating it when absent. Two racing creators are
    /// resolved by `shm_open(O_CREAT | O_EXCL)` handing `EEXIST` to the
    /// loser, which then takes the open path.
    pub fn open_or_create(name: &str, len: usize) -> nix::Result<Self> {
        match Self::open(name, len) {
            Ok(region) => Ok(region),
            Err(Errno::ENOENT) => match Self::create(name, len) {
                Ok(region) => Ok(region),
                Err(Errno::EEXIST) => Self::open(name, len),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Remove the region's name. Missing names are not an error: unlink
    /// races between participants are benign.
    pub fn unlink(name: &str) {
        match shm_unlink(name) {
            Ok(()) | Err(Errno::ENOENT) => {}
            Err(e) => warn!("unlinking shared memory {name} failed: {e}"),
        }
    }

    fn map(name: &str, fd: OwnedFd, len: usize, created: bool) -> nix::Result<Self> {
        let length = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        // SAFETY: fresh mapping of a descriptor we own; no existing
        // references alias it.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }?;
        // The descriptor is no longer needed once mapped.
        drop(fd);

        Ok(Self {
            name: name.to_owned(),
            ptr,
            len,
            created,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the region (as opposed to opening an
    /// existing one).
    pub fn was_created(&self) -> bool {
        self.created
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from our own successful mmap.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!("unmapping shared memory {} failed: {e}", self.name);
        }
    }
}
