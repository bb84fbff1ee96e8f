// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Shared-memory primitives for the tracing library: named regions, the
//! lock-free trace-job ring buffer with its statistics, and the typed-memory
//! validator.

pub mod region;
pub mod ring;
pub mod stats;
pub mod validator;

pub use region::SharedMemoryRegion;
pub use ring::{
    RingSlot, RingState, ShmChunk, ShmRingBuffer, TraceJobDescriptor, TraceJobStatus,
    GET_ELEMENT_RETRIES, MAX_JOB_CHUNKS, MAX_RING_CAPACITY,
};
pub use stats::{ConsumerStatistics, ProducerStatistics, RingBufferStatistics};
pub use validator::{MemoryValidator, PosixMemoryValidator};

/// Default shared-memory path of the trace-job ring.
pub const DEFAULT_RING_BUFFER_PATH: &str = "/dev_shmem_ring";

/// Default shared-memory path of the ring statistics.
pub const DEFAULT_STATISTICS_PATH: &str = "/dev_shmem_stat";
