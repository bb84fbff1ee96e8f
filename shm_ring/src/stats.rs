// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Ring-buffer statistics, kept in their own shared-memory region so tooling
//! can read them without touching the ring itself.
//!
//! Producer counters are atomics: any application thread may bump them.
//! Consumer counters are plain integers; the consumer side is single-threaded
//! by design and nothing else writes them.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::region::SharedMemoryRegion;

/// Shared producer counters. Incremented with relaxed fetch-adds off the
/// critical CAS sequence; statistics never gate correctness.
#[repr(C)]
pub struct ProducerCountersShared {
    pub call_count: AtomicU64,
    pub call_failure_count: AtomicU64,
    pub cas_trials: AtomicU64,
    pub cas_failures: AtomicU64,
    pub buffer_full_count: AtomicU64,
}

/// Shared consumer counters; single writer, no atomics.
#[repr(C)]
pub struct ConsumerCountersShared {
    pub call_count: u64,
    pub call_failure_count: u64,
    pub cas_trials: u64,
    pub cas_failures: u64,
    pub buffer_empty_count: u64,
}

#[repr(C)]
pub struct RingStatisticsShared {
    pub producer: ProducerCountersShared,
    pub consumer: ConsumerCountersShared,
}

/// Snapshot of the producer side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStatistics {
    pub call_count: u64,
    pub call_failure_count: u64,
    pub cas_trials: u64,
    pub cas_failures: u64,
    pub buffer_full_count: u64,
}

/// Snapshot of the consumer side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStatistics {
    pub call_count: u64,
    pub call_failure_count: u64,
    pub cas_trials: u64,
    pub cas_failures: u64,
    pub buffer_empty_count: u64,
}

/// Point-in-time copy of both sides' counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingBufferStatistics {
    pub producer: ProducerStatistics,
    pub consumer: ConsumerStatistics,
}

/// The mapped statistics region.
pub struct StatisticsRegion {
    region: SharedMemoryRegion,
}

impl StatisticsRegion {
    pub fn open_or_create(path: &str) -> nix::Result<Self> {
        let region =
            SharedMemoryRegion::open_or_create(path, std::mem::size_of::<RingStatisticsShared>())?;
        // A freshly created region is all zeroes, which is exactly the reset
        // counter state; opening an existing one keeps accumulated counters.
        Ok(Self { region })
    }

    fn shared(&self) -> &RingStatisticsShared {
        // SAFETY: the region is at least as large as the counter block and
        // lives as long as self.
        unsafe { &*self.region.as_ptr().cast::<RingStatisticsShared>() }
    }

    fn consumer_ptr(&self) -> *mut ConsumerCountersShared {
        let shared = self.region.as_ptr().cast::<RingStatisticsShared>();
        // SAFETY: in-bounds field projection of the mapped block.
        unsafe { std::ptr::addr_of_mut!((*shared).consumer) }
    }

    pub fn producer(&self) -> &ProducerCountersShared {
        &self.shared().producer
    }

    /// Apply `update` to the consumer counters. Sound only because the
    /// consumer is the single writer of this block.
    pub fn update_consumer(&self, update: impl FnOnce(&mut ConsumerCountersShared)) {
        // SAFETY: single-writer discipline; no other &mut exists.
        update(unsafe { &mut *self.consumer_ptr() });
    }

    pub fn bump_producer(counter: &AtomicU64, amount: u64) {
        if amount != 0 {
            counter.fetch_add(amount, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RingBufferStatistics {
        let shared = self.shared();
        // SAFETY: reading the single-writer block; a torn read would only
        // skew a statistic, never correctness.
        let consumer = unsafe { &*self.consumer_ptr() };
        RingBufferStatistics {
            producer: ProducerStatistics {
                call_count: shared.producer.call_count.load(Ordering::Acquire),
                call_failure_count: shared.producer.call_failure_count.load(Ordering::Acquire),
                cas_trials: shared.producer.cas_trials.load(Ordering::Acquire),
                cas_failures: shared.producer.cas_failures.load(Ordering::Acquire),
                buffer_full_count: shared.producer.buffer_full_count.load(Ordering::Acquire),
            },
            consumer: ConsumerStatistics {
                call_count: consumer.call_count,
                call_failure_count: consumer.call_failure_count,
                cas_trials: consumer.cas_trials,
                cas_failures: consumer.cas_failures,
                buffer_empty_count: consumer.buffer_empty_count,
            },
        }
    }

    pub fn reset(&self) {
        let shared = self.shared();
        shared.producer.call_count.store(0, Ordering::Relaxed);
        shared.producer.call_failure_count.store(0, Ordering::Relaxed);
        shared.producer.cas_trials.store(0, Ordering::Relaxed);
        shared.producer.cas_failures.store(0, Ordering::Relaxed);
        shared.producer.buffer_full_count.store(0, Ordering::Relaxed);
        self.update_consumer(|consumer| {
            *consumer = ConsumerCountersShared {
                call_count: 0,
                call_failure_count: 0,
                cas_trials: 0,
                cas_failures: 0,
                buffer_empty_count: 0,
            };
        });
    }

    pub fn path(&self) -> &str {
        self.region.name()
    }
}
