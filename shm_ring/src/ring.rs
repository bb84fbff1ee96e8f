// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The lock-free trace-job ring buffer.
//!
//! Storage lives in a named shared-memory region so application threads
//! (producers) and the trace daemon (consumer) can share it without any
//! OS-level lock. The whole queue state is one packed atomic word and one
//! status atomic per slot.
//!
//! # Synchronisation protocol
//!
//! The queue word packs `(empty: 1 bit, start: 15 bits, end: 15 bits)` and
//! is only ever mutated by compare-and-swap (acq_rel on success, acquire on
//! failure). Slot statuses move through
//!
//! ```text
//! Empty -> Allocated   (producer, after winning the end-index CAS)
//! Allocated -> Ready   (producer, release, after filling the payload)
//! Allocated -> Invalid (producer, release, abandoning the slot)
//! Ready -> Empty       (consumer, release, after processing)
//! Invalid -> Empty     (consumer, release, skipping the payload)
//! ```
//!
//! Status stores use release ordering and loads use acquire ordering, so a
//! consumer that observes `Ready` also observes the payload bytes written
//! before it. Every loop is bounded by [`GET_ELEMENT_RETRIES`]; exhaustion
//! reports a recoverable error instead of spinning.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use trace_protocol::{ErrorCode, ShmObjectHandle, TraceClientId, TraceContextId, TraceResult};

use crate::region::SharedMemoryRegion;
use crate::stats::{RingBufferStatistics, StatisticsRegion};

/// Largest admissible element count: 2^15 slots, so every slot index
/// (`0..capacity`) fits the 15-bit start/end fields.
pub const MAX_RING_CAPACITY: usize = 1 << 15;

/// Bound on every producer/consumer retry loop.
pub const GET_ELEMENT_RETRIES: u32 = 10;

/// Chunks a single trace job can reference.
pub const MAX_JOB_CHUNKS: usize = 4;

const END_MASK: u32 = 0x7FFF;
const START_SHIFT: u32 = 15;
const EMPTY_BIT: u32 = 1 << 30;

/// Slot status values. Stored as a raw byte in shared memory; foreign values
/// (possible after corruption by another process) compare unequal to every
/// status and make both sides retry rather than misinterpret a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TraceJobStatus {
    Empty = 0,
    Allocated = 1,
    Ready = 2,
    Invalid = 3,
}

/// A contiguous piece of a registered shared-memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ShmChunk {
    pub handle: ShmObjectHandle,
    pub offset: u32,
    pub size: u32,
}

impl ShmChunk {
    pub const fn zeroed() -> Self {
        Self {
            handle: 0,
            offset: 0,
            size: 0,
        }
    }
}

const JOB_KIND_SHM: u8 = 0;
const JOB_KIND_LOCAL: u8 = 1;

/// The fixed-size job descriptor carried by each ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TraceJobDescriptor {
    pub client_id: TraceClientId,
    job_kind: u8,
    has_context_id: u8,
    chunk_count: u8,
    pub context_id: TraceContextId,
    /// Slot in the trace-metadata region this job's meta info occupies.
    pub meta_slot: u32,
    /// Total payload size of a local-copy job.
    pub local_size: u32,
    chunks: [ShmChunk; MAX_JOB_CHUNKS],
}

impl TraceJobDescriptor {
    pub const fn zeroed() -> Self {
        Self {
            client_id: 0,
            job_kind: JOB_KIND_SHM,
            has_context_id: 0,
            chunk_count: 0,
            context_id: 0,
            meta_slot: 0,
            local_size: 0,
            chunks: [ShmChunk::zeroed(); MAX_JOB_CHUNKS],
        }
    }

    /// A job whose payload is shared by reference. The context id correlates
    /// the eventual trace-done callback.
    pub fn shm_job(
        client_id: TraceClientId,
        meta_slot: u32,
        chunks: &[ShmChunk],
        context_id: TraceContextId,
    ) -> TraceResult<Self> {
        if chunks.is_empty() || chunks.len() > MAX_JOB_CHUNKS {
            return Err(ErrorCode::InvalidArgument);
        }
        let mut descriptor = Self::zeroed();
        descriptor.client_id = client_id;
        descriptor.job_kind = JOB_KIND_SHM;
        descriptor.has_context_id = 1;
        descriptor.context_id = context_id;
        descriptor.meta_slot = meta_slot;
        descriptor.chunk_count = chunks.len() as u8;
        descriptor.chunks[..chunks.len()].copy_from_slice(chunks);
        Ok(descriptor)
    }

    /// A job whose payload was copied; no completion callback is owed.
    pub fn local_job(client_id: TraceClientId, meta_slot: u32, local_size: u32) -> Self {
        let mut descriptor = Self::zeroed();
        descriptor.client_id = client_id;
        descriptor.job_kind = JOB_KIND_LOCAL;
        descriptor.meta_slot = meta_slot;
        descriptor.local_size = local_size;
        descriptor
    }

    pub fn is_shm_job(&self) -> bool {
        self.job_kind == JOB_KIND_SHM
    }

    pub fn context_id(&self) -> Option<TraceContextId> {
        (self.has_context_id != 0).then_some(self.context_id)
    }

    pub fn chunks(&self) -> &[ShmChunk] {
        &self.chunks[..self.chunk_count as usize]
    }
}

/// One element of the shared ring.
#[repr(C)]
pub struct RingSlot {
    status: AtomicU8,
    payload: UnsafeCell<TraceJobDescriptor>,
}

// Payload access is handed over through the status protocol above.
unsafe impl Sync for RingSlot {}

impl RingSlot {
    fn status_raw(&self) -> u8 {
        self.status.load(Ordering::Acquire)
    }

    /// Producer: publish a filled payload.
    pub fn publish(&self, descriptor: TraceJobDescriptor) {
        // SAFETY: the slot is in `Allocated`, owned by this producer; the
        // consumer will not read the payload before observing `Ready`.
        unsafe { *self.payload.get() = descriptor };
        self.status.store(TraceJobStatus::Ready as u8, Ordering::Release);
    }

    /// Producer: abandon an allocated slot without filling it.
    pub fn abandon(&self) {
        self.status.store(TraceJobStatus::Invalid as u8, Ordering::Release);
    }

    /// Consumer: copy the payload of a fetched (Ready) slot.
    pub fn read_payload(&self) -> TraceJobDescriptor {
        // SAFETY: the consumer fetched this slot; the producer released the
        // payload before storing `Ready`.
        unsafe { *self.payload.get() }
    }

    /// Consumer: hand a processed slot back to the producers.
    pub fn release(&self) {
        self.status.store(TraceJobStatus::Empty as u8, Ordering::Release);
    }
}

/// Decoded view of the packed queue word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingState {
    pub empty: bool,
    pub start: u16,
    pub end: u16,
}

impl RingState {
    pub const EMPTY: RingState = RingState {
        empty: true,
        start: 0,
        end: 0,
    };

    pub fn pack(self) -> u32 {
        let mut raw = ((self.start as u32 & END_MASK) << START_SHIFT) | (self.end as u32 & END_MASK);
        if self.empty {
            raw |= EMPTY_BIT;
        }
        raw
    }

    pub fn unpack(raw: u32) -> Self {
        Self {
            empty: raw & EMPTY_BIT != 0,
            start: ((raw >> START_SHIFT) & END_MASK) as u16,
            end: (raw & END_MASK) as u16,
        }
    }

    fn is_full(self) -> bool {
        self.start == self.end && !self.empty
    }

    fn is_empty(self) -> bool {
        self.start == self.end && self.empty
    }
}

#[repr(C)]
struct RingHeader {
    use_count: AtomicU32,
    state: AtomicU32,
    capacity: u32,
}

fn region_len(capacity: usize) -> usize {
    let slots_offset = std::mem::size_of::<RingHeader>().next_multiple_of(std::mem::align_of::<RingSlot>());
    slots_offset + capacity * std::mem::size_of::<RingSlot>()
}

/// The shared trace-job queue.
pub struct ShmRingBuffer {
    region: SharedMemoryRegion,
    statistics: Option<StatisticsRegion>,
    statistics_path: Option<String>,
    capacity: u16,
    initialized: AtomicBool,
    path: String,
}

impl ShmRingBuffer {
    /// Open the ring at `path`, creating it when needed.
    ///
    /// Owner-role callers (the daemon) recreate the region whenever it is
    /// absent, stale, or non-empty. Non-owner callers (this library) open
    /// whatever exists and only create when nothing does; a create race
    /// between two non-owners is resolved by the loser reopening.
    ///
    /// `statistics_path` enables the statistics region.
    pub fn create_or_open(
        path: &str,
        capacity: usize,
        is_owner: bool,
        statistics_path: Option<&str>,
    ) -> TraceResult<Self> {
        if capacity == 0 {
            return Err(ErrorCode::RingBufferInvalidMemoryResource);
        }
        if capacity > MAX_RING_CAPACITY {
            return Err(ErrorCode::RingBufferTooLarge);
        }

        let opened = match SharedMemoryRegion::open(path, region_len(capacity)) {
            Ok(region) => Some(region),
            Err(nix::errno::Errno::ENOENT) => None,
            Err(_) => return Err(ErrorCode::RingBufferInvalidMemoryResource),
        };

        let mut ring = match opened {
            Some(region) => match Self::from_open_region(region, path, capacity, statistics_path) {
                Ok(ring) if is_owner && !ring.is_buffer_empty() => {
                    // Stale leftovers from a previous daemon lifetime.
                    drop(ring);
                    SharedMemoryRegion::unlink(path);
                    Self::create_fresh(path, capacity, statistics_path)?
                }
                Ok(ring) => ring,
                Err(_) if is_owner => {
                    SharedMemoryRegion::unlink(path);
                    Self::create_fresh(path, capacity, statistics_path)?
                }
                Err(e) => return Err(e),
            },
            None => match Self::create_fresh(path, capacity, statistics_path) {
                Ok(ring) => ring,
                // Lost a create race against another non-owner.
                Err(ErrorCode::RingBufferInvalidMemoryResource) if !is_owner => {
                    let region = SharedMemoryRegion::open(path, region_len(capacity))
                        .map_err(|_| ErrorCode::RingBufferInvalidMemoryResource)?;
                    Self::from_open_region(region, path, capacity, statistics_path)?
                }
                Err(e) => return Err(e),
            },
        };

        ring.header().use_count.fetch_add(1, Ordering::AcqRel);
        ring.initialized = AtomicBool::new(true);
        Ok(ring)
    }

    fn create_fresh(
        path: &str,
        capacity: usize,
        statistics_path: Option<&str>,
    ) -> TraceResult<Self> {
        let region = SharedMemoryRegion::create(path, region_len(capacity))
            .map_err(|_| ErrorCode::RingBufferInvalidMemoryResource)?;

        let ring = Self::assemble(region, path, capacity, statistics_path)?;
        // ftruncate zero-filled the region: statuses are already Empty and
        // the use-count is zero, but the all-zero state word decodes as a
        // full buffer and must be written explicitly.
        let header = ring.header();
        header.state.store(RingState::EMPTY.pack(), Ordering::Release);
        // Plain store through the mapping; nobody else can see the region
        // before this function returns.
        let header_ptr = ring.region.as_ptr().cast::<RingHeader>();
        // SAFETY: in-bounds write to the header we just created.
        unsafe { std::ptr::addr_of_mut!((*header_ptr).capacity).write(capacity as u32) };
        Ok(ring)
    }

    fn from_open_region(
        region: SharedMemoryRegion,
        path: &str,
        capacity: usize,
        statistics_path: Option<&str>,
    ) -> TraceResult<Self> {
        let ring = Self::assemble(region, path, capacity, statistics_path)?;
        if ring.header().capacity != capacity as u32 {
            return Err(ErrorCode::RingBufferInvalidMemoryResource);
        }
        Ok(ring)
    }

    fn assemble(
        region: SharedMemoryRegion,
        path: &str,
        capacity: usize,
        statistics_path: Option<&str>,
    ) -> TraceResult<Self> {
        let statistics = match statistics_path {
            Some(stats_path) => Some(
                StatisticsRegion::open_or_create(stats_path)
                    .map_err(|_| ErrorCode::RingBufferInvalidMemoryResource)?,
            ),
            None => None,
        };
        Ok(Self {
            region,
            statistics,
            statistics_path: statistics_path.map(str::to_owned),
            capacity: capacity as u16,
            initialized: AtomicBool::new(false),
            path: path.to_owned(),
        })
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: the region is at least region_len(capacity) bytes and the
        // header sits at its base for the lifetime of self.
        unsafe { &*self.region.as_ptr().cast::<RingHeader>() }
    }

    fn slots(&self) -> &[RingSlot] {
        let offset = std::mem::size_of::<RingHeader>()
            .next_multiple_of(std::mem::align_of::<RingSlot>());
        // SAFETY: capacity slots were sized into the region at that offset.
        unsafe {
            std::slice::from_raw_parts(
                self.region.as_ptr().add(offset).cast::<RingSlot>(),
                self.capacity as usize,
            )
        }
    }

    fn ensure_initialized(&self) -> TraceResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(ErrorCode::RingBufferNotInitialized);
        }
        Ok(())
    }

    fn load_state(&self) -> RingState {
        RingState::unpack(self.header().state.load(Ordering::Acquire))
    }

    fn is_valid_state(&self, state: RingState) -> bool {
        state.start < self.capacity && state.end < self.capacity
    }

    fn try_update_state(&self, current: RingState, new: RingState) -> bool {
        self.header()
            .state
            .compare_exchange_weak(
                current.pack(),
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Producer path: claim the slot at `end` for filling.
    ///
    /// The returned slot is in `Allocated`; the caller must finish with
    /// [`RingSlot::publish`] or [`RingSlot::abandon`].
    pub fn acquire_empty_slot(&self) -> TraceResult<&RingSlot> {
        self.ensure_initialized()?;

        if let Some(stats) = &self.statistics {
            StatisticsRegion::bump_producer(&stats.producer().call_count, 1);
        }

        let mut cas_trials = 0u64;
        let mut cas_failures = 0u64;
        for _ in 0..GET_ELEMENT_RETRIES {
            let current = self.load_state();
            if !self.is_valid_state(current) {
                self.flush_producer(true, cas_trials, cas_failures);
                return Err(ErrorCode::RingBufferInvalidState);
            }

            if current.is_full() {
                if let Some(stats) = &self.statistics {
                    StatisticsRegion::bump_producer(&stats.producer().buffer_full_count, 1);
                }
                self.flush_producer(false, cas_trials, cas_failures);
                return Err(ErrorCode::RingBufferFull);
            }

            let slot = &self.slots()[current.end as usize];
            if slot.status_raw() != TraceJobStatus::Empty as u8 {
                // Consumer has not finished releasing this slot yet.
                continue;
            }

            let new = RingState {
                empty: false,
                start: current.start,
                end: (current.end + 1) % self.capacity,
            };

            cas_trials += 1;
            if !self.try_update_state(current, new) {
                cas_failures += 1;
                continue;
            }

            slot.status
                .store(TraceJobStatus::Allocated as u8, Ordering::Release);
            self.flush_producer(false, cas_trials, cas_failures);
            return Ok(slot);
        }

        self.flush_producer(true, cas_trials, cas_failures);
        Err(ErrorCode::RingBufferNoEmptyElement)
    }

    fn flush_producer(&self, failed: bool, cas_trials: u64, cas_failures: u64) {
        if let Some(stats) = &self.statistics {
            if failed {
                StatisticsRegion::bump_producer(&stats.producer().call_failure_count, 1);
            }
            StatisticsRegion::bump_producer(&stats.producer().cas_trials, cas_trials);
            StatisticsRegion::bump_producer(&stats.producer().cas_failures, cas_failures);
        }
    }

    /// Consumer path: fetch the slot at `start` once its producer published
    /// it, advancing past abandoned slots.
    ///
    /// The caller processes the payload and finishes with
    /// [`RingSlot::release`]. Single-consumer by design.
    pub fn fetch_ready_slot(&self) -> TraceResult<&RingSlot> {
        self.ensure_initialized()?;

        self.update_consumer(|consumer| consumer.call_count += 1);

        let mut cas_trials = 0u64;
        let mut cas_failures = 0u64;
        for _ in 0..GET_ELEMENT_RETRIES {
            let current = self.load_state();
            if !self.is_valid_state(current) {
                self.flush_consumer(true, cas_trials, cas_failures, false);
                return Err(ErrorCode::RingBufferInvalidState);
            }

            if current.is_empty() {
                self.flush_consumer(false, cas_trials, cas_failures, true);
                return Err(ErrorCode::RingBufferEmpty);
            }

            let slot = &self.slots()[current.start as usize];
            let new_start = (current.start + 1) % self.capacity;
            let new = RingState {
                empty: new_start == current.end,
                start: new_start,
                end: current.end,
            };

            match slot.status_raw() {
                status if status == TraceJobStatus::Ready as u8 => {
                    cas_trials += 1;
                    if !self.try_update_state(current, new) {
                        cas_failures += 1;
                        continue;
                    }
                    self.flush_consumer(false, cas_trials, cas_failures, false);
                    return Ok(slot);
                }
                status if status == TraceJobStatus::Invalid as u8 => {
                    cas_trials += 1;
                    if !self.try_update_state(current, new) {
                        cas_failures += 1;
                        continue;
                    }
                    slot.release();
                }
                // Allocated (or foreign): the producer is still filling.
                _ => continue,
            }
        }

        self.flush_consumer(true, cas_trials, cas_failures, false);
        Err(ErrorCode::RingBufferNoReadyElement)
    }

    fn update_consumer(&self, update: impl FnOnce(&mut crate::stats::ConsumerCountersShared)) {
        if let Some(stats) = &self.statistics {
            stats.update_consumer(update);
        }
    }

    fn flush_consumer(&self, failed: bool, cas_trials: u64, cas_failures: u64, was_empty: bool) {
        self.update_consumer(|consumer| {
            if failed {
                consumer.call_failure_count += 1;
            }
            if was_empty {
                consumer.buffer_empty_count += 1;
            }
            consumer.cas_trials += cas_trials;
            consumer.cas_failures += cas_failures;
        });
    }

    /// Drop this participant's use and, when only one participant remains,
    /// wipe the queue back to its initial state. Called on daemon death,
    /// where the in-flight slots will never be consumed.
    pub fn reset(&self) {
        let remaining = self.header().use_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining != 1 {
            return;
        }

        for slot in self.slots() {
            slot.release();
        }
        for _ in 0..GET_ELEMENT_RETRIES {
            let current = self.load_state();
            if self.try_update_state(current, RingState::EMPTY) {
                break;
            }
        }
        if let Some(stats) = &self.statistics {
            stats.reset();
        }
    }

    /// Detach from the ring; the last participant also unlinks the shared
    /// names. The mapping itself is released on drop.
    pub fn close(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        if self.header().use_count.load(Ordering::Acquire) == 1 {
            if let Some(stats_path) = &self.statistics_path {
                SharedMemoryRegion::unlink(stats_path);
            }
            SharedMemoryRegion::unlink(&self.path);
        }
        self.header().use_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn capacity(&self) -> TraceResult<u16> {
        self.ensure_initialized()?;
        Ok(self.capacity)
    }

    /// Number of live (allocated/ready/invalid) slots.
    pub fn len(&self) -> TraceResult<u32> {
        self.ensure_initialized()?;
        let state = self.load_state();
        if !self.is_valid_state(state) {
            return Err(ErrorCode::RingBufferInvalidState);
        }
        if state.empty {
            return Ok(0);
        }
        let capacity = self.capacity as u32;
        let (start, end) = (state.start as u32, state.end as u32);
        Ok(if end > start {
            end - start
        } else {
            capacity - (start - end)
        })
    }

    pub fn is_buffer_empty(&self) -> bool {
        self.load_state().is_empty()
    }

    pub fn use_count(&self) -> TraceResult<u32> {
        self.ensure_initialized()?;
        Ok(self.header().use_count.load(Ordering::Acquire))
    }

    pub fn statistics(&self) -> TraceResult<RingBufferStatistics> {
        self.ensure_initialized()?;
        match &self.statistics {
            Some(stats) => Ok(stats.snapshot()),
            None => Err(ErrorCode::GenericError),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Index of a slot previously returned by this ring. Producers use it to
    /// address per-slot side storage (the trace-metadata region maps 1:1).
    pub fn slot_index(&self, slot: &RingSlot) -> u16 {
        let base = self.slots().as_ptr() as usize;
        let offset = slot as *const RingSlot as usize - base;
        (offset / std::mem::size_of::<RingSlot>()) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_word_round_trip() {
        for state in [
            RingState::EMPTY,
            RingState {
                empty: false,
                start: 0x7FFF,
                end: 0,
            },
            RingState {
                empty: false,
                start: 123,
                end: 0x7FFF,
            },
        ] {
            assert_eq!(RingState::unpack(state.pack()), state);
        }
    }

    #[test]
    fn all_zero_word_decodes_as_full() {
        // Guards the explicit state initialisation in create_fresh.
        let state = RingState::unpack(0);
        assert!(state.is_full());
        assert!(!state.is_empty());
    }

    #[test]
    fn descriptor_chunk_bounds() {
        let chunk = ShmChunk {
            handle: 1,
            offset: 0,
            size: 16,
        };
        assert!(TraceJobDescriptor::shm_job(1, 0, &[], 0).is_err());
        assert!(TraceJobDescriptor::shm_job(1, 0, &[chunk; MAX_JOB_CHUNKS + 1], 0).is_err());

        let descriptor = TraceJobDescriptor::shm_job(1, 0, &[chunk, chunk], 9).unwrap();
        assert_eq!(descriptor.chunks(), &[chunk, chunk]);
        assert_eq!(descriptor.context_id(), Some(9));
        assert!(descriptor.is_shm_job());

        let local = TraceJobDescriptor::local_job(1, 0, 512);
        assert_eq!(local.context_id(), None);
        assert!(!local.is_shm_job());
    }
}
