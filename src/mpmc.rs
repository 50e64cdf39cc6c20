//! Bounded lock-free MPMC array queue.
//!
//! A fixed-capacity multi-producer multi-consumer queue using per-slot
//! sequence tags for synchronization.
//!
//! # Algorithm
//!
//! The algorithm is Dmitry Vyukov's bounded MPMC queue with strict
//! emptiness/fullness detection layered on top:
//!
//! - Each slot has an atomic sequence tag
//! - Producers claim exclusive write positions by CAS on the producer
//!   cursor, consumers by CAS on the consumer cursor
//! - After writing, producers publish by setting `slot.seq = pos + 1`
//! - After reading, consumers free the slot by setting
//!   `slot.seq = pos + capacity`
//! - The strict operations consult the opposite cursor before declaring
//!   the queue full or empty, so `offer` fails only when the queue really
//!   was full and `poll` returns `None` only when it really was empty
//!
//! Bulk [`fill`](ArrayQueue::fill) and [`drain`](ArrayQueue::drain) claim a
//! whole window of consecutive positions with a single CAS when a
//! look-ahead probe shows the window free, amortizing cursor contention.
//!
//! # Example
//!
//! ```
//! use conduit::mpmc::ArrayQueue;
//!
//! let queue = ArrayQueue::new(4);
//! queue.offer(1u64).unwrap();
//! queue.offer(2).unwrap();
//! assert_eq!(queue.poll(), Some(1));
//! assert_eq!(queue.poll(), Some(2));
//! assert_eq!(queue.poll(), None);
//! ```

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use minstant::Instant;

use crate::queue::wait::{ExitCondition, Timeout, WaitStrategy};
use crate::queue::{MessagePassingQueue, QueueConsumer, QueueProducer};
use crate::trace;

/// Default cap on the bulk-operation look-ahead window.
pub const DEFAULT_MAX_LOOK_AHEAD_STEP: u64 = 4096;

/// Elements claimed per round by the uncapped fill loops.
const FILL_BATCH: usize = 4096;

/// Process-wide cap on the look-ahead window.
///
/// Read once from `CONDUIT_MAX_LOOK_AHEAD_STEP`; falls back to
/// [`DEFAULT_MAX_LOOK_AHEAD_STEP`] when unset or unparsable.
fn max_look_ahead_step() -> u64 {
    static STEP: OnceLock<u64> = OnceLock::new();
    *STEP.get_or_init(|| {
        std::env::var("CONDUIT_MAX_LOOK_AHEAD_STEP")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_LOOK_AHEAD_STEP)
    })
}

/// A slot in the ring with its sequence tag.
///
/// The tag encodes the slot state for its current cycle:
/// - `pos`: free, waiting for the producer at position `pos`
/// - `pos + 1`: filled, waiting for the consumer at position `pos`
/// - `pos + capacity`: free again, next cycle
#[repr(C)]
struct Slot<T> {
    seq: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    const fn new(seq: u64) -> Self {
        Self {
            seq: AtomicU64::new(seq),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

// SAFETY: the sequence tag protocol grants at most one thread access to
// `value` between tag transitions; the Release store on the tag publishes
// the element write to the Acquire load on the other side.
unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

/// Producer-side cursor, alone on its cache line.
#[repr(C)]
#[repr(align(64))]
struct ProducerState {
    /// Next position to claim for writing. Advanced by CAS.
    index: AtomicU64,
}

impl ProducerState {
    const fn new() -> Self {
        Self {
            index: AtomicU64::new(0),
        }
    }
}

/// Consumer-side cursor, alone on its cache line.
#[repr(C)]
#[repr(align(64))]
struct ConsumerState {
    /// Next position to claim for reading. Advanced by CAS.
    index: AtomicU64,
}

impl ConsumerState {
    const fn new() -> Self {
        Self {
            index: AtomicU64::new(0),
        }
    }
}

/// Bounded lock-free MPMC queue.
///
/// Any number of threads may call any operation through a shared
/// reference. Capacity is fixed at construction and normalized to the
/// next power of two.
pub struct ArrayQueue<T: Send> {
    producer: ProducerState,
    consumer: ConsumerState,
    buffer: Box<[Slot<T>]>,
    mask: u64,
    look_ahead_step: u64,
}

impl<T: Send> ArrayQueue<T> {
    /// Creates a queue holding at least `requested_capacity` elements.
    ///
    /// The actual capacity is the least power of two greater than or
    /// equal to the request. The look-ahead window for bulk operations
    /// is capped by the process-wide `CONDUIT_MAX_LOOK_AHEAD_STEP`
    /// setting (default 4096).
    ///
    /// # Panics
    ///
    /// Panics if `requested_capacity < 2`.
    #[must_use]
    pub fn new(requested_capacity: usize) -> Self {
        Self::with_max_look_ahead_step(requested_capacity, max_look_ahead_step())
    }

    /// Creates a queue with an explicit cap on the look-ahead window.
    ///
    /// The effective window is `max(2, min(capacity / 4, cap))`.
    ///
    /// # Panics
    ///
    /// Panics if `requested_capacity < 2`.
    #[must_use]
    pub fn with_max_look_ahead_step(requested_capacity: usize, cap: u64) -> Self {
        assert!(requested_capacity >= 2, "capacity must be at least 2");
        let capacity = requested_capacity.next_power_of_two();
        let buffer: Box<[Slot<T>]> = (0..capacity as u64).map(Slot::new).collect();
        let look_ahead_step = (capacity as u64 / 4).min(cap).max(2);
        trace::debug!(capacity, look_ahead_step, "created bounded mpmc queue");
        Self {
            producer: ProducerState::new(),
            consumer: ConsumerState::new(),
            buffer,
            mask: capacity as u64 - 1,
            look_ahead_step,
        }
    }

    /// Normalized capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        (self.mask + 1) as usize
    }

    #[inline]
    fn slot(&self, index: u64) -> &Slot<T> {
        &self.buffer[(index & self.mask) as usize]
    }

    /// Inserts an element, failing only if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `Err(e)` if and only if
    /// `producer_index - consumer_index == capacity` held at some point
    /// during the call.
    pub fn offer(&self, e: T) -> Result<(), T> {
        let capacity = self.mask + 1;
        // Stale snapshot of the consumer cursor; zero forces a refresh the
        // first time the full test is consulted.
        let mut cached_consumer = 0;
        loop {
            let p_index = self.producer.index.load(Ordering::Acquire);
            let slot = self.slot(p_index);
            let seq = slot.seq.load(Ordering::Acquire);

            if seq == p_index {
                // Slot is free for this position; try to claim it.
                if self
                    .producer
                    .index
                    .compare_exchange_weak(
                        p_index,
                        p_index + 1,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // SAFETY: the CAS makes this thread the only producer
                    // for position p_index, and seq == p_index means the
                    // previous cycle's consumer has released the slot.
                    unsafe { (*slot.value.get()).write(e) };
                    // Publish: hand the slot to the consumer at p_index.
                    slot.seq.store(p_index + 1, Ordering::Release);
                    return Ok(());
                }
                // Another producer claimed p_index first; reload.
            } else if seq < p_index {
                // The consumer has not freed this slot: possibly full.
                // Test against the cached cursor before paying for a
                // fresh read of the hot consumer cursor.
                if p_index >= capacity + cached_consumer {
                    cached_consumer = self.consumer.index.load(Ordering::Acquire);
                    if p_index >= capacity + cached_consumer {
                        return Err(e);
                    }
                }
                // A consumer advanced since the snapshot; go around.
            }
            // seq > p_index: another producer already filled this slot
            // this cycle; reload the cursor.
        }
    }

    /// Inserts an element, but may fail spuriously while a consumer is
    /// mid-release on the target slot.
    ///
    /// # Errors
    ///
    /// Returns `Err(e)` when the slot at the producer cursor has not been
    /// freed, without checking whether the queue is actually full.
    pub fn relaxed_offer(&self, e: T) -> Result<(), T> {
        loop {
            let p_index = self.producer.index.load(Ordering::Acquire);
            let slot = self.slot(p_index);
            let seq = slot.seq.load(Ordering::Acquire);

            if seq == p_index {
                if self
                    .producer
                    .index
                    .compare_exchange_weak(
                        p_index,
                        p_index + 1,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // SAFETY: as in `offer`, the CAS plus the free tag give
                    // exclusive write access to the slot.
                    unsafe { (*slot.value.get()).write(e) };
                    slot.seq.store(p_index + 1, Ordering::Release);
                    return Ok(());
                }
            } else if seq < p_index {
                return Err(e);
            }
        }
    }

    /// Removes and returns the next element, or `None` only if the queue
    /// was empty at some point during the call.
    pub fn poll(&self) -> Option<T> {
        // Stale snapshot of the producer cursor; zero forces a refresh the
        // first time the empty test is consulted.
        let mut cached_producer = 0;
        loop {
            let c_index = self.consumer.index.load(Ordering::Acquire);
            let slot = self.slot(c_index);
            let seq = slot.seq.load(Ordering::Acquire);
            let expected = c_index + 1;

            if seq == expected {
                if self
                    .consumer
                    .index
                    .compare_exchange_weak(
                        c_index,
                        c_index + 1,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // SAFETY: the CAS makes this thread the only consumer
                    // for position c_index, and the Acquire on the filled
                    // tag synchronized with the producer's publication.
                    let e = unsafe { (*slot.value.get()).assume_init_read() };
                    // Free the slot for the producer one cycle ahead.
                    slot.seq.store(c_index + self.mask + 1, Ordering::Release);
                    return Some(e);
                }
            } else if seq < expected {
                // Slot not yet published: possibly empty.
                if c_index >= cached_producer {
                    cached_producer = self.producer.index.load(Ordering::Acquire);
                    if c_index == cached_producer {
                        return None;
                    }
                }
                // A producer is ahead of us; go around.
            }
            // seq > expected: another consumer already took this slot;
            // reload the cursor.
        }
    }

    /// Removes and returns the next element, or `None` as soon as the
    /// slot at the consumer cursor is not visibly published.
    pub fn relaxed_poll(&self) -> Option<T> {
        loop {
            let c_index = self.consumer.index.load(Ordering::Acquire);
            let slot = self.slot(c_index);
            let seq = slot.seq.load(Ordering::Acquire);
            let expected = c_index + 1;

            if seq == expected {
                if self
                    .consumer
                    .index
                    .compare_exchange_weak(
                        c_index,
                        c_index + 1,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // SAFETY: as in `poll`.
                    let e = unsafe { (*slot.value.get()).assume_init_read() };
                    slot.seq.store(c_index + self.mask + 1, Ordering::Release);
                    return Some(e);
                }
            } else if seq < expected {
                return None;
            }
        }
    }

    /// Returns a copy of the next element without removing it, or `None`
    /// only if the queue was empty at some point during the call.
    ///
    /// Spins while the slot is visibly filled from a prior cycle but the
    /// consumer cursor has already moved past the sampled position.
    pub fn peek(&self) -> Option<T>
    where
        T: Copy,
    {
        let mut cached_producer = 0;
        loop {
            let c_index = self.consumer.index.load(Ordering::Acquire);
            let slot = self.slot(c_index);
            let seq = slot.seq.load(Ordering::Acquire);
            let expected = c_index + 1;

            if seq < expected {
                if c_index >= cached_producer {
                    cached_producer = self.producer.index.load(Ordering::Acquire);
                    if c_index == cached_producer {
                        return None;
                    }
                }
            } else if seq == expected {
                // Racy copy: a concurrent consumer/producer pair may be
                // recycling this slot while we read it, so take the bytes
                // first and only bless them as a value after proving the
                // slot still belonged to position c_index.
                let bytes = unsafe { std::ptr::read_volatile(slot.value.get()) };
                if self.consumer.index.load(Ordering::Acquire) == c_index {
                    // SAFETY: no consumer claimed c_index, so no producer
                    // can have begun the next cycle on this slot; the
                    // bytes are the fully published element at c_index.
                    return Some(unsafe { bytes.assume_init() });
                }
            }
            // seq > expected: our consumer-cursor sample is stale; reload.
        }
    }

    /// Returns a copy of the next element without removing it, or `None`
    /// as soon as the slot at the consumer cursor is not visibly
    /// published. Never consults the producer cursor.
    pub fn relaxed_peek(&self) -> Option<T>
    where
        T: Copy,
    {
        loop {
            let c_index = self.consumer.index.load(Ordering::Acquire);
            let slot = self.slot(c_index);
            let seq = slot.seq.load(Ordering::Acquire);
            let expected = c_index + 1;

            if seq < expected {
                return None;
            }
            if seq == expected {
                let bytes = unsafe { std::ptr::read_volatile(slot.value.get()) };
                if self.consumer.index.load(Ordering::Acquire) == c_index {
                    // SAFETY: as in `peek`.
                    return Some(unsafe { bytes.assume_init() });
                }
            }
        }
    }

    /// Inserts up to `limit` supplied elements, returning the number
    /// actually inserted.
    ///
    /// Claims windows of up to the look-ahead step with a single CAS when
    /// the window appears free, then publishes slot by slot. Falls back
    /// to one-by-one claims when the window probe fails, and stops early
    /// when fullness is observed.
    ///
    /// The supplier is only invoked for slots that have already been
    /// claimed, so no supplied element is ever discarded.
    pub fn fill<S: FnMut() -> T>(&self, mut supplier: S, limit: usize) -> usize {
        if limit == 0 {
            return 0;
        }
        let max_step = self.look_ahead_step.min(limit as u64);
        let mut produced = 0usize;

        while produced < limit {
            let remaining = limit - produced;
            let step = max_step.min(remaining as u64);
            let p_index = self.producer.index.load(Ordering::Acquire);
            let look_ahead_index = p_index + step - 1;
            let look_ahead_seq = self.slot(look_ahead_index).seq.load(Ordering::Acquire);

            // The whole [p_index, p_index + step) window appears free when
            // the last slot in it still carries its free-state tag.
            if look_ahead_seq == look_ahead_index
                && self
                    .producer
                    .index
                    .compare_exchange(
                        p_index,
                        look_ahead_index + 1,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                for i in 0..step {
                    let index = p_index + i;
                    let slot = self.slot(index);
                    // The previous cycle's consumer may still be releasing
                    // an earlier slot in the window.
                    while slot.seq.load(Ordering::Acquire) != index {
                        std::hint::spin_loop();
                    }
                    // SAFETY: the window CAS gave this thread exclusive
                    // producer access to every position in the window, and
                    // the tag wait above confirmed the slot is released.
                    unsafe { (*slot.value.get()).write(supplier()) };
                    slot.seq.store(index + 1, Ordering::Release);
                }
                produced += step as usize;
            } else {
                if look_ahead_seq < look_ahead_index && self.slot_not_available(p_index, p_index) {
                    return produced;
                }
                return produced + self.fill_one_by_one(&mut supplier, remaining);
            }
        }
        limit
    }

    /// Removes up to `limit` elements, feeding each to `consumer`, and
    /// returns the number removed.
    ///
    /// The bulk counterpart of [`fill`](ArrayQueue::fill): claims a window
    /// of filled slots with a single CAS when the look-ahead probe shows
    /// the whole window published.
    pub fn drain<C: FnMut(T)>(&self, mut consumer: C, limit: usize) -> usize {
        if limit == 0 {
            return 0;
        }
        let max_step = self.look_ahead_step.min(limit as u64);
        let mut consumed = 0usize;

        while consumed < limit {
            let remaining = limit - consumed;
            let step = max_step.min(remaining as u64);
            let c_index = self.consumer.index.load(Ordering::Acquire);
            let look_ahead_index = c_index + step - 1;
            let look_ahead_seq = self.slot(look_ahead_index).seq.load(Ordering::Acquire);
            // Unlike fill, the window is ready when its last slot carries
            // the filled-state tag.
            let expected_look_ahead_seq = look_ahead_index + 1;

            if look_ahead_seq == expected_look_ahead_seq
                && self
                    .consumer
                    .index
                    .compare_exchange(
                        c_index,
                        expected_look_ahead_seq,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                for i in 0..step {
                    let index = c_index + i;
                    let slot = self.slot(index);
                    let expected = index + 1;
                    // An older producer may still be publishing an earlier
                    // slot in the window.
                    while slot.seq.load(Ordering::Acquire) != expected {
                        std::hint::spin_loop();
                    }
                    // SAFETY: the window CAS gave this thread exclusive
                    // consumer access to every position in the window, and
                    // the tag wait above confirmed publication.
                    let e = unsafe { (*slot.value.get()).assume_init_read() };
                    slot.seq.store(index + self.mask + 1, Ordering::Release);
                    consumer(e);
                }
                consumed += step as usize;
            } else {
                if look_ahead_seq < expected_look_ahead_seq
                    && self.slot_not_available(c_index, c_index + 1)
                {
                    return consumed;
                }
                return consumed + self.drain_one_by_one(&mut consumer, remaining);
            }
        }
        limit
    }

    /// Inserts supplied elements until fullness is observed or one
    /// capacity's worth has been produced, returning the number inserted.
    pub fn fill_all<S: FnMut() -> T>(&self, mut supplier: S) -> usize {
        let capacity = self.capacity();
        let mut produced = 0;
        while produced < capacity {
            let filled = self.fill(&mut supplier, FILL_BATCH.min(capacity - produced));
            if filled == 0 {
                return produced;
            }
            produced += filled;
        }
        produced
    }

    /// Inserts supplied elements until `exit` says stop, idling via
    /// `wait` between full observations.
    ///
    /// Elements are claimed in batches before the supplier runs, so no
    /// supplied element is ever discarded.
    pub fn fill_until<S, W, X>(&self, mut supplier: S, wait: &W, exit: &X)
    where
        S: FnMut() -> T,
        W: WaitStrategy + ?Sized,
        X: ExitCondition + ?Sized,
    {
        let mut idle = 0;
        while exit.keep_running() {
            if self.fill(&mut supplier, FILL_BATCH) == 0 {
                idle = wait.idle(idle);
            } else {
                idle = 0;
            }
        }
    }

    /// Spins until the element is accepted or the timeout expires.
    ///
    /// # Errors
    ///
    /// Returns `Err(e)` on timeout.
    pub fn offer_blocking(&self, mut e: T, timeout: Timeout) -> Result<(), T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            match self.relaxed_offer(e) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    e = returned;
                    if let Some(dl) = deadline
                        && Instant::now() > dl
                    {
                        trace::trace!(size = self.size(), "offer_blocking timed out");
                        return Err(e);
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Spins until an element is available or the timeout expires.
    ///
    /// Returns `None` on timeout.
    #[must_use]
    pub fn poll_blocking(&self, timeout: Timeout) -> Option<T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            if let Some(e) = self.relaxed_poll() {
                return Some(e);
            }
            if let Some(dl) = deadline
                && Instant::now() > dl
            {
                trace::trace!(size = self.size(), "poll_blocking timed out");
                return None;
            }
            std::hint::spin_loop();
        }
    }

    /// Approximate number of elements, clamped to `[0, capacity]`.
    #[must_use]
    pub fn size(&self) -> usize {
        // Sample the producer cursor between two agreeing reads of the
        // consumer cursor, so the difference can never be negative.
        let mut after = self.consumer.index.load(Ordering::Acquire);
        loop {
            let before = after;
            let current_producer = self.producer.index.load(Ordering::Acquire);
            after = self.consumer.index.load(Ordering::Acquire);
            if before == after {
                return (current_producer - after).min(self.mask + 1) as usize;
            }
        }
    }

    /// Whether the queue was empty at the observation point.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.consumer.index.load(Ordering::Acquire) == self.producer.index.load(Ordering::Acquire)
    }

    /// Whether the slot at `index` still lags `expected_seq`.
    #[inline]
    fn slot_not_available(&self, index: u64, expected_seq: u64) -> bool {
        self.slot(index).seq.load(Ordering::Acquire) < expected_seq
    }

    fn fill_one_by_one<S: FnMut() -> T>(&self, supplier: &mut S, limit: usize) -> usize {
        for produced in 0..limit {
            let (p_index, slot) = loop {
                let p_index = self.producer.index.load(Ordering::Acquire);
                let slot = self.slot(p_index);
                let seq = slot.seq.load(Ordering::Acquire);
                if seq < p_index {
                    // Not freed by a consumer yet; report what we managed.
                    return produced;
                }
                if seq == p_index
                    && self
                        .producer
                        .index
                        .compare_exchange_weak(
                            p_index,
                            p_index + 1,
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                {
                    break (p_index, slot);
                }
            };
            // SAFETY: as in `offer`; the slot is claimed before the
            // supplier runs.
            unsafe { (*slot.value.get()).write(supplier()) };
            slot.seq.store(p_index + 1, Ordering::Release);
        }
        limit
    }

    fn drain_one_by_one<C: FnMut(T)>(&self, consumer: &mut C, limit: usize) -> usize {
        for consumed in 0..limit {
            let (c_index, slot) = loop {
                let c_index = self.consumer.index.load(Ordering::Acquire);
                let slot = self.slot(c_index);
                let seq = slot.seq.load(Ordering::Acquire);
                let expected = c_index + 1;
                if seq < expected {
                    return consumed;
                }
                if seq == expected
                    && self
                        .consumer
                        .index
                        .compare_exchange_weak(
                            c_index,
                            c_index + 1,
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                {
                    break (c_index, slot);
                }
            };
            // SAFETY: as in `poll`.
            let e = unsafe { (*slot.value.get()).assume_init_read() };
            slot.seq.store(c_index + self.mask + 1, Ordering::Release);
            consumer(e);
        }
        limit
    }
}

impl<T: Send> MessagePassingQueue for ArrayQueue<T> {
    fn capacity(&self) -> Option<usize> {
        Some(Self::capacity(self))
    }

    fn size(&self) -> usize {
        Self::size(self)
    }

    fn is_empty(&self) -> bool {
        Self::is_empty(self)
    }
}

impl<T: Send> QueueProducer<T> for ArrayQueue<T> {
    fn offer(&self, e: T) -> Result<(), T> {
        Self::offer(self, e)
    }

    fn relaxed_offer(&self, e: T) -> Result<(), T> {
        Self::relaxed_offer(self, e)
    }

    fn fill<S: FnMut() -> T>(&self, supplier: S, limit: usize) -> usize {
        Self::fill(self, supplier, limit)
    }
}

impl<T: Send> QueueConsumer<T> for ArrayQueue<T> {
    fn poll(&self) -> Option<T> {
        Self::poll(self)
    }

    fn relaxed_poll(&self) -> Option<T> {
        Self::relaxed_poll(self)
    }

    fn peek(&self) -> Option<T>
    where
        T: Copy,
    {
        Self::peek(self)
    }

    fn relaxed_peek(&self) -> Option<T>
    where
        T: Copy,
    {
        Self::relaxed_peek(self)
    }

    fn drain<C: FnMut(T)>(&self, consumer: C, limit: usize) -> usize {
        Self::drain(self, consumer, limit)
    }
}

impl<T: Send> fmt::Debug for ArrayQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayQueue")
            .field("capacity", &self.capacity())
            .field("size", &self.size())
            .finish()
    }
}

impl<T: Send> Drop for ArrayQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: drop whatever is still sitting between the
        // cursors. No operation can be in flight with &mut self.
        let consumer = *self.consumer.index.get_mut();
        let producer = *self.producer.index.get_mut();
        for index in consumer..producer {
            let slot = &self.buffer[(index & self.mask) as usize];
            // SAFETY: every position in [consumer, producer) was published
            // and not yet consumed.
            unsafe { (*slot.value.get()).assume_init_drop() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_capacity_normalization() {
        let queue: ArrayQueue<u64> = ArrayQueue::new(5);
        assert_eq!(queue.capacity(), 8);

        let queue: ArrayQueue<u64> = ArrayQueue::new(2);
        assert_eq!(queue.capacity(), 2);

        let queue: ArrayQueue<u64> = ArrayQueue::new(1024);
        assert_eq!(queue.capacity(), 1024);
    }

    #[test]
    #[should_panic(expected = "capacity must be at least 2")]
    fn test_capacity_too_small() {
        let _ = ArrayQueue::<u64>::new(1);
    }

    #[test]
    fn test_look_ahead_step_clamping() {
        // Large capacity, small cap: the cap wins.
        let queue: ArrayQueue<u64> = ArrayQueue::with_max_look_ahead_step(1024, 8);
        assert_eq!(queue.look_ahead_step, 8);

        // Small capacity: capacity / 4 wins.
        let queue: ArrayQueue<u64> = ArrayQueue::with_max_look_ahead_step(1024, 100_000);
        assert_eq!(queue.look_ahead_step, 256);

        // Tiny capacity: the lower bound of 2 wins.
        let queue: ArrayQueue<u64> = ArrayQueue::with_max_look_ahead_step(2, 4096);
        assert_eq!(queue.look_ahead_step, 2);
    }

    #[test]
    fn test_fill_then_drain_sequence() {
        let queue = ArrayQueue::new(4);
        for i in 1..=4u64 {
            assert!(queue.offer(i).is_ok(), "failed to offer item {i}");
        }
        assert_eq!(queue.offer(5), Err(5));

        for i in 1..=4u64 {
            assert_eq!(queue.poll(), Some(i));
        }
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn test_interleaved_operations() {
        let queue = ArrayQueue::new(2);
        assert!(queue.offer(1u64).is_ok());
        assert!(queue.offer(2).is_ok());
        assert_eq!(queue.offer(3), Err(3));
        assert_eq!(queue.poll(), Some(1));
        assert!(queue.offer(3).is_ok());
        assert_eq!(queue.poll(), Some(2));
        assert_eq!(queue.poll(), Some(3));
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let queue = ArrayQueue::new(4);
        assert_eq!(queue.peek(), None);
        assert_eq!(queue.relaxed_peek(), None);

        queue.offer(1u64).unwrap();
        queue.offer(2).unwrap();
        assert_eq!(queue.peek(), Some(1));
        assert_eq!(queue.peek(), Some(1));
        assert_eq!(queue.poll(), Some(1));
        assert_eq!(queue.relaxed_peek(), Some(2));
        assert_eq!(queue.poll(), Some(2));
        assert_eq!(queue.peek(), None);
    }

    #[test]
    fn test_relaxed_matches_strict_sequentially() {
        let strict = ArrayQueue::new(4);
        let relaxed = ArrayQueue::new(4);

        for i in 0..4u64 {
            assert_eq!(strict.offer(i).is_ok(), relaxed.relaxed_offer(i).is_ok());
        }
        assert_eq!(strict.offer(99).is_err(), relaxed.relaxed_offer(99).is_err());
        for _ in 0..4 {
            assert_eq!(strict.poll(), relaxed.relaxed_poll());
        }
        assert_eq!(strict.poll(), relaxed.relaxed_poll());
    }

    #[test]
    fn test_fill_look_ahead() {
        let queue = ArrayQueue::new(16);
        let mut next = 0u64;
        let filled = queue.fill(
            || {
                let v = next;
                next += 1;
                v
            },
            8,
        );
        assert_eq!(filled, 8);
        for i in 0..8u64 {
            assert_eq!(queue.poll(), Some(i));
        }
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn test_fill_respects_capacity() {
        let queue = ArrayQueue::new(4);
        let filled = queue.fill(|| 7u64, 10);
        assert_eq!(filled, 4);
        assert_eq!(queue.fill(|| 7u64, 10), 0);
        assert_eq!(queue.size(), 4);
    }

    #[test]
    fn test_drain_with_limit() {
        let queue = ArrayQueue::new(16);
        for i in 0..10u64 {
            queue.offer(i).unwrap();
        }

        let mut out = Vec::new();
        assert_eq!(queue.drain(|e| out.push(e), 4), 4);
        assert_eq!(out, vec![0, 1, 2, 3]);

        assert_eq!(queue.drain(|e| out.push(e), 100), 6);
        assert_eq!(out, (0..10).collect::<Vec<_>>());

        assert_eq!(queue.drain(|e| out.push(e), 4), 0);
    }

    #[test]
    fn test_bulk_zero_limit() {
        let queue = ArrayQueue::new(4);
        queue.offer(1u64).unwrap();
        assert_eq!(queue.drain(|_| {}, 0), 0);
        assert_eq!(queue.fill(|| 2u64, 0), 0);
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_look_ahead_window_equals_capacity() {
        // Capacity 2 forces look_ahead_step == capacity: the window claim
        // must wrap cleanly cycle after cycle.
        let queue = ArrayQueue::new(2);
        for round in 0..5u64 {
            let base = round * 2;
            let mut next = base;
            assert_eq!(
                queue.fill(
                    || {
                        let v = next;
                        next += 1;
                        v
                    },
                    2,
                ),
                2,
            );
            let mut out = Vec::new();
            assert_eq!(queue.drain(|e| out.push(e), 2), 2);
            assert_eq!(out, vec![base, base + 1]);
        }
    }

    #[test]
    fn test_single_step_bulk_operations() {
        let queue = ArrayQueue::new(8);
        assert_eq!(queue.fill(|| 42u64, 1), 1);
        let mut out = Vec::new();
        assert_eq!(queue.drain(|e| out.push(e), 1), 1);
        assert_eq!(out, vec![42]);
    }

    #[test]
    fn test_fill_all() {
        let queue = ArrayQueue::new(8);
        queue.offer(0u64).unwrap();
        assert_eq!(queue.fill_all(|| 1u64), 7);
        assert_eq!(queue.size(), 8);
        assert_eq!(queue.fill_all(|| 2u64), 0);
    }

    #[test]
    fn test_size_and_is_empty() {
        let queue = ArrayQueue::new(8);
        assert!(queue.is_empty());
        assert_eq!(queue.size(), 0);

        queue.offer(1u64).unwrap();
        queue.offer(2).unwrap();
        assert!(!queue.is_empty());
        assert_eq!(queue.size(), 2);

        queue.poll().unwrap();
        assert_eq!(queue.size(), 1);
        queue.poll().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_blocking_operations() {
        let queue = ArrayQueue::new(2);
        queue.offer(1u64).unwrap();
        queue.offer(2).unwrap();

        // Full queue: offer_blocking must time out and hand the element back.
        let result = queue.offer_blocking(3, Timeout::Duration(Duration::from_millis(10)));
        assert_eq!(result, Err(3));

        assert_eq!(queue.poll_blocking(Timeout::Infinite), Some(1));

        // Space was freed, so a blocking offer now succeeds immediately.
        assert!(queue
            .offer_blocking(3, Timeout::Duration(Duration::from_millis(10)))
            .is_ok());

        // Drain everything, then poll_blocking on empty must time out.
        assert_eq!(queue.poll(), Some(2));
        assert_eq!(queue.poll(), Some(3));
        assert_eq!(
            queue.poll_blocking(Timeout::Duration(Duration::from_millis(10))),
            None
        );
    }

    #[test]
    fn test_non_copy_elements() {
        let queue = ArrayQueue::new(4);
        queue.offer("hello".to_string()).unwrap();
        queue.offer("world".to_string()).unwrap();
        assert_eq!(queue.poll(), Some("hello".to_string()));
        assert_eq!(queue.poll(), Some("world".to_string()));
        assert_eq!(queue.poll(), None);
    }

    #[derive(Debug)]
    struct CountsDrops(Arc<AtomicUsize>);

    impl Drop for CountsDrops {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_drop_releases_unconsumed_elements() {
        let drops = Arc::new(AtomicUsize::new(0));
        let queue = ArrayQueue::new(8);
        for _ in 0..5 {
            queue.offer(CountsDrops(Arc::clone(&drops))).unwrap();
        }
        // Consume two; their drops happen as the values go out of scope.
        drop(queue.poll());
        drop(queue.poll());
        assert_eq!(drops.load(Ordering::Relaxed), 2);

        drop(queue);
        assert_eq!(drops.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_drain_all_trait_loop() {
        let queue = ArrayQueue::new(16);
        for i in 0..10u64 {
            queue.offer(i).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(QueueConsumer::drain_all(&queue, |e| out.push(e)), 10);
        assert_eq!(out, (0..10).collect::<Vec<_>>());
    }

    /// Counts idle rounds so tests can bound helper loops.
    struct CountingWait<'a>(&'a AtomicUsize);

    impl WaitStrategy for CountingWait<'_> {
        fn idle(&self, counter: u32) -> u32 {
            self.0.fetch_add(1, Ordering::Relaxed);
            counter + 1
        }
    }

    #[test]
    fn test_drain_until_exit_condition() {
        let queue = ArrayQueue::new(16);
        for i in 0..4u64 {
            queue.offer(i).unwrap();
        }

        // Stop after the queue has been observed empty a few times.
        let empties = AtomicUsize::new(0);
        let exit = || empties.load(Ordering::Relaxed) < 3;
        let mut out = Vec::new();
        queue.drain_until(|e| out.push(e), &CountingWait(&empties), &exit);
        assert_eq!(out, (0..4).collect::<Vec<_>>());
    }

    #[test]
    fn test_fill_until_exit_condition() {
        let queue = ArrayQueue::new(4);
        let fulls = AtomicUsize::new(0);
        let exit = || fulls.load(Ordering::Relaxed) < 2;
        let mut next = 0u64;
        queue.fill_until(
            || {
                let v = next;
                next += 1;
                v
            },
            &CountingWait(&fulls),
            &exit,
        );

        // Filled to capacity, then fullness was observed twice.
        assert_eq!(queue.size(), 4);
        let mut out = Vec::new();
        queue.drain(|e| out.push(e), 8);
        assert_eq!(out, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_sequence_tags_at_rest() {
        let queue = ArrayQueue::new(4);
        for round in 0..3u64 {
            for i in 0..4 {
                queue.offer(round * 4 + i).unwrap();
            }
            for _ in 0..4 {
                queue.poll().unwrap();
            }
        }

        // At rest every slot's tag is congruent to its position and never
        // runs behind it.
        let capacity = queue.capacity() as u64;
        for (i, slot) in queue.buffer.iter().enumerate() {
            let seq = slot.seq.load(Ordering::Acquire);
            assert_eq!(seq % capacity, i as u64);
            assert!(seq >= i as u64);
        }
    }

    #[test]
    fn test_multiple_producers() {
        let queue: Arc<ArrayQueue<u64>> = Arc::new(ArrayQueue::new(64));
        let num_producers = 4;
        let items_per_producer = 100;

        let mut handles = vec![];
        for p in 0..num_producers {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..items_per_producer {
                    let value = (p * 1000 + i) as u64;
                    loop {
                        if queue.offer(value).is_ok() {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            }));
        }

        // Drain on this thread while producers run.
        let mut items = vec![];
        while items.len() < num_producers * items_per_producer {
            if let Some(item) = queue.poll() {
                items.push(item);
            } else {
                thread::yield_now();
            }
        }

        for h in handles {
            h.join().unwrap();
        }

        items.sort_unstable();
        let mut expected: Vec<u64> = (0..num_producers)
            .flat_map(|p| (0..items_per_producer).map(move |i| (p * 1000 + i) as u64))
            .collect();
        expected.sort_unstable();
        assert_eq!(items, expected);
    }

    #[test]
    fn test_concurrent_fill_and_drain() {
        let queue: Arc<ArrayQueue<u64>> = Arc::new(ArrayQueue::new(32));
        let total = 10_000u64;

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut next = 0u64;
                while next < total {
                    let remaining = (total - next) as usize;
                    let filled = queue.fill(
                        || {
                            let v = next;
                            next += 1;
                            v
                        },
                        remaining.min(16),
                    );
                    if filled == 0 {
                        thread::yield_now();
                    }
                }
            })
        };

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut sum = 0u64;
                let mut received = 0u64;
                while received < total {
                    let drained = queue.drain(
                        |e| {
                            sum += e;
                        },
                        16,
                    );
                    if drained == 0 {
                        thread::yield_now();
                    }
                    received += drained as u64;
                }
                sum
            })
        };

        producer.join().unwrap();
        let sum = consumer.join().unwrap();
        assert_eq!(sum, (total - 1) * total / 2);
    }
}
