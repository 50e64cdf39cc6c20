//! The common message-passing-queue contract.
//!
//! Every queue in this crate moves owned elements from producer threads to
//! consumer threads without locks. The contract splits along the ownership
//! seam:
//!
//! - [`MessagePassingQueue`] - observations any party may make
//! - [`QueueProducer`] - the offering side
//! - [`QueueConsumer`] - the polling side
//!
//! [`crate::mpmc::ArrayQueue`] implements all three on a single shared
//! value (every role is multi-threaded there). The unbounded MPSC queue
//! splits into [`crate::mpsc::Producer`] and [`crate::mpsc::Consumer`]
//! handle ends, which implement the producer and consumer halves.
//!
//! # Strict vs relaxed
//!
//! Strict operations tie their failure value to the abstract FIFO state:
//! `offer` returns `Err` only if the queue was full at some point during
//! the call, `poll`/`peek` return `None` only if it was empty. Relaxed
//! counterparts may fail spuriously while the opposite side is mid-flight,
//! but when they succeed the value is always correct. Relaxed operations
//! never spin and are the right building block for polling loops.

pub mod wait;

use self::wait::{ExitCondition, WaitStrategy};

/// Observations shared by both ends of every queue.
pub trait MessagePassingQueue {
    /// Number of elements the queue can hold, or `None` when unbounded.
    ///
    /// Bounded queues report their normalized capacity, which may exceed
    /// the capacity requested at construction.
    fn capacity(&self) -> Option<usize>;

    /// Approximate number of elements in the queue.
    ///
    /// Racy by nature: the value is a best-effort snapshot and may be
    /// stale by the time it is returned. Diagnostic use only.
    fn size(&self) -> usize;

    /// Whether the queue was empty at the observation point.
    fn is_empty(&self) -> bool;
}

/// The offering side of a queue.
pub trait QueueProducer<T: Send>: MessagePassingQueue {
    /// Inserts an element, failing only when the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `Err(e)` with the rejected element if and only if the
    /// queue was full at some point during the call. Unbounded queues
    /// never fail.
    fn offer(&self, e: T) -> Result<(), T>;

    /// Inserts an element, but may fail spuriously.
    ///
    /// # Errors
    ///
    /// Returns `Err(e)` when the target slot has not yet been released
    /// by a consumer, without checking whether the queue is actually
    /// full. Cheaper than [`offer`](Self::offer) under contention.
    fn relaxed_offer(&self, e: T) -> Result<(), T>;

    /// Inserts up to `limit` supplied elements, returning the number
    /// actually inserted.
    ///
    /// The default stops at the first rejected insertion, which makes it
    /// exact for unbounded queues; bounded queues override it with a
    /// batched variant that claims slots before drawing from the
    /// supplier.
    fn fill<S: FnMut() -> T>(&self, mut supplier: S, limit: usize) -> usize {
        for produced in 0..limit {
            if self.relaxed_offer(supplier()).is_err() {
                return produced;
            }
        }
        limit
    }
}

/// The polling side of a queue.
pub trait QueueConsumer<T: Send>: MessagePassingQueue {
    /// Removes and returns the next element, or `None` only if the queue
    /// was empty at some point during the call.
    ///
    /// May briefly spin when an insertion is mid-publication.
    fn poll(&self) -> Option<T>;

    /// Removes and returns the next element, or `None` as soon as the
    /// next slot is not visibly ready. Never spins.
    fn relaxed_poll(&self) -> Option<T>;

    /// Returns a copy of the next element without removing it, or `None`
    /// only if the queue was empty at some point during the call.
    fn peek(&self) -> Option<T>
    where
        T: Copy;

    /// Returns a copy of the next element without removing it, or `None`
    /// as soon as the next slot is not visibly ready. Never spins.
    fn relaxed_peek(&self) -> Option<T>
    where
        T: Copy;

    /// Removes up to `limit` elements, feeding each to `consumer`, and
    /// returns the number removed.
    fn drain<C: FnMut(T)>(&self, consumer: C, limit: usize) -> usize;

    /// Removes elements until emptiness is observed, feeding each to
    /// `consumer`, and returns the number removed.
    ///
    /// Concurrent producers may keep the loop alive; it returns as soon
    /// as one relaxed poll comes back empty.
    fn drain_all<C: FnMut(T)>(&self, mut consumer: C) -> usize {
        let mut drained = 0;
        while let Some(e) = self.relaxed_poll() {
            consumer(e);
            drained += 1;
        }
        drained
    }

    /// Polls elements into `consumer` until `exit` says stop, idling via
    /// `wait` between empty observations.
    ///
    /// The idle counter resets on every productive poll, so `wait` sees
    /// how long the queue has been continuously empty.
    fn drain_until<C, W, X>(&self, mut consumer: C, wait: &W, exit: &X)
    where
        C: FnMut(T),
        W: WaitStrategy + ?Sized,
        X: ExitCondition + ?Sized,
    {
        let mut idle = 0;
        while exit.keep_running() {
            match self.relaxed_poll() {
                Some(e) => {
                    idle = 0;
                    consumer(e);
                }
                None => idle = wait.idle(idle),
            }
        }
    }
}
