//! Core unbounded MPSC linked-queue algorithm.
//!
//! A dummy-headed singly linked list. Producers append by swinging the
//! producer reference to a fresh node and then publishing it as the old
//! tail's `next`. The single consumer advances the consumer reference
//! along `next` links, moving each element out as it goes.
//!
//! Retired nodes are reclaimed through epoch-based reclamation so that
//! diagnostic traversals ([`LinkedQueue::size`]) may run on any thread
//! while the consumer concurrently unlinks nodes.
//!
//! # Safety
//!
//! The consuming methods are unsafe because they require the caller to
//! uphold the single-consumer invariant: at most one thread may be
//! polling, peeking or draining at any time.

use std::cell::UnsafeCell;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

/// A linked-queue cell.
///
/// The consumer-head node always has a vacant value (the "dummy" whose
/// element has already been moved out); every other reachable node holds
/// exactly one element. A consumed node's `next` links to itself, which
/// both releases its predecessor for reclamation and terminates
/// concurrent traversals that raced past it.
struct Node<T> {
    value: UnsafeCell<Option<T>>,
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn vacant() -> Self {
        Self {
            value: UnsafeCell::new(None),
            next: Atomic::null(),
        }
    }

    fn holding(e: T) -> Self {
        Self {
            value: UnsafeCell::new(Some(e)),
            next: Atomic::null(),
        }
    }
}

// SAFETY: `value` is written by exactly one producer before the node is
// published and vacated by the single consumer after it synchronizes on
// the `next` link; `next` is atomic.
unsafe impl<T: Send> Send for Node<T> {}
unsafe impl<T: Send> Sync for Node<T> {}

/// Producer-side reference, alone on its cache line.
#[repr(C)]
#[repr(align(64))]
struct ProducerState<T> {
    /// The most recently appended node. Swapped by producers.
    node: Atomic<Node<T>>,
}

/// Consumer-side reference, alone on its cache line.
#[repr(C)]
#[repr(align(64))]
struct ConsumerState<T> {
    /// The current dummy node. Written only by the consumer.
    node: Atomic<Node<T>>,
}

/// Core unbounded MPSC queue state.
///
/// Shared between the handle ends in [`crate::mpsc`]; all single-consumer
/// discipline is enforced there.
pub(crate) struct LinkedQueue<T> {
    producer: ProducerState<T>,
    consumer: ConsumerState<T>,
}

impl<T: Send> LinkedQueue<T> {
    pub(crate) fn new() -> Self {
        let queue = Self {
            producer: ProducerState {
                node: Atomic::null(),
            },
            consumer: ConsumerState {
                node: Atomic::null(),
            },
        };
        // SAFETY: the queue is not shared yet; nothing can observe the
        // references mid-initialization.
        let guard = unsafe { epoch::unprotected() };
        let dummy = Owned::new(Node::vacant()).into_shared(guard);
        queue.producer.node.store(dummy, Ordering::Relaxed);
        queue.consumer.node.store(dummy, Ordering::Relaxed);
        queue
    }

    /// Appends an element. Safe from any thread; never fails.
    pub(crate) fn offer(&self, e: T) {
        let guard = &epoch::pin();
        let node = Owned::new(Node::holding(e)).into_shared(guard);
        // Swing the tail first; the `next` publication below is what makes
        // the element reachable for the consumer.
        let prev = self.producer.node.swap(node, Ordering::AcqRel, guard);
        // SAFETY: producers never retire nodes and the guard pins the
        // epoch, so the previous tail is still alive.
        unsafe { prev.deref() }.next.store(node, Ordering::Release);
    }

    /// Removes and returns the next element, or `None` only if the queue
    /// was observed empty (consumer and producer references equal).
    ///
    /// Spins while an in-flight offer has swung the tail but not yet
    /// published the link.
    ///
    /// # Safety
    ///
    /// Caller must be the unique consumer.
    pub(crate) unsafe fn poll(&self) -> Option<T> {
        let guard = &epoch::pin();
        let head = self.consumer.node.load(Ordering::Relaxed, guard);
        // SAFETY: the consumer reference is never null; the guard keeps
        // the node alive.
        let head_ref = unsafe { head.deref() };
        let mut next = head_ref.next.load(Ordering::Acquire, guard);
        if next.is_null() {
            if head == self.producer.node.load(Ordering::Acquire, guard) {
                return None;
            }
            next = Self::spin_for_next(head_ref, guard);
        }
        // SAFETY: single consumer per our own contract.
        Some(unsafe { self.advance(head, next, guard) })
    }

    /// Returns a copy of the next element without removing it, with the
    /// same emptiness and spinning behavior as [`poll`](Self::poll).
    ///
    /// # Safety
    ///
    /// Caller must be the unique consumer.
    pub(crate) unsafe fn peek(&self) -> Option<T>
    where
        T: Copy,
    {
        let guard = &epoch::pin();
        let head = self.consumer.node.load(Ordering::Relaxed, guard);
        // SAFETY: the consumer reference is never null.
        let head_ref = unsafe { head.deref() };
        let mut next = head_ref.next.load(Ordering::Acquire, guard);
        if next.is_null() {
            if head == self.producer.node.load(Ordering::Acquire, guard) {
                return None;
            }
            next = Self::spin_for_next(head_ref, guard);
        }
        // SAFETY: only the unique consumer vacates values, and we are it,
        // so the element stays in place while we copy it.
        unsafe { (*next.deref().value.get()).as_ref().copied() }
    }

    /// Removes and returns the next element, or `None` as soon as the
    /// head's `next` link is not visible. Never spins.
    ///
    /// # Safety
    ///
    /// Caller must be the unique consumer.
    pub(crate) unsafe fn relaxed_poll(&self) -> Option<T> {
        let guard = &epoch::pin();
        let head = self.consumer.node.load(Ordering::Relaxed, guard);
        // SAFETY: the consumer reference is never null.
        let head_ref = unsafe { head.deref() };
        let next = head_ref.next.load(Ordering::Acquire, guard);
        if next.is_null() {
            return None;
        }
        // SAFETY: single consumer per our own contract.
        Some(unsafe { self.advance(head, next, guard) })
    }

    /// Returns a copy of the next element without removing it, or `None`
    /// as soon as the link is not visible. Never spins.
    ///
    /// # Safety
    ///
    /// Caller must be the unique consumer.
    pub(crate) unsafe fn relaxed_peek(&self) -> Option<T>
    where
        T: Copy,
    {
        let guard = &epoch::pin();
        let head = self.consumer.node.load(Ordering::Relaxed, guard);
        // SAFETY: the consumer reference is never null.
        let next = unsafe { head.deref() }.next.load(Ordering::Acquire, guard);
        if next.is_null() {
            return None;
        }
        // SAFETY: as in `peek`.
        unsafe { (*next.deref().value.get()).as_ref().copied() }
    }

    /// Removes up to `limit` elements, feeding each to `consumer`.
    ///
    /// Walks `next` links until a missing link is observed, so like
    /// [`relaxed_poll`](Self::relaxed_poll) it never spins.
    ///
    /// # Safety
    ///
    /// Caller must be the unique consumer.
    pub(crate) unsafe fn drain<C: FnMut(T)>(&self, consumer: &mut C, limit: usize) -> usize {
        let guard = &epoch::pin();
        let mut head = self.consumer.node.load(Ordering::Relaxed, guard);
        for drained in 0..limit {
            // SAFETY: the consumer reference is never null and `head`
            // tracks it.
            let next = unsafe { head.deref() }.next.load(Ordering::Acquire, guard);
            if next.is_null() {
                return drained;
            }
            // SAFETY: single consumer per our own contract.
            let value = unsafe { self.advance(head, next, guard) };
            head = next;
            consumer(value);
        }
        limit
    }

    /// Best-effort element count by traversal. Safe from any thread.
    ///
    /// Non-linearizable: the walk races both ends and may under- or
    /// over-estimate by in-flight operations. Diagnostic use only.
    pub(crate) fn size(&self) -> usize {
        let guard = &epoch::pin();
        // Consumer reference first: sampled the other way round, the
        // consumer could overtake the producer sample and the walk would
        // chase nodes that are no longer between the two.
        let mut chaser = self.consumer.node.load(Ordering::Acquire, guard);
        let producer = self.producer.node.load(Ordering::Acquire, guard);
        let mut size = 0usize;
        while chaser != producer && !chaser.is_null() && size < usize::MAX {
            // SAFETY: chaser is non-null and pinned by the guard.
            let next = unsafe { chaser.deref() }.next.load(Ordering::Acquire, guard);
            if next == chaser {
                // The node was consumed mid-walk; report what we saw.
                return size;
            }
            chaser = next;
            size += 1;
        }
        size
    }

    /// Whether the queue was empty at the observation point.
    /// Safe from any thread.
    pub(crate) fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        self.consumer.node.load(Ordering::Acquire, guard)
            == self.producer.node.load(Ordering::Acquire, guard)
    }

    fn spin_for_next<'g>(node: &Node<T>, guard: &'g Guard) -> Shared<'g, Node<T>> {
        loop {
            let next = node.next.load(Ordering::Acquire, guard);
            if !next.is_null() {
                return next;
            }
            std::hint::spin_loop();
        }
    }

    /// Moves the consumer reference from `head` to `next`, vacating the
    /// new head's value and retiring the old head.
    ///
    /// # Safety
    ///
    /// Caller must be the unique consumer; `next` must be the published
    /// successor of `head`.
    unsafe fn advance<'g>(
        &self,
        head: Shared<'g, Node<T>>,
        next: Shared<'g, Node<T>>,
        guard: &'g Guard,
    ) -> T {
        // SAFETY: next is a published node, pinned by the guard.
        let next_ref = unsafe { next.deref() };
        // Vacate the element: the consumer head is always the node whose
        // value has already been moved out.
        let value = unsafe { (*next_ref.value.get()).take() }
            .expect("non-head node always holds an element");
        // Self-link the retired head; concurrent traversals that still
        // hold it terminate on the cycle.
        // SAFETY: head is pinned by the guard.
        unsafe { head.deref() }.next.store(head, Ordering::Release);
        // Release so traversals starting from the new reference see the
        // node's fields.
        self.consumer.node.store(next, Ordering::Release);
        // SAFETY: the retired head is no longer reachable from the
        // consumer reference; pinned traversals keep their epoch alive.
        unsafe { guard.defer_destroy(head) };
        value
    }
}

impl<T> Drop for LinkedQueue<T> {
    fn drop(&mut self) {
        // SAFETY: exclusive access; the chain from the consumer reference
        // holds the dummy plus every unconsumed node, none of which have
        // been handed to the reclaimer.
        unsafe {
            let guard = epoch::unprotected();
            let mut node = self.consumer.node.load(Ordering::Relaxed, guard);
            while !node.is_null() {
                let next = node.deref().next.load(Ordering::Relaxed, guard);
                drop(node.into_owned());
                node = next;
            }
        }
    }
}
