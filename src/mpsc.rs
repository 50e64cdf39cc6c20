//! Unbounded lock-free MPSC linked queue.
//!
//! A dynamically sized queue for handing elements from any number of
//! producer threads to a single consumer thread.
//!
//! # Overview
//!
//! - [`Producer`] - Write end (clone it for additional producers)
//! - [`Consumer`] - Read end (single consumer per queue)
//! - Lock-free: no mutexes or syscalls anywhere
//!
//! # Example
//!
//! ```
//! use conduit::mpsc;
//!
//! let (producer, consumer) = mpsc::channel::<u64>();
//!
//! // Producer threads
//! producer.push(1);
//! producer.clone().push(2);
//!
//! // Consumer thread
//! assert_eq!(consumer.pop(), Some(1));
//! assert_eq!(consumer.pop(), Some(2));
//! assert_eq!(consumer.pop(), None);
//! ```
//!
//! # Algorithm
//!
//! A dummy-headed linked list: producers swing the tail reference with an
//! atomic swap and publish the new node as the old tail's `next`; the
//! consumer chases `next` links, moving each element out. Retired nodes
//! go through epoch-based reclamation so diagnostics like
//! [`size`](crate::queue::MessagePassingQueue::size) can traverse the
//! list from any thread.
//!
//! The strict [`poll`](crate::queue::QueueConsumer::poll) briefly spins
//! when it catches an offer between the tail swap and the link
//! publication; the relaxed variant returns `None` instead.

mod linked;

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use minstant::Instant;

use crate::queue::wait::Timeout;
use crate::queue::{MessagePassingQueue, QueueConsumer, QueueProducer};
use crate::trace;
use self::linked::LinkedQueue;

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the MPSC queue.
///
/// Clone freely: any number of producers may push concurrently, each from
/// its own handle.
///
/// # Thread Safety
///
/// `Producer` is [`Send`] but **not** [`Sync`]:
/// - Can transfer ownership to another thread
/// - Cannot share `&Producer` across threads; clone a handle per thread
pub struct Producer<T: Send> {
    queue: Arc<LinkedQueue<T>>,
    _unsync: PhantomUnsync,
}

impl<T: Send> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            _unsync: PhantomData,
        }
    }
}

/// Read end of the MPSC queue.
///
/// Only one consumer exists per queue—the type is neither `Clone` nor
/// `Sync`, so the single-consumer invariant holds by construction.
pub struct Consumer<T: Send> {
    queue: Arc<LinkedQueue<T>>,
    _unsync: PhantomUnsync,
}

/// Creates a new unbounded MPSC channel.
///
/// Returns a `(Producer, Consumer)` pair. Clone the producer for
/// additional writers; the consumer is unique.
#[must_use]
pub fn channel<T: Send>() -> (Producer<T>, Consumer<T>) {
    let queue = Arc::new(LinkedQueue::new());

    let producer = Producer {
        queue: Arc::clone(&queue),
        _unsync: PhantomData,
    };

    let consumer = Consumer {
        queue,
        _unsync: PhantomData,
    };

    (producer, consumer)
}

impl<T: Send> Producer<T> {
    /// Appends an element. Never fails: the queue grows as needed.
    #[inline]
    pub fn push(&self, e: T) {
        self.queue.offer(e);
    }
}

impl<T: Send> Consumer<T> {
    /// Removes and returns the next element, or `None` if the queue was
    /// observed empty.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: this handle is the unique consumer end.
        unsafe { self.queue.poll() }
    }

    /// Spins until an element is available, then pops.
    ///
    /// Returns `None` on timeout.
    #[must_use]
    pub fn pop_blocking(&self, timeout: Timeout) -> Option<T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            if let Some(e) = self.pop() {
                return Some(e);
            }
            if let Some(dl) = deadline
                && Instant::now() > dl
            {
                trace::trace!(size = self.queue.size(), "pop_blocking timed out");
                return None;
            }
            std::hint::spin_loop();
        }
    }
}

impl<T: Send> MessagePassingQueue for Producer<T> {
    fn capacity(&self) -> Option<usize> {
        None
    }

    fn size(&self) -> usize {
        self.queue.size()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T: Send> QueueProducer<T> for Producer<T> {
    fn offer(&self, e: T) -> Result<(), T> {
        self.queue.offer(e);
        Ok(())
    }

    fn relaxed_offer(&self, e: T) -> Result<(), T> {
        self.queue.offer(e);
        Ok(())
    }
}

impl<T: Send> MessagePassingQueue for Consumer<T> {
    fn capacity(&self) -> Option<usize> {
        None
    }

    fn size(&self) -> usize {
        self.queue.size()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T: Send> QueueConsumer<T> for Consumer<T> {
    fn poll(&self) -> Option<T> {
        // SAFETY: this handle is the unique consumer end.
        unsafe { self.queue.poll() }
    }

    fn relaxed_poll(&self) -> Option<T> {
        // SAFETY: this handle is the unique consumer end.
        unsafe { self.queue.relaxed_poll() }
    }

    fn peek(&self) -> Option<T>
    where
        T: Copy,
    {
        // SAFETY: this handle is the unique consumer end.
        unsafe { self.queue.peek() }
    }

    fn relaxed_peek(&self) -> Option<T>
    where
        T: Copy,
    {
        // SAFETY: this handle is the unique consumer end.
        unsafe { self.queue.relaxed_peek() }
    }

    fn drain<C: FnMut(T)>(&self, mut consumer: C, limit: usize) -> usize {
        // SAFETY: this handle is the unique consumer end.
        unsafe { self.queue.drain(&mut consumer, limit) }
    }
}

impl<T: Send> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("size", &self.queue.size())
            .finish()
    }
}

impl<T: Send> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("size", &self.queue.size())
            .finish()
    }
}
