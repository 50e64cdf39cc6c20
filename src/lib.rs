//! Lock-free message-passing queues.
//!
//! This crate provides concurrent queues that hand owned elements between
//! threads without mutual exclusion:
//!
//! - [`mpmc::ArrayQueue`] - a bounded multi-producer multi-consumer queue
//!   over a fixed ring of sequence-tagged slots
//! - [`mpsc::channel`] - an unbounded multi-producer single-consumer
//!   linked queue, split into [`mpsc::Producer`] and [`mpsc::Consumer`]
//!   handle ends
//!
//! Both follow the contract in [`queue`]: strict `offer`/`poll`/`peek`
//! with exact emptiness and fullness reporting, relaxed counterparts that
//! may fail spuriously but never block, and bulk `drain`/`fill` driven by
//! caller-supplied closures. The uncapped loop variants compose with the
//! [`queue::wait`] strategies and exit conditions.
//!
//! All operations are lock-free; the only waiting anywhere is bounded
//! spinning on a memory location, never an OS primitive.

#![warn(missing_docs)]

pub mod mpmc;
pub mod mpsc;
pub mod queue;
pub mod trace;

pub use self::queue::{MessagePassingQueue, QueueConsumer, QueueProducer};
