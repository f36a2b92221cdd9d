// src/jobs/mod.rs

//! Concurrent job execution
//!
//! [`Scheduler`] runs work on bounded queues or detached threads and offers
//! a process-wide drain barrier. [`Aggregator`] gathers the results of a
//! batch of jobs in request order.

mod aggregator;
mod scheduler;

pub use aggregator::{Aggregator, Completion};
pub use scheduler::{Queue, Scheduler};
