//! An asynchronous book-analysis job service: a bounded-concurrency
//! processing queue with error-specific retry policy, a durable job store,
//! signed webhook notifications, and startup recovery of stranded jobs.

pub mod analyzer;
pub mod backoff;
pub mod job;
pub mod prelude;
pub mod queue;
pub mod recovery;
pub mod service;
pub mod store;
pub mod webhook;
