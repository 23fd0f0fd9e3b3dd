//! Workflow engine, worker pool, and rate limiting.
//!
//! A workflow is an ordered list of stages, each with `setup`, `execute`,
//! and `teardown` hooks sharing a typed run context. Stage jobs fan out on a
//! worker pool with a shared batch outcome; copy throughput is bounded by
//! token buckets.

pub mod context;
pub mod engine;
pub mod pool;
pub mod ratelimit;

pub use context::RunContext;
pub use engine::{Stage, Workflow};
pub use pool::WorkerPool;
pub use ratelimit::TokenBucket;
