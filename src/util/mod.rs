pub mod async_queue;
pub mod backoff;

pub use async_queue::{AsyncQueue, DelayedTask, TimerId};
pub use backoff::{ExponentialBackoff, RetrySettings};
