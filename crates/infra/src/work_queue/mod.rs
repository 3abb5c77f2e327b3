//! Infrastructure work queue implementations.
//!
//! The work queue abstraction lives in `deferq-queue` as pure mechanics.
//! This module provides infrastructure-backed implementations (e.g. Redis).

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsError, RedisStreamsWorkQueue};
