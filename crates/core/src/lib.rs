//! `deferq-core` — scheduling record and identifiers.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod item;

pub use error::{DomainError, DomainResult};
pub use id::ItemId;
pub use item::{CLAIMED, DEFAULT_PARTITION, DelayQueueItem, UNCLAIMED, now_unix};
