//! Delay queue item storage boundary.
//!
//! `ItemStore` is the narrow contract the delay queue needs from a
//! key-value store; adapters live next to it.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryItemStore;
pub use postgres::PostgresItemStore;
pub use r#trait::{CounterField, ItemStore, StoreError};
