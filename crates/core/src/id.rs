//! Identifier of a delay queue item.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Opaque, globally unique identifier of a `DelayQueueItem`.
///
/// Stored as a string so that store adapters can use it directly as a
/// primary key. Freshly generated ids are random (UUIDv4, simple hex form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Generate a new random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wrap an id read back from a store (no validation).
    pub fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ItemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ItemId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ItemId {
    type Err = DomainError;

    /// Accepts any non-blank string; ids are opaque to this crate.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_id("ItemId: empty"));
        }
        Ok(Self(trimmed.to_string()))
    }
}
