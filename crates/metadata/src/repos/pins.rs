//! Upload pin repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Identifier of an upload pin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PinId(pub Uuid);

impl PinId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PinId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[async_trait]
pub trait PinRepo: Send + Sync {
    /// Drop a pin after a failed ingest. Missing pins are ignored.
    async fn release_pin(&self, pin: PinId) -> MetadataResult<()>;

    /// Delete pins that expired before `now`, returning how many were removed.
    async fn delete_expired_pins(&self, now: OffsetDateTime) -> MetadataResult<u64>;
}
