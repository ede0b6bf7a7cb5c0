//! Storage savings repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use larder_core::Savings;

#[async_trait]
pub trait StatsRepo: Send + Sync {
    /// Compute savings from the live tables.
    ///
    /// Logical bytes sum every file; unique bytes sum blobs that still have
    /// references. Both sums come from one statement so they describe the
    /// same snapshot.
    async fn get_savings(&self) -> MetadataResult<Savings>;
}
