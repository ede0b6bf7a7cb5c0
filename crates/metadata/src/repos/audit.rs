//! Reference count audit.

use crate::error::MetadataResult;
use async_trait::async_trait;
use larder_core::ContentHash;
use serde::{Deserialize, Serialize};

/// Whether an audit only reports or also repairs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditMode {
    #[default]
    DryRun,
    Correct,
}

/// A blob whose stored `ref_count` disagrees with its file rows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RefcountDiscrepancy {
    pub digest: ContentHash,
    pub recorded: u64,
    pub actual: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RefcountAudit {
    pub mode: AuditMode,
    pub blobs_checked: u64,
    pub discrepancies: Vec<RefcountDiscrepancy>,
    /// Rows rewritten; always zero in dry-run mode.
    pub corrected: u64,
}

#[async_trait]
pub trait AuditRepo: Send + Sync {
    /// Compare every blob's `ref_count` with `COUNT(files)` for its digest.
    async fn audit_refcounts(&self, mode: AuditMode) -> MetadataResult<RefcountAudit>;
}
