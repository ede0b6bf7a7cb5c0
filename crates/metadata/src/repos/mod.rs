//! Repository traits for ledger operations.

pub mod audit;
pub mod blobs;
pub mod files;
pub mod pins;
pub mod stats;

pub use audit::{AuditMode, AuditRepo, RefcountAudit, RefcountDiscrepancy};
pub use blobs::BlobRepo;
pub use files::{CreatedFile, DeletedFile, FileRepo, IngestStart};
pub use pins::{PinId, PinRepo};
pub use stats::StatsRepo;
