//! HTTP server for the Larder deduplicating file store.
//!
//! This crate provides the HTTP adapter over the ledger and blob store:
//! - Multipart upload with spooling, hashing and deduplication
//! - File listing, retrieval, deletion and verified download
//! - Savings statistics
//! - Blob reclamation (immediate and background) and refcount audits

pub mod error;
pub mod handlers;
pub mod ingest;
pub mod metrics;
pub mod reclaim;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use reclaim::{ReclaimReport, Reclaimer};
pub use routes::create_router;
pub use state::AppState;
