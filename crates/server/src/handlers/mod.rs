//! HTTP request handlers.

pub mod admin;
pub mod common;
pub mod download;
pub mod files;
pub mod stats;
pub mod upload;

pub use admin::*;
pub use common::*;
pub use download::*;
pub use files::*;
pub use stats::*;
pub use upload::*;
