//! Scan Data Crate
//!
//! Mesh snapshot processing and file export for reconstructed surfaces.
//! This crate is engine-agnostic: it only sees vertex positions.
//!
//! ## Modules
//!
//! - [`vertices`]: total ordering and exact-equality deduplication of vertex lists
//! - [`export`]: lock-file guarded writing of vertex lists to plain text

pub mod export;
pub mod vertices;

pub use export::{ExportError, ExportJob, ExportSummary, is_export_in_progress, lock_path_for};
pub use vertices::{VertexKey, sort_and_dedup};
