//! Dataset catalog ingestion.
//!
//! Turns a set of paths plus a source type into dataset and file rows:
//! paths are glob-expanded and walked, each file is handed to the
//! source-type adapter for metadata extraction (fanned out across a worker
//! pool), and the resulting records are grouped into datasets and written
//! to the store in one batch.

pub mod adapter;
pub mod cmip6;
pub mod error;
pub mod ingest;
pub mod nc;
pub mod obs4mips;
pub mod walk;

pub use adapter::{DatasetAdapter, FileRecord, adapter_for};
pub use error::{Error, Result};
pub use ingest::{IngestOptions, IngestSummary, ingest};
