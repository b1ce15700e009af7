//! Shared sluice data model.
//!
//! Schema, state document, load package and destination error types used by
//! every other crate in the workspace. No I/O happens here.

#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod naming;
pub mod package;
pub mod schema;
pub mod state;

pub use error::{BackoffClass, DestinationError, ErrorCategory};
pub use ids::{LoadId, PipelineName};
pub use schema::{Column, ColumnHint, DataType, Schema, SchemaError, SchemaUpdate, Table, WriteDisposition};
pub use state::PipelineState;

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
