//! Extract, normalize and load package engine for the sluice pipeline.
//!
//! Sources and resources are drained into load packages ([`extract`]),
//! flattened into typed relational tables ([`normalize`]) and delivered to a
//! [`Destination`] job by job ([`load`]). A [`Pipeline`] ties the steps
//! together and persists schemas and state between runs.

#![warn(clippy::pedantic)]

pub mod config;
pub mod destination;
pub mod errors;
pub mod extract;
pub mod load;
pub mod normalize;
pub mod pipeline;
pub mod result;

// Re-export public API for convenience
pub use destination::{Destination, FilesystemDestination, WriteJob};
pub use errors::{retry_load, PipelineError, Step};
pub use extract::{DataItem, ExtractInput, PipeItem, Resource, ResourceContext, Source, TableNamePolicy};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineRegistry};
pub use result::{ExtractInfo, LoadInfo, NormalizeInfo, PackageLoadInfo};
