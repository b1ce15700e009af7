//! Pipeline state persistence for the sluice engine.
//!
//! Provides the [`StateBackend`] trait and a [`SqliteStateBackend`]
//! implementation storing the pipeline state document and its schemas.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod sqlite;

pub use backend::StateBackend;
pub use error::StateError;
pub use sqlite::SqliteStateBackend;

/// Common imports for state backend users.
pub mod prelude {
    pub use crate::backend::StateBackend;
    pub use crate::error::StateError;
    pub use crate::sqlite::SqliteStateBackend;
    pub use sluice_types::ids::PipelineName;
    pub use sluice_types::schema::Schema;
    pub use sluice_types::state::PipelineState;
}
