//! Load packages: on-disk storage and the loader.

pub(crate) mod loader;
pub mod storage;
