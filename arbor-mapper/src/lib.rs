//! arbor-mapper: hierarchical song-space mapping pipeline
//!
//! Turns per-song audio feature vectors into a navigable 3-D tree:
//!
//! 1. [`cleaner`]: split a flat feature export into one table per model
//! 2. [`reduction`]: t-SNE projection to X, Y, Z
//! 3. [`clustering`]: recursive spectral clustering into a label hierarchy
//! 4. [`combiner`]: branch tree with render parameters, plus leaf clusters
//!    ([`preprocessor`] scales leaf sizes)
//! 5. [`metadata`]: song → containing clusters, joined with display metadata
//! 6. [`relations`]: co-occurrence matrix between leaf clusters
//!
//! [`pipeline`] runs any contiguous range of these stages and persists every
//! intermediate result through [`arbor_common::store::TableStore`].

pub mod cleaner;
pub mod clustering;
pub mod combiner;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod preprocessor;
pub mod reduction;
pub mod registry;
pub mod relations;
pub mod topology;

pub use error::{MapError, MapResult, SkippedModel};
pub use pipeline::{Pipeline, RunOptions, RunSummary, Stage};
pub use registry::ModelRegistry;
