//! Error types for arbor-mapper
//!
//! Two severities matter to the stage runner:
//! - Per-model failures ([`MapError::is_model_recoverable`]) skip the model
//!   and let the run continue.
//! - Everything else aborts the run.

use thiserror::Error;

/// Mapping pipeline error type
#[derive(Debug, Error)]
pub enum MapError {
    /// Not enough songs for the embedding algorithm
    #[error("Too few samples: {found} songs (need at least {required}) {detail}")]
    TooFewSamples {
        found: usize,
        required: usize,
        detail: String,
    },

    /// Eigen-solver did not converge while clustering a group
    #[error("Spectral clustering did not converge for a group of {group_size} songs at depth {depth}")]
    NonConvergence { depth: usize, group_size: usize },

    /// Tree topology file is malformed or too short
    #[error("Invalid tree topology: {0}")]
    InvalidTopology(String),

    /// Songs belong to different numbers of clusters
    #[error("Inconsistent cluster membership: song '{song}' is in {found} clusters, expected {expected}")]
    InconsistentMembership {
        song: String,
        found: usize,
        expected: usize,
    },

    /// A relation matrix row has no co-occurrences
    #[error("Empty cluster / no co-occurrence data for cluster {cluster_id}")]
    EmptyRelationRow { cluster_id: i64 },

    /// Unknown stage name or bad stage range
    #[error("Invalid stage: {0}")]
    InvalidStage(String),

    /// arbor-common error
    #[error("Common error: {0}")]
    Common(#[from] arbor_common::Error),
}

impl MapError {
    /// Whether the error only affects the model being processed
    pub fn is_model_recoverable(&self) -> bool {
        matches!(
            self,
            MapError::TooFewSamples { .. } | MapError::NonConvergence { .. }
        )
    }
}

/// Result type for mapping operations
pub type MapResult<T> = Result<T, MapError>;

/// A model left out of a stage because of a recoverable failure
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedModel {
    pub model: String,
    pub stage: &'static str,
    pub reason: String,
}

impl SkippedModel {
    pub fn new(model: &str, stage: &'static str, error: &MapError) -> Self {
        Self {
            model: model.to_string(),
            stage,
            reason: error.to_string(),
        }
    }
}
