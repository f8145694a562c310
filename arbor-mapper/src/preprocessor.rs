//! Leaf cluster statistics
//!
//! Scales each leaf's song count to `[0, 1]` so the renderer can size leaves
//! relative to each other:
//!
//! ```text
//! lin_scale = (n_songs - songs_min) / (songs_max - songs_min)
//! cub_scale = lin_scale^(1/3)
//! ```
//!
//! An empty leaf would pin `songs_min` to 0, so the smallest nonzero count
//! is used as the floor instead. Empty leaves then fall below the floor and
//! are clamped to 0.0.

use crate::combiner::{LeafDocument, LeafStats};
use tracing::{debug, info};

/// Count bounds used for scaling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountRange {
    pub songs_min: usize,
    pub songs_max: usize,
}

impl CountRange {
    /// Bounds of `counts`; `None` when there are no leaves
    pub fn from_counts(counts: &[usize]) -> Option<Self> {
        let songs_max = counts.iter().copied().max()?;
        let mut songs_min = counts.iter().copied().min()?;
        if songs_min == 0 {
            songs_min = counts
                .iter()
                .copied()
                .filter(|&n| n > 0)
                .min()
                .unwrap_or(0);
        }
        Some(Self {
            songs_min,
            songs_max,
        })
    }

    pub fn scale(&self, n_songs: usize) -> LeafStats {
        if self.songs_max == self.songs_min {
            return LeafStats {
                lin_scale: 1.0,
                cub_scale: 1.0,
            };
        }
        let lin_scale = ((n_songs as f64 - self.songs_min as f64)
            / (self.songs_max as f64 - self.songs_min as f64))
            .max(0.0);
        LeafStats {
            lin_scale,
            cub_scale: lin_scale.cbrt(),
        }
    }
}

/// Attach `stats` to every leaf cluster
pub fn append_leaf_stats(leaves: &mut LeafDocument) {
    info!("Appending statistics to all {} leaf clusters", leaves.len());
    let counts: Vec<usize> = leaves.values().map(|leaf| leaf.songs.len()).collect();
    let Some(range) = CountRange::from_counts(&counts) else {
        return;
    };
    debug!(
        songs_min = range.songs_min,
        songs_max = range.songs_max,
        "Leaf size range"
    );

    for leaf in leaves.values_mut() {
        leaf.stats = Some(range.scale(leaf.songs.len()));
    }
}
