//! Cross-cluster relations (`preprocess` stage)
//!
//! Every song sits in one leaf cluster per model. Two clusters are related
//! by the songs they share: for each song and every ordered pair `(i, j)` of
//! its clusters, `counts[i][j]` is incremented (diagonal included). Rows are
//! then divided by their own maximum, so each row peaks at exactly 1.0.
//!
//! Matrix indices are `id - min_id`, the matrix size is
//! `max_id - min_id + 1`. Every ID in that range must be in use.

use crate::combiner::LeafId;
use crate::error::{MapError, MapResult};
use crate::metadata::ContainingClusters;
use arbor_common::Error;
use std::collections::BTreeSet;
use tracing::info;

/// Raw co-occurrence counts
#[derive(Debug, Clone, PartialEq)]
pub struct CoOccurrence {
    min_id: LeafId,
    counts: Vec<Vec<u64>>,
}

impl CoOccurrence {
    /// Count shared songs for every pair of clusters
    pub fn from_containing_clusters(map: &ContainingClusters) -> MapResult<Self> {
        let Some(expected) = map.values().next().map(Vec::len) else {
            return Err(Error::InvalidInput("Containing-clusters map is empty".into()).into());
        };
        for (song, clusters) in map {
            if clusters.len() != expected {
                return Err(MapError::InconsistentMembership {
                    song: song.clone(),
                    found: clusters.len(),
                    expected,
                });
            }
        }

        let ids: BTreeSet<LeafId> = map.values().flatten().copied().collect();
        let (Some(&min_id), Some(&max_id)) = (ids.first(), ids.last()) else {
            return Err(Error::InvalidInput("Songs are in no cluster".into()).into());
        };

        // An unused ID inside the range leaves an all-zero row; reject it
        // before the matrix is allocated
        if max_id - min_id >= ids.len() as LeafId {
            let unused = (min_id..=max_id)
                .zip(&ids)
                .find(|(expected, id)| *expected != **id)
                .map(|(expected, _)| expected)
                .unwrap_or(max_id);
            return Err(MapError::EmptyRelationRow {
                cluster_id: unused as i64,
            });
        }
        let size = ids.len();

        let mut counts = vec![vec![0u64; size]; size];
        for clusters in map.values() {
            for &i in clusters {
                for &j in clusters {
                    counts[(i - min_id) as usize][(j - min_id) as usize] += 1;
                }
            }
        }
        Ok(Self { min_id, counts })
    }

    pub fn min_id(&self) -> LeafId {
        self.min_id
    }

    pub fn size(&self) -> usize {
        self.counts.len()
    }

    /// Shared song count of two cluster IDs
    pub fn count(&self, i: LeafId, j: LeafId) -> u64 {
        let index = |id: LeafId| id.checked_sub(self.min_id).map(|d| d as usize);
        match (index(i), index(j)) {
            (Some(i), Some(j)) => self
                .counts
                .get(i)
                .and_then(|row| row.get(j))
                .copied()
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// Divide each row by its maximum
    pub fn normalized(&self) -> MapResult<Vec<Vec<f64>>> {
        self.counts
            .iter()
            .enumerate()
            .map(|(index, row)| {
                let max = row.iter().copied().max().unwrap_or(0);
                if max == 0 {
                    return Err(MapError::EmptyRelationRow {
                        cluster_id: (self.min_id + index as LeafId) as i64,
                    });
                }
                Ok(row.iter().map(|&c| c as f64 / max as f64).collect())
            })
            .collect()
    }
}

/// Row-normalised relation matrix of all leaf clusters
pub fn cluster_relations(map: &ContainingClusters) -> MapResult<Vec<Vec<f64>>> {
    info!("Calculate all cluster relations for {} songs", map.len());
    CoOccurrence::from_containing_clusters(map)?.normalized()
}
