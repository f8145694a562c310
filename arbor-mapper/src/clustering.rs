//! Hierarchical spectral clustering (`cluster` stage)
//!
//! Splits each model's 3-D coordinates into a fixed-depth tree of cluster
//! labels. Depth 0 clusters every song into `k_0` groups; each resulting group
//! is clustered again into `k_1` sub-groups, and so on down to the last
//! branching factor.
//!
//! # Label buffer
//! One label buffer (`rows × depths`, initialised to -1) is owned by the
//! top-level call. Recursion passes slices of row indices and writes labels
//! straight into that buffer, so labels of earlier depths are never touched
//! by deeper levels.
//!
//! # Degenerate groups
//! A group of a single song gets label 0 at its depth and every depth below
//! it. The clustering algorithm is not invoked for it.
//!
//! # Spectral clustering
//! - Affinity: RBF kernel `exp(-gamma * |x_i - x_j|^2)` (default), or a
//!   symmetrised k-nearest-neighbour graph with `k = min(group size, 10)`
//! - Symmetric normalised Laplacian `L = I - D^-1/2 A D^-1/2`
//! - Spectral embedding: the k eigenvectors with smallest eigenvalues,
//!   divided by `sqrt(degree)`, signs fixed so the largest entry is positive
//! - Label assignment by QR discretisation: pivoted QR picks k
//!   representative songs, an SVD rotation aligns the embedding with them,
//!   and each song takes the arg-max of the rotated row

use crate::error::{MapError, MapResult, SkippedModel};
use arbor_common::config::{AffinityKind, ClusteringConfig};
use arbor_common::table::{ModelCollection, Table};
use arbor_common::Error;
use nalgebra::{DMatrix, SymmetricEigen};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Label of rows not (yet) assigned at a depth
pub const UNASSIGNED: i64 = -1;

/// Upper bound of the nearest-neighbour affinity's neighbour count
pub const MAX_NEIGHBORS: usize = 10;

const EIGEN_EPSILON: f64 = 1.0e-12;
const EIGEN_MAX_ITERATIONS: usize = 10_000;

/// Name of the label column for `depth`
pub fn label_column(depth: usize) -> String {
    format!("b_{}", depth)
}

/// Eigen or singular value decomposition did not converge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotConverged;

/// Flat clustering of one group of points
pub trait GroupClusterer {
    /// Assign each point a label in `0..n_clusters`
    fn cluster(&self, points: &[[f64; 3]], n_clusters: usize) -> Result<Vec<usize>, NotConverged>;
}

/// Spectral clustering with QR-based label assignment
#[derive(Debug, Clone)]
pub struct SpectralClustering {
    affinity: AffinityKind,
    gamma: f64,
}

impl SpectralClustering {
    pub fn new(affinity: AffinityKind, gamma: f64) -> Self {
        Self { affinity, gamma }
    }

    fn affinity_matrix(&self, points: &[[f64; 3]]) -> DMatrix<f64> {
        let n = points.len();
        let sq_dist = |i: usize, j: usize| -> f64 {
            (0..3).map(|c| (points[i][c] - points[j][c]).powi(2)).sum()
        };

        match self.affinity {
            AffinityKind::Rbf => {
                DMatrix::from_fn(n, n, |i, j| (-self.gamma * sq_dist(i, j)).exp())
            }
            AffinityKind::NearestNeighbors => {
                let n_neighbors = n.min(MAX_NEIGHBORS);
                let mut connectivity = DMatrix::<f64>::zeros(n, n);
                for i in 0..n {
                    // Each point counts as its own nearest neighbour
                    let mut order: Vec<usize> = (0..n).collect();
                    order.sort_by(|&a, &b| {
                        sq_dist(i, a)
                            .partial_cmp(&sq_dist(i, b))
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then((a != i).cmp(&(b != i)))
                    });
                    for &j in order.iter().take(n_neighbors) {
                        connectivity[(i, j)] = 1.0;
                    }
                }
                (&connectivity + connectivity.transpose()) * 0.5
            }
        }
    }
}

impl GroupClusterer for SpectralClustering {
    fn cluster(&self, points: &[[f64; 3]], n_clusters: usize) -> Result<Vec<usize>, NotConverged> {
        let n = points.len();
        let k = n_clusters.min(n);
        if k <= 1 {
            return Ok(vec![0; n]);
        }

        let affinity = self.affinity_matrix(points);
        let embedding = spectral_embedding(affinity, k)?;
        cluster_qr(&embedding)
    }
}

/// Rows = points, columns = the k leading spectral coordinates
fn spectral_embedding(mut affinity: DMatrix<f64>, k: usize) -> Result<DMatrix<f64>, NotConverged> {
    let n = affinity.nrows();
    affinity.fill_diagonal(0.0);

    // Isolated points get unit degree so they map to themselves
    let sqrt_degree: Vec<f64> = (0..n)
        .map(|i| {
            let degree: f64 = affinity.row(i).sum();
            if degree > 0.0 {
                degree.sqrt()
            } else {
                1.0
            }
        })
        .collect();

    let laplacian = DMatrix::from_fn(n, n, |i, j| {
        let off_diagonal = -affinity[(i, j)] / (sqrt_degree[i] * sqrt_degree[j]);
        if i == j {
            1.0 + off_diagonal
        } else {
            off_diagonal
        }
    });

    let eigen = SymmetricEigen::try_new(laplacian, EIGEN_EPSILON, EIGEN_MAX_ITERATIONS)
        .ok_or(NotConverged)?;

    // nalgebra does not order eigenvalues
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[a]
            .partial_cmp(&eigen.eigenvalues[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut embedding = DMatrix::zeros(n, k);
    for (target, &source) in order.iter().take(k).enumerate() {
        let vector = eigen.eigenvectors.column(source);
        // Deterministic sign: largest absolute entry becomes positive
        let pivot = vector.iamax();
        let sign = if vector[pivot] < 0.0 { -1.0 } else { 1.0 };
        for i in 0..n {
            embedding[(i, target)] = sign * vector[i] / sqrt_degree[i];
        }
    }
    Ok(embedding)
}

/// Labels from a spectral embedding via pivoted QR and an SVD rotation
fn cluster_qr(vectors: &DMatrix<f64>) -> Result<Vec<usize>, NotConverged> {
    let (n, k) = vectors.shape();

    // Pivoted QR on vectors^T: greedily take the row with the largest residual
    let mut residual = vectors.clone();
    let mut pivots = Vec::with_capacity(k);
    for _ in 0..k {
        let pivot = (0..n)
            .filter(|i| !pivots.contains(i))
            .fold(None, |best: Option<(usize, f64)>, i| {
                let norm = residual.row(i).norm();
                match best {
                    Some((_, best_norm)) if best_norm >= norm => best,
                    _ => Some((i, norm)),
                }
            })
            .map(|(i, _)| i)
            .ok_or(NotConverged)?;
        pivots.push(pivot);

        let norm = residual.row(pivot).norm();
        if norm <= f64::EPSILON {
            continue;
        }
        let q = residual.row(pivot).transpose() / norm;
        for i in 0..n {
            let projection = residual.row(i).dot(&q.transpose());
            let mut row = residual.row_mut(i);
            row -= q.transpose() * projection;
        }
    }

    let representatives = DMatrix::from_fn(k, k, |i, j| vectors[(pivots[i], j)]);
    let svd = representatives
        .try_svd(true, true, EIGEN_EPSILON, EIGEN_MAX_ITERATIONS)
        .ok_or(NotConverged)?;
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(NotConverged),
    };
    // Polar factor of the transposed representatives
    let rotated = vectors * (u * v_t).transpose();

    Ok((0..n).map(|i| rotated.row(i).iamax_full().1).collect())
}

/// Recursive clusterer producing `b_0..b_{k-1}` label columns
pub struct HierarchicalClusterer<C = SpectralClustering> {
    branching_factors: Vec<usize>,
    clusterer: C,
}

impl HierarchicalClusterer<SpectralClustering> {
    pub fn from_config(config: &ClusteringConfig) -> Self {
        Self::new(
            config.branching_factors.clone(),
            SpectralClustering::new(config.affinity, config.gamma),
        )
    }
}

impl<C: GroupClusterer> HierarchicalClusterer<C> {
    pub fn new(branching_factors: Vec<usize>, clusterer: C) -> Self {
        Self {
            branching_factors,
            clusterer,
        }
    }

    pub fn depth(&self) -> usize {
        self.branching_factors.len()
    }

    /// Cluster every model; failing models are skipped and reported
    pub fn cluster_all(
        &self,
        collection: &ModelCollection,
    ) -> MapResult<(ModelCollection, Vec<SkippedModel>)> {
        info!(
            "Perform hierarchical spectral clustering for all {} models",
            collection.len()
        );
        let mut clustered = ModelCollection::new();
        let mut skipped = Vec::new();

        for (model, coordinates) in collection {
            info!("Calculate clusters for {}...", model);
            let start = Instant::now();
            match self.cluster(coordinates) {
                Ok(table) => {
                    info!(
                        "Done. Time elapsed: {:.2} seconds",
                        start.elapsed().as_secs_f64()
                    );
                    clustered.insert(model.clone(), table);
                }
                Err(e) if e.is_model_recoverable() => {
                    warn!("Skipping model {}: {}", model, e);
                    skipped.push(SkippedModel::new(model, "cluster", &e));
                }
                Err(e) => return Err(e),
            }
        }
        Ok((clustered, skipped))
    }

    /// Cluster one coordinate table
    ///
    /// The result has the columns `X, Y, Z, b_0, ..., b_{k-1}` and the same
    /// rows as the input.
    pub fn cluster(&self, coordinates: &Table) -> MapResult<Table> {
        if self.branching_factors.is_empty() {
            return Err(Error::Config("No branching factors configured".into()).into());
        }
        let points = coordinate_points(coordinates)?;
        let depths = self.depth();
        let mut labels = vec![vec![UNASSIGNED; depths]; points.len()];

        let all_rows: Vec<usize> = (0..points.len()).collect();
        if !all_rows.is_empty() {
            self.cluster_group(&points, &all_rows, 0, &mut labels)?;
        }

        let mut columns: Vec<String> = ["X", "Y", "Z"].iter().map(|c| c.to_string()).collect();
        columns.extend((0..depths).map(label_column));
        let values: Vec<Vec<f64>> = points
            .iter()
            .zip(&labels)
            .map(|(p, l)| p.iter().copied().chain(l.iter().map(|&b| b as f64)).collect())
            .collect();
        Ok(coordinates.replace_columns(columns, values)?)
    }

    fn cluster_group(
        &self,
        points: &[[f64; 3]],
        rows: &[usize],
        depth: usize,
        labels: &mut [Vec<i64>],
    ) -> MapResult<()> {
        let assigned = if rows.len() >= 2 {
            let group: Vec<[f64; 3]> = rows.iter().map(|&r| points[r]).collect();
            self.clusterer
                .cluster(&group, self.branching_factors[depth])
                .map_err(|_| MapError::NonConvergence {
                    depth,
                    group_size: rows.len(),
                })?
        } else {
            vec![0; rows.len()]
        };

        for (&row, &label) in rows.iter().zip(&assigned) {
            labels[row][depth] = label as i64;
        }

        if depth + 1 >= self.depth() {
            return Ok(());
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (&row, &label) in rows.iter().zip(&assigned) {
            groups.entry(label).or_default().push(row);
        }
        debug!(depth, groups = groups.len(), rows = rows.len(), "Recursing into sub-clusters");

        for group_rows in groups.values() {
            self.cluster_group(points, group_rows, depth + 1, labels)?;
        }
        Ok(())
    }
}

/// X/Y/Z of every row
fn coordinate_points(table: &Table) -> MapResult<Vec<[f64; 3]>> {
    let index = |name: &str| {
        table
            .column_index(name)
            .ok_or_else(|| Error::InvalidInput(format!("Coordinate table has no '{}' column", name)))
    };
    let (x, y, z) = (index("X")?, index("Y")?, index("Z")?);
    Ok(table.rows().iter().map(|r| [r[x], r[y], r[z]]).collect())
}
