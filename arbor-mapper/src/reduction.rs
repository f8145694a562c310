//! Dimensionality reduction (`dr` stage)
//!
//! Projects each model's feature table into three dimensions with exact
//! t-SNE. The output table keeps the song keys and row order of the input and
//! replaces every feature column with `X`, `Y`, `Z`.
//!
//! # Algorithm
//! 1. Per-song Gaussian affinities, bandwidth found by binary search so that
//!    the conditional distribution has the requested perplexity
//! 2. Symmetrised joint probabilities `P`
//! 3. Student-t kernel in the embedding (degrees of freedom = dims - 1)
//! 4. Gradient descent with momentum and per-parameter gains; `P` is
//!    exaggerated by 12 during the first 250 iterations
//!
//! Runs are unseeded by default and therefore not reproducible. Set
//! `dr.seed` in the configuration to fix the initial embedding.
//!
//! Row-level work in the gradient is spread across threads with rayon.
//! Partial sums are collected in row order, so a seeded run gives the same
//! result regardless of thread count.

use crate::error::{MapError, MapResult, SkippedModel};
use arbor_common::config::DimRedConfig;
use arbor_common::table::{ModelCollection, Table};
use arbor_common::Error;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;
use rayon::prelude::*;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Output dimensionality
pub const N_COMPONENTS: usize = 3;

/// Names of the output columns
pub const COORDINATE_COLUMNS: [&str; N_COMPONENTS] = ["X", "Y", "Z"];

/// Smallest number of songs the embedding accepts
pub const MIN_SAMPLES: usize = 4;

const EARLY_EXAGGERATION: f64 = 12.0;
const EXPLORATION_ITERATIONS: usize = 250;
const INITIAL_MOMENTUM: f64 = 0.5;
const FINAL_MOMENTUM: f64 = 0.8;
const MIN_GAIN: f64 = 0.01;
const INIT_STD: f64 = 1e-4;
const PERPLEXITY_TOLERANCE: f64 = 1e-5;
const PERPLEXITY_STEPS: usize = 100;
const MACHINE_EPSILON: f64 = f64::EPSILON;

/// t-SNE reducer
#[derive(Debug, Clone)]
pub struct DimensionalityReducer {
    config: DimRedConfig,
}

impl DimensionalityReducer {
    pub fn new(config: DimRedConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DimRedConfig {
        &self.config
    }

    /// Reduce every model; models that fail are skipped and reported
    pub fn reduce_all(
        &self,
        collection: &ModelCollection,
    ) -> MapResult<(ModelCollection, Vec<SkippedModel>)> {
        info!("Perform t-SNE for all {} models", collection.len());
        let mut reduced = ModelCollection::new();
        let mut skipped = Vec::new();

        for (model, features) in collection {
            info!("Perform t-SNE in 3-D for {}...", model);
            let start = Instant::now();
            match self.reduce(features) {
                Ok(coordinates) => {
                    info!(
                        "Done. Time elapsed: {:.2} seconds",
                        start.elapsed().as_secs_f64()
                    );
                    reduced.insert(model.clone(), coordinates);
                }
                Err(e) if e.is_model_recoverable() => {
                    warn!("Skipping model {}: {}", model, e);
                    skipped.push(SkippedModel::new(model, "dr", &e));
                }
                Err(e) => return Err(e),
            }
        }
        Ok((reduced, skipped))
    }

    /// Embed one feature table into X/Y/Z
    pub fn reduce(&self, features: &Table) -> MapResult<Table> {
        let n = features.len();
        if features.width() == 0 {
            return Err(Error::InvalidInput("Feature table has no feature columns".into()).into());
        }
        if n < MIN_SAMPLES {
            return Err(MapError::TooFewSamples {
                found: n,
                required: MIN_SAMPLES,
                detail: String::new(),
            });
        }
        if self.config.perplexity >= n as f64 {
            return Err(MapError::TooFewSamples {
                found: n,
                required: self.config.perplexity.floor() as usize + 1,
                detail: format!("(perplexity {} must be below the song count)", self.config.perplexity),
            });
        }

        let distances = squared_distances(features.rows());
        let conditional = binary_search_perplexity(&distances, n, self.config.perplexity);
        let p = joint_probabilities(&conditional, n);

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let normal = Normal::new(0.0, INIT_STD)
            .map_err(|e| Error::Internal(format!("Normal distribution: {}", e)))?;
        let init: Vec<[f64; N_COMPONENTS]> = (0..n)
            .map(|_| [rng.sample(normal), rng.sample(normal), rng.sample(normal)])
            .collect();

        let embedding = optimize(&p, init, self.config.iterations);

        let columns = COORDINATE_COLUMNS.iter().map(|c| c.to_string()).collect();
        let values = embedding.iter().map(|y| y.to_vec()).collect();
        Ok(features.replace_columns(columns, values)?)
    }
}

/// Dense matrix of pairwise squared euclidean distances (row-major n×n)
fn squared_distances(rows: &[Vec<f64>]) -> Vec<f64> {
    let n = rows.len();
    let mut distances = vec![0.0; n * n];
    distances
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(i, out)| {
            for (j, d) in out.iter_mut().enumerate() {
                *d = rows[i]
                    .iter()
                    .zip(&rows[j])
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
            }
        });
    distances
}

/// Conditional probabilities `p_{j|i}` with per-row precision matched to the perplexity
fn binary_search_perplexity(distances: &[f64], n: usize, perplexity: f64) -> Vec<f64> {
    let desired_entropy = perplexity.ln();
    let mut conditional = vec![0.0; n * n];

    conditional
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(i, p_row)| {
            let d_row = &distances[i * n..(i + 1) * n];
            let mut beta: f64 = 1.0;
            let mut beta_min = f64::NEG_INFINITY;
            let mut beta_max = f64::INFINITY;

            for _ in 0..PERPLEXITY_STEPS {
                let mut sum_p: f64 = 0.0;
                for j in 0..n {
                    p_row[j] = if j == i { 0.0 } else { (-d_row[j] * beta).exp() };
                    sum_p += p_row[j];
                }
                if sum_p == 0.0 {
                    sum_p = MACHINE_EPSILON;
                }
                let mut sum_disti_p: f64 = 0.0;
                for j in 0..n {
                    p_row[j] /= sum_p;
                    sum_disti_p += d_row[j] * p_row[j];
                }

                let entropy = sum_p.ln() + beta * sum_disti_p;
                let diff = entropy - desired_entropy;
                if diff.abs() <= PERPLEXITY_TOLERANCE {
                    break;
                }
                if diff > 0.0 {
                    beta_min = beta;
                    beta = if beta_max == f64::INFINITY {
                        beta * 2.0
                    } else {
                        (beta + beta_max) / 2.0
                    };
                } else {
                    beta_max = beta;
                    beta = if beta_min == f64::NEG_INFINITY {
                        beta / 2.0
                    } else {
                        (beta + beta_min) / 2.0
                    };
                }
            }
        });
    conditional
}

/// Symmetrise and normalise so that all `p_ij` sum to 1
fn joint_probabilities(conditional: &[f64], n: usize) -> Vec<f64> {
    let mut p = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..n {
            p[i * n + j] = conditional[i * n + j] + conditional[j * n + i];
        }
    }
    let total: f64 = p.iter().sum::<f64>().max(MACHINE_EPSILON);
    for (index, value) in p.iter_mut().enumerate() {
        *value = if index / n == index % n {
            0.0
        } else {
            (*value / total).max(MACHINE_EPSILON)
        };
    }
    p
}

/// Gradient descent on the KL divergence between `P` and the embedding's `Q`
fn optimize(
    p: &[f64],
    mut y: Vec<[f64; N_COMPONENTS]>,
    iterations: usize,
) -> Vec<[f64; N_COMPONENTS]> {
    let n = y.len();
    let dof = (N_COMPONENTS as f64 - 1.0).max(1.0);
    let learning_rate = (n as f64 / EARLY_EXAGGERATION / 4.0).max(50.0);
    let mut update = vec![[0.0_f64; N_COMPONENTS]; n];
    let mut gains = vec![[1.0_f64; N_COMPONENTS]; n];

    debug!(songs = n, learning_rate, iterations, "Starting t-SNE optimisation");

    for iteration in 0..iterations {
        let exploring = iteration < EXPLORATION_ITERATIONS;
        let exaggeration = if exploring { EARLY_EXAGGERATION } else { 1.0 };
        let momentum = if exploring {
            INITIAL_MOMENTUM
        } else {
            FINAL_MOMENTUM
        };

        let (grad, kl) = gradient(p, &y, dof, exaggeration);
        if iteration % 100 == 99 || iteration + 1 == iterations {
            debug!(iteration = iteration + 1, kl_divergence = kl, "t-SNE progress");
        }

        for i in 0..n {
            for c in 0..N_COMPONENTS {
                let g = grad[i][c];
                if update[i][c] * g < 0.0 {
                    gains[i][c] += 0.2;
                } else {
                    gains[i][c] *= 0.8;
                }
                gains[i][c] = gains[i][c].max(MIN_GAIN);
                update[i][c] = momentum * update[i][c] - learning_rate * gains[i][c] * g;
                y[i][c] += update[i][c];
            }
        }
    }
    y
}

/// Gradient of KL(P‖Q) for every point, plus the current divergence
fn gradient(
    p: &[f64],
    y: &[[f64; N_COMPONENTS]],
    dof: f64,
    exaggeration: f64,
) -> (Vec<[f64; N_COMPONENTS]>, f64) {
    let n = y.len();
    let exponent = -(dof + 1.0) / 2.0;
    let kernel = |i: usize, j: usize| -> (f64, f64) {
        let d: f64 = (0..N_COMPONENTS).map(|c| (y[i][c] - y[j][c]).powi(2)).sum();
        let base = 1.0 + d / dof;
        (base.powf(exponent), base)
    };

    // Row partials are collected in order so the total is deterministic
    let row_sums: Vec<f64> = (0..n)
        .into_par_iter()
        .map(|i| (0..n).filter(|&j| j != i).map(|j| kernel(i, j).0).sum())
        .collect();
    let w_total = row_sums.iter().sum::<f64>().max(MACHINE_EPSILON);

    let c = 2.0 * (dof + 1.0) / dof;
    let rows: Vec<([f64; N_COMPONENTS], f64)> = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut g = [0.0; N_COMPONENTS];
            let mut kl = 0.0;
            for j in 0..n {
                if j == i {
                    continue;
                }
                let (w, base) = kernel(i, j);
                let q = (w / w_total).max(MACHINE_EPSILON);
                let p_ij = p[i * n + j];
                kl += p_ij * (p_ij.max(MACHINE_EPSILON) / q).ln();
                let coefficient = (exaggeration * p_ij - q) / base;
                for (axis, value) in g.iter_mut().enumerate() {
                    *value += c * coefficient * (y[i][axis] - y[j][axis]);
                }
            }
            (g, kl)
        })
        .collect();

    let kl: f64 = rows.iter().map(|(_, kl)| kl).sum();
    (rows.into_iter().map(|(g, _)| g).collect(), kl)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs(per_blob: usize) -> Table {
        let mut table = Table::new(vec!["a".into(), "b".into(), "c".into(), "d".into()]);
        for i in 0..per_blob {
            let jitter = i as f64 * 0.01;
            table
                .push_row(format!("mjf-{}", i), vec![0.9 + jitter, 0.1, 0.0, 0.05])
                .unwrap();
        }
        for i in 0..per_blob {
            let jitter = i as f64 * 0.01;
            table
                .push_row(format!("mjf-{}", per_blob + i), vec![0.0, 0.05, 0.9 + jitter, 0.8])
                .unwrap();
        }
        table
    }

    fn reducer(perplexity: f64, seed: Option<u64>) -> DimensionalityReducer {
        reducer_with_iterations(perplexity, seed, 300)
    }

    fn reducer_with_iterations(
        perplexity: f64,
        seed: Option<u64>,
        iterations: usize,
    ) -> DimensionalityReducer {
        DimensionalityReducer::new(DimRedConfig {
            perplexity,
            iterations,
            seed,
        })
    }

    #[test]
    fn test_output_shape_matches_input() {
        let features = two_blobs(6);
        let coordinates = reducer(4.0, Some(7)).reduce(&features).unwrap();

        assert_eq!(coordinates.len(), features.len());
        assert_eq!(coordinates.keys(), features.keys());
        assert_eq!(coordinates.columns(), &["X", "Y", "Z"]);
        assert!(coordinates.rows().iter().flatten().all(|v| v.is_finite()));
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let features = two_blobs(5);
        let first = reducer(3.0, Some(42)).reduce(&features).unwrap();
        let second = reducer(3.0, Some(42)).reduce(&features).unwrap();
        assert_eq!(first.rows(), second.rows());
    }

    #[test]
    fn test_blobs_stay_separated() {
        // Clusters settle well after the exaggeration phase
        let features = two_blobs(8);
        let coordinates = reducer_with_iterations(5.0, Some(3), 1000)
            .reduce(&features)
            .unwrap();
        let centroid = |range: std::ops::Range<usize>| -> [f64; 3] {
            let mut c = [0.0; 3];
            for i in range.clone() {
                for (axis, v) in c.iter_mut().enumerate() {
                    *v += coordinates.row(i)[axis] / range.len() as f64;
                }
            }
            c
        };
        let spread = |range: std::ops::Range<usize>, c: [f64; 3]| -> f64 {
            range
                .map(|i| {
                    (0..3)
                        .map(|a| (coordinates.row(i)[a] - c[a]).powi(2))
                        .sum::<f64>()
                        .sqrt()
                })
                .fold(0.0, f64::max)
        };
        let a = centroid(0..8);
        let b = centroid(8..16);
        let between = (0..3).map(|k| (a[k] - b[k]).powi(2)).sum::<f64>().sqrt();
        assert!(between > spread(0..8, a));
        assert!(between > spread(8..16, b));
    }

    #[test]
    fn test_too_few_songs_is_recoverable() {
        let features = two_blobs(1);
        let err = reducer(1.0, None).reduce(&features).unwrap_err();
        assert!(matches!(err, MapError::TooFewSamples { found: 2, .. }));
        assert!(err.is_model_recoverable());
    }

    #[test]
    fn test_perplexity_must_be_below_song_count() {
        let features = two_blobs(3);
        let err = reducer(30.0, None).reduce(&features).unwrap_err();
        assert!(matches!(err, MapError::TooFewSamples { found: 6, .. }));
    }

    #[test]
    fn test_reduce_all_skips_small_models() {
        let mut collection = ModelCollection::new();
        collection.insert("genre".into(), two_blobs(4));
        collection.insert("tiny".into(), two_blobs(1));

        let (reduced, skipped) = reducer(3.0, Some(1)).reduce_all(&collection).unwrap();
        assert_eq!(reduced.len(), 1);
        assert!(reduced.contains_key("genre"));
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].model, "tiny");
    }

    #[test]
    fn test_joint_probabilities_sum_to_one() {
        let rows = two_blobs(3).rows().to_vec();
        let distances = squared_distances(&rows);
        let conditional = binary_search_perplexity(&distances, 6, 2.0);
        let p = joint_probabilities(&conditional, 6);
        let total: f64 = p.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        for i in 0..6 {
            for j in 0..6 {
                assert!((p[i * 6 + j] - p[j * 6 + i]).abs() < 1e-12);
            }
        }
    }
}
