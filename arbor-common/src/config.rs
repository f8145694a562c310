//! Configuration loading and config file resolution
//!
//! Configuration lives in a single TOML file. Every field has a built-in
//! default, so a missing file only produces a warning.
//!
//! Config file resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`ARBOR_CONFIG`)
//! 3. Platform config directory (`~/.config/arbor/config.toml` on Linux)
//! 4. Built-in defaults (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "ARBOR_CONFIG";

/// Configuration loaded from TOML
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct TomlConfig {
    /// Dimensionality reduction (t-SNE) parameters
    #[serde(default)]
    pub dr: DimRedConfig,

    /// Hierarchical clustering parameters
    #[serde(default)]
    pub clustering: ClusteringConfig,

    /// Branch tree / leaf cluster generation
    #[serde(default)]
    pub combiner: CombinerConfig,

    /// Model short name → display name (e.g. `genre` → `MTG Jamendo Genre`)
    #[serde(default)]
    pub models: BTreeMap<String, String>,

    /// Output file names
    #[serde(default)]
    pub files: OutputFiles,

    /// Input exports used by the `clean` and `metadata` stages
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// t-SNE parameters
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DimRedConfig {
    #[serde(default = "default_perplexity")]
    pub perplexity: f64,

    #[serde(default = "default_iterations")]
    pub iterations: usize,

    /// Fixed RNG seed; unseeded runs are not reproducible
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for DimRedConfig {
    fn default() -> Self {
        Self {
            perplexity: default_perplexity(),
            iterations: default_iterations(),
            seed: None,
        }
    }
}

/// Affinity used to build the spectral clustering graph
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AffinityKind {
    /// Radial basis function kernel (production default)
    #[default]
    Rbf,
    /// Symmetrised k-nearest-neighbour connectivity
    NearestNeighbors,
}

/// Spectral clustering parameters
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ClusteringConfig {
    /// Number of sub-clusters per depth, top-down
    #[serde(default = "default_branching_factors")]
    pub branching_factors: Vec<usize>,

    /// RBF kernel coefficient
    #[serde(default = "default_gamma")]
    pub gamma: f64,

    #[serde(default)]
    pub affinity: AffinityKind,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            branching_factors: default_branching_factors(),
            gamma: default_gamma(),
            affinity: AffinityKind::default(),
        }
    }
}

/// Branch tree generation parameters
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CombinerConfig {
    /// Number of top-weighted features in each summary string
    #[serde(default = "default_best_of")]
    pub best_of: usize,

    /// Tree topology (geometry) file, YAML
    #[serde(default = "default_tree_structure")]
    pub tree_structure: PathBuf,
}

impl Default for CombinerConfig {
    fn default() -> Self {
        Self {
            best_of: default_best_of(),
            tree_structure: default_tree_structure(),
        }
    }
}

/// Names of the documents written into the output folder
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct OutputFiles {
    #[serde(default = "default_branches_filename")]
    pub branches: String,
    #[serde(default = "default_leaves_filename")]
    pub leaves: String,
    #[serde(default = "default_metadata_filename")]
    pub metadata: String,
    #[serde(default = "default_containing_clusters_filename")]
    pub containing_clusters: String,
    #[serde(default = "default_cluster_relations_filename")]
    pub cluster_relations: String,
}

impl Default for OutputFiles {
    fn default() -> Self {
        Self {
            branches: default_branches_filename(),
            leaves: default_leaves_filename(),
            metadata: default_metadata_filename(),
            containing_clusters: default_containing_clusters_filename(),
            cluster_relations: default_cluster_relations_filename(),
        }
    }
}

/// Exported input files
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct SourcesConfig {
    /// Flat feature export (`media_id,model_name,data`) for the clean stage
    #[serde(default)]
    pub feature_export: Option<PathBuf>,

    /// Song metadata export (JSON array) for the metadata stage
    #[serde(default)]
    pub metadata_export: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_perplexity() -> f64 {
    30.0
}

fn default_iterations() -> usize {
    1000
}

fn default_branching_factors() -> Vec<usize> {
    vec![5, 5, 5]
}

fn default_gamma() -> f64 {
    1.0
}

fn default_best_of() -> usize {
    7
}

fn default_tree_structure() -> PathBuf {
    PathBuf::from("tree_structure.yaml")
}

fn default_branches_filename() -> String {
    "branches.json".to_string()
}

fn default_leaves_filename() -> String {
    "leaves.json".to_string()
}

fn default_metadata_filename() -> String {
    "metadata.json".to_string()
}

fn default_containing_clusters_filename() -> String {
    "containing_clusters.json".to_string()
}

fn default_cluster_relations_filename() -> String {
    "cluster_relations.csv".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TomlConfig {
    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.dr.perplexity <= 0.0 {
            return Err(Error::Config("dr.perplexity must be positive".to_string()));
        }
        if self.dr.iterations == 0 {
            return Err(Error::Config("dr.iterations must be at least 1".to_string()));
        }
        if self.clustering.branching_factors.is_empty() {
            return Err(Error::Config(
                "clustering.branching_factors must not be empty".to_string(),
            ));
        }
        if self.clustering.branching_factors.contains(&0) {
            return Err(Error::Config(
                "clustering.branching_factors must be positive".to_string(),
            ));
        }
        if self.clustering.gamma <= 0.0 {
            return Err(Error::Config("clustering.gamma must be positive".to_string()));
        }
        if self.combiner.best_of == 0 {
            return Err(Error::Config("combiner.best_of must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Find the config file following the resolution priority
///
/// Returns `None` when no file is found; callers fall back to defaults.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config directory
    dirs::config_dir()
        .map(|d| d.join("arbor").join("config.toml"))
        .filter(|p| p.exists())
}

/// Load configuration with graceful degradation
///
/// An explicitly requested file (CLI or environment) must exist and parse.
/// Without one, built-in defaults are used and a warning is logged.
pub fn load_config(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    match resolve_config_path(cli_arg) {
        Some(path) => {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            info!("Loading configuration from {}", path.display());
            TomlConfig::load(&path)
        }
        None => {
            warn!("No config file found, using built-in defaults");
            Ok(TomlConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TomlConfig::default();
        assert_eq!(config.dr.perplexity, 30.0);
        assert_eq!(config.dr.iterations, 1000);
        assert_eq!(config.dr.seed, None);
        assert_eq!(config.clustering.branching_factors, vec![5, 5, 5]);
        assert_eq!(config.clustering.affinity, AffinityKind::Rbf);
        assert_eq!(config.combiner.best_of, 7);
        assert_eq!(config.files.cluster_relations, "cluster_relations.csv");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = TomlConfig::from_toml_str(
            r#"
            [dr]
            perplexity = 5.0
            seed = 42

            [clustering]
            branching_factors = [2, 2]
            affinity = "nearest_neighbors"

            [models]
            genre = "MTG Jamendo Genre"
            "#,
        )
        .unwrap();

        assert_eq!(config.dr.perplexity, 5.0);
        assert_eq!(config.dr.iterations, 1000);
        assert_eq!(config.dr.seed, Some(42));
        assert_eq!(config.clustering.branching_factors, vec![2, 2]);
        assert_eq!(config.clustering.gamma, 1.0);
        assert_eq!(config.clustering.affinity, AffinityKind::NearestNeighbors);
        assert_eq!(config.models["genre"], "MTG Jamendo Genre");
        assert_eq!(config.files.leaves, "leaves.json");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero_factor = "[clustering]\nbranching_factors = [3, 0]\n";
        assert!(matches!(
            TomlConfig::from_toml_str(zero_factor),
            Err(Error::Config(_))
        ));

        let empty = "[clustering]\nbranching_factors = []\n";
        assert!(TomlConfig::from_toml_str(empty).is_err());

        let bad_perplexity = "[dr]\nperplexity = 0.0\n";
        assert!(TomlConfig::from_toml_str(bad_perplexity).is_err());
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let result = TomlConfig::from_toml_str("[dr\nperplexity = ");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
