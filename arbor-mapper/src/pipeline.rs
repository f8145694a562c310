//! Stage runner
//!
//! Runs a contiguous range of the mapping stages:
//!
//! | Stage        | Output                                         |
//! |--------------|------------------------------------------------|
//! | `clean`      | `vec-{model}.csv` (features)                   |
//! | `dr`         | `dr-{model}.csv` (X, Y, Z)                     |
//! | `cluster`    | `cluster-{model}.csv` (X, Y, Z, b_0, ...)      |
//! | `branching`  | `branches.json`, `leaves.json`                 |
//! | `metadata`   | `metadata.json`, `containing_clusters.json`    |
//! | `preprocess` | `cluster_relations.csv`                        |
//!
//! Results are handed from stage to stage in memory. When the range starts
//! after `clean`, the first stage reads its input from the output folder
//! instead, so a run can resume at any stage boundary.
//!
//! All argument checks happen in [`RunOptions::new`] and
//! [`Pipeline::run`] before the first stage starts.

use crate::cleaner::{CsvExportSource, FeatureSource};
use crate::clustering::HierarchicalClusterer;
use crate::combiner::{Combiner, LeafDocument};
use crate::error::{MapError, MapResult, SkippedModel};
use crate::metadata::{
    containing_clusters, enrich, ContainingClusters, JsonMetadataSource, MetadataSource,
};
use crate::preprocessor::append_leaf_stats;
use crate::reduction::DimensionalityReducer;
use crate::registry::ModelRegistry;
use crate::relations::cluster_relations;
use crate::topology::TreeTopology;
use arbor_common::config::TomlConfig;
use arbor_common::store::{read_json, save_matrix, write_json, TableStore};
use arbor_common::table::ModelCollection;
use arbor_common::Error;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;
use tracing::{info, warn};

/// Pipeline stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Clean,
    Dr,
    Cluster,
    Branching,
    Metadata,
    Preprocess,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Clean,
        Stage::Dr,
        Stage::Cluster,
        Stage::Branching,
        Stage::Metadata,
        Stage::Preprocess,
    ];

    /// Command-line name
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Clean => "clean",
            Stage::Dr => "dr",
            Stage::Cluster => "cluster",
            Stage::Branching => "branching",
            Stage::Metadata => "metadata",
            Stage::Preprocess => "preprocess",
        }
    }

    /// File prefix of the tables this stage writes
    pub fn prefix(&self) -> &'static str {
        match self {
            Stage::Clean => "vec",
            other => other.name(),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = Stage::ALL.iter().map(Stage::name).collect();
                MapError::InvalidStage(format!("'{}' (expected one of: {})", s, names.join(", ")))
            })
    }
}

/// Default output folder, `mappings_YYYYmmdd_HHMMSS`
pub fn default_output_folder() -> PathBuf {
    PathBuf::from(format!(
        "mappings_{}",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ))
}

/// Validated run arguments
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub start: Stage,
    pub end: Stage,
    pub input_file: Option<PathBuf>,
    pub output_folder: PathBuf,
    pub limit: Option<usize>,
}

impl RunOptions {
    /// Check the stage range, input file, output folder and limit
    ///
    /// `task` runs a single stage and overrides `start`/`end`.
    pub fn new(
        task: Option<&str>,
        start: Option<&str>,
        end: Option<&str>,
        input_file: Option<PathBuf>,
        output_folder: Option<PathBuf>,
        limit: Option<usize>,
    ) -> MapResult<Self> {
        let (start, end) = match task {
            Some(task) => (Some(task), Some(task)),
            None => (start, end),
        };
        let start = start.map(Stage::from_str).transpose()?.unwrap_or(Stage::Clean);
        let end = end.map(Stage::from_str).transpose()?.unwrap_or(Stage::Preprocess);
        if end < start {
            return Err(MapError::InvalidStage(format!(
                "end stage '{}' comes before start stage '{}'",
                end, start
            )));
        }

        if let Some(file) = &input_file {
            if !file.is_file() {
                return Err(Error::NotFound(format!("Input file {}", file.display())).into());
            }
        }

        let output_folder = match output_folder {
            Some(folder) => folder,
            None if start > Stage::Clean => {
                return Err(Error::InvalidInput(format!(
                    "Starting at '{}' requires an existing output folder",
                    start
                ))
                .into())
            }
            None => default_output_folder(),
        };
        if start > Stage::Clean && !output_folder.is_dir() {
            return Err(Error::NotFound(format!(
                "Output folder {}",
                output_folder.display()
            ))
            .into());
        }

        if limit == Some(0) {
            return Err(Error::InvalidInput("Limit must be at least 1".into()).into());
        }

        Ok(Self {
            start,
            end,
            input_file,
            output_folder,
            limit,
        })
    }

    pub fn includes(&self, stage: Stage) -> bool {
        self.start <= stage && stage <= self.end
    }
}

/// Outcome of a pipeline run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub stages: Vec<Stage>,
    pub skipped: Vec<SkippedModel>,
    pub leaf_clusters: usize,
}

/// Runs the mapping stages over one output folder
pub struct Pipeline {
    config: TomlConfig,
    registry: ModelRegistry,
    options: RunOptions,
    store: TableStore,
    feature_source: Option<Box<dyn FeatureSource>>,
    metadata_source: Option<Box<dyn MetadataSource>>,
}

impl Pipeline {
    /// Pipeline with sources taken from the options and configuration
    pub fn new(config: TomlConfig, options: RunOptions) -> Self {
        let feature_source = options
            .input_file
            .clone()
            .or_else(|| config.sources.feature_export.clone())
            .map(|path| Box::new(CsvExportSource::new(path)) as Box<dyn FeatureSource>);
        let metadata_source = config
            .sources
            .metadata_export
            .clone()
            .map(|path| Box::new(JsonMetadataSource::new(path)) as Box<dyn MetadataSource>);

        Self {
            registry: ModelRegistry::new(config.models.clone()),
            store: TableStore::new(options.output_folder.clone()),
            config,
            options,
            feature_source,
            metadata_source,
        }
    }

    pub fn with_feature_source(mut self, source: Box<dyn FeatureSource>) -> Self {
        self.feature_source = Some(source);
        self
    }

    pub fn with_metadata_source(mut self, source: Box<dyn MetadataSource>) -> Self {
        self.metadata_source = Some(source);
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    fn output_path(&self, file_name: &str) -> PathBuf {
        self.store.folder().join(file_name)
    }

    fn load_tables(&self, stage: Stage) -> MapResult<ModelCollection> {
        Ok(self.store.load_collection(stage.prefix(), self.options.limit)?)
    }

    /// Run every stage of the range
    pub fn run(&self) -> MapResult<RunSummary> {
        let start_time = Instant::now();
        if self.options.includes(Stage::Clean) && self.feature_source.is_none() {
            return Err(Error::Config(
                "The clean stage needs --file or sources.feature_export".into(),
            )
            .into());
        }
        let topology = if self.options.includes(Stage::Branching) {
            Some(TreeTopology::load(&self.config.combiner.tree_structure)?)
        } else {
            None
        };

        info!(
            "Running stages {}..={} in {}",
            self.options.start,
            self.options.end,
            self.store.folder().display()
        );
        let mut summary = RunSummary::default();
        let mut features = None;
        let mut coordinates = None;
        let mut clusters = None;
        let mut leaves = None;
        let mut containing = None;

        for stage in Stage::ALL.into_iter().filter(|s| self.options.includes(*s)) {
            info!("==== Stage: {} ====", stage);
            match stage {
                Stage::Clean => {
                    let collection = self.run_clean()?;
                    self.store.save_collection(stage.prefix(), &collection)?;
                    features = Some(collection);
                }
                Stage::Dr => {
                    let input = match features.take() {
                        Some(input) => input,
                        None => self.load_tables(Stage::Clean)?,
                    };
                    let reducer = DimensionalityReducer::new(self.config.dr.clone());
                    let (reduced, skipped) = reducer.reduce_all(&input)?;
                    summary.skipped.extend(skipped);
                    self.store.save_collection(stage.prefix(), &reduced)?;
                    features = Some(input);
                    coordinates = Some(reduced);
                }
                Stage::Cluster => {
                    let input = match coordinates.take() {
                        Some(input) => input,
                        None => self.load_tables(Stage::Dr)?,
                    };
                    let clusterer = HierarchicalClusterer::from_config(&self.config.clustering);
                    let (labelled, skipped) = clusterer.cluster_all(&input)?;
                    summary.skipped.extend(skipped);
                    self.store.save_collection(stage.prefix(), &labelled)?;
                    clusters = Some(labelled);
                }
                Stage::Branching => {
                    let labelled = match clusters.take() {
                        Some(labelled) => labelled,
                        None => self.load_tables(Stage::Cluster)?,
                    };
                    // In-memory features only exist when this run cleaned them
                    let vectors = match features.take() {
                        Some(vectors) if self.options.start == Stage::Clean => vectors,
                        _ => self.load_tables(Stage::Clean)?,
                    };
                    let topology = topology.as_ref().ok_or_else(|| {
                        Error::Internal("Tree topology not loaded".into())
                    })?;
                    let document = self.run_branching(&labelled, &vectors, topology)?;
                    summary.leaf_clusters = document.len();
                    leaves = Some(document);
                }
                Stage::Metadata => {
                    let document = match leaves.take() {
                        Some(document) => document,
                        None => read_json(&self.output_path(&self.config.files.leaves))?,
                    };
                    containing = Some(self.run_metadata(&document)?);
                }
                Stage::Preprocess => {
                    let map = match containing.take() {
                        Some(map) => map,
                        None => read_json(
                            &self.output_path(&self.config.files.containing_clusters),
                        )?,
                    };
                    let matrix = cluster_relations(&map)?;
                    save_matrix(
                        &self.output_path(&self.config.files.cluster_relations),
                        &matrix,
                    )?;
                }
            }
            summary.stages.push(stage);
        }

        if !summary.skipped.is_empty() {
            warn!("{} model(s) skipped:", summary.skipped.len());
            for skipped in &summary.skipped {
                warn!("  {} ({}): {}", skipped.model, skipped.stage, skipped.reason);
            }
        }
        info!(
            "Overall time: {:.2} seconds",
            start_time.elapsed().as_secs_f64()
        );
        Ok(summary)
    }

    fn run_clean(&self) -> MapResult<ModelCollection> {
        let source = self
            .feature_source
            .as_ref()
            .ok_or_else(|| Error::Config("No feature source configured".into()))?;
        info!("Cleaning {}", source.describe());
        source.fetch(self.options.limit)
    }

    fn run_branching(
        &self,
        labelled: &ModelCollection,
        vectors: &ModelCollection,
        topology: &TreeTopology,
    ) -> MapResult<LeafDocument> {
        let tree = Combiner::new(&self.registry, topology)
            .with_best_of(self.config.combiner.best_of)
            .combine(labelled, vectors)?;
        let mut document = tree.leaves;
        append_leaf_stats(&mut document);

        info!("Exporting json files");
        write_json(&self.output_path(&self.config.files.branches), &tree.root)?;
        write_json(&self.output_path(&self.config.files.leaves), &document)?;
        Ok(document)
    }

    fn run_metadata(&self, leaves: &LeafDocument) -> MapResult<ContainingClusters> {
        let metadata = match &self.metadata_source {
            Some(source) => {
                info!("Reading {}", source.describe());
                source.fetch(self.options.limit)?
            }
            None => {
                warn!("No metadata source configured, writing cluster membership only");
                Vec::new()
            }
        };
        let map = containing_clusters(leaves);
        let document = enrich(metadata, &map);

        write_json(&self.output_path(&self.config.files.metadata), &document)?;
        write_json(
            &self.output_path(&self.config.files.containing_clusters),
            &map,
        )?;
        Ok(map)
    }
}
