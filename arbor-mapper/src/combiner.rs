//! Branch tree and leaf cluster generation (`branching` stage)
//!
//! Joins every model's cluster labels with its feature table and walks the
//! label hierarchy depth-first. Each group becomes a [`BranchNode`] carrying
//! a feature summary and, where the topology has a level for it, render
//! parameters. Groups at the last depth become leaf clusters with IDs that
//! continue across models in traversal order.
//!
//! ```text
//! root ("")
//! ├── "Feature: MTG Jamendo Genre"
//! │   ├── b_0 = 0
//! │   │   ├── b_1 = 0  → leaf 0
//! │   │   └── b_1 = 1  → leaf 1
//! │   └── b_0 = 1
//! │       └── b_1 = 0  → leaf 2
//! └── "Feature: MTG Jamendo Mood"
//!     └── ...          → leaf 3, 4, ...
//! ```

use crate::clustering::label_column;
use crate::error::MapResult;
use crate::registry::ModelRegistry;
use crate::topology::{BranchParams, TreeTopology, Vector3};
use arbor_common::table::{ModelCollection, Table};
use arbor_common::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Default number of features in a summary string
pub const DEFAULT_BEST_OF: usize = 7;

/// Leaf cluster ID
pub type LeafId = u64;

/// Leaf cluster ID → leaf cluster
pub type LeafDocument = BTreeMap<LeafId, LeafCluster>;

/// Node of the branch tree document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchNode {
    pub metadata: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<BranchParams>,
    #[serde(flatten)]
    pub content: NodeContent,
}

/// Inner nodes hold children, final-depth nodes reference a leaf cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeContent {
    Children(Vec<BranchNode>),
    LeafUid(LeafId),
}

impl BranchNode {
    pub fn children(&self) -> &[BranchNode] {
        match &self.content {
            NodeContent::Children(children) => children,
            NodeContent::LeafUid(_) => &[],
        }
    }

    pub fn leaf_uid(&self) -> Option<LeafId> {
        match self.content {
            NodeContent::LeafUid(id) => Some(id),
            NodeContent::Children(_) => None,
        }
    }
}

/// Leaf statistics, filled in by the preprocess stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeafStats {
    pub lin_scale: f64,
    pub cub_scale: f64,
}

/// Per-song record inside a leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongRecord {
    /// Position normalised to `[0, 1]` within the leaf
    pub geometry: Vector3,
    /// Top features, `"name: XX.X % | ..."`
    pub features: String,
}

/// Finest-granularity cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeafCluster {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<LeafStats>,
    pub songs: BTreeMap<String, SongRecord>,
}

/// Output of the branching stage
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedTree {
    pub root: BranchNode,
    pub leaves: LeafDocument,
}

/// Format the `best_of` largest values as `"name: XX.X % | ..."`
///
/// Sorting is stable, so equal values keep column order.
pub fn top_features(names: &[String], values: &[f64], best_of: usize) -> String {
    let mut ranked: Vec<(&String, f64)> = names.iter().zip(values.iter().copied()).collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked
        .iter()
        .take(best_of)
        .map(|(name, value)| format!("{}: {:.1} %", name, 100.0 * value))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Min-max scale one axis; a zero-range axis maps to 0.0
fn normalise_axis(values: &[f64]) -> Vec<f64> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    values
        .iter()
        .map(|v| if range > 0.0 { (v - min) / range } else { 0.0 })
        .collect()
}

/// One song of a model after joining labels and features
#[derive(Debug, Clone)]
struct JoinedRow {
    key: String,
    position: [f64; 3],
    labels: Vec<i64>,
    features: Vec<f64>,
}

/// Labels and features of one model
struct JoinedModel {
    feature_names: Vec<String>,
    rows: Vec<JoinedRow>,
    depths: usize,
}

impl JoinedModel {
    /// Right join on the feature table; songs without labels are dropped
    fn join(model: &str, labels: &Table, features: &Table) -> MapResult<Self> {
        let index = |name: &str| {
            labels.column_index(name).ok_or_else(|| {
                Error::InvalidInput(format!("Cluster table of '{}' has no '{}' column", model, name))
            })
        };
        let xyz = [index("X")?, index("Y")?, index("Z")?];
        let label_indices: Vec<usize> = (0..)
            .map_while(|depth| labels.column_index(&label_column(depth)))
            .collect();
        if label_indices.is_empty() {
            return Err(Error::InvalidInput(format!(
                "Cluster table of '{}' has no label columns",
                model
            ))
            .into());
        }

        let mut rows = Vec::with_capacity(features.len());
        let mut dropped = 0usize;
        for (key, feature_values) in features.keys().iter().zip(features.rows()) {
            let Some(label_row) = labels.get(key) else {
                dropped += 1;
                continue;
            };
            rows.push(JoinedRow {
                key: key.clone(),
                position: [label_row[xyz[0]], label_row[xyz[1]], label_row[xyz[2]]],
                labels: label_indices.iter().map(|&i| label_row[i] as i64).collect(),
                features: feature_values.clone(),
            });
        }
        if dropped > 0 {
            warn!("{}: {} songs without cluster labels dropped", model, dropped);
        }

        Ok(Self {
            feature_names: features.columns().to_vec(),
            rows,
            depths: label_indices.len(),
        })
    }

    fn mean_features(&self, rows: &[usize]) -> Vec<f64> {
        let mut sums = vec![0.0; self.feature_names.len()];
        for &row in rows {
            for (sum, value) in sums.iter_mut().zip(&self.rows[row].features) {
                *sum += value;
            }
        }
        let count = rows.len().max(1) as f64;
        sums.into_iter().map(|s| s / count).collect()
    }
}

/// Traversal state shared across all models of one run
struct LeafAccumulator {
    next_id: LeafId,
    leaves: LeafDocument,
}

/// Builds the branch tree and leaf clusters
pub struct Combiner<'a> {
    registry: &'a ModelRegistry,
    topology: &'a TreeTopology,
    best_of: usize,
}

impl<'a> Combiner<'a> {
    pub fn new(registry: &'a ModelRegistry, topology: &'a TreeTopology) -> Self {
        Self {
            registry,
            topology,
            best_of: DEFAULT_BEST_OF,
        }
    }

    pub fn with_best_of(mut self, best_of: usize) -> Self {
        self.best_of = best_of;
        self
    }

    /// Combine every model present in both collections
    pub fn combine(
        &self,
        clusters: &ModelCollection,
        features: &ModelCollection,
    ) -> MapResult<CombinedTree> {
        info!("Combine metadata for all {} models", clusters.len());
        let start = Instant::now();

        for model in features.keys().filter(|m| !clusters.contains_key(*m)) {
            warn!("Model {} has features but no cluster labels, excluded", model);
        }

        let mut accumulator = LeafAccumulator {
            next_id: 0,
            leaves: LeafDocument::new(),
        };
        let mut model_nodes = Vec::new();

        // Model branches are spaced for every cluster table, but only matched
        // models take a sibling index
        let mut model_index = 0;
        for (model, labels) in clusters {
            let Some(feature_table) = features.get(model) else {
                warn!("Model {} has cluster labels but no features, excluded", model);
                continue;
            };
            debug!("Processing geometry and features of {}", model);
            let joined = JoinedModel::join(model, labels, feature_table)?;
            let all_rows: Vec<usize> = (0..joined.rows.len()).collect();
            let children = self.build_nodes(&joined, &all_rows, 0, &mut accumulator)?;

            model_nodes.push(BranchNode {
                metadata: format!("Feature: {}", self.registry.display_name(model)),
                elements: Some(joined.rows.len()),
                params: Some(self.topology.model_params(clusters.len(), model_index)?),
                content: NodeContent::Children(children),
            });
            model_index += 1;
        }

        let root = BranchNode {
            metadata: String::new(),
            elements: None,
            params: Some(self.topology.root_params()?),
            content: NodeContent::Children(model_nodes),
        };
        info!(
            "Done. {} leaf clusters, time elapsed: {:.2} seconds",
            accumulator.leaves.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(CombinedTree {
            root,
            leaves: accumulator.leaves,
        })
    }

    fn build_nodes(
        &self,
        model: &JoinedModel,
        rows: &[usize],
        depth: usize,
        accumulator: &mut LeafAccumulator,
    ) -> MapResult<Vec<BranchNode>> {
        let mut groups: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for &row in rows {
            groups.entry(model.rows[row].labels[depth]).or_default().push(row);
        }

        let num_branches = groups.len();
        let mut nodes = Vec::with_capacity(num_branches);
        for (branch_index, group) in groups.values().enumerate() {
            let means = model.mean_features(group);
            let params = self
                .topology
                .cluster_params(depth, num_branches, branch_index)?;

            let content = if depth + 1 < model.depths {
                NodeContent::Children(self.build_nodes(model, group, depth + 1, accumulator)?)
            } else {
                let id = accumulator.next_id;
                accumulator.leaves.insert(id, self.build_leaf(model, group));
                accumulator.next_id += 1;
                NodeContent::LeafUid(id)
            };

            nodes.push(BranchNode {
                metadata: top_features(&model.feature_names, &means, self.best_of),
                elements: Some(group.len()),
                params,
                content,
            });
        }
        Ok(nodes)
    }

    fn build_leaf(&self, model: &JoinedModel, rows: &[usize]) -> LeafCluster {
        let axes: Vec<Vec<f64>> = (0..3)
            .map(|axis| {
                let values: Vec<f64> = rows.iter().map(|&r| model.rows[r].position[axis]).collect();
                normalise_axis(&values)
            })
            .collect();

        let songs = rows
            .iter()
            .enumerate()
            .map(|(i, &r)| {
                let row = &model.rows[r];
                let record = SongRecord {
                    geometry: Vector3 {
                        x: axes[0][i],
                        y: axes[1][i],
                        z: axes[2][i],
                    },
                    features: top_features(&model.feature_names, &row.features, self.best_of),
                };
                (row.key.clone(), record)
            })
            .collect();

        LeafCluster { stats: None, songs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPOLOGY: &str = r#"
- Length: 500.0
  StartWidth: 50.0
  EndWidth: 40.0
  StartTangent: {X: 0.0, Y: 0.0, Z: 100.0}
  EndTangent: {X: 0.0, Y: 0.0, Z: 100.0}
  Y-Angle: 0.0
  RotateSideBranches: [0.0]
- Length: 300.0
  StartWidth: 30.0
  EndWidth: 20.0
  StartTangent: {X: 0.0, Y: 0.0, Z: 100.0}
  EndTangent: {X: 0.0, Y: 0.0, Z: 100.0}
  Y-Angle: 30.0
  RotateSideBranches: [0.0, 90.0]
- Length: 100.0
  StartWidth: 10.0
  EndWidth: 5.0
  StartTangent: {X: 0.0, Y: 0.0, Z: 50.0}
  EndTangent: {X: 0.0, Y: 0.0, Z: 50.0}
  Y-Angle: 60.0
  RotateSideBranches: [45.0]
"#;

    fn label_table(rows: &[(&str, [f64; 3], [i64; 2])]) -> Table {
        let columns = ["X", "Y", "Z", "b_0", "b_1"].iter().map(|c| c.to_string()).collect();
        let mut table = Table::new(columns);
        for (key, p, b) in rows {
            table
                .push_row(*key, vec![p[0], p[1], p[2], b[0] as f64, b[1] as f64])
                .unwrap();
        }
        table
    }

    fn feature_table(rows: &[(&str, [f64; 2])]) -> Table {
        let mut table = Table::new(vec!["rock".into(), "jazz".into()]);
        for (key, values) in rows {
            table.push_row(*key, values.to_vec()).unwrap();
        }
        table
    }

    fn fixture() -> (ModelCollection, ModelCollection) {
        let labels = label_table(&[
            ("mjf-1", [0.0, 0.0, 0.0], [0, 0]),
            ("mjf-2", [2.0, 4.0, 1.0], [0, 0]),
            ("mjf-3", [1.0, 2.0, 1.0], [0, 1]),
            ("mjf-4", [5.0, 5.0, 5.0], [1, 0]),
        ]);
        let features = feature_table(&[
            ("mjf-1", [0.9, 0.1]),
            ("mjf-2", [0.7, 0.3]),
            ("mjf-3", [0.2, 0.8]),
            ("mjf-4", [0.5, 0.5]),
        ]);
        let mut clusters = ModelCollection::new();
        clusters.insert("genre".into(), labels.clone());
        clusters.insert("mood".into(), labels);
        let mut vectors = ModelCollection::new();
        vectors.insert("genre".into(), features.clone());
        vectors.insert("mood".into(), features);
        (clusters, vectors)
    }

    fn collect_leaf_ids(node: &BranchNode, ids: &mut Vec<LeafId>) {
        if let Some(id) = node.leaf_uid() {
            ids.push(id);
        }
        for child in node.children() {
            collect_leaf_ids(child, ids);
        }
    }

    #[test]
    fn test_top_features_format() {
        let names = vec!["rock".to_string(), "jazz".to_string(), "pop".to_string()];
        assert_eq!(
            top_features(&names, &[0.1234, 0.5, 0.1234], 2),
            "jazz: 50.0 % | rock: 12.3 %"
        );
        assert_eq!(top_features(&names, &[0.0, 0.0, 0.0], 7).matches('|').count(), 2);
    }

    #[test]
    fn test_leaf_ids_contiguous_across_models() {
        let (clusters, features) = fixture();
        let registry = ModelRegistry::default().with_model("genre", "MTG Genre");
        let topology = TreeTopology::from_yaml_str(TOPOLOGY).unwrap();
        let tree = Combiner::new(&registry, &topology)
            .combine(&clusters, &features)
            .unwrap();

        let mut ids = Vec::new();
        collect_leaf_ids(&tree.root, &mut ids);
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(tree.leaves.keys().copied().collect::<Vec<_>>(), ids);

        let models = tree.root.children();
        assert_eq!(models[0].metadata, "Feature: MTG Genre");
        assert_eq!(models[1].metadata, "Feature: mood");
        assert_eq!(models[0].elements, Some(4));
        assert_eq!(models[1].params.as_ref().unwrap().rot_z, 180.0);
        assert_eq!(tree.root.metadata, "");
        assert_eq!(tree.root.elements, None);
    }

    #[test]
    fn test_node_summary_and_params() {
        let (clusters, features) = fixture();
        let registry = ModelRegistry::default();
        let topology = TreeTopology::from_yaml_str(TOPOLOGY).unwrap();
        let tree = Combiner::new(&registry, &topology)
            .with_best_of(1)
            .combine(&clusters, &features)
            .unwrap();

        let genre = &tree.root.children()[0];
        let first = &genre.children()[0];
        assert_eq!(first.elements, Some(3));
        assert_eq!(first.metadata, "rock: 60.0 %");
        // depth 0 uses topology level 2, depth 1 has no level
        let params = first.params.as_ref().unwrap();
        assert_eq!(params.length, 100.0);
        assert_eq!(genre.children()[1].params.as_ref().unwrap().rot_z, 180.0);
        assert!(first.children()[0].params.is_none());
    }

    #[test]
    fn test_leaf_normalisation() {
        let (clusters, features) = fixture();
        let registry = ModelRegistry::default();
        let topology = TreeTopology::from_yaml_str(TOPOLOGY).unwrap();
        let tree = Combiner::new(&registry, &topology)
            .combine(&clusters, &features)
            .unwrap();

        let leaf = &tree.leaves[&0];
        assert_eq!(leaf.songs.len(), 2);
        let low = &leaf.songs["mjf-1"].geometry;
        let high = &leaf.songs["mjf-2"].geometry;
        assert_eq!((low.x, low.y, low.z), (0.0, 0.0, 0.0));
        assert_eq!((high.x, high.y, high.z), (1.0, 1.0, 1.0));

        // Single-song leaf: zero range on every axis
        let lone = &tree.leaves[&1].songs["mjf-3"].geometry;
        assert_eq!((lone.x, lone.y, lone.z), (0.0, 0.0, 0.0));
        assert_eq!(tree.leaves[&1].songs["mjf-3"].features, "jazz: 80.0 % | rock: 20.0 %");
    }

    #[test]
    fn test_right_join_drops_unlabelled_and_unmatched_models() {
        let (mut clusters, mut features) = fixture();
        clusters.remove("mood");
        features.insert(
            "instrument".into(),
            feature_table(&[("mjf-1", [0.1, 0.2])]),
        );
        let mut genre_features = features["genre"].clone();
        genre_features.push_row("mjf-99", vec![0.3, 0.3]).unwrap();
        features.insert("genre".into(), genre_features);

        let registry = ModelRegistry::default();
        let topology = TreeTopology::from_yaml_str(TOPOLOGY).unwrap();
        let tree = Combiner::new(&registry, &topology)
            .combine(&clusters, &features)
            .unwrap();

        assert_eq!(tree.root.children().len(), 1);
        assert_eq!(tree.root.children()[0].elements, Some(4));
        assert!(tree
            .leaves
            .values()
            .all(|leaf| !leaf.songs.contains_key("mjf-99")));
    }

    #[test]
    fn test_unmatched_model_takes_no_sibling_index() {
        let (mut clusters, features) = fixture();
        let labels = clusters["genre"].clone();
        clusters.insert("danceability".into(), labels);

        let registry = ModelRegistry::default();
        let topology = TreeTopology::from_yaml_str(TOPOLOGY).unwrap();
        let tree = Combiner::new(&registry, &topology)
            .combine(&clusters, &features)
            .unwrap();

        // Three cluster tables give 120 degree spacing; genre and mood are
        // the first and second placed branches
        let models = tree.root.children();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].metadata, "Feature: genre");
        assert_eq!(models[0].params.as_ref().unwrap().rot_z, 0.0);
        assert_eq!(models[1].params.as_ref().unwrap().rot_z, 120.0);
    }

    #[test]
    fn test_branch_document_shape() {
        let (clusters, features) = fixture();
        let registry = ModelRegistry::default();
        let topology = TreeTopology::from_yaml_str(TOPOLOGY).unwrap();
        let tree = Combiner::new(&registry, &topology)
            .combine(&clusters, &features)
            .unwrap();

        let json = serde_json::to_value(&tree.root).unwrap();
        assert!(json.get("elements").is_none());
        let leaf_node = &json["children"][0]["children"][0]["children"][0];
        assert_eq!(leaf_node["leaf_uid"], 0);
        assert!(leaf_node.get("children").is_none());
        assert_eq!(json["params"]["start_tangent"]["Z"], 100.0);

        let back: BranchNode = serde_json::from_value(json).unwrap();
        assert_eq!(back, tree.root);
    }
}
