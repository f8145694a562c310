//! Tree topology (render geometry per tree level)
//!
//! The topology file is a YAML sequence with one geometry descriptor per
//! level of the branch tree:
//!
//! | Index   | Level                         |
//! |---------|-------------------------------|
//! | 0       | Overall root                  |
//! | 1       | One branch per model          |
//! | 2 + d   | Cluster nodes at depth `d`    |
//!
//! A descriptor is either a regular curved branch (`Length`) or a level whose
//! last sibling continues straight as a "trunk" (`DB_Length` + `DB_Rotate`).
//!
//! ```yaml
//! - Length: 400.0
//!   StartWidth: 40.0
//!   EndWidth: 30.0
//!   StartTangent: {X: 0.0, Y: 0.0, Z: 100.0}
//!   EndTangent: {X: 0.0, Y: 0.0, Z: 100.0}
//!   Y-Angle: 45.0
//!   RotateSideBranches: [0.0, 90.0]
//!   DB_Length: 250.0
//!   DB_Rotate: 30.0
//! ```

use crate::error::{MapError, MapResult};
use arbor_common::Error;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Tangent used by the straight trunk sibling
pub const DEFAULT_TANGENT: Vector3 = Vector3 {
    x: 0.0,
    y: 0.0,
    z: 100.0,
};

/// Levels before the first cluster depth (root + model level)
pub const FIXED_LEVELS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    #[serde(rename = "X")]
    pub x: f64,
    #[serde(rename = "Y")]
    pub y: f64,
    #[serde(rename = "Z")]
    pub z: f64,
}

/// Curved branch fields
#[derive(Debug, Clone, PartialEq)]
pub struct CurvedGeometry {
    pub length: f64,
    pub start_tangent: Vector3,
    pub end_tangent: Vector3,
    pub y_angle: f64,
    pub rotate_side_branches: Vec<f64>,
}

/// Geometry variant of a tree level
#[derive(Debug, Clone, PartialEq)]
pub enum BranchGeometry {
    /// Every sibling is a curved branch
    Regular(CurvedGeometry),
    /// The last sibling continues straight; the others are curved
    Direct {
        /// Absent when the level only ever holds the trunk
        curved: Option<CurvedGeometry>,
        length: f64,
        rotate: f64,
    },
}

/// One level of the topology file
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawDescriptor")]
pub struct LevelDescriptor {
    pub geometry: BranchGeometry,
    pub start_width: f64,
    pub end_width: f64,
}

/// Render parameters attached to a branch node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchParams {
    pub length: f64,
    pub start_tangent: Vector3,
    pub end_tangent: Vector3,
    pub start_width: f64,
    pub end_width: f64,
    pub rot_y: f64,
    pub rot_z: f64,
    pub rot_children: f64,
}

/// On-disk descriptor; every key optional until validated
#[derive(Debug, Deserialize)]
struct RawDescriptor {
    #[serde(rename = "Length")]
    length: Option<f64>,
    #[serde(rename = "DB_Length")]
    db_length: Option<f64>,
    #[serde(rename = "DB_Rotate")]
    db_rotate: Option<f64>,
    #[serde(rename = "StartWidth")]
    start_width: f64,
    #[serde(rename = "EndWidth")]
    end_width: f64,
    #[serde(rename = "StartTangent")]
    start_tangent: Option<Vector3>,
    #[serde(rename = "EndTangent")]
    end_tangent: Option<Vector3>,
    #[serde(rename = "Y-Angle")]
    y_angle: Option<f64>,
    #[serde(rename = "RotateSideBranches", default)]
    rotate_side_branches: Vec<f64>,
}

impl TryFrom<RawDescriptor> for LevelDescriptor {
    type Error = String;

    fn try_from(raw: RawDescriptor) -> Result<Self, Self::Error> {
        let curved = match raw.length {
            Some(length) => {
                if raw.rotate_side_branches.is_empty() {
                    return Err("'RotateSideBranches' must not be empty".into());
                }
                Some(CurvedGeometry {
                    length,
                    start_tangent: raw.start_tangent.ok_or("missing 'StartTangent'")?,
                    end_tangent: raw.end_tangent.ok_or("missing 'EndTangent'")?,
                    y_angle: raw.y_angle.ok_or("missing 'Y-Angle'")?,
                    rotate_side_branches: raw.rotate_side_branches,
                })
            }
            None => None,
        };

        let geometry = match (raw.db_length, curved) {
            (Some(length), curved) => BranchGeometry::Direct {
                curved,
                length,
                rotate: raw.db_rotate.ok_or("'DB_Length' requires 'DB_Rotate'")?,
            },
            (None, Some(curved)) => BranchGeometry::Regular(curved),
            (None, None) => return Err("descriptor needs 'Length' or 'DB_Length'".into()),
        };

        Ok(Self {
            geometry,
            start_width: raw.start_width,
            end_width: raw.end_width,
        })
    }
}

impl LevelDescriptor {
    /// Render parameters of sibling `branch_index` out of `num_branches`
    pub fn params(&self, num_branches: usize, branch_index: usize) -> MapResult<BranchParams> {
        let (curved, spacing) = match &self.geometry {
            BranchGeometry::Direct {
                length, rotate, ..
            } if branch_index + 1 == num_branches => {
                return Ok(BranchParams {
                    length: *length,
                    start_tangent: DEFAULT_TANGENT,
                    end_tangent: DEFAULT_TANGENT,
                    start_width: self.start_width,
                    end_width: self.end_width,
                    rot_y: 0.0,
                    rot_z: 0.0,
                    rot_children: *rotate,
                });
            }
            BranchGeometry::Direct { curved, .. } => {
                let spacing = if num_branches > 1 {
                    360.0 / (num_branches - 1) as f64
                } else {
                    0.0
                };
                let curved = curved.as_ref().ok_or_else(|| {
                    MapError::InvalidTopology(format!(
                        "side branch {} of {} needs 'Length' geometry",
                        branch_index, num_branches
                    ))
                })?;
                (curved, spacing)
            }
            BranchGeometry::Regular(curved) => (curved, 360.0 / num_branches.max(1) as f64),
        };

        Ok(BranchParams {
            length: curved.length,
            start_tangent: curved.start_tangent,
            end_tangent: curved.end_tangent,
            start_width: self.start_width,
            end_width: self.end_width,
            rot_y: curved.y_angle,
            rot_z: branch_index as f64 * spacing,
            rot_children: curved.rotate_side_branches
                [branch_index % curved.rotate_side_branches.len()],
        })
    }
}

/// All levels of the topology file
#[derive(Debug, Clone, PartialEq)]
pub struct TreeTopology {
    levels: Vec<LevelDescriptor>,
}

impl TreeTopology {
    pub fn new(levels: Vec<LevelDescriptor>) -> MapResult<Self> {
        if levels.len() < FIXED_LEVELS {
            return Err(MapError::InvalidTopology(format!(
                "need at least {} levels (root and model), found {}",
                FIXED_LEVELS,
                levels.len()
            )));
        }
        Ok(Self { levels })
    }

    pub fn from_yaml_str(content: &str) -> MapResult<Self> {
        let levels: Vec<LevelDescriptor> = serde_yaml::from_str(content)
            .map_err(|e| MapError::InvalidTopology(e.to_string()))?;
        Self::new(levels)
    }

    pub fn load(path: &Path) -> MapResult<Self> {
        info!("Reading tree structure file {}", path.display());
        if !path.is_file() {
            return Err(Error::NotFound(path.display().to_string()).into());
        }
        let content = std::fs::read_to_string(path).map_err(Error::from)?;
        Self::from_yaml_str(&content)
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn level(&self, index: usize) -> Option<&LevelDescriptor> {
        self.levels.get(index)
    }

    /// Params of the overall root (a single branch)
    pub fn root_params(&self) -> MapResult<BranchParams> {
        self.levels[0].params(1, 0)
    }

    /// Params of a model branch
    pub fn model_params(&self, num_models: usize, model_index: usize) -> MapResult<BranchParams> {
        self.levels[1].params(num_models, model_index)
    }

    /// Params of a cluster node at `depth`; `None` when the file has no level for it
    pub fn cluster_params(
        &self,
        depth: usize,
        num_branches: usize,
        branch_index: usize,
    ) -> MapResult<Option<BranchParams>> {
        self.level(depth + FIXED_LEVELS)
            .map(|level| level.params(num_branches, branch_index))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPOLOGY: &str = r#"
- Length: 500.0
  StartWidth: 50.0
  EndWidth: 40.0
  StartTangent: {X: 0.0, Y: 0.0, Z: 200.0}
  EndTangent: {X: 0.0, Y: 0.0, Z: 200.0}
  Y-Angle: 0.0
  RotateSideBranches: [0.0]
- Length: 300.0
  StartWidth: 30.0
  EndWidth: 20.0
  StartTangent: {X: 10.0, Y: 0.0, Z: 100.0}
  EndTangent: {X: 0.0, Y: 10.0, Z: 100.0}
  Y-Angle: 45.0
  RotateSideBranches: [10.0, 20.0, 30.0]
  DB_Length: 250.0
  DB_Rotate: 15.0
- DB_Length: 120.0
  DB_Rotate: 5.0
  StartWidth: 8.0
  EndWidth: 4.0
"#;

    #[test]
    fn test_parse_levels() {
        let topology = TreeTopology::from_yaml_str(TOPOLOGY).unwrap();
        assert_eq!(topology.len(), 3);
        assert!(matches!(
            topology.level(0).unwrap().geometry,
            BranchGeometry::Regular(_)
        ));
        assert!(matches!(
            topology.level(1).unwrap().geometry,
            BranchGeometry::Direct { curved: Some(_), .. }
        ));
        assert!(matches!(
            topology.level(2).unwrap().geometry,
            BranchGeometry::Direct { curved: None, .. }
        ));
    }

    #[test]
    fn test_regular_spacing() {
        let topology = TreeTopology::from_yaml_str(TOPOLOGY).unwrap();
        let level = topology.level(0).unwrap();
        let params = level.params(4, 3).unwrap();
        assert_eq!(params.rot_z, 270.0);
        assert_eq!(params.length, 500.0);
        assert_eq!(params.rot_children, 0.0);
        assert_eq!(params.start_width, 50.0);
    }

    #[test]
    fn test_direct_side_branches() {
        let topology = TreeTopology::from_yaml_str(TOPOLOGY).unwrap();
        let level = topology.level(1).unwrap();

        // 4 siblings: 3 side branches spaced 360 / 3, then the trunk
        let second = level.params(4, 1).unwrap();
        assert_eq!(second.rot_z, 120.0);
        assert_eq!(second.rot_y, 45.0);
        assert_eq!(second.length, 300.0);
        assert_eq!(second.rot_children, 20.0);
        assert_eq!(second.start_tangent.x, 10.0);

        let third = level.params(4, 2).unwrap();
        assert_eq!(third.rot_z, 240.0);
        assert_eq!(third.rot_children, 30.0);
    }

    #[test]
    fn test_direct_last_sibling_is_trunk() {
        let topology = TreeTopology::from_yaml_str(TOPOLOGY).unwrap();
        let trunk = topology.level(1).unwrap().params(4, 3).unwrap();
        assert_eq!(trunk.length, 250.0);
        assert_eq!(trunk.start_tangent, DEFAULT_TANGENT);
        assert_eq!(trunk.end_tangent, DEFAULT_TANGENT);
        assert_eq!(trunk.rot_y, 0.0);
        assert_eq!(trunk.rot_z, 0.0);
        assert_eq!(trunk.rot_children, 15.0);
        assert_eq!(trunk.start_width, 30.0);
    }

    #[test]
    fn test_direct_single_branch_is_trunk() {
        let topology = TreeTopology::from_yaml_str(TOPOLOGY).unwrap();
        let only = topology.level(1).unwrap().params(1, 0).unwrap();
        assert_eq!(only.length, 250.0);
    }

    #[test]
    fn test_trunk_only_level_rejects_side_branch() {
        let topology = TreeTopology::from_yaml_str(TOPOLOGY).unwrap();
        let level = topology.level(2).unwrap();
        assert!(level.params(1, 0).is_ok());
        assert!(matches!(
            level.params(2, 0),
            Err(MapError::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_cluster_params_beyond_file() {
        let topology = TreeTopology::from_yaml_str(TOPOLOGY).unwrap();
        assert!(topology.cluster_params(0, 1, 0).unwrap().is_some());
        assert!(topology.cluster_params(1, 3, 0).unwrap().is_none());
    }

    #[test]
    fn test_invalid_descriptors() {
        assert!(TreeTopology::from_yaml_str("- StartWidth: 1.0\n  EndWidth: 1.0\n").is_err());
        let missing_rotate = "- DB_Length: 1.0\n  StartWidth: 1.0\n  EndWidth: 1.0\n";
        assert!(TreeTopology::from_yaml_str(missing_rotate).is_err());

        // Root level only
        let short = TOPOLOGY.split("- Length: 300.0").next().unwrap();
        assert!(matches!(
            TreeTopology::from_yaml_str(short),
            Err(MapError::InvalidTopology(_))
        ));
    }
}
