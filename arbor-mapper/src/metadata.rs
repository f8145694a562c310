//! Song metadata enrichment (`metadata` stage)
//!
//! Builds the containing-clusters map (song → leaf IDs) from the leaf
//! document and attaches it to each song's display metadata.

use crate::combiner::{LeafDocument, LeafId};
use crate::error::MapResult;
use arbor_common::store::read_json;
use arbor_common::Error;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

/// Song key → IDs of the leaf clusters containing it, ascending
pub type ContainingClusters = BTreeMap<String, Vec<LeafId>>;

/// Song key → enriched metadata record
pub type MetadataDocument = BTreeMap<String, MetadataRecord>;

/// Date format of exports
pub const EXPORT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Display date format, e.g. `Saturday, 7. July 2001`
pub const DISPLAY_DATE_FORMAT: &str = "%A, %-d. %B %Y";

/// Display fields of a recording
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SongDetails {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub concert_name: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// Seconds
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub musicians: Vec<String>,
}

/// One entry of a metadata export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongMetadata {
    pub media_id: String,
    #[serde(default)]
    pub media_path: Option<String>,
    #[serde(default)]
    pub metadata: SongDetails,
}

/// Entry of the metadata document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub media_path: Option<String>,
    pub metadata: SongDetails,
    pub clusters: Vec<LeafId>,
}

/// Origin of per-song display metadata
pub trait MetadataSource {
    fn describe(&self) -> String;

    fn fetch(&self, limit: Option<usize>) -> MapResult<Vec<SongMetadata>>;
}

/// JSON array export of [`SongMetadata`] entries
#[derive(Debug, Clone)]
pub struct JsonMetadataSource {
    path: PathBuf,
}

impl JsonMetadataSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MetadataSource for JsonMetadataSource {
    fn describe(&self) -> String {
        format!("metadata export {}", self.path.display())
    }

    fn fetch(&self, limit: Option<usize>) -> MapResult<Vec<SongMetadata>> {
        if !self.path.is_file() {
            return Err(Error::NotFound(self.path.display().to_string()).into());
        }
        let mut entries: Vec<SongMetadata> = read_json(&self.path)?;
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }
}

/// Song → leaf IDs, scanning leaves in ascending ID order
pub fn containing_clusters(leaves: &LeafDocument) -> ContainingClusters {
    info!("Collect containing clusters of {} leaves", leaves.len());
    let mut map = ContainingClusters::new();
    for (&id, leaf) in leaves {
        for song in leaf.songs.keys() {
            map.entry(song.clone()).or_default().push(id);
        }
    }
    map
}

/// Rewrite an export date as `Saturday, 7. July 2001`
///
/// Dates that do not parse are returned unchanged.
pub fn human_readable_date(date: &str) -> String {
    match NaiveDate::parse_from_str(date, EXPORT_DATE_FORMAT) {
        Ok(parsed) => parsed.format(DISPLAY_DATE_FORMAT).to_string(),
        Err(e) => {
            warn!("Keeping unparseable date '{}': {}", date, e);
            date.to_string()
        }
    }
}

/// Right join of metadata on the containing-clusters map
///
/// Every song of the map gets a record; songs without metadata get an
/// empty one, metadata of songs outside the map is dropped.
pub fn enrich(metadata: Vec<SongMetadata>, clusters: &ContainingClusters) -> MetadataDocument {
    let mut by_song: BTreeMap<String, SongMetadata> = metadata
        .into_iter()
        .map(|entry| (entry.media_id.clone(), entry))
        .collect();

    let mut missing = 0usize;
    let document: MetadataDocument = clusters
        .iter()
        .map(|(song, ids)| {
            let record = match by_song.remove(song) {
                Some(entry) => {
                    let mut details = entry.metadata;
                    details.date = details.date.as_deref().map(human_readable_date);
                    MetadataRecord {
                        media_path: entry.media_path,
                        metadata: details,
                        clusters: ids.clone(),
                    }
                }
                None => {
                    missing += 1;
                    MetadataRecord {
                        clusters: ids.clone(),
                        ..Default::default()
                    }
                }
            };
            (song.clone(), record)
        })
        .collect();

    if missing > 0 {
        warn!("{} clustered songs have no metadata", missing);
    }
    if !by_song.is_empty() {
        info!("{} songs with metadata are in no cluster", by_song.len());
    }
    document
}
