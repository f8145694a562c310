//! Feature export cleaning (`clean` stage)
//!
//! The tagging subsystem exports one row per (song, model) pair:
//!
//! ```text
//! media_id,model_name,data
//! mjf-12,genre,"{""rock"": 0.81, ""jazz"": 0.02, ...}"
//! ```
//!
//! Cleaning sorts the rows by the numeric suffix of the song key, splits them
//! by model, and expands the JSON payload into one numeric column per feature.

use crate::error::MapResult;
use arbor_common::table::{ModelCollection, Table};
use arbor_common::Error;
use csv::ReaderBuilder;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One raw export row
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRow {
    pub media_id: String,
    pub model_name: String,
    /// Feature name → activation, in export order
    pub data: Map<String, Value>,
}

/// Origin of per-song feature vectors
///
/// Database-backed sources live outside this crate; anything that can hand
/// over per-model feature tables plugs in here.
pub trait FeatureSource {
    /// Human-readable description for logs
    fn describe(&self) -> String;

    /// Fetch all feature tables, optionally limited to the first `limit` export rows
    fn fetch(&self, limit: Option<usize>) -> MapResult<ModelCollection>;
}

/// Flat CSV export with a JSON `data` column
#[derive(Debug, Clone)]
pub struct CsvExportSource {
    path: PathBuf,
}

impl CsvExportSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parse the export file into raw rows
    pub fn read_rows(&self, limit: Option<usize>) -> MapResult<Vec<ExportRow>> {
        read_export(&self.path, limit)
    }
}

impl FeatureSource for CsvExportSource {
    fn describe(&self) -> String {
        format!("feature export {}", self.path.display())
    }

    fn fetch(&self, limit: Option<usize>) -> MapResult<ModelCollection> {
        let rows = self.read_rows(limit)?;
        split_by_model(rows)
    }
}

fn read_export(path: &Path, limit: Option<usize>) -> MapResult<Vec<ExportRow>> {
    if !path.is_file() {
        return Err(Error::NotFound(path.display().to_string()).into());
    }
    info!("Reading feature export from {}", path.display());

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(Error::from)?;
    let headers = reader.headers().map_err(Error::from)?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| Error::InvalidInput(format!("Export is missing column '{}'", name)))
    };
    let id_col = column("media_id")?;
    let model_col = column("model_name")?;
    let data_col = column("data")?;

    let mut rows = Vec::new();
    for record in reader.records() {
        if limit.is_some_and(|limit| rows.len() >= limit) {
            break;
        }
        let record = record.map_err(Error::from)?;
        let media_id = record.get(id_col).unwrap_or_default().to_string();
        let model_name = record.get(model_col).unwrap_or_default().to_string();
        let data: Map<String, Value> =
            serde_json::from_str(record.get(data_col).unwrap_or_default()).map_err(|e| {
                Error::InvalidInput(format!("Invalid data JSON for '{}': {}", media_id, e))
            })?;
        rows.push(ExportRow {
            media_id,
            model_name,
            data,
        });
    }
    debug!(rows = rows.len(), "Feature export parsed");
    Ok(rows)
}

/// Sort key of a song: the integer after the last `-` (`mjf-12` → 12)
pub fn song_sort_index(media_id: &str) -> i64 {
    media_id
        .rsplit('-')
        .next()
        .and_then(|suffix| suffix.parse().ok())
        .unwrap_or(0)
}

/// Sort rows by song index, then build one feature table per model
pub fn split_by_model(mut rows: Vec<ExportRow>) -> MapResult<ModelCollection> {
    rows.sort_by_key(|row| song_sort_index(&row.media_id));

    let mut grouped: BTreeMap<String, Vec<ExportRow>> = BTreeMap::new();
    for row in rows {
        grouped.entry(row.model_name.clone()).or_default().push(row);
    }
    info!("There are {} models in the dataset", grouped.len());

    let mut collection = ModelCollection::new();
    for (model, model_rows) in grouped {
        debug!("Cleaning {}...", model);
        let columns: Vec<String> = model_rows
            .first()
            .map(|row| row.data.keys().cloned().collect())
            .unwrap_or_default();

        let mut table = Table::new(columns.clone());
        for row in model_rows {
            if row.data.len() != columns.len() {
                return Err(Error::InvalidInput(format!(
                    "Song '{}' has {} features for model '{}', expected {}",
                    row.media_id,
                    row.data.len(),
                    model,
                    columns.len()
                ))
                .into());
            }
            let values = columns
                .iter()
                .map(|name| {
                    row.data.get(name).and_then(Value::as_f64).ok_or_else(|| {
                        Error::InvalidInput(format!(
                            "Song '{}' has no numeric value for '{}' ({})",
                            row.media_id, name, model
                        ))
                    })
                })
                .collect::<Result<Vec<f64>, Error>>()?;
            table.push_row(row.media_id, values)?;
        }
        collection.insert(model, table);
    }
    Ok(collection)
}
