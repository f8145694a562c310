//! Tabular store: CSV persistence of per-model tables and JSON documents
//!
//! Every pipeline stage persists its output so that a later run can resume at
//! any stage boundary. Tables are stored one file per model, named
//! `{prefix}-{model}.csv`, where the prefix identifies the stage.
//!
//! # File layout
//! ```text
//! output/
//! ├── vec-genre.csv        (features)
//! ├── dr-genre.csv         (X, Y, Z)
//! ├── cluster-genre.csv    (X, Y, Z, b_0, b_1, ...)
//! └── branches.json ...
//! ```
//!
//! Numbers are written with Rust's shortest round-trip formatting, so label
//! columns come out as plain integers (`-1`, `0`, `3`).

use crate::table::{ModelCollection, Table};
use crate::{Error, Result};
use csv::{ReaderBuilder, WriterBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Delimiter between stage prefix and model name in file names
pub const PREFIX_DELIMITER: &str = "-";

/// Suffix of persisted tables
pub const CSV_SUFFIX: &str = ".csv";

/// Store rooted at one output folder
#[derive(Debug, Clone)]
pub struct TableStore {
    folder: PathBuf,
}

impl TableStore {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Path of the table for `model` written by the stage with `prefix`
    pub fn table_path(&self, prefix: &str, model: &str) -> PathBuf {
        self.folder
            .join(format!("{}{}{}{}", prefix, PREFIX_DELIMITER, model, CSV_SUFFIX))
    }

    /// Write every table of a collection as `{prefix}-{model}.csv`
    pub fn save_collection(&self, prefix: &str, collection: &ModelCollection) -> Result<()> {
        info!(
            "Exporting {} tables with prefix '{}' to {}",
            collection.len(),
            prefix,
            self.folder.display()
        );
        for (model, table) in collection {
            let path = self.table_path(prefix, model);
            debug!("Exporting {}", path.display());
            save_table(&path, table)?;
        }
        Ok(())
    }

    /// Read every `{prefix}-*.csv` in the folder
    ///
    /// When `limit` is set, each table is truncated to its first `limit` rows.
    pub fn load_collection(&self, prefix: &str, limit: Option<usize>) -> Result<ModelCollection> {
        let file_prefix = format!("{}{}", prefix, PREFIX_DELIMITER);
        let mut collection = ModelCollection::new();

        for entry in fs::read_dir(&self.folder)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(model) = file_name
                .strip_prefix(&file_prefix)
                .and_then(|rest| rest.strip_suffix(CSV_SUFFIX))
            else {
                continue;
            };
            if model.is_empty() {
                continue;
            }

            debug!("Reading {}", file_name);
            let table = load_table(&entry.path())?;
            let table = match limit {
                Some(limit) => table.head(limit),
                None => table,
            };
            collection.insert(model.to_string(), table);
        }

        info!(
            "Read {} tables with prefix '{}' from {}",
            collection.len(),
            prefix,
            self.folder.display()
        );
        Ok(collection)
    }
}

/// Create the parent folders of `path` if missing
pub fn create_parent_folders(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Write a single table with a header row; the first column is the key
pub fn save_table(path: &Path, table: &Table) -> Result<()> {
    create_parent_folders(path)?;
    let mut writer = WriterBuilder::new().from_path(path)?;

    let mut header = Vec::with_capacity(table.width() + 1);
    header.push(table.key_column().to_string());
    header.extend(table.columns().iter().cloned());
    writer.write_record(&header)?;

    for (key, row) in table.keys().iter().zip(table.rows()) {
        let mut record = Vec::with_capacity(row.len() + 1);
        record.push(key.clone());
        record.extend(row.iter().map(|v| v.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a single table written by [`save_table`] (or any CSV of that shape)
pub fn load_table(path: &Path) -> Result<Table> {
    if !path.is_file() {
        return Err(Error::NotFound(path.display().to_string()));
    }
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let mut header_iter = headers.iter();
    let key_column = header_iter
        .next()
        .ok_or_else(|| Error::InvalidInput(format!("{}: empty header", path.display())))?;
    let columns: Vec<String> = header_iter.map(str::to_string).collect();

    let mut table = Table::with_key_column(key_column, columns);
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let key = record.get(0).unwrap_or_default().to_string();
        let values = record
            .iter()
            .skip(1)
            .map(|field| {
                field.trim().parse::<f64>().map_err(|e| {
                    Error::InvalidInput(format!(
                        "{} row {}: '{}' is not numeric ({})",
                        path.display(),
                        line + 1,
                        field,
                        e
                    ))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        table.push_row(key, values)?;
    }
    Ok(table)
}

/// Write a headerless, indexless numeric matrix
pub fn save_matrix(path: &Path, matrix: &[Vec<f64>]) -> Result<()> {
    create_parent_folders(path)?;
    let mut writer = WriterBuilder::new().has_headers(false).from_path(path)?;
    for row in matrix {
        writer.write_record(row.iter().map(|v| v.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a matrix written by [`save_matrix`]
pub fn load_matrix(path: &Path) -> Result<Vec<Vec<f64>>> {
    let mut reader = ReaderBuilder::new().has_headers(false).from_path(path)?;
    let mut matrix = Vec::new();
    for record in reader.records() {
        let row = record?
            .iter()
            .map(|field| {
                field
                    .parse::<f64>()
                    .map_err(|e| Error::InvalidInput(format!("'{}': {}", field, e)))
            })
            .collect::<Result<Vec<f64>>>()?;
        matrix.push(row);
    }
    Ok(matrix)
}

/// Serialize a document to a JSON file, creating parent folders
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    create_parent_folders(path)?;
    let mut writer = BufWriter::new(fs::File::create(path)?);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

/// Deserialize a JSON file
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.is_file() {
        return Err(Error::NotFound(path.display().to_string()));
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn labelled_table() -> Table {
        let mut table = Table::new(vec!["X".into(), "b_0".into()]);
        table.push_row("mjf-1", vec![0.25, -1.0]).unwrap();
        table.push_row("mjf-2", vec![1.5, 3.0]).unwrap();
        table
    }

    #[test]
    fn test_labels_written_as_integers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/cluster-genre.csv");
        save_table(&path, &labelled_table()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "media_id,X,b_0");
        assert_eq!(lines[1], "mjf-1,0.25,-1");
        assert_eq!(lines[2], "mjf-2,1.5,3");
    }

    #[test]
    fn test_load_collection_filters_by_prefix_and_applies_limit() {
        let dir = TempDir::new().unwrap();
        let store = TableStore::new(dir.path());
        let mut collection = ModelCollection::new();
        collection.insert("genre".into(), labelled_table());
        collection.insert("mood".into(), labelled_table());
        store.save_collection("dr", &collection).unwrap();
        fs::write(dir.path().join("vec-genre.csv"), "media_id,a\nx,1\n").unwrap();
        fs::write(dir.path().join("dr-notes.txt"), "ignored").unwrap();

        let loaded = store.load_collection("dr", Some(1)).unwrap();
        assert_eq!(loaded.keys().collect::<Vec<_>>(), vec!["genre", "mood"]);
        assert_eq!(loaded["genre"].len(), 1);
        assert_eq!(loaded["genre"].keys()[0], "mjf-1");
    }

    #[test]
    fn test_load_table_rejects_non_numeric() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vec-bad.csv");
        fs::write(&path, "media_id,a\nmjf-1,abc\n").unwrap();
        assert!(matches!(load_table(&path), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_missing_table_is_not_found() {
        let dir = TempDir::new().unwrap();
        let result = load_table(&dir.path().join("missing.csv"));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_matrix_is_headerless() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relations.csv");
        save_matrix(&path, &[vec![1.0, 0.5], vec![0.25, 1.0]]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1,0.5\n0.25,1\n");
        assert_eq!(load_matrix(&path).unwrap()[0], vec![1.0, 0.5]);
    }
}
