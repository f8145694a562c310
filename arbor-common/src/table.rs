//! Row-labelled numeric tables
//!
//! Every intermediate result of the mapping pipeline is a [`Table`]: one
//! string key column (the song key, `media_id`) followed by numeric columns.
//! Depending on the stage the numeric columns hold feature activations,
//! `X`/`Y`/`Z` coordinates, or `X`/`Y`/`Z` plus `b_0..b_{k-1}` cluster labels.
//!
//! Tables are collected per model in a [`ModelCollection`]. A `BTreeMap` is
//! used so that every stage visits models in the same order, which keeps
//! leaf-cluster ID assignment stable between runs.

use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap};

/// Default name of the key column
pub const KEY_COLUMN: &str = "media_id";

/// Per-model tables keyed by model short name
pub type ModelCollection = BTreeMap<String, Table>;

/// Numeric table with a unique string key per row
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    key_column: String,
    columns: Vec<String>,
    keys: Vec<String>,
    rows: Vec<Vec<f64>>,
    key_index: HashMap<String, usize>,
}

impl Table {
    /// Create an empty table with the given numeric column names
    pub fn new(columns: Vec<String>) -> Self {
        Self::with_key_column(KEY_COLUMN, columns)
    }

    /// Create an empty table with a custom key column name
    pub fn with_key_column(key_column: &str, columns: Vec<String>) -> Self {
        Self {
            key_column: key_column.to_string(),
            columns,
            keys: Vec::new(),
            rows: Vec::new(),
            key_index: HashMap::new(),
        }
    }

    /// Append a row
    ///
    /// Fails on a duplicate key or when the row width does not match the
    /// column count.
    pub fn push_row(&mut self, key: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let key = key.into();
        if values.len() != self.columns.len() {
            return Err(Error::InvalidInput(format!(
                "Row '{}' has {} values, table has {} columns",
                key,
                values.len(),
                self.columns.len()
            )));
        }
        if self.key_index.contains_key(&key) {
            return Err(Error::InvalidInput(format!("Duplicate song key '{}'", key)));
        }
        self.key_index.insert(key.clone(), self.keys.len());
        self.keys.push(key);
        self.rows.push(values);
        Ok(())
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of numeric columns
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn row(&self, index: usize) -> &[f64] {
        &self.rows[index]
    }

    /// Row index for a song key
    pub fn position(&self, key: &str) -> Option<usize> {
        self.key_index.get(key).copied()
    }

    /// Row values for a song key
    pub fn get(&self, key: &str) -> Option<&[f64]> {
        self.position(key).map(|i| self.rows[i].as_slice())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Copy out a single column by name
    pub fn column(&self, name: &str) -> Result<Vec<f64>> {
        let index = self
            .column_index(name)
            .ok_or_else(|| Error::NotFound(format!("Column '{}'", name)))?;
        Ok(self.rows.iter().map(|row| row[index]).collect())
    }

    /// Copy of the first `limit` rows
    pub fn head(&self, limit: usize) -> Self {
        self.select(&(0..limit.min(self.len())).collect::<Vec<_>>())
    }

    /// Copy of the given rows, in the given order
    pub fn select(&self, indices: &[usize]) -> Self {
        let mut table = Self::with_key_column(&self.key_column, self.columns.clone());
        for &i in indices {
            table.key_index.insert(self.keys[i].clone(), table.keys.len());
            table.keys.push(self.keys[i].clone());
            table.rows.push(self.rows[i].clone());
        }
        table
    }

    /// Keep the row set and order but replace all numeric columns
    ///
    /// `values` must hold one row per existing row.
    pub fn replace_columns(&self, columns: Vec<String>, values: Vec<Vec<f64>>) -> Result<Self> {
        if values.len() != self.len() {
            return Err(Error::InvalidInput(format!(
                "Expected {} rows, got {}",
                self.len(),
                values.len()
            )));
        }
        let mut table = Self::with_key_column(&self.key_column, columns);
        for (key, row) in self.keys.iter().zip(values) {
            table.push_row(key.clone(), row)?;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        let mut table = Table::new(vec!["rock".into(), "jazz".into()]);
        table.push_row("mjf-1", vec![0.9, 0.1]).unwrap();
        table.push_row("mjf-2", vec![0.2, 0.8]).unwrap();
        table.push_row("mjf-3", vec![0.5, 0.5]).unwrap();
        table
    }

    #[test]
    fn test_push_row_rejects_duplicate_key() {
        let mut table = sample();
        let result = table.push_row("mjf-2", vec![0.0, 0.0]);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_push_row_rejects_width_mismatch() {
        let mut table = sample();
        assert!(table.push_row("mjf-4", vec![0.0]).is_err());
    }

    #[test]
    fn test_column_lookup() {
        let table = sample();
        assert_eq!(table.column("jazz").unwrap(), vec![0.1, 0.8, 0.5]);
        assert!(matches!(table.column("blues"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_head_and_select_keep_order() {
        let table = sample();
        let head = table.head(2);
        assert_eq!(head.keys(), &["mjf-1".to_string(), "mjf-2".to_string()]);
        assert_eq!(table.head(10).len(), 3);

        let picked = table.select(&[2, 0]);
        assert_eq!(picked.keys(), &["mjf-3".to_string(), "mjf-1".to_string()]);
        assert_eq!(picked.get("mjf-1"), Some(&[0.9, 0.1][..]));
    }

    #[test]
    fn test_replace_columns() {
        let table = sample();
        let xyz = table
            .replace_columns(
                vec!["X".into(), "Y".into(), "Z".into()],
                vec![vec![1.0, 2.0, 3.0]; 3],
            )
            .unwrap();
        assert_eq!(xyz.width(), 3);
        assert_eq!(xyz.keys(), table.keys());
        assert!(table.replace_columns(vec!["X".into()], vec![vec![1.0]]).is_err());
    }
}
