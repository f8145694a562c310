//! # Arbor Common Library
//!
//! Shared code for the Arbor mapping tools including:
//! - Error types
//! - Configuration loading (TOML, resolution order)
//! - Row-labelled numeric tables and their CSV persistence
//! - JSON document helpers

pub mod config;
pub mod error;
pub mod store;
pub mod table;

pub use error::{Error, Result};
pub use store::TableStore;
pub use table::{ModelCollection, Table};
