//! Model registry
//!
//! Maps model short names (the `model_name` of the feature export and the
//! `{model}` part of table file names) to human-readable display names. Built
//! once at startup from configuration and handed to the stages that need it.

use std::collections::BTreeMap;

/// Registry of known audio-tagging models
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    display_names: BTreeMap<String, String>,
}

impl ModelRegistry {
    pub fn new(display_names: BTreeMap<String, String>) -> Self {
        Self { display_names }
    }

    /// Register or rename a model
    pub fn with_model(mut self, short_name: &str, display_name: &str) -> Self {
        self.display_names
            .insert(short_name.to_string(), display_name.to_string());
        self
    }

    /// Display name, falling back to the short name for unknown models
    pub fn display_name<'a>(&'a self, short_name: &'a str) -> &'a str {
        self.display_names
            .get(short_name)
            .map(String::as_str)
            .unwrap_or(short_name)
    }

    pub fn contains(&self, short_name: &str) -> bool {
        self.display_names.contains_key(short_name)
    }

    pub fn len(&self) -> usize {
        self.display_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.display_names.is_empty()
    }
}
