//! Config file resolution and graceful degradation
//!
//! Note: Uses serial_test crate to prevent ENV variable race conditions.
//! Tests that manipulate ARBOR_CONFIG are marked with #[serial].

use arbor_common::config::{load_config, resolve_config_path, TomlConfig, CONFIG_ENV_VAR};
use arbor_common::Error;
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
#[serial]
fn test_cli_argument_takes_priority_over_env() {
    let dir = TempDir::new().unwrap();
    let cli_path = dir.path().join("cli.toml");
    env::set_var(CONFIG_ENV_VAR, dir.path().join("env.toml"));

    let resolved = resolve_config_path(Some(&cli_path));
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(resolved, Some(cli_path));
}

#[test]
#[serial]
fn test_env_variable_used_without_cli_argument() {
    let dir = TempDir::new().unwrap();
    let env_path = dir.path().join("env.toml");
    fs::write(&env_path, "[combiner]\nbest_of = 3\n").unwrap();
    env::set_var(CONFIG_ENV_VAR, &env_path);

    let config = load_config(None);
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(config.unwrap().combiner.best_of, 3);
}

#[test]
#[serial]
fn test_explicit_missing_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope.toml");

    let result = load_config(Some(&missing));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_full_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
[dr]
perplexity = 20.0
iterations = 500

[clustering]
branching_factors = [4, 3, 2]
gamma = 0.5

[combiner]
best_of = 5
tree_structure = "geometry/tree.yaml"

[models]
genre = "Genre"
instrument = "Instrument"

[files]
branches = "ue_branches.json"

[sources]
feature_export = "data/exported.csv"

[logging]
level = "debug"
"#,
    )
    .unwrap();

    let config = TomlConfig::load(&path).unwrap();
    assert_eq!(config.dr.iterations, 500);
    assert_eq!(config.clustering.branching_factors, vec![4, 3, 2]);
    assert_eq!(config.clustering.gamma, 0.5);
    assert_eq!(config.combiner.tree_structure.to_str(), Some("geometry/tree.yaml"));
    assert_eq!(config.models.len(), 2);
    assert_eq!(config.files.branches, "ue_branches.json");
    assert_eq!(config.files.leaves, "leaves.json");
    assert!(config.sources.metadata_export.is_none());
    assert_eq!(config.logging.level, "debug");
}
