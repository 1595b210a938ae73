//! Configuration loading and schema definitions for shardrun.
//!
//! This module provides types and functions for loading shardrun
//! configuration from TOML files or strings, plus the validation and path
//! expansion applied after loading.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use regex::Regex;

/// Loads shardrun configuration from a TOML file.
///
/// Paths inside the file are tilde-expanded and the result is validated.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema or fails validation
///
/// # Example
///
/// ```no_run
/// use shardrun::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("shardrun.toml"))?;
/// println!("Features: {:?}", config.features);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config.expand_paths();
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(config)
}

/// Loads shardrun configuration from a TOML string.
///
/// # Example
///
/// ```
/// use shardrun::config::load_config_str;
///
/// let config = load_config_str(r#"
///     features = ["cuda"]
///
///     [core]
///     gpus = 2
/// "#)?;
///
/// assert_eq!(config.core.gpus, 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;

    config.expand_paths();
    config.validate()?;

    Ok(config)
}

impl Config {
    /// Checks cross-field constraints that the schema alone cannot express.
    ///
    /// Worker counts and resource costs are checked later, when stages are
    /// constructed against the actual inventory.
    pub fn validate(&self) -> Result<()> {
        if self.features.is_empty() {
            bail!("at least one feature must be enabled");
        }
        if self.multi_node.nodes == 0 {
            bail!("multi_node.nodes must be at least 1");
        }

        Regex::new(&self.tests.pattern)
            .with_context(|| format!("invalid tests.pattern '{}'", self.tests.pattern))?;
        if let Some(filter) = &self.tests.filter {
            Regex::new(filter).with_context(|| format!("invalid tests.filter '{}'", filter))?;
        }

        shell_words::split(&self.tests.extra_args).context("invalid tests.extra_args")?;
        for custom in &self.tests.custom {
            if let Some(args) = &custom.args {
                shell_words::split(args)
                    .with_context(|| format!("invalid args for custom test '{}'", custom.file))?;
            }
        }

        if self.tests.runner == RunnerKind::Gtest && self.tests.gtest_binary.is_none() {
            bail!("tests.gtest_binary is required for the gtest runner");
        }

        Ok(())
    }

    /// The per-test timeout, if any.
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.execution
            .timeout_secs
            .map(std::time::Duration::from_secs)
    }

    /// Expands `~` in every configured path.
    pub fn expand_paths(&mut self) {
        let tests = &mut self.tests;
        for file in &mut tests.files {
            *file = expand(file);
        }
        for path in [
            &mut tests.root,
            &mut tests.gtest_binary,
            &mut tests.working_dir,
        ]
        .into_iter()
        .flatten()
        {
            *path = expand(path);
        }
    }
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}
