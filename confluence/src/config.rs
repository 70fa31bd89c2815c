//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program.
use std::{
    fs, io,
    num::NonZeroU64,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{emitter, source};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
}

fn default_update_interval() -> NonZeroU64 {
    NonZeroU64::new(30).unwrap_or(NonZeroU64::MIN)
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Behavior of the aggregator itself
    #[serde(default)]
    pub aggregator: confluence_aggregator::Config,
    /// Buffer length of the consumer's channel. Zero is a hand-off.
    #[serde(default)]
    pub channel_length: usize,
    /// Seconds between reconciles of the source set
    #[serde(default = "default_update_interval")]
    pub update_interval_seconds: NonZeroU64,
    /// Where the wanted source ids come from
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub source: source::Config,
    /// The synthetic producer run for each source id
    pub emitter: emitter::Config,
}

impl Config {
    /// The reconcile period.
    #[must_use]
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_seconds.get())
    }

    /// Options for the consuming session.
    #[must_use]
    pub fn consume_options(&self) -> confluence_aggregator::ConsumeOptions {
        confluence_aggregator::ConsumeOptions::default().channel_length(self.channel_length)
    }
}

/// Parse a [`Config`] from YAML.
///
/// # Errors
///
/// Returns an error if `contents` is not a valid configuration.
pub fn parse(contents: &str) -> Result<Config, Error> {
    Ok(serde_yaml::from_str(contents)?)
}

/// Load a [`Config`] from the file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not hold a valid
/// configuration.
pub fn load(path: &Path) -> Result<Config, Error> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    parse(&contents)
}
