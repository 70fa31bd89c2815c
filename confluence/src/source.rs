//! Source-id providers
//!
//! A provider answers one question: which sources should be feeding the
//! stream right now. The [`crate::manager::SourceManager`] asks on every
//! reconcile and adds or removes producers to match. Providers never fail
//! from the caller's point of view; a provider that cannot fetch its list
//! logs a warning and reports no sources for that round.

use std::{io, path::PathBuf, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub mod file;
pub mod filter;

pub use file::FileMetaFetcher;
pub use filter::{AllProvider, Mode, RegexProvider};

/// Upper bound on a single fetch of source metadata.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
/// Errors produced by source providers and fetchers.
pub enum Error {
    /// The source list could not be read.
    #[error("Failed to read source list {path:?}: {source}")]
    Read {
        /// Path of the source list
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The filter pattern did not compile.
    #[error("Invalid source filter pattern: {0}")]
    Regex(#[from] regex::Error),
    /// A fetch did not complete within its deadline.
    #[error("Fetching source metadata timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Configuration for [`Provider`]
pub enum Config {
    /// A fixed list of source ids.
    Static {
        /// The source ids, in no particular order.
        source_ids: Vec<String>,
    },
    /// Source ids read from a file on every fetch.
    File {
        /// Newline separated source ids. Blank lines and lines starting with
        /// `#` are ignored.
        path: PathBuf,
        /// Optional pattern restricting which ids are kept.
        #[serde(default)]
        filter: Option<Filter>,
    },
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// A regular expression applied to fetched source ids.
pub enum Filter {
    /// Drop every id matching the pattern.
    Blacklist(String),
    /// Keep only ids matching the pattern.
    Whitelist(String),
}

#[async_trait]
/// Reports the source ids that should currently be producing.
pub trait SourceProvider: Send + Sync {
    /// The desired source ids. May contain duplicates.
    async fn source_ids(&self) -> Vec<String>;
}

#[async_trait]
/// Fetches raw source metadata, the input to [`AllProvider`] and
/// [`RegexProvider`].
pub trait MetaFetcher: Send + Sync {
    /// Every source id known to the fetcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    async fn meta(&self) -> Result<Vec<String>, Error>;
}

/// A provider returning the same ids every time.
#[derive(Debug, Clone, Default)]
pub struct StaticProvider {
    source_ids: Vec<String>,
}

impl StaticProvider {
    /// Create a provider for a fixed set of ids.
    #[must_use]
    pub fn new(source_ids: Vec<String>) -> Self {
        Self { source_ids }
    }
}

#[async_trait]
impl SourceProvider for StaticProvider {
    async fn source_ids(&self) -> Vec<String> {
        self.source_ids.clone()
    }
}

/// Fetch metadata within `deadline`. Failures are logged and reported as an
/// empty list.
pub(crate) async fn fetch<F>(fetcher: &F, deadline: Duration) -> Vec<String>
where
    F: MetaFetcher + ?Sized,
{
    let res = match tokio::time::timeout(deadline, fetcher.meta()).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout(deadline)),
    };
    match res {
        Ok(ids) => ids,
        Err(err) => {
            warn!("failed to read source metadata: {err}");
            Vec::new()
        }
    }
}

#[derive(Debug)]
/// The provider selected by configuration.
pub enum Provider {
    /// See [`StaticProvider`] for details.
    Static(StaticProvider),
    /// See [`AllProvider`] for details.
    All(AllProvider<FileMetaFetcher>),
    /// See [`RegexProvider`] for details.
    Regex(RegexProvider<FileMetaFetcher>),
}

impl Provider {
    /// Create a new [`Provider`] from its configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured filter pattern does not compile.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let provider = match config {
            Config::Static { source_ids } => Self::Static(StaticProvider::new(source_ids.clone())),
            Config::File { path, filter: None } => {
                Self::All(AllProvider::new(FileMetaFetcher::new(path.clone())))
            }
            Config::File {
                path,
                filter: Some(filter),
            } => {
                let (mode, pattern) = match filter {
                    Filter::Blacklist(pattern) => (Mode::Blacklist, pattern),
                    Filter::Whitelist(pattern) => (Mode::Whitelist, pattern),
                };
                Self::Regex(RegexProvider::new(
                    mode,
                    pattern,
                    FileMetaFetcher::new(path.clone()),
                )?)
            }
        };
        Ok(provider)
    }
}

#[async_trait]
impl SourceProvider for Provider {
    async fn source_ids(&self) -> Vec<String> {
        match self {
            Self::Static(inner) => inner.source_ids().await,
            Self::All(inner) => inner.source_ids().await,
            Self::Regex(inner) => inner.source_ids().await,
        }
    }
}
