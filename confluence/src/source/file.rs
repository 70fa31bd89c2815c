//! A [`MetaFetcher`] backed by a plain text file.
//!
//! The file is re-read on every fetch so that operators can change the set
//! of live sources by editing it.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::{Error, MetaFetcher};

#[derive(Debug, Clone)]
/// Reads newline separated source ids from a file.
pub struct FileMetaFetcher {
    path: PathBuf,
}

impl FileMetaFetcher {
    /// Create a fetcher for the file at `path`. The file need not exist yet.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

fn parse(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect()
}

#[async_trait]
impl MetaFetcher for FileMetaFetcher {
    async fn meta(&self) -> Result<Vec<String>, Error> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| Error::Read {
                path: self.path.clone(),
                source: Box::new(source),
            })?;
        let ids = parse(&contents);
        debug!(path = ?self.path, total = ids.len(), "read source list");
        Ok(ids)
    }
}
