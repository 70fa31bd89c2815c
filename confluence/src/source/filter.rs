//! Providers built on a [`MetaFetcher`].

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::{Error, FETCH_TIMEOUT, MetaFetcher, SourceProvider, fetch};

#[derive(Debug)]
/// Every non-empty source id the fetcher reports.
pub struct AllProvider<F> {
    fetcher: F,
    deadline: Duration,
}

impl<F> AllProvider<F>
where
    F: MetaFetcher,
{
    /// Create a provider over `fetcher`.
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            deadline: FETCH_TIMEOUT,
        }
    }

    /// Bound each fetch by `deadline` instead of [`FETCH_TIMEOUT`].
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

#[async_trait]
impl<F> SourceProvider for AllProvider<F>
where
    F: MetaFetcher,
{
    async fn source_ids(&self) -> Vec<String> {
        fetch(&self.fetcher, self.deadline)
            .await
            .into_iter()
            .filter(|id| !id.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a [`RegexProvider`] treats ids matching its pattern.
pub enum Mode {
    /// Matching ids are dropped.
    Blacklist,
    /// Only matching ids are kept.
    Whitelist,
}

#[derive(Debug)]
/// Source ids from the fetcher, filtered by a regular expression.
pub struct RegexProvider<F> {
    fetcher: F,
    mode: Mode,
    pattern: Regex,
    deadline: Duration,
}

impl<F> RegexProvider<F>
where
    F: MetaFetcher,
{
    /// Compile `pattern` and create a provider over `fetcher`.
    ///
    /// # Errors
    ///
    /// Returns an error if `pattern` is not a valid regular expression.
    pub fn new(mode: Mode, pattern: &str, fetcher: F) -> Result<Self, Error> {
        Ok(Self {
            fetcher,
            mode,
            pattern: Regex::new(pattern)?,
            deadline: FETCH_TIMEOUT,
        })
    }

    /// Bound each fetch by `deadline` instead of [`FETCH_TIMEOUT`].
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    fn keep(&self, source_id: &str) -> bool {
        let matched = self.pattern.is_match(source_id);
        match self.mode {
            Mode::Blacklist => !matched,
            Mode::Whitelist => matched,
        }
    }
}

#[async_trait]
impl<F> SourceProvider for RegexProvider<F>
where
    F: MetaFetcher,
{
    async fn source_ids(&self) -> Vec<String> {
        fetch(&self.fetcher, self.deadline)
            .await
            .into_iter()
            .filter(|id| !id.is_empty() && self.keep(id))
            .collect()
    }
}
