//! Multicrawl: an adaptive multi-site crawl orchestrator
//!
//! This crate discovers the structure of listing sites, generates a crawl
//! configuration for each of them, and runs many site crawls concurrently while
//! reacting to rate limits and blocks. Incremental state tracking makes sure only
//! new or changed records are handed to the downstream sink.

pub mod config;
pub mod crawler;
pub mod output;
pub mod site;
pub mod state;
pub mod storage;
pub mod url;

use thiserror::Error;

/// Main error type for Multicrawl operations
#[derive(Debug, Error)]
pub enum MulticrawlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] storage::StorageError),

    #[error("URL error: {0}")]
    UrlError(#[from] UrlError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Analysis failed for {domain}: {reason}")]
    AnalysisFailed { domain: String, reason: String },

    #[error("Invalid detector pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Sink error: {0}")]
    Sink(#[from] output::SinkError),

    #[error("Unknown site: {0}")]
    UnknownSite(String),

    #[error("Run aborted: {0}")]
    Aborted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MulticrawlError {
    /// Returns true if the error must abort the whole orchestrator run
    ///
    /// Only an unreachable or failing store qualifies. Every other error is
    /// contained to the site (or page) that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

impl From<rusqlite::Error> for MulticrawlError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(storage::StorageError::Sqlite(err))
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing domain in URL")]
    MissingDomain,

    #[error("Malformed URL: {0}")]
    Malformed(String),
}

/// Result type alias for Multicrawl operations
pub type Result<T> = std::result::Result<T, MulticrawlError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{Orchestrator, RunRequest};
pub use site::{CrawlMode, SiteAnalysis, SiteConfig};
pub use state::{ChangeKind, SiteStatus};
pub use url::{extract_domain, normalize_url};
