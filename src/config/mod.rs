//! Configuration module for Multicrawl
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use multicrawl::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("multicrawl.toml")).unwrap();
//! println!("Global fetch budget: {}", config.orchestrator.max_inflight_fetches);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    AnalyzerConfig, Config, IncrementalConfig, OrchestratorConfig, QualityConfig,
    RateLimitConfig, SinkConfig, StorageConfig, UserAgentConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::validate;

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A valid config with millisecond delays, for tests that drive real crawls
    pub fn fast_config() -> Config {
        let content = r#"
[rate-limit]
floor-seconds = 0.001
max-rate-limit-seconds = 0.05
backoff-ceiling-seconds = 0.05

[orchestrator]
transient-retries = 1
transient-retry-delay-ms = 1
fetch-timeout-seconds = 5

[user-agent]
crawler-name = "TestCrawler"
crawler-version = "1.0"
contact-url = "https://example.com/about"
contact-email = "admin@example.com"

[storage]
database-path = ":memory:"

[sink]
path = "./records.jsonl"
"#;
        match parse_config(content) {
            Ok(config) => config,
            Err(e) => panic!("test config is invalid: {}", e),
        }
    }
}
