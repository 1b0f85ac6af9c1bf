use crate::config::types::{
    AnalyzerConfig, Config, IncrementalConfig, OrchestratorConfig, QualityConfig,
    RateLimitConfig, UserAgentConfig,
};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_orchestrator_config(&config.orchestrator)?;
    validate_rate_limit_config(&config.rate_limit)?;
    validate_incremental_config(&config.incremental)?;
    validate_analyzer_config(&config.analyzer)?;
    validate_quality_config(&config.quality)?;
    validate_user_agent_config(&config.user_agent)?;

    if config.storage.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    if config.sink.path.is_empty() {
        return Err(ConfigError::Validation("sink path cannot be empty".to_string()));
    }

    Ok(())
}

fn validate_orchestrator_config(config: &OrchestratorConfig) -> Result<(), ConfigError> {
    if config.max_concurrent_sites < 1 || config.max_concurrent_sites > 256 {
        return Err(ConfigError::Validation(format!(
            "max_concurrent_sites must be between 1 and 256, got {}",
            config.max_concurrent_sites
        )));
    }

    if config.max_inflight_fetches < 1 || config.max_inflight_fetches > 1024 {
        return Err(ConfigError::Validation(format!(
            "max_inflight_fetches must be between 1 and 1024, got {}",
            config.max_inflight_fetches
        )));
    }

    if config.per_site_worker_cap < 1 {
        return Err(ConfigError::Validation(format!(
            "per_site_worker_cap must be >= 1, got {}",
            config.per_site_worker_cap
        )));
    }

    if config.fetch_timeout_seconds < 1 {
        return Err(ConfigError::Validation(
            "fetch_timeout_seconds must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<(), ConfigError> {
    // Zero would disable pacing entirely
    if !(config.floor_seconds > 0.0) {
        return Err(ConfigError::Validation(format!(
            "floor_seconds must be > 0, got {}",
            config.floor_seconds
        )));
    }

    if config.max_rate_limit_seconds < config.floor_seconds {
        return Err(ConfigError::Validation(format!(
            "max_rate_limit_seconds ({}) must be >= floor_seconds ({})",
            config.max_rate_limit_seconds, config.floor_seconds
        )));
    }

    if config.backoff_ceiling_seconds < config.floor_seconds {
        return Err(ConfigError::Validation(format!(
            "backoff_ceiling_seconds ({}) must be >= floor_seconds ({})",
            config.backoff_ceiling_seconds, config.floor_seconds
        )));
    }

    if config.backoff_multiplier < 1.0 {
        return Err(ConfigError::Validation(format!(
            "backoff_multiplier must be >= 1.0, got {}",
            config.backoff_multiplier
        )));
    }

    if !(config.recovery_multiplier > 0.0 && config.recovery_multiplier <= 1.0) {
        return Err(ConfigError::Validation(format!(
            "recovery_multiplier must be in (0, 1], got {}",
            config.recovery_multiplier
        )));
    }

    if config.recovery_threshold < 1 {
        return Err(ConfigError::Validation(
            "recovery_threshold must be >= 1".to_string(),
        ));
    }

    if config.repeated_429_threshold < 2 {
        return Err(ConfigError::Validation(format!(
            "repeated_429_threshold must be >= 2, got {}",
            config.repeated_429_threshold
        )));
    }

    if config.blocked_attempts_before_failure < 1 {
        return Err(ConfigError::Validation(
            "blocked_attempts_before_failure must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_incremental_config(config: &IncrementalConfig) -> Result<(), ConfigError> {
    if config.retention_days < 1 {
        return Err(ConfigError::Validation(
            "retention_days must be >= 1".to_string(),
        ));
    }

    if config.incremental_max_pages < 1 {
        return Err(ConfigError::Validation(
            "incremental_max_pages must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_analyzer_config(config: &AnalyzerConfig) -> Result<(), ConfigError> {
    if let Some(endpoint) = &config.inference_endpoint {
        Url::parse(endpoint).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid inference_endpoint '{}': {}", endpoint, e))
        })?;
    }

    if config.max_sample_pages < 1 {
        return Err(ConfigError::Validation(
            "max_sample_pages must be >= 1".to_string(),
        ));
    }

    if !(config.default_rate_limit_seconds > 0.0) {
        return Err(ConfigError::Validation(format!(
            "default_rate_limit_seconds must be > 0, got {}",
            config.default_rate_limit_seconds
        )));
    }

    if config.default_workers < 1 || config.default_max_pages < 1 {
        return Err(ConfigError::Validation(
            "default_workers and default_max_pages must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_quality_config(config: &QualityConfig) -> Result<(), ConfigError> {
    if config.parse_miss_penalty < 0.0 || config.parse_miss_penalty > 10.0 {
        return Err(ConfigError::Validation(format!(
            "parse_miss_penalty must be within 0..=10, got {}",
            config.parse_miss_penalty
        )));
    }

    if let Some(threshold) = config.reanalysis_threshold {
        if !(0.0..=10.0).contains(&threshold) {
            return Err(ConfigError::Validation(format!(
                "reanalysis_threshold must be within 0..=10, got {}",
                threshold
            )));
        }
    }

    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler_name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler_name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact_url: {}", e)))?;

    validate_email(&config.contact_email)
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    let Some((local, domain)) = email.split_once('@') else {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    };

    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    if !domain.contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email domain: '{}'",
            email
        )));
    }

    Ok(())
}
