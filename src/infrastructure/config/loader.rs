//! Layered configuration loading and validation.

use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Environment variable consulted when `llm.api_key` is not configured.
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// A configuration value outside its allowed range.
#[derive(Error, Debug, PartialEq)]
#[error("invalid {key} = {value}: {rule}")]
pub struct ConfigError {
    /// Dotted key, e.g. `retry.max_attempts`.
    pub key: &'static str,
    /// Offending value as written.
    pub value: String,
    /// Constraint the value broke.
    pub rule: &'static str,
}

fn check(ok: bool, key: &'static str, value: impl ToString, rule: &'static str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError {
            key,
            value: value.to_string(),
            rule,
        })
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 2] = ["json", "pretty"];
const LOG_ROTATIONS: [&str; 3] = ["daily", "hourly", "never"];

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .rehearse/config.yaml (project config)
    /// 3. .rehearse/local.yaml (project local overrides, optional)
    /// 4. Environment variables (REHEARSE_* prefix, `__` separates sections)
    pub fn load() -> Result<Config> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".rehearse/config.yaml"))
            .merge(Yaml::file(".rehearse/local.yaml"))
            .merge(Env::prefixed("REHEARSE_").split("__"));
        Self::finish(figment)
    }

    /// Load configuration from a specific file instead of the project files.
    /// Environment variables still take precedence over the file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("config file {} does not exist", path.display());
        }
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("REHEARSE_").split("__"));
        Self::finish(figment)
            .with_context(|| format!("Failed to load config from {}", path.display()))
    }

    fn finish(figment: Figment) -> Result<Config> {
        let mut config: Config = figment
            .extract()
            .context("Failed to extract configuration from figment")?;

        if config.llm.api_key.is_none() {
            config.llm.api_key = std::env::var(API_KEY_ENV)
                .ok()
                .filter(|key| !key.trim().is_empty());
        }

        Self::validate(&config)?;
        Ok(config)
    }

    /// Range checks that serde cannot express.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let db = &config.database;
        check(!db.path.is_empty(), "database.path", "\"\"", "must not be empty")?;
        check(db.max_connections >= 1, "database.max_connections", db.max_connections, "must be at least 1")?;

        let log = &config.logging;
        check(LOG_LEVELS.contains(&log.level.as_str()), "logging.level", &log.level, "expected trace, debug, info, warn or error")?;
        check(LOG_FORMATS.contains(&log.format.as_str()), "logging.format", &log.format, "expected json or pretty")?;
        check(LOG_ROTATIONS.contains(&log.rotation.as_str()), "logging.rotation", &log.rotation, "expected daily, hourly or never")?;

        let limit = &config.rate_limit;
        check(limit.requests_per_second > 0.0, "rate_limit.requests_per_second", limit.requests_per_second, "must be positive")?;
        check(limit.burst_size >= 1, "rate_limit.burst_size", limit.burst_size, "must be at least 1")?;

        let retry = &config.retry;
        check(retry.max_attempts >= 1, "retry.max_attempts", retry.max_attempts, "must be at least 1")?;
        check(
            retry.initial_delay_ms <= retry.max_delay_ms,
            "retry.initial_delay_ms",
            retry.initial_delay_ms,
            "must not exceed retry.max_delay_ms",
        )?;
        check(retry.multiplier >= 1.0, "retry.multiplier", retry.multiplier, "must be at least 1.0")?;

        check(config.run.max_turns >= 1, "run.max_turns", config.run.max_turns, "must be at least 1")?;
        check(config.run.max_parallel >= 1, "run.max_parallel", config.run.max_parallel, "must be at least 1")?;
        check(
            config.repair.max_iterations >= 1,
            "repair.max_iterations",
            config.repair.max_iterations,
            "must be at least 1",
        )
    }
}
