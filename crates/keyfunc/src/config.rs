//! Resolver configuration
//!
//! [`Config`] is the serializable form, loadable from a TOML file and overridable from
//! `KEYFUNC_*` environment variables. [`Config::validate`] turns it into
//! [`ResolverOptions`]; every [`ConfigError`] surfaces there, before anything runs.

use std::env;
use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigLoader, File};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::fetcher::Source;

/// Comma separated list of key set URLs
pub const ENV_SOURCES: &str = "KEYFUNC_SOURCES";
/// Background refresh interval in seconds
pub const ENV_REFRESH_INTERVAL_SECS: &str = "KEYFUNC_REFRESH_INTERVAL_SECS";
/// Per-fetch timeout in seconds
pub const ENV_FETCH_TIMEOUT_SECS: &str = "KEYFUNC_FETCH_TIMEOUT_SECS";
/// Refresh when a token names an unknown key id
pub const ENV_REFRESH_ON_UNKNOWN_KID: &str = "KEYFUNC_REFRESH_ON_UNKNOWN_KID";
/// Minimum seconds between refreshes triggered by unknown key ids
pub const ENV_UNKNOWN_KID_COOLDOWN_SECS: &str = "KEYFUNC_UNKNOWN_KID_COOLDOWN_SECS";
/// Fail the whole document on any invalid key entry
pub const ENV_STRICT: &str = "KEYFUNC_STRICT";
/// Fail startup when the first fetch fails
pub const ENV_REQUIRE_INITIAL_FETCH: &str = "KEYFUNC_REQUIRE_INITIAL_FETCH";
/// First retry delay in seconds after a failed refresh
pub const ENV_RETRY_BACKOFF_MIN_SECS: &str = "KEYFUNC_RETRY_BACKOFF_MIN_SECS";
/// Largest retry delay in seconds
pub const ENV_RETRY_BACKOFF_MAX_SECS: &str = "KEYFUNC_RETRY_BACKOFF_MAX_SECS";
/// Accept plaintext http sources
pub const ENV_DANGER_ALLOW_HTTP: &str = "KEYFUNC_DANGER_ALLOW_HTTP";

fn default_refresh_interval_secs() -> u64 {
    3600
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_unknown_kid_cooldown_secs() -> u64 {
    300
}

fn default_retry_backoff_min_secs() -> u64 {
    5
}

fn default_retry_backoff_max_secs() -> u64 {
    300
}

/// Resolver configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// JWK Set URLs. Must be https unless `danger_allow_http` is set.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Time between background refreshes
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Deadline for a single fetch of a single source
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Refresh immediately when a token names an unknown key id
    #[serde(default = "default_true")]
    pub refresh_on_unknown_kid: bool,
    /// Minimum spacing between refreshes triggered by unknown key ids, 0 disables
    #[serde(default = "default_unknown_kid_cooldown_secs")]
    pub unknown_kid_cooldown_secs: u64,
    /// Reject a whole document when any key entry is invalid instead of skipping it
    #[serde(default)]
    pub strict: bool,
    /// First retry delay after a failed background refresh
    #[serde(default = "default_retry_backoff_min_secs")]
    pub retry_backoff_min_secs: u64,
    /// Upper bound of the retry delay, never above the refresh interval
    #[serde(default = "default_retry_backoff_max_secs")]
    pub retry_backoff_max_secs: u64,
    /// Fail startup when the first fetch does not succeed
    #[serde(default = "default_true")]
    pub require_initial_fetch: bool,
    /// Allow plain http sources. Only meant for local testing.
    #[serde(default)]
    pub danger_allow_http: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            refresh_interval_secs: default_refresh_interval_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            refresh_on_unknown_kid: true,
            unknown_kid_cooldown_secs: default_unknown_kid_cooldown_secs(),
            strict: false,
            retry_backoff_min_secs: default_retry_backoff_min_secs(),
            retry_backoff_max_secs: default_retry_backoff_max_secs(),
            require_initial_fetch: true,
            danger_allow_http: false,
        }
    }
}

/// Validated resolver options
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Validated sources
    pub sources: Vec<Source>,
    /// Time between background refreshes
    pub refresh_interval: Duration,
    /// Deadline for one fetch of one source
    pub fetch_timeout: Duration,
    /// Refresh on unknown key id
    pub refresh_on_unknown_kid: bool,
    /// Spacing between refreshes triggered by unknown key ids
    pub unknown_kid_cooldown: Duration,
    /// Strict document parsing
    pub strict: bool,
    /// First retry delay after a failure
    pub retry_backoff_min: Duration,
    /// Largest retry delay
    pub retry_backoff_max: Duration,
    /// Fail startup when the first fetch fails
    pub require_initial_fetch: bool,
    /// Plain http sources were allowed
    pub allow_http: bool,
}

impl Config {
    /// Config for a list of sources with every other option at its default
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Load defaults overridden by a TOML file
    pub fn from_file<P>(path: P) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
    {
        let default = Self::default();
        let config = ConfigLoader::builder()
            .add_source(ConfigLoader::try_from(&default)?)
            .add_source(File::from(path.as_ref()))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Override fields from `KEYFUNC_*` environment variables.
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn from_env(mut self) -> Self {
        if let Ok(sources) = env::var(ENV_SOURCES) {
            self.sources = sources
                .split(',')
                .map(str::trim)
                .filter(|source| !source.is_empty())
                .map(str::to_owned)
                .collect();
        }

        env_parse(ENV_REFRESH_INTERVAL_SECS, &mut self.refresh_interval_secs);
        env_parse(ENV_FETCH_TIMEOUT_SECS, &mut self.fetch_timeout_secs);
        env_parse(ENV_REFRESH_ON_UNKNOWN_KID, &mut self.refresh_on_unknown_kid);
        env_parse(
            ENV_UNKNOWN_KID_COOLDOWN_SECS,
            &mut self.unknown_kid_cooldown_secs,
        );
        env_parse(ENV_STRICT, &mut self.strict);
        env_parse(ENV_REQUIRE_INITIAL_FETCH, &mut self.require_initial_fetch);
        env_parse(ENV_RETRY_BACKOFF_MIN_SECS, &mut self.retry_backoff_min_secs);
        env_parse(ENV_RETRY_BACKOFF_MAX_SECS, &mut self.retry_backoff_max_secs);
        env_parse(ENV_DANGER_ALLOW_HTTP, &mut self.danger_allow_http);

        self
    }

    /// Validate into [`ResolverOptions`]
    pub fn validate(&self) -> Result<ResolverOptions, ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::EmptySourceList);
        }

        let sources = self
            .sources
            .iter()
            .map(|source| Source::parse(source, self.danger_allow_http))
            .collect::<Result<Vec<_>, _>>()?;

        if self.refresh_interval_secs == 0 {
            return Err(ConfigError::InvalidInterval("refresh_interval_secs"));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::InvalidInterval("fetch_timeout_secs"));
        }
        if self.retry_backoff_min_secs == 0 {
            return Err(ConfigError::InvalidInterval("retry_backoff_min_secs"));
        }

        let refresh_interval = Duration::from_secs(self.refresh_interval_secs);
        let retry_backoff_min = Duration::from_secs(self.retry_backoff_min_secs);
        let retry_backoff_max = Duration::from_secs(self.retry_backoff_max_secs)
            .min(refresh_interval)
            .max(retry_backoff_min);

        Ok(ResolverOptions {
            sources,
            refresh_interval,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            refresh_on_unknown_kid: self.refresh_on_unknown_kid,
            unknown_kid_cooldown: Duration::from_secs(self.unknown_kid_cooldown_secs),
            strict: self.strict,
            retry_backoff_min,
            retry_backoff_max,
            require_initial_fetch: self.require_initial_fetch,
            allow_http: self.danger_allow_http,
        })
    }
}

fn env_parse<T>(name: &str, target: &mut T)
where
    T: std::str::FromStr,
{
    if let Ok(raw) = env::var(name) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!("Ignoring invalid value `{}` for {}", raw, name),
        }
    }
}
