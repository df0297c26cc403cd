// Layered configuration: defaults, optional TOML file, ESTIMATEBOT__* environment
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::EngineError;
use crate::execution::evaluator::CrossingRules;

pub const DEFAULT_CONFIG_FILE: &str = "estimatebot.toml";
const ENV_PREFIX: &str = "ESTIMATEBOT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub redis_url: String,
    pub log_level: String,
    pub engine: EngineSettings,
    pub crossing: CrossingRules,
    pub gateway: GatewaySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            log_level: "estimatebot=info".to_string(),
            engine: EngineSettings::default(),
            crossing: CrossingRules::default(),
            gateway: GatewaySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub dispatch_timeout_ms: u64,
    pub tick_buffer: usize,
    pub poll_interval_ms: u64,
    pub reconcile_grace_secs: u64,
    /// Short entries are refused while the funding rate sits below this
    pub short_funding_rate_threshold: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            dispatch_timeout_ms: 10_000,
            tick_buffer: 256,
            poll_interval_ms: 1_000,
            reconcile_grace_secs: 120,
            short_funding_rate_threshold: -0.002, // -0.2%
        }
    }
}

impl EngineSettings {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconcile_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reconcile_grace_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub requests_per_second: u32,
    pub request_timeout_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            username: String::new(),
            password: String::new(),
            requests_per_second: 5,
            request_timeout_ms: 10_000,
        }
    }
}

impl Settings {
    /// Load settings; `path` overrides the default config file name
    ///
    /// A missing file is not an error, defaults and environment still apply.
    pub fn load(path: Option<&str>) -> Result<Self, EngineError> {
        let file = path.unwrap_or(DEFAULT_CONFIG_FILE);

        let settings: Settings = config::Config::builder()
            .add_source(config::File::with_name(file).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from TOML text (no environment layering)
    pub fn from_toml(text: &str) -> Result<Self, EngineError> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.engine.dispatch_timeout_ms == 0 {
            return Err(EngineError::Config("engine.dispatch_timeout_ms must be > 0".to_string()));
        }
        if self.engine.tick_buffer == 0 {
            return Err(EngineError::Config("engine.tick_buffer must be > 0".to_string()));
        }
        if self.engine.poll_interval_ms == 0 {
            return Err(EngineError::Config("engine.poll_interval_ms must be > 0".to_string()));
        }
        if self.gateway.requests_per_second == 0 {
            return Err(EngineError::Config("gateway.requests_per_second must be > 0".to_string()));
        }
        if self.gateway.request_timeout_ms == 0 {
            return Err(EngineError::Config("gateway.request_timeout_ms must be > 0".to_string()));
        }
        if self.gateway.base_url.trim().is_empty() {
            return Err(EngineError::Config("gateway.base_url must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::evaluator::CrossingRule;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.engine.dispatch_timeout(), Duration::from_secs(10));
        assert_eq!(settings.engine.reconcile_grace(), chrono::Duration::seconds(120));
        assert_eq!(settings.crossing.addition, CrossingRule::Favorable);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_from_toml_overrides() {
        let settings = Settings::from_toml(
            r#"
            redis_url = "redis://cache:6379"

            [engine]
            dispatch_timeout_ms = 2500
            short_funding_rate_threshold = -0.001

            [crossing]
            addition = "toward"

            [gateway]
            base_url = "http://freqtrade:8080"
            username = "bot"
            "#,
        )
        .unwrap();

        assert_eq!(settings.redis_url, "redis://cache:6379");
        assert_eq!(settings.engine.dispatch_timeout_ms, 2500);
        assert_eq!(settings.engine.tick_buffer, 256);
        assert_eq!(settings.crossing.addition, CrossingRule::Toward);
        assert_eq!(settings.crossing.open, CrossingRule::Favorable);
        assert_eq!(settings.gateway.username, "bot");
        assert_eq!(settings.gateway.requests_per_second, 5);
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let result = Settings::from_toml("[engine]\ndispatch_timeout_ms = 0\n");
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
