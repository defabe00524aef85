//! Unified single-file configuration for Maestro hosts.
//!
//! A single `maestro.yaml` configures the app identity, conductor and driver
//! limits, the lowering target, and observability settings.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use maestro_core::conduct::ConductorConfig;
use maestro_core::lower::LowerTarget;

use crate::driver::DriverConfig;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Deserialize)]
pub struct MaestroConfig {
    /// Config schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub conductor: ConductorSection,
    #[serde(default)]
    pub driver: DriverSection,
    #[serde(default)]
    pub lower: LowerSection,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for MaestroConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            app: AppConfig::default(),
            conductor: ConductorSection::default(),
            driver: DriverSection::default(),
            lower: LowerSection::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_env")]
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            environment: default_env(),
        }
    }
}

fn default_app_name() -> String {
    "maestro".to_string()
}

fn default_env() -> String {
    "development".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConductorSection {
    #[serde(default = "default_step_limit")]
    pub step_limit: u64,
}

impl Default for ConductorSection {
    fn default() -> Self {
        Self {
            step_limit: default_step_limit(),
        }
    }
}

impl ConductorSection {
    pub fn to_config(&self) -> ConductorConfig {
        ConductorConfig {
            step_limit: self.step_limit,
        }
    }
}

fn default_step_limit() -> u64 {
    1_000_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriverSection {
    #[serde(default = "default_max_resumes")]
    pub max_resumes: usize,
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            max_resumes: default_max_resumes(),
        }
    }
}

impl DriverSection {
    pub fn to_config(&self) -> DriverConfig {
        DriverConfig {
            max_resumes: self.max_resumes,
        }
    }
}

fn default_max_resumes() -> usize {
    1_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LowerSection {
    /// Lowering target spelling: "max", "off", a version string, or a
    /// comma-separated combinator list.
    #[serde(default = "default_lower_target")]
    pub target: String,
}

impl Default for LowerSection {
    fn default() -> Self {
        Self {
            target: default_lower_target(),
        }
    }
}

impl LowerSection {
    pub fn target(&self) -> LowerTarget {
        LowerTarget::parse(&self.target)
    }
}

fn default_lower_target() -> String {
    "max".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub traces_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            traces_enabled: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<MaestroConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse configuration from YAML source.
pub fn parse_config(source: &str) -> Result<MaestroConfig, ConfigError> {
    let config: MaestroConfig = serde_yaml::from_str(source)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &MaestroConfig) -> Result<(), ConfigError> {
    if config.version == 0 {
        return Err(ConfigError::Invalid(
            "version must be greater than 0".to_string(),
        ));
    }
    if config.app.name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "app.name must not be empty".to_string(),
        ));
    }
    if config.conductor.step_limit == 0 {
        return Err(ConfigError::Invalid(
            "conductor.step_limit must be > 0".to_string(),
        ));
    }
    if config.driver.max_resumes == 0 {
        return Err(ConfigError::Invalid(
            "driver.max_resumes must be > 0".to_string(),
        ));
    }
    let level = config.observability.log_level.trim().to_ascii_lowercase();
    if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
        return Err(ConfigError::Invalid(format!(
            "observability.log_level '{}' is not a log level",
            config.observability.log_level
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.app.name, "maestro");
        assert_eq!(config.conductor.step_limit, 1_000_000);
        assert_eq!(config.driver.max_resumes, 1_000);
        assert_eq!(config.lower.target(), LowerTarget::Max);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = parse_config(
            r#"
app:
  name: conductor-host
conductor:
  step_limit: 500
driver:
  max_resumes: 10
lower:
  target: "0.4.0"
observability:
  log_level: debug
"#,
        )
        .unwrap();
        assert_eq!(config.app.name, "conductor-host");
        assert_eq!(config.conductor.to_config().step_limit, 500);
        assert_eq!(config.driver.to_config().max_resumes, 10);
        assert_eq!(
            config.lower.target(),
            LowerTarget::Version("0.4.0".to_string())
        );
        assert_eq!(config.observability.log_level, "debug");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            parse_config("version: 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse_config("conductor:\n  step_limit: 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            parse_config("observability:\n  log_level: loud"),
            Err(ConfigError::Invalid(_))
        ));
    }
}
