use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::calibration::RoiZone;
use crate::sampler::SamplerConfig;
use crate::stage::StageConfig;
use crate::velocimeter::VelocimeterConfig;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub stage: StageConfig,
    pub velocimeter: VelocimeterConfig,
    pub sampling: SamplerConfig,
    pub grid: GridConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GridConfig {
    /// Calibration JSON with origin, boundary and home
    pub calibration_file: Option<String>,
    pub x_spacing_feet: f64,
    pub y_spacing_feet: f64,
    pub roi_zones: Vec<RoiZone>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Directory receiving one record file per Z-plane/run
    pub output_path: String,
    pub buffer_size: usize,
    /// Rewrite each finished file as a JSON array
    pub final_format_json: bool,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            calibration_file: None,
            x_spacing_feet: 0.1,
            y_spacing_feet: 0.1,
            roi_zones: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            output_path: "./data".to_string(),
            buffer_size: 10,
            final_format_json: true,
        }
    }
}

impl AppConfig {
    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Message(msg));

        if self.grid.x_spacing_feet <= 0.0 || self.grid.y_spacing_feet <= 0.0 {
            return invalid(format!(
                "grid spacing must be positive (got {} x {} ft)",
                self.grid.x_spacing_feet, self.grid.y_spacing_feet
            ));
        }
        if let Some(zone) = self.grid.roi_zones.iter().find(|z| !z.multiplier_is_valid()) {
            return invalid(format!(
                "ROI density multiplier must be finite and >= 0 (got {})",
                zone.density_multiplier
            ));
        }

        let sampling = &self.sampling;
        if sampling.sample_rate_hz <= 0.0 {
            return invalid("sampling.sample_rate_hz must be positive".to_string());
        }
        if sampling.base_duration_s <= 0.0 {
            return invalid("sampling.base_duration_s must be positive".to_string());
        }
        if sampling.max_duration_s < sampling.base_duration_s {
            return invalid(format!(
                "sampling.max_duration_s ({}) is below base_duration_s ({})",
                sampling.max_duration_s, sampling.base_duration_s
            ));
        }

        if self.stage.baud_rate == 0 || self.velocimeter.baud_rate == 0 {
            return invalid("baud rates must be non-zero".to_string());
        }
        if !(1..=crate::stage::motion::MAX_SPEED).contains(&self.stage.speed) {
            return invalid(format!("stage.speed {} out of range", self.stage.speed));
        }
        if !(1..=crate::stage::motion::MAX_ACCELERATION).contains(&self.stage.acceleration) {
            return invalid(format!(
                "stage.acceleration {} out of range",
                self.stage.acceleration
            ));
        }
        if self.velocimeter.expected_fields < 8 {
            return invalid("velocimeter.expected_fields must be at least 8".to_string());
        }
        if !(0.0..=100.0).contains(&self.velocimeter.min_correlation) {
            return invalid("velocimeter.min_correlation must be a percentage".to_string());
        }
        Ok(())
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        for path in ["flume.toml", "config.toml"] {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // Environment overrides, e.g. RUSTY_FLUME__STAGE__PORT=/dev/ttyUSB0
    builder = builder.add_source(
        Environment::with_prefix("RUSTY_FLUME")
            .separator("__")
            .try_parsing(true),
    );

    let config: AppConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration, falling back to defaults on any error
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.stage.retry_delays_ms, vec![500, 1000, 2000]);
        assert_eq!(config.velocimeter.start_command, "START");
        assert_eq!(config.sampling.synchronizer.poll_interval_ms, 50);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.grid.x_spacing_feet = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sampling.max_duration_s = 5.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sampling.sample_rate_hz = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.grid.roi_zones.push(RoiZone {
            x_min: 0.0,
            x_max: 1.0,
            y_min: 0.0,
            y_max: 1.0,
            density_multiplier: f64::INFINITY,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("rusty-flume-config-{}.toml", std::process::id()));
        fs::write(
            &path,
            r#"
[stage]
port = "/dev/ttyUSB0"
retry_delays_ms = [100, 200, 400]

[sampling]
base_duration_s = 20.0

[[grid.roi_zones]]
x_min = 0.0
x_max = 0.5
y_min = 0.0
y_max = 0.2
density_multiplier = 2.0
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.stage.port, "/dev/ttyUSB0");
        assert_eq!(config.stage.retry_delays_ms, vec![100, 200, 400]);
        assert_eq!(config.stage.baud_rate, 9600);
        assert_eq!(config.sampling.base_duration_s, 20.0);
        assert_eq!(config.sampling.max_duration_s, 120.0);
        assert_eq!(config.grid.roi_zones.len(), 1);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/flume.toml"))).is_err());
    }
}
