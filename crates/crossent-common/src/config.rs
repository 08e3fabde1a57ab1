//! Configuration for the crossent device and loss operators.
//!
//! Loads [`CrossEntConfig`] from a TOML file with environment variable
//! overrides via `CROSSENT_*` prefixed variables. Missing TOML fields fall
//! back to their defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Largest worker group the device accepts.
pub const MAX_WORKER_GROUP_SIZE: u32 = 1024;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossEntConfig {
    pub device: DeviceConfig,
    pub loss: LossConfig,
}

/// Worker pool geometry for the execution device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Number of worker threads.
    /// Override: `CROSSENT_NUM_WORKERS`
    pub num_workers: usize,

    /// Logical workers per worker group (block size).
    /// Override: `CROSSENT_WORKER_GROUP_SIZE`
    pub worker_group_size: u32,

    /// Prefix for worker thread names.
    /// Override: `CROSSENT_THREAD_NAME_PREFIX`
    pub thread_name_prefix: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get().max(1),
            worker_group_size: 128,
            thread_name_prefix: "crossent".to_string(),
        }
    }
}

/// Per-operator-instance settings for softmax with loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Multiplier applied to the averaged loss and to the gradient.
    /// Override: `CROSSENT_LOSS_SCALE`
    pub scale: f32,

    /// Use the `[N, D, H, W]` per-position layout.
    /// Override: `CROSSENT_SPATIAL`
    pub spatial: bool,

    /// Labels are probability distributions instead of class indices.
    /// Override: `CROSSENT_LABEL_PROB`
    pub label_prob: bool,

    /// Dense mode flattens logits to `[prod(dims[..axis]), prod(dims[axis..])]`.
    /// Override: `CROSSENT_AXIS`
    pub axis: usize,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self { scale: 1.0, spatial: false, label_prob: false, axis: 1 }
    }
}

impl LossConfig {
    /// Dense per-example configuration with the given scale.
    pub fn dense(scale: f32) -> Self {
        Self { scale, ..Self::default() }
    }

    /// Spatial per-position configuration with the given scale.
    pub fn spatial(scale: f32) -> Self {
        Self { scale, spatial: true, ..Self::default() }
    }

    /// Enable soft (probability) labels.
    pub fn with_label_prob(mut self) -> Self {
        self.label_prob = true;
        self
    }

    /// Override the flatten axis.
    pub fn with_axis(mut self, axis: usize) -> Self {
        self.axis = axis;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.scale.is_finite() {
            return Err(ConfigError::Validation(format!(
                "loss scale must be finite, got {}",
                self.scale
            )));
        }
        if self.spatial && self.label_prob {
            return Err(ConfigError::Validation(
                "label_prob is not supported in spatial mode".into(),
            ));
        }
        if self.spatial && self.axis != 1 {
            return Err(ConfigError::Validation(format!(
                "spatial mode requires axis = 1, got {}",
                self.axis
            )));
        }
        Ok(())
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::Validation("num_workers must be > 0".into()));
        }
        if self.worker_group_size == 0 {
            return Err(ConfigError::Validation("worker_group_size must be > 0".into()));
        }
        if !self.worker_group_size.is_power_of_two() {
            return Err(ConfigError::Validation(format!(
                "worker_group_size must be a power of two, got {}",
                self.worker_group_size
            )));
        }
        if self.worker_group_size > MAX_WORKER_GROUP_SIZE {
            return Err(ConfigError::Validation(format!(
                "worker_group_size must be <= {MAX_WORKER_GROUP_SIZE}, got {}",
                self.worker_group_size
            )));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(ConfigError::Validation("thread_name_prefix must not be empty".into()));
        }
        Ok(())
    }
}

impl CrossEntConfig {
    /// Generate a default configuration TOML string.
    pub fn default_toml() -> String {
        let cfg = Self::default();
        toml::to_string_pretty(&cfg).expect("default config should serialize")
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: CrossEntConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device.validate()?;
        self.loss.validate()
    }

    /// Apply `CROSSENT_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = parse_env::<usize>("CROSSENT_NUM_WORKERS")? {
            self.device.num_workers = v;
        }
        if let Some(v) = parse_env::<u32>("CROSSENT_WORKER_GROUP_SIZE")? {
            self.device.worker_group_size = v;
        }
        if let Ok(val) = std::env::var("CROSSENT_THREAD_NAME_PREFIX") {
            self.device.thread_name_prefix = val;
        }
        if let Some(v) = parse_env::<f32>("CROSSENT_LOSS_SCALE")? {
            self.loss.scale = v;
        }
        if let Some(v) = parse_flag("CROSSENT_SPATIAL")? {
            self.loss.spatial = v;
        }
        if let Some(v) = parse_flag("CROSSENT_LABEL_PROB")? {
            self.loss.label_prob = v;
        }
        if let Some(v) = parse_env::<usize>("CROSSENT_AXIS")? {
            self.loss.axis = v;
        }
        Ok(())
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val.parse::<T>().map(Some).map_err(|e| ConfigError::EnvOverride {
            key: key.into(),
            value: val.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

fn parse_flag(key: &str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(key) {
        Ok(val) => match val.to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" => Ok(Some(false)),
            _ => Err(ConfigError::EnvOverride {
                key: key.into(),
                value: val,
                reason: "expected a boolean flag".into(),
            }),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ALL_KEYS: [&str; 7] = [
        "CROSSENT_NUM_WORKERS",
        "CROSSENT_WORKER_GROUP_SIZE",
        "CROSSENT_THREAD_NAME_PREFIX",
        "CROSSENT_LOSS_SCALE",
        "CROSSENT_SPATIAL",
        "CROSSENT_LABEL_PROB",
        "CROSSENT_AXIS",
    ];

    fn cleared_env() -> Vec<(&'static str, Option<&'static str>)> {
        ALL_KEYS.iter().map(|k| (*k, None)).collect()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(CrossEntConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_toml_lists_every_section() {
        let text = CrossEntConfig::default_toml();
        for key in ["[device]", "[loss]", "worker_group_size", "scale", "axis"] {
            assert!(text.contains(key), "missing {key} in:\n{text}");
        }
    }

    #[test]
    #[serial(crossent_env)]
    fn test_default_toml_round_trips() {
        temp_env::with_vars(cleared_env(), || {
            let cfg = CrossEntConfig::from_toml(&CrossEntConfig::default_toml()).unwrap();
            assert_eq!(cfg, CrossEntConfig::default());
        });
    }

    #[test]
    #[serial(crossent_env)]
    fn test_partial_toml_keeps_defaults() {
        temp_env::with_vars(cleared_env(), || {
            let cfg = CrossEntConfig::from_toml(
                r#"
[loss]
scale = 0.5
spatial = true
"#,
            )
            .unwrap();
            assert!(cfg.loss.spatial);
            assert!((cfg.loss.scale - 0.5).abs() < f32::EPSILON);
            assert_eq!(cfg.loss.axis, 1);
            assert_eq!(cfg.device.worker_group_size, 128);
        });
    }

    #[test]
    fn test_validation_rejects_spatial_label_prob() {
        let cfg = LossConfig::spatial(1.0).with_label_prob();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("not supported in spatial mode"));
    }

    #[test]
    fn test_validation_rejects_spatial_axis() {
        let err = LossConfig::spatial(1.0).with_axis(2).validate().unwrap_err();
        assert!(err.to_string().contains("axis = 1"));
    }

    #[test]
    fn test_validation_rejects_non_finite_scale() {
        assert!(LossConfig::dense(f32::NAN).validate().is_err());
        assert!(LossConfig::dense(f32::INFINITY).validate().is_err());
        assert!(LossConfig::dense(0.0).validate().is_ok());
    }

    #[test]
    fn test_validation_worker_group_size() {
        let mut cfg = DeviceConfig::default();
        cfg.worker_group_size = 0;
        assert!(cfg.validate().unwrap_err().to_string().contains("must be > 0"));
        cfg.worker_group_size = 100;
        assert!(cfg.validate().unwrap_err().to_string().contains("power of two"));
        cfg.worker_group_size = 2048;
        assert!(cfg.validate().unwrap_err().to_string().contains("<= 1024"));
    }

    #[test]
    fn test_validation_num_workers_zero() {
        let cfg = DeviceConfig { num_workers: 0, ..DeviceConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    #[serial(crossent_env)]
    fn test_env_override_multiple_fields() {
        let mut vars = cleared_env();
        vars.retain(|(k, _)| {
            !matches!(*k, "CROSSENT_NUM_WORKERS" | "CROSSENT_LOSS_SCALE" | "CROSSENT_SPATIAL")
        });
        vars.push(("CROSSENT_NUM_WORKERS", Some("3")));
        vars.push(("CROSSENT_LOSS_SCALE", Some("0.25")));
        vars.push(("CROSSENT_SPATIAL", Some("true")));
        temp_env::with_vars(vars, || {
            let cfg = CrossEntConfig::from_env().unwrap();
            assert_eq!(cfg.device.num_workers, 3);
            assert!((cfg.loss.scale - 0.25).abs() < f32::EPSILON);
            assert!(cfg.loss.spatial);
        });
    }

    #[test]
    #[serial(crossent_env)]
    fn test_env_override_invalid_value() {
        let mut vars = cleared_env();
        vars.retain(|(k, _)| *k != "CROSSENT_WORKER_GROUP_SIZE");
        vars.push(("CROSSENT_WORKER_GROUP_SIZE", Some("lots")));
        temp_env::with_vars(vars, || match CrossEntConfig::from_env().unwrap_err() {
            ConfigError::EnvOverride { key, .. } => {
                assert_eq!(key, "CROSSENT_WORKER_GROUP_SIZE");
            }
            other => panic!("expected EnvOverride, got: {other}"),
        });
    }

    #[test]
    #[serial(crossent_env)]
    fn test_env_override_invalid_flag() {
        let mut vars = cleared_env();
        vars.retain(|(k, _)| *k != "CROSSENT_LABEL_PROB");
        vars.push(("CROSSENT_LABEL_PROB", Some("maybe")));
        temp_env::with_vars(vars, || {
            assert!(matches!(
                CrossEntConfig::from_env(),
                Err(ConfigError::EnvOverride { .. })
            ));
        });
    }

    #[test]
    #[serial(crossent_env)]
    fn test_load_from_tempfile() {
        temp_env::with_vars(cleared_env(), || {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("crossent.toml");
            std::fs::write(&path, CrossEntConfig::default_toml()).unwrap();
            let cfg = CrossEntConfig::load(&path).unwrap();
            assert_eq!(cfg, CrossEntConfig::default());
        });
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = CrossEntConfig::load(Path::new("/nonexistent/crossent.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
