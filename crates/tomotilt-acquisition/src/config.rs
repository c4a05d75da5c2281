//! JSON acquisition configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tomotilt_core::{AngularPosition, BitDepth};
use tomotilt_registration::RegistrationParams;

use crate::dither::{DitherConfig, DitherMode};
use crate::drift::MAX_STABLE_ANTICIPATING_GAIN;
use crate::imaging::{CaptureSettings, Resolution};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings of one tilt series. Angles are degrees in the file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcquisitionConfig {
    pub resolution: Resolution,
    /// Per-pixel dwell time, seconds.
    pub dwell_time: f64,
    pub bit_depth: BitDepth,
    /// Horizontal field width, meters.
    #[serde(default = "default_hfw")]
    pub hfw: f64,
    #[serde(default = "default_channels")]
    pub channels: usize,
    pub tilt_increment: f64,
    pub tilt_end: f64,
    #[serde(default = "yes")]
    pub drift_correction: bool,
    #[serde(default)]
    pub focus_correction: bool,
    #[serde(default = "yes")]
    pub anticipation: bool,
    #[serde(default = "default_gain")]
    pub correction_gain: f64,
    #[serde(default)]
    pub registration: RegistrationParams,
    /// `null` waits for the stage indefinitely.
    #[serde(default = "default_settle_timeout_s")]
    pub settle_timeout_s: Option<f64>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub dither: Option<DitherConfig>,
    #[serde(default)]
    pub save_dir: Option<PathBuf>,
}

fn default_hfw() -> f64 {
    10e-6
}

fn default_channels() -> usize {
    1
}

fn yes() -> bool {
    true
}

fn default_gain() -> f64 {
    0.5
}

fn default_settle_timeout_s() -> Option<f64> {
    Some(30.0)
}

fn default_poll_interval_ms() -> u64 {
    50
}

impl AcquisitionConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if !(self.dwell_time.is_finite() && self.dwell_time > 0.0) {
            return invalid(format!("dwell_time must be positive, got {}", self.dwell_time));
        }
        if !(self.hfw.is_finite() && self.hfw > 0.0) {
            return invalid(format!("hfw must be positive, got {}", self.hfw));
        }
        if self.channels == 0 {
            return invalid("channels must be at least 1".into());
        }
        if !(self.tilt_increment.is_finite() && self.tilt_increment > 0.0) || self.increment().raw() == 0 {
            return invalid(format!("tilt_increment must be positive, got {}", self.tilt_increment));
        }
        if !self.tilt_end.is_finite() {
            return invalid(format!("tilt_end must be finite, got {}", self.tilt_end));
        }
        if !(self.correction_gain.is_finite() && self.correction_gain > 0.0) {
            return invalid(format!("correction_gain must be positive, got {}", self.correction_gain));
        }
        if self.anticipation && self.correction_gain >= MAX_STABLE_ANTICIPATING_GAIN {
            return invalid(format!(
                "correction_gain {} with anticipation is unstable (must be < {:.3})",
                self.correction_gain, MAX_STABLE_ANTICIPATING_GAIN
            ));
        }
        if let Some(t) = self.settle_timeout_s {
            if Duration::try_from_secs_f64(t).is_err() {
                return invalid(format!("settle_timeout_s must be a non-negative duration, got {t}"));
            }
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be positive".into());
        }
        self.registration
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("registration: {e}")))?;
        Ok(())
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            resolution: self.resolution,
            dwell_time: self.dwell_time,
            bit_depth: self.bit_depth,
            hfw: self.hfw,
        }
    }

    pub fn increment(&self) -> AngularPosition {
        AngularPosition::from_degrees(self.tilt_increment)
    }

    pub fn end(&self) -> AngularPosition {
        AngularPosition::from_degrees(self.tilt_end)
    }

    pub fn settle_timeout(&self) -> Option<Duration> {
        self.settle_timeout_s.and_then(|t| Duration::try_from_secs_f64(t).ok())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dither_mode(&self) -> DitherMode {
        self.dither.map(DitherMode::from).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MINIMAL: &str = r#"{
        "resolution": "1536x1024",
        "dwell_time": 1e-6,
        "bit_depth": 16,
        "tilt_increment": 2.0,
        "tilt_end": 60.0
    }"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = AcquisitionConfig::from_json_str(MINIMAL).unwrap();
        assert_eq!(cfg.resolution, Resolution::new(1536, 1024));
        assert_eq!(cfg.bit_depth, BitDepth::Sixteen);
        assert_eq!(cfg.increment(), AngularPosition::from_degrees(2.0));
        assert_eq!(cfg.end(), AngularPosition::from_degrees(60.0));
        assert!(cfg.drift_correction);
        assert!(!cfg.focus_correction);
        assert!(cfg.anticipation);
        assert_eq!(cfg.channels, 1);
        assert_eq!(cfg.settle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.poll_interval(), Duration::from_millis(50));
        assert_eq!(cfg.dither_mode(), DitherMode::Off);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = MINIMAL.replace("\"tilt_end\"", "\"tilt_ned\": 1.0, \"tilt_end\"");
        assert!(matches!(AcquisitionConfig::from_json_str(&text), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn null_timeout_disables_deadline() {
        let text = MINIMAL.replace("\"tilt_end\"", "\"settle_timeout_s\": null, \"tilt_end\"");
        let cfg = AcquisitionConfig::from_json_str(&text).unwrap();
        assert_eq!(cfg.settle_timeout(), None);
    }

    fn with(key: &str, value: serde_json::Value) -> String {
        let mut v: serde_json::Value = serde_json::from_str(MINIMAL).unwrap();
        v[key] = value;
        v.to_string()
    }

    #[test]
    fn malformed_values_fail_to_parse() {
        for (key, value) in [("bit_depth", json!(12)), ("resolution", json!("1536"))] {
            assert!(
                matches!(AcquisitionConfig::from_json_str(&with(key, value)), Err(ConfigError::Parse(_))),
                "{key}"
            );
        }
    }

    #[test]
    fn out_of_range_values_are_invalid() {
        for (key, value) in [
            ("tilt_increment", json!(0.0)),
            ("dwell_time", json!(-1.0)),
            ("correction_gain", json!(1.0)),
            ("channels", json!(0)),
            ("poll_interval_ms", json!(0)),
            ("settle_timeout_s", json!(-1.0)),
            ("settle_timeout_s", json!(1e30)),
        ] {
            assert!(
                matches!(AcquisitionConfig::from_json_str(&with(key, value)), Err(ConfigError::Invalid(_))),
                "{key}"
            );
        }
    }

    #[test]
    fn gain_without_anticipation_may_be_one() {
        let text = MINIMAL.replace("\"tilt_end\"", "\"anticipation\": false, \"correction_gain\": 1.0, \"tilt_end\"");
        assert!(AcquisitionConfig::from_json_str(&text).is_ok());
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("series.json");
        std::fs::write(&path, MINIMAL).unwrap();
        assert!(AcquisitionConfig::from_path(&path).is_ok());
        assert!(matches!(
            AcquisitionConfig::from_path(dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
    }
}
