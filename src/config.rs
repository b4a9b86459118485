//! Runtime configuration for the analysis pipeline.
//!
//! Loaded from a JSON file with every section optional; missing sections and
//! unreadable files fall back to defaults. A few deployment settings can be
//! overridden from the environment.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_MODEL_PATH: &str = "GUNSHOT_MODEL_PATH";
pub const ENV_CLOUD_ENDPOINT: &str = "GUNSHOT_CLOUD_ENDPOINT";
pub const ENV_CLOUD_TIMEOUT_MS: &str = "GUNSHOT_CLOUD_TIMEOUT_MS";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub audio: AudioConfig,
    pub features: FeatureConfig,
    pub model: ModelConfig,
    pub cloud: CloudConfig,
    pub localization: LocalizationConfig,
    pub timeouts: TimeoutConfig,
}

/// Decoding and validation of uploaded audio
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Canonical rate every upload is resampled to
    pub sample_rate: u32,
    pub min_duration_secs: f64,
    pub max_duration_secs: f64,
    /// Peak amplitude below which audio counts as silent
    pub silence_threshold: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            min_duration_secs: 0.05,
            max_duration_secs: 30.0,
            silence_threshold: 1e-4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Seconds of audio summarised; longer input is truncated, shorter padded
    pub analysis_window_secs: f32,
    pub n_mfcc: usize,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            analysis_window_secs: 2.0,
            n_mfcc: 13,
            n_fft: 2048,
            hop_length: 512,
            n_mels: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/processed/weapon_classifier.json"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Inference endpoint; cloud classification is disabled when unset
    pub endpoint: Option<String>,
    /// Sent as a bearer token when present
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizationConfig {
    /// Distance between the two recording microphones in metres
    pub mic_spacing_m: f64,
    pub speed_of_sound_mps: f64,
    /// dB SPL corresponding to a full-scale (0 dBFS) sample
    pub full_scale_spl_db: f64,
    pub min_distance_m: f64,
    pub max_distance_m: f64,
    /// Below this signal-to-noise ratio distance is not reported
    pub min_snr_db: f64,
    /// SNR at which distance confidence saturates at 1.0
    pub full_confidence_snr_db: f64,
    /// Self-noise of the recording chain, dBFS
    pub noise_floor_dbfs: f64,
    /// Analysis frame for energy statistics
    pub frame_secs: f64,
}

impl Default for LocalizationConfig {
    fn default() -> Self {
        Self {
            mic_spacing_m: 0.2,
            speed_of_sound_mps: 343.0,
            full_scale_spl_db: 140.0,
            min_distance_m: 1.0,
            max_distance_m: 1500.0,
            min_snr_db: 6.0,
            full_confidence_snr_db: 30.0,
            noise_floor_dbfs: -60.0,
            frame_secs: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub cloud_ms: u64,
    /// Overall deadline for a single request
    pub request_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            cloud_ms: 5_000,
            request_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn cloud(&self) -> Duration {
        Duration::from_millis(self.cloud_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }
}

impl AnalyzerConfig {
    /// Load configuration from a JSON file, falling back to defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::read(path) {
            Ok(config) => {
                log::info!("Using analyzer config {}", path.display());
                config
            }
            Err(err) => {
                log::warn!("Analyzer config {} is not usable ({:#}); running with defaults", path.display(), err);
                Self::default()
            }
        }
    }

    fn read(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let positive = [
            ("audio.sample_rate", self.audio.sample_rate as f64),
            ("features.analysis_window_secs", self.features.analysis_window_secs as f64),
            ("localization.mic_spacing_m", self.localization.mic_spacing_m),
            ("localization.speed_of_sound_mps", self.localization.speed_of_sound_mps),
            ("localization.frame_secs", self.localization.frame_secs),
        ];
        if let Some((name, value)) = positive.iter().find(|(_, v)| !(v.is_finite() && *v > 0.0)) {
            anyhow::bail!("{} must be positive, got {}", name, value);
        }

        let loc = &self.localization;
        if !(loc.min_distance_m >= 0.0 && loc.min_distance_m <= loc.max_distance_m) {
            anyhow::bail!(
                "localization distance range {}..={} m is empty",
                loc.min_distance_m,
                loc.max_distance_m
            );
        }
        if !(self.audio.min_duration_secs <= self.audio.max_duration_secs) {
            anyhow::bail!(
                "audio duration range {}..={} s is empty",
                self.audio.min_duration_secs,
                self.audio.max_duration_secs
            );
        }
        Ok(())
    }

    /// Apply `GUNSHOT_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_MODEL_PATH) {
            self.model.path = PathBuf::from(path);
        }
        if let Some(endpoint) = lookup(ENV_CLOUD_ENDPOINT) {
            let endpoint = endpoint.trim().to_string();
            self.cloud.endpoint = (!endpoint.is_empty()).then_some(endpoint);
        }
        if let Some(raw) = lookup(ENV_CLOUD_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.timeouts.cloud_ms = ms,
                Err(err) => log::warn!("Ignoring {}={:?}: {}", ENV_CLOUD_TIMEOUT_MS, raw, err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = AnalyzerConfig::default();
        assert_eq!(config.audio.sample_rate, 22050);
        assert_eq!(config.features.n_mfcc, 13);
        assert_eq!(config.timeouts.cloud(), Duration::from_secs(5));
        assert!(config.cloud.endpoint.is_none());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{ "timeouts": { "cloud_ms": 250 }, "cloud": { "endpoint": "http://localhost:7860/predict" } }"#;
        let config: AnalyzerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.timeouts.cloud_ms, 250);
        assert_eq!(config.timeouts.request_ms, 10_000);
        assert_eq!(config.cloud.endpoint.as_deref(), Some("http://localhost:7860/predict"));
        assert_eq!(config.features.hop_length, 512);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = AnalyzerConfig::load_from_file("/definitely/not/here.json");
        assert_eq!(config.audio.max_duration_secs, 30.0);
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        assert!(AnalyzerConfig::default().validate().is_ok());

        let mut config = AnalyzerConfig::default();
        config.localization.speed_of_sound_mps = 0.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("speed_of_sound_mps"));

        let mut config = AnalyzerConfig::default();
        config.localization.mic_spacing_m = -0.1;
        assert!(config.validate().is_err());

        let mut config = AnalyzerConfig::default();
        config.localization.frame_secs = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = AnalyzerConfig::default();
        config.audio.sample_rate = 0;
        assert!(config.validate().is_err());

        let mut config = AnalyzerConfig::default();
        config.localization.min_distance_m = 2000.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_speed_from_json_is_rejected() {
        let json = r#"{ "localization": { "speed_of_sound_mps": 0 } }"#;
        let config: AnalyzerConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_MODEL_PATH, "/models/rf.json"),
            (ENV_CLOUD_ENDPOINT, "  "),
            (ENV_CLOUD_TIMEOUT_MS, "1200"),
        ]
        .into_iter()
        .collect();

        let mut config = AnalyzerConfig::default();
        config.cloud.endpoint = Some("http://old".into());
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.model.path, PathBuf::from("/models/rf.json"));
        assert!(config.cloud.endpoint.is_none());
        assert_eq!(config.timeouts.cloud_ms, 1200);
    }
}
