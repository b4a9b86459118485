pub mod audio_processor;
pub mod cloud_client;
pub mod config;
pub mod error;
pub mod feature_extractor;
pub mod fusion;
pub mod localization;
pub mod model_inference;
pub mod orchestrator;
pub mod scaler;
pub mod weapon;

pub use audio_processor::{AudioProcessor, AudioSample};
pub use cloud_client::{CloudClassifier, DisabledCloudClient, HttpCloudClient};
pub use config::AnalyzerConfig;
pub use error::AnalysisError;
pub use feature_extractor::{FeatureVector, MfccExtractor};
pub use fusion::{AnalysisResponse, FusedResult};
pub use localization::{LocalizationEstimate, LocalizationEstimator, Reading};
pub use model_inference::LocalClassifier;
pub use orchestrator::{AnalysisOrchestrator, AnalysisRequest};
pub use scaler::StandardScaler;
pub use weapon::WeaponClass;

use serde::Serialize;

/// Which predictor produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Local,
    Cloud,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub label: WeaponClass,
    /// Always within [0, 1].
    pub confidence: f64,
    #[serde(skip)]
    pub source: Source,
}

impl ClassificationResult {
    pub fn new(label: WeaponClass, confidence: f64, source: Source) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            label,
            confidence,
            source,
        }
    }

    /// Lowest-confidence result for inputs the models cannot place.
    pub fn unknown(source: Source) -> Self {
        Self::new(WeaponClass::Unknown, 0.0, source)
    }
}

pub type Result<T> = anyhow::Result<T>;
