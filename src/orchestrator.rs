//! Per-request pipeline: decode, then run local classification, cloud
//! classification and signal measurement side by side, then fuse.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::time::Instant;

use crate::audio_processor::{AudioProcessor, AudioSample};
use crate::cloud_client::{CloudClassifier, DisabledCloudClient, HttpCloudClient};
use crate::config::AnalyzerConfig;
use crate::error::AnalysisError;
use crate::feature_extractor::MfccExtractor;
use crate::fusion::{fuse, AnalysisResponse, FusedResult};
use crate::localization::{LocalizationEstimate, LocalizationEstimator, Reading};
use crate::model_inference::LocalClassifier;
use crate::weapon::{WeaponClass, DEFAULT_REFERENCE_LEVEL_DB};
use crate::ClassificationResult;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub audio: Vec<u8>,
    pub content_type: String,
    /// Identity of the caller, recorded in the audit log when present
    pub caller: Option<String>,
}

impl AnalysisRequest {
    pub fn new(audio: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            audio,
            content_type: content_type.into(),
            caller: None,
        }
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Started,
    LocalDone,
    CloudDone,
    TimedOut,
    Fused,
    Returned,
}

fn log_phase(request_id: u64, phase: Phase) {
    debug!("request {} {:?}", request_id, phase);
}

pub struct AnalysisOrchestrator {
    processor: Arc<AudioProcessor>,
    extractor: Arc<MfccExtractor>,
    classifier: Option<Arc<LocalClassifier>>,
    cloud: Arc<dyn CloudClassifier>,
    localizer: Arc<LocalizationEstimator>,
    cloud_timeout: Duration,
    request_timeout: Duration,
}

impl AnalysisOrchestrator {
    /// Fails when the loaded model was trained on a different feature layout
    /// than the extractor produces.
    pub fn new(
        config: &AnalyzerConfig,
        classifier: Option<Arc<LocalClassifier>>,
        cloud: Arc<dyn CloudClassifier>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let extractor = MfccExtractor::from_config(config.audio.sample_rate as f32, &config.features);
        if let Some(classifier) = &classifier {
            classifier.check_feature_layout(&extractor.feature_names())?;
        }

        Ok(Self {
            processor: Arc::new(AudioProcessor::from_config(&config.audio)),
            extractor: Arc::new(extractor),
            classifier,
            cloud,
            localizer: Arc::new(LocalizationEstimator::new(config.localization.clone())),
            cloud_timeout: config.timeouts.cloud(),
            request_timeout: config.timeouts.request(),
        })
    }

    /// Loads the model (if any) and picks the cloud client for `config`.
    pub fn from_config(config: &AnalyzerConfig) -> anyhow::Result<Self> {
        let classifier = LocalClassifier::load_shared(&config.model.path);

        let cloud: Arc<dyn CloudClassifier> = match &config.cloud.endpoint {
            Some(endpoint) => {
                let client = HttpCloudClient::new(endpoint.clone(), config.timeouts.cloud(), config.cloud.api_token.clone())?;
                info!("Cloud classifier at {} ({} ms timeout)", client.endpoint(), config.timeouts.cloud_ms);
                Arc::new(client)
            }
            None => {
                info!("No cloud endpoint configured; results will be local-only");
                Arc::new(DisabledCloudClient)
            }
        };

        Self::new(config, classifier, cloud)
    }

    pub fn has_local_model(&self) -> bool {
        self.classifier.is_some()
    }

    pub async fn analyze(&self, request: AnalysisRequest) -> Result<FusedResult, AnalysisError> {
        let deadline = Instant::now() + self.request_timeout;
        self.analyze_until(request, deadline).await
    }

    /// Like `analyze`, with an explicit deadline for the whole request. The
    /// cloud call is abandoned once the deadline passes; local work always
    /// runs to completion.
    pub async fn analyze_until(&self, request: AnalysisRequest, deadline: Instant) -> Result<FusedResult, AnalysisError> {
        let request_id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        log_phase(request_id, Phase::Started);

        let AnalysisRequest {
            audio,
            content_type,
            caller,
        } = request;
        let result = self.run(request_id, audio, content_type, deadline).await;
        audit(request_id, caller.as_deref(), &result);
        result
    }

    /// Runs the request and wraps the outcome in the boundary envelope.
    pub async fn respond(&self, request: AnalysisRequest) -> AnalysisResponse {
        let response = AnalysisResponse::from(self.analyze(request).await);
        if let AnalysisResponse::Error { error } = &response {
            debug!("responding with {}: {}", error.kind, error.message);
        }
        response
    }

    async fn run(
        &self,
        request_id: u64,
        audio: Vec<u8>,
        content_type: String,
        deadline: Instant,
    ) -> Result<FusedResult, AnalysisError> {
        let sample = Arc::new(self.decode(audio, content_type).await?);

        let local = self.classify_locally(request_id, Arc::clone(&sample));
        let measurement = {
            let sample = Arc::clone(&sample);
            let localizer = Arc::clone(&self.localizer);
            tokio::task::spawn_blocking(move || localizer.measure(&sample))
        };
        let cloud = self.classify_in_cloud(request_id, &sample, deadline);

        let (local, measurement, cloud) = tokio::join!(local, measurement, cloud);

        let localization = match (measurement, calibration_level(&cloud, &local)) {
            (Ok(measurement), Some(reference_level)) => self.localizer.estimate(&measurement, reference_level),
            (Ok(measurement), None) => {
                debug!("request {}: no gunshot identified, distance not estimated", request_id);
                self.localizer.estimate_bearing(&measurement)
            }
            (Err(e), _) => {
                log::error!("request {}: signal measurement failed: {}", request_id, e);
                LocalizationEstimate::unavailable()
            }
        };

        let fused = fuse(cloud, local, localization);
        log_phase(request_id, Phase::Fused);
        fused
    }

    async fn decode(&self, audio: Vec<u8>, content_type: String) -> Result<AudioSample, AnalysisError> {
        let processor = Arc::clone(&self.processor);
        tokio::task::spawn_blocking(move || processor.decode(&audio, &content_type))
            .await
            .unwrap_or_else(|e| Err(AnalysisError::EmptyOrCorruptAudio(format!("decoding aborted: {}", e))))
    }

    async fn classify_locally(
        &self,
        request_id: u64,
        sample: Arc<AudioSample>,
    ) -> Result<ClassificationResult, AnalysisError> {
        let Some(classifier) = self.classifier.clone() else {
            return Err(AnalysisError::ModelUnavailable("no local model loaded".into()));
        };
        let extractor = Arc::clone(&self.extractor);

        let result = tokio::task::spawn_blocking(move || classifier.predict(&extractor.extract(&sample)))
            .await
            .unwrap_or_else(|e| Err(AnalysisError::ModelUnavailable(format!("local inference aborted: {}", e))));
        log_phase(request_id, Phase::LocalDone);
        result
    }

    async fn classify_in_cloud(
        &self,
        request_id: u64,
        sample: &AudioSample,
        deadline: Instant,
    ) -> Result<ClassificationResult, AnalysisError> {
        let budget = self
            .cloud_timeout
            .min(deadline.saturating_duration_since(Instant::now()));

        match tokio::time::timeout(budget, self.cloud.classify(sample)).await {
            Ok(result) => {
                log_phase(request_id, Phase::CloudDone);
                if let Err(e) = &result {
                    debug!("request {}: {}", request_id, e);
                }
                result
            }
            Err(_) => {
                log_phase(request_id, Phase::TimedOut);
                Err(AnalysisError::CloudUnavailable(format!(
                    "no answer within {} ms",
                    budget.as_millis()
                )))
            }
        }
    }
}

/// Loudness reference for distance: the cloud label, then the local one,
/// then a generic rifle. `None` when the primary answer is that no gun fired.
fn calibration_level(
    cloud: &Result<ClassificationResult, AnalysisError>,
    local: &Result<ClassificationResult, AnalysisError>,
) -> Option<f64> {
    let labels: Vec<WeaponClass> = [cloud.as_ref().ok(), local.as_ref().ok()]
        .into_iter()
        .flatten()
        .map(|r| r.label)
        .collect();
    if labels.first() == Some(&WeaponClass::NoGun) {
        return None;
    }
    Some(
        labels
            .iter()
            .find_map(|label| label.reference_level_db())
            .unwrap_or(DEFAULT_REFERENCE_LEVEL_DB),
    )
}

fn reading(reading: &Reading) -> String {
    match reading.value() {
        Some(v) => format!("{:.1}", v),
        None => "unavailable".to_string(),
    }
}

fn audit(request_id: u64, caller: Option<&str>, result: &Result<FusedResult, AnalysisError>) {
    log_phase(request_id, Phase::Returned);
    let Some(caller) = caller else {
        return;
    };

    let summary = match result {
        Ok(fused) => serde_json::json!({
            "status": "success",
            "primary": fused.primary().map(|r| r.label.as_str()),
            "cloud": fused.cloud.as_ref().map(|r| r.label.as_str()),
            "local": fused.local.as_ref().map(|r| r.label.as_str()),
            "agree": fused.sources_agree(),
            "distance": reading(&fused.localization.distance),
            "direction": reading(&fused.localization.direction),
            "degraded": fused.degraded,
        }),
        Err(e) => serde_json::json!({ "status": "error", "kind": e.kind() }),
    };
    info!(target: "audit", "caller={} action=AI_ANALYZE request={} result={}", caller, request_id, summary);
}
