//! Remote weapon classification.
//!
//! The hosted model receives the canonical mono waveform as a WAV upload and
//! answers with a label plus confidence. Every failure mode (transport,
//! timeout, non-2xx, unparseable body) collapses into `CloudUnavailable`; the
//! client never retries.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::audio_processor::{encode_wav, AudioSample};
use crate::error::AnalysisError;
use crate::weapon::WeaponClass;
use crate::{ClassificationResult, Source};

#[async_trait]
pub trait CloudClassifier: Send + Sync {
    async fn classify(&self, sample: &AudioSample) -> Result<ClassificationResult, AnalysisError>;
}

pub struct HttpCloudClient {
    client: reqwest::Client,
    endpoint: String,
    api_token: Option<String>,
}

impl HttpCloudClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, api_token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_token,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CloudClassifier for HttpCloudClient {
    async fn classify(&self, sample: &AudioSample) -> Result<ClassificationResult, AnalysisError> {
        let (samples, rate) = (sample.samples().to_vec(), sample.sample_rate());
        let wav = tokio::task::spawn_blocking(move || encode_wav(&[samples], rate))
            .await
            .map_err(|e| AnalysisError::CloudUnavailable(format!("upload encoding aborted: {}", e)))?
            .map_err(|e| AnalysisError::CloudUnavailable(format!("failed to encode upload: {}", e)))?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(wav);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AnalysisError::CloudUnavailable(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AnalysisError::CloudUnavailable(format!("endpoint returned HTTP {}", status)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AnalysisError::CloudUnavailable(format!("unreadable response: {}", e)))?;

        let result = parse_prediction(&body)?;
        log::debug!("Cloud classified as {} ({:.3})", result.label, result.confidence);
        Ok(result)
    }
}

/// Stand-in used when no endpoint is configured.
pub struct DisabledCloudClient;

#[async_trait]
impl CloudClassifier for DisabledCloudClient {
    async fn classify(&self, _sample: &AudioSample) -> Result<ClassificationResult, AnalysisError> {
        Err(AnalysisError::CloudUnavailable("no cloud endpoint configured".into()))
    }
}

fn malformed(what: &str) -> AnalysisError {
    AnalysisError::CloudUnavailable(format!("malformed response: {}", what))
}

/// Accepts `{label, confidence}`, `{label, confidences: [{label, confidence}]}`,
/// either wrapped as `{data: [...]}`, or a bare label string.
pub fn parse_prediction(body: &Value) -> Result<ClassificationResult, AnalysisError> {
    let map = match body {
        Value::String(label) => return Ok(cloud_result(label, 0.0)),
        Value::Object(map) => map,
        _ => return Err(malformed("expected an object or a label string")),
    };

    if !map.contains_key("label") {
        return match map.get("data") {
            Some(Value::Array(items)) => items
                .first()
                .ok_or_else(|| malformed("empty data array"))
                .and_then(parse_prediction),
            Some(inner @ Value::Object(_)) => parse_prediction(inner),
            _ => Err(malformed("missing label")),
        };
    }

    let label = map
        .get("label")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("label is not a string"))?;

    let confidence = match (map.get("confidence"), map.get("confidences")) {
        (Some(value), _) => number(value)?,
        (None, Some(Value::Array(entries))) => {
            let matching = entries
                .iter()
                .find(|e| e.get("label").and_then(Value::as_str) == Some(label))
                .or_else(|| entries.first());
            match matching.and_then(|e| e.get("confidence")) {
                Some(value) => number(value)?,
                None => 0.0,
            }
        }
        (None, Some(_)) => return Err(malformed("confidences is not an array")),
        (None, None) => 0.0,
    };

    Ok(cloud_result(label, confidence))
}

fn number(value: &Value) -> Result<f64, AnalysisError> {
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| malformed("confidence is not a finite number"))
}

fn cloud_result(label: &str, confidence: f64) -> ClassificationResult {
    match WeaponClass::from_label(label) {
        WeaponClass::Unknown => {
            log::debug!("Cloud label {:?} is not in the weapon catalog", label);
            ClassificationResult::unknown(Source::Cloud)
        }
        weapon => ClassificationResult::new(weapon, confidence, Source::Cloud),
    }
}
