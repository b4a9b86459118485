use async_trait::async_trait;
use gunshot_identifier::model_inference::{DecisionTree, ModelArtifact, ModelBody, ARTIFACT_FORMAT_VERSION};
use gunshot_identifier::{
    AnalysisError, AnalysisOrchestrator, AnalysisRequest, AnalyzerConfig, AudioSample, ClassificationResult,
    CloudClassifier, DisabledCloudClient, LocalClassifier, LocalizationEstimator, MfccExtractor, Reading, Source,
    WeaponClass,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const RATE: u32 = 22050;

fn wav_bytes(channels: &[Vec<f32>]) -> Vec<u8> {
    wav_bytes_at(channels, RATE)
}

fn wav_bytes_at(channels: &[Vec<f32>], sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: channels.len() as u16,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for i in 0..channels[0].len() {
            for channel in channels {
                writer.write_sample((channel[i] * i16::MAX as f32) as i16).unwrap();
            }
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

fn tone(secs: f32, amplitude: f32) -> Vec<f32> {
    (0..(secs * RATE as f32) as usize)
        .map(|i| amplitude * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / RATE as f32).sin())
        .collect()
}

fn shot(secs: f32, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let len = (secs * RATE as f32) as usize;
    (0..len)
        .map(|i| {
            let t = i as f32 / RATE as f32;
            if t >= 0.2 {
                rng.gen_range(-0.9f32..0.9) * (-(t - 0.2) * 12.0).exp()
            } else {
                0.0
            }
        })
        .collect()
}

fn delayed(signal: &[f32], delay: usize) -> Vec<f32> {
    let mut out = vec![0.0; delay];
    out.extend_from_slice(&signal[..signal.len() - delay]);
    out
}

/// Two-tree forest over the default feature layout, splitting on RMS.
fn artifact(feature_names: Vec<String>) -> ModelArtifact {
    let stump = |feature: i64, quiet: Vec<f64>, loud: Vec<f64>| DecisionTree {
        children_left: vec![1, -1, -1],
        children_right: vec![2, -1, -1],
        feature: vec![feature, -2, -2],
        threshold: vec![0.05, -2.0, -2.0],
        value: vec![vec![1.0, 1.0], quiet, loud],
    };
    ModelArtifact {
        format_version: ARTIFACT_FORMAT_VERSION,
        model_version: "pipeline-test".into(),
        feature_names,
        classes: vec!["ak".into(), "m4".into()],
        scaler: None,
        model: ModelBody::RandomForest {
            trees: vec![
                stump(1, vec![0.0, 3.0], vec![3.0, 1.0]),
                stump(1, vec![1.0, 4.0], vec![4.0, 0.0]),
            ],
        },
    }
}

fn default_feature_names(config: &AnalyzerConfig) -> Vec<String> {
    MfccExtractor::from_config(config.audio.sample_rate as f32, &config.features).feature_names()
}

fn write_model(dir: &Path, artifact: &ModelArtifact) -> PathBuf {
    let path = dir.join("weapon_classifier.json");
    std::fs::write(&path, serde_json::to_string_pretty(artifact).unwrap()).unwrap();
    path
}

fn load_model(config: &AnalyzerConfig) -> (tempfile::TempDir, Arc<LocalClassifier>) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_model(dir.path(), &artifact(default_feature_names(config)));
    let classifier = LocalClassifier::load_shared(&path).expect("model should load");
    (dir, classifier)
}

struct MockCloud {
    result: Result<ClassificationResult, AnalysisError>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockCloud {
    fn answering(label: WeaponClass, confidence: f64, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            result: Ok(ClassificationResult::new(label, confidence, Source::Cloud)),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            result: Err(AnalysisError::CloudUnavailable("HTTP 502".into())),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudClassifier for MockCloud {
    async fn classify(&self, _sample: &AudioSample) -> Result<ClassificationResult, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.result.clone()
    }
}

#[tokio::test]
async fn mono_tone_with_both_classifiers() {
    let config = AnalyzerConfig::default();
    let (_dir, classifier) = load_model(&config);
    let cloud = MockCloud::answering(WeaponClass::Akm, 0.92, Duration::from_millis(10));
    let orchestrator = AnalysisOrchestrator::new(&config, Some(classifier), cloud.clone()).unwrap();

    let request = AnalysisRequest::new(wav_bytes(&[tone(3.0, 0.5)]), "audio/wav").with_caller("student-42");
    let response = orchestrator.respond(request).await;
    let json = serde_json::to_value(&response).unwrap();

    assert_eq!(json["status"], "success");
    assert_eq!(json["data"]["cloud"]["label"], "AKM");
    assert_eq!(json["data"]["cloud"]["confidence"], 0.92);
    assert!(json["data"]["local"].is_object());
    assert_eq!(json["data"]["localization"]["direction"], "unavailable");
    let distance = json["data"]["localization"]["distance"].as_f64().expect("distance should be numeric");
    assert!(distance.is_finite() && distance >= 0.0);
    assert_eq!(json["data"]["degraded"], false);
    assert_eq!(cloud.calls(), 1);
}

#[tokio::test]
async fn slow_cloud_degrades_to_local_only() {
    let mut config = AnalyzerConfig::default();
    config.timeouts.cloud_ms = 200;
    let (_dir, classifier) = load_model(&config);
    let cloud = MockCloud::answering(WeaponClass::Akm, 0.92, Duration::from_secs(3));
    let orchestrator = AnalysisOrchestrator::new(&config, Some(classifier), cloud).unwrap();

    let started = Instant::now();
    let result = orchestrator
        .analyze(AnalysisRequest::new(wav_bytes(&[tone(3.0, 0.5)]), "audio/wav"))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(result.cloud.is_none());
    assert!(result.local.is_some());
    assert!(result.degraded);
    assert!(elapsed < Duration::from_millis(2500), "took {:?}", elapsed);
}

#[tokio::test]
async fn request_deadline_caps_cloud_wait() {
    let config = AnalyzerConfig::default();
    let (_dir, classifier) = load_model(&config);
    let cloud = MockCloud::answering(WeaponClass::Akm, 0.92, Duration::from_secs(3));
    let orchestrator = AnalysisOrchestrator::new(&config, Some(classifier), cloud).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_millis(150);
    let result = orchestrator
        .analyze_until(AnalysisRequest::new(wav_bytes(&[tone(1.0, 0.5)]), "audio/wav"), deadline)
        .await
        .unwrap();
    assert!(result.cloud.is_none());
    assert!(result.local.is_some());
}

#[tokio::test]
async fn corrupt_audio_fails_before_classification() {
    let config = AnalyzerConfig::default();
    let (_dir, classifier) = load_model(&config);
    let cloud = MockCloud::answering(WeaponClass::Akm, 0.92, Duration::ZERO);
    let orchestrator = AnalysisOrchestrator::new(&config, Some(classifier), cloud.clone()).unwrap();

    let garbage: Vec<u8> = (0..512u32).map(|i| (i * 37 % 251) as u8).collect();
    let err = orchestrator
        .analyze(AnalysisRequest::new(garbage, "audio/wav"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "empty_or_corrupt_audio");
    assert_eq!(cloud.calls(), 0);
}

#[tokio::test]
async fn stereo_offset_yields_bearing() {
    let config = AnalyzerConfig::default();
    let (_dir, classifier) = load_model(&config);
    let cloud = MockCloud::answering(WeaponClass::M416, 0.8, Duration::ZERO);
    let orchestrator = AnalysisOrchestrator::new(&config, Some(classifier), cloud).unwrap();

    let left = shot(1.0, 11);
    let right = delayed(&left, 10);
    let result = orchestrator
        .analyze(AnalysisRequest::new(wav_bytes(&[left, right]), "audio/x-wav"))
        .await
        .unwrap();

    let bearing = result.localization.direction.value().expect("bearing should be measured");
    assert!((0.0..360.0).contains(&bearing), "bearing {}", bearing);
    assert!(result.localization.distance.is_available());
}

#[tokio::test]
async fn no_classifier_at_all_fails_the_request() {
    let orchestrator =
        AnalysisOrchestrator::new(&AnalyzerConfig::default(), None, MockCloud::failing()).unwrap();

    let response = orchestrator
        .respond(AnalysisRequest::new(wav_bytes(&[tone(1.0, 0.5)]), "audio/wav"))
        .await;
    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json["status"], "error");
    assert_eq!(json["error"]["kind"], "classification_unavailable");
}

#[tokio::test]
async fn missing_model_runs_cloud_only() {
    let config = AnalyzerConfig::default();
    assert!(LocalClassifier::load_shared("/nonexistent/weapon_classifier.json").is_none());

    let cloud = MockCloud::answering(WeaponClass::Kar98k, 0.7, Duration::ZERO);
    let orchestrator = AnalysisOrchestrator::new(&config, None, cloud).unwrap();
    assert!(!orchestrator.has_local_model());

    let result = orchestrator
        .analyze(AnalysisRequest::new(wav_bytes(&[tone(1.0, 0.5)]), "audio/wav"))
        .await
        .unwrap();
    assert_eq!(result.cloud.map(|c| c.label), Some(WeaponClass::Kar98k));
    assert!(result.local.is_none());
    assert!(result.degraded);
}

#[tokio::test]
async fn disabled_cloud_reports_null() {
    let config = AnalyzerConfig::default();
    let (_dir, classifier) = load_model(&config);
    let orchestrator = AnalysisOrchestrator::new(&config, Some(classifier), Arc::new(DisabledCloudClient)).unwrap();

    let result = orchestrator
        .analyze(AnalysisRequest::new(wav_bytes(&[tone(1.0, 0.5)]), "audio/wav"))
        .await
        .unwrap();
    assert!(result.cloud.is_none());
    assert!(result.local.is_some());
}

#[tokio::test]
async fn no_gun_has_no_distance() {
    let config = AnalyzerConfig::default();
    let (_dir, classifier) = load_model(&config);
    let cloud = MockCloud::answering(WeaponClass::NoGun, 0.95, Duration::ZERO);
    let orchestrator = AnalysisOrchestrator::new(&config, Some(classifier), cloud).unwrap();

    let left = shot(1.0, 21);
    let right = delayed(&left, 6);
    let result = orchestrator
        .analyze(AnalysisRequest::new(wav_bytes(&[left, right]), "audio/wav"))
        .await
        .unwrap();

    assert_eq!(result.cloud.map(|c| c.label), Some(WeaponClass::NoGun));
    assert_eq!(result.localization.distance, Reading::Unavailable);
    assert_eq!(result.localization.distance_confidence, 0.0);
    assert!(result.localization.direction.is_available());
}

#[tokio::test]
async fn decoding_leaves_the_runtime_responsive() {
    let config = AnalyzerConfig::default();
    let orchestrator =
        AnalysisOrchestrator::new(&config, None, MockCloud::answering(WeaponClass::Akm, 0.9, Duration::ZERO)).unwrap();

    // 29 s of stereo at 44.1 kHz, resampled down during decode.
    let long = shot(58.0, 3);
    let wav = wav_bytes_at(&[long.clone(), delayed(&long, 4)], 44100);

    let worst_gap_us = Arc::new(AtomicU64::new(0));
    let ticks = Arc::new(AtomicUsize::new(0));
    let ticker = {
        let worst_gap_us = Arc::clone(&worst_gap_us);
        let ticks = Arc::clone(&ticks);
        tokio::spawn(async move {
            let mut last = Instant::now();
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let now = Instant::now();
                worst_gap_us.fetch_max((now - last).as_micros() as u64, Ordering::SeqCst);
                ticks.fetch_add(1, Ordering::SeqCst);
                last = now;
            }
        })
    };
    tokio::task::yield_now().await;

    let result = orchestrator.analyze(AnalysisRequest::new(wav, "audio/wav")).await;
    ticker.abort();

    assert!(result.is_ok());
    assert!(ticks.load(Ordering::SeqCst) > 0);
    let worst = Duration::from_micros(worst_gap_us.load(Ordering::SeqCst));
    assert!(worst < Duration::from_millis(250), "runtime stalled for {:?}", worst);
}

#[test]
fn mismatched_feature_layout_is_fatal() {
    let config = AnalyzerConfig::default();
    let dir = tempfile::tempdir().unwrap();
    let names: Vec<String> = (0..16).map(|i| format!("f{}", i)).collect();
    let path = write_model(dir.path(), &artifact(names));
    let classifier = LocalClassifier::load_shared(&path).unwrap();

    let result = AnalysisOrchestrator::new(&config, Some(classifier), Arc::new(DisabledCloudClient));
    assert!(result.is_err());
}

#[test]
fn features_and_predictions_are_reproducible() {
    let config = AnalyzerConfig::default();
    let (_dir, classifier) = load_model(&config);
    let extractor = MfccExtractor::from_config(RATE as f32, &config.features);
    let sample = AudioSample::mono(shot(2.5, 5), RATE);

    let first = extractor.extract(&sample);
    let second = extractor.extract(&sample);
    assert_eq!(first.len(), extractor.dimension());
    assert_eq!(first.as_slice(), second.as_slice());

    let other = extractor.extract(&AudioSample::mono(tone(1.0, 0.3), RATE));
    let a = classifier.predict(&first).unwrap();
    let _ = classifier.predict(&other).unwrap();
    let b = classifier.predict(&first).unwrap();
    assert_eq!(a, b);
}

#[test]
fn louder_shots_are_never_farther() {
    let estimator = LocalizationEstimator::new(AnalyzerConfig::default().localization);
    let reference = WeaponClass::Akm.reference_level_db().unwrap();

    let mut previous = f64::INFINITY;
    let mut measured = 0;
    for step in 1..=40 {
        let amplitude = step as f32 * 0.025;
        let estimate = estimator.localize(&AudioSample::mono(tone(0.5, amplitude), RATE), reference);
        // Readings outside the model range are reported as unavailable.
        if let Reading::Measured(distance) = estimate.distance {
            assert!(distance <= previous, "{} m after {} m", distance, previous);
            previous = distance;
            measured += 1;
        }
    }
    assert!(measured >= 20);
}

#[test]
fn mono_never_has_direction() {
    let estimator = LocalizationEstimator::new(AnalyzerConfig::default().localization);
    for seed in 0..5 {
        let estimate = estimator.localize(&AudioSample::mono(shot(1.0, seed), RATE), 157.0);
        assert_eq!(estimate.direction, Reading::Unavailable);
    }
}
