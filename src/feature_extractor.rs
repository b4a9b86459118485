use ndarray::{s, Array1, Array2, Axis};
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use crate::audio_processor::AudioSample;
use crate::config::FeatureConfig;

const SCALAR_FEATURES: [&str; 3] = ["zcr", "rms", "spectral_centroid"];
const TOP_DB: f32 = 80.0;
const FEATURE_LIMIT: f64 = 1.0e6;

/// Fixed-length summary of one upload, laid out as
/// `[zcr, rms, spectral_centroid, mfcc_mean_*, mfcc_var_*]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector(Array1<f64>);

impl FeatureVector {
    pub fn from_vec(values: Vec<f64>) -> Self {
        Self(Array1::from(values))
    }

    pub fn values(&self) -> &Array1<f64> {
        &self.0
    }

    pub fn as_slice(&self) -> &[f64] {
        self.0.as_slice().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

pub struct MfccExtractor {
    sample_rate: f32,
    n_mfcc: usize,
    n_fft: usize,
    hop_length: usize,
    window_len: usize,
    fft: Arc<dyn Fft<f32>>,
    hann: Vec<f32>,
    mel_filters: Array2<f32>,
    dct_basis: Array2<f32>,
}

impl MfccExtractor {
    pub fn new(sample_rate: f32, n_mfcc: usize) -> Self {
        Self::from_config(
            sample_rate,
            &FeatureConfig {
                n_mfcc,
                ..FeatureConfig::default()
            },
        )
    }

    pub fn from_config(sample_rate: f32, config: &FeatureConfig) -> Self {
        let n_fft = config.n_fft.max(16);
        let hop_length = config.hop_length.max(1);
        let window_len = ((config.analysis_window_secs * sample_rate) as usize).max(n_fft);

        let hann = (0..n_fft)
            .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / n_fft as f32).cos()))
            .collect();

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n_fft);

        Self {
            sample_rate,
            n_mfcc: config.n_mfcc,
            n_fft,
            hop_length,
            window_len,
            fft,
            hann,
            mel_filters: create_mel_filters(sample_rate, n_fft, config.n_mels.max(1)),
            dct_basis: create_dct_basis(config.n_mfcc, config.n_mels.max(1)),
        }
    }

    /// Length of every vector this extractor produces.
    pub fn dimension(&self) -> usize {
        SCALAR_FEATURES.len() + 2 * self.n_mfcc
    }

    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = SCALAR_FEATURES.iter().map(|s| s.to_string()).collect();
        names.extend((0..self.n_mfcc).map(|i| format!("mfcc_mean_{}", i)));
        names.extend((0..self.n_mfcc).map(|i| format!("mfcc_var_{}", i)));
        names
    }

    pub fn extract(&self, sample: &AudioSample) -> FeatureVector {
        if sample.sample_rate() as f32 != self.sample_rate {
            log::warn!(
                "Extracting features at {} Hz from audio sampled at {} Hz",
                self.sample_rate,
                sample.sample_rate()
            );
        }
        self.extract_features(sample.samples())
    }

    pub fn extract_features(&self, audio: &[f32]) -> FeatureVector {
        let audio = self.fit_to_window(audio);
        let frames = self.frame_starts(audio.len());

        let mut spectrogram = Array2::<f32>::zeros((self.n_fft / 2 + 1, frames.len()));
        let mut zcr = 0.0f64;
        let mut rms = 0.0f64;
        let mut centroid = 0.0f64;
        let mut buffer = vec![Complex::new(0.0f32, 0.0); self.n_fft];

        for (frame_idx, &start) in frames.iter().enumerate() {
            let frame = &audio[start..start + self.n_fft];
            zcr += zero_crossing_rate(frame);
            rms += (frame.iter().map(|&s| (s as f64).powi(2)).sum::<f64>() / frame.len() as f64).sqrt();

            for ((slot, &sample), &w) in buffer.iter_mut().zip(frame).zip(&self.hann) {
                *slot = Complex::new(sample * w, 0.0);
            }
            self.fft.process(&mut buffer);

            let mut weighted = 0.0f64;
            let mut total = 0.0f64;
            for (bin, value) in buffer.iter().take(self.n_fft / 2 + 1).enumerate() {
                spectrogram[[bin, frame_idx]] = value.norm_sqr();
                let magnitude = value.norm() as f64;
                weighted += magnitude * self.bin_frequency(bin) as f64;
                total += magnitude;
            }
            if total > 0.0 {
                centroid += weighted / total;
            }
        }

        let n_frames = frames.len().max(1) as f64;
        let mfccs = self.compute_mfcc(&spectrogram);
        let means = mfccs
            .mean_axis(Axis(1))
            .unwrap_or_else(|| Array1::zeros(self.n_mfcc));
        let variances = mfccs.var_axis(Axis(1), 0.0);

        let mut features = Vec::with_capacity(self.dimension());
        features.extend([zcr / n_frames, rms / n_frames, centroid / n_frames]);
        features.extend(means.iter().map(|&x| x as f64));
        features.extend(variances.iter().map(|&x| x as f64));

        for value in &mut features {
            *value = if value.is_finite() {
                value.clamp(-FEATURE_LIMIT, FEATURE_LIMIT)
            } else {
                0.0
            };
        }

        FeatureVector::from_vec(features)
    }

    /// Truncates or zero-pads to the fixed analysis window.
    fn fit_to_window(&self, audio: &[f32]) -> Vec<f32> {
        let mut fitted = audio[..audio.len().min(self.window_len)].to_vec();
        fitted.resize(self.window_len, 0.0);
        fitted
    }

    fn frame_starts(&self, len: usize) -> Vec<usize> {
        (0..=len - self.n_fft).step_by(self.hop_length).collect()
    }

    fn bin_frequency(&self, bin: usize) -> f32 {
        bin as f32 * self.sample_rate / self.n_fft as f32
    }

    fn compute_mfcc(&self, spectrogram: &Array2<f32>) -> Array2<f32> {
        let mel = self.mel_filters.dot(spectrogram);
        let mut log_mel = mel.mapv(|x| 10.0 * x.max(1e-10).log10());

        let max_db = log_mel.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        if max_db.is_finite() {
            log_mel.mapv_inplace(|x| x.max(max_db - TOP_DB));
        }

        self.dct_basis.dot(&log_mel)
    }
}

fn zero_crossing_rate(frame: &[f32]) -> f64 {
    if frame.len() < 2 {
        return 0.0;
    }
    let crossings = frame
        .windows(2)
        .filter(|pair| (pair[0] >= 0.0) != (pair[1] >= 0.0))
        .count();
    crossings as f64 / frame.len() as f64
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
}

/// Triangular filters over mel-spaced centre frequencies. Edges are
/// evaluated on continuous frequencies so narrow low bands never collapse.
fn create_mel_filters(sample_rate: f32, n_fft: usize, n_mels: usize) -> Array2<f32> {
    let n_freqs = n_fft / 2 + 1;
    let mut filters = Array2::zeros((n_mels, n_freqs));

    let mel_low = hz_to_mel(0.0);
    let mel_high = hz_to_mel(sample_rate / 2.0);
    let hz_points: Vec<f32> = (0..=n_mels + 1)
        .map(|i| mel_to_hz(mel_low + (mel_high - mel_low) * i as f32 / (n_mels + 1) as f32))
        .collect();

    for m in 0..n_mels {
        let (left, center, right) = (hz_points[m], hz_points[m + 1], hz_points[m + 2]);
        let mut row = filters.slice_mut(s![m, ..]);
        for (k, weight) in row.iter_mut().enumerate() {
            let freq = k as f32 * sample_rate / n_fft as f32;
            let rising = (freq - left) / (center - left);
            let falling = (right - freq) / (right - center);
            *weight = rising.min(falling).max(0.0);
        }
    }

    filters
}

/// Orthonormal DCT-II basis, `n_mfcc x n_mels`.
fn create_dct_basis(n_mfcc: usize, n_mels: usize) -> Array2<f32> {
    let n = n_mels as f32;
    Array2::from_shape_fn((n_mfcc, n_mels), |(k, j)| {
        let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
        scale * (std::f32::consts::PI * k as f32 * (2.0 * j as f32 + 1.0) / (2.0 * n)).cos()
    })
}
