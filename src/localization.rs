//! Distance and bearing heuristics for a single recorded shot.
//!
//! Estimation runs in two steps. `measure` does the signal work (frame
//! energies, inter-channel delay) and needs nothing but the waveform, so it
//! runs alongside classification. `estimate` then applies the loudness
//! calibration of whichever weapon was identified.
//!
//! Distance assumes free-field spherical spreading from a source of known
//! level at 1 m: `L(r) = L_ref - 20 log10(r)`. Bearing comes from the
//! GCC-PHAT delay between the first two channels, falling back to the level
//! difference when the correlation peak is weak. Bearings are clockwise with
//! 0° straight ahead; a two-microphone pair cannot tell front from back, so
//! readings always land in the front half-plane.

use num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Serialize, Serializer};

use crate::audio_processor::AudioSample;
use crate::config::LocalizationConfig;
use crate::error::AnalysisError;

const CORRELATION_MARGIN_SECS: f64 = 0.02;
const MIN_PHAT_PEAK: f64 = 0.1;
const MIN_LEVEL_DIFFERENCE: f64 = 0.01;

/// A value that may be missing. Serializes as a number or `"unavailable"`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Measured(f64),
    Unavailable,
}

impl Reading {
    pub fn value(&self) -> Option<f64> {
        match self {
            Reading::Measured(v) => Some(*v),
            Reading::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Reading::Measured(_))
    }

    fn from_result(result: Result<f64, AnalysisError>, what: &str) -> Self {
        match result {
            Ok(v) if v.is_finite() => Reading::Measured(v),
            Ok(v) => {
                log::debug!("Discarding non-finite {} reading {}", what, v);
                Reading::Unavailable
            }
            Err(e) => {
                log::debug!("{} {}", what, e);
                Reading::Unavailable
            }
        }
    }
}

impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Reading::Measured(v) => serializer.serialize_f64(*v),
            Reading::Unavailable => serializer.serialize_str("unavailable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalizationEstimate {
    /// Metres from the recorder
    pub distance: Reading,
    /// Degrees in [0, 360)
    pub direction: Reading,
    /// 0 when distance is unavailable, rising to 1 with signal-to-noise ratio
    pub distance_confidence: f64,
}

impl LocalizationEstimate {
    pub fn unavailable() -> Self {
        Self {
            distance: Reading::Unavailable,
            direction: Reading::Unavailable,
            distance_confidence: 0.0,
        }
    }
}

/// Waveform-only measurements, independent of the weapon type.
#[derive(Debug, Clone)]
pub struct SignalMeasurement {
    /// RMS level of the loudest analysis frame, dBFS
    pub peak_dbfs: f64,
    /// Bearing in degrees, or why none could be derived
    pub bearing: Result<f64, AnalysisError>,
}

pub struct LocalizationEstimator {
    config: LocalizationConfig,
}

impl LocalizationEstimator {
    pub fn new(config: LocalizationConfig) -> Self {
        Self { config }
    }

    pub fn measure(&self, sample: &AudioSample) -> SignalMeasurement {
        let (peak_frame, peak_rms) = self.loudest_frame(sample.samples(), sample.sample_rate());
        SignalMeasurement {
            peak_dbfs: amplitude_to_db(peak_rms),
            bearing: self.bearing(sample, peak_frame),
        }
    }

    pub fn estimate(&self, measurement: &SignalMeasurement, reference_level_db: f64) -> LocalizationEstimate {
        let distance = Reading::from_result(
            self.distance_for_level(measurement.peak_dbfs, reference_level_db),
            "distance",
        );
        let distance_confidence = if distance.is_available() {
            self.distance_confidence(measurement.peak_dbfs)
        } else {
            0.0
        };

        LocalizationEstimate {
            distance,
            direction: Reading::from_result(measurement.bearing.clone(), "direction"),
            distance_confidence,
        }
    }

    /// Estimate without a loudness reference: bearing only.
    pub fn estimate_bearing(&self, measurement: &SignalMeasurement) -> LocalizationEstimate {
        LocalizationEstimate {
            direction: Reading::from_result(measurement.bearing.clone(), "direction"),
            ..LocalizationEstimate::unavailable()
        }
    }

    pub fn localize(&self, sample: &AudioSample, reference_level_db: f64) -> LocalizationEstimate {
        self.estimate(&self.measure(sample), reference_level_db)
    }

    /// Metres to a source of `reference_level_db` (dB SPL at 1 m) that was
    /// received at `peak_dbfs`. Estimates outside the configured range are
    /// unavailable rather than saturated.
    pub fn distance_for_level(&self, peak_dbfs: f64, reference_level_db: f64) -> Result<f64, AnalysisError> {
        if !peak_dbfs.is_finite() {
            return Err(AnalysisError::LocalizationUnavailable("no signal energy".into()));
        }
        let snr = peak_dbfs - self.config.noise_floor_dbfs;
        if snr < self.config.min_snr_db {
            return Err(AnalysisError::LocalizationUnavailable(format!(
                "signal is {:.1} dB above the noise floor, need {:.1} dB",
                snr, self.config.min_snr_db
            )));
        }

        let received_spl = peak_dbfs + self.config.full_scale_spl_db;
        let distance = 10f64.powf((reference_level_db - received_spl) / 20.0);
        if !distance.is_finite() {
            return Err(AnalysisError::LocalizationUnavailable("distance model diverged".into()));
        }
        if distance < self.config.min_distance_m {
            return Err(AnalysisError::LocalizationUnavailable(format!(
                "estimate {:.2} m is closer than the {} m model minimum",
                distance, self.config.min_distance_m
            )));
        }
        if distance > self.config.max_distance_m {
            return Err(AnalysisError::LocalizationUnavailable(format!(
                "estimate {:.0} m is beyond the {} m model range",
                distance, self.config.max_distance_m
            )));
        }
        Ok(distance)
    }

    pub fn distance_confidence(&self, peak_dbfs: f64) -> f64 {
        let snr = peak_dbfs - self.config.noise_floor_dbfs;
        let span = (self.config.full_confidence_snr_db - self.config.min_snr_db).max(f64::EPSILON);
        ((snr - self.config.min_snr_db) / span).clamp(0.0, 1.0)
    }

    /// Index of the first sample of the loudest frame and its RMS.
    fn loudest_frame(&self, samples: &[f32], sample_rate: u32) -> (usize, f64) {
        let frame_len = ((self.config.frame_secs * sample_rate as f64) as usize).max(1);
        samples
            .chunks(frame_len)
            .enumerate()
            .map(|(i, frame)| (i * frame_len, rms(frame)))
            .fold((0, 0.0), |best, candidate| if candidate.1 > best.1 { candidate } else { best })
    }

    fn bearing(&self, sample: &AudioSample, peak_frame: usize) -> Result<f64, AnalysisError> {
        let channels = sample.channels();
        if channels.len() < 2 {
            return Err(AnalysisError::LocalizationUnavailable("mono recording has no spatial cues".into()));
        }
        let (left, right) = (&channels[0], &channels[1]);

        let peak = sample.peak().max(f32::MIN_POSITIVE);
        let max_difference = left
            .iter()
            .zip(right)
            .fold(0.0f32, |acc, (l, r)| acc.max((l - r).abs()));
        if max_difference <= peak * 1e-4 {
            return Err(AnalysisError::LocalizationUnavailable("channels are identical".into()));
        }

        let rate = sample.sample_rate() as f64;
        let travel_samples = self.config.mic_spacing_m / self.config.speed_of_sound_mps * rate;
        if !travel_samples.is_finite() || travel_samples <= 0.0 || travel_samples >= left.len() as f64 {
            return Err(AnalysisError::LocalizationUnavailable(format!(
                "microphone geometry gives a {:.1} sample delay window",
                travel_samples
            )));
        }
        let max_lag = travel_samples.ceil() as usize + 1;
        let margin = (CORRELATION_MARGIN_SECS * rate) as usize + max_lag;
        let frame_len = ((self.config.frame_secs * rate) as usize).max(1);
        let start = peak_frame.saturating_sub(margin);
        let end = (peak_frame + frame_len + margin).min(left.len()).min(right.len());
        if end <= start + 2 * max_lag {
            return Err(AnalysisError::LocalizationUnavailable("recording too short for correlation".into()));
        }

        let (lag, strength) = gcc_phat(&left[start..end], &right[start..end], max_lag);
        let sine = if strength >= MIN_PHAT_PEAK && lag.abs() >= 0.5 {
            // Right channel lagging puts the source on the left.
            -(lag / rate) * self.config.speed_of_sound_mps / self.config.mic_spacing_m
        } else {
            let l = rms(&left[start..end]);
            let r = rms(&right[start..end]);
            if l + r <= 0.0 {
                return Err(AnalysisError::LocalizationUnavailable("no energy in either channel".into()));
            }
            let balance = (r - l) / (r + l);
            if balance.abs() < MIN_LEVEL_DIFFERENCE {
                return Err(AnalysisError::LocalizationUnavailable(
                    "no usable timing or level difference".into(),
                ));
            }
            balance
        };

        Ok(to_bearing(sine.clamp(-1.0, 1.0).asin().to_degrees()))
    }
}

/// Maps a signed angle (negative = left) onto [0, 360).
fn to_bearing(angle_deg: f64) -> f64 {
    let bearing = angle_deg.rem_euclid(360.0);
    if bearing >= 360.0 {
        0.0
    } else {
        bearing
    }
}

fn rms(frame: &[f32]) -> f64 {
    if frame.is_empty() {
        return 0.0;
    }
    (frame.iter().map(|&s| (s as f64).powi(2)).sum::<f64>() / frame.len() as f64).sqrt()
}

fn amplitude_to_db(amplitude: f64) -> f64 {
    if amplitude > 0.0 {
        20.0 * amplitude.log10()
    } else {
        f64::NEG_INFINITY
    }
}

/// Generalized cross-correlation with phase transform.
///
/// Returns the delay of `b` relative to `a` in (fractional) samples, limited
/// to `±max_lag`, and the normalised correlation peak height.
fn gcc_phat(a: &[f32], b: &[f32], max_lag: usize) -> (f64, f64) {
    let n = (a.len() + b.len()).next_power_of_two();
    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(n);
    let inverse = planner.plan_fft_inverse(n);

    let mut spectrum_a: Vec<Complex<f64>> = a.iter().map(|&s| Complex::new(s as f64, 0.0)).collect();
    spectrum_a.resize(n, Complex::new(0.0, 0.0));
    let mut spectrum_b: Vec<Complex<f64>> = b.iter().map(|&s| Complex::new(s as f64, 0.0)).collect();
    spectrum_b.resize(n, Complex::new(0.0, 0.0));
    forward.process(&mut spectrum_a);
    forward.process(&mut spectrum_b);

    let mut cross: Vec<Complex<f64>> = spectrum_b
        .iter()
        .zip(&spectrum_a)
        .map(|(&xb, &xa)| {
            let product = xb * xa.conj();
            let magnitude = product.norm();
            if magnitude > 1e-12 {
                product / magnitude
            } else {
                Complex::new(0.0, 0.0)
            }
        })
        .collect();
    inverse.process(&mut cross);

    let at = |lag: i64| cross[lag.rem_euclid(n as i64) as usize].re / n as f64;
    let max_lag = max_lag.min(n / 2 - 1) as i64;
    let (best_lag, best_value) = (-max_lag..=max_lag)
        .map(|lag| (lag, at(lag)))
        .fold((0i64, f64::NEG_INFINITY), |best, c| if c.1 > best.1 { c } else { best });

    // Parabolic interpolation around the integer peak.
    let (prev, next) = (at(best_lag - 1), at(best_lag + 1));
    let denominator = prev - 2.0 * best_value + next;
    let offset = if denominator.abs() > 1e-12 {
        (0.5 * (prev - next) / denominator).clamp(-0.5, 0.5)
    } else {
        0.0
    };

    (best_lag as f64 + offset, best_value)
}
