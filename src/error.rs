use thiserror::Error;

/// Failures surfaced by the analysis pipeline.
///
/// Input errors (`UnsupportedFormat`, `EmptyOrCorruptAudio`,
/// `DurationOutOfRange`) fail a request before any model work starts.
/// Source errors (`ModelUnavailable`, `CloudUnavailable`,
/// `LocalizationUnavailable`) only blank their own field of the result.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AnalysisError {
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("audio is empty or corrupt: {0}")]
    EmptyOrCorruptAudio(String),

    #[error("audio duration {seconds:.3}s outside accepted range {min:.3}s..={max:.3}s")]
    DurationOutOfRange { seconds: f64, min: f64, max: f64 },

    #[error("local model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("cloud classifier unavailable: {0}")]
    CloudUnavailable(String),

    #[error("no classifier produced a result (cloud: {cloud}; local: {local})")]
    ClassificationUnavailable { cloud: String, local: String },

    #[error("localization unavailable: {0}")]
    LocalizationUnavailable(String),
}

impl AnalysisError {
    /// Stable identifier reported to callers alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::EmptyOrCorruptAudio(_) => "empty_or_corrupt_audio",
            Self::DurationOutOfRange { .. } => "duration_out_of_range",
            Self::ModelUnavailable(_) => "model_unavailable",
            Self::CloudUnavailable(_) => "cloud_unavailable",
            Self::ClassificationUnavailable { .. } => "classification_unavailable",
            Self::LocalizationUnavailable(_) => "localization_unavailable",
        }
    }

    /// True for errors caused by the uploaded audio itself.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedFormat(_) | Self::EmptyOrCorruptAudio(_) | Self::DurationOutOfRange { .. }
        )
    }
}
