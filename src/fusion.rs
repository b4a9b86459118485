use serde::Serialize;

use crate::error::AnalysisError;
use crate::localization::LocalizationEstimate;
use crate::ClassificationResult;

/// Outcome of one analysis request.
///
/// The cloud result is the primary answer and the local one corroborates it.
/// Disagreement between the two is reported as is; nothing reconciles them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedResult {
    pub cloud: Option<ClassificationResult>,
    pub local: Option<ClassificationResult>,
    pub localization: LocalizationEstimate,
    /// Set when either classifier failed to contribute
    pub degraded: bool,
}

impl FusedResult {
    pub fn primary(&self) -> Option<&ClassificationResult> {
        self.cloud.as_ref().or(self.local.as_ref())
    }

    /// `None` unless both classifiers answered.
    pub fn sources_agree(&self) -> Option<bool> {
        match (&self.cloud, &self.local) {
            (Some(cloud), Some(local)) => Some(cloud.label == local.label),
            _ => None,
        }
    }
}

pub fn fuse(
    cloud: Result<ClassificationResult, AnalysisError>,
    local: Result<ClassificationResult, AnalysisError>,
    localization: LocalizationEstimate,
) -> Result<FusedResult, AnalysisError> {
    match (cloud, local) {
        (Err(cloud), Err(local)) => Err(AnalysisError::ClassificationUnavailable {
            cloud: cloud.to_string(),
            local: local.to_string(),
        }),
        (cloud, local) => {
            let degraded = cloud.is_err() || local.is_err();
            Ok(FusedResult {
                cloud: cloud.ok(),
                local: local.ok(),
                localization,
                degraded,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
}

impl From<&AnalysisError> for ErrorBody {
    fn from(err: &AnalysisError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// JSON envelope handed back across the service boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AnalysisResponse {
    Success { data: FusedResult },
    Error { error: ErrorBody },
}

impl AnalysisResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, AnalysisResponse::Success { .. })
    }
}

impl From<Result<FusedResult, AnalysisError>> for AnalysisResponse {
    fn from(result: Result<FusedResult, AnalysisError>) -> Self {
        match result {
            Ok(data) => AnalysisResponse::Success { data },
            Err(err) => AnalysisResponse::Error { error: (&err).into() },
        }
    }
}
