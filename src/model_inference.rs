//! Local weapon classifier.
//!
//! Models ship as a versioned JSON artifact holding the feature layout, class
//! labels, optional scaler and the model body: either a random forest in the
//! flat per-node layout scikit-learn exports, or a pointer to an ONNX graph
//! (requires the `onnx` feature). The classifier is loaded once and only read
//! afterwards, so a single `Arc<LocalClassifier>` serves every request.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::AnalysisError;
use crate::feature_extractor::FeatureVector;
use crate::scaler::StandardScaler;
use crate::weapon::WeaponClass;
use crate::{ClassificationResult, Source};

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

const LEAF: i64 = -1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub model_version: String,
    pub feature_names: Vec<String>,
    pub classes: Vec<String>,
    #[serde(default)]
    pub scaler: Option<StandardScaler>,
    pub model: ModelBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelBody {
    RandomForest { trees: Vec<DecisionTree> },
    /// Path is resolved relative to the artifact file.
    Onnx { path: PathBuf },
}

/// One fitted tree. Node `i` is a leaf when `children_left[i] == -1`;
/// otherwise samples with `x[feature[i]] <= threshold[i]` go left.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    pub children_left: Vec<i64>,
    pub children_right: Vec<i64>,
    pub feature: Vec<i64>,
    pub threshold: Vec<f64>,
    /// Per-node class counts or weights.
    pub value: Vec<Vec<f64>>,
}

impl DecisionTree {
    fn validate(&self, n_features: usize, n_classes: usize) -> anyhow::Result<()> {
        let n_nodes = self.children_left.len();
        if n_nodes == 0 {
            anyhow::bail!("tree has no nodes");
        }
        if [self.children_right.len(), self.feature.len(), self.threshold.len(), self.value.len()]
            .iter()
            .any(|&len| len != n_nodes)
        {
            anyhow::bail!("tree node arrays have inconsistent lengths");
        }

        for node in 0..n_nodes {
            let (left, right) = (self.children_left[node], self.children_right[node]);
            if left == LEAF {
                if self.value[node].len() != n_classes {
                    anyhow::bail!("leaf {} has {} class weights, expected {}", node, self.value[node].len(), n_classes);
                }
                continue;
            }
            // Children always follow their parent, which also rules out cycles.
            for child in [left, right] {
                if child <= node as i64 || child as usize >= n_nodes {
                    anyhow::bail!("node {} has invalid child {}", node, child);
                }
            }
            let feature = self.feature[node];
            if feature < 0 || feature as usize >= n_features {
                anyhow::bail!("node {} splits on feature {} of {}", node, feature, n_features);
            }
            if !self.threshold[node].is_finite() {
                anyhow::bail!("node {} has a non-finite threshold", node);
            }
        }
        Ok(())
    }

    fn leaf_distribution(&self, x: &[f64]) -> &[f64] {
        let mut node = 0usize;
        while self.children_left[node] != LEAF {
            let feature = self.feature[node] as usize;
            node = if x[feature] <= self.threshold[node] {
                self.children_left[node] as usize
            } else {
                self.children_right[node] as usize
            };
        }
        &self.value[node]
    }
}

enum Backend {
    Forest(Vec<DecisionTree>),
    #[cfg(feature = "onnx")]
    Onnx(onnx::OnnxModel),
}

pub struct LocalClassifier {
    model_version: String,
    feature_names: Vec<String>,
    labels: Vec<WeaponClass>,
    scaler: Option<StandardScaler>,
    backend: Backend,
}

impl LocalClassifier {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, AnalysisError> {
        let path = path.as_ref();
        Self::load_artifact(path)
            .map_err(|e| AnalysisError::ModelUnavailable(format!("{}: {:#}", path.display(), e)))
    }

    /// Loads the shared handle, or logs the failure once and returns `None`
    /// so the process keeps serving cloud-only results.
    pub fn load_shared<P: AsRef<Path>>(path: P) -> Option<Arc<Self>> {
        match Self::load(&path) {
            Ok(classifier) => {
                log::info!(
                    "Loaded local model {} ({} classes, {} features)",
                    classifier.model_version,
                    classifier.labels.len(),
                    classifier.n_features()
                );
                Some(Arc::new(classifier))
            }
            Err(e) => {
                log::warn!("{}; local classification disabled until restart", e);
                None
            }
        }
    }

    fn load_artifact(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let artifact: ModelArtifact = serde_json::from_str(&contents)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_artifact(artifact, base_dir)
    }

    pub fn from_artifact(artifact: ModelArtifact, base_dir: &Path) -> anyhow::Result<Self> {
        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            anyhow::bail!(
                "artifact format version {} is not supported (expected {})",
                artifact.format_version,
                ARTIFACT_FORMAT_VERSION
            );
        }
        if artifact.classes.is_empty() {
            anyhow::bail!("artifact declares no classes");
        }
        if artifact.feature_names.is_empty() {
            anyhow::bail!("artifact declares no features");
        }

        let n_features = artifact.feature_names.len();
        if let Some(scaler) = &artifact.scaler {
            scaler.validate()?;
            if scaler.dimension() != n_features {
                anyhow::bail!("scaler covers {} features, model expects {}", scaler.dimension(), n_features);
            }
        }

        let labels: Vec<WeaponClass> = artifact.classes.iter().map(|c| WeaponClass::from_label(c)).collect();
        for (class, label) in artifact.classes.iter().zip(&labels) {
            if !label.is_known() {
                log::warn!("Model class {:?} is not in the weapon catalog; it will report Unknown", class);
            }
        }

        let backend = match artifact.model {
            ModelBody::RandomForest { trees } => {
                if trees.is_empty() {
                    anyhow::bail!("random forest has no trees");
                }
                for (i, tree) in trees.iter().enumerate() {
                    tree.validate(n_features, labels.len())
                        .map_err(|e| anyhow::anyhow!("tree {}: {}", i, e))?;
                }
                Backend::Forest(trees)
            }
            #[cfg(feature = "onnx")]
            ModelBody::Onnx { path } => Backend::Onnx(onnx::OnnxModel::new(&base_dir.join(path))?),
            #[cfg(not(feature = "onnx"))]
            ModelBody::Onnx { path } => {
                anyhow::bail!(
                    "{} is an ONNX model but this build lacks the `onnx` feature",
                    base_dir.join(path).display()
                )
            }
        };

        Ok(Self {
            model_version: artifact.model_version,
            feature_names: artifact.feature_names,
            labels,
            scaler: artifact.scaler,
            backend,
        })
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn labels(&self) -> &[WeaponClass] {
        &self.labels
    }

    /// Verifies the extractor produces exactly the layout this model was
    /// trained on. A mismatch is a deployment error.
    pub fn check_feature_layout(&self, extractor_names: &[String]) -> anyhow::Result<()> {
        if extractor_names.len() != self.n_features() {
            anyhow::bail!(
                "feature extractor yields {} features but model {} expects {}",
                extractor_names.len(),
                self.model_version,
                self.n_features()
            );
        }
        if let Some((i, (ours, theirs))) = extractor_names
            .iter()
            .zip(&self.feature_names)
            .enumerate()
            .find(|(_, (a, b))| a != b)
        {
            anyhow::bail!("feature {} is {:?} but model {} expects {:?}", i, ours, self.model_version, theirs);
        }
        Ok(())
    }

    /// Class probabilities in label order.
    pub fn predict_proba(&self, features: &FeatureVector) -> Result<Vec<f64>, AnalysisError> {
        if features.len() != self.n_features() {
            return Err(AnalysisError::ModelUnavailable(format!(
                "model expects {} features, got {}",
                self.n_features(),
                features.len()
            )));
        }

        let scaled = match &self.scaler {
            Some(scaler) => scaler.transform_single(features.values()),
            None => features.values().clone(),
        };
        let x = scaled.to_vec();

        match &self.backend {
            Backend::Forest(trees) => Ok(forest_proba(trees, &x, self.labels.len())),
            #[cfg(feature = "onnx")]
            Backend::Onnx(model) => model
                .predict_proba(&x, self.labels.len())
                .map_err(|e| AnalysisError::ModelUnavailable(format!("onnx inference failed: {:#}", e))),
        }
    }

    pub fn predict(&self, features: &FeatureVector) -> Result<ClassificationResult, AnalysisError> {
        if !features.is_finite() {
            return Ok(ClassificationResult::unknown(Source::Local));
        }

        let probabilities = self.predict_proba(features)?;
        let best = probabilities
            .iter()
            .enumerate()
            .fold(None::<(usize, f64)>, |best, (i, &p)| match best {
                Some((_, bp)) if bp >= p => best,
                _ if p.is_finite() => Some((i, p)),
                _ => best,
            });

        Ok(match best {
            Some((idx, confidence)) => match self.labels[idx] {
                WeaponClass::Unknown => ClassificationResult::unknown(Source::Local),
                label => ClassificationResult::new(label, confidence, Source::Local),
            },
            None => ClassificationResult::unknown(Source::Local),
        })
    }
}

/// Mean of the normalised leaf distributions (soft voting).
fn forest_proba(trees: &[DecisionTree], x: &[f64], n_classes: usize) -> Vec<f64> {
    let mut totals = vec![0.0f64; n_classes];
    for tree in trees {
        let leaf = tree.leaf_distribution(x);
        let sum: f64 = leaf.iter().sum();
        if sum > 0.0 {
            for (total, &weight) in totals.iter_mut().zip(leaf) {
                *total += weight / sum;
            }
        }
    }
    let n_trees = trees.len().max(1) as f64;
    totals.iter_mut().for_each(|t| *t /= n_trees);
    totals
}

#[cfg(feature = "onnx")]
mod onnx {
    use ndarray::ArrayD;
    use ort::{
        session::{builder::GraphOptimizationLevel, builder::SessionBuilder, Session},
        value::Value,
    };
    use std::path::Path;
    use std::sync::Mutex;

    /// `Session::run` needs exclusive access, so inference is serialised here.
    pub struct OnnxModel {
        session: Mutex<Session>,
    }

    impl OnnxModel {
        pub fn new(path: &Path) -> anyhow::Result<Self> {
            let session = SessionBuilder::new()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .commit_from_file(path)?;
            log::info!(
                "ONNX model {} loaded: {} input(s), {} output(s)",
                path.display(),
                session.inputs.len(),
                session.outputs.len()
            );
            Ok(Self {
                session: Mutex::new(session),
            })
        }

        pub fn predict_proba(&self, x: &[f64], n_classes: usize) -> anyhow::Result<Vec<f64>> {
            let data: Vec<f32> = x.iter().map(|&v| v as f32).collect();
            let input_tensor = Value::from_array((vec![1usize, data.len()], data))?;

            let mut session = self
                .session
                .lock()
                .map_err(|_| anyhow::anyhow!("onnx session poisoned"))?;
            let outputs = session.run(ort::inputs![input_tensor])?;

            // Exported classifiers emit (label, probabilities); prefer the latter.
            let output = if outputs.len() > 1 { &outputs[1] } else { &outputs[0] };

            if let Ok((shape, data)) = output.try_extract_tensor::<f32>() {
                let shape: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
                let probs = ArrayD::from_shape_vec(shape, data.to_vec())?;
                if probs.len() == n_classes {
                    return Ok(probs.iter().map(|&p| p as f64).collect());
                }
            }
            if let Ok((_, data)) = output.try_extract_tensor::<i64>() {
                let class = *data.first().ok_or_else(|| anyhow::anyhow!("empty label tensor"))?;
                let mut one_hot = vec![0.0; n_classes];
                if let Some(slot) = usize::try_from(class).ok().and_then(|c| one_hot.get_mut(c)) {
                    *slot = 1.0;
                }
                return Ok(one_hot);
            }
            Err(anyhow::anyhow!("Unsupported output tensor type"))
        }
    }
}
