use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Per-feature standardisation fitted at training time: `(x - mean) / scale`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mean.len() != self.scale.len() {
            anyhow::bail!(
                "scaler mean has {} entries but scale has {}",
                self.mean.len(),
                self.scale.len()
            );
        }
        if self.mean.iter().chain(&self.scale).any(|v| !v.is_finite()) {
            anyhow::bail!("scaler parameters must be finite");
        }
        Ok(())
    }

    pub fn transform_single(&self, features: &Array1<f64>) -> Array1<f64> {
        Array1::from_iter(
            features
                .iter()
                .zip(self.mean.iter().zip(&self.scale))
                .map(|(&x, (&mean, &scale))| {
                    // Constant features are stored with zero scale.
                    let scale = if scale.abs() < f64::EPSILON { 1.0 } else { scale };
                    (x - mean) / scale
                }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standardises_features() {
        let scaler = StandardScaler {
            mean: vec![1.0, 10.0],
            scale: vec![2.0, 0.0],
        };
        let out = scaler.transform_single(&Array1::from(vec![5.0, 12.0]));
        assert_eq!(out.to_vec(), vec![2.0, 2.0]);
    }

    #[test]
    fn rejects_mismatched_parameters() {
        let scaler = StandardScaler {
            mean: vec![0.0; 3],
            scale: vec![1.0; 2],
        };
        assert!(scaler.validate().is_err());
        let identity = StandardScaler {
            mean: vec![0.0; 4],
            scale: vec![1.0; 4],
        };
        assert!(identity.validate().is_ok());
    }
}
