//! Batch normalization folding
//!
//! For each output filter `f`:
//! - `alpha = scale / sqrt(variance + epsilon)`
//! - `bias' = bias - mean * alpha`
//! - `weight' = weight * alpha` for every weight of that filter
//!
//! Without normalization the transform is the identity.

use crate::error::FoldError;

pub const DEFAULT_EPSILON: f32 = 0.000001;

/// Per-filter normalization parameters, in stream order.
#[derive(Debug, Clone, PartialEq)]
pub struct NormParams {
    pub scales: Vec<f32>,
    pub means: Vec<f32>,
    pub variances: Vec<f32>,
}

/// Weights and biases with normalization absorbed.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldedLayer {
    pub weights: Vec<f32>,
    pub biases: Vec<f32>,
}

/// Folds normalization with a fixed epsilon.
#[derive(Debug, Clone, Copy)]
pub struct BatchNormFolder {
    epsilon: f32,
}

impl Default for BatchNormFolder {
    fn default() -> Self {
        Self::new(DEFAULT_EPSILON)
    }
}

fn check_len(field: &'static str, values: &[f32], expected: usize) -> Result<(), FoldError> {
    if values.len() != expected {
        return Err(FoldError::LengthMismatch {
            field,
            expected,
            actual: values.len(),
        });
    }
    Ok(())
}

impl BatchNormFolder {
    pub fn new(epsilon: f32) -> Self {
        Self { epsilon }
    }

    /// Folds one convolution layer. Inputs are left untouched; the result is
    /// freshly allocated with the same lengths as `weights` and `biases`.
    pub fn fold(
        &self,
        weights: &[f32],
        biases: &[f32],
        norm: Option<&NormParams>,
        filters: usize,
        weights_per_filter: usize,
    ) -> Result<FoldedLayer, FoldError> {
        check_len("biases", biases, filters)?;
        let expected = filters
            .checked_mul(weights_per_filter)
            .ok_or(FoldError::LengthMismatch {
                field: "weights",
                expected: usize::MAX,
                actual: weights.len(),
            })?;
        check_len("weights", weights, expected)?;

        let Some(norm) = norm else {
            return Ok(FoldedLayer {
                weights: weights.to_vec(),
                biases: biases.to_vec(),
            });
        };
        check_len("scales", &norm.scales, filters)?;
        check_len("means", &norm.means, filters)?;
        check_len("variances", &norm.variances, filters)?;

        let mut alpha = Vec::with_capacity(filters);
        let mut folded_biases = Vec::with_capacity(filters);
        for f in 0..filters {
            let denom = norm.variances[f] + self.epsilon;
            // Also rejects NaN.
            if !(denom > 0.0) {
                return Err(FoldError::DegenerateVariance {
                    filter: f,
                    variance: norm.variances[f],
                    epsilon: self.epsilon,
                });
            }
            let a = norm.scales[f] / denom.sqrt();
            alpha.push(a);
            folded_biases.push(biases[f] - norm.means[f] * a);
        }

        let folded_weights = if weights_per_filter == 0 {
            Vec::new()
        } else {
            weights
                .chunks_exact(weights_per_filter)
                .zip(&alpha)
                .flat_map(|(filter, &a)| filter.iter().map(move |w| w * a))
                .collect()
        };

        Ok(FoldedLayer {
            weights: folded_weights,
            biases: folded_biases,
        })
    }
}
