//! INT16 Q-format quantization
//!
//! Each layer shares one exponent `Q` (fractional bits, 0..=15) across its
//! weights and biases: `fixed = round(value * 2^Q)`. Q-k covers
//! `[-32768 * 2^-k, 32767 * 2^-k]`, so Q15 is `[-1, 0.99997]` and Q0 is the
//! full integer range.

use log::{debug, warn};
use serde::Serialize;

use crate::error::QuantizeError;

pub const MAX_Q: u32 = 15;

/// Representable `(min, max)` for a given Q.
pub fn q_range(q: u32) -> (f64, f64) {
    let step = (-f64::from(q)).exp2();
    (f64::from(i16::MIN) * step, f64::from(i16::MAX) * step)
}

/// Largest Q at which both bounds fit, or `None` if even Q0 overflows.
pub fn find_max_q(min: f32, max: f32) -> Option<u32> {
    (0..=MAX_Q).rev().find(|&q| {
        let (lo, hi) = q_range(q);
        f64::from(min) >= lo && f64::from(max) <= hi
    })
}

/// Encode one value at `q`, rounding to nearest and clamping to `i16`.
pub fn quantize_value(value: f32, q: u32) -> i16 {
    let scaled = (f64::from(value) * f64::from(q).exp2()).round();
    scaled.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

/// Decode a fixed-point value back to real units.
pub fn dequantize_value(value: i16, q: u32) -> f64 {
    f64::from(value) * (-f64::from(q)).exp2()
}

/// Absolute dequantization error over one layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QuantStats {
    pub rms: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

#[derive(Debug, Default)]
struct ErrorAccumulator {
    sum_sq: f64,
    min: f64,
    max: f64,
    count: usize,
}

impl ErrorAccumulator {
    fn push(&mut self, error: f64) {
        if self.count == 0 || error < self.min {
            self.min = error;
        }
        if error > self.max {
            self.max = error;
        }
        self.sum_sq += error * error;
        self.count += 1;
    }

    fn finish(self) -> QuantStats {
        let rms = if self.count == 0 {
            0.0
        } else {
            (self.sum_sq / self.count as f64).sqrt()
        };
        QuantStats {
            rms,
            min: self.min,
            max: self.max,
            count: self.count,
        }
    }
}

/// Fixed-point layer; `q` applies to every weight and bias.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedLayer {
    pub weights: Vec<i16>,
    pub biases: Vec<i16>,
    pub q: u32,
    pub stats: QuantStats,
    /// Values exceeded the Q0 range and were clamped.
    pub saturated: bool,
}

fn check_finite(field: &'static str, values: &[f32]) -> Result<(), QuantizeError> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(QuantizeError::NonFinite {
            field,
            index,
            value: values[index],
        }),
        None => Ok(()),
    }
}

/// Picks the tightest Q for `weights` and `biases` together and re-encodes
/// both. Expects already folded values; NaN or infinite inputs are rejected.
pub fn quantize_layer(weights: &[f32], biases: &[f32]) -> Result<QuantizedLayer, QuantizeError> {
    check_finite("weights", weights)?;
    check_finite("biases", biases)?;

    let (min, max) = weights
        .iter()
        .chain(biases)
        .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    let (q, saturated) = if weights.is_empty() && biases.is_empty() {
        (MAX_Q, false)
    } else {
        match find_max_q(min, max) {
            Some(q) => (q, false),
            None => {
                warn!(
                    "values exceed Q0 range (min={}, max={}), using Q0 with clamping",
                    min, max
                );
                (0, true)
            }
        }
    };

    let mut errors = ErrorAccumulator::default();
    let mut encode = |values: &[f32]| -> Vec<i16> {
        values
            .iter()
            .map(|&v| {
                let fixed = quantize_value(v, q);
                errors.push((f64::from(v) - dequantize_value(fixed, q)).abs());
                fixed
            })
            .collect()
    };
    let weights = encode(weights);
    let biases = encode(biases);
    let stats = errors.finish();

    debug!(
        "quantized min={} max={} Q={} rms={:.3e} max_err={:.3e}",
        min, max, q, stats.rms, stats.max
    );

    Ok(QuantizedLayer {
        weights,
        biases,
        q,
        stats,
        saturated,
    })
}
