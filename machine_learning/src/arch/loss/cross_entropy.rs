use ndarray::{Array2, ArrayView2, Axis};

use super::LossFn;

/// Softmax followed by the negative log likelihood of one hot targets.
///
/// Predictions are raw logits, the softmax is folded into the loss so its derivative
/// reduces to `softmax(y_pred) - y`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrossEntropy;

impl CrossEntropy {
    pub fn new() -> Self {
        Self
    }

    /// Row wise softmax, shifted by each row's maximum for stability.
    pub fn softmax(logits: ArrayView2<f32>) -> Array2<f32> {
        let mut p = logits.to_owned();

        for mut row in p.axis_iter_mut(Axis(0)) {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            row /= sum;
        }

        p
    }
}

impl LossFn for CrossEntropy {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        let n = y_pred.nrows().max(1) as f32;
        let p = Self::softmax(y_pred);

        let total: f32 = p
            .iter()
            .zip(y.iter())
            .filter(|(_, t)| **t != 0.)
            .map(|(p, t)| -t * p.max(f32::MIN_POSITIVE).ln())
            .sum();

        total / n
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        let n = y_pred.nrows().max(1) as f32;
        (Self::softmax(y_pred) - &y) / n
    }
}
