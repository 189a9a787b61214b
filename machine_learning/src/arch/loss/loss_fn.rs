use ndarray::{Array2, ArrayView2};

use crate::Result;

/// A loss over a batch of logits, one row per sample, against integer class labels.
pub trait LossFn {
    /// The mean loss over the batch.
    fn loss(&self, logits: ArrayView2<f32>, labels: &[usize]) -> Result<f32>;

    /// The derivative of `loss` with respect to every logit.
    fn loss_prime(&self, logits: ArrayView2<f32>, labels: &[usize]) -> Result<Array2<f32>>;
}
