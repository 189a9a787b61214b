use ndarray::{Array2, ArrayView2, Axis};

use super::LossFn;
use crate::{MlErr, Result};

/// Softmax followed by the negative log likelihood of the true class, averaged over the batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrossEntropy;

impl CrossEntropy {
    pub fn new() -> Self {
        Self
    }
}

impl LossFn for CrossEntropy {
    fn loss(&self, logits: ArrayView2<f32>, labels: &[usize]) -> Result<f32> {
        let probs = softmax(logits, labels)?;
        let total: f32 = probs
            .outer_iter()
            .zip(labels)
            .map(|(row, &label)| -row[label].max(f32::MIN_POSITIVE).ln())
            .sum();

        Ok(total / labels.len() as f32)
    }

    fn loss_prime(&self, logits: ArrayView2<f32>, labels: &[usize]) -> Result<Array2<f32>> {
        let mut d = softmax(logits, labels)?;
        let n = labels.len() as f32;

        for (mut row, &label) in d.outer_iter_mut().zip(labels) {
            row[label] -= 1.;
            row /= n;
        }

        Ok(d)
    }
}

/// Row wise softmax of `logits` after checking them against `labels`.
fn softmax(logits: ArrayView2<f32>, labels: &[usize]) -> Result<Array2<f32>> {
    if labels.is_empty() {
        return Err(MlErr::EmptyBatch);
    }

    if logits.nrows() != labels.len() {
        return Err(MlErr::SizeMismatch {
            what: "logit rows and labels",
            got: logits.nrows(),
            expected: labels.len(),
        });
    }

    let classes = logits.ncols();
    if let Some(&label) = labels.iter().find(|&&label| label >= classes) {
        return Err(MlErr::LabelOutOfRange { label, classes });
    }

    let mut probs = logits.to_owned();
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }

    Ok(probs)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn uniform_logits_cost_log_of_the_classes() {
        let logits = Array2::<f32>::zeros((2, 4));
        let loss = CrossEntropy.loss(logits.view(), &[0, 3]).unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn derivative_rows_sum_to_zero() {
        let logits = array![[2.0, -1.0, 0.5], [0.0, 0.0, 3.0]];
        let d = CrossEntropy.loss_prime(logits.view(), &[0, 1]).unwrap();

        for row in d.outer_iter() {
            assert!(row.sum().abs() < 1e-6);
        }
        assert!(d[[0, 0]] < 0.0 && d[[1, 1]] < 0.0);
    }

    #[test]
    fn confident_correct_predictions_cost_little() {
        let logits = array![[20.0, 0.0], [0.0, 20.0]];
        assert!(CrossEntropy.loss(logits.view(), &[0, 1]).unwrap() < 1e-6);
        assert!(CrossEntropy.loss(logits.view(), &[1, 0]).unwrap() > 10.0);
    }

    #[test]
    fn malformed_batches_are_rejected() {
        let logits = Array2::<f32>::zeros((2, 3));
        assert!(matches!(
            CrossEntropy.loss(logits.view(), &[]),
            Err(MlErr::EmptyBatch)
        ));
        assert!(matches!(
            CrossEntropy.loss(logits.view(), &[0]),
            Err(MlErr::SizeMismatch { .. })
        ));
        assert!(matches!(
            CrossEntropy.loss(logits.view(), &[0, 3]),
            Err(MlErr::LabelOutOfRange { label: 3, classes: 3 })
        ));
    }
}
