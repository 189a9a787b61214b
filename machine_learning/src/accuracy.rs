use ndarray::ArrayView2;

use crate::{MlErr, Result};

/// Computes the top-k accuracy of `logits` for every `k` in `ks`.
///
/// A sample counts as a hit for `k` when fewer than `k` classes have a strictly bigger logit
/// than its label's. A `k` bigger than the amount of classes always hits.
///
/// # Arguments
/// * `logits` - One row of class logits per sample.
/// * `labels` - The true class of every sample.
/// * `ks` - The ranks to compute the accuracy at.
///
/// # Returns
/// One percentage in `[0, 100]` per `k`, in the order of `ks`.
pub fn top_k(logits: ArrayView2<f32>, labels: &[usize], ks: &[usize]) -> Result<Vec<f32>> {
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

    let mut hits = vec![0usize; ks.len()];
    for (row, &label) in logits.outer_iter().zip(labels) {
        let Some(&target) = row.get(label) else {
            return Err(MlErr::LabelOutOfRange {
                label,
                classes: logits.ncols(),
            });
        };

        let rank = row.iter().filter(|&&v| v > target).count();
        for (hit, &k) in hits.iter_mut().zip(ks) {
            if rank < k {
                *hit += 1;
            }
        }
    }

    let n = labels.len() as f32;
    Ok(hits.into_iter().map(|hit| 100. * hit as f32 / n).collect())
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn ranks_labels_among_the_logits() {
        let logits = array![[0.1, 0.9, 0.0], [0.8, 0.3, 0.1]];
        let acc = top_k(logits.view(), &[1, 2], &[1, 2, 5]).unwrap();
        assert_eq!(acc, [50.0, 50.0, 100.0]);
    }

    #[test]
    fn labels_out_of_range_are_rejected() {
        let logits = array![[0.1, 0.9]];
        assert!(matches!(
            top_k(logits.view(), &[2], &[1]),
            Err(MlErr::LabelOutOfRange { label: 2, classes: 2 })
        ));
    }
}
