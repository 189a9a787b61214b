use ndarray::{Array2, ArrayView2, ArrayViewMutD};
use rand::Rng;

use super::{Classifier, activations::ActFn, layers::Dense};
use crate::{GradientSet, MlErr, ParamLayout, Result};

/// A sequential model: information flows forward when computing an output and backward when
/// computing the *deltas* of its layers.
#[derive(Debug, Clone)]
pub struct Sequential {
    layers: Vec<Dense>,
}

impl Sequential {
    /// Creates a new `Sequential`.
    ///
    /// # Arguments
    /// * `layers` - The layers the sequential is composed of.
    pub fn new<I>(layers: I) -> Self
    where
        I: IntoIterator<Item = Dense>,
    {
        Self {
            layers: layers.into_iter().collect(),
        }
    }

    /// Creates a multilayer perceptron with relu hidden layers and linear logits.
    ///
    /// # Arguments
    /// * `sizes` - The input size, every hidden size and the amount of classes.
    /// * `rng` - The source of the initial weights.
    pub fn mlp<R: Rng + ?Sized>(sizes: &[usize], rng: &mut R) -> Self {
        let last = sizes.len().saturating_sub(2);
        let layers = sizes.windows(2).enumerate().map(|(i, dim)| {
            let act_fn = (i < last).then(ActFn::relu);
            Dense::new((dim[0], dim[1]), act_fn, &mut *rng)
        });

        Self::new(layers.collect::<Vec<_>>())
    }

    pub fn layers(&self) -> &[Dense] {
        &self.layers
    }
}

impl Classifier for Sequential {
    fn layout(&self) -> ParamLayout {
        ParamLayout::new(self.layers.iter().flat_map(Dense::shapes).collect())
    }

    fn forward(&mut self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.layers
            .iter_mut()
            .try_fold(x.to_owned(), |x, layer| layer.forward(x))
    }

    fn backward(&mut self, mut d: Array2<f32>) -> Result<GradientSet> {
        if self.layers.is_empty() {
            return Err(MlErr::SizeMismatch {
                what: "layers",
                got: 0,
                expected: 1,
            });
        }

        let mut tensors = Vec::with_capacity(2 * self.layers.len());
        for layer in self.layers.iter_mut().rev() {
            let (dw, db, dx) = layer.backward(d)?;
            tensors.push(db.into_dyn());
            tensors.push(dw.into_dyn());
            d = dx;
        }

        tensors.reverse();
        Ok(GradientSet::new(tensors))
    }

    fn params_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        self.layers.iter_mut().flat_map(Dense::params_mut).collect()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn gradients_follow_the_layout() {
        let mut rng = StdRng::seed_from_u64(7548);
        let mut model = Sequential::mlp(&[3, 5, 4], &mut rng);

        let logits = model.forward(array![[1.0, 0.0, -1.0], [0.5, 0.5, 0.5]].view()).unwrap();
        assert_eq!(logits.dim(), (2, 4));

        let grads = model.backward(Array2::ones((2, 4))).unwrap();
        let layout = model.layout();
        assert_eq!(layout.shapes(), [vec![3, 5], vec![5], vec![5, 4], vec![4]]);
        assert!(grads.check_layout(&layout).is_ok());
        assert_eq!(model.params_mut().len(), layout.len());
    }

    #[test]
    fn backward_needs_a_forward_pass() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut model = Sequential::mlp(&[2, 8, 3], &mut rng);

        assert!(model.backward(Array2::ones((1, 3))).is_err());
        assert!(Sequential::new([]).backward(Array2::ones((1, 3))).is_err());
    }
}
