use ndarray::{ArrayViewMutD, prelude::*};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{MlErr, Result, arch::activations::ActFn};

/// A fully connected layer: `act_fn(x · w + b)`.
#[derive(Debug, Clone)]
pub struct Dense {
    w: Array2<f32>,
    b: Array1<f32>,
    act_fn: Option<ActFn>,

    // Forward metadata
    x: Array2<f32>,
    z: Array2<f32>,
}

impl Dense {
    /// Creates a new `Dense` with He initialized weights and zeroed biases.
    ///
    /// # Arguments
    /// * `dim` - The input and output sizes.
    /// * `act_fn` - The activation, `None` for a linear layer.
    /// * `rng` - The source of the initial weights.
    pub fn new<R: Rng + ?Sized>(dim: (usize, usize), act_fn: Option<ActFn>, rng: &mut R) -> Self {
        let std = (2. / dim.0.max(1) as f32).sqrt();
        let w = Array2::from_shape_fn(dim, |_| rng.sample::<f32, _>(StandardNormal) * std);

        Self::with_params(w, Array1::zeros(dim.1), act_fn)
    }

    /// Creates a new `Dense` out of existing parameters.
    ///
    /// # Arguments
    /// * `w` - The weights, one row per input.
    /// * `b` - The biases, one per output.
    /// * `act_fn` - The activation, `None` for a linear layer.
    ///
    /// # Panics
    /// If there isn't exactly one bias per output.
    pub fn with_params(w: Array2<f32>, b: Array1<f32>, act_fn: Option<ActFn>) -> Self {
        let (inputs, outputs) = w.dim();
        assert_eq!(outputs, b.len(), "one bias per output");

        Self {
            w,
            b,
            act_fn,
            x: Array2::zeros((0, inputs)),
            z: Array2::zeros((0, outputs)),
        }
    }

    /// The input and output sizes.
    pub fn dim(&self) -> (usize, usize) {
        self.w.dim()
    }

    /// The shapes of the weights and the biases, in that order.
    pub fn shapes(&self) -> [Vec<usize>; 2] {
        [self.w.shape().to_vec(), self.b.shape().to_vec()]
    }

    pub fn params_mut(&mut self) -> [ArrayViewMutD<'_, f32>; 2] {
        [self.w.view_mut().into_dyn(), self.b.view_mut().into_dyn()]
    }

    /// Computes the layer's output and keeps what `backward` needs.
    pub fn forward(&mut self, x: Array2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.w.nrows() {
            return Err(MlErr::SizeMismatch {
                what: "dense input features",
                got: x.ncols(),
                expected: self.w.nrows(),
            });
        }

        let z = x.dot(&self.w) + &self.b;
        let a = match &self.act_fn {
            Some(act_fn) => z.mapv(|z| act_fn.f(z)),
            None => z.clone(),
        };

        self.x = x;
        self.z = z;
        Ok(a)
    }

    /// Propagates `d`, the loss derivative with respect to this layer's output, backwards.
    ///
    /// # Returns
    /// The weights' gradient, the biases' gradient and the derivative with respect to
    /// this layer's input.
    pub fn backward(
        &mut self,
        mut d: Array2<f32>,
    ) -> Result<(Array2<f32>, Array1<f32>, Array2<f32>)> {
        if d.dim() != self.z.dim() {
            return Err(MlErr::ShapeMismatch {
                what: "dense delta",
                got: d.shape().to_vec(),
                expected: self.z.shape().to_vec(),
            });
        }

        if let Some(act_fn) = &self.act_fn {
            d.zip_mut_with(&self.z, |d, &z| *d *= act_fn.df(z));
        }

        let dw = self.x.t().dot(&d);
        let db = d.sum_axis(Axis(0));
        let dx = d.dot(&self.w.t());

        Ok((dw, db, dx))
    }
}
