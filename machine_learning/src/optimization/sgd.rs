use ndarray::{ArrayD, ArrayViewMutD, Zip};

use super::Optimizer;
use crate::{GradientSet, MlErr, Result};

/// Stochastic gradient descent with momentum and L2 weight decay.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: Vec<ArrayD<f32>>,
}

impl Sgd {
    /// Creates a new `Sgd` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - How much of the previous update carries over to the next one.
    /// * `weight_decay` - The L2 penalty added to every gradient.
    ///
    /// # Returns
    /// A new `Sgd` instance.
    pub fn new(learning_rate: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            weight_decay,
            velocity: Vec::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: Vec<ArrayViewMutD<'_, f32>>, grads: &GradientSet) -> Result<()> {
        if params.len() != grads.len() {
            return Err(MlErr::SizeMismatch {
                what: "parameters and gradients",
                got: grads.len(),
                expected: params.len(),
            });
        }

        if let Some((param, grad)) = params
            .iter()
            .zip(grads.tensors())
            .find(|(param, grad)| param.shape() != grad.shape())
        {
            return Err(MlErr::ShapeMismatch {
                what: "gradient of a parameter",
                got: grad.shape().to_vec(),
                expected: param.shape().to_vec(),
            });
        }

        let stale = self.velocity.len() != grads.len()
            || self
                .velocity
                .iter()
                .zip(grads.tensors())
                .any(|(v, grad)| v.shape() != grad.shape());

        if stale {
            self.velocity = grads
                .tensors()
                .iter()
                .map(|grad| ArrayD::zeros(grad.raw_dim()))
                .collect();
        }

        let Self {
            learning_rate: lr,
            momentum: mu,
            weight_decay: wd,
            ..
        } = *self;

        for ((mut param, grad), velocity) in params
            .into_iter()
            .zip(grads.tensors())
            .zip(&mut self.velocity)
        {
            Zip::from(&mut param)
                .and(grad)
                .and(velocity)
                .for_each(|p, &g, v| {
                    *v = mu * *v + g + wd * *p;
                    *p -= lr * *v;
                });
        }

        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;

    fn scalar(v: f32) -> ArrayD<f32> {
        ArrayD::from_elem(IxDyn(&[1]), v)
    }

    #[test]
    fn momentum_accumulates_across_steps() {
        let mut sgd = Sgd::new(0.1, 0.9, 0.0);
        let mut param = scalar(1.0);
        let grads = GradientSet::new(vec![scalar(0.5)]);

        sgd.step(vec![param.view_mut()], &grads).unwrap();
        assert!((param[[0]] - 0.95).abs() < 1e-6);

        sgd.step(vec![param.view_mut()], &grads).unwrap();
        assert!((param[[0]] - 0.855).abs() < 1e-6);
    }

    #[test]
    fn weight_decay_pulls_towards_zero() {
        let mut sgd = Sgd::new(0.5, 0.0, 0.1);
        let mut param = scalar(2.0);
        let grads = GradientSet::new(vec![scalar(0.0)]);

        sgd.step(vec![param.view_mut()], &grads).unwrap();
        assert!((param[[0]] - 1.9).abs() < 1e-6);
    }

    #[test]
    fn gradients_must_match_the_parameters() {
        let mut sgd = Sgd::new(0.1, 0.0, 0.0);
        let mut param = scalar(1.0);
        let grads = GradientSet::new(vec![ArrayD::zeros(IxDyn(&[2]))]);

        assert!(sgd.step(vec![param.view_mut()], &grads).is_err());
        assert!(sgd.step(vec![], &grads).is_err());
    }
}
