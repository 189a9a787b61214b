use ndarray::{Array2, ArrayView2, ArrayViewMutD};

use crate::{GradientSet, ParamLayout, Result};

/// A model mapping a batch of inputs to one row of class logits per sample.
pub trait Classifier {
    /// Returns the ordered shapes of the model's parameters.
    fn layout(&self) -> ParamLayout;

    /// Makes a forward pass through the model, keeping what `backward` needs.
    ///
    /// # Arguments
    /// * `x` - The input batch, one row per sample.
    ///
    /// # Returns
    /// The logits of every sample.
    fn forward(&mut self, x: ArrayView2<f32>) -> Result<Array2<f32>>;

    /// Computes the gradient of the loss with respect to every parameter.
    ///
    /// # Arguments
    /// * `d` - The derivative of the loss with respect to the logits of the last `forward`.
    ///
    /// # Returns
    /// The gradients, following `layout`.
    fn backward(&mut self, d: Array2<f32>) -> Result<GradientSet>;

    /// Mutable views of every parameter, following `layout`.
    fn params_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>>;
}
