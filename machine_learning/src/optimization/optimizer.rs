use ndarray::ArrayViewMutD;

use crate::{GradientSet, Result};

pub trait Optimizer {
    /// Updates `params` following the optimizer's learning rule.
    ///
    /// # Arguments
    /// * `params` - The parameters to update, in the order of the gradients.
    /// * `grads` - The gradient of every parameter.
    fn step(&mut self, params: Vec<ArrayViewMutD<'_, f32>>, grads: &GradientSet) -> Result<()>;

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, learning_rate: f32);
}
