use ndarray::{ArrayD, IxDyn};

use crate::{MlErr, Result};

/// The ordered shapes of a model's parameter tensors.
///
/// Two ranks can only combine gradients positionally if their layouts are equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamLayout {
    shapes: Vec<Vec<usize>>,
}

impl ParamLayout {
    pub fn new(shapes: Vec<Vec<usize>>) -> Self {
        Self { shapes }
    }

    pub fn shapes(&self) -> &[Vec<usize>] {
        &self.shapes
    }

    /// The amount of tensors.
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// The amount of scalar parameters over every tensor.
    pub fn num_params(&self) -> usize {
        self.shapes
            .iter()
            .map(|shape| shape.iter().product::<usize>())
            .sum()
    }
}

/// One gradient tensor per model parameter, in parameter order.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientSet {
    tensors: Vec<ArrayD<f32>>,
}

impl GradientSet {
    pub fn new(tensors: Vec<ArrayD<f32>>) -> Self {
        Self { tensors }
    }

    /// Creates a set of zeroed tensors following `layout`.
    pub fn zeros(layout: &ParamLayout) -> Self {
        let tensors = layout
            .shapes()
            .iter()
            .map(|shape| ArrayD::zeros(IxDyn(shape)))
            .collect();

        Self { tensors }
    }

    pub fn layout(&self) -> ParamLayout {
        ParamLayout::new(self.tensors.iter().map(|t| t.shape().to_vec()).collect())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn tensors(&self) -> &[ArrayD<f32>] {
        &self.tensors
    }

    pub fn into_tensors(self) -> Vec<ArrayD<f32>> {
        self.tensors
    }

    /// The amount of scalar values over every tensor.
    pub fn num_params(&self) -> usize {
        self.tensors.iter().map(|tensor| tensor.len()).sum()
    }

    /// Checks that this set has exactly the tensors described by `layout`.
    ///
    /// # Arguments
    /// * `layout` - The expected layout.
    ///
    /// # Returns
    /// An error describing the first disagreement, if any.
    pub fn check_layout(&self, layout: &ParamLayout) -> Result<()> {
        if self.len() != layout.len() {
            return Err(MlErr::SizeMismatch {
                what: "gradient tensors",
                got: self.len(),
                expected: layout.len(),
            });
        }

        for (tensor, shape) in self.tensors.iter().zip(layout.shapes()) {
            if tensor.shape() != shape.as_slice() {
                return Err(MlErr::ShapeMismatch {
                    what: "gradient tensor",
                    got: tensor.shape().to_vec(),
                    expected: shape.clone(),
                });
            }
        }

        Ok(())
    }

    /// Concatenates every tensor, in parameter order and each in logical order.
    pub fn flatten(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(self.num_params());
        for tensor in &self.tensors {
            flat.extend(tensor.iter().copied());
        }

        flat
    }

    /// Rebuilds a set out of the values produced by `flatten`.
    ///
    /// # Arguments
    /// * `layout` - The shapes to cut `values` into.
    /// * `values` - The flat values.
    ///
    /// # Returns
    /// The rebuilt set or an error if the amount of values does not fit the layout.
    pub fn unflatten(layout: &ParamLayout, values: &[f32]) -> Result<Self> {
        if values.len() != layout.num_params() {
            return Err(MlErr::SizeMismatch {
                what: "flat gradient",
                got: values.len(),
                expected: layout.num_params(),
            });
        }

        let mut rest = values;
        let mut tensors = Vec::with_capacity(layout.len());
        for shape in layout.shapes() {
            let (head, tail) = rest.split_at(shape.iter().product());
            tensors.push(ArrayD::from_shape_vec(IxDyn(shape), head.to_vec())?);
            rest = tail;
        }

        Ok(Self { tensors })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;

    fn set() -> GradientSet {
        GradientSet::new(vec![
            ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
            ArrayD::from_shape_vec(IxDyn(&[3]), vec![5.0, 6.0, 7.0]).unwrap(),
        ])
    }

    #[test]
    fn flattening_keeps_parameter_order() {
        let grads = set();
        let flat = grads.flatten();

        assert_eq!(flat, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(GradientSet::unflatten(&grads.layout(), &flat).unwrap(), grads);
    }

    #[test]
    fn layouts_count_every_scalar() {
        let layout = set().layout();
        assert_eq!(layout.len(), 2);
        assert_eq!(layout.num_params(), 7);
        assert_eq!(GradientSet::zeros(&layout).layout(), layout);
    }

    #[test]
    fn unflatten_rejects_values_that_do_not_fit() {
        let layout = set().layout();
        assert!(matches!(
            GradientSet::unflatten(&layout, &[1.0; 6]),
            Err(MlErr::SizeMismatch { got: 6, expected: 7, .. })
        ));
    }

    #[test]
    fn check_layout_reports_skewed_shapes() {
        let grads = set();
        let skewed = ParamLayout::new(vec![vec![4], vec![3]]);
        let shorter = ParamLayout::new(vec![vec![2, 2]]);

        assert!(grads.check_layout(&grads.layout()).is_ok());
        assert!(matches!(
            grads.check_layout(&skewed),
            Err(MlErr::ShapeMismatch { .. })
        ));
        assert!(matches!(
            grads.check_layout(&shorter),
            Err(MlErr::SizeMismatch { .. })
        ));
    }
}
