use thiserror::Error;

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug, Error)]
pub enum MlErr {
    #[error("There's a size mismatch in {what}, got {got} and expected {expected}")]
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("There's a shape mismatch in {what}, got {got:?} and expected {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("Label {label} is out of range for {classes} classes")]
    LabelOutOfRange { label: usize, classes: usize },

    #[error("Received an empty batch")]
    EmptyBatch,

    #[error("Unknown dataset {0}")]
    UnknownDataset(String),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}
