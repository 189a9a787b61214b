//! The model side of training: a small dense classifier, its loss, accuracy, a synthetic
//! dataset and the optimizer that applies gradients.

pub mod accuracy;
pub mod arch;
pub mod dataset;
pub mod error;
mod gradient;
pub mod optimization;

pub use arch::{Classifier, Sequential};
pub use error::{MlErr, Result};
pub use gradient::{GradientSet, ParamLayout};
