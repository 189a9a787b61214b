pub mod activations;
pub mod layers;
pub mod loss;
mod model;
mod sequential;

pub use model::Classifier;
pub use sequential::Sequential;
