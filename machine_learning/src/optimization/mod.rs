mod optimizer;
mod scheduler;
mod sgd;

pub use optimizer::Optimizer;
pub use scheduler::StepLr;
pub use sgd::Sgd;
