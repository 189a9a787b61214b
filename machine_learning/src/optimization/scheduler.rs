use super::Optimizer;

/// Decays the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone)]
pub struct StepLr {
    base_lr: f32,
    step_size: usize,
    gamma: f32,
    epoch: usize,
}

impl StepLr {
    pub const DEFAULT_STEP_SIZE: usize = 60;
    pub const DEFAULT_GAMMA: f32 = 0.9;

    /// Creates a new `StepLr` starting from the optimizer's current learning rate.
    pub fn new<O: Optimizer>(optimizer: &O, step_size: usize, gamma: f32) -> Self {
        Self {
            base_lr: optimizer.learning_rate(),
            step_size: step_size.max(1),
            gamma,
            epoch: 0,
        }
    }

    /// The learning rate for `epoch`.
    pub fn learning_rate_at(&self, epoch: usize) -> f32 {
        let decays = (epoch / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }

    /// Moves to the next epoch and updates the optimizer's learning rate.
    pub fn step<O: Optimizer>(&mut self, optimizer: &mut O) {
        self.epoch += 1;
        optimizer.set_learning_rate(self.learning_rate_at(self.epoch));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::Sgd;

    #[test]
    fn decays_every_step_size_epochs() {
        let mut sgd = Sgd::new(0.1, 0.9, 0.0);
        let mut scheduler = StepLr::new(&sgd, StepLr::DEFAULT_STEP_SIZE, StepLr::DEFAULT_GAMMA);

        for _ in 0..59 {
            scheduler.step(&mut sgd);
        }
        assert_eq!(sgd.learning_rate(), 0.1);

        scheduler.step(&mut sgd);
        assert!((sgd.learning_rate() - 0.09).abs() < 1e-7);
        assert!((scheduler.learning_rate_at(120) - 0.081).abs() < 1e-7);
    }
}
