use ndarray::{Array2, Axis};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;

use super::Dataset;
use crate::{MlErr, Result};

/// The seed every rank derives the class centers from, so every rank builds the same data.
const CENTERS_SEED: u64 = 0x5eed_b10b;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Validation,
}

impl Split {
    fn seed_offset(self) -> u64 {
        match self {
            Split::Train => 1,
            Split::Validation => 2,
        }
    }
}

/// Gaussian blobs around random class centers.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobSpec {
    pub train: usize,
    pub validation: usize,
    pub features: usize,
    pub classes: usize,
    /// Distance scale between the class centers.
    pub separation: f32,
    /// Standard deviation of the samples around their center.
    pub spread: f32,
}

impl BlobSpec {
    /// Looks up a dataset by its identifier.
    ///
    /// Known identifiers are `blobs` and the quicker `blobs-small`.
    pub fn named(id: &str) -> Result<Self> {
        match id {
            "blobs" => Ok(Self {
                train: 16_384,
                validation: 4_096,
                features: 32,
                classes: 10,
                separation: 2.0,
                spread: 1.0,
            }),
            "blobs-small" => Ok(Self {
                train: 2_048,
                validation: 512,
                features: 16,
                classes: 10,
                separation: 2.0,
                spread: 1.0,
            }),
            other => Err(MlErr::UnknownDataset(other.to_string())),
        }
    }

    /// Builds one split of the dataset, deterministically.
    pub fn generate(&self, split: Split) -> Dataset {
        let mut rng = StdRng::seed_from_u64(CENTERS_SEED);
        let centers = Array2::from_shape_fn((self.classes, self.features), |_| {
            rng.sample::<f32, _>(StandardNormal) * self.separation
        });

        let len = match split {
            Split::Train => self.train,
            Split::Validation => self.validation,
        };

        let mut rng = StdRng::seed_from_u64(CENTERS_SEED + split.seed_offset());
        let labels: Vec<_> = (0..len).map(|i| i % self.classes.max(1)).collect();
        let mut features = centers.select(Axis(0), &labels);
        features.mapv_inplace(|center| center + rng.sample::<f32, _>(StandardNormal) * self.spread);

        Dataset {
            features,
            labels,
            classes: self.classes,
        }
    }
}
