//! In-memory classification datasets, split per rank and batched per step.

mod blobs;
mod shard;

use std::num::NonZeroUsize;

use ndarray::{Array2, Axis};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use crate::{MlErr, Result};

pub use blobs::{BlobSpec, Split};
pub use shard::partition;

/// A labeled batch, one row of features per sample.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Array2<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// A classification dataset held in memory.
#[derive(Debug, Clone)]
pub struct Dataset {
    features: Array2<f32>,
    labels: Vec<usize>,
    classes: usize,
}

impl Dataset {
    /// Creates a new dataset from owned buffers.
    ///
    /// # Arguments
    /// * `features` - One row per sample.
    /// * `labels` - The class of every sample.
    /// * `classes` - The amount of classes.
    pub fn new(features: Array2<f32>, labels: Vec<usize>, classes: usize) -> Result<Self> {
        if features.nrows() != labels.len() {
            return Err(MlErr::SizeMismatch {
                what: "dataset rows and labels",
                got: features.nrows(),
                expected: labels.len(),
            });
        }

        if let Some(&label) = labels.iter().find(|&&label| label >= classes) {
            return Err(MlErr::LabelOutOfRange { label, classes });
        }

        Ok(Self {
            features,
            labels,
            classes,
        })
    }

    /// Loads one split of a dataset known by name.
    ///
    /// # Arguments
    /// * `id` - The dataset's identifier, see `BlobSpec::named`.
    /// * `split` - Which split to load.
    pub fn named(id: &str, split: Split) -> Result<Self> {
        Ok(BlobSpec::named(id)?.generate(split))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    pub fn num_features(&self) -> usize {
        self.features.ncols()
    }

    /// Every sample index in an order that only depends on `seed`.
    pub fn shuffled(&self, seed: u64) -> Vec<usize> {
        let mut indices: Vec<_> = (0..self.len()).collect();
        indices.shuffle(&mut StdRng::seed_from_u64(seed));
        indices
    }

    /// This rank's samples for an epoch.
    ///
    /// Every rank shuffles with the same seed and takes its own equal-sized slice of the
    /// result, so every rank sees as many samples as the others and no sample twice.
    ///
    /// # Arguments
    /// * `seed` - The epoch's seed, the same on every rank.
    /// * `rank` - This rank.
    /// * `world_size` - The amount of ranks.
    pub fn shard(&self, seed: u64, rank: usize, world_size: NonZeroUsize) -> Vec<usize> {
        let mut indices = self.shuffled(seed);
        let range = partition(indices.len(), rank, world_size);

        indices.truncate(range.end);
        indices.drain(..range.start);
        indices
    }

    /// Cuts `indices` in batches of `batch_size` samples, the last one may be smaller.
    pub fn batches<'a>(
        &'a self,
        indices: &'a [usize],
        batch_size: NonZeroUsize,
    ) -> impl Iterator<Item = Batch> + 'a {
        indices.chunks(batch_size.get()).map(|chunk| Batch {
            inputs: self.features.select(Axis(0), chunk),
            labels: chunk.iter().map(|&i| self.labels[i]).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn toy() -> Dataset {
        let features = array![[0.0], [1.0], [2.0], [3.0], [4.0], [5.0], [6.0]];
        Dataset::new(features, vec![0, 1, 0, 1, 0, 1, 0], 2).unwrap()
    }

    #[test]
    fn shards_are_equal_and_disjoint() {
        let dataset = toy();
        let world_size = NonZeroUsize::new(3).unwrap();
        let shards: Vec<_> = (0..3).map(|rank| dataset.shard(11, rank, world_size)).collect();

        assert!(shards.iter().all(|shard| shard.len() == 2));

        let mut seen: Vec<_> = shards.concat();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn shuffling_only_depends_on_the_seed() {
        let dataset = toy();
        assert_eq!(dataset.shuffled(3), dataset.shuffled(3));
        assert_ne!(dataset.shuffled(3), dataset.shuffled(4));
    }

    #[test]
    fn batches_keep_features_and_labels_together() {
        let dataset = toy();
        let batches: Vec<_> = dataset
            .batches(&[6, 1, 3], NonZeroUsize::new(2).unwrap())
            .collect();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].inputs, array![[6.0], [1.0]]);
        assert_eq!(batches[0].labels, [0, 1]);
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn labels_must_fit_the_classes() {
        assert!(Dataset::new(array![[0.0]], vec![2], 2).is_err());
        assert!(Dataset::new(array![[0.0]], vec![0, 1], 2).is_err());
    }
}
