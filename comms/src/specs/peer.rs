use serde::{Deserialize, Serialize};

/// What a rank announces about itself when joining the process group.
///
/// Every field except `rank` must be the same on every rank, otherwise the
/// ranks were started with skewed configurations and the hub refuses the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    /// This process' identity within the group.
    pub rank: usize,
    /// The amount of ranks the process expects in the group.
    pub world_size: usize,
    /// Human readable description of the synchronization strategy, e.g. `periodic(k=5)`.
    pub strategy: String,
    /// The amount of scalar parameters of the model.
    pub num_params: usize,
}

impl PeerSpec {
    /// Checks that `other` was started with the same run configuration as `self`.
    ///
    /// # Arguments
    /// * `other` - Another rank's announcement.
    ///
    /// # Returns
    /// A description of the first disagreeing field, if any.
    pub fn disagreement(&self, other: &PeerSpec) -> Option<String> {
        if self.world_size != other.world_size {
            return Some(format!(
                "world size {} != {} (rank {})",
                self.world_size, other.world_size, other.rank
            ));
        }

        if self.strategy != other.strategy {
            return Some(format!(
                "strategy {} != {} (rank {})",
                self.strategy, other.strategy, other.rank
            ));
        }

        if self.num_params != other.num_params {
            return Some(format!(
                "parameter count {} != {} (rank {})",
                self.num_params, other.num_params, other.rank
            ));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(rank: usize, strategy: &str, num_params: usize) -> PeerSpec {
        PeerSpec {
            rank,
            world_size: 2,
            strategy: strategy.to_string(),
            num_params,
        }
    }

    #[test]
    fn equal_configurations_agree() {
        assert_eq!(spec(0, "eager", 10).disagreement(&spec(1, "eager", 10)), None);
    }

    #[test]
    fn skewed_configurations_are_reported() {
        let a = spec(0, "eager", 10);
        assert!(a.disagreement(&spec(1, "periodic(k=5)", 10)).is_some());
        assert!(a.disagreement(&spec(1, "eager", 11)).is_some());
    }
}
