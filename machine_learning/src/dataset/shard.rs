use std::{num::NonZeroUsize, ops::Range};

/// Splits `total` samples among `world_size` ranks and returns the slice of `rank`.
///
/// Properties:
/// - Ranges are contiguous, disjoint and all of the same size.
/// - The `total % world_size` trailing samples belong to nobody.
///
/// # Panics
/// If `rank` is not smaller than `world_size`.
pub fn partition(total: usize, rank: usize, world_size: NonZeroUsize) -> Range<usize> {
    assert!(rank < world_size.get(), "rank out of range");

    let size = total / world_size.get();
    let start = rank * size;
    start..start + size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn partition_drops_the_remainder() {
        // total 10, ranks 3 => sizes 3,3,3 and sample 9 unused
        assert_eq!(partition(10, 0, world(3)), 0..3);
        assert_eq!(partition(10, 1, world(3)), 3..6);
        assert_eq!(partition(10, 2, world(3)), 6..9);
    }

    #[test]
    fn a_single_rank_gets_everything() {
        assert_eq!(partition(10, 0, world(1)), 0..10);
    }

    #[test]
    fn fewer_samples_than_ranks_leave_everyone_empty() {
        assert!(partition(2, 1, world(3)).is_empty());
    }
}
