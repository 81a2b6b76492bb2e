//! User to partition assignment.
//!
//! Every instance of the fleet must agree on where a user's traffic lands
//! without coordinating, so the hash is fixed here rather than taken from
//! `std::hash`, whose output may change between releases and processes.

use crate::types::{PartitionIndex, UserId};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the big-endian bytes of the user id.
#[inline]
fn fnv1a(user_id: UserId) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in user_id.value().to_be_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Partition that owns all traffic for `user_id`.
///
/// Deterministic and total over `[0, partition_count)`. A partition count of
/// zero is rejected by configuration validation; it maps to partition 0.
#[inline]
pub fn partition_for(user_id: UserId, partition_count: u32) -> PartitionIndex {
    if partition_count == 0 {
        return PartitionIndex(0);
    }
    PartitionIndex((fnv1a(user_id) % partition_count as u64) as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_in_range() {
        for count in [1u32, 2, 7, 12, 64] {
            for user in -50i64..50 {
                let p = partition_for(UserId(user), count).value();
                assert!(p >= 0 && (p as u32) < count);
            }
        }
    }

    #[test]
    fn test_single_partition() {
        assert_eq!(partition_for(UserId(123_456), 1), PartitionIndex(0));
    }

    #[test]
    fn test_zero_partitions_maps_to_zero() {
        assert_eq!(partition_for(UserId(9), 0), PartitionIndex(0));
    }

    #[test]
    fn test_known_values_are_stable() {
        // Pinned so a change of hash is caught: routing must not move users
        // between releases.
        let partitions: Vec<i32> = (1i64..=6)
            .map(|u| partition_for(UserId(u), 12).value())
            .collect();
        assert_eq!(partitions, vec![6, 11, 4, 9, 2, 7]);
        assert_eq!(fnv1a(UserId(0)), 0xa8c7_f832_281a_39c5);
    }

    #[test]
    fn test_spreads_users() {
        let mut hits = [0u32; 8];
        for user in 0i64..8_000 {
            hits[partition_for(UserId(user), 8).as_usize()] += 1;
        }
        assert!(hits.iter().all(|&h| h > 500), "skewed distribution: {:?}", hits);
    }
}
