use std::ops::Range;

/// Splits `total` samples among `num_shards` and returns the range owned by `shard_id`.
///
/// Ranges are contiguous, disjoint, cover `0..total` and differ in size by at most one.
///
/// # Panics
/// If `shard_id` is not below `num_shards`.
pub fn shard_range(total: usize, shard_id: usize, num_shards: usize) -> Range<usize> {
    assert!(shard_id < num_shards, "shard {shard_id} out of {num_shards}");

    let base = total / num_shards;
    let rem = total % num_shards;

    let start = shard_id * base + shard_id.min(rem);
    let end = start + base + usize::from(shard_id < rem);

    start..end
}
