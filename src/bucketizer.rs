// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    binary_search::bucket_for,
    types::{Bucket, RawValue},
};
use interval_heap::IntervalHeap;

/// Result of discretizing one raw column.
pub struct Bucketized<T> {
    /// Ordered bucket lower bounds.
    pub bucket_min: Vec<T>,
    /// Per-document bucket indices.
    pub data: Vec<Bucket>,
    /// The highest-frequency bucket; the implicit value of the sparse
    /// encoding.
    pub default_bucket: Bucket,
    /// `1 - default_frequency / n_docs`.
    pub sparsity: f32,
}

/// Discretizes a raw column into at most `max_buckets` buckets.
///
/// Three regimes, by unique-value count `U`:
/// - `U <= M`: every value becomes its own bucket.
/// - `M < U < 2M`: exact greedy merge of adjacent value ranges, smallest
///   absorbable range first.
/// - `U >= 2M`: approximate equal-count partition of the unique values.
pub fn bucketize<T: RawValue>(data: &[T], max_buckets: u32) -> crate::Result<Bucketized<T>> {
    let (uniques, freqs) = frequency_histogram(data);

    if uniques.is_empty() {
        return Err(crate::Error::Bucketize("feature with no observations".into()));
    }

    let max = max_buckets as usize;
    let (bucket_min, bucket_freqs) = if uniques.len() <= max {
        (uniques, freqs)
    } else if uniques.len() < 2 * max {
        exact_merge(&uniques, &freqs, max)
    } else {
        equal_count(&uniques, &freqs, max)
    };

    let (default_bucket, sparsity) = pick_default(&bucket_freqs);

    #[allow(clippy::cast_possible_truncation)]
    let assignments = data
        .iter()
        .map(|v| bucket_for(&bucket_min, v) as Bucket)
        .collect();

    Ok(Bucketized {
        bucket_min,
        data: assignments,
        default_bucket,
        sparsity,
    })
}

/// Unique values in ascending order, with their document frequencies.
fn frequency_histogram<T: RawValue>(data: &[T]) -> (Vec<T>, Vec<u64>) {
    let mut sorted: Vec<T> = data.to_vec();
    sorted.sort_unstable_by(RawValue::order);

    let mut uniques: Vec<T> = Vec::new();
    let mut freqs: Vec<u64> = Vec::new();

    for &value in &sorted {
        // Equality through PartialOrd so that float zeros of both signs and
        // repeated NaNs fold into one entry
        let same = uniques
            .last()
            .is_some_and(|last| !(*last < value) && !(value < *last));

        if same {
            if let Some(f) = freqs.last_mut() {
                *f += 1;
            }
        } else {
            uniques.push(value);
            freqs.push(1);
        }
    }

    (uniques, freqs)
}

const NO_RANGE: usize = usize::MAX;

struct MergeRange {
    min: usize,
    max: usize,
    freq: u64,
    next: usize,
    prev: usize,
    absorbed: bool,
}

#[derive(PartialEq)]
struct MergeCandidate {
    key: f64,
    index: usize,
}

impl Eq for MergeCandidate {}

impl Ord for MergeCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key
            .total_cmp(&other.key)
            .then_with(|| self.index.cmp(&other.index))
    }
}

impl PartialOrd for MergeCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Greedy merge: repeatedly absorb the range with the smallest
/// `absorbable_range = next.max - this.min` into its right neighbor until
/// exactly `max` ranges remain.
///
/// Heap entries go stale when a neighbor merges; a popped entry whose key no
/// longer matches the range's current absorbable span is replaced by a fresh
/// one instead of acted upon.
fn exact_merge<T: RawValue>(uniques: &[T], freqs: &[u64], max: usize) -> (Vec<T>, Vec<u64>) {
    let n = uniques.len();
    let mut ranges: Vec<MergeRange> = (0..n)
        .map(|i| MergeRange {
            min: i,
            max: i,
            freq: freqs[i],
            next: if i + 1 < n { i + 1 } else { NO_RANGE },
            prev: if i > 0 { i - 1 } else { NO_RANGE },
            absorbed: false,
        })
        .collect();

    let absorbable = |ranges: &[MergeRange], index: usize| -> f64 {
        let next = ranges[index].next;
        uniques[ranges[next].max].as_f64() - uniques[ranges[index].min].as_f64()
    };

    let mut heap: IntervalHeap<MergeCandidate> = IntervalHeap::with_capacity(n);
    for index in 0..n.saturating_sub(1) {
        heap.push(MergeCandidate {
            key: absorbable(&ranges, index),
            index,
        });
    }

    let mut remaining = n;
    while remaining > max {
        let Some(candidate) = heap.pop_min() else {
            break;
        };

        let index = candidate.index;
        if ranges[index].absorbed || ranges[index].next == NO_RANGE {
            continue;
        }

        let current = absorbable(&ranges, index);
        if current != candidate.key {
            // Stale entry; reinsert with the up-to-date key
            heap.push(MergeCandidate { key: current, index });
            continue;
        }

        let next = ranges[index].next;
        ranges[index].max = ranges[next].max;
        ranges[index].freq += ranges[next].freq;
        ranges[index].next = ranges[next].next;
        ranges[next].absorbed = true;

        if ranges[index].next != NO_RANGE {
            let next_index = ranges[index].next;
            ranges[next_index].prev = index;
            heap.push(MergeCandidate {
                key: absorbable(&ranges, index),
                index,
            });
        }

        remaining -= 1;
    }

    let mut bucket_min = Vec::with_capacity(max);
    let mut bucket_freqs = Vec::with_capacity(max);
    for range in ranges.iter().filter(|r| !r.absorbed) {
        bucket_min.push(uniques[range.min]);
        bucket_freqs.push(range.freq);
    }

    (bucket_min, bucket_freqs)
}

/// Approximate partition: `max` contiguous groups of unique values whose
/// sizes differ by at most one, via the distribute-remainder counter.
fn equal_count<T: RawValue>(uniques: &[T], freqs: &[u64], max: usize) -> (Vec<T>, Vec<u64>) {
    let n = uniques.len();
    debug_assert!(n >= 2 * max);

    let mut bucket_min = Vec::with_capacity(max);
    let mut bucket_freqs = Vec::with_capacity(max);

    let mut i = 0usize;
    let mut counter = 0usize;
    for _ in 0..max {
        let group = (n - counter + (max - 1)) / max;
        bucket_min.push(uniques[i]);
        bucket_freqs.push(freqs[i..i + group].iter().sum());
        i += group;
        counter += max * group;
        counter %= n;
    }
    debug_assert_eq!(n, i);

    (bucket_min, bucket_freqs)
}

fn pick_default(freqs: &[u64]) -> (Bucket, f32) {
    let mut best = 0usize;
    let mut highest = 0u64;
    let mut n_docs = 0u64;

    for (i, &f) in freqs.iter().enumerate() {
        n_docs += f;
        if f > highest {
            highest = f;
            best = i;
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    let result = (best as Bucket, (1.0 - highest as f64 / n_docs as f64) as f32);

    result
}

#[cfg(test)]
mod tests {
    use super::bucketize;
    use test_log::test;

    #[test]
    fn unique_values_get_their_own_buckets() {
        let data = [5u8, 3, 5, 9, 3, 3];
        let result = bucketize(&data, 16).unwrap();

        assert_eq!(vec![3, 5, 9], result.bucket_min);
        assert_eq!(vec![1, 0, 1, 2, 0, 0], result.data);
        assert_eq!(0, result.default_bucket);
        assert!((result.sparsity - 0.5).abs() < 1e-6);
    }

    #[test]
    fn zero_observations_fail() {
        let data: [f32; 0] = [];
        assert!(bucketize(&data, 16).is_err());
    }

    #[test]
    fn exact_merge_absorbs_smallest_spans() {
        // 5 unique values into 3 buckets: the tight pairs collapse, the wide
        // gap to 10 survives.
        let data = [0u32, 1, 2, 10, 11];
        let result = bucketize(&data, 3).unwrap();

        assert_eq!(vec![0, 2, 10], result.bucket_min);
        assert_eq!(vec![0, 0, 1, 2, 2], result.data);
    }

    #[test]
    fn equal_count_groups_differ_by_at_most_one() {
        let data: Vec<u16> = (0..100).collect();
        let result = bucketize(&data, 4).unwrap();

        assert_eq!(4, result.bucket_min.len());
        // Group sizes follow the distribute-remainder counter over 100/4
        assert_eq!(vec![0, 25, 50, 75], result.bucket_min);
        for (i, &b) in result.data.iter().enumerate() {
            assert_eq!((i / 25) as u16, b);
        }
    }

    #[test]
    fn equal_count_distributes_remainder() {
        let data: Vec<u16> = (0..10).collect();
        let result = bucketize(&data, 4).unwrap();

        assert_eq!(vec![0, 3, 5, 8], result.bucket_min);
    }

    #[test]
    fn assignment_is_monotone() {
        let data = [0.5f32, -1.0, 3.25, 0.5, 7.0, -1.0, 2.0, 9.5, 4.0, 8.0];
        let result = bucketize(&data, 4).unwrap();

        let mut pairs: Vec<(f32, u16)> = data.iter().copied().zip(result.data.iter().copied()).collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        for window in pairs.windows(2) {
            assert!(window[0].1 <= window[1].1);
        }
    }

    #[test]
    fn default_bucket_survives_merging() {
        // Value 7 dominates; whatever bucket it merges into must be default.
        let mut data = vec![7u8; 50];
        data.extend(0..20);
        let result = bucketize(&data, 8).unwrap();

        let default = result.default_bucket;
        let bucket_of_seven = result.data[0];
        assert_eq!(bucket_of_seven, default);
        assert!(result.sparsity < 0.5);
    }
}
