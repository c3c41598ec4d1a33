// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// One bucket slot of a leaf histogram.
///
/// `weight` is the document count under gradient step and the hessian sum
/// under Newton step; both accumulate exactly in an `f64` for any realistic
/// document count.
#[derive(Clone, Copy, Debug, Default)]
pub struct HistogramItem {
    /// Sum of document gradients in this bucket.
    pub gradient: f64,
    /// Document count or hessian sum, depending on the step mode.
    pub weight: f64,
}

/// Per-(leaf, feature) histogram: one [`HistogramItem`] per bucket.
#[derive(Clone, Debug)]
pub struct Histogram {
    /// Bucket slots.
    pub data: Vec<HistogramItem>,
}

impl Histogram {
    /// Creates a zeroed histogram with `buckets` slots.
    #[must_use]
    pub fn new(buckets: u32) -> Self {
        Self {
            data: vec![HistogramItem::default(); buckets as usize],
        }
    }

    /// Adds one document's contribution to a bucket.
    pub fn accumulate(&mut self, bucket: u16, gradient: f32, weight: f64) {
        let item = &mut self.data[bucket as usize];
        item.gradient += f64::from(gradient);
        item.weight += weight;
    }

    /// Derives the sibling histogram in place: `self -= other`.
    ///
    /// Under Newton step the weight is a float hessian sum and is clamped at
    /// zero; under gradient step it is an exact count and must not go
    /// negative.
    pub fn subtract(&mut self, other: &Self, newton_step: bool) {
        debug_assert_eq!(self.data.len(), other.data.len());

        for (item, sub) in self.data.iter_mut().zip(&other.data) {
            item.gradient -= sub.gradient;
            item.weight -= sub.weight;
            if newton_step {
                item.weight = item.weight.max(0.0);
            } else {
                debug_assert!(item.weight >= 0.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Histogram;
    use test_log::test;

    #[test]
    fn subtraction_matches_direct_accumulation() {
        let docs: Vec<(u16, f32)> = (0..100)
            .map(|i| ((i % 7) as u16, (i as f32).sin()))
            .collect();

        let mut parent = Histogram::new(7);
        let mut left = Histogram::new(7);
        let mut right = Histogram::new(7);

        for (i, &(bucket, gradient)) in docs.iter().enumerate() {
            parent.accumulate(bucket, gradient, 1.0);
            if i % 3 == 0 {
                right.accumulate(bucket, gradient, 1.0);
            } else {
                left.accumulate(bucket, gradient, 1.0);
            }
        }

        let mut derived = parent.clone();
        derived.subtract(&right, false);

        for (a, b) in derived.data.iter().zip(&left.data) {
            assert!((a.weight - b.weight).abs() < f64::EPSILON);
            assert!((a.gradient - b.gradient).abs() < 1e-9);
        }
    }

    #[test]
    fn newton_subtraction_clamps_weight() {
        let mut parent = Histogram::new(1);
        parent.accumulate(0, 1.0, 0.5);

        let mut child = Histogram::new(1);
        child.accumulate(0, 0.5, 0.5 + 1e-12);

        parent.subtract(&child, true);
        assert!(parent.data[0].weight >= 0.0);
    }
}
