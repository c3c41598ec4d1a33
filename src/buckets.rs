// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::types::{Bucket, RawFeatureType, RawValue};

/// A feature's bucket lower-bound table, kept in the feature's raw type.
///
/// Immutable after construction. Maps bucket ids back into the feature's
/// value domain for serialization and debug output.
#[derive(Clone, Debug)]
pub enum BucketsCollection {
    /// `uint8` bounds
    Uint8(Vec<u8>),
    /// `int8` bounds
    Int8(Vec<i8>),
    /// `uint16` bounds
    Uint16(Vec<u16>),
    /// `int16` bounds
    Int16(Vec<i16>),
    /// `uint32` bounds
    Uint32(Vec<u32>),
    /// `int32` bounds
    Int32(Vec<i32>),
    /// `float` bounds
    Float(Vec<f32>),
}

macro_rules! for_each_buckets {
    ($self:expr, $vec:ident => $body:expr) => {
        match $self {
            BucketsCollection::Uint8($vec) => $body,
            BucketsCollection::Int8($vec) => $body,
            BucketsCollection::Uint16($vec) => $body,
            BucketsCollection::Int16($vec) => $body,
            BucketsCollection::Uint32($vec) => $body,
            BucketsCollection::Int32($vec) => $body,
            BucketsCollection::Float($vec) => $body,
        }
    };
}

impl BucketsCollection {
    /// The raw type the bounds live in.
    #[must_use]
    pub fn feature_type(&self) -> RawFeatureType {
        match self {
            Self::Uint8(_) => RawFeatureType::Uint8,
            Self::Int8(_) => RawFeatureType::Int8,
            Self::Uint16(_) => RawFeatureType::Uint16,
            Self::Int16(_) => RawFeatureType::Int16,
            Self::Uint32(_) => RawFeatureType::Uint32,
            Self::Int32(_) => RawFeatureType::Int32,
            Self::Float(_) => RawFeatureType::Float,
        }
    }

    /// Number of buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        for_each_buckets!(self, v => v.len())
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The bucket's lower bound as text, for debug output.
    #[must_use]
    pub fn display_string(&self, bucket: Bucket) -> String {
        for_each_buckets!(self, v => v[bucket as usize].to_string())
    }

    /// The bucket's lower bound as text for the serialized ensemble.
    ///
    /// Float bounds are nudged one ulp down so that at evaluation time the
    /// `value >= threshold` test keeps boundary values on the same side as
    /// the bucketized comparison did during training.
    #[must_use]
    pub fn value_string(&self, bucket: Bucket) -> String {
        match self {
            Self::Float(v) => v[bucket as usize].next_down().to_string(),
            _ => self.display_string(bucket),
        }
    }
}

/// Folds a typed bound table into the matching [`BucketsCollection`]
/// variant.
pub trait IntoBuckets: RawValue {
    /// Wraps `bounds` in this type's variant.
    fn into_buckets(bounds: Vec<Self>) -> BucketsCollection;
}

macro_rules! impl_into_buckets {
    ($t:ty, $variant:ident) => {
        impl IntoBuckets for $t {
            fn into_buckets(bounds: Vec<Self>) -> BucketsCollection {
                BucketsCollection::$variant(bounds)
            }
        }
    };
}

impl_into_buckets!(u8, Uint8);
impl_into_buckets!(i8, Int8);
impl_into_buckets!(u16, Uint16);
impl_into_buckets!(i16, Int16);
impl_into_buckets!(u32, Uint32);
impl_into_buckets!(i32, Int32);
impl_into_buckets!(f32, Float);

#[cfg(test)]
mod tests {
    use super::BucketsCollection;
    use crate::types::RawFeatureType;
    use test_log::test;

    #[test]
    fn integer_bounds_serialize_verbatim() {
        let buckets = BucketsCollection::Int16(vec![-5, 0, 17]);
        assert_eq!(RawFeatureType::Int16, buckets.feature_type());
        assert_eq!("-5", buckets.value_string(0));
        assert_eq!("17", buckets.display_string(2));
    }

    #[test]
    fn float_bounds_are_nudged_down() {
        let buckets = BucketsCollection::Float(vec![0.0, 1.0]);
        let serialized: f32 = buckets.value_string(1).parse().unwrap();
        assert!(serialized < 1.0);
        assert_eq!(1.0f32.next_down(), serialized);

        // Debug output shows the bound itself
        assert_eq!("1", buckets.display_string(1));
    }
}
