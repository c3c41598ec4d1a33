// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use serde::{Deserialize, Serialize};

/// Index of a document within the training set
pub type DocId = u32;

/// Index of a node within a tree's node array
pub type TreeNodeId = u32;

/// Index of a feature within the feature list
pub type FeatureIndex = u32;

/// Bucket id in a feature's discretized value domain
pub type Bucket = u16;

/// Smallest hessian considered non-degenerate
pub const EPSILON: f32 = 1.084_202_2e-19; // sqrt(f32::MIN_POSITIVE)

/// Primitive column types a raw feature can be stored as.
///
/// The declaration order is the promotion order: a column starts at the
/// configured default type and is promoted towards `Float` whenever a cell
/// does not fit.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawFeatureType {
    /// Unsigned 8-bit integer
    Uint8,
    /// Signed 8-bit integer
    Int8,
    /// Unsigned 16-bit integer
    Uint16,
    /// Signed 16-bit integer
    Int16,
    /// Unsigned 32-bit integer
    Uint32,
    /// Signed 32-bit integer
    Int32,
    /// 32-bit float
    Float,
}

impl RawFeatureType {
    /// The next wider type in the promotion order, if any.
    #[must_use]
    pub fn promoted(self) -> Option<Self> {
        use RawFeatureType::{Float, Int16, Int32, Int8, Uint16, Uint32, Uint8};

        match self {
            Uint8 => Some(Int8),
            Int8 => Some(Uint16),
            Uint16 => Some(Int16),
            Int16 => Some(Uint32),
            Uint32 => Some(Int32),
            Int32 => Some(Float),
            Float => None,
        }
    }

    /// Stable textual name, as used in flags and the ensemble JSON.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Uint8 => "uint8",
            Self::Int8 => "int8",
            Self::Uint16 => "uint16",
            Self::Int16 => "int16",
            Self::Uint32 => "uint32",
            Self::Int32 => "int32",
            Self::Float => "float",
        }
    }
}

impl std::fmt::Display for RawFeatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for RawFeatureType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "uint8" => Ok(Self::Uint8),
            "int8" => Ok(Self::Int8),
            "uint16" => Ok(Self::Uint16),
            "int16" => Ok(Self::Int16),
            "uint32" => Ok(Self::Uint32),
            "int32" => Ok(Self::Int32),
            "float" => Ok(Self::Float),
            _ => Err(crate::Error::Config(format!("unknown raw feature type: {s}"))),
        }
    }
}

/// A cell could not be parsed as (or does not fit into) some raw type.
///
/// This is a separate type from [`crate::Error`] because type promotion uses
/// it as control flow: a promotion candidate is rejected when re-parsing
/// returns this error.
#[derive(Debug)]
pub struct NumberFormatError;

fn parse_cell_i64(s: &str) -> Result<i64, NumberFormatError> {
    s.trim().parse::<i64>().map_err(|_| NumberFormatError)
}

fn parse_cell_f32(s: &str) -> Result<f32, NumberFormatError> {
    let v = s.trim().parse::<f32>().map_err(|_| NumberFormatError)?;
    if v.is_infinite() {
        // Out of f32 range, nothing wider to promote to
        return Err(NumberFormatError);
    }
    Ok(v)
}

/// A primitive value a raw feature column can hold.
pub trait RawValue: Copy + PartialOrd + std::fmt::Display + Send + Sync + 'static {
    /// The tag of this type in [`RawFeatureType`].
    const TYPE: RawFeatureType;

    /// Total ordering used for sorting raw values (floats via `total_cmp`).
    fn order(&self, other: &Self) -> std::cmp::Ordering;

    /// Widening conversion; exact for every supported type.
    fn as_f64(self) -> f64;

    /// Parses a cell, rejecting values that do not fit this type.
    fn parse_cell(s: &str) -> Result<Self, NumberFormatError>;
}

macro_rules! impl_raw_value_int {
    ($t:ty, $tag:expr) => {
        impl RawValue for $t {
            const TYPE: RawFeatureType = $tag;

            fn order(&self, other: &Self) -> std::cmp::Ordering {
                self.cmp(other)
            }

            #[allow(clippy::cast_lossless)]
            fn as_f64(self) -> f64 {
                self as f64
            }

            fn parse_cell(s: &str) -> Result<Self, NumberFormatError> {
                Self::try_from(parse_cell_i64(s)?).map_err(|_| NumberFormatError)
            }
        }
    };
}

impl_raw_value_int!(u8, RawFeatureType::Uint8);
impl_raw_value_int!(i8, RawFeatureType::Int8);
impl_raw_value_int!(u16, RawFeatureType::Uint16);
impl_raw_value_int!(i16, RawFeatureType::Int16);
impl_raw_value_int!(u32, RawFeatureType::Uint32);
impl_raw_value_int!(i32, RawFeatureType::Int32);

impl RawValue for f32 {
    const TYPE: RawFeatureType = RawFeatureType::Float;

    fn order(&self, other: &Self) -> std::cmp::Ordering {
        self.total_cmp(other)
    }

    fn as_f64(self) -> f64 {
        f64::from(self)
    }

    fn parse_cell(s: &str) -> Result<Self, NumberFormatError> {
        parse_cell_f32(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn promotion_order_ends_at_float() {
        let mut t = RawFeatureType::Uint8;
        let mut steps = 0;
        while let Some(next) = t.promoted() {
            t = next;
            steps += 1;
        }
        assert_eq!(RawFeatureType::Float, t);
        assert_eq!(6, steps);
    }

    #[test]
    fn parse_cell_respects_type_range() {
        assert!(u8::parse_cell("255").is_ok());
        assert!(u8::parse_cell("256").is_err());
        assert!(u8::parse_cell("-1").is_err());
        assert!(i8::parse_cell("-128").is_ok());
        assert!(i8::parse_cell("1.5").is_err());
        assert!((f32::parse_cell("1.5").unwrap() - 1.5).abs() < f32::EPSILON);
        assert!(f32::parse_cell("abc").is_err());
        assert!(f32::parse_cell("1e99").is_err());
    }

    #[test]
    fn type_names_round_trip() {
        for t in [
            RawFeatureType::Uint8,
            RawFeatureType::Int8,
            RawFeatureType::Uint16,
            RawFeatureType::Int16,
            RawFeatureType::Uint32,
            RawFeatureType::Int32,
            RawFeatureType::Float,
        ] {
            assert_eq!(t, t.name().parse().unwrap());
        }
    }
}
