// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::types::{NumberFormatError, RawFeatureType, RawValue};
use serde::{Deserialize, Serialize};

/// A feature as recorded in the serialized ensemble: its name and the raw
/// type its thresholds are expressed in.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FeatureMetadata {
    /// Feature name, from the TSV header or the SVM name table.
    pub name: String,

    /// Raw type of the serialized threshold strings.
    #[serde(rename = "type")]
    pub feature_type: RawFeatureType,
}

impl FeatureMetadata {
    /// Creates metadata for a named feature.
    #[must_use]
    pub fn new(name: impl Into<String>, feature_type: RawFeatureType) -> Self {
        Self {
            name: name.into(),
            feature_type,
        }
    }

    /// Parses a cell under this feature's declared type, widening the result
    /// to `f64` (exact for every supported type). Range violations are
    /// errors, so an ensemble trained on `uint8` rejects out-of-range
    /// evaluation data instead of silently truncating it.
    pub fn parse_value(&self, cell: &str) -> Result<f64, NumberFormatError> {
        Ok(match self.feature_type {
            RawFeatureType::Uint8 => u8::parse_cell(cell)?.as_f64(),
            RawFeatureType::Int8 => i8::parse_cell(cell)?.as_f64(),
            RawFeatureType::Uint16 => u16::parse_cell(cell)?.as_f64(),
            RawFeatureType::Int16 => i16::parse_cell(cell)?.as_f64(),
            RawFeatureType::Uint32 => u32::parse_cell(cell)?.as_f64(),
            RawFeatureType::Int32 => i32::parse_cell(cell)?.as_f64(),
            RawFeatureType::Float => f32::parse_cell(cell)?.as_f64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::FeatureMetadata;
    use crate::types::RawFeatureType;
    use test_log::test;

    #[test]
    fn parse_respects_declared_type() {
        let meta = FeatureMetadata::new("f", RawFeatureType::Uint8);
        assert!((meta.parse_value("200").unwrap() - 200.0).abs() < f64::EPSILON);
        assert!(meta.parse_value("300").is_err());
        assert!(meta.parse_value("1.5").is_err());

        let meta = FeatureMetadata::new("f", RawFeatureType::Float);
        assert!((meta.parse_value("1.5").unwrap() - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn metadata_json_shape() {
        let meta = FeatureMetadata::new("clicks", RawFeatureType::Uint32);
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(r#"{"name":"clicks","type":"uint32"}"#, json);
    }
}
