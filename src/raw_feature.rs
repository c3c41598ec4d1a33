// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    bucketizer::bucketize,
    buckets::{BucketsCollection, IntoBuckets},
    types::{Bucket, DocId, NumberFormatError, RawFeatureType, RawValue},
};

/// An append-only typed numeric column.
///
/// One variant per supported raw type; the column starts at the configured
/// default type and is promoted by [`DynamicRawColumn`] when a cell does not
/// fit.
#[derive(Clone, Debug)]
pub enum RawColumn {
    /// `uint8` storage
    Uint8(Vec<u8>),
    /// `int8` storage
    Int8(Vec<i8>),
    /// `uint16` storage
    Uint16(Vec<u16>),
    /// `int16` storage
    Int16(Vec<i16>),
    /// `uint32` storage
    Uint32(Vec<u32>),
    /// `int32` storage
    Int32(Vec<i32>),
    /// `float` storage
    Float(Vec<f32>),
}

macro_rules! for_each_column {
    ($self:expr, $vec:ident => $body:expr) => {
        match $self {
            RawColumn::Uint8($vec) => $body,
            RawColumn::Int8($vec) => $body,
            RawColumn::Uint16($vec) => $body,
            RawColumn::Int16($vec) => $body,
            RawColumn::Uint32($vec) => $body,
            RawColumn::Int32($vec) => $body,
            RawColumn::Float($vec) => $body,
        }
    };
}

impl RawColumn {
    /// Creates an empty column of the given type.
    #[must_use]
    pub fn new(feature_type: RawFeatureType) -> Self {
        match feature_type {
            RawFeatureType::Uint8 => Self::Uint8(Vec::new()),
            RawFeatureType::Int8 => Self::Int8(Vec::new()),
            RawFeatureType::Uint16 => Self::Uint16(Vec::new()),
            RawFeatureType::Int16 => Self::Int16(Vec::new()),
            RawFeatureType::Uint32 => Self::Uint32(Vec::new()),
            RawFeatureType::Int32 => Self::Int32(Vec::new()),
            RawFeatureType::Float => Self::Float(Vec::new()),
        }
    }

    /// Current storage type.
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

    /// Number of cells stored.
    #[must_use]
    pub fn len(&self) -> usize {
        for_each_column!(self, v => v.len())
    }

    /// Whether the column is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero-fills up to `n` cells; used for sparse (SVM) rows.
    pub fn zero_fill_to(&mut self, n: usize) {
        debug_assert!(n >= self.len());
        for_each_column!(self, v => v.resize(n, Default::default()));
    }

    /// Parses a cell under the current type and appends it.
    pub fn try_push(&mut self, cell: &str) -> Result<(), NumberFormatError> {
        fn push<T: RawValue>(vec: &mut Vec<T>, cell: &str) -> Result<(), NumberFormatError> {
            vec.push(T::parse_cell(cell)?);
            Ok(())
        }

        for_each_column!(self, v => push(v, cell))
    }

    /// Cell value widened to `f64`.
    #[must_use]
    pub fn value_as_f64(&self, index: usize) -> f64 {
        for_each_column!(self, v => v[index].as_f64())
    }

    /// Attempts a lossless-for-integers conversion into `target` storage.
    ///
    /// Only integer columns are ever converted (`float` is the last rung of
    /// the ladder); conversion to `float` is allowed to round, like any
    /// other float parse.
    #[must_use]
    pub fn try_convert(&self, target: RawFeatureType) -> Option<Self> {
        fn widen<T: RawValue + Into<i64>>(vec: &[T]) -> Vec<i64> {
            vec.iter().map(|&v| v.into()).collect()
        }

        let ints: Vec<i64> = match self {
            Self::Uint8(v) => widen(v),
            Self::Int8(v) => widen(v),
            Self::Uint16(v) => widen(v),
            Self::Int16(v) => widen(v),
            Self::Uint32(v) => widen(v),
            Self::Int32(v) => widen(v),
            Self::Float(_) => return None,
        };

        fn narrow<T: TryFrom<i64>>(ints: &[i64]) -> Option<Vec<T>> {
            ints.iter().map(|&v| T::try_from(v).ok()).collect()
        }

        #[allow(clippy::cast_precision_loss)]
        let converted = match target {
            RawFeatureType::Uint8 => Self::Uint8(narrow(&ints)?),
            RawFeatureType::Int8 => Self::Int8(narrow(&ints)?),
            RawFeatureType::Uint16 => Self::Uint16(narrow(&ints)?),
            RawFeatureType::Int16 => Self::Int16(narrow(&ints)?),
            RawFeatureType::Uint32 => Self::Uint32(narrow(&ints)?),
            RawFeatureType::Int32 => Self::Int32(narrow(&ints)?),
            RawFeatureType::Float => Self::Float(ints.iter().map(|&v| v as f32).collect()),
        };

        Some(converted)
    }

    /// Bucketizes the column.
    pub fn cook(&self, max_buckets: u32) -> crate::Result<CookedColumn> {
        fn run<T: IntoBuckets>(data: &[T], max_buckets: u32) -> crate::Result<CookedColumn> {
            let result = bucketize(data, max_buckets)?;

            #[allow(clippy::cast_possible_truncation)]
            let n_buckets = result.bucket_min.len() as u32;

            Ok(CookedColumn {
                name: String::new(),
                buckets: T::into_buckets(result.bucket_min),
                data: result.data,
                n_buckets,
                default_bucket: result.default_bucket,
                sparsity: result.sparsity,
            })
        }

        for_each_column!(self, v => run(v, max_buckets))
    }
}

/// A raw feature column that promotes its storage type on demand.
#[derive(Clone, Debug)]
pub struct DynamicRawColumn {
    name: String,
    column: RawColumn,
}

impl DynamicRawColumn {
    /// Creates an empty column starting at `default_type`.
    #[must_use]
    pub fn new(name: impl Into<String>, default_type: RawFeatureType) -> Self {
        Self {
            name: name.into(),
            column: RawColumn::new(default_type),
        }
    }

    /// Feature name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying typed column.
    #[must_use]
    pub fn column(&self) -> &RawColumn {
        &self.column
    }

    /// Appends a cell for `doc_id`, zero-filling skipped documents and
    /// promoting the storage type when the cell does not fit.
    pub fn put(&mut self, cell: &str, doc_id: DocId) -> crate::Result<()> {
        self.column.zero_fill_to(doc_id as usize);

        if self.column.try_push(cell).is_ok() {
            return Ok(());
        }
        self.promote_for(cell)?;
        self.column.try_push(cell).map_err(|_| {
            crate::Error::Train(format!(
                "promotion of feature '{}' accepted a value its new type cannot parse",
                self.name
            ))
        })
    }

    /// Zero-fills the column out to the final document count.
    pub fn finalize(&mut self, n_docs: DocId) {
        self.column.zero_fill_to(n_docs as usize);
    }

    /// Bucketizes the column, consuming it.
    pub fn cook(self, max_buckets: u32) -> crate::Result<CookedColumn> {
        let mut cooked = self.column.cook(max_buckets).map_err(|e| match e {
            crate::Error::Bucketize(msg) => {
                crate::Error::Bucketize(format!("{msg} (feature '{}')", self.name))
            }
            other => other,
        })?;
        cooked.name = self.name;
        Ok(cooked)
    }

    fn promote_for(&mut self, cell: &str) -> crate::Result<()> {
        // The cell must at least be numeric, or no promotion can save it.
        f32::parse_cell(cell).map_err(|_| {
            crate::Error::TypePromotion(format!(
                "cannot parse value '{}' of feature '{}' as a number",
                cell, self.name
            ))
        })?;

        let fits = |t: RawFeatureType, cell: &str| match t {
            RawFeatureType::Uint8 => u8::parse_cell(cell).is_ok(),
            RawFeatureType::Int8 => i8::parse_cell(cell).is_ok(),
            RawFeatureType::Uint16 => u16::parse_cell(cell).is_ok(),
            RawFeatureType::Int16 => i16::parse_cell(cell).is_ok(),
            RawFeatureType::Uint32 => u32::parse_cell(cell).is_ok(),
            RawFeatureType::Int32 => i32::parse_cell(cell).is_ok(),
            RawFeatureType::Float => f32::parse_cell(cell).is_ok(),
        };

        let mut candidate = self.column.feature_type();
        while let Some(next) = candidate.promoted() {
            candidate = next;
            if !fits(candidate, cell) {
                continue;
            }
            if let Some(converted) = self.column.try_convert(candidate) {
                log::debug!(
                    "promoting feature '{}' from {} to {}",
                    self.name,
                    self.column.feature_type(),
                    candidate
                );
                self.column = converted;
                return Ok(());
            }
        }

        Err(crate::Error::TypePromotion(format!(
            "value '{}' of feature '{}' does not fit any supported type",
            cell, self.name
        )))
    }
}

/// A bucketized feature column, ready to be encoded as a dense or sparse
/// feature.
pub struct CookedColumn {
    /// Feature name.
    pub name: String,
    /// Bucket lower bounds in the raw domain.
    pub buckets: BucketsCollection,
    /// Per-document bucket indices.
    pub data: Vec<Bucket>,
    /// Number of buckets.
    pub n_buckets: u32,
    /// Most frequent bucket.
    pub default_bucket: Bucket,
    /// `1 - default_frequency / n_docs`.
    pub sparsity: f32,
}

/// Accumulates query-id change boundaries into `query_limits`: the doc id of
/// each query's first document, plus a final entry holding the document
/// count.
#[derive(Debug, Default)]
pub struct QueryColumn {
    limits: Vec<DocId>,
    current_doc: DocId,
    last_query: Option<String>,
}

impl QueryColumn {
    /// Consumes one row's query cell.
    pub fn consume(&mut self, cell: &str) {
        if self.last_query.as_deref() != Some(cell) {
            self.last_query = Some(cell.to_owned());
            self.limits.push(self.current_doc);
        }
        self.current_doc += 1;
    }

    /// Closes the table after the last row.
    pub fn finalize(&mut self) {
        self.limits.push(self.current_doc);
    }

    /// The finished boundary table.
    #[must_use]
    pub fn into_limits(self) -> Vec<DocId> {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::{DynamicRawColumn, QueryColumn, RawColumn};
    use crate::types::RawFeatureType;
    use test_log::test;

    #[test]
    fn promotion_walks_the_ladder() {
        let mut column = DynamicRawColumn::new("f", RawFeatureType::Uint8);
        column.put("200", 0).unwrap();
        assert_eq!(RawFeatureType::Uint8, column.column().feature_type());

        // -3 does not fit u8, and 200 does not fit i8, so both skip to i16
        column.put("-3", 1).unwrap();
        assert_eq!(RawFeatureType::Int16, column.column().feature_type());

        column.put("70000", 2).unwrap();
        assert_eq!(RawFeatureType::Int32, column.column().feature_type());

        column.put("0.5", 3).unwrap();
        assert_eq!(RawFeatureType::Float, column.column().feature_type());

        let expected = [200.0, -3.0, 70000.0, 0.5];
        for (i, &want) in expected.iter().enumerate() {
            assert!((column.column().value_as_f64(i) - want).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn unparseable_cell_is_a_promotion_failure() {
        let mut column = DynamicRawColumn::new("f", RawFeatureType::Uint8);
        assert!(column.put("banana", 0).is_err());
    }

    #[test]
    fn sparse_rows_zero_fill() {
        let mut column = DynamicRawColumn::new("f", RawFeatureType::Uint8);
        column.put("7", 3).unwrap();
        column.finalize(6);

        let RawColumn::Uint8(data) = column.column() else {
            panic!("expected uint8 storage");
        };
        assert_eq!(&[0, 0, 0, 7, 0, 0], data.as_slice());
    }

    #[test]
    fn query_limits_mark_boundaries() {
        let mut column = QueryColumn::default();
        for q in ["a", "a", "b", "b", "b", "c"] {
            column.consume(q);
        }
        column.finalize();
        assert_eq!(vec![0, 2, 5, 6], column.into_limits());
    }
}
