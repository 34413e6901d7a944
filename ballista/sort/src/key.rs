// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Prefix keys and record comparators.
//!
//! Every record carries a fixed-length prefix key computed when it enters a
//! sort buffer. Keys are compared as raw bytes; only when two keys are equal
//! does the sorter fall back to the full [`RecordComparator`]. For that to be
//! correct a key computer must never order two records differently from the
//! comparator: `key(a) < key(b)` implies `compare(a, b) == Less`.

use std::cmp::Ordering;
use std::fmt::Debug;

use crate::error::{Result, SortError};
use crate::row::BinaryRowRef;

/// Computes the fixed-length, byte-comparable prefix key of a record.
pub trait KeyComputer: Send + Sync + Debug {
    /// Length in bytes of every key.
    fn key_len(&self) -> usize;

    /// Writes the key of the serialized `record` into `target`, which is
    /// exactly `key_len()` bytes long.
    fn put_key(&self, record: &[u8], target: &mut [u8]);

    /// Returns true if equal keys imply equal records under the comparator,
    /// in which case the comparator is never consulted.
    fn key_fully_determines(&self) -> bool {
        false
    }
}

/// Total order over serialized records.
pub trait RecordComparator: Send + Sync {
    /// Compares two serialized records.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

impl<F> RecordComparator for F
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self(a, b)
    }
}

/// Orders two records by prefix key, breaking key ties with `tie_break`
/// unless the key fully determines the order.
#[inline]
pub fn compare_prefixed(
    key_a: &[u8],
    key_b: &[u8],
    key_fully_determines: bool,
    tie_break: impl FnOnce() -> Ordering,
) -> Ordering {
    match key_a.cmp(key_b) {
        Ordering::Equal if !key_fully_determines => tie_break(),
        other => other,
    }
}

/// Type of a sort column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortFieldType {
    /// Little-endian signed 64 bit integer.
    Int64,
    /// Byte string compared lexicographically. Only the first `prefix_len`
    /// bytes make it into the prefix key.
    Bytes {
        /// number of leading bytes encoded in the key
        prefix_len: usize,
    },
}

impl SortFieldType {
    fn width(&self) -> usize {
        match self {
            SortFieldType::Int64 => 8,
            SortFieldType::Bytes { prefix_len } => *prefix_len,
        }
    }
}

/// One column of a sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortField {
    /// Field index in the row
    pub index: usize,
    /// Type of the field
    pub field_type: SortFieldType,
    /// Ascending (default) or descending
    pub ascending: bool,
    /// Whether nulls sort before non-null values (default: true)
    pub nulls_first: bool,
}

impl SortField {
    /// Ascending i64 column, nulls first.
    pub fn int64(index: usize) -> Self {
        Self {
            index,
            field_type: SortFieldType::Int64,
            ascending: true,
            nulls_first: true,
        }
    }

    /// Ascending byte string column, nulls first, with `prefix_len` bytes in
    /// the prefix key.
    pub fn bytes(index: usize, prefix_len: usize) -> Self {
        Self {
            index,
            field_type: SortFieldType::Bytes { prefix_len },
            ascending: true,
            nulls_first: true,
        }
    }

    /// Sorts this column in descending order.
    pub fn descending(mut self) -> Self {
        self.ascending = false;
        self
    }

    /// Sorts nulls after non-null values.
    pub fn nulls_last(mut self) -> Self {
        self.nulls_first = false;
        self
    }

    fn null_marker(&self) -> u8 {
        if self.nulls_first { 0 } else { 2 }
    }
}

fn check_fields(arity: usize, fields: &[SortField]) -> Result<()> {
    for field in fields {
        if field.index >= arity {
            return Err(SortError::Configuration(format!(
                "sort field {} is out of range for rows of arity {arity}",
                field.index
            )));
        }
    }
    Ok(())
}

/// Reads an i64 sort column, treating malformed values as `i64::MIN` so the
/// key and the comparator agree.
fn int64_value(bytes: &[u8]) -> i64 {
    bytes
        .try_into()
        .map(i64::from_le_bytes)
        .unwrap_or(i64::MIN)
}

/// Prefix key over the sort columns of a [`BinaryRow`](crate::row::BinaryRow).
///
/// Each column contributes a null marker byte followed by an order
/// preserving encoding of its value: i64 values are stored big-endian with
/// the sign bit flipped, byte strings are truncated or zero padded to their
/// prefix length. Descending columns have their value bytes inverted.
///
/// The key ends after the first byte string column. Its prefix does not
/// determine the column's order, so bytes of any later column could order
/// two records against the comparator.
#[derive(Debug, Clone)]
pub struct SortFieldKeyComputer {
    arity: usize,
    fields: Vec<SortField>,
    key_len: usize,
}

impl SortFieldKeyComputer {
    /// Creates a key computer for rows of `arity` fields.
    pub fn try_new(arity: usize, fields: Vec<SortField>) -> Result<Self> {
        check_fields(arity, &fields)?;
        let num_key_fields = fields
            .iter()
            .position(|f| f.field_type != SortFieldType::Int64)
            .map_or(fields.len(), |i| i + 1);
        let fields: Vec<_> = fields.into_iter().take(num_key_fields).collect();
        let key_len = fields.iter().map(|f| 1 + f.field_type.width()).sum();
        Ok(Self {
            arity,
            fields,
            key_len,
        })
    }

    /// Number of leading sort columns encoded in the key.
    pub fn num_key_fields(&self) -> usize {
        self.fields.len()
    }
}

impl KeyComputer for SortFieldKeyComputer {
    fn key_len(&self) -> usize {
        self.key_len
    }

    fn put_key(&self, record: &[u8], target: &mut [u8]) {
        let row = BinaryRowRef::new(self.arity, record);
        let mut pos = 0;
        for field in &self.fields {
            let width = field.field_type.width();
            let (marker, value) = target[pos..pos + 1 + width].split_at_mut(1);
            match row.field(field.index) {
                None => {
                    marker[0] = field.null_marker();
                    value.fill(0);
                }
                Some(bytes) => {
                    marker[0] = 1;
                    match field.field_type {
                        SortFieldType::Int64 => {
                            let v = int64_value(bytes) as u64 ^ (1 << 63);
                            value.copy_from_slice(&v.to_be_bytes());
                        }
                        SortFieldType::Bytes { prefix_len } => {
                            let n = prefix_len.min(bytes.len());
                            value[..n].copy_from_slice(&bytes[..n]);
                            value[n..].fill(0);
                        }
                    }
                    if !field.ascending {
                        value.iter_mut().for_each(|b| *b = !*b);
                    }
                }
            }
            pos += 1 + width;
        }
    }

    fn key_fully_determines(&self) -> bool {
        self.fields
            .iter()
            .all(|f| f.field_type == SortFieldType::Int64)
    }
}

/// Full comparator over the sort columns of a
/// [`BinaryRow`](crate::row::BinaryRow), consistent with
/// [`SortFieldKeyComputer`] for the same fields.
#[derive(Debug, Clone)]
pub struct SortFieldComparator {
    arity: usize,
    fields: Vec<SortField>,
}

impl SortFieldComparator {
    /// Creates a comparator for rows of `arity` fields.
    pub fn try_new(arity: usize, fields: Vec<SortField>) -> Result<Self> {
        check_fields(arity, &fields)?;
        Ok(Self { arity, fields })
    }
}

impl RecordComparator for SortFieldComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let a = BinaryRowRef::new(self.arity, a);
        let b = BinaryRowRef::new(self.arity, b);
        for field in &self.fields {
            let ord = match (a.field(field.index), b.field(field.index)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) if field.nulls_first => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) if field.nulls_first => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(x), Some(y)) => {
                    let ord = match field.field_type {
                        SortFieldType::Int64 => int64_value(x).cmp(&int64_value(y)),
                        SortFieldType::Bytes { .. } => x.cmp(y),
                    };
                    if field.ascending { ord } else { ord.reverse() }
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Prefix key of raw byte records: their first `prefix_len` bytes.
#[derive(Debug, Clone, Copy)]
pub struct BytesPrefixKeyComputer {
    prefix_len: usize,
}

impl BytesPrefixKeyComputer {
    /// Creates a key computer using the first `prefix_len` bytes.
    pub fn new(prefix_len: usize) -> Self {
        Self { prefix_len }
    }
}

impl KeyComputer for BytesPrefixKeyComputer {
    fn key_len(&self) -> usize {
        self.prefix_len
    }

    fn put_key(&self, record: &[u8], target: &mut [u8]) {
        let n = self.prefix_len.min(record.len());
        target[..n].copy_from_slice(&record[..n]);
        target[n..].fill(0);
    }
}

/// Lexicographic comparator for raw byte records.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesComparator;

impl RecordComparator for BytesComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{BinaryRow, BinaryRowBuilder};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn key_of(computer: &dyn KeyComputer, row: &BinaryRow) -> Vec<u8> {
        let mut key = vec![0u8; computer.key_len()];
        computer.put_key(row.as_bytes(), &mut key);
        key
    }

    fn int_row(v: Option<i64>) -> BinaryRow {
        let mut builder = BinaryRowBuilder::new(1);
        match v {
            Some(v) => builder.push_i64(v),
            None => builder.push_null(),
        };
        builder.build()
    }

    fn str_row(s: &str) -> BinaryRow {
        BinaryRowBuilder::new(1).push_str(s).build()
    }

    /// prefix key order must refine the comparator order
    fn assert_consistent(
        computer: &dyn KeyComputer,
        comparator: &dyn RecordComparator,
        rows: &[BinaryRow],
    ) {
        for a in rows {
            for b in rows {
                let key_ord = key_of(computer, a).cmp(&key_of(computer, b));
                let cmp_ord = comparator.compare(a.as_bytes(), b.as_bytes());
                if key_ord != Ordering::Equal {
                    assert_eq!(key_ord, cmp_ord, "{a:?} vs {b:?}");
                } else if computer.key_fully_determines() {
                    assert_eq!(cmp_ord, Ordering::Equal, "{a:?} vs {b:?}");
                }
            }
        }
    }

    #[test]
    fn int64_keys_follow_signed_order() -> Result<()> {
        let fields = vec![SortField::int64(0)];
        let computer = SortFieldKeyComputer::try_new(1, fields.clone())?;
        let comparator = SortFieldComparator::try_new(1, fields)?;
        assert_eq!(computer.key_len(), 9);
        assert!(computer.key_fully_determines());

        let rows: Vec<_> = [None, Some(i64::MIN), Some(-5), Some(0), Some(3), Some(i64::MAX)]
            .into_iter()
            .map(int_row)
            .collect();
        let keys: Vec<_> = rows.iter().map(|r| key_of(&computer, r)).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert_consistent(&computer, &comparator, &rows);
        Ok(())
    }

    #[test]
    fn descending_and_nulls_last() -> Result<()> {
        let fields = vec![SortField::int64(0).descending().nulls_last()];
        let computer = SortFieldKeyComputer::try_new(1, fields.clone())?;
        let comparator = SortFieldComparator::try_new(1, fields)?;

        let rows: Vec<_> = [Some(10), Some(2), Some(-7), None]
            .into_iter()
            .map(int_row)
            .collect();
        let keys: Vec<_> = rows.iter().map(|r| key_of(&computer, r)).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert_consistent(&computer, &comparator, &rows);
        Ok(())
    }

    #[test]
    fn truncated_byte_keys_need_the_comparator() -> Result<()> {
        let fields = vec![SortField::bytes(0, 2)];
        let computer = SortFieldKeyComputer::try_new(1, fields.clone())?;
        let comparator = SortFieldComparator::try_new(1, fields)?;
        assert!(!computer.key_fully_determines());

        let a = str_row("abc");
        let b = str_row("abd");
        assert_eq!(key_of(&computer, &a), key_of(&computer, &b));
        assert_eq!(comparator.compare(a.as_bytes(), b.as_bytes()), Ordering::Less);

        let rows: Vec<_> = ["", "a", "a\0", "ab", "abc", "abd", "b", "ba", "\u{ff}"]
            .into_iter()
            .map(str_row)
            .collect();
        assert_consistent(&computer, &comparator, &rows);
        Ok(())
    }

    #[test]
    fn random_multi_column_consistency() -> Result<()> {
        let fields = vec![SortField::bytes(0, 3).descending(), SortField::int64(1)];
        let computer = SortFieldKeyComputer::try_new(2, fields.clone())?;
        let comparator = SortFieldComparator::try_new(2, fields)?;

        let mut rng = StdRng::seed_from_u64(7);
        let rows: Vec<_> = (0..200)
            .map(|_| {
                // short strings over a tiny alphabet, zero bytes included, so
                // prefixes collide and padding is ambiguous
                let len = rng.gen_range(0..5);
                let s: Vec<u8> = (0..len).map(|_| rng.gen_range(0..3)).collect();
                let mut builder = BinaryRowBuilder::new(2);
                builder.push_bytes(&s);
                if rng.gen_range(0..4) == 0 {
                    builder.push_null();
                } else {
                    builder.push_i64(rng.gen_range(-3..3));
                }
                builder.build()
            })
            .collect();
        assert_consistent(&computer, &comparator, &rows);
        Ok(())
    }

    #[test]
    fn key_ends_after_byte_column() -> Result<()> {
        let fields = vec![SortField::bytes(0, 1), SortField::int64(1)];
        let computer = SortFieldKeyComputer::try_new(2, fields.clone())?;
        let comparator = SortFieldComparator::try_new(2, fields)?;
        assert_eq!(computer.num_key_fields(), 1);
        assert_eq!(computer.key_len(), 2);
        assert!(!computer.key_fully_determines());

        let row = |s: &str, v: i64| BinaryRowBuilder::new(2).push_str(s).push_i64(v).build();
        let ab = row("ab", 1);
        let aa = row("aa", 2);
        assert_eq!(key_of(&computer, &ab), key_of(&computer, &aa));
        assert_eq!(comparator.compare(ab.as_bytes(), aa.as_bytes()), Ordering::Greater);

        let rows = vec![
            ab,
            aa,
            row("a", 5),
            row("a\0", -5),
            row("", 0),
            row("b", -1),
            row("ba", -9),
        ];
        assert_consistent(&computer, &comparator, &rows);
        Ok(())
    }

    #[test]
    fn int_columns_before_byte_column_stay_in_key() -> Result<()> {
        let fields = vec![
            SortField::int64(1).descending(),
            SortField::bytes(0, 2),
            SortField::int64(2),
        ];
        let computer = SortFieldKeyComputer::try_new(3, fields.clone())?;
        let comparator = SortFieldComparator::try_new(3, fields)?;
        assert_eq!(computer.num_key_fields(), 2);
        assert_eq!(computer.key_len(), 9 + 3);

        let row = |s: &str, a: i64, b: i64| {
            BinaryRowBuilder::new(3)
                .push_str(s)
                .push_i64(a)
                .push_i64(b)
                .build()
        };
        let rows = vec![
            row("x", 1, 9),
            row("x\0", 1, -9),
            row("xy", 1, 0),
            row("xyz", 1, -3),
            row("xya", 1, 3),
            row("x", 2, 0),
            row("", 0, 0),
        ];
        assert_consistent(&computer, &comparator, &rows);
        Ok(())
    }

    #[test]
    fn out_of_range_field_is_rejected() {
        assert!(SortFieldKeyComputer::try_new(1, vec![SortField::int64(1)]).is_err());
        assert!(SortFieldComparator::try_new(2, vec![SortField::int64(2)]).is_err());
    }

    #[test]
    fn closures_are_comparators() {
        let reverse = |a: &[u8], b: &[u8]| b.cmp(a);
        assert_eq!(reverse.compare(b"a", b"b"), Ordering::Greater);
        assert_eq!(BytesComparator.compare(b"a", b"b"), Ordering::Less);

        let computer = BytesPrefixKeyComputer::new(4);
        let mut key = [0xffu8; 4];
        computer.put_key(b"ab", &mut key);
        assert_eq!(key, [b'a', b'b', 0, 0]);
    }

    #[test]
    fn prefix_comparison_skips_tie_break_when_determined() {
        let ord = compare_prefixed(b"a", b"a", true, || panic!("tie break used"));
        assert_eq!(ord, Ordering::Equal);
        let ord = compare_prefixed(b"a", b"a", false, || Ordering::Less);
        assert_eq!(ord, Ordering::Less);
        let ord = compare_prefixed(b"a", b"b", false, || Ordering::Greater);
        assert_eq!(ord, Ordering::Less);
    }
}
