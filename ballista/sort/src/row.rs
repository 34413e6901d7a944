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

//! Binary row format and the serializer contract used by the sorter.
//!
//! A [`BinaryRow`] has a fixed arity and a variable total length:
//!
//! ```text
//! [u32: offset_0][u32: len_0]...[u32: offset_n-1][u32: len_n-1][field bytes...]
//! ```
//!
//! - All values are little-endian u32
//! - `offset_i` is relative to the start of the row
//! - `len_i == u32::MAX` marks a null field
//!
//! Sort keys and comparators read fields straight from these bytes through
//! [`BinaryRowRef`], so records are never deserialized while sorting.

use std::fmt;

use crate::error::{Result, SortError};

const FIELD_HEADER_SIZE: usize = 8;
const NULL_LEN: u32 = u32::MAX;

/// Serializes records into the bytes stored in sort buffers and spill files,
/// and turns those bytes back into records. `deserialize(serialize(r))` must
/// equal `r`.
pub trait RecordSerializer<T>: Send + Sync {
    /// Appends the serialized form of `record` to `target`.
    fn serialize(&self, record: &T, target: &mut Vec<u8>) -> Result<()>;

    /// Rebuilds a record from its serialized form.
    fn deserialize(&self, bytes: &[u8]) -> Result<T>;
}

fn read_u32(bytes: &[u8], pos: usize) -> Option<u32> {
    let raw = bytes.get(pos..pos + 4)?;
    Some(u32::from_le_bytes(raw.try_into().ok()?))
}

/// Borrowed view over a serialized row.
#[derive(Clone, Copy)]
pub struct BinaryRowRef<'a> {
    arity: usize,
    bytes: &'a [u8],
}

impl<'a> BinaryRowRef<'a> {
    /// Wraps serialized bytes without validating them. Malformed fields read
    /// as null.
    pub fn new(arity: usize, bytes: &'a [u8]) -> Self {
        Self { arity, bytes }
    }

    /// Number of fields.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// The serialized bytes.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Returns the bytes of field `i`, or `None` if it is null or out of range.
    pub fn field(&self, i: usize) -> Option<&'a [u8]> {
        if i >= self.arity {
            return None;
        }
        let header = i * FIELD_HEADER_SIZE;
        let offset = read_u32(self.bytes, header)? as usize;
        let len = read_u32(self.bytes, header + 4)?;
        if len == NULL_LEN {
            return None;
        }
        self.bytes.get(offset..offset + len as usize)
    }

    /// Returns true if field `i` is null.
    pub fn is_null_at(&self, i: usize) -> bool {
        self.field(i).is_none()
    }

    /// Reads field `i` as a little-endian i64.
    pub fn get_i64(&self, i: usize) -> Option<i64> {
        let raw: [u8; 8] = self.field(i)?.try_into().ok()?;
        Some(i64::from_le_bytes(raw))
    }

    /// Reads field `i` as UTF-8.
    pub fn get_str(&self, i: usize) -> Option<&'a str> {
        std::str::from_utf8(self.field(i)?).ok()
    }

    fn validate(&self) -> Result<()> {
        let header_len = self.arity * FIELD_HEADER_SIZE;
        if self.bytes.len() < header_len {
            return Err(SortError::Serialization(format!(
                "row of {} bytes is shorter than the header of {header_len} bytes for arity {}",
                self.bytes.len(),
                self.arity
            )));
        }
        for i in 0..self.arity {
            let header = i * FIELD_HEADER_SIZE;
            let offset = read_u32(self.bytes, header).unwrap_or(0) as usize;
            let len = read_u32(self.bytes, header + 4).unwrap_or(0);
            if len != NULL_LEN
                && (offset < header_len || offset + len as usize > self.bytes.len())
            {
                return Err(SortError::Serialization(format!(
                    "field {i} at [{offset}, {}) lies outside a row of {} bytes",
                    offset + len as usize,
                    self.bytes.len()
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for BinaryRowRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for i in 0..self.arity {
            match self.field(i) {
                Some(v) => match std::str::from_utf8(v) {
                    Ok(s) => list.entry(&s),
                    Err(_) => list.entry(&v),
                },
                None => list.entry(&"NULL"),
            };
        }
        list.finish()
    }
}

/// An owned serialized row of fixed arity.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BinaryRow {
    arity: usize,
    bytes: Vec<u8>,
}

impl BinaryRow {
    /// Takes ownership of serialized bytes after checking the layout.
    pub fn try_from_bytes(arity: usize, bytes: Vec<u8>) -> Result<Self> {
        BinaryRowRef::new(arity, &bytes).validate()?;
        Ok(Self { arity, bytes })
    }

    /// Builds a row from optional field values.
    pub fn from_fields(fields: &[Option<&[u8]>]) -> Self {
        let mut builder = BinaryRowBuilder::new(fields.len());
        for field in fields {
            match field {
                Some(v) => builder.push_bytes(v),
                None => builder.push_null(),
            };
        }
        builder.build()
    }

    /// Borrowed view of this row.
    pub fn as_row_ref(&self) -> BinaryRowRef<'_> {
        BinaryRowRef::new(self.arity, &self.bytes)
    }

    /// Number of fields.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// The serialized bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of the serialized row in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if the row has no bytes at all (arity zero).
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the bytes of field `i`, or `None` if it is null.
    pub fn field(&self, i: usize) -> Option<&[u8]> {
        self.as_row_ref().field(i)
    }

    /// Reads field `i` as a little-endian i64.
    pub fn get_i64(&self, i: usize) -> Option<i64> {
        self.as_row_ref().get_i64(i)
    }

    /// Reads field `i` as UTF-8.
    pub fn get_str(&self, i: usize) -> Option<&str> {
        self.as_row_ref().get_str(i)
    }
}

impl fmt::Debug for BinaryRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinaryRow{:?}", self.as_row_ref())
    }
}

/// Writes the fields of one row, in order.
#[derive(Debug)]
pub struct BinaryRowBuilder {
    arity: usize,
    header: Vec<u8>,
    data: Vec<u8>,
}

impl BinaryRowBuilder {
    /// Creates a builder for a row with `arity` fields.
    pub fn new(arity: usize) -> Self {
        Self {
            arity,
            header: Vec::with_capacity(arity * FIELD_HEADER_SIZE),
            data: Vec::new(),
        }
    }

    fn fields_written(&self) -> usize {
        self.header.len() / FIELD_HEADER_SIZE
    }

    /// Appends a byte string field.
    pub fn push_bytes(&mut self, value: &[u8]) -> &mut Self {
        let offset = self.arity * FIELD_HEADER_SIZE + self.data.len();
        self.header.extend_from_slice(&(offset as u32).to_le_bytes());
        self.header.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.data.extend_from_slice(value);
        self
    }

    /// Appends a UTF-8 field.
    pub fn push_str(&mut self, value: &str) -> &mut Self {
        self.push_bytes(value.as_bytes())
    }

    /// Appends an i64 field, stored little-endian.
    pub fn push_i64(&mut self, value: i64) -> &mut Self {
        self.push_bytes(&value.to_le_bytes())
    }

    /// Appends a null field.
    pub fn push_null(&mut self) -> &mut Self {
        self.header.extend_from_slice(&0u32.to_le_bytes());
        self.header.extend_from_slice(&NULL_LEN.to_le_bytes());
        self
    }

    /// Finishes the row. Fields that were never written are null.
    pub fn build(&mut self) -> BinaryRow {
        while self.fields_written() < self.arity {
            self.push_null();
        }
        let mut bytes = std::mem::take(&mut self.header);
        bytes.truncate(self.arity * FIELD_HEADER_SIZE);
        bytes.append(&mut self.data);
        BinaryRow {
            arity: self.arity,
            bytes,
        }
    }
}

/// Serializer for [`BinaryRow`]s of one arity. Rows already are their
/// serialized form, so this only checks the arity and the layout.
#[derive(Debug, Clone, Copy)]
pub struct BinaryRowSerializer {
    arity: usize,
}

impl BinaryRowSerializer {
    /// Creates a serializer for rows with `arity` fields.
    pub fn new(arity: usize) -> Self {
        Self { arity }
    }

    /// Number of fields of every row.
    pub fn arity(&self) -> usize {
        self.arity
    }
}

impl RecordSerializer<BinaryRow> for BinaryRowSerializer {
    fn serialize(&self, record: &BinaryRow, target: &mut Vec<u8>) -> Result<()> {
        if record.arity() != self.arity {
            return Err(SortError::Serialization(format!(
                "expected a row of arity {}, got {}",
                self.arity,
                record.arity()
            )));
        }
        target.extend_from_slice(record.as_bytes());
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<BinaryRow> {
        BinaryRow::try_from_bytes(self.arity, bytes.to_vec())
    }
}

/// Serializer for raw byte records.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl RecordSerializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, record: &Vec<u8>, target: &mut Vec<u8>) -> Result<()> {
        target.extend_from_slice(record);
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}
