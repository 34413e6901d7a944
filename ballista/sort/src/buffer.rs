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

//! In-memory record buffer backed by pool segments.
//!
//! Record bytes are packed back to back across the buffer's segments, so a
//! record may straddle a segment boundary. Prefix keys and record pointers
//! live in a separate index whose size is charged against the same segment
//! capacity, which keeps the pool the single source of truth for memory use.

use std::borrow::Cow;
use std::fmt;

use log::debug;

use crate::error::{Result, SortError};
use crate::key::KeyComputer;
use crate::memory::{MemoryPool, MemorySegment};

/// Bytes of index kept per record besides its key: an (offset, length) pointer
/// and one slot of the sort permutation.
pub const RECORD_INDEX_OVERHEAD: usize = 12;

#[derive(Debug, Clone, Copy)]
struct RecordPointer {
    offset: u32,
    len: u32,
}

/// A growable buffer of (prefix key, record) pairs.
///
/// The buffer grows by acquiring segments from its [`MemoryPool`] and gives
/// all of them back in one step when it is released or dropped.
pub struct SortBuffer {
    pool: MemoryPool,
    segments: Vec<MemorySegment>,
    segment_size: usize,
    /// Most segments this buffer may hold
    max_segments: usize,
    /// Segments requested per growth step
    request_segments: usize,
    key_len: usize,
    keys: Vec<u8>,
    pointers: Vec<RecordPointer>,
    /// Sort permutation, `None` while in insertion order
    order: Option<Vec<u32>>,
    data_len: usize,
    sealed: bool,
}

impl fmt::Debug for SortBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortBuffer")
            .field("records", &self.len())
            .field("segments", &self.segments.len())
            .field("max_segments", &self.max_segments)
            .field("occupancy", &self.occupancy())
            .field("sealed", &self.sealed)
            .field("sorted", &self.order.is_some())
            .finish()
    }
}

impl SortBuffer {
    /// Creates an empty buffer holding no segments yet.
    pub fn new(
        pool: MemoryPool,
        key_len: usize,
        max_segments: usize,
        request_segments: usize,
    ) -> Self {
        let segment_size = pool.segment_size();
        Self {
            pool,
            segments: Vec::new(),
            segment_size,
            max_segments: max_segments.max(1),
            request_segments: request_segments.max(1),
            key_len,
            keys: Vec::new(),
            pointers: Vec::new(),
            order: None,
            data_len: 0,
            sealed: false,
        }
    }

    /// Bytes a record of `record_len` occupies in a buffer with `key_len`
    /// byte keys.
    pub fn footprint(record_len: usize, key_len: usize) -> usize {
        record_len + key_len + RECORD_INDEX_OVERHEAD
    }

    /// Largest capacity this buffer can ever reach.
    pub fn max_capacity(&self) -> usize {
        self.max_segments * self.segment_size
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.pointers.len()
    }

    /// Returns true if the buffer holds no records.
    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }

    /// Length of the prefix keys.
    pub fn key_len(&self) -> usize {
        self.key_len
    }

    /// Bytes currently occupied by records and their index.
    pub fn occupancy(&self) -> usize {
        self.data_len + self.len() * (self.key_len + RECORD_INDEX_OVERHEAD)
    }

    /// Bytes of segment memory currently held.
    pub fn capacity(&self) -> usize {
        self.segments.len() * self.segment_size
    }

    /// Number of segments currently held.
    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    /// Whether the buffer has been handed off for sorting.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Whether a sort permutation has been applied.
    pub fn is_sorted(&self) -> bool {
        self.order.is_some()
    }

    /// Number of segments to ask the pool for on the next growth step.
    pub fn next_request(&self) -> usize {
        self.request_segments
            .min(self.max_segments.saturating_sub(self.segments.len()))
    }

    /// Hands already acquired segments to the buffer.
    pub fn add_segments(&mut self, segments: Vec<MemorySegment>) {
        self.segments.extend(segments);
    }

    /// Copies `record` and its prefix key into the buffer.
    ///
    /// Fails with [`SortError::CapacityExceeded`] when the record does not fit
    /// and the pool cannot grant another segment, or this buffer already holds
    /// its maximum number of segments.
    pub fn append(&mut self, record: &[u8], key_computer: &dyn KeyComputer) -> Result<()> {
        if self.sealed {
            return Err(SortError::Internal(
                "cannot append to a sealed sort buffer".to_owned(),
            ));
        }
        if key_computer.key_len() != self.key_len {
            return Err(SortError::Internal(format!(
                "key computer produces {} byte keys, buffer expects {}",
                key_computer.key_len(),
                self.key_len
            )));
        }

        let required = self.occupancy() + Self::footprint(record.len(), self.key_len);
        while required > self.capacity() {
            let request = self.next_request();
            if request == 0 {
                return Err(SortError::CapacityExceeded);
            }
            let granted = self.pool.try_acquire(request)?;
            if granted.is_empty() {
                return Err(SortError::CapacityExceeded);
            }
            self.segments.extend(granted);
        }

        let pointer = RecordPointer {
            offset: to_u32(self.data_len)?,
            len: to_u32(record.len())?,
        };
        self.write_at(self.data_len, record);
        self.data_len += record.len();

        let start = self.keys.len();
        self.keys.resize(start + self.key_len, 0);
        key_computer.put_key(record, &mut self.keys[start..]);
        self.pointers.push(pointer);
        Ok(())
    }

    fn write_at(&mut self, mut offset: usize, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let segment = &mut self.segments[offset / self.segment_size];
            let pos = offset % self.segment_size;
            let n = (self.segment_size - pos).min(bytes.len());
            segment[pos..pos + n].copy_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            offset += n;
        }
    }

    /// Freezes the buffer. No records can be appended afterwards.
    pub fn seal(&mut self) {
        debug!(
            "Sealing sort buffer with {} records in {} segments",
            self.len(),
            self.segments.len()
        );
        self.sealed = true;
    }

    /// Prefix key of the record at insertion index `i`.
    pub fn key(&self, i: usize) -> &[u8] {
        &self.keys[i * self.key_len..(i + 1) * self.key_len]
    }

    /// Serialized record at insertion index `i`, borrowed unless it straddles
    /// a segment boundary.
    pub fn record(&self, i: usize) -> Cow<'_, [u8]> {
        match self.contiguous_record(i) {
            Some(record) => Cow::Borrowed(record),
            None => {
                let mut out = Vec::with_capacity(self.pointers[i].len as usize);
                self.copy_record(i, &mut out);
                Cow::Owned(out)
            }
        }
    }

    /// Serialized record at insertion index `i` if it lies within one
    /// segment.
    pub fn contiguous_record(&self, i: usize) -> Option<&[u8]> {
        let RecordPointer { offset, len } = self.pointers[i];
        let (offset, len) = (offset as usize, len as usize);
        let pos = offset % self.segment_size;
        if len == 0 {
            Some(&[])
        } else if pos + len <= self.segment_size {
            Some(&self.segments[offset / self.segment_size][pos..pos + len])
        } else {
            None
        }
    }

    /// Appends the record at insertion index `i` to `out`.
    pub fn copy_record(&self, i: usize, out: &mut Vec<u8>) {
        let RecordPointer { offset, len } = self.pointers[i];
        let mut offset = offset as usize;
        let mut remaining = len as usize;
        while remaining > 0 {
            let segment = &self.segments[offset / self.segment_size];
            let pos = offset % self.segment_size;
            let n = (self.segment_size - pos).min(remaining);
            out.extend_from_slice(&segment[pos..pos + n]);
            offset += n;
            remaining -= n;
        }
    }

    /// Insertion index of the record at position `pos` of the current order.
    pub fn index_at(&self, pos: usize) -> usize {
        match &self.order {
            Some(order) => order[pos] as usize,
            None => pos,
        }
    }

    /// Installs a sort permutation. The buffer must be sealed and `order`
    /// must list every insertion index exactly once.
    pub fn set_order(&mut self, order: Vec<u32>) -> Result<()> {
        if !self.sealed {
            return Err(SortError::Internal(
                "cannot sort a buffer that is not sealed".to_owned(),
            ));
        }
        if order.len() != self.len() {
            return Err(SortError::Internal(format!(
                "sort permutation has {} entries for {} records",
                order.len(),
                self.len()
            )));
        }
        self.order = Some(order);
        Ok(())
    }

    /// Iterates (key, record) pairs in the current order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], Cow<'_, [u8]>)> + '_ {
        (0..self.len()).map(move |pos| {
            let i = self.index_at(pos);
            (self.key(i), self.record(i))
        })
    }

    /// Drops every record and returns all segments to the pool at once.
    pub fn release(&mut self) {
        self.keys = Vec::new();
        self.pointers = Vec::new();
        self.order = None;
        self.data_len = 0;
        if !self.segments.is_empty() {
            self.pool.release(std::mem::take(&mut self.segments));
        }
    }
}

impl Drop for SortBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

fn to_u32(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| {
        SortError::Internal(format!("sort buffer offset {n} does not fit in 32 bits"))
    })
}
