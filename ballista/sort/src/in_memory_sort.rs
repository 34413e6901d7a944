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

//! Sorting of sealed sort buffers.

use std::sync::Arc;

use crate::buffer::SortBuffer;
use crate::error::{Result, SortError};
use crate::key::{KeyComputer, RecordComparator, compare_prefixed};

/// Sorts a sealed [`SortBuffer`] by prefix key, falling back to the record
/// comparator only when two keys are equal.
///
/// The sort is not stable.
#[derive(Clone)]
pub struct InMemorySorter {
    key_computer: Arc<dyn KeyComputer>,
    comparator: Arc<dyn RecordComparator>,
}

impl InMemorySorter {
    /// Creates a sorter from a key computer and a consistent comparator.
    pub fn new(
        key_computer: Arc<dyn KeyComputer>,
        comparator: Arc<dyn RecordComparator>,
    ) -> Self {
        Self {
            key_computer,
            comparator,
        }
    }

    /// Computes the sort permutation of `buffer` and installs it.
    pub fn sort(&self, buffer: &mut SortBuffer) -> Result<()> {
        let len = u32::try_from(buffer.len()).map_err(|_| {
            SortError::Internal(format!(
                "cannot sort {} records in one buffer",
                buffer.len()
            ))
        })?;
        let mut order: Vec<u32> = (0..len).collect();
        let fully_determined = self.key_computer.key_fully_determines();
        let comparator = self.comparator.as_ref();
        {
            let buffer = &*buffer;
            order.sort_unstable_by(|&a, &b| {
                let (a, b) = (a as usize, b as usize);
                compare_prefixed(buffer.key(a), buffer.key(b), fully_determined, || {
                    comparator.compare(&buffer.record(a), &buffer.record(b))
                })
            });
        }
        buffer.set_order(order)
    }
}
