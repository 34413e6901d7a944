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

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// The current version of Ballista sort, derived from the Cargo package version.
pub const BALLISTA_SORT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prints the current version to stdout.
pub fn print_version() {
    println!("Ballista sort version: {BALLISTA_SORT_VERSION}")
}

/// Sort buffers holding serialized records and their prefix keys.
pub mod buffer;
/// Configuration of the memory budget and spilling.
pub mod config;
/// Error types and result definitions.
pub mod error;
/// Sorting of a single in-memory buffer.
pub mod in_memory_sort;
/// Prefix key computers and record comparators.
pub mod key;
/// Memory pool of fixed-size segments.
pub mod memory;
/// K-way merge of sorted runs.
pub mod merge;
/// Operator shell feeding an external sort.
pub mod operator;
/// Binary row format and record serializers.
pub mod row;
/// The external sort pipeline.
pub mod sorter;
/// Spill channels for sorted runs.
pub mod spill;

pub use config::SortConfig;
pub use error::{Result, SortError};
pub use key::{KeyComputer, RecordComparator};
pub use memory::MemoryPool;
pub use operator::{SortMetrics, SortOperator};
pub use row::{BinaryRow, BinaryRowBuilder, RecordSerializer};
pub use sorter::{ExternalSorter, SortedRecordStream, SorterHandle, SorterState};
