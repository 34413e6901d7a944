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

//! Operator shell around [`ExternalSorter`].
//!
//! The operator owns the sorter's configuration and collaborators, builds
//! the sorter on `open`, feeds it element by element and emits the sorted
//! records to its output once the input has ended.

use std::fmt;
use std::sync::Arc;

use futures::TryStreamExt;
use log::info;

use crate::config::SortConfig;
use crate::error::{Result, sort_error};
use crate::key::{KeyComputer, RecordComparator};
use crate::row::RecordSerializer;
use crate::sorter::ExternalSorter;

/// Gauges exposed by a [`SortOperator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SortMetrics {
    /// Pool memory held by sort buffers
    pub memory_used_size_in_bytes: usize,
    /// Runs written to disk
    pub num_spill_files: usize,
    /// Bytes written to disk
    pub spill_in_bytes: u64,
}

/// Receives the sorted records of a [`SortOperator`].
pub type SortOutput<T> = Box<dyn FnMut(T) -> Result<()> + Send>;

/// Sorts all records of a bounded input and emits them in order once the
/// input has ended.
pub struct SortOperator<T> {
    config: SortConfig,
    serializer: Arc<dyn RecordSerializer<T>>,
    key_computer: Arc<dyn KeyComputer>,
    comparator: Arc<dyn RecordComparator>,
    output: SortOutput<T>,
    sorter: Option<ExternalSorter<T>>,
    input_ended: bool,
}

impl<T> fmt::Debug for SortOperator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortOperator")
            .field("config", &self.config)
            .field("sorter", &self.sorter)
            .field("input_ended", &self.input_ended)
            .finish()
    }
}

impl<T> SortOperator<T> {
    /// Creates an operator. Nothing is allocated until [`Self::open`].
    pub fn new(
        config: SortConfig,
        serializer: Arc<dyn RecordSerializer<T>>,
        key_computer: Arc<dyn KeyComputer>,
        comparator: Arc<dyn RecordComparator>,
        output: SortOutput<T>,
    ) -> Self {
        Self {
            config,
            serializer,
            key_computer,
            comparator,
            output,
            sorter: None,
            input_ended: false,
        }
    }

    /// Creates and starts the sorter.
    pub fn open(&mut self) -> Result<()> {
        info!("Opening SortOperator");
        let mut sorter = ExternalSorter::try_new(
            self.config.clone(),
            self.serializer.clone(),
            self.key_computer.clone(),
            self.comparator.clone(),
        )?;
        sorter.start()?;
        self.sorter = Some(sorter);
        Ok(())
    }

    fn sorter_mut(&mut self) -> Result<&mut ExternalSorter<T>> {
        self.sorter
            .as_mut()
            .ok_or_else(|| sort_error("SortOperator is not open"))
    }

    /// Adds one record to the sort.
    pub async fn process_element(&mut self, element: &T) -> Result<()> {
        self.sorter_mut()?.write(element).await
    }

    /// Sorts everything received so far and emits it to the output.
    pub async fn end_input(&mut self) -> Result<()> {
        if self.input_ended {
            return Ok(());
        }
        self.input_ended = true;
        let Some(sorter) = self.sorter.as_mut() else {
            return sort_error("SortOperator is not open").into();
        };
        let mut sorted = sorter.sorted_stream().await?;
        while let Some(record) = sorted.try_next().await? {
            (self.output)(record)?;
        }
        Ok(())
    }

    /// Ends the input if that has not happened yet, then releases the
    /// sorter's memory and spill files.
    pub async fn close(&mut self) -> Result<()> {
        let ended = if self.sorter.is_some() {
            self.end_input().await
        } else {
            Ok(())
        };
        info!("Closing SortOperator");
        if let Some(sorter) = self.sorter.as_mut() {
            sorter.close().await?;
        }
        ended
    }

    /// Current gauges of the underlying sorter.
    pub fn metrics(&self) -> SortMetrics {
        match &self.sorter {
            Some(sorter) => SortMetrics {
                memory_used_size_in_bytes: sorter.used_memory_bytes(),
                num_spill_files: sorter.spilled_run_count(),
                spill_in_bytes: sorter.spilled_bytes(),
            },
            None => SortMetrics::default(),
        }
    }
}
