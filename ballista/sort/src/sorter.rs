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

//! The external sort pipeline.
//!
//! [`ExternalSorter`] runs three stages:
//!
//! 1. ingest: [`ExternalSorter::write`] serializes records into the current
//!    [`SortBuffer`], waiting on the [`MemoryPool`] when it is exhausted;
//! 2. sort and spill: a background task receives sealed buffers over a
//!    bounded channel, sorts them and spills every buffer except the last
//!    one, which stays resident for the final merge;
//! 3. merge: [`SortedRecordStream`] pulls records out of a [`MergeIterator`]
//!    over the spilled runs and the resident buffer.
//!
//! The pool is the only state the stages share. Sealed buffers change owner
//! when they are sent to the sort stage.

use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::buffer::SortBuffer;
use crate::config::SortConfig;
use crate::error::{Result, SortError, sort_error};
use crate::in_memory_sort::InMemorySorter;
use crate::key::{KeyComputer, RecordComparator};
use crate::memory::MemoryPool;
use crate::merge::{
    MergeIterator, ResidentRunCursor, RunCursor, SpilledRunCursor, reduce_fan_in,
};
use crate::row::RecordSerializer;
use crate::spill::{SpillManager, SpilledRun};

/// Lifecycle of an [`ExternalSorter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SorterState {
    /// Created, background stages not started
    Idle,
    /// Accepting records
    Running,
    /// Input ended, sorted output not yet fully consumed
    Draining,
    /// Sorted output fully consumed
    Finished,
    /// A fatal error occurred
    Failed,
    /// Resources released by `close`
    Closed,
}

#[derive(Debug)]
struct SorterShared {
    state: Mutex<SorterState>,
    stopped: AtomicBool,
    stop_notify: Notify,
}

impl SorterShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(SorterState::Idle),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }

    fn state(&self) -> SorterState {
        *self.state.lock()
    }

    fn set_state(&self, state: SorterState) {
        *self.state.lock() = state;
    }

    /// Moves from `from` to `to`, returning false if in another state.
    fn transition(&self, from: SorterState, to: SorterState) -> bool {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn fail(&self, error: &SortError) {
        if matches!(error, SortError::Cancelled) {
            return;
        }
        let mut state = self.state.lock();
        if *state != SorterState::Closed {
            *state = SorterState::Failed;
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.stop_notify.notify_waiters();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    async fn stopped(&self) {
        loop {
            let notified = self.stop_notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// Requests cancellation of a running sort from outside.
#[derive(Debug, Clone)]
pub struct SorterHandle {
    shared: Arc<SorterShared>,
}

impl SorterHandle {
    /// Stops every stage. Pending and later calls fail with
    /// [`SortError::Cancelled`], and each stage drops its buffers and spill
    /// channels as it unwinds. `close` still moves the sorter to `Closed`.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Current state of the sorter.
    pub fn state(&self) -> SorterState {
        self.shared.state()
    }
}

/// A sealed buffer handed to the sort stage.
struct SealedBuffer {
    buffer: SortBuffer,
    /// Last buffer of the input, kept resident instead of spilled
    last: bool,
}

/// Output of the sort stage: the runs the final merge reads.
struct SortedRuns {
    spilled: Vec<SpilledRun>,
    resident: Option<SortBuffer>,
}

#[derive(Clone)]
struct SortStage {
    sorter: InMemorySorter,
    spill_manager: Arc<SpillManager>,
    comparator: Arc<dyn RecordComparator>,
    key_fully_determines: bool,
    max_fan_in: usize,
    shared: Arc<SorterShared>,
}

impl SortStage {
    async fn run(self, receiver: mpsc::Receiver<SealedBuffer>) -> Result<SortedRuns> {
        let shared = self.shared.clone();
        let result = self.sort_all(receiver).await;
        if let Err(e) = &result {
            if !matches!(e, SortError::Cancelled) {
                warn!("External sort stage failed: {e}");
            }
            shared.fail(e);
        }
        result
    }

    async fn sort_all(self, receiver: mpsc::Receiver<SealedBuffer>) -> Result<SortedRuns> {
        let mut runs = SortedRuns {
            spilled: Vec::new(),
            resident: None,
        };
        match self.sort_into(receiver, &mut runs).await {
            Ok(()) => Ok(runs),
            Err(e) => {
                // the resident buffer goes back to the pool with `runs`
                self.spill_manager.delete_runs(&runs.spilled);
                Err(e)
            }
        }
    }

    async fn sort_into(
        &self,
        mut receiver: mpsc::Receiver<SealedBuffer>,
        runs: &mut SortedRuns,
    ) -> Result<()> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shared.stopped() => return Err(SortError::Cancelled),
                next = receiver.recv() => next,
            };
            let Some(SealedBuffer { mut buffer, last }) = next else {
                break;
            };
            let stage = self.clone();
            let (run, kept) = tokio::task::spawn_blocking(
                move || -> Result<(Option<SpilledRun>, Option<SortBuffer>)> {
                    stage.sorter.sort(&mut buffer)?;
                    if last {
                        return Ok((None, Some(buffer)));
                    }
                    let run = stage.spill_manager.spill_buffer(&buffer)?;
                    Ok((Some(run), None))
                },
            )
            .await??;
            runs.spilled.extend(run);
            if kept.is_some() {
                runs.resident = kept;
            }
        }
        drop(receiver);

        if self.shared.is_stopped() {
            return Err(SortError::Cancelled);
        }

        let resident_runs = usize::from(runs.resident.is_some());
        if runs.spilled.len() + resident_runs > self.max_fan_in {
            let stage = self.clone();
            let spilled = std::mem::take(&mut runs.spilled);
            runs.spilled = tokio::task::spawn_blocking(move || {
                reduce_fan_in(
                    &stage.spill_manager,
                    spilled,
                    resident_runs,
                    stage.max_fan_in,
                    stage.comparator.clone(),
                    stage.key_fully_determines,
                    || stage.shared.is_stopped(),
                )
            })
            .await??;
        }
        Ok(())
    }
}

/// Memory bounded sort of records of type `T`, spilling sorted runs to disk
/// when the memory budget is exhausted.
///
/// ```text
/// let mut sorter = ExternalSorter::try_new(config, serializer, keys, comparator)?;
/// sorter.start()?;
/// for record in input {
///     sorter.write(&record).await?;
/// }
/// sorter.end_input().await?;
/// let sorted = sorter.sorted_stream().await?;
/// // consume `sorted`
/// sorter.close().await?;
/// ```
pub struct ExternalSorter<T> {
    config: SortConfig,
    pool: MemoryPool,
    spill_manager: Arc<SpillManager>,
    serializer: Arc<dyn RecordSerializer<T>>,
    key_computer: Arc<dyn KeyComputer>,
    comparator: Arc<dyn RecordComparator>,
    shared: Arc<SorterShared>,
    /// Buffer being filled by ingest
    current: Option<SortBuffer>,
    sender: Option<mpsc::Sender<SealedBuffer>>,
    sort_task: Option<JoinHandle<Result<SortedRuns>>>,
    merger: Arc<Mutex<Option<MergeIterator>>>,
    scratch: Vec<u8>,
    records_written: u64,
}

impl<T> fmt::Debug for ExternalSorter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalSorter")
            .field("state", &self.state())
            .field("pool", &self.pool)
            .field("spill_dir", &self.spill_manager.spill_dir())
            .field("records_written", &self.records_written)
            .finish()
    }
}

impl<T> ExternalSorter<T> {
    /// Validates the configuration and creates the memory pool and spill
    /// directory.
    pub fn try_new(
        config: SortConfig,
        serializer: Arc<dyn RecordSerializer<T>>,
        key_computer: Arc<dyn KeyComputer>,
        comparator: Arc<dyn RecordComparator>,
    ) -> Result<Self> {
        config.validate()?;
        let max_record = config.max_buffer_segments() * config.segment_size;
        if SortBuffer::footprint(0, key_computer.key_len()) > max_record {
            return Err(SortError::Configuration(format!(
                "prefix keys of {} bytes do not fit into a sort buffer of {max_record} bytes",
                key_computer.key_len()
            )));
        }
        let pool = MemoryPool::from_config(&config)?;
        let spill_manager = Arc::new(SpillManager::from_config(&config)?);

        Ok(Self {
            config,
            pool,
            spill_manager,
            serializer,
            key_computer,
            comparator,
            shared: Arc::new(SorterShared::new()),
            current: None,
            sender: None,
            sort_task: None,
            merger: Arc::new(Mutex::new(None)),
            scratch: Vec::new(),
            records_written: 0,
        })
    }

    /// Starts the background sort stage. Must be called from within a tokio
    /// runtime.
    pub fn start(&mut self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|e| {
            SortError::General(format!("external sort needs a tokio runtime: {e}"))
        })?;
        if !self.shared.transition(SorterState::Idle, SorterState::Running) {
            return Err(SortError::General(format!(
                "cannot start an external sort in state {:?}",
                self.state()
            )));
        }

        let (sender, receiver) = mpsc::channel(self.config.num_sort_buffers);
        let stage = SortStage {
            sorter: InMemorySorter::new(self.key_computer.clone(), self.comparator.clone()),
            spill_manager: self.spill_manager.clone(),
            comparator: self.comparator.clone(),
            key_fully_determines: self.key_computer.key_fully_determines(),
            max_fan_in: self.config.max_fan_in,
            shared: self.shared.clone(),
        };
        self.sort_task = Some(runtime.spawn(stage.run(receiver)));
        self.sender = Some(sender);

        info!(
            "Started external sort with {} bytes of memory ({} reserved) spilling to {:?}",
            self.config.max_memory,
            self.config.reserved_memory,
            self.spill_manager.spill_dir()
        );
        Ok(())
    }

    fn check_running(&mut self) -> Result<()> {
        if self.shared.is_stopped() {
            return self.fail(SortError::Cancelled);
        }
        match self.state() {
            SorterState::Running => Ok(()),
            SorterState::Failed => Err(sort_error("external sort has already failed")),
            state => Err(SortError::General(format!(
                "external sort does not accept input in state {state:?}"
            ))),
        }
    }

    fn fail<R>(&mut self, error: SortError) -> Result<R> {
        if matches!(error, SortError::Cancelled) {
            self.release_input();
        }
        self.shared.fail(&error);
        Err(error)
    }

    /// Drops the buffer being filled and the sort stage's input, which lets
    /// the sort stage run to its end.
    fn release_input(&mut self) {
        self.current = None;
        self.sender = None;
    }

    /// Waits for the sort stage and drops whatever runs it produced.
    async fn discard_sort_stage(&mut self) {
        let Some(task) = self.sort_task.take() else {
            return;
        };
        match task.await {
            Ok(Ok(runs)) => self.spill_manager.delete_runs(&runs.spilled),
            Ok(Err(SortError::Cancelled)) => {}
            Ok(Err(e)) => debug!("Sort stage had failed before it was discarded: {e}"),
            Err(e) => warn!("Sort stage did not finish cleanly: {e}"),
        }
    }

    /// Adds a record to the sort. Waits while the memory pool is exhausted.
    pub async fn write(&mut self, record: &T) -> Result<()> {
        self.check_running()?;

        self.scratch.clear();
        if let Err(e) = self.serializer.serialize(record, &mut self.scratch) {
            return self.fail(e);
        }
        let key_len = self.key_computer.key_len();
        let max_bytes = self.config.max_buffer_segments() * self.config.segment_size;
        let footprint = SortBuffer::footprint(self.scratch.len(), key_len);
        if footprint > max_bytes {
            return self.fail(SortError::Configuration(format!(
                "record of {} bytes exceeds the sort buffer capacity of {max_bytes} bytes",
                self.scratch.len()
            )));
        }

        loop {
            let buffer = self.current.get_or_insert_with(|| {
                SortBuffer::new(
                    self.pool.clone(),
                    key_len,
                    self.config.max_buffer_segments(),
                    self.config.per_request_segments(),
                )
            });
            let exhausted_empty = match buffer.append(&self.scratch, self.key_computer.as_ref()) {
                Ok(()) => {
                    self.records_written += 1;
                    return Ok(());
                }
                Err(SortError::CapacityExceeded) => buffer.is_empty(),
                Err(e) => return self.fail(e),
            };

            if exhausted_empty {
                // nothing to hand off, wait for the sort stage to free memory
                let request = buffer.next_request().max(1);
                let segments = tokio::select! {
                    segments = self.pool.acquire(request) => segments,
                    _ = self.shared.stopped() => Err(SortError::Cancelled),
                };
                match segments {
                    Ok(segments) => buffer.add_segments(segments),
                    Err(e) => return self.fail(e),
                }
            } else {
                self.send_current(false).await?;
            }
        }
    }

    /// Seals the current buffer and hands it to the sort stage.
    async fn send_current(&mut self, last: bool) -> Result<()> {
        let Some(mut buffer) = self.current.take() else {
            return Ok(());
        };
        if buffer.is_empty() {
            return Ok(());
        }
        buffer.seal();
        let Some(sender) = self.sender.as_ref() else {
            return self.fail(SortError::Internal(
                "sort stage input is already closed".to_owned(),
            ));
        };
        if sender.send(SealedBuffer { buffer, last }).await.is_err() {
            let error = self.sort_stage_error().await;
            return self.fail(error);
        }
        Ok(())
    }

    /// Error of a sort stage that stopped before its input ended.
    async fn sort_stage_error(&mut self) -> SortError {
        match self.sort_task.take() {
            Some(task) => match task.await {
                Ok(Err(e)) => e,
                Ok(Ok(_)) => SortError::Internal("sort stage ended before its input".to_owned()),
                Err(e) => SortError::TokioError(e),
            },
            None => sort_error("external sort has already failed"),
        }
    }

    /// Signals the end of input. The last buffer is sorted but not spilled.
    pub async fn end_input(&mut self) -> Result<()> {
        self.check_running()?;
        self.shared.set_state(SorterState::Draining);
        self.send_current(true).await?;
        self.sender = None;
        debug!(
            "End of input after {} records, {} runs spilled so far",
            self.records_written,
            self.spilled_run_count()
        );
        Ok(())
    }

    /// Waits for the sort stage and returns the sorted records. Ends the
    /// input first if that has not happened yet. Can only be called once.
    pub async fn sorted_stream(&mut self) -> Result<SortedRecordStream<T>> {
        if self.state() == SorterState::Running {
            self.end_input().await?;
        }
        if self.shared.is_stopped() {
            self.release_input();
            self.discard_sort_stage().await;
            return Err(SortError::Cancelled);
        }
        if self.state() != SorterState::Draining {
            return Err(SortError::General(format!(
                "sorted output is not available in state {:?}",
                self.state()
            )));
        }

        let runs = match self.sort_task.take() {
            Some(task) => match task.await {
                Ok(Ok(runs)) => runs,
                Ok(Err(e)) => return self.fail(e),
                Err(e) => return self.fail(SortError::TokioError(e)),
            },
            None => {
                return self.fail(SortError::General(
                    "sorted output has already been requested".to_owned(),
                ));
            }
        };

        info!(
            "Merging {} spilled runs ({} bytes) and {} resident run(s) of {} records",
            runs.spilled.len(),
            self.spilled_bytes(),
            usize::from(runs.resident.is_some()),
            self.records_written
        );

        let mut cursors: Vec<Box<dyn RunCursor>> = Vec::with_capacity(runs.spilled.len() + 1);
        for run in runs.spilled {
            match SpilledRunCursor::try_new(self.spill_manager.clone(), run) {
                Ok(cursor) => cursors.push(Box::new(cursor)),
                Err(e) => return self.fail(e),
            }
        }
        if let Some(buffer) = runs.resident {
            cursors.push(Box::new(ResidentRunCursor::new(buffer)));
        }
        let merger = MergeIterator::new(
            cursors,
            self.comparator.clone(),
            self.key_computer.key_fully_determines(),
        );
        *self.merger.lock() = Some(merger);

        Ok(SortedRecordStream {
            merger: self.merger.clone(),
            serializer: self.serializer.clone(),
            shared: self.shared.clone(),
            done: false,
        })
    }

    /// Releases every segment and deletes every spill channel. Valid in any
    /// state; a failed sort stays `Failed`, otherwise the sorter is `Closed`.
    pub async fn close(&mut self) -> Result<()> {
        self.shared.stop();
        self.release_input();
        self.discard_sort_stage().await;
        self.merger.lock().take();

        let cleanup = self.spill_manager.cleanup();
        {
            let mut state = self.shared.state.lock();
            if *state != SorterState::Failed {
                *state = SorterState::Closed;
            }
        }
        info!(
            "Closed external sort after {} records: {} runs spilled ({} bytes), peak memory {} bytes",
            self.records_written,
            self.spilled_run_count(),
            self.spilled_bytes(),
            self.pool.peak_memory_bytes()
        );
        cleanup
    }

    /// Bytes of pool memory currently held by sort buffers.
    pub fn used_memory_bytes(&self) -> usize {
        self.pool.used_memory_bytes()
    }

    /// Number of runs spilled so far, including runs written by
    /// intermediate merges.
    pub fn spilled_run_count(&self) -> usize {
        self.spill_manager.total_spills()
    }

    /// Bytes spilled so far.
    pub fn spilled_bytes(&self) -> u64 {
        self.spill_manager.total_bytes_spilled()
    }

    /// Number of records written.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Current state.
    pub fn state(&self) -> SorterState {
        self.shared.state()
    }

    /// Handle to cancel the sort from another task.
    pub fn handle(&self) -> SorterHandle {
        SorterHandle {
            shared: self.shared.clone(),
        }
    }

    /// The memory pool of this sort.
    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// Directory holding this sort's spill channels.
    pub fn spill_dir(&self) -> &Path {
        self.spill_manager.spill_dir()
    }

    /// Number of spill channels currently on disk.
    pub fn live_spill_channels(&self) -> usize {
        self.spill_manager.live_channels()
    }
}

impl<T> Drop for ExternalSorter<T> {
    fn drop(&mut self) {
        // unblock the sort stage, the spill directory goes with the last
        // reference to the spill manager
        self.shared.stop();
    }
}

/// The sorted output of an [`ExternalSorter`].
///
/// Records are deserialized one at a time as they are pulled. Reading a
/// spilled run happens synchronously inside `poll_next`.
pub struct SortedRecordStream<T> {
    merger: Arc<Mutex<Option<MergeIterator>>>,
    serializer: Arc<dyn RecordSerializer<T>>,
    shared: Arc<SorterShared>,
    done: bool,
}

impl<T> SortedRecordStream<T> {
    fn next_record(&mut self) -> Option<Result<T>> {
        if self.done {
            return None;
        }
        if self.shared.is_stopped() {
            self.done = true;
            // dropping the merger releases the resident run and the channels
            self.merger.lock().take();
            return Some(Err(SortError::Cancelled));
        }

        let mut guard = self.merger.lock();
        let Some(merger) = guard.as_mut() else {
            self.done = true;
            return Some(Err(SortError::Cancelled));
        };
        match merger.advance() {
            Ok(true) => {
                let record = self.serializer.deserialize(merger.record());
                if let Err(e) = &record {
                    self.done = true;
                    self.shared.fail(e);
                }
                Some(record)
            }
            Ok(false) => {
                guard.take();
                self.done = true;
                self.shared
                    .transition(SorterState::Draining, SorterState::Finished);
                None
            }
            Err(e) => {
                self.done = true;
                self.shared.fail(&e);
                Some(Err(e))
            }
        }
    }
}

impl<T> Stream for SortedRecordStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.get_mut().next_record())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{
        BytesComparator, BytesPrefixKeyComputer, SortField, SortFieldComparator,
        SortFieldKeyComputer,
    };
    use crate::row::{BinaryRow, BinaryRowBuilder, BinaryRowSerializer, BytesSerializer};
    use futures::TryStreamExt;
    use tempfile::TempDir;

    fn bytes_sorter(config: SortConfig) -> Result<ExternalSorter<Vec<u8>>> {
        ExternalSorter::try_new(
            config,
            Arc::new(BytesSerializer),
            Arc::new(BytesPrefixKeyComputer::new(4)),
            Arc::new(BytesComparator),
        )
    }

    fn small_config(dir: &TempDir) -> SortConfig {
        SortConfig::new(1024, 4096, 1024)
            .with_segment_size(1024)
            .with_num_sort_buffers(1)
            .with_spill_dir(dir.path())
    }

    #[tokio::test]
    async fn sorts_without_spilling() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sorter = bytes_sorter(small_config(&dir))?;
        assert_eq!(sorter.state(), SorterState::Idle);
        sorter.start()?;
        assert_eq!(sorter.state(), SorterState::Running);

        for word in ["delta", "alpha", "charlie", "bravo"] {
            sorter.write(&word.as_bytes().to_vec()).await?;
        }
        sorter.end_input().await?;
        assert_eq!(sorter.state(), SorterState::Draining);

        let sorted: Vec<Vec<u8>> = sorter.sorted_stream().await?.try_collect().await?;
        assert_eq!(
            sorted,
            vec![b"alpha".to_vec(), b"bravo".to_vec(), b"charlie".to_vec(), b"delta".to_vec()]
        );
        assert_eq!(sorter.state(), SorterState::Finished);
        assert_eq!(sorter.spilled_run_count(), 0);
        assert_eq!(sorter.used_memory_bytes(), 0);

        sorter.close().await?;
        assert_eq!(sorter.state(), SorterState::Closed);
        assert!(!sorter.spill_dir().exists());
        Ok(())
    }

    #[tokio::test]
    async fn spills_when_memory_runs_out() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sorter = bytes_sorter(small_config(&dir))?;
        sorter.start()?;

        let mut expected = Vec::new();
        for i in (0..500u32).rev() {
            let record = format!("record-{:05}", i * 7919 % 500).into_bytes();
            expected.push(record.clone());
            sorter.write(&record).await?;
            assert!(sorter.used_memory_bytes() <= 4096);
        }
        expected.sort();

        let sorted: Vec<Vec<u8>> = sorter.sorted_stream().await?.try_collect().await?;
        assert_eq!(sorted, expected);
        assert!(sorter.spilled_run_count() > 0);
        assert!(sorter.spilled_bytes() > 0);
        assert_eq!(sorter.live_spill_channels(), 0);
        assert!(sorter.pool().peak_memory_bytes() <= 4096);
        sorter.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn empty_input_yields_empty_output() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sorter = bytes_sorter(small_config(&dir))?;
        sorter.start()?;
        sorter.end_input().await?;
        let sorted: Vec<Vec<u8>> = sorter.sorted_stream().await?.try_collect().await?;
        assert!(sorted.is_empty());
        assert_eq!(sorter.state(), SorterState::Finished);
        sorter.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn stop_cancels_pending_work() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sorter = bytes_sorter(small_config(&dir))?;
        sorter.start()?;
        for i in 0..100u32 {
            sorter.write(&i.to_be_bytes().to_vec()).await?;
        }
        let handle = sorter.handle();
        handle.stop();
        assert!(handle.is_stopped());
        assert!(matches!(
            sorter.write(&b"late".to_vec()).await,
            Err(SortError::Cancelled)
        ));

        sorter.close().await?;
        assert_eq!(sorter.state(), SorterState::Closed);
        assert_eq!(sorter.pool().outstanding_segments(), 0);
        assert!(!sorter.spill_dir().exists());
        Ok(())
    }

    /// Waits for the background stage to give back its memory and channels.
    async fn wait_released(sorter: &ExternalSorter<Vec<u8>>) {
        for _ in 0..200 {
            if sorter.pool().outstanding_segments() == 0 && sorter.live_spill_channels() == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn stop_releases_resources_before_close() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sorter = bytes_sorter(small_config(&dir))?;
        sorter.start()?;
        for i in 0..400u32 {
            sorter.write(&format!("record-{:05}", i * 7919 % 400).into_bytes()).await?;
        }
        assert!(sorter.live_spill_channels() > 0 || sorter.spilled_run_count() > 0);

        sorter.handle().stop();
        assert!(matches!(
            sorter.write(&b"late".to_vec()).await,
            Err(SortError::Cancelled)
        ));
        wait_released(&sorter).await;
        assert_eq!(sorter.pool().outstanding_segments(), 0);
        assert_eq!(sorter.live_spill_channels(), 0);
        assert_ne!(sorter.state(), SorterState::Failed);

        assert!(matches!(sorter.sorted_stream().await, Err(SortError::Cancelled)));
        sorter.close().await?;
        assert_eq!(sorter.state(), SorterState::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn stop_while_streaming_drops_the_merge() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sorter = bytes_sorter(small_config(&dir))?;
        sorter.start()?;
        for i in 0..300u32 {
            sorter.write(&format!("{:08}", (i * 37) % 300).into_bytes()).await?;
        }
        let mut stream = sorter.sorted_stream().await?;
        assert_eq!(stream.try_next().await?, Some(b"00000000".to_vec()));
        assert!(sorter.live_spill_channels() > 0);

        sorter.handle().stop();
        assert!(matches!(stream.try_next().await, Err(SortError::Cancelled)));
        assert_eq!(sorter.pool().outstanding_segments(), 0);
        assert_eq!(sorter.live_spill_channels(), 0);
        assert_eq!(sorter.state(), SorterState::Draining);
        assert_eq!(stream.try_next().await?, None);

        sorter.close().await?;
        assert_eq!(sorter.state(), SorterState::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn close_while_streaming_releases_everything() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sorter = bytes_sorter(small_config(&dir))?;
        sorter.start()?;
        for i in 0..300u32 {
            sorter.write(&format!("{:08}", (i * 37) % 300).into_bytes()).await?;
        }
        let mut stream = sorter.sorted_stream().await?;
        let first = stream.try_next().await?;
        assert_eq!(first, Some(b"00000000".to_vec()));

        sorter.close().await?;
        assert!(matches!(stream.try_next().await, Err(SortError::Cancelled)));
        assert_eq!(sorter.pool().outstanding_segments(), 0);
        assert_eq!(sorter.live_spill_channels(), 0);
        assert!(!sorter.spill_dir().exists());
        Ok(())
    }

    #[tokio::test]
    async fn writes_require_a_running_sorter() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sorter = bytes_sorter(small_config(&dir))?;
        assert!(sorter.write(&b"x".to_vec()).await.is_err());
        sorter.start()?;
        assert!(sorter.start().is_err());
        sorter.end_input().await?;
        assert!(sorter.write(&b"x".to_vec()).await.is_err());
        sorter.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn sorts_binary_rows_by_column() -> Result<()> {
        let dir = TempDir::new()?;
        let fields = vec![SortField::int64(1).descending()];
        let mut sorter: ExternalSorter<BinaryRow> = ExternalSorter::try_new(
            small_config(&dir),
            Arc::new(BinaryRowSerializer::new(2)),
            Arc::new(SortFieldKeyComputer::try_new(2, fields.clone())?),
            Arc::new(SortFieldComparator::try_new(2, fields)?),
        )?;
        sorter.start()?;
        for (name, score) in [("x", 3), ("y", 10), ("z", -1)] {
            let row = BinaryRowBuilder::new(2).push_str(name).push_i64(score).build();
            sorter.write(&row).await?;
        }
        let rows: Vec<BinaryRow> = sorter.sorted_stream().await?.try_collect().await?;
        let names: Vec<_> = rows.iter().filter_map(|r| r.get_str(0)).collect();
        assert_eq!(names, vec!["y", "x", "z"]);
        sorter.close().await?;
        Ok(())
    }

    #[test]
    fn start_needs_a_runtime() -> Result<()> {
        let dir = TempDir::new()?;
        let mut sorter = bytes_sorter(small_config(&dir))?;
        assert!(sorter.start().is_err());
        assert_eq!(sorter.state(), SorterState::Idle);
        Ok(())
    }
}
