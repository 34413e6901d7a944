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

//! Spill channels for sorted runs.
//!
//! A channel is an Arrow IPC stream file holding `(key, record)` rows in
//! sorted order. Channels are written once, read back strictly sequentially
//! and deleted as soon as the merge has consumed them. Every channel lives in
//! a directory owned by one [`SpillManager`], which removes it on cleanup.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use arrow::array::{
    Array, ArrayRef, AsArray, BinaryArray, BinaryBuilder, LargeBinaryArray,
    LargeBinaryBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::ipc::CompressionType;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::{IpcWriteOptions, StreamWriter};
use arrow::record_batch::RecordBatch;
use log::{debug, info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::buffer::SortBuffer;
use crate::config::SortConfig;
use crate::error::{Result, SortError};

/// A sorted run persisted to a spill channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpilledRun {
    /// Channel sequence number within its manager
    pub id: usize,
    /// Location of the channel file
    pub path: PathBuf,
    /// Number of records in the run
    pub num_records: u64,
    /// Size of the channel file in bytes
    pub num_bytes: u64,
}

/// Schema of every spill channel.
pub fn spill_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Binary, false),
        Field::new("record", DataType::LargeBinary, false),
    ]))
}

/// Creates, reads and deletes the spill channels of one sort.
#[derive(Debug)]
pub struct SpillManager {
    /// Directory owned by this manager
    spill_dir: PathBuf,
    compression: Option<CompressionType>,
    /// Records per IPC batch
    batch_rows: usize,
    schema: SchemaRef,
    /// Channels that exist on disk
    channels: Mutex<HashSet<PathBuf>>,
    next_channel: AtomicUsize,
    total_spills: AtomicUsize,
    total_bytes_spilled: AtomicU64,
}

impl SpillManager {
    /// Creates a manager with a fresh, uniquely named directory under
    /// `base_dir`.
    pub fn try_new(
        base_dir: &Path,
        compression: Option<CompressionType>,
        batch_rows: usize,
    ) -> Result<Self> {
        if batch_rows == 0 {
            return Err(SortError::Configuration(
                "spill batches need at least one row".to_owned(),
            ));
        }
        let spill_dir = base_dir.join(format!("ballista-sort-{}", Uuid::new_v4()));
        fs::create_dir_all(&spill_dir).map_err(SortError::IoError)?;
        debug!("Created spill directory {spill_dir:?}");

        Ok(Self {
            spill_dir,
            compression,
            batch_rows,
            schema: spill_schema(),
            channels: Mutex::new(HashSet::new()),
            next_channel: AtomicUsize::new(0),
            total_spills: AtomicUsize::new(0),
            total_bytes_spilled: AtomicU64::new(0),
        })
    }

    /// Creates a manager for the given configuration.
    pub fn from_config(config: &SortConfig) -> Result<Self> {
        Self::try_new(
            &config.spill_dir,
            config.spill_compression,
            config.spill_batch_rows,
        )
    }

    /// Directory holding this manager's channels.
    pub fn spill_dir(&self) -> &Path {
        &self.spill_dir
    }

    /// Number of runs written so far, including merged runs.
    pub fn total_spills(&self) -> usize {
        self.total_spills.load(Ordering::Acquire)
    }

    /// Bytes written to channels so far.
    pub fn total_bytes_spilled(&self) -> u64 {
        self.total_bytes_spilled.load(Ordering::Acquire)
    }

    /// Number of channels currently on disk.
    pub fn live_channels(&self) -> usize {
        self.channels.lock().len()
    }

    /// Opens a new channel for writing.
    pub fn create_channel(&self) -> Result<ChannelWriter<'_>> {
        let id = self.next_channel.fetch_add(1, Ordering::AcqRel);
        let path = self.spill_dir.join(format!("run-{id}.arrow"));
        let file = File::create(&path).map_err(SortError::IoError)?;
        self.channels.lock().insert(path.clone());

        let options = IpcWriteOptions::default().try_with_compression(self.compression);
        let writer = options.and_then(|options| {
            StreamWriter::try_new_with_options(BufWriter::new(file), &self.schema, options)
        });
        let writer = match writer {
            Ok(writer) => writer,
            Err(e) => {
                self.discard_channel(&path);
                return Err(e.into());
            }
        };

        Ok(ChannelWriter {
            manager: self,
            id,
            path,
            writer: Some(writer),
            keys: BinaryBuilder::new(),
            records: LargeBinaryBuilder::new(),
            pending: 0,
            num_records: 0,
        })
    }

    /// Writes a sealed, sorted buffer to a new channel. The buffer keeps its
    /// segments; releasing them is up to the caller.
    pub fn spill_buffer(&self, buffer: &SortBuffer) -> Result<SpilledRun> {
        let mut channel = self.create_channel()?;
        for (key, record) in buffer.iter() {
            channel.write(key, &record)?;
        }
        let run = channel.finish()?;
        info!(
            "Spilled run {} with {} records ({} bytes) to {:?}",
            run.id, run.num_records, run.num_bytes, run.path
        );
        Ok(run)
    }

    /// Opens a finished channel for sequential reading.
    pub fn open_channel(&self, run: &SpilledRun) -> Result<ChannelReader> {
        let file = File::open(&run.path).map_err(SortError::IoError)?;
        let reader = StreamReader::try_new(BufReader::new(file), None)?;
        Ok(ChannelReader {
            path: run.path.clone(),
            reader,
        })
    }

    /// Deletes a channel. Deleting a channel that is already gone succeeds.
    pub fn delete_channel(&self, path: &Path) -> Result<()> {
        self.channels.lock().remove(path);
        match fs::remove_file(path) {
            Ok(()) => {
                debug!("Deleted spill channel {path:?}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SortError::IoError(e)),
        }
    }

    /// Deletes a channel, logging instead of returning a failure.
    fn discard_channel(&self, path: &Path) {
        if let Err(e) = self.delete_channel(path) {
            warn!("Failed to delete spill channel {path:?}: {e}");
        }
    }

    /// Deletes the channels of runs that will not be read.
    pub fn delete_runs(&self, runs: &[SpilledRun]) {
        for run in runs {
            self.discard_channel(&run.path);
        }
    }

    /// Deletes every channel and the spill directory.
    pub fn cleanup(&self) -> Result<()> {
        self.channels.lock().clear();
        if self.spill_dir.exists() {
            fs::remove_dir_all(&self.spill_dir).map_err(SortError::IoError)?;
            debug!("Removed spill directory {:?}", self.spill_dir);
        }
        Ok(())
    }
}

impl Drop for SpillManager {
    fn drop(&mut self) {
        // Best-effort cleanup on drop
        if let Err(e) = self.cleanup() {
            warn!("Failed to cleanup spill directory {:?}: {e}", self.spill_dir);
        }
    }
}

/// Writes one sorted run into a channel.
///
/// A writer dropped before [`ChannelWriter::finish`] deletes its partial
/// channel.
pub struct ChannelWriter<'a> {
    manager: &'a SpillManager,
    id: usize,
    path: PathBuf,
    writer: Option<StreamWriter<BufWriter<File>>>,
    keys: BinaryBuilder,
    records: LargeBinaryBuilder,
    pending: usize,
    num_records: u64,
}

impl ChannelWriter<'_> {
    /// Appends a record and its prefix key. Records must arrive in sorted
    /// order.
    pub fn write(&mut self, key: &[u8], record: &[u8]) -> Result<()> {
        self.keys.append_value(key);
        self.records.append_value(record);
        self.pending += 1;
        self.num_records += 1;
        if self.pending >= self.manager.batch_rows {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.pending == 0 {
            return Ok(());
        }
        let columns: Vec<ArrayRef> = vec![
            Arc::new(self.keys.finish()),
            Arc::new(self.records.finish()),
        ];
        let batch = RecordBatch::try_new(self.manager.schema.clone(), columns)?;
        self.pending = 0;
        match self.writer.as_mut() {
            Some(writer) => writer.write(&batch)?,
            None => {
                return Err(SortError::Internal(format!(
                    "spill channel {:?} is already finished",
                    self.path
                )));
            }
        }
        Ok(())
    }

    /// Flushes the channel to disk and returns the finished run.
    pub fn finish(mut self) -> Result<SpilledRun> {
        self.flush_batch()?;
        let writer = self.writer.take().ok_or_else(|| {
            SortError::Internal(format!("spill channel {:?} is already finished", self.path))
        })?;
        let num_bytes = match close_channel(writer, &self.path) {
            Ok(num_bytes) => num_bytes,
            Err(e) => {
                self.manager.discard_channel(&self.path);
                return Err(e);
            }
        };
        self.manager.total_spills.fetch_add(1, Ordering::AcqRel);
        self.manager
            .total_bytes_spilled
            .fetch_add(num_bytes, Ordering::AcqRel);

        Ok(SpilledRun {
            id: self.id,
            path: self.path.clone(),
            num_records: self.num_records,
            num_bytes,
        })
    }
}

/// Flushes a channel's writer and returns the size of the file.
fn close_channel(writer: StreamWriter<BufWriter<File>>, path: &Path) -> Result<u64> {
    let mut file = writer.into_inner()?;
    file.flush().map_err(SortError::IoError)?;
    drop(file);
    Ok(fs::metadata(path).map_err(SortError::IoError)?.len())
}

impl Drop for ChannelWriter<'_> {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            self.manager.discard_channel(&self.path);
        }
    }
}

/// Sequential reader over a finished channel.
pub struct ChannelReader {
    path: PathBuf,
    reader: StreamReader<BufReader<File>>,
}

impl ChannelReader {
    /// Location of the channel being read.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the next batch, or `None` at the end of the channel.
    pub fn next_batch(&mut self) -> Result<Option<SpilledBatch>> {
        match self.reader.next() {
            None => Ok(None),
            Some(batch) => SpilledBatch::try_new(&batch?).map(Some),
        }
    }
}

/// One batch of `(key, record)` rows read back from a channel.
#[derive(Debug, Clone)]
pub struct SpilledBatch {
    keys: BinaryArray,
    records: LargeBinaryArray,
}

impl SpilledBatch {
    fn try_new(batch: &RecordBatch) -> Result<Self> {
        let invalid = || {
            SortError::Internal(format!(
                "unexpected spill channel schema: {:?}",
                batch.schema()
            ))
        };
        if batch.num_columns() != 2 {
            return Err(invalid());
        }
        let keys = batch.column(0).as_binary_opt::<i32>().ok_or_else(invalid)?;
        let records = batch.column(1).as_binary_opt::<i64>().ok_or_else(invalid)?;
        Ok(Self {
            keys: keys.clone(),
            records: records.clone(),
        })
    }

    /// Number of rows in the batch.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if the batch has no rows.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Prefix key of row `i`.
    pub fn key(&self, i: usize) -> &[u8] {
        self.keys.value(i)
    }

    /// Serialized record of row `i`.
    pub fn record(&self, i: usize) -> &[u8] {
        self.records.value(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory_sort::InMemorySorter;
    use crate::key::{BytesComparator, BytesPrefixKeyComputer};
    use crate::memory::MemoryPool;
    use tempfile::TempDir;

    fn read_all(manager: &SpillManager, run: &SpilledRun) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut reader = manager.open_channel(run)?;
        let mut rows = Vec::new();
        while let Some(batch) = reader.next_batch()? {
            for i in 0..batch.len() {
                rows.push((batch.key(i).to_vec(), batch.record(i).to_vec()));
            }
        }
        Ok(rows)
    }

    #[test]
    fn write_and_read_channel() -> Result<()> {
        let dir = TempDir::new()?;
        for compression in [None, Some(CompressionType::LZ4_FRAME), Some(CompressionType::ZSTD)] {
            let manager = SpillManager::try_new(dir.path(), compression, 3)?;
            let mut channel = manager.create_channel()?;
            let rows: Vec<(Vec<u8>, Vec<u8>)> = (0..10u8)
                .map(|i| (vec![i], vec![i; i as usize]))
                .collect();
            for (key, record) in &rows {
                channel.write(key, record)?;
            }
            let run = channel.finish()?;

            assert_eq!(run.num_records, 10);
            assert!(run.num_bytes > 0);
            assert_eq!(manager.total_spills(), 1);
            assert_eq!(manager.total_bytes_spilled(), run.num_bytes);
            assert_eq!(read_all(&manager, &run)?, rows);

            manager.delete_channel(&run.path)?;
            assert!(!run.path.exists());
            assert_eq!(manager.live_channels(), 0);
            manager.delete_channel(&run.path)?;
        }
        Ok(())
    }

    #[test]
    fn spill_sorted_buffer() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = SpillManager::try_new(dir.path(), None, 2)?;
        let pool = MemoryPool::try_new(128, 1, 2)?;
        let key_computer = Arc::new(BytesPrefixKeyComputer::new(2));
        let mut buffer = SortBuffer::new(pool, 2, 2, 1);
        for word in ["kiwi", "banana", "cherry", "apple", "date"] {
            buffer.append(word.as_bytes(), key_computer.as_ref())?;
        }
        buffer.seal();
        InMemorySorter::new(key_computer, Arc::new(BytesComparator)).sort(&mut buffer)?;

        let run = manager.spill_buffer(&buffer)?;
        let records: Vec<_> = read_all(&manager, &run)?
            .into_iter()
            .map(|(_, record)| String::from_utf8(record).unwrap())
            .collect();
        assert_eq!(records, vec!["apple", "banana", "cherry", "date", "kiwi"]);
        Ok(())
    }

    #[test]
    fn unfinished_channel_is_deleted() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = SpillManager::try_new(dir.path(), None, 16)?;
        let path = {
            let mut channel = manager.create_channel()?;
            channel.write(b"k", b"v")?;
            assert_eq!(manager.live_channels(), 1);
            channel.path.clone()
        };
        assert!(!path.exists());
        assert_eq!(manager.live_channels(), 0);
        assert_eq!(manager.total_spills(), 0);
        Ok(())
    }

    #[test]
    fn failed_finish_forgets_channel() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = SpillManager::try_new(dir.path(), None, 16)?;
        let mut channel = manager.create_channel()?;
        channel.write(b"k", b"v")?;
        // the open file survives, but its size can no longer be read back
        fs::remove_file(&channel.path)?;
        assert!(channel.finish().is_err());
        assert_eq!(manager.live_channels(), 0);
        assert_eq!(manager.total_spills(), 0);
        Ok(())
    }

    #[test]
    fn delete_runs_removes_channels() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = SpillManager::try_new(dir.path(), None, 16)?;
        let runs = (0..3)
            .map(|_| {
                let mut channel = manager.create_channel()?;
                channel.write(b"k", b"v")?;
                channel.finish()
            })
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(manager.live_channels(), 3);

        manager.delete_runs(&runs);
        assert_eq!(manager.live_channels(), 0);
        assert!(runs.iter().all(|run| !run.path.exists()));
        // deleting again is harmless
        manager.delete_runs(&runs);
        Ok(())
    }

    #[test]
    fn cleanup_removes_directory() -> Result<()> {
        let dir = TempDir::new()?;
        let spill_dir = {
            let manager = SpillManager::try_new(dir.path(), None, 16)?;
            let channel = manager.create_channel()?;
            channel.finish()?;
            assert!(manager.spill_dir().exists());
            manager.cleanup()?;
            assert!(!manager.spill_dir().exists());
            assert!(manager.create_channel().is_err());
            manager.spill_dir().to_path_buf()
        };
        assert!(!spill_dir.exists());

        let spill_dir = {
            let manager = SpillManager::try_new(dir.path(), None, 16)?;
            manager.create_channel()?.finish()?;
            manager.spill_dir().to_path_buf()
        };
        assert!(!spill_dir.exists());
        Ok(())
    }
}
