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

//! K-way merge of sorted runs.
//!
//! Runs are either a sorted [`SortBuffer`] still resident in memory or a
//! [`SpilledRun`] read back batch by batch. A loser tree picks the smallest
//! head among `k` runs with `log2(k)` comparisons per record. When there
//! are more runs than the merge fan-in, [`reduce_fan_in`] first merges the
//! oldest spilled runs into new ones.

use std::cmp::Ordering;
use std::sync::Arc;

use log::{info, warn};

use crate::buffer::SortBuffer;
use crate::error::{Result, SortError};
use crate::key::{RecordComparator, compare_prefixed};
use crate::spill::{ChannelReader, SpillManager, SpilledBatch, SpilledRun};

/// Forward-only cursor over a sorted sequence of records.
///
/// A new cursor is positioned before its first record; `key` and `record`
/// are only meaningful after `advance` returned `true`.
pub trait RunCursor: Send {
    /// Moves to the next record, returning `false` once exhausted.
    fn advance(&mut self) -> Result<bool>;

    /// Prefix key of the current record.
    fn key(&self) -> &[u8];

    /// Serialized current record.
    fn record(&self) -> &[u8];
}

/// Cursor over a sorted, memory resident buffer. The buffer's segments go
/// back to the pool as soon as the cursor is exhausted.
pub struct ResidentRunCursor {
    buffer: SortBuffer,
    next_pos: usize,
    current: Option<usize>,
    /// Holds the current record when it straddles segments
    scratch: Vec<u8>,
    straddles: bool,
}

impl ResidentRunCursor {
    /// Creates a cursor over a sealed and sorted buffer.
    pub fn new(buffer: SortBuffer) -> Self {
        Self {
            buffer,
            next_pos: 0,
            current: None,
            scratch: Vec::new(),
            straddles: false,
        }
    }
}

impl RunCursor for ResidentRunCursor {
    fn advance(&mut self) -> Result<bool> {
        if self.next_pos >= self.buffer.len() {
            self.current = None;
            self.buffer.release();
            return Ok(false);
        }
        let i = self.buffer.index_at(self.next_pos);
        self.next_pos += 1;
        self.current = Some(i);
        self.straddles = self.buffer.contiguous_record(i).is_none();
        if self.straddles {
            self.scratch.clear();
            self.buffer.copy_record(i, &mut self.scratch);
        }
        Ok(true)
    }

    fn key(&self) -> &[u8] {
        match self.current {
            Some(i) => self.buffer.key(i),
            None => &[],
        }
    }

    fn record(&self) -> &[u8] {
        match self.current {
            Some(_) if self.straddles => &self.scratch,
            Some(i) => self.buffer.contiguous_record(i).unwrap_or(&[]),
            None => &[],
        }
    }
}

/// Cursor over a spilled run. Holds one batch at a time and deletes the
/// channel once it has been read to the end or the cursor is dropped.
pub struct SpilledRunCursor {
    manager: Arc<SpillManager>,
    run: SpilledRun,
    reader: Option<ChannelReader>,
    batch: Option<SpilledBatch>,
    row: usize,
    next_row: usize,
}

impl SpilledRunCursor {
    /// Opens the run's channel for reading.
    pub fn try_new(manager: Arc<SpillManager>, run: SpilledRun) -> Result<Self> {
        let reader = manager.open_channel(&run)?;
        Ok(Self {
            manager,
            run,
            reader: Some(reader),
            batch: None,
            row: 0,
            next_row: 0,
        })
    }
}

impl RunCursor for SpilledRunCursor {
    fn advance(&mut self) -> Result<bool> {
        loop {
            if let Some(batch) = &self.batch {
                if self.next_row < batch.len() {
                    self.row = self.next_row;
                    self.next_row += 1;
                    return Ok(true);
                }
            }
            let Some(reader) = self.reader.as_mut() else {
                return Ok(false);
            };
            match reader.next_batch()? {
                Some(batch) => {
                    self.batch = Some(batch);
                    self.next_row = 0;
                }
                None => {
                    self.reader = None;
                    self.batch = None;
                    self.manager.delete_channel(&self.run.path)?;
                    return Ok(false);
                }
            }
        }
    }

    fn key(&self) -> &[u8] {
        self.batch.as_ref().map_or(&[][..], |b| b.key(self.row))
    }

    fn record(&self) -> &[u8] {
        self.batch.as_ref().map_or(&[][..], |b| b.record(self.row))
    }
}

impl Drop for SpilledRunCursor {
    fn drop(&mut self) {
        if self.reader.take().is_some() {
            if let Err(e) = self.manager.delete_channel(&self.run.path) {
                warn!("Failed to delete spill channel {:?}: {e}", self.run.path);
            }
        }
    }
}

/// Merges any number of sorted cursors into one sorted sequence.
///
/// Equal records are emitted in cursor order. The iterator is itself a
/// [`RunCursor`] and can only be consumed once.
pub struct MergeIterator {
    cursors: Vec<Box<dyn RunCursor>>,
    exhausted: Vec<bool>,
    /// `tree[0]` is the current winner, `tree[1..k]` the losers of each match
    tree: Vec<usize>,
    comparator: Arc<dyn RecordComparator>,
    key_fully_determines: bool,
    initialized: bool,
}

impl MergeIterator {
    /// Creates a merge over `cursors`, none of which has been advanced yet.
    pub fn new(
        cursors: Vec<Box<dyn RunCursor>>,
        comparator: Arc<dyn RecordComparator>,
        key_fully_determines: bool,
    ) -> Self {
        let k = cursors.len();
        Self {
            cursors,
            exhausted: vec![false; k],
            tree: vec![0; k.max(1)],
            comparator,
            key_fully_determines,
            initialized: false,
        }
    }

    /// Number of runs being merged.
    pub fn num_runs(&self) -> usize {
        self.cursors.len()
    }

    /// Whether cursor `a`'s head sorts before cursor `b`'s head.
    fn beats(&self, a: usize, b: usize) -> bool {
        match (self.exhausted[a], self.exhausted[b]) {
            (true, true) => a < b,
            (true, false) => false,
            (false, true) => true,
            (false, false) => {
                let (x, y) = (&self.cursors[a], &self.cursors[b]);
                let ord = compare_prefixed(x.key(), y.key(), self.key_fully_determines, || {
                    self.comparator.compare(x.record(), y.record())
                });
                match ord {
                    Ordering::Less => true,
                    Ordering::Greater => false,
                    Ordering::Equal => a < b,
                }
            }
        }
    }

    fn build(&mut self) {
        let k = self.cursors.len();
        let mut winners = vec![0; 2 * k];
        for i in 0..k {
            winners[k + i] = i;
        }
        for node in (1..k).rev() {
            let (l, r) = (winners[2 * node], winners[2 * node + 1]);
            if self.beats(l, r) {
                winners[node] = l;
                self.tree[node] = r;
            } else {
                winners[node] = r;
                self.tree[node] = l;
            }
        }
        self.tree[0] = winners[1];
    }

    fn replay(&mut self, leaf: usize) {
        let mut winner = leaf;
        let mut node = (self.cursors.len() + leaf) / 2;
        while node >= 1 {
            if self.beats(self.tree[node], winner) {
                std::mem::swap(&mut self.tree[node], &mut winner);
            }
            node /= 2;
        }
        self.tree[0] = winner;
    }
}

impl RunCursor for MergeIterator {
    fn advance(&mut self) -> Result<bool> {
        if self.cursors.is_empty() {
            return Ok(false);
        }
        if !self.initialized {
            for i in 0..self.cursors.len() {
                self.exhausted[i] = !self.cursors[i].advance()?;
            }
            self.build();
            self.initialized = true;
        } else {
            let winner = self.tree[0];
            if !self.exhausted[winner] {
                self.exhausted[winner] = !self.cursors[winner].advance()?;
                self.replay(winner);
            }
        }
        Ok(!self.exhausted[self.tree[0]])
    }

    fn key(&self) -> &[u8] {
        self.cursors.get(self.tree[0]).map_or(&[][..], |c| c.key())
    }

    fn record(&self) -> &[u8] {
        self.cursors.get(self.tree[0]).map_or(&[][..], |c| c.record())
    }
}

/// Merges `runs` into a single new spilled run. The input channels are
/// deleted as they are consumed.
pub fn merge_into_run(
    manager: &Arc<SpillManager>,
    runs: Vec<SpilledRun>,
    comparator: Arc<dyn RecordComparator>,
    key_fully_determines: bool,
) -> Result<SpilledRun> {
    let num_inputs = runs.len();
    let cursors = runs
        .into_iter()
        .map(|run| {
            SpilledRunCursor::try_new(manager.clone(), run)
                .map(|c| Box::new(c) as Box<dyn RunCursor>)
        })
        .collect::<Result<Vec<_>>>()?;
    let mut merger = MergeIterator::new(cursors, comparator, key_fully_determines);

    let mut channel = manager.create_channel()?;
    while merger.advance()? {
        channel.write(merger.key(), merger.record())?;
    }
    let run = channel.finish()?;
    info!(
        "Merged {num_inputs} spilled runs into run {} with {} records ({} bytes)",
        run.id, run.num_records, run.num_bytes
    );
    Ok(run)
}

/// Runs intermediate merge passes until `spilled.len() + resident` runs fit
/// into one merge of `max_fan_in` inputs. Each pass merges the oldest runs.
///
/// `is_stopped` is checked before every pass. On cancellation or error the
/// channels of all remaining runs are deleted.
pub fn reduce_fan_in(
    manager: &Arc<SpillManager>,
    mut spilled: Vec<SpilledRun>,
    resident: usize,
    max_fan_in: usize,
    comparator: Arc<dyn RecordComparator>,
    key_fully_determines: bool,
    is_stopped: impl Fn() -> bool,
) -> Result<Vec<SpilledRun>> {
    let max_fan_in = max_fan_in.max(2);
    while spilled.len() + resident > max_fan_in {
        if is_stopped() {
            manager.delete_runs(&spilled);
            return Err(SortError::Cancelled);
        }
        let excess = spilled.len() + resident - max_fan_in;
        let take = (excess + 1).min(max_fan_in).min(spilled.len());
        let inputs: Vec<SpilledRun> = spilled.drain(..take).collect();
        match merge_into_run(manager, inputs, comparator.clone(), key_fully_determines) {
            Ok(merged) => spilled.push(merged),
            Err(e) => {
                manager.delete_runs(&spilled);
                return Err(e);
            }
        }
    }
    Ok(spilled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory_sort::InMemorySorter;
    use crate::key::{BytesComparator, BytesPrefixKeyComputer, KeyComputer};
    use crate::memory::MemoryPool;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    /// Cursor over an in-memory vector, for exercising the tree alone.
    struct VecCursor {
        rows: Vec<(Vec<u8>, Vec<u8>)>,
        pos: Option<usize>,
    }

    impl VecCursor {
        fn boxed(mut records: Vec<Vec<u8>>, key_len: usize) -> Box<dyn RunCursor> {
            records.sort();
            let computer = BytesPrefixKeyComputer::new(key_len);
            let rows = records
                .into_iter()
                .map(|r| {
                    let mut key = vec![0; key_len];
                    computer.put_key(&r, &mut key);
                    (key, r)
                })
                .collect();
            Box::new(Self { rows, pos: None })
        }
    }

    impl RunCursor for VecCursor {
        fn advance(&mut self) -> Result<bool> {
            let next = self.pos.map_or(0, |p| p + 1);
            self.pos = Some(next);
            Ok(next < self.rows.len())
        }

        fn key(&self) -> &[u8] {
            &self.rows[self.pos.unwrap_or(0)].0
        }

        fn record(&self) -> &[u8] {
            &self.rows[self.pos.unwrap_or(0)].1
        }
    }

    fn drain(cursor: &mut dyn RunCursor) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        while cursor.advance()? {
            out.push(cursor.record().to_vec());
        }
        Ok(out)
    }

    fn random_words(rng: &mut StdRng, n: usize) -> Vec<Vec<u8>> {
        (0..n)
            .map(|_| {
                let len = rng.gen_range(0..6);
                (0..len).map(|_| rng.gen_range(b'a'..b'f')).collect()
            })
            .collect()
    }

    fn sorted_buffer(pool: &MemoryPool, words: &[Vec<u8>]) -> Result<SortBuffer> {
        let key_computer = Arc::new(BytesPrefixKeyComputer::new(2));
        let mut buffer = SortBuffer::new(pool.clone(), 2, pool.max_segments(), 1);
        for word in words {
            buffer.append(word, key_computer.as_ref())?;
        }
        buffer.seal();
        InMemorySorter::new(key_computer, Arc::new(BytesComparator)).sort(&mut buffer)?;
        Ok(buffer)
    }

    #[test]
    fn loser_tree_merges_any_number_of_runs() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(11);
        for k in 0..10 {
            let runs: Vec<Vec<Vec<u8>>> = (0..k)
                .map(|_| {
                    let n = rng.gen_range(0..30);
                    random_words(&mut rng, n)
                })
                .collect();
            let mut expected: Vec<Vec<u8>> = runs.iter().flatten().cloned().collect();
            expected.sort();

            let cursors = runs.into_iter().map(|r| VecCursor::boxed(r, 1)).collect();
            let mut merger = MergeIterator::new(cursors, Arc::new(BytesComparator), false);
            assert_eq!(drain(&mut merger)?, expected, "k = {k}");
            assert!(!merger.advance()?);
        }
        Ok(())
    }

    #[test]
    fn equal_records_follow_run_order() -> Result<()> {
        // compares only the first byte, so "a1" and "a0" are equal
        let first_byte = |a: &[u8], b: &[u8]| a.first().cmp(&b.first());
        let cursors = vec![
            VecCursor::boxed(vec![b"a1".to_vec(), b"b1".to_vec()], 0),
            VecCursor::boxed(vec![b"a0".to_vec(), b"b0".to_vec()], 0),
        ];
        let mut merger = MergeIterator::new(cursors, Arc::new(first_byte), false);
        let merged = drain(&mut merger)?;
        assert_eq!(
            merged,
            vec![b"a1".to_vec(), b"a0".to_vec(), b"b1".to_vec(), b"b0".to_vec()]
        );
        Ok(())
    }

    #[test]
    fn merges_resident_and_spilled_runs() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = Arc::new(SpillManager::try_new(dir.path(), None, 4)?);
        let pool = MemoryPool::try_new(64, 0, 64)?;
        let mut rng = StdRng::seed_from_u64(5);

        let mut expected = Vec::new();
        let mut cursors: Vec<Box<dyn RunCursor>> = Vec::new();
        for _ in 0..3 {
            let words = random_words(&mut rng, 25);
            expected.extend(words.iter().cloned());
            let run = manager.spill_buffer(&sorted_buffer(&pool, &words)?)?;
            cursors.push(Box::new(SpilledRunCursor::try_new(manager.clone(), run)?));
        }
        let words = random_words(&mut rng, 25);
        expected.extend(words.iter().cloned());
        cursors.push(Box::new(ResidentRunCursor::new(sorted_buffer(&pool, &words)?)));
        expected.sort();
        assert_eq!(manager.live_channels(), 3);
        assert!(pool.outstanding_segments() > 0);

        let mut merger = MergeIterator::new(cursors, Arc::new(BytesComparator), false);
        assert_eq!(drain(&mut merger)?, expected);
        assert_eq!(manager.live_channels(), 0);
        assert_eq!(pool.outstanding_segments(), 0);
        Ok(())
    }

    #[test]
    fn intermediate_passes_respect_fan_in() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = Arc::new(SpillManager::try_new(dir.path(), None, 8)?);
        let pool = MemoryPool::try_new(64, 0, 64)?;
        let mut rng = StdRng::seed_from_u64(9);

        let mut expected = Vec::new();
        let mut runs = Vec::new();
        for _ in 0..7 {
            let words = random_words(&mut rng, 10);
            expected.extend(words.iter().cloned());
            runs.push(manager.spill_buffer(&sorted_buffer(&pool, &words)?)?);
        }
        expected.sort();

        let runs = reduce_fan_in(&manager, runs, 1, 3, Arc::new(BytesComparator), false, || false)?;
        assert_eq!(runs.len(), 2);
        assert_eq!(manager.live_channels(), 2);
        assert!(manager.total_spills() > 7);
        assert_eq!(runs.iter().map(|r| r.num_records).sum::<u64>(), 70);

        let cursors = runs
            .into_iter()
            .map(|run| {
                SpilledRunCursor::try_new(manager.clone(), run)
                    .map(|c| Box::new(c) as Box<dyn RunCursor>)
            })
            .collect::<Result<Vec<_>>>()?;
        let mut merger = MergeIterator::new(cursors, Arc::new(BytesComparator), false);
        assert_eq!(drain(&mut merger)?, expected);
        Ok(())
    }

    #[test]
    fn stopped_merge_deletes_remaining_runs() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = Arc::new(SpillManager::try_new(dir.path(), None, 8)?);
        let pool = MemoryPool::try_new(64, 0, 64)?;
        let mut rng = StdRng::seed_from_u64(11);

        let mut runs = Vec::new();
        for _ in 0..5 {
            let words = random_words(&mut rng, 10);
            runs.push(manager.spill_buffer(&sorted_buffer(&pool, &words)?)?);
        }
        assert_eq!(manager.live_channels(), 5);

        let passes = std::sync::atomic::AtomicUsize::new(0);
        let result = reduce_fan_in(&manager, runs, 0, 2, Arc::new(BytesComparator), false, || {
            passes.fetch_add(1, std::sync::atomic::Ordering::SeqCst) >= 1
        });
        assert!(matches!(result, Err(SortError::Cancelled)));
        assert_eq!(passes.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(manager.live_channels(), 0);
        Ok(())
    }

    #[test]
    fn dropped_cursor_deletes_its_channel() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = Arc::new(SpillManager::try_new(dir.path(), None, 4)?);
        let pool = MemoryPool::try_new(64, 0, 64)?;
        let mut rng = StdRng::seed_from_u64(12);
        let words = random_words(&mut rng, 10);
        let run = manager.spill_buffer(&sorted_buffer(&pool, &words)?)?;
        let path = run.path.clone();

        let mut cursor = SpilledRunCursor::try_new(manager.clone(), run)?;
        assert!(cursor.advance()?);
        drop(cursor);
        assert!(!path.exists());
        assert_eq!(manager.live_channels(), 0);
        Ok(())
    }
}
