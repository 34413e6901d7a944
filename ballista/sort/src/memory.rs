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

//! Memory pool handing out fixed-size segments to sort buffers.
//!
//! The pool never grants more than its maximum number of segments. The
//! reserved segments are allocated when the pool is created and kept for its
//! whole lifetime; segments above the reserve are allocated on demand and
//! freed again when they come back.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::SortConfig;
use crate::error::{Result, SortError};

/// Free list and accounting, guarded by one lock.
#[derive(Debug, Default)]
struct PoolState {
    free: Vec<Box<[u8]>>,
    outstanding: usize,
    peak_outstanding: usize,
}

struct PoolInner {
    segment_size: usize,
    reserved_segments: usize,
    max_segments: usize,
    state: Mutex<PoolState>,
    /// Woken whenever segments are returned.
    released: Notify,
}

impl PoolInner {
    fn reclaim(&self, buffers: impl IntoIterator<Item = Box<[u8]>>) {
        let mut returned = 0;
        {
            let mut state = self.state.lock();
            for buf in buffers {
                state.outstanding -= 1;
                returned += 1;
                if state.free.len() < self.reserved_segments {
                    state.free.push(buf);
                }
            }
        }
        if returned > 0 {
            self.released.notify_waiters();
        }
    }
}

/// Thread-safe pool of fixed-size memory segments.
///
/// `Clone` creates another handle to the same pool.
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("segment_size", &self.inner.segment_size)
            .field("reserved_segments", &self.inner.reserved_segments)
            .field("max_segments", &self.inner.max_segments)
            .field("outstanding", &self.outstanding_segments())
            .finish()
    }
}

impl MemoryPool {
    /// Creates a pool and eagerly allocates the reserved segments.
    pub fn try_new(
        segment_size: usize,
        reserved_segments: usize,
        max_segments: usize,
    ) -> Result<Self> {
        if segment_size == 0 || max_segments == 0 {
            return Err(SortError::Configuration(format!(
                "memory pool needs a non-empty budget, got {max_segments} segments of {segment_size} bytes"
            )));
        }
        if reserved_segments > max_segments {
            return Err(SortError::Configuration(format!(
                "reserved segments ({reserved_segments}) exceed maximum segments ({max_segments})"
            )));
        }

        let free = (0..reserved_segments)
            .map(|_| vec![0u8; segment_size].into_boxed_slice())
            .collect();

        Ok(Self {
            inner: Arc::new(PoolInner {
                segment_size,
                reserved_segments,
                max_segments,
                state: Mutex::new(PoolState {
                    free,
                    ..Default::default()
                }),
                released: Notify::new(),
            }),
        })
    }

    /// Creates a pool sized by the given configuration.
    pub fn from_config(config: &SortConfig) -> Result<Self> {
        config.validate()?;
        Self::try_new(
            config.segment_size,
            config.reserved_segments(),
            config.max_segments(),
        )
    }

    /// Size of every segment in bytes.
    pub fn segment_size(&self) -> usize {
        self.inner.segment_size
    }

    /// Number of segments allocated up front.
    pub fn reserved_segments(&self) -> usize {
        self.inner.reserved_segments
    }

    /// Maximum number of segments the pool grants.
    pub fn max_segments(&self) -> usize {
        self.inner.max_segments
    }

    /// Number of segments currently handed out.
    pub fn outstanding_segments(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    /// Number of segments that can still be granted without waiting.
    pub fn available_segments(&self) -> usize {
        self.inner.max_segments - self.outstanding_segments()
    }

    /// Bytes currently handed out to sort buffers.
    pub fn used_memory_bytes(&self) -> usize {
        self.outstanding_segments() * self.inner.segment_size
    }

    /// Highest number of bytes ever handed out at once.
    pub fn peak_memory_bytes(&self) -> usize {
        self.inner.state.lock().peak_outstanding * self.inner.segment_size
    }

    /// Bytes held by the pool, whether handed out or kept on the free list.
    pub fn allocated_memory_bytes(&self) -> usize {
        let state = self.inner.state.lock();
        (state.outstanding + state.free.len()) * self.inner.segment_size
    }

    fn check_request(&self, n: usize) -> Result<()> {
        if n > self.inner.max_segments {
            return Err(SortError::Configuration(format!(
                "request for {n} segments exceeds the pool maximum of {}",
                self.inner.max_segments
            )));
        }
        Ok(())
    }

    /// Grants up to `n` segments without waiting. The result is empty when
    /// the pool is exhausted.
    pub fn try_acquire(&self, n: usize) -> Result<Vec<MemorySegment>> {
        self.check_request(n)?;

        let buffers = {
            let mut state = self.inner.state.lock();
            let grant = n.min(self.inner.max_segments - state.outstanding);
            let mut buffers = Vec::with_capacity(grant);
            for _ in 0..grant {
                let buf = state
                    .free
                    .pop()
                    .unwrap_or_else(|| vec![0u8; self.inner.segment_size].into_boxed_slice());
                buffers.push(buf);
            }
            state.outstanding += grant;
            state.peak_outstanding = state.peak_outstanding.max(state.outstanding);
            buffers
        };

        Ok(buffers
            .into_iter()
            .map(|buf| MemorySegment {
                buf: Some(buf),
                pool: self.inner.clone(),
            })
            .collect())
    }

    /// Grants between one and `n` segments, waiting for other holders to
    /// release memory when the pool is exhausted.
    pub async fn acquire(&self, n: usize) -> Result<Vec<MemorySegment>> {
        self.check_request(n)?;
        if n == 0 {
            return Ok(Vec::new());
        }

        loop {
            // register before checking so a release in between is not missed
            let released = self.inner.released.notified();
            let segments = self.try_acquire(n)?;
            if !segments.is_empty() {
                return Ok(segments);
            }
            debug!("Memory pool exhausted, waiting for {n} segments");
            released.await;
        }
    }

    /// Returns segments to the pool in one step and wakes every waiter.
    pub fn release(&self, segments: Vec<MemorySegment>) {
        let buffers: Vec<Box<[u8]>> = segments
            .into_iter()
            .filter_map(|mut segment| segment.buf.take())
            .collect();
        self.inner.reclaim(buffers);
    }
}

/// A fixed-size block of memory owned by a sort buffer.
///
/// Dropping a segment gives it back to the pool it came from.
pub struct MemorySegment {
    buf: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl MemorySegment {
    /// Segment size in bytes.
    pub fn size(&self) -> usize {
        self.len()
    }
}

impl fmt::Debug for MemorySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySegment")
            .field("size", &self.len())
            .finish()
    }
}

impl Deref for MemorySegment {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for MemorySegment {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for MemorySegment {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.reclaim(std::iter::once(buf));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reserved_segments_are_preallocated() -> Result<()> {
        let pool = MemoryPool::try_new(1024, 2, 4)?;
        assert_eq!(pool.allocated_memory_bytes(), 2048);
        assert_eq!(pool.used_memory_bytes(), 0);
        assert_eq!(pool.available_segments(), 4);
        Ok(())
    }

    #[test]
    fn try_acquire_never_exceeds_max() -> Result<()> {
        let pool = MemoryPool::try_new(1024, 1, 3)?;
        let first = pool.try_acquire(2)?;
        assert_eq!(first.len(), 2);
        let second = pool.try_acquire(2)?;
        assert_eq!(second.len(), 1);
        let third = pool.try_acquire(1)?;
        assert!(third.is_empty());
        assert_eq!(pool.outstanding_segments(), 3);
        assert_eq!(pool.peak_memory_bytes(), 3 * 1024);

        pool.release(first);
        assert_eq!(pool.outstanding_segments(), 1);
        drop(second);
        assert_eq!(pool.outstanding_segments(), 0);
        // only the reserve is retained
        assert_eq!(pool.allocated_memory_bytes(), 1024);
        Ok(())
    }

    #[test]
    fn request_above_max_is_a_configuration_error() -> Result<()> {
        let pool = MemoryPool::try_new(1024, 1, 2)?;
        assert!(matches!(
            pool.try_acquire(3),
            Err(SortError::Configuration(_))
        ));
        Ok(())
    }

    #[test]
    fn invalid_budget_is_rejected() {
        assert!(MemoryPool::try_new(0, 0, 1).is_err());
        assert!(MemoryPool::try_new(1024, 3, 2).is_err());
    }

    #[test]
    fn segments_are_writable() -> Result<()> {
        let pool = MemoryPool::try_new(16, 1, 1)?;
        let mut segments = pool.try_acquire(1)?;
        segments[0][..4].copy_from_slice(b"sort");
        assert_eq!(&segments[0][..4], b"sort");
        assert_eq!(segments[0].size(), 16);
        Ok(())
    }

    #[tokio::test]
    async fn acquire_waits_for_release() -> Result<()> {
        let pool = MemoryPool::try_new(1024, 1, 2)?;
        let held = pool.try_acquire(2)?;

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(2).await.map(|s| s.len()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(held);
        let granted = waiter.await??;
        assert_eq!(granted, 2);
        assert_eq!(pool.outstanding_segments(), 0);
        Ok(())
    }
}
