// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A growable pool of DEFLATE contexts.
//!
//! Building a deflate context allocates its window and hash tables, which is
//! too expensive to do for every glob or every rotated file under sustained
//! load. The pool keeps released contexts and hands them out again. A lease is
//! owned by exactly one caller at a time; it goes back to the pool when it is
//! released or dropped.
//!
//! When the free list is empty, `acquire` doubles the pool capacity before
//! serving the request. The pool never shrinks.

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use flate2::{Compress, Compression, FlushCompress, Status};
use tracing::debug;

const OUTPUT_CHUNK: usize = 16 * 1024;

/// A raw DEFLATE stream context (no zlib header).
pub struct Compressor {
    inner: Compress,
}

impl Compressor {
    fn new(level: Compression) -> Self {
        Self {
            inner: Compress::new(level, false),
        }
    }

    /// Compresses `input` as one complete DEFLATE stream.
    pub fn compress(&mut self, input: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        self.compress_into(input, &mut out)?;
        Ok(out)
    }

    /// Compresses `input` as one complete DEFLATE stream, appending to `out`.
    pub fn compress_into(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        self.inner.reset();
        self.write(input, out)?;
        self.finish(out)
    }

    /// Feeds `input` into the current stream, appending whatever output the
    /// context produces. The stream stays open.
    pub fn write(&mut self, mut input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        while !input.is_empty() {
            reserve_chunk(out);
            let before = self.inner.total_in();
            self.inner
                .compress_vec(input, out, FlushCompress::None)
                .map_err(io::Error::other)?;
            let consumed = (self.inner.total_in() - before) as usize;
            input = &input[consumed..];
        }
        Ok(())
    }

    /// Terminates the current stream, appending the remaining output.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
        loop {
            reserve_chunk(out);
            match self
                .inner
                .compress_vec(&[], out, FlushCompress::Finish)
                .map_err(io::Error::other)?
            {
                Status::StreamEnd => return Ok(()),
                Status::Ok | Status::BufError => continue,
            }
        }
    }

    /// Total uncompressed bytes fed since the last reset.
    pub fn total_in(&self) -> u64 {
        self.inner.total_in()
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

fn reserve_chunk(out: &mut Vec<u8>) {
    if out.capacity() - out.len() < OUTPUT_CHUNK / 4 {
        out.reserve(OUTPUT_CHUNK);
    }
}

struct PoolState {
    free: Vec<Compressor>,
    capacity: usize,
}

struct PoolInner {
    level: Compression,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn put_back(&self, mut compressor: Compressor) {
        compressor.reset();
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        state.free.push(compressor);
    }
}

/// Shared handle to a pool of compressors. Cloning shares the same pool.
#[derive(Clone)]
pub struct CompressorPool {
    inner: Arc<PoolInner>,
}

impl CompressorPool {
    /// Creates a pool holding `size` contexts at `level`. A size of zero is
    /// treated as one so the pool can always double.
    pub fn new(size: usize, level: Compression) -> Self {
        let size = size.max(1);
        let free = (0..size).map(|_| Compressor::new(level)).collect();
        Self {
            inner: Arc::new(PoolInner {
                level,
                state: Mutex::new(PoolState {
                    free,
                    capacity: size,
                }),
            }),
        }
    }

    /// Takes a compressor out of the pool, growing the pool if none is free.
    pub fn acquire(&self) -> PooledCompressor {
        #[allow(clippy::expect_used)]
        let mut state = self.inner.state.lock().expect("lock poisoned");
        if state.free.is_empty() {
            let grow_by = state.capacity;
            debug!(
                "Compressor pool exhausted, growing from {} to {}",
                state.capacity,
                state.capacity * 2
            );
            let level = self.inner.level;
            state
                .free
                .extend((0..grow_by).map(|_| Compressor::new(level)));
            state.capacity += grow_by;
        }
        let compressor = state.free.pop();
        drop(state);

        PooledCompressor {
            compressor,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Returns a compressor to the pool. Equivalent to dropping the lease.
    pub fn release(&self, lease: PooledCompressor) {
        drop(lease);
    }

    /// Number of contexts the pool has created so far.
    pub fn capacity(&self) -> usize {
        #[allow(clippy::expect_used)]
        let state = self.inner.state.lock().expect("lock poisoned");
        state.capacity
    }

    /// Number of contexts currently waiting in the free list.
    pub fn available(&self) -> usize {
        #[allow(clippy::expect_used)]
        let state = self.inner.state.lock().expect("lock poisoned");
        state.free.len()
    }
}

/// Exclusive lease on one pooled [`Compressor`].
pub struct PooledCompressor {
    compressor: Option<Compressor>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledCompressor {
    type Target = Compressor;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &Compressor {
        self.compressor.as_ref().expect("lease already released")
    }
}

impl DerefMut for PooledCompressor {
    #[allow(clippy::expect_used)]
    fn deref_mut(&mut self) -> &mut Compressor {
        self.compressor.as_mut().expect("lease already released")
    }
}

impl Drop for PooledCompressor {
    fn drop(&mut self) {
        if let Some(compressor) = self.compressor.take() {
            self.pool.put_back(compressor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::DeflateDecoder;
    use std::io::Read;

    fn inflate(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        DeflateDecoder::new(data)
            .read_to_end(&mut out)
            .expect("valid deflate stream");
        out
    }

    #[test]
    fn test_compress_round_trips_through_raw_deflate() {
        let pool = CompressorPool::new(1, Compression::fast());
        let mut lease = pool.acquire();
        let input = b"[{\"a\":1},{\"a\":2}]".repeat(100);

        let compressed = lease.compress(&input).unwrap();

        assert!(compressed.len() < input.len());
        assert_eq!(inflate(&compressed), input);
    }

    #[test]
    fn test_pool_doubles_when_exhausted() {
        let pool = CompressorPool::new(2, Compression::default());
        let first = pool.acquire();
        let second = pool.acquire();
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.available(), 0);

        let third = pool.acquire();
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.available(), 1);

        let fourth = pool.acquire();
        let fifth = pool.acquire();
        assert_eq!(pool.capacity(), 8);

        drop((first, second, third, fourth, fifth));
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn test_issued_leases_stay_usable_after_growth() {
        let pool = CompressorPool::new(1, Compression::fast());
        let mut held = pool.acquire();
        let mut out = Vec::new();
        held.write(b"first half ", &mut out).unwrap();

        // Forces the pool to grow while `held` has an open stream.
        let mut other = pool.acquire();
        let other_out = other.compress(b"unrelated").unwrap();
        assert_eq!(inflate(&other_out), b"unrelated");

        held.write(b"second half", &mut out).unwrap();
        held.finish(&mut out).unwrap();
        assert_eq!(inflate(&out), b"first half second half");
    }

    #[test]
    fn test_released_compressor_starts_a_fresh_stream() {
        let pool = CompressorPool::new(1, Compression::fast());
        let mut lease = pool.acquire();
        let mut abandoned = Vec::new();
        lease.write(&[7u8; 4096], &mut abandoned).unwrap();
        assert!(lease.total_in() > 0);
        pool.release(lease);

        let mut lease = pool.acquire();
        assert_eq!(lease.total_in(), 0);
        let out = lease.compress(b"clean").unwrap();
        assert_eq!(inflate(&out), b"clean");
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn test_concurrent_acquire_never_blocks() {
        let pool = CompressorPool::new(1, Compression::fast());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    let mut lease = pool.acquire();
                    let payload = format!("payload-{i}").repeat(64);
                    let out = lease.compress(payload.as_bytes()).unwrap();
                    assert_eq!(inflate(&out), payload.as_bytes());
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.capacity().is_power_of_two());
        assert_eq!(pool.available(), pool.capacity());
    }
}
