//! Coalesces block matches from any number of concurrent scan sections into
//! a canonical sorted span list, and derives the spans that are missing.
//!
//! Spans live in an arena and are registered in an ordered map under both
//! their start and end block ids; bordering spans are merged by re-pointing
//! the endpoint entries, so no span ever aliases another. Matches arrive in
//! arbitrary interleavings from the sections; the result is deterministic
//! because duplicate matches are dropped and merging only happens between
//! spans that border both in block ids and in comparison offsets.

use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::scanner::{BlockMatch, BlockMatchResult};

/// A run of reference blocks `[start_block, end_block]` (inclusive) found
/// contiguously in the local file at `comparison_start_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub start_block: u32,
    pub end_block: u32,
    pub comparison_start_offset: u64,
}

impl BlockSpan {
    pub fn block_count(&self) -> u32 {
        self.end_block - self.start_block + 1
    }

    /// Offset one past the span's bytes in the local file.
    pub fn end_offset(&self, block_size: u64) -> u64 {
        self.comparison_start_offset + block_size * u64::from(self.block_count())
    }
}

fn is_bordering(lower: &BlockSpan, upper: &BlockSpan, block_size: u64) -> bool {
    lower.end_block + 1 == upper.start_block
        && lower.end_offset(block_size) == upper.comparison_start_offset
}

#[derive(Default)]
struct MergerState {
    // spans indexed by arena position; merged-away entries simply go stale
    arena: Vec<BlockSpan>,
    // block id -> arena index, with entries at both ends of every live span
    endpoints: BTreeMap<u32, usize>,
    match_count: u64,
}

impl MergerState {
    fn add_match(&mut self, result: &BlockMatch, block_size: u64) {
        self.match_count += 1;
        let block = result.block_index;

        // drop matches for blocks some span already covers
        if let Some((_, &idx)) = self.endpoints.range(block..).next() {
            let span = self.arena[idx];
            if span.start_block <= block && block <= span.end_block {
                return;
            }
        }

        let mut current = self.arena.len();
        self.arena.push(BlockSpan {
            start_block: block,
            end_block: block,
            comparison_start_offset: result.comparison_offset,
        });
        self.endpoints.insert(block, current);

        if block > 0 {
            if let Some(&before) = self.endpoints.get(&(block - 1)) {
                current = self.try_merge(before, current, block_size);
            }
        }
        if let Some(&after) = self.endpoints.get(&(block + 1)) {
            self.try_merge(current, after, block_size);
        }
    }

    /// Merge `upper` into `lower` when they border; returns the surviving
    /// arena index.
    fn try_merge(&mut self, lower: usize, upper: usize, block_size: u64) -> usize {
        if !is_bordering(&self.arena[lower], &self.arena[upper], block_size) {
            return upper;
        }

        self.endpoints.remove(&self.arena[lower].end_block);
        self.endpoints.remove(&self.arena[upper].start_block);

        let merged_end = self.arena[upper].end_block;
        self.arena[lower].end_block = merged_end;

        self.endpoints.insert(self.arena[lower].start_block, lower);
        self.endpoints.insert(merged_end, lower);

        lower
    }

    fn sorted_spans(&self) -> Vec<BlockSpan> {
        let mut spans = Vec::new();
        for (&block, &idx) in &self.endpoints {
            let span = self.arena[idx];
            // every span appears under both endpoints; take it at its start
            if span.start_block == block {
                spans.push(span);
            }
        }
        spans
    }
}

/// Accepts match streams from concurrent scans and yields the merged spans.
#[derive(Default)]
pub struct MatchMerger {
    inner: Arc<MergerInner>,
}

#[derive(Default)]
struct MergerInner {
    state: Mutex<MergerState>,
    streams: Mutex<Vec<JoinHandle<()>>>,
}

impl MatchMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one match into the span map.
    pub fn add_match(&self, result: &BlockMatch, block_size: u64) {
        let mut state = self.inner.state.lock().expect("merger state poisoned");
        state.add_match(result, block_size);
    }

    /// Consume a match stream on a background thread. Call once per section;
    /// a terminal scan error ends that stream, leaving its unseen blocks to
    /// be treated as missing.
    pub fn start_merge_result_stream(&self, stream: Receiver<BlockMatchResult>, block_size: u64) {
        let inner = Arc::clone(&self.inner);
        let handle = thread::spawn(move || {
            for result in stream {
                match result {
                    Ok(m) => {
                        let mut state = inner.state.lock().expect("merger state poisoned");
                        state.add_match(&m, block_size);
                    }
                    Err(e) => {
                        tracing::warn!("match stream ended with error: {}", e);
                        return;
                    }
                }
            }
        });

        self.inner
            .streams
            .lock()
            .expect("merger streams poisoned")
            .push(handle);
    }

    /// Total matches observed, including duplicates that were dropped.
    pub fn match_count(&self) -> u64 {
        self.inner.state.lock().expect("merger state poisoned").match_count
    }

    /// Wait for all registered streams to close, then return the merged
    /// spans sorted by start block.
    pub fn get_merged_spans(&self) -> SortedSpanList {
        let handles: Vec<_> = {
            let mut streams = self.inner.streams.lock().expect("merger streams poisoned");
            streams.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }

        let state = self.inner.state.lock().expect("merger state poisoned");
        SortedSpanList(state.sorted_spans())
    }
}

/// Disjoint spans sorted by start block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortedSpanList(pub Vec<BlockSpan>);

impl SortedSpanList {
    pub fn iter(&self) -> std::slice::Iter<'_, BlockSpan> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The complement of this list over `[0, max_block]`. Missing spans have
    /// no meaningful comparison offset and carry zero.
    pub fn missing_spans(&self, max_block: u32) -> SortedSpanList {
        let mut missing = Vec::new();
        let mut next_uncovered: u32 = 0;

        for span in &self.0 {
            if span.start_block > next_uncovered {
                missing.push(BlockSpan {
                    start_block: next_uncovered,
                    end_block: span.start_block - 1,
                    comparison_start_offset: 0,
                });
            }
            next_uncovered = span.end_block + 1;
        }

        if next_uncovered <= max_block {
            missing.push(BlockSpan {
                start_block: next_uncovered,
                end_block: max_block,
                comparison_start_offset: 0,
            });
        }

        SortedSpanList(missing)
    }
}
