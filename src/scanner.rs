//! Streams a local file past a checksum index and emits block matches.
//!
//! The scan keeps a rolling weak sum over a sliding window. Each position is
//! probed against the index; a weak hit is confirmed with the strong sum
//! before anything is emitted. After a confirmed match the scan skips a whole
//! block — overlapping matches inside a just-matched window are of no use to
//! the merger. Once the input runs dry the window is drained one byte at a
//! time and re-probed, which is what finds a short final reference block.
//!
//! Scans may run concurrently on sub-sections of a larger file: each section
//! must start one block size before its nominal offset so the window can
//! align, and must use its own generator, since the hashes carry state. The
//! merger reconciles the overlap.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;

use crate::checksum::{strong_sum, ChecksumGenerator};
use crate::index::ChecksumIndex;
use crate::util::read_full;
use crate::window::WindowBuffer;
use crate::Result;

/// Bound on an in-flight match stream; scanning is faster than merging
/// wants to observe, not the other way around.
const RESULT_BUFFER: usize = 64;

/// One confirmed match: the window starting at `comparison_offset` in the
/// local file equals reference block `block_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMatch {
    pub comparison_offset: u64,
    pub block_index: u32,
}

/// Item on a match stream. A stream carries any number of `Ok` records and
/// is terminated either by closing or by a single `Err`.
pub type BlockMatchResult = Result<BlockMatch>;

enum ReadMode {
    Byte,
    Block,
}

// probe/drain stop early when the consumer goes away
struct StreamClosed;

/// Match finder with scan statistics. The struct itself holds no per-scan
/// state and can drive any number of sections at once.
#[derive(Default)]
pub struct Scanner {
    stats: Arc<ScanStats>,
}

#[derive(Default)]
struct ScanStats {
    comparisons: AtomicU64,
    weak_hash_hits: AtomicU64,
    strong_hash_hits: AtomicU64,
}

impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn comparisons(&self) -> u64 {
        self.stats.comparisons.load(Ordering::Relaxed)
    }

    pub fn weak_hash_hits(&self) -> u64 {
        self.stats.weak_hash_hits.load(Ordering::Relaxed)
    }

    pub fn strong_hash_hits(&self) -> u64 {
        self.stats.strong_hash_hits.load(Ordering::Relaxed)
    }

    /// Spawn a scan on its own thread and hand back the match stream.
    pub fn start_find_matching_blocks<R: Read + Send + 'static>(
        &self,
        comparison: R,
        base_offset: u64,
        mut generator: ChecksumGenerator,
        index: Arc<ChecksumIndex>,
    ) -> Receiver<BlockMatchResult> {
        let (tx, rx) = sync_channel(RESULT_BUFFER);
        let stats = Arc::clone(&self.stats);

        thread::spawn(move || {
            stats.find_matching_blocks(comparison, base_offset, &mut generator, &index, &tx);
        });

        rx
    }

    /// Scan `comparison`, sending matches (and at most one terminal error)
    /// to `results`. Offsets are reported relative to `base_offset`.
    pub fn find_matching_blocks<R: Read>(
        &self,
        comparison: R,
        base_offset: u64,
        generator: &mut ChecksumGenerator,
        index: &ChecksumIndex,
        results: &SyncSender<BlockMatchResult>,
    ) {
        self.stats
            .find_matching_blocks(comparison, base_offset, generator, index, results);
    }
}

impl ScanStats {
    fn find_matching_blocks<R: Read>(
        &self,
        mut comparison: R,
        base_offset: u64,
        generator: &mut ChecksumGenerator,
        index: &ChecksumIndex,
        results: &SyncSender<BlockMatchResult>,
    ) {
        let block_size = generator.block_size();
        let mut block = vec![0u8; block_size];
        let mut window = WindowBuffer::new(block_size);
        let mut single = [0u8; 1];

        let seed = match read_full(&mut comparison, &mut block) {
            Ok(n) => n,
            Err(e) => {
                let _ = results.send(Err(e.into()));
                return;
            }
        };
        if seed == 0 {
            return;
        }

        window.write(&block[..seed]);
        generator.weak.set_block(&block[..seed]);

        let mut eof = seed < block_size;
        // byte offset of the window start within this section
        let mut offset: u64 = 0;
        let mut next = ReadMode::Byte;

        loop {
            match self.probe(index, generator, &window, offset + base_offset, results) {
                Ok(true) => next = ReadMode::Block,
                Ok(false) => {}
                Err(StreamClosed) => return,
            }

            if eof {
                break;
            }

            match next {
                ReadMode::Byte => {
                    let n = match read_full(&mut comparison, &mut single) {
                        Ok(n) => n,
                        Err(e) => {
                            let _ = results.send(Err(e.into()));
                            return;
                        }
                    };

                    if n == 0 {
                        // the current window was probed already; go straight
                        // to the tail drain
                        break;
                    }

                    let length_before = window.len();
                    window.write(&single);
                    let evicted = window.evicted();
                    generator.weak.add_and_remove_bytes(&single, evicted, length_before);
                    offset += 1;
                }
                ReadMode::Block => {
                    let n = match read_full(&mut comparison, &mut block) {
                        Ok(n) => n,
                        Err(e) => {
                            let _ = results.send(Err(e.into()));
                            return;
                        }
                    };

                    if n == block_size {
                        generator.weak.set_block(&block);
                        window.write(&block);
                        offset += block_size as u64;
                    } else if n > 0 {
                        let length_before = window.len();
                        window.write(&block[..n]);
                        let evicted = window.evicted();
                        generator
                            .weak
                            .add_and_remove_bytes(&block[..n], evicted, length_before);
                        offset += n as u64;
                        // probe the shifted window once, then drain
                        eof = true;
                    } else {
                        // input ended exactly on the matched block boundary
                        break;
                    }

                    next = ReadMode::Byte;
                }
            }
        }

        self.drain(index, generator, &mut window, offset, base_offset, results);
    }

    /// Probe shrinking windows against the index until the tail is consumed.
    fn drain(
        &self,
        index: &ChecksumIndex,
        generator: &mut ChecksumGenerator,
        window: &mut WindowBuffer,
        mut offset: u64,
        base_offset: u64,
        results: &SyncSender<BlockMatchResult>,
    ) {
        let mut length = window.len();

        while length > 1 {
            let removed = window.truncate(1)[0];
            generator.weak.remove_byte(removed, length);
            length -= 1;
            offset += 1;

            if self
                .probe(index, generator, window, offset + base_offset, results)
                .is_err()
            {
                return;
            }
        }
    }

    /// Look the current window up in the index; emit one result per matching
    /// reference block, in the bucket's strong-sum order. Returns whether
    /// anything matched.
    fn probe(
        &self,
        index: &ChecksumIndex,
        generator: &ChecksumGenerator,
        window: &WindowBuffer,
        comparison_offset: u64,
        results: &SyncSender<BlockMatchResult>,
    ) -> std::result::Result<bool, StreamClosed> {
        self.comparisons.fetch_add(1, Ordering::Relaxed);

        let weak = generator.weak.sum();
        let bucket = match index.find_weak(&weak) {
            Some(bucket) => bucket,
            None => return Ok(false),
        };
        self.weak_hash_hits.fetch_add(1, Ordering::Relaxed);

        let strong = strong_sum(window.get_block());
        let matches = bucket.find_strong(&strong);
        if matches.is_empty() {
            return Ok(false);
        }

        for candidate in matches {
            self.strong_hash_hits.fetch_add(1, Ordering::Relaxed);
            results
                .send(Ok(BlockMatch {
                    comparison_offset,
                    block_index: candidate.chunk_offset,
                }))
                .map_err(|_| StreamClosed)?;
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::build_checksum_index;
    use std::io::Cursor;

    /// Run a scan and return the matched reference strings, verifying each
    /// match byte-for-byte along the way.
    fn matched_strings(original: &str, modified: &str, block_size: usize) -> Vec<String> {
        let mut generator = ChecksumGenerator::new(block_size);
        let (_, index, _) =
            build_checksum_index(&mut generator, Cursor::new(original.as_bytes())).unwrap();

        let scanner = Arc::new(Scanner::new());
        let rx = scanner.start_find_matching_blocks(
            Cursor::new(modified.as_bytes().to_vec()),
            0,
            ChecksumGenerator::new(block_size),
            Arc::new(index),
        );

        let mut matched = Vec::new();
        for result in rx {
            let m = result.expect("scan error");

            let ref_start = m.block_index as usize * block_size;
            let ref_end = (ref_start + block_size).min(original.len());
            let reference_bytes = &original[ref_start..ref_end];

            let local_start = m.comparison_offset as usize;
            let local_end = (local_start + reference_bytes.len()).min(modified.len());
            assert_eq!(
                reference_bytes,
                &modified[local_start..local_end],
                "match {:?} does not hold",
                m
            );

            matched.push(reference_bytes.to_string());
        }

        matched
    }

    fn split(n: usize, strings: &[&str]) -> Vec<String> {
        let mut result = Vec::new();
        for s in strings {
            let mut i = 0;
            while i < s.len() {
                result.push(s[i..(i + n).min(s.len())].to_string());
                i += n;
            }
        }
        result
    }

    #[test]
    fn detects_prepended_content() {
        let original = "abcdefghijklmnop";
        let modified = format!("12{}", original);

        assert_eq!(
            matched_strings(original, &modified, 4),
            split(4, &[original])
        );
    }

    #[test]
    fn detects_injected_content() {
        let a = "abcdefgh";
        let b = "ijklmnop";
        let modified = format!("{}23{}", a, b);

        assert_eq!(
            matched_strings(&format!("{}{}", a, b), &modified, 4),
            split(4, &[a, b])
        );
    }

    #[test]
    fn detects_appended_content() {
        let original = "abcdefghijklmnop";
        let modified = format!("{}23", original);

        assert_eq!(
            matched_strings(original, &modified, 4),
            split(4, &[original])
        );
    }

    #[test]
    fn detects_modified_content() {
        let a = "abcdefgh";
        let c = "mnop";
        let original = format!("{}ijkl{}", a, c);
        let modified = format!("{}i2kl{}", a, c);

        assert_eq!(matched_strings(&original, &modified, 4), split(4, &[a, c]));
    }

    #[test]
    fn detects_partial_block_at_end() {
        let original = "abcdefghijklmnopqrstuvwxyz";

        assert_eq!(
            matched_strings(original, original, 4),
            split(4, &[original])
        );
    }

    #[test]
    fn detects_unmodified_partial_block_after_modified_content() {
        let a = "abcdefghijklmnopqrst";
        let original = format!("{}uvwxyz", a);
        let modified = format!("{}us6xyz", a);

        assert_eq!(
            matched_strings(&original, &modified, 4),
            split(4, &[a, "yz"])
        );
    }

    #[test]
    fn emits_every_duplicate_at_one_offset() {
        let original = "abcdabcd";
        let modified = "abcd";

        assert_eq!(
            matched_strings(original, modified, 4),
            vec!["abcd".to_string(), "abcd".to_string()]
        );
    }

    #[test]
    fn quick_brown_fox_regression() {
        let original = "The quick brown fox jumped over the lazy dog";
        let modified = "The qwik brown fox jumped 0v3r the lazy";

        assert_eq!(
            matched_strings(original, modified, 4),
            vec!["The ", "k br", "own ", "fox ", "jump", "the ", "lazy"]
        );
    }

    #[test]
    fn prepended_section_matches_at_shifted_offsets() {
        let original = "abcdefghijklmnop";
        let modified = format!("12{}", original);

        let mut generator = ChecksumGenerator::new(4);
        let (_, index, _) =
            build_checksum_index(&mut generator, Cursor::new(original.as_bytes())).unwrap();

        let scanner = Arc::new(Scanner::new());
        let rx = scanner.start_find_matching_blocks(
            Cursor::new(modified.into_bytes()),
            0,
            ChecksumGenerator::new(4),
            Arc::new(index),
        );

        let offsets: Vec<u64> = rx
            .iter()
            .map(|r| r.unwrap().comparison_offset)
            .collect();
        assert_eq!(offsets, vec![2, 6, 10, 14]);
    }

    #[test]
    fn empty_input_matches_nothing() {
        assert!(matched_strings("abcdefgh", "", 4).is_empty());
    }

    #[test]
    fn base_offset_shifts_reported_offsets() {
        let original = "abcdefgh";

        let mut generator = ChecksumGenerator::new(4);
        let (_, index, _) =
            build_checksum_index(&mut generator, Cursor::new(original.as_bytes())).unwrap();

        let scanner = Arc::new(Scanner::new());
        let rx = scanner.start_find_matching_blocks(
            Cursor::new(original.as_bytes().to_vec()),
            1000,
            ChecksumGenerator::new(4),
            Arc::new(index),
        );

        let offsets: Vec<u64> = rx.iter().map(|r| r.unwrap().comparison_offset).collect();
        assert_eq!(offsets, vec![1000, 1004]);
    }

    #[test]
    fn read_errors_terminate_the_stream() {
        struct FailingReader(usize);
        impl Read for FailingReader {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.0 == 0 {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
                }
                let n = self.0.min(buf.len());
                buf[..n].fill(b'x');
                self.0 -= n;
                Ok(n)
            }
        }

        let mut generator = ChecksumGenerator::new(4);
        let (_, index, _) =
            build_checksum_index(&mut generator, Cursor::new(b"abcdefgh")).unwrap();

        let scanner = Arc::new(Scanner::new());
        let rx = scanner.start_find_matching_blocks(
            FailingReader(6),
            0,
            ChecksumGenerator::new(4),
            Arc::new(index),
        );

        let results: Vec<BlockMatchResult> = rx.iter().collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn counts_weak_and_strong_hits() {
        let original = "abcdefgh";

        let mut generator = ChecksumGenerator::new(4);
        let (_, index, _) =
            build_checksum_index(&mut generator, Cursor::new(original.as_bytes())).unwrap();

        let scanner = Arc::new(Scanner::new());
        let rx = scanner.start_find_matching_blocks(
            Cursor::new(original.as_bytes().to_vec()),
            0,
            ChecksumGenerator::new(4),
            Arc::new(index),
        );
        rx.iter().for_each(drop);

        assert!(scanner.comparisons() >= 2);
        assert_eq!(scanner.weak_hash_hits(), 2);
        assert_eq!(scanner.strong_hash_hits(), 2);
    }
}
