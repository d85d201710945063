//! Strong (cryptographic) checksums and the reference checksum generator.
//!
//! Blocks are identified by a BLAKE3 digest truncated to 16 bytes; the same
//! digest, computed over the whole stream, identifies the file. The weak
//! rolling sum only nominates candidates — equality is always confirmed (and
//! fetched data verified) with the strong sum.

use std::io::{Read, Write};

use crate::rollsum::Rollsum32;
use crate::util::read_full;
use crate::Result;

/// Number of bytes in the serialized strong sum.
pub const STRONG_SIZE: usize = 16;

/// Truncated BLAKE3 digest of a block or file.
pub type StrongSum = [u8; STRONG_SIZE];

/// Strong checksum of a byte slice.
pub fn strong_sum(data: &[u8]) -> StrongSum {
    let hash = blake3::hash(data);
    let mut sum = [0u8; STRONG_SIZE];
    sum.copy_from_slice(&hash.as_bytes()[..STRONG_SIZE]);
    sum
}

/// Holds the hashing state used to describe a reference file. Hash state is
/// carried between calls, so a generator must not be shared between
/// concurrent scan sections; give each section its own.
pub struct ChecksumGenerator {
    block_size: usize,
    pub(crate) weak: Rollsum32,
}

impl ChecksumGenerator {
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        Self {
            block_size,
            weak: Rollsum32::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Bytes per record in the generated checksum stream.
    pub fn record_size(&self) -> usize {
        crate::rollsum::WEAK_SIZE + STRONG_SIZE
    }

    pub fn reset(&mut self) {
        self.weak.reset();
    }

    /// Read `input` in blocks, writing a packed `weak ‖ strong` record per
    /// block to `output`. The final block may be short and is summed over its
    /// actual bytes. Returns the whole-file digest.
    pub fn generate_checksums<R: Read, W: Write>(
        &mut self,
        mut input: R,
        output: &mut W,
    ) -> Result<StrongSum> {
        let mut buffer = vec![0u8; self.block_size];
        let mut file_hash = blake3::Hasher::new();
        self.weak.reset();

        loop {
            let n = read_full(&mut input, &mut buffer)?;
            if n == 0 {
                break;
            }
            let section = &buffer[..n];

            file_hash.update(section);
            self.weak.set_block(section);

            output.write_all(&self.weak.sum())?;
            output.write_all(&strong_sum(section))?;

            if n != buffer.len() {
                break;
            }
        }

        self.weak.reset();

        let mut digest = [0u8; STRONG_SIZE];
        digest.copy_from_slice(&file_hash.finalize().as_bytes()[..STRONG_SIZE]);
        Ok(digest)
    }
}

/// Strong-sum lookup by block id, used to verify fetched ranges.
pub trait ChecksumLookup: Send + Sync {
    /// `None` when no expectation is known for the block.
    fn strong_checksum(&self, block_id: u32) -> Option<StrongSum>;
}

/// Verifies a delivered byte range block-by-block against expected strong
/// sums. The final block of the reference is short; it is hashed over the
/// bytes actually delivered.
pub struct HashVerifier<L> {
    pub block_size: usize,
    pub lookup: L,
}

impl<L: ChecksumLookup> HashVerifier<L> {
    pub fn new(block_size: usize, lookup: L) -> Self {
        Self { block_size, lookup }
    }
}

impl<L: ChecksumLookup + 'static> crate::source::BlockVerifier for HashVerifier<L> {
    fn verify_block_range(&self, start_block: u32, data: &[u8]) -> bool {
        for (i, block) in data.chunks(self.block_size).enumerate() {
            match self.lookup.strong_checksum(start_block + i as u32) {
                Some(expected) => {
                    if strong_sum(block) != expected {
                        return false;
                    }
                }
                // no expectation recorded for this block
                None => return true,
            }
        }

        true
    }
}
