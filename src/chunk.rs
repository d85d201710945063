//! The per-block checksum pair and the packed stream it is loaded from.

use std::io::Read;

use crate::checksum::{ChecksumLookup, StrongSum, STRONG_SIZE};
use crate::rollsum::{WeakSum, WEAK_SIZE};
use crate::util::read_full;
use crate::{BlockSyncError, Result};

/// The weak and strong checksums of one reference block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkChecksum {
    /// Position of the block, in blocks.
    pub chunk_offset: u32,
    /// Size of the block in bytes; only the final block may be short.
    pub size: u64,
    pub weak: WeakSum,
    pub strong: StrongSum,
}

impl ChunkChecksum {
    /// Two chunks match when both checksums are byte-equal, regardless of
    /// their offsets.
    pub fn matches(&self, other: &ChunkChecksum) -> bool {
        self.weak == other.weak && self.strong == other.strong
    }
}

/// Load a packed sequence of `weak ‖ strong` records. `file_size`, when
/// known, sizes the final block; otherwise every chunk is assumed full.
/// Trailing bytes that do not complete a record are an error.
pub fn load_checksums_from_reader<R: Read>(
    mut reader: R,
    block_size: u64,
    file_size: Option<u64>,
) -> Result<Vec<ChunkChecksum>> {
    let mut result = Vec::new();
    let mut offset: u32 = 0;

    loop {
        let mut weak = [0u8; WEAK_SIZE];
        let n = read_full(&mut reader, &mut weak)?;
        if n == 0 {
            break;
        } else if n != WEAK_SIZE {
            return Err(BlockSyncError::PartialChecksum);
        }

        let mut strong = [0u8; STRONG_SIZE];
        if read_full(&mut reader, &mut strong)? != STRONG_SIZE {
            return Err(BlockSyncError::PartialChecksum);
        }

        result.push(ChunkChecksum {
            chunk_offset: offset,
            size: block_size,
            weak,
            strong,
        });
        offset += 1;
    }

    // shorten the tail chunk to the bytes the file actually has
    if let (Some(total), false) = (file_size, result.is_empty()) {
        let last = result.len() - 1;
        let preceding = last as u64 * block_size;
        if total > preceding && total - preceding < block_size {
            result[last].size = total - preceding;
        }
    }

    Ok(result)
}

/// Strong-sum lookup over a loaded checksum sequence.
pub struct StrongChecksumGetter(Vec<ChunkChecksum>);

impl StrongChecksumGetter {
    pub fn new(checksums: Vec<ChunkChecksum>) -> Self {
        Self(checksums)
    }

    pub fn checksums(&self) -> &[ChunkChecksum] {
        &self.0
    }
}

impl ChecksumLookup for StrongChecksumGetter {
    fn strong_checksum(&self, block_id: u32) -> Option<StrongSum> {
        self.0.get(block_id as usize).map(|c| c.strong)
    }
}
