//! Two-level lookup over a reference file's checksums: weak sum to bucket,
//! strong sum to the matching entries within the bucket.
//!
//! The index is immutable once built and may be shared freely between scan
//! sections. Duplicate blocks are preserved — a reference that repeats the
//! same content at several positions yields one entry per position, and a
//! strong lookup returns all of them.

use std::collections::HashMap;
use std::io::Read;

use crate::checksum::{ChecksumGenerator, StrongSum};
use crate::chunk::{ChunkChecksum, StrongChecksumGetter};
use crate::rollsum::WeakSum;
use crate::Result;

pub struct ChecksumIndex {
    block_count: usize,
    weak_lookup: HashMap<u32, StrongChecksumList>,
}

impl ChecksumIndex {
    pub fn new(checksums: Vec<ChunkChecksum>) -> Self {
        let block_count = checksums.len();
        let mut weak_lookup: HashMap<u32, StrongChecksumList> =
            HashMap::with_capacity(block_count);

        for chunk in checksums {
            let key = u32::from_le_bytes(chunk.weak);
            weak_lookup.entry(key).or_default().0.push(chunk);
        }

        for bucket in weak_lookup.values_mut() {
            bucket.0.sort_by(|x, y| x.strong.cmp(&y.strong));
        }

        Self {
            block_count,
            weak_lookup,
        }
    }

    /// Number of blocks in the reference, counting duplicates.
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Number of distinct weak sums.
    pub fn weak_count(&self) -> usize {
        self.weak_lookup.len()
    }

    /// The bucket of entries sharing `weak`, if any. The bucket is handed
    /// back to [`StrongChecksumList::find_strong`] to confirm a candidate.
    pub fn find_weak(&self, weak: &WeakSum) -> Option<&StrongChecksumList> {
        self.weak_lookup.get(&u32::from_le_bytes(*weak))
    }
}

/// A weak-sum bucket, sorted by strong sum to make range-equal lookup cheap.
#[derive(Default)]
pub struct StrongChecksumList(Vec<ChunkChecksum>);

impl StrongChecksumList {
    /// All entries whose strong sum equals `strong`; empty when none match.
    pub fn find_strong(&self, strong: &StrongSum) -> &[ChunkChecksum] {
        // single-entry buckets are the overwhelmingly common case
        if self.0.len() == 1 {
            if self.0[0].strong == *strong {
                return &self.0;
            }
            return &[];
        }

        let first = self.0.partition_point(|c| c.strong < *strong);
        let mut end = first;
        while end < self.0.len() && self.0[end].strong == *strong {
            end += 1;
        }

        &self.0[first..end]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Generate checksums for `reader` and index them in one step. Returns the
/// whole-file digest, the index, and the per-block strong sums for later
/// verification of fetched data.
pub fn build_checksum_index<R: Read>(
    generator: &mut ChecksumGenerator,
    reader: R,
) -> Result<(StrongSum, ChecksumIndex, StrongChecksumGetter)> {
    let mut stream = Vec::new();
    let file_digest = generator.generate_checksums(reader, &mut stream)?;

    let chunks = crate::chunk::load_checksums_from_reader(
        std::io::Cursor::new(stream),
        generator.block_size() as u64,
        None,
    )?;

    let index = ChecksumIndex::new(chunks.clone());
    Ok((file_digest, index, StrongChecksumGetter::new(chunks)))
}
