//! The on-disk `.gosync` index format: a fixed little-endian header followed
//! by the packed checksum stream.
//!
//! | field          | bytes |
//! |----------------|-------|
//! | magic          | 6     |
//! | major version  | 2     |
//! | minor version  | 2     |
//! | patch version  | 2     |
//! | file size      | 8     |
//! | block size     | 4     |
//!
//! A major-version mismatch is fatal; minor and patch are informational.

use std::io::{Read, Write};

use crate::checksum::{ChecksumGenerator, StrongSum};
use crate::chunk::{load_checksums_from_reader, StrongChecksumGetter};
use crate::index::ChecksumIndex;
use crate::util::read_full;
use crate::{BlockSyncError, Result};

pub const MAGIC: &[u8; 6] = b"G0S9NC";

pub const MAJOR_VERSION: u16 = 0;
pub const MINOR_VERSION: u16 = 1;
pub const PATCH_VERSION: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub patch_version: u16,
    pub file_size: u64,
    pub block_size: u32,
}

pub fn write_header<W: Write>(writer: &mut W, block_size: u32, file_size: u64) -> Result<()> {
    writer.write_all(MAGIC)?;
    for version in [MAJOR_VERSION, MINOR_VERSION, PATCH_VERSION] {
        writer.write_all(&version.to_le_bytes())?;
    }
    writer.write_all(&file_size.to_le_bytes())?;
    writer.write_all(&block_size.to_le_bytes())?;
    Ok(())
}

pub fn read_header<R: Read>(reader: &mut R) -> Result<IndexHeader> {
    let mut magic = [0u8; MAGIC.len()];
    if read_full(reader, &mut magic)? != magic.len() || &magic != MAGIC {
        return Err(BlockSyncError::BadMagic);
    }

    let mut versions = [0u16; 3];
    for version in versions.iter_mut() {
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf)?;
        *version = u16::from_le_bytes(buf);
    }

    if versions[0] != MAJOR_VERSION {
        return Err(BlockSyncError::VersionMismatch {
            found: versions[0],
            supported: MAJOR_VERSION,
        });
    }

    let mut file_size = [0u8; 8];
    reader.read_exact(&mut file_size)?;
    let mut block_size = [0u8; 4];
    reader.read_exact(&mut block_size)?;

    Ok(IndexHeader {
        major_version: versions[0],
        minor_version: versions[1],
        patch_version: versions[2],
        file_size: u64::from_le_bytes(file_size),
        block_size: u32::from_le_bytes(block_size),
    })
}

/// Write a complete index file for `input`, whose length must be
/// `file_size`. Returns the whole-file digest.
pub fn build_index_file<R: Read, W: Write>(
    input: R,
    output: &mut W,
    block_size: u32,
    file_size: u64,
) -> Result<StrongSum> {
    write_header(output, block_size, file_size)?;

    let mut generator = ChecksumGenerator::new(block_size as usize);
    generator.generate_checksums(input, output)
}

/// An index file pulled into memory: the header, the query structure, and
/// the raw per-block strong sums for verification.
pub struct LoadedIndex {
    pub header: IndexHeader,
    pub index: ChecksumIndex,
    pub checksums: StrongChecksumGetter,
}

pub fn load_index<R: Read>(mut reader: R) -> Result<LoadedIndex> {
    let header = read_header(&mut reader)?;

    let chunks = load_checksums_from_reader(
        reader,
        u64::from(header.block_size),
        Some(header.file_size),
    )?;

    Ok(LoadedIndex {
        header,
        index: ChecksumIndex::new(chunks.clone()),
        checksums: StrongChecksumGetter::new(chunks),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_round_trips() {
        let mut bytes = Vec::new();
        write_header(&mut bytes, 8192, 1 << 33).unwrap();

        let header = read_header(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(header.block_size, 8192);
        assert_eq!(header.file_size, 1 << 33);
        assert_eq!(header.major_version, MAJOR_VERSION);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = Vec::new();
        write_header(&mut bytes, 8192, 100).unwrap();
        bytes[0] = b'X';

        assert!(matches!(
            read_header(&mut Cursor::new(bytes)),
            Err(BlockSyncError::BadMagic)
        ));
    }

    #[test]
    fn truncated_magic_is_rejected() {
        assert!(matches!(
            read_header(&mut Cursor::new(b"G0S".to_vec())),
            Err(BlockSyncError::BadMagic)
        ));
    }

    #[test]
    fn future_major_version_is_rejected() {
        let mut bytes = Vec::new();
        write_header(&mut bytes, 8192, 100).unwrap();
        bytes[6] = 0xFF;

        match read_header(&mut Cursor::new(bytes)) {
            Err(BlockSyncError::VersionMismatch { found, supported }) => {
                assert_eq!(found, 0xFF);
                assert_eq!(supported, MAJOR_VERSION);
            }
            other => panic!("expected version mismatch, got {:?}", other),
        }
    }

    #[test]
    fn index_file_round_trips() {
        let reference = b"The quick brown fox jumped over the lazy dog";

        let mut file = Vec::new();
        build_index_file(Cursor::new(reference), &mut file, 4, reference.len() as u64).unwrap();

        let loaded = load_index(Cursor::new(file)).unwrap();
        assert_eq!(loaded.header.block_size, 4);
        assert_eq!(loaded.header.file_size, reference.len() as u64);
        assert_eq!(loaded.index.block_count(), 11);

        // the tail chunk is sized by the header's file size
        assert_eq!(loaded.checksums.checksums()[10].size, 4);
    }

    #[test]
    fn trailing_partial_record_is_rejected() {
        let reference = b"abcdefgh";

        let mut file = Vec::new();
        build_index_file(Cursor::new(reference), &mut file, 4, 8).unwrap();
        file.truncate(file.len() - 3);

        assert!(matches!(
            load_index(Cursor::new(file)),
            Err(BlockSyncError::PartialChecksum)
        ));
    }
}
