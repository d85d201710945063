//! Sequential reconstruction of the reference file.
//!
//! The patcher walks the block range in order, copying found spans out of the
//! local file and asking a [`BlockSource`] for the missing ones. Because it
//! works strictly in output order it never writes over bytes it still needs,
//! but it also cannot patch the local file in place; callers give it a
//! separate writer.

use std::io::{Read, Seek, SeekFrom, Write};

use crossbeam_channel::Receiver;
use tracing::debug;

use crate::{BlockSyncError, Result};

/// A span of reference blocks found in the local file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoundBlockSpan {
    pub start_block: u32,
    pub end_block: u32,
    pub block_size: u64,
    /// Byte offset of the matching data in the local file.
    pub match_offset: u64,
}

/// A span of reference blocks that must be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingBlockSpan {
    pub start_block: u32,
    pub end_block: u32,
    pub block_size: u64,
}

/// Payload delivered by a block source. `data` covers one resolved request
/// starting at `start_block`; the final block of the reference may make it
/// shorter than a whole number of blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockResponse {
    pub start_block: u32,
    pub data: Vec<u8>,
}

/// Where reference blocks come from. The source is assumed to be slow and
/// benefit from pipelining, so the patcher may queue several spans before
/// consuming results; delivery order is ascending start block regardless.
pub trait BlockSource {
    fn request_blocks(&self, span: MissingBlockSpan) -> Result<()>;

    /// Responses, in ascending start-block order.
    fn results(&self) -> &Receiver<BlockResponse>;

    /// At most one terminal error.
    fn errors(&self) -> &Receiver<BlockSyncError>;
}

fn span_bytes(span: &MissingBlockSpan) -> u64 {
    u64::from(span.end_block - span.start_block + 1) * span.block_size
}

/// Reconstruct the reference by interleaving local copies and fetched spans
/// in strict block order.
///
/// `found` and `missing` must be sorted, disjoint, and together cover the
/// whole block range. `reference_size` bounds the bytes copied for a span
/// containing the short final block. `max_block_storage` caps the payload
/// bytes requested ahead of the cursor; the span the cursor waits on is
/// always requested, whatever the budget.
pub fn patch_sequentially<L, S, W>(
    local: &mut L,
    source: &S,
    missing: &[MissingBlockSpan],
    found: &[FoundBlockSpan],
    reference_size: u64,
    max_block_storage: u64,
    output: &mut W,
) -> Result<()>
where
    L: Read + Seek,
    S: BlockSource + ?Sized,
    W: Write,
{
    let max_block = match (
        found.last().map(|s| s.end_block),
        missing.last().map(|s| s.end_block),
    ) {
        (Some(f), Some(m)) => f.max(m),
        (Some(f), None) => f,
        (None, Some(m)) => m,
        (None, None) => return Ok(()),
    };

    let mut found_head = 0;
    // spans consumed so far vs. spans already requested from the source
    let mut missing_head = 0;
    let mut requested = 0;
    let mut outstanding_bytes: u64 = 0;

    let results = source.results().clone();
    let errors = source.errors().clone();

    let mut current_block: u32 = 0;

    while current_block <= max_block {
        if found_head < found.len()
            && found[found_head].start_block <= current_block
            && current_block <= found[found_head].end_block
        {
            let span = &found[found_head];
            let block_count = u64::from(span.end_block - span.start_block + 1);
            let span_start = u64::from(span.start_block) * span.block_size;
            let length = (block_count * span.block_size)
                .min(reference_size.saturating_sub(span_start));

            local.seek(SeekFrom::Start(span.match_offset))?;
            let copied = std::io::copy(&mut local.by_ref().take(length), output)?;
            if copied != length {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "local file ended {} bytes into a {} byte matched span",
                        copied, length
                    ),
                )
                .into());
            }

            current_block = span.end_block + 1;
            found_head += 1;
        } else if missing_head < missing.len()
            && missing[missing_head].start_block <= current_block
            && current_block <= missing[missing_head].end_block
        {
            // top up the request pipeline: the span being waited on
            // unconditionally, later spans while the budget holds
            while requested < missing.len()
                && (requested == missing_head
                    || outstanding_bytes + span_bytes(&missing[requested]) <= max_block_storage)
            {
                source.request_blocks(missing[requested])?;
                outstanding_bytes += span_bytes(&missing[requested]);
                requested += 1;
            }

            crossbeam_channel::select! {
                recv(results) -> response => {
                    let response = response.map_err(|_| {
                        BlockSyncError::RequestFailed("block source closed unexpectedly".into())
                    })?;

                    if response.start_block != current_block {
                        return Err(BlockSyncError::UnexpectedBlockDelivery {
                            expected: current_block,
                            received: response.start_block,
                        });
                    }
                    if response.data.is_empty() {
                        return Err(BlockSyncError::UnexpectedResponseLength {
                            requested: missing[missing_head].block_size,
                            received: 0,
                        });
                    }

                    output.write_all(&response.data)?;

                    let block_size = missing[missing_head].block_size;
                    let advance = (response.data.len() as u64).div_ceil(block_size);
                    current_block += advance as u32;

                    // a split span spreads over several responses; it is done
                    // once the cursor passes its end
                    if current_block > missing[missing_head].end_block {
                        outstanding_bytes =
                            outstanding_bytes.saturating_sub(span_bytes(&missing[missing_head]));
                        missing_head += 1;
                    }
                },
                recv(errors) -> err => {
                    let err = err.map_err(|_| {
                        BlockSyncError::RequestFailed("block source closed unexpectedly".into())
                    })?;
                    debug!("patching aborted by block source: {}", err);
                    return Err(err);
                },
            }
        } else {
            return Err(BlockSyncError::BlockNotInEitherList(current_block));
        }
    }

    Ok(())
}
