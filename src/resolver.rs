//! Maps block ids to byte ranges and splits block spans into request-sized
//! pieces for the block source.

use crate::source::{BlockSourceOffsetResolver, QueuedRequest};

/// Resolver for a reference made of fixed-size blocks. When the file size is
/// known, the final block's end offset is clamped to it, so a request for the
/// tail asks for exactly the bytes that exist.
#[derive(Debug, Clone)]
pub struct FixedSizeBlockResolver {
    pub block_size: u64,
    pub file_size: Option<u64>,
    /// Upper bound on the byte size of a single request; zero disables
    /// splitting. Requests are never smaller than one block.
    pub max_desired_request_size: u64,
}

impl FixedSizeBlockResolver {
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            file_size: None,
            max_desired_request_size: 0,
        }
    }

    pub fn with_file_size(block_size: u64, file_size: u64) -> Self {
        Self {
            block_size,
            file_size: Some(file_size),
            max_desired_request_size: 0,
        }
    }

    pub fn max_request_size(mut self, bytes: u64) -> Self {
        self.max_desired_request_size = bytes;
        self
    }

    fn clamp(&self, offset: u64) -> u64 {
        match self.file_size {
            Some(size) => offset.min(size),
            None => offset,
        }
    }
}

impl BlockSourceOffsetResolver for FixedSizeBlockResolver {
    fn block_start_offset(&self, block_id: u32) -> u64 {
        self.clamp(u64::from(block_id) * self.block_size)
    }

    fn block_end_offset(&self, block_id: u32) -> u64 {
        self.clamp((u64::from(block_id) + 1) * self.block_size)
    }

    fn split_block_range(&self, start_block: u32, end_block: u32) -> Vec<QueuedRequest> {
        if self.max_desired_request_size == 0 {
            return vec![QueuedRequest {
                start_block,
                end_block,
            }];
        }

        let max_size = self.max_desired_request_size.max(self.block_size);
        let blocks_per_request = (max_size / self.block_size) as u32;

        let mut requests = Vec::new();
        let mut current = start_block;

        loop {
            let last = current.saturating_add(blocks_per_request - 1);
            if last >= end_block {
                requests.push(QueuedRequest {
                    start_block: current,
                    end_block,
                });
                return requests;
            }

            requests.push(QueuedRequest {
                start_block: current,
                end_block: last,
            });
            current = last + 1;
        }
    }
}
