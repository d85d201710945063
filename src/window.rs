//! Sliding-window byte storage for the scanner.
//!
//! `WindowBuffer` keeps the last block-size bytes written *and* the bytes the
//! most recent write pushed out, each readable as one contiguous slice. It
//! does this with two mirrored ring buffers of twice the block size whose
//! write heads are offset by the block size: at any moment one mirror holds
//! the window (plus the preceding eviction run) without wrapping. Every byte
//! is written twice, and after the initial fill no call here allocates.
//!
//! Writes must not exceed the block size; the scanner feeds at most one block
//! at a time.

pub struct WindowBuffer {
    // byte count of the most recent write, for evicted()
    last_written: usize,
    // lifetime total; len() caps it at block_size
    total_written: usize,
    block_size: usize,
    a: MirrorBuffer,
    b: MirrorBuffer,
}

struct MirrorBuffer {
    base_offset: usize,
    head: usize,
    buf: Vec<u8>,
}

impl MirrorBuffer {
    fn new(block_size: usize, base_offset: usize) -> Self {
        Self {
            base_offset,
            head: base_offset,
            buf: vec![0; block_size * 2],
        }
    }

    fn reset(&mut self) {
        self.head = self.base_offset;
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let space = self.buf.len() - self.head;
            let n = remaining.len().min(space);
            self.buf[self.head..self.head + n].copy_from_slice(&remaining[..n]);
            self.head += n;
            if self.head == self.buf.len() {
                self.head = 0;
            }
            remaining = &remaining[n..];
        }
    }
}

impl WindowBuffer {
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0, "window block size must be non-zero");
        Self {
            last_written: 0,
            total_written: 0,
            block_size,
            a: MirrorBuffer::new(block_size, 0),
            b: MirrorBuffer::new(block_size, block_size),
        }
    }

    pub fn reset(&mut self) {
        self.a.reset();
        self.b.reset();
        self.last_written = 0;
        self.total_written = 0;
    }

    /// Append bytes to the window. At most one block per call.
    pub fn write(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.block_size);
        self.a.write(bytes);
        self.b.write(bytes);
        self.last_written = bytes.len();
        self.total_written += bytes.len();
    }

    /// Current window length, at most the block size.
    pub fn len(&self) -> usize {
        self.total_written.min(self.block_size)
    }

    pub fn is_empty(&self) -> bool {
        self.total_written == 0
    }

    // The mirror whose head is further along holds the window contiguously
    // just below it; the other mirror holds the eviction run contiguously
    // just above its head.
    fn window_mirror(&self) -> &MirrorBuffer {
        if self.b.head > self.a.head {
            &self.b
        } else {
            &self.a
        }
    }

    fn eviction_mirror(&self) -> &MirrorBuffer {
        if self.b.head < self.a.head {
            &self.b
        } else {
            &self.a
        }
    }

    /// The current window contents, oldest byte first.
    pub fn get_block(&self) -> &[u8] {
        let mirror = self.window_mirror();
        let start = mirror.head - self.len();
        &mirror.buf[start..mirror.head]
    }

    /// The bytes displaced by the most recent write.
    pub fn evicted(&self) -> &[u8] {
        if self.total_written <= self.block_size {
            return &[];
        }

        let mirror = self.eviction_mirror();
        let end = mirror.head + self.block_size;

        // a write that also filled the last free space evicts fewer
        // bytes than it wrote
        let mut length = self.last_written;
        if self.total_written - self.last_written < self.block_size {
            length = self.total_written - self.block_size;
        }

        &mirror.buf[end - length..end]
    }

    /// Shorten the window by `count` bytes from the left, returning the bytes
    /// removed.
    pub fn truncate(&mut self, count: usize) -> &[u8] {
        let len = self.len();
        let count = count.min(len);
        self.total_written = len - count;

        let mirror = if self.b.head > self.a.head {
            &self.b
        } else {
            &self.a
        };
        let start = mirror.head - len;
        &mirror.buf[start..start + count]
    }
}
