//! Block source over anything seekable, for references on the local
//! filesystem (or in memory, in tests).

use std::io::{Read, Seek, SeekFrom};
use std::sync::Mutex;

use crate::source::{BlockSourceBase, BlockSourceOffsetResolver, BlockSourceRequester};
use crate::util::read_full;
use crate::Result;

const MB: u64 = 1024 * 1024;

/// Requester that seeks and reads. Worker threads share it, so the reader
/// sits behind a mutex; a seekable file is cheap enough to serialize.
pub struct ReadSeekerRequester<R> {
    reader: Mutex<R>,
}

impl<R: Read + Seek + Send + 'static> ReadSeekerRequester<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: Mutex::new(reader),
        }
    }
}

impl<R: Read + Seek + Send + 'static> BlockSourceRequester for ReadSeekerRequester<R> {
    fn do_request(&self, start_offset: u64, end_offset: u64) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; (end_offset - start_offset) as usize];

        let mut reader = self.reader.lock().expect("reader poisoned");
        reader.seek(SeekFrom::Start(start_offset))?;
        let n = read_full(&mut *reader, &mut buffer)?;

        buffer.truncate(n);
        Ok(buffer)
    }
}

/// A block source reading from a seekable reference with no verification;
/// the bytes come from the same medium the checksums did.
pub fn read_seeker_block_source<R, Res>(reader: R, resolver: Res) -> BlockSourceBase
where
    R: Read + Seek + Send + 'static,
    Res: BlockSourceOffsetResolver,
{
    BlockSourceBase::new(ReadSeekerRequester::new(reader), resolver, None, 1, 8 * MB)
}
