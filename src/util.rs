use std::io::{self, ErrorKind, Read};
use std::path::Path;

/// Read until `buf` is full or the stream ends. Unlike `read_exact`, a clean
/// end of stream is not an error; the caller gets the short count.
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Check whether two paths refer to the same underlying file. Paths that do
/// not exist compare as different.
pub fn is_same_file(path1: &Path, path2: &Path) -> io::Result<bool> {
    let meta1 = match std::fs::metadata(path1) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let meta2 = match std::fs::metadata(path2) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    Ok(same_file_platform(&meta1, &meta2))
}

#[cfg(unix)]
fn same_file_platform(meta1: &std::fs::Metadata, meta2: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    meta1.dev() == meta2.dev() && meta1.ino() == meta2.ino()
}

#[cfg(not(unix))]
fn same_file_platform(meta1: &std::fs::Metadata, meta2: &std::fs::Metadata) -> bool {
    // Best effort without inode identity.
    meta1.len() == meta2.len() && meta1.modified().ok() == meta2.modified().ok()
}
