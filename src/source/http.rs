//! Ranged-HTTP block requester.
//!
//! Ranges are requested with `Range: bytes=S-(E-1)` over HTTP/1.1 and only a
//! `206 Partial Content` answer is trusted. A server that responds `200`, or
//! re-encodes the body, would hand back bytes at the wrong offsets, so both
//! are hard errors, as is a body that does not exactly fill the range. Every
//! error here is fatal: retrying a server that mangles ranges cannot help.

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING, RANGE};
use reqwest::StatusCode;

use crate::source::{
    BlockSourceBase, BlockSourceOffsetResolver, BlockSourceRequester, BlockVerifier,
};
use crate::{BlockSyncError, Result};

const MB: u64 = 1024 * 1024;

/// Byte budget for in-flight HTTP payloads.
const HTTP_CONCURRENT_BYTES: u64 = 4 * MB;

pub struct HttpRequester {
    client: Client,
    url: String,
}

impl HttpRequester {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }
}

impl BlockSourceRequester for HttpRequester {
    fn do_request(&self, start_offset: u64, end_offset: u64) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={}-{}", start_offset, end_offset - 1))
            .header(ACCEPT_ENCODING, "identity")
            .send()
            .map_err(|e| {
                BlockSyncError::RequestFailed(format!(
                    "error executing request for \"{}\": {}",
                    self.url, e
                ))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(BlockSyncError::UrlNotFound(self.url.clone()));
        }
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(BlockSyncError::RangedRequestNotSupported);
        }

        let gzipped = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("gzip"))
            .unwrap_or(false);
        if gzipped {
            return Err(BlockSyncError::GzipEncoded);
        }

        let data = response
            .bytes()
            .map_err(|e| {
                BlockSyncError::RequestFailed(format!(
                    "failed to read response body for \"{}\" ({}-{}): {}",
                    self.url,
                    start_offset,
                    end_offset - 1,
                    e
                ))
            })?
            .to_vec();

        if data.len() as u64 != end_offset - start_offset {
            return Err(BlockSyncError::UnexpectedResponseLength {
                requested: end_offset - start_offset,
                received: data.len() as u64,
            });
        }

        Ok(data)
    }

    fn is_fatal(&self, _err: &BlockSyncError) -> bool {
        true
    }
}

/// A block source fetching ranges of `url` with `concurrent_requests`
/// parallel connections, verifying each delivered range when a verifier is
/// given.
pub fn http_block_source<Res>(
    url: impl Into<String>,
    concurrent_requests: usize,
    resolver: Res,
    verifier: Option<Box<dyn BlockVerifier>>,
) -> BlockSourceBase
where
    Res: BlockSourceOffsetResolver,
{
    BlockSourceBase::new(
        HttpRequester::new(url),
        resolver,
        verifier,
        concurrent_requests,
        HTTP_CONCURRENT_BYTES,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    /// How the test server answers ranged requests.
    #[derive(Clone, Copy)]
    enum ServerMode {
        Ranged,
        RangedCorrupt,
        IgnoreRange,
        ClaimGzip,
        NotFound,
        ShortBody,
    }

    /// Minimal single-purpose HTTP/1.1 server: parses the Range header and
    /// answers one request per connection.
    fn serve(content: &'static [u8], mode: ServerMode) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().unwrap();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                handle(stream, content, mode);
            }
        });

        format!("http://{}/reference", addr)
    }

    fn handle(mut stream: TcpStream, content: &'static [u8], mode: ServerMode) {
        let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
        let mut range: Option<(usize, usize)> = None;

        let mut line = String::new();
        while reader.read_line(&mut line).is_ok() {
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                break;
            }
            if let Some(bounds) = trimmed
                .strip_prefix("Range: bytes=")
                .or_else(|| trimmed.strip_prefix("range: bytes="))
            {
                let (start, end) = bounds.split_once('-').expect("range format");
                range = Some((
                    start.parse().expect("range start"),
                    end.parse::<usize>().expect("range end") + 1,
                ));
            }
            line.clear();
        }

        let respond = |stream: &mut TcpStream, status: &str, headers: &[String], body: &[u8]| {
            let mut msg = format!("HTTP/1.1 {}\r\n", status);
            for header in headers {
                msg.push_str(header);
                msg.push_str("\r\n");
            }
            msg.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()));
            let _ = stream.write_all(msg.as_bytes());
            let _ = stream.write_all(body);
        };

        match mode {
            ServerMode::NotFound => respond(&mut stream, "404 Not Found", &[], b""),
            ServerMode::IgnoreRange => respond(&mut stream, "200 OK", &[], content),
            ServerMode::Ranged | ServerMode::RangedCorrupt | ServerMode::ClaimGzip | ServerMode::ShortBody => {
                let (start, end) = range.expect("client sent no range");
                let end = end.min(content.len());
                let mut body = content[start..end].to_vec();

                match mode {
                    ServerMode::RangedCorrupt => {
                        for byte in body.iter_mut() {
                            *byte ^= 0x55;
                        }
                    }
                    ServerMode::ShortBody => {
                        body.pop();
                    }
                    _ => {}
                }

                let content_range =
                    format!("Content-Range: bytes {}-{}/{}", start, end - 1, content.len());
                let mut headers = vec![content_range];
                if matches!(mode, ServerMode::ClaimGzip) {
                    headers.push("Content-Encoding: gzip".into());
                }

                respond(&mut stream, "206 Partial Content", &headers, &body);
            }
        }
    }

    const CONTENT: &[u8] = b"The quick brown fox jumped over the lazy dog";

    #[test]
    fn fetches_the_requested_range() {
        let url = serve(CONTENT, ServerMode::Ranged);
        let requester = HttpRequester::new(url);

        assert_eq!(requester.do_request(4, 8).unwrap(), b"quic");
        assert_eq!(requester.do_request(0, 4).unwrap(), b"The ");
    }

    #[test]
    fn plain_200_is_rejected() {
        let url = serve(CONTENT, ServerMode::IgnoreRange);
        let requester = HttpRequester::new(url);

        assert!(matches!(
            requester.do_request(0, 4),
            Err(BlockSyncError::RangedRequestNotSupported)
        ));
    }

    #[test]
    fn gzip_encoding_is_rejected() {
        let url = serve(CONTENT, ServerMode::ClaimGzip);
        let requester = HttpRequester::new(url);

        assert!(matches!(
            requester.do_request(0, 4),
            Err(BlockSyncError::GzipEncoded)
        ));
    }

    #[test]
    fn missing_url_is_reported_as_not_found() {
        let url = serve(CONTENT, ServerMode::NotFound);
        let requester = HttpRequester::new(url);

        assert!(matches!(
            requester.do_request(0, 4),
            Err(BlockSyncError::UrlNotFound(_))
        ));
    }

    #[test]
    fn short_bodies_are_rejected() {
        let url = serve(CONTENT, ServerMode::ShortBody);
        let requester = HttpRequester::new(url);

        assert!(matches!(
            requester.do_request(0, 4),
            Err(BlockSyncError::UnexpectedResponseLength {
                requested: 4,
                received: 3,
            })
        ));
    }

    #[test]
    fn corrupt_server_fails_verification_and_closes_cleanly() {
        use crate::checksum::{ChecksumGenerator, HashVerifier};
        use crate::index::build_checksum_index;
        use crate::patcher::MissingBlockSpan;
        use crate::resolver::FixedSizeBlockResolver;
        use std::time::Duration;

        let url = serve(CONTENT, ServerMode::RangedCorrupt);

        let mut generator = ChecksumGenerator::new(4);
        let (_, _, lookup) =
            build_checksum_index(&mut generator, std::io::Cursor::new(CONTENT)).unwrap();

        let source = http_block_source(
            url,
            2,
            FixedSizeBlockResolver::with_file_size(4, CONTENT.len() as u64),
            Some(Box::new(HashVerifier::new(4, lookup))),
        );

        source
            .request_blocks(MissingBlockSpan {
                start_block: 0,
                end_block: 1,
                block_size: 4,
            })
            .unwrap();

        let err = source
            .errors()
            .recv_timeout(Duration::from_secs(10))
            .unwrap();
        assert!(matches!(err, BlockSyncError::VerificationFailed { .. }));

        // no payload may have been delivered, and close drains cleanly
        assert!(source.results().try_recv().is_err());
        source.close().unwrap();
    }
}
