//! Decoder for HTTP chunked transfer encoding.
//!
//! See [RFC 9112 Section 7.1](https://www.rfc-editor.org/rfc/rfc9112#section-7.1).
//!
//! The decoder is a pure state machine over byte slices: [`ChunkedDecoder::feed`] consumes
//! as much input as it can, appending the decoded payload to an internal buffer which is
//! handed out with [`ChunkedDecoder::drain_to`]. State survives between calls, so chunk
//! boundaries do not need to line up with read boundaries.

use bytes::BytesMut;
use http::StatusCode;
use tracing::trace;
use ChunkedState::*;

use crate::protocol::ChunkedError;

/// Longest size or trailer line accepted, CRLF excluded.
pub const MAX_CHUNK_LINE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    /// Accumulating a `size [; extensions]` line
    ReadingSize,
    /// Copying chunk payload
    ReadingData,
    /// Expecting the CRLF that closes a chunk
    ReadingChunkCrlf,
    /// Skipping trailer lines up to the blank line
    ReadingTrailers,
    Done,
    Error,
}

/// A decoder for handling HTTP chunked transfer encoding.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkedState,
    /// bytes still expected in the current chunk
    remaining: u64,
    /// payload bytes decoded so far
    total: u64,
    line: BytesMut,
    decoded: BytesMut,
    error: Option<ChunkedError>,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ReadingSize,
            remaining: 0,
            total: 0,
            line: BytesMut::new(),
            decoded: BytesMut::new(),
            error: None,
        }
    }

    /// Advances the state machine over `src`.
    ///
    /// Returns the number of bytes consumed. Once the decoder is done, bytes past the
    /// final blank line are left unconsumed: they belong to the next request.
    /// `max_body` bounds the total decoded payload, checked before any byte is buffered.
    pub fn feed(&mut self, src: &[u8], max_body: Option<u64>) -> usize {
        let mut consumed = 0;

        while consumed < src.len() && !self.is_terminal() {
            match self.step(&src[consumed..], max_body) {
                Ok(n) => consumed += n,
                Err(e) => {
                    trace!(cause = %e, "invalid chunked body");
                    self.state = Error;
                    self.error = Some(e);
                    break;
                }
            }
        }

        consumed
    }

    /// Moves the decoded payload into `dest`.
    pub fn drain_to(&mut self, dest: &mut BytesMut) {
        dest.extend_from_slice(&self.decoded);
        self.decoded.clear();
    }

    /// Takes the decoded payload without copying.
    pub fn take_decoded(&mut self) -> BytesMut {
        self.decoded.split()
    }

    pub fn has_decoded(&self) -> bool {
        !self.decoded.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.state == Done
    }

    pub fn is_error(&self) -> bool {
        self.state == Error
    }

    pub fn error(&self) -> Option<&ChunkedError> {
        self.error.as_ref()
    }

    /// The status to answer with, `200 OK` unless the decoder failed.
    pub fn status_code(&self) -> StatusCode {
        self.error.as_ref().map_or(StatusCode::OK, ChunkedError::status_code)
    }

    /// Total payload bytes decoded so far.
    pub fn total(&self) -> u64 {
        self.total
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, Done | Error)
    }

    fn step(&mut self, src: &[u8], max_body: Option<u64>) -> Result<usize, ChunkedError> {
        match self.state {
            ReadingSize => self.read_size(src),
            ReadingData => self.read_data(src, max_body),
            ReadingChunkCrlf => self.read_chunk_crlf(src),
            ReadingTrailers => self.read_trailer(src),
            Done | Error => Ok(0),
        }
    }

    /// Accumulates bytes into the line buffer until a LF shows up.
    ///
    /// Returns the bytes consumed, and whether the line is complete. The line must end
    /// with CRLF; the CR is stripped from the buffer.
    fn accumulate_line(&mut self, src: &[u8]) -> Result<(usize, bool), ChunkedError> {
        match src.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                self.push_line(&src[..pos])?;
                if self.line.last() != Some(&b'\r') {
                    return Err(ChunkedError::Malformed { reason: "line not terminated by CRLF" });
                }
                self.line.truncate(self.line.len() - 1);
                Ok((pos + 1, true))
            }
            None => {
                self.push_line(src)?;
                Ok((src.len(), false))
            }
        }
    }

    fn push_line(&mut self, bytes: &[u8]) -> Result<(), ChunkedError> {
        // the CR of the terminator may already be buffered, hence the extra byte
        if self.line.len() + bytes.len() > MAX_CHUNK_LINE + 1 {
            return Err(ChunkedError::Malformed { reason: "line too long" });
        }
        self.line.extend_from_slice(bytes);
        Ok(())
    }

    /// Reads a `size [; extensions] CRLF` line.
    ///
    /// Extensions are ignored, blanks around the size are tolerated, and the hex value is
    /// overflow checked. A zero size moves on to the trailers.
    fn read_size(&mut self, src: &[u8]) -> Result<usize, ChunkedError> {
        let (consumed, complete) = self.accumulate_line(src)?;
        if !complete {
            return Ok(consumed);
        }

        let size = parse_chunk_size(&self.line)?;
        self.line.clear();

        trace!(size, "read chunk size");
        if size == 0 {
            self.state = ReadingTrailers;
        } else {
            self.remaining = size;
            self.state = ReadingData;
        }
        Ok(consumed)
    }

    /// Copies chunk payload, enforcing `max_body` before buffering.
    fn read_data(&mut self, src: &[u8], max_body: Option<u64>) -> Result<usize, ChunkedError> {
        let len = self.remaining.min(src.len() as u64);

        if let Some(limit) = max_body {
            if self.total + len > limit {
                return Err(ChunkedError::TooLarge { limit });
            }
        }

        // len is bounded by src.len()
        let len = len as usize;
        self.decoded.extend_from_slice(&src[..len]);
        self.total += len as u64;
        self.remaining -= len as u64;

        if self.remaining == 0 {
            self.state = ReadingChunkCrlf;
        }
        Ok(len)
    }

    /// Checks the CRLF after a chunk, byte by byte since it may be split across feeds.
    fn read_chunk_crlf(&mut self, src: &[u8]) -> Result<usize, ChunkedError> {
        const CRLF: &[u8; 2] = b"\r\n";

        let expected = CRLF[self.line.len()];
        if src[0] != expected {
            return Err(ChunkedError::Malformed { reason: "chunk data not followed by CRLF" });
        }

        self.line.extend_from_slice(&src[..1]);
        if self.line.len() == CRLF.len() {
            self.line.clear();
            self.state = ReadingSize;
        }
        Ok(1)
    }

    /// Reads trailer lines; non-empty ones are ignored, the blank one ends the body.
    fn read_trailer(&mut self, src: &[u8]) -> Result<usize, ChunkedError> {
        let (consumed, complete) = self.accumulate_line(src)?;
        if !complete {
            return Ok(consumed);
        }

        if self.line.is_empty() {
            trace!(total = self.total, "finished reading chunked data");
            self.state = Done;
        } else {
            self.line.clear();
        }
        Ok(consumed)
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ChunkedError> {
    let size_part = match line.iter().position(|b| *b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let size_part = size_part.trim_ascii();

    if size_part.is_empty() {
        return Err(ChunkedError::Malformed { reason: "missing chunk size" });
    }

    size_part.iter().try_fold(0u64, |acc, b| {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(ChunkedError::Malformed { reason: "invalid chunk size" }),
        };
        acc.checked_mul(16)
            .and_then(|v| v.checked_add(u64::from(digit)))
            .ok_or(ChunkedError::Malformed { reason: "chunk size overflow" })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(src: &[u8], max_body: Option<u64>) -> (ChunkedDecoder, BytesMut, usize) {
        let mut decoder = ChunkedDecoder::new();
        let consumed = decoder.feed(src, max_body);
        let mut out = BytesMut::new();
        decoder.drain_to(&mut out);
        (decoder, out, consumed)
    }

    #[test]
    fn test_basic() {
        let src = b"10\r\n1234567890abcdef\r\n0\r\n\r\n";
        let (decoder, out, consumed) = decode_all(src, None);

        assert!(decoder.is_done());
        assert_eq!(&out[..], b"1234567890abcdef");
        assert_eq!(consumed, src.len());
        assert_eq!(decoder.total(), 16);
    }

    #[test]
    fn test_multiple_chunks() {
        let (decoder, out, _) = decode_all(b"5\r\nhello\r\n7\r\n, world\r\n0\r\n\r\n", None);

        assert!(decoder.is_done());
        assert_eq!(&out[..], b"hello, world");
    }

    #[test]
    fn test_chunks_with_extensions_and_blanks() {
        let (decoder, out, _) = decode_all(b"5;chunk-ext=value\r\nhello\r\n 3 \r\nabc\r\n0\r\n\r\n", None);

        assert!(decoder.is_done());
        assert_eq!(&out[..], b"helloabc");
    }

    #[test]
    fn test_chunks_with_trailers() {
        let (decoder, out, _) = decode_all(b"5\r\nhello\r\n0\r\nTrailer: value\r\nX-Other: 1\r\n\r\n", None);

        assert!(decoder.is_done());
        assert_eq!(&out[..], b"hello");
    }

    #[test]
    fn test_bytes_after_done_are_not_consumed() {
        let src = b"3\r\nabc\r\n0\r\n\r\nGET / HTTP/1.1\r\n";
        let (decoder, _, consumed) = decode_all(src, None);

        assert!(decoder.is_done());
        assert_eq!(&src[consumed..], b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn test_split_invariance() {
        let src: &[u8] = b"4\r\nWiki\r\n5;x=y\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\nT: v\r\n\r\n";
        let (_, expected, _) = decode_all(src, None);
        assert_eq!(&expected[..], b"Wikipedia in\r\n\r\nchunks.");

        for split in 1..src.len() {
            let mut decoder = ChunkedDecoder::new();
            let mut out = BytesMut::new();

            let first = decoder.feed(&src[..split], None);
            assert_eq!(first, split, "split at {split}");
            let second = decoder.feed(&src[split..], None);
            assert_eq!(second, src.len() - split, "split at {split}");

            decoder.drain_to(&mut out);
            assert!(decoder.is_done(), "split at {split}");
            assert_eq!(out, expected, "split at {split}");
        }

        // one byte at a time
        let mut decoder = ChunkedDecoder::new();
        for b in src {
            assert_eq!(decoder.feed(std::slice::from_ref(b), None), 1);
        }
        assert!(decoder.is_done());
        assert_eq!(decoder.take_decoded(), expected);
    }

    #[test]
    fn test_incomplete_chunk() {
        let mut decoder = ChunkedDecoder::new();
        decoder.feed(b"5\r\nhel", None);

        assert!(!decoder.is_done());
        assert!(!decoder.is_error());
        assert_eq!(&decoder.take_decoded()[..], b"hel");

        decoder.feed(b"lo\r\n0\r\n\r\n", None);
        assert!(decoder.is_done());
        assert_eq!(&decoder.take_decoded()[..], b"lo");
    }

    #[test]
    fn test_invalid_chunk_size() {
        let (decoder, _, _) = decode_all(b"xyz\r\n", None);
        assert!(decoder.is_error());
        assert_eq!(decoder.status_code(), StatusCode::BAD_REQUEST);

        let (decoder, _, _) = decode_all(b"\r\n", None);
        assert!(decoder.is_error());

        let (decoder, _, _) = decode_all(b"1ffffffffffffffff\r\n", None);
        assert!(decoder.is_error());
    }

    #[test]
    fn test_missing_crlf() {
        let (decoder, out, _) = decode_all(b"5\r\nhelloBad", None);

        assert!(decoder.is_error());
        assert_eq!(&out[..], b"hello");
        assert_eq!(decoder.status_code(), StatusCode::BAD_REQUEST);

        // bare LF after the size
        let (decoder, _, _) = decode_all(b"5\nhello\r\n", None);
        assert!(decoder.is_error());
    }

    #[test]
    fn test_too_long_size_line() {
        let mut src = b"5;".to_vec();
        src.extend(vec![b'a'; MAX_CHUNK_LINE]);

        let (decoder, _, _) = decode_all(&src, None);
        assert!(decoder.is_error());
        assert_eq!(decoder.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_too_long_trailer_line() {
        let mut src = b"0\r\nX-Trailer: ".to_vec();
        src.extend(vec![b'a'; MAX_CHUNK_LINE]);

        let (decoder, _, _) = decode_all(&src, None);
        assert!(decoder.is_error());
    }

    #[test]
    fn test_over_cap() {
        let (decoder, _, _) = decode_all(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n", Some(10));

        assert!(decoder.is_error());
        assert_eq!(decoder.status_code(), StatusCode::PAYLOAD_TOO_LARGE);

        let (decoder, out, _) = decode_all(b"5\r\nhello\r\n5\r\nworld\r\n0\r\n\r\n", Some(10));
        assert!(decoder.is_done());
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn test_cap_is_checked_before_the_chunk_completes() {
        let mut decoder = ChunkedDecoder::new();
        decoder.feed(b"100\r\n", Some(16));
        assert!(!decoder.is_error());

        decoder.feed(&[b'a'; 17], Some(16));
        assert!(decoder.is_error());
        assert!(!decoder.has_decoded());
    }

    #[test]
    fn test_terminal_states_consume_nothing() {
        let mut decoder = ChunkedDecoder::new();
        decoder.feed(b"zz\r\n", None);
        assert!(decoder.is_error());
        assert_eq!(decoder.feed(b"5\r\nhello\r\n", None), 0);

        let mut decoder = ChunkedDecoder::new();
        decoder.feed(b"0\r\n\r\n", None);
        assert!(decoder.is_done());
        assert_eq!(decoder.feed(b"0\r\n\r\n", None), 0);
    }

    #[test]
    fn test_large_chunk() {
        let size = 1024 * 1024;
        let mut data = Vec::with_capacity(size + 16);
        data.extend(format!("{:x}\r\n", size).into_bytes());
        data.extend(vec![b'A'; size]);
        data.extend(b"\r\n0\r\n\r\n");

        let (decoder, out, _) = decode_all(&data, None);
        assert!(decoder.is_done());
        assert_eq!(out.len(), size);
        assert!(out.iter().all(|&b| b == b'A'));
    }

    #[test]
    fn test_zero_size_chunk() {
        let (decoder, out, _) = decode_all(b"0\r\n\r\n", None);
        assert!(decoder.is_done());
        assert!(out.is_empty());
    }
}
