//! Incremental `multipart/form-data` parser.
//!
//! ```text
//! preamble CRLF
//! --boundary CRLF
//! part headers CRLF
//! CRLF
//! part data
//! CRLF --boundary CRLF
//! ...
//! CRLF --boundary-- [epilogue]
//! ```
//!
//! Part data is forwarded to the sink as soon as it is known not to be the start of a
//! delimiter, so only an overlap window of `max(boundary_len + 8, 256)` bytes is kept back
//! while no delimiter is visible.

use bytes::{Buf, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};
use tracing::trace;

use crate::protocol::MultipartError;

/// Per-part header block limit.
const MAX_PART_HEADER_BYTES: usize = 64 * 1024;

/// Per-line limit inside a part header block.
const MAX_PART_LINE_BYTES: usize = 8 * 1024;

const MAX_BOUNDARY_LEN: usize = 70;

/// Receives the parts found by [`MultipartStreamParser::feed`].
///
/// Called synchronously from within `feed`: `on_part_begin` once per part after its
/// header block, `on_part_data` zero or more times with raw part bytes, `on_part_end`
/// once the delimiter after the part was seen.
pub trait PartSink {
    fn on_part_begin(&mut self, headers: &HeaderMap);

    fn on_part_data(&mut self, data: &[u8]);

    fn on_part_end(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipartStatus {
    /// More input is needed
    More,
    /// The closing boundary was seen
    Done,
    /// The body is malformed, see [`MultipartStreamParser::error`]
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    Headers,
    Data,
    Done,
    Error,
}

/// Outcome of one parsing step.
enum Step {
    Progress,
    NeedMore,
}

#[derive(Debug)]
pub struct MultipartStreamParser {
    state: State,
    /// `--boundary`
    dash_boundary: Vec<u8>,
    /// `CRLF--boundary`
    delimiter: Vec<u8>,
    buffer: BytesMut,
    /// Whether the buffered preamble starts at the beginning of a line
    at_line_start: bool,
    headers: HeaderMap,
    header_bytes: usize,
    error: Option<MultipartError>,
}

impl Default for MultipartStreamParser {
    fn default() -> Self {
        Self {
            state: State::Error,
            dash_boundary: Vec::new(),
            delimiter: Vec::new(),
            buffer: BytesMut::new(),
            at_line_start: true,
            headers: HeaderMap::new(),
            header_bytes: 0,
            error: Some(MultipartError::InvalidBoundary),
        }
    }
}

impl MultipartStreamParser {
    /// Creates a parser for one body delimited by `boundary`.
    pub fn new(boundary: &str) -> Self {
        let mut parser = Self::default();
        parser.reset(boundary);
        parser
    }

    /// Re-initialises the parser for a new body.
    ///
    /// The boundary must be 1 to 70 characters of `[A-Za-z0-9._+-]`, otherwise the parser
    /// enters the error state right away.
    pub fn reset(&mut self, boundary: &str) {
        self.buffer.clear();
        self.at_line_start = true;
        self.headers.clear();
        self.header_bytes = 0;

        if !is_valid_boundary(boundary) {
            self.fail(MultipartError::InvalidBoundary);
            return;
        }

        self.dash_boundary = [b"--".as_slice(), boundary.as_bytes()].concat();
        self.delimiter = [b"\r\n--".as_slice(), boundary.as_bytes()].concat();
        self.error = None;
        self.state = State::Preamble;
    }

    pub fn error(&self) -> Option<&MultipartError> {
        self.error.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Checks that the body ended with the closing boundary.
    pub fn finish(&self) -> Result<(), MultipartError> {
        match self.state {
            State::Done => Ok(()),
            State::Error => Err(self.error.clone().unwrap_or(MultipartError::MalformedDelimiter)),
            _ => Err(MultipartError::Truncated),
        }
    }

    /// Feeds body bytes, invoking `sink` for every part event they complete.
    ///
    /// Once `Done` or `Error` was returned further input is ignored.
    pub fn feed<S: PartSink + ?Sized>(&mut self, data: &[u8], sink: &mut S) -> MultipartStatus {
        match self.state {
            State::Done => return MultipartStatus::Done,
            State::Error => return MultipartStatus::Error,
            _ => {}
        }

        self.buffer.extend_from_slice(data);

        loop {
            let step = match self.state {
                State::Preamble => self.read_preamble(),
                State::Headers => self.read_headers(sink),
                State::Data => self.read_data(sink),
                State::Done => return MultipartStatus::Done,
                State::Error => return MultipartStatus::Error,
            };

            match step {
                Ok(Step::Progress) => continue,
                Ok(Step::NeedMore) => return MultipartStatus::More,
                Err(e) => {
                    trace!(cause = %e, "invalid multipart body");
                    self.fail(e);
                    return MultipartStatus::Error;
                }
            }
        }
    }

    fn fail(&mut self, e: MultipartError) {
        self.state = State::Error;
        self.error = Some(e);
        self.buffer.clear();
    }

    fn overlap_window(&self) -> usize {
        (self.dash_boundary.len() + 8).max(256)
    }

    /// Skips the preamble up to the first `--boundary` line.
    ///
    /// A `--boundary` only counts at the very start of the body or right after a CRLF.
    fn read_preamble(&mut self) -> Result<Step, MultipartError> {
        let found = if self.at_line_start && self.buffer.starts_with(&self.dash_boundary) {
            Some(0)
        } else {
            find(&self.buffer, &self.delimiter).map(|pos| pos + 2)
        };

        let Some(start) = found else {
            let window = self.overlap_window();
            if self.buffer.len() > window {
                let discard = self.buffer.len() - window;
                self.at_line_start = self.buffer[..discard].ends_with(b"\r\n");
                self.buffer.advance(discard);
            }
            return Ok(Step::NeedMore);
        };

        let after = start + self.dash_boundary.len();
        let Some(&[first, second]) = self.buffer.get(after..after + 2) else {
            self.buffer.advance(start);
            self.at_line_start = true;
            return Ok(Step::NeedMore);
        };

        match &[first, second] {
            b"\r\n" => {
                self.buffer.advance(after + 2);
                self.state = State::Headers;
                Ok(Step::Progress)
            }
            b"--" => {
                self.buffer.clear();
                self.state = State::Done;
                Ok(Step::Progress)
            }
            _ => Err(MultipartError::MalformedDelimiter),
        }
    }

    /// Parses one header line, or starts the part on the blank line.
    fn read_headers<S: PartSink + ?Sized>(&mut self, sink: &mut S) -> Result<Step, MultipartError> {
        let Some(pos) = find(&self.buffer, b"\r\n") else {
            if self.buffer.len() > MAX_PART_LINE_BYTES {
                return Err(MultipartError::TooLongLine { max_size: MAX_PART_LINE_BYTES });
            }
            if self.header_bytes + self.buffer.len() > MAX_PART_HEADER_BYTES {
                return Err(MultipartError::TooLargeHeader { max_size: MAX_PART_HEADER_BYTES });
            }
            return Ok(Step::NeedMore);
        };

        if pos > MAX_PART_LINE_BYTES {
            return Err(MultipartError::TooLongLine { max_size: MAX_PART_LINE_BYTES });
        }
        self.header_bytes += pos + 2;
        if self.header_bytes > MAX_PART_HEADER_BYTES {
            return Err(MultipartError::TooLargeHeader { max_size: MAX_PART_HEADER_BYTES });
        }

        let line = self.buffer.split_to(pos + 2);
        let line = &line[..pos];

        if line.is_empty() {
            trace!(headers = self.headers.len(), "multipart part begin");
            sink.on_part_begin(&self.headers);
            self.state = State::Data;
            return Ok(Step::Progress);
        }

        let (name, value) = parse_header_line(line)?;
        self.headers.append(name, value);
        Ok(Step::Progress)
    }

    /// Streams part data up to the next delimiter.
    fn read_data<S: PartSink + ?Sized>(&mut self, sink: &mut S) -> Result<Step, MultipartError> {
        let Some(pos) = find(&self.buffer, &self.delimiter) else {
            let window = self.overlap_window();
            if self.buffer.len() > window {
                let emit = self.buffer.len() - window;
                sink.on_part_data(&self.buffer[..emit]);
                self.buffer.advance(emit);
            }
            return Ok(Step::NeedMore);
        };

        if pos > 0 {
            sink.on_part_data(&self.buffer[..pos]);
            self.buffer.advance(pos);
        }

        // regular and closing delimiters share a prefix, peek at what follows
        let after = self.delimiter.len();
        let Some(&[first, second]) = self.buffer.get(after..after + 2) else {
            return Ok(Step::NeedMore);
        };

        match &[first, second] {
            b"\r\n" => {
                sink.on_part_end();
                self.buffer.advance(after + 2);
                self.headers.clear();
                self.header_bytes = 0;
                self.state = State::Headers;
                Ok(Step::Progress)
            }
            b"--" => {
                sink.on_part_end();
                trace!("multipart closing boundary");
                // the epilogue is ignored
                self.buffer.clear();
                self.state = State::Done;
                Ok(Step::Progress)
            }
            _ => Err(MultipartError::MalformedDelimiter),
        }
    }
}

fn is_valid_boundary(boundary: &str) -> bool {
    (1..=MAX_BOUNDARY_LEN).contains(&boundary.len())
        && boundary.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'+' | b'-'))
}

fn parse_header_line(line: &[u8]) -> Result<(HeaderName, HeaderValue), MultipartError> {
    let colon = line
        .iter()
        .position(|b| *b == b':')
        .ok_or_else(|| MultipartError::InvalidHeader { reason: "missing colon".to_string() })?;

    // HeaderName lower-cases and rejects non token characters, including blanks
    let name = HeaderName::from_bytes(&line[..colon])
        .map_err(|e| MultipartError::InvalidHeader { reason: e.to_string() })?;
    let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii())
        .map_err(|e| MultipartError::InvalidHeader { reason: e.to_string() })?;

    Ok((name, value))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[derive(Debug, Default, PartialEq, Eq)]
    struct Part {
        disposition: String,
        data: Vec<u8>,
        ended: bool,
    }

    #[derive(Debug, Default)]
    struct Recorder {
        parts: Vec<Part>,
    }

    impl PartSink for Recorder {
        fn on_part_begin(&mut self, headers: &HeaderMap) {
            let disposition =
                headers.get("content-disposition").and_then(|v| v.to_str().ok()).unwrap_or_default().to_string();
            self.parts.push(Part { disposition, ..Default::default() });
        }

        fn on_part_data(&mut self, data: &[u8]) {
            let part = self.parts.last_mut().expect("data before begin");
            assert!(!part.ended);
            part.data.extend_from_slice(data);
        }

        fn on_part_end(&mut self) {
            self.parts.last_mut().expect("end before begin").ended = true;
        }
    }

    fn body() -> String {
        indoc! {r#"
            this is the preamble
            --XyZ-42
            Content-Disposition: form-data; name="title"

            hello
            --XyZ-42
            Content-Disposition: form-data; name="file"; filename="a.txt"
            Content-Type: text/plain

            line one
            --XyZ-4 is not a boundary
            line three
            --XyZ-42--
            epilogue
        "#}
        .replace('\n', "\r\n")
    }

    fn parse_whole(body: &[u8]) -> (MultipartStatus, Recorder) {
        let mut parser = MultipartStreamParser::new("XyZ-42");
        let mut sink = Recorder::default();
        let status = parser.feed(body, &mut sink);
        (status, sink)
    }

    #[test]
    fn parse_two_parts() {
        let (status, sink) = parse_whole(body().as_bytes());

        assert_eq!(status, MultipartStatus::Done);
        assert_eq!(sink.parts.len(), 2);
        assert_eq!(sink.parts[0].disposition, r#"form-data; name="title""#);
        assert_eq!(sink.parts[0].data, b"hello");
        assert!(sink.parts[0].ended);
        assert_eq!(sink.parts[1].data, b"line one\r\n--XyZ-4 is not a boundary\r\nline three");
        assert!(sink.parts[1].ended);
    }

    #[test]
    fn split_invariance() {
        let body = body();
        let body = body.as_bytes();
        let (_, whole) = parse_whole(body);

        for split in 1..body.len() {
            let mut parser = MultipartStreamParser::new("XyZ-42");
            let mut sink = Recorder::default();

            let first = parser.feed(&body[..split], &mut sink);
            assert_ne!(first, MultipartStatus::Error, "split at {split}");
            let second = parser.feed(&body[split..], &mut sink);

            assert_eq!(second, MultipartStatus::Done, "split at {split}");
            assert_eq!(sink.parts, whole.parts, "split at {split}");
        }

        let mut parser = MultipartStreamParser::new("XyZ-42");
        let mut sink = Recorder::default();
        let mut status = MultipartStatus::More;
        for b in body {
            status = parser.feed(std::slice::from_ref(b), &mut sink);
        }
        assert_eq!(status, MultipartStatus::Done);
        assert_eq!(sink.parts, whole.parts);
    }

    #[test]
    fn dashes_inside_a_preamble_line() {
        let mut body = vec![b'x'; 300];
        body.extend_from_slice(b"--b");
        body.extend_from_slice(&[b'y'; 253]);
        body.extend_from_slice(b"\r\n--b\r\n\r\nDATA\r\n--b--");

        let mut parser = MultipartStreamParser::new("b");
        let mut whole = Recorder::default();
        assert_eq!(parser.feed(&body, &mut whole), MultipartStatus::Done);
        assert_eq!(whole.parts.len(), 1);
        assert_eq!(whole.parts[0].data, b"DATA");

        for split in 1..body.len() {
            let mut parser = MultipartStreamParser::new("b");
            let mut sink = Recorder::default();

            assert_ne!(parser.feed(&body[..split], &mut sink), MultipartStatus::Error, "split at {split}");
            assert_eq!(parser.feed(&body[split..], &mut sink), MultipartStatus::Done, "split at {split}");
            assert_eq!(sink.parts, whole.parts, "split at {split}");
        }
    }

    #[test]
    fn boundary_line_after_long_preamble() {
        let mut parser = MultipartStreamParser::new("b");
        let mut sink = Recorder::default();

        let mut preamble = vec![b'p'; 400];
        preamble.extend_from_slice(b"\r\n");
        assert_eq!(parser.feed(&preamble, &mut sink), MultipartStatus::More);
        assert_eq!(parser.feed(&[b'q'; 300], &mut sink), MultipartStatus::More);
        assert_eq!(parser.feed(b"\r\n--b\r\n\r\nok\r\n--b--", &mut sink), MultipartStatus::Done);
        assert_eq!(sink.parts[0].data, b"ok");
    }

    #[test]
    fn large_part_is_streamed() {
        let payload = vec![b'x'; 100_000];
        let mut body = b"--b\r\nContent-Disposition: form-data; name=\"f\"; filename=\"big\"\r\n\r\n".to_vec();
        body.extend_from_slice(&payload);
        body.extend_from_slice(b"\r\n--b--\r\n");

        let mut parser = MultipartStreamParser::new("b");
        let mut sink = Recorder::default();
        for chunk in body.chunks(4096) {
            parser.feed(chunk, &mut sink);
            assert!(parser.buffer.len() <= 4096 + 256);
        }

        assert!(parser.is_done());
        assert_eq!(sink.parts[0].data, payload);
    }

    #[test]
    fn closing_boundary_needs_two_more_bytes() {
        let mut parser = MultipartStreamParser::new("b");
        let mut sink = Recorder::default();

        assert_eq!(parser.feed(b"--b\r\n\r\ndata\r\n--b", &mut sink), MultipartStatus::More);
        assert_eq!(sink.parts[0].data, b"data");
        assert!(!sink.parts[0].ended);

        assert_eq!(parser.feed(b"-", &mut sink), MultipartStatus::More);
        assert!(!sink.parts[0].ended);

        assert_eq!(parser.feed(b"-", &mut sink), MultipartStatus::Done);
        assert!(sink.parts[0].ended);
        assert!(parser.finish().is_ok());
    }

    #[test]
    fn regular_boundary_with_shared_prefix() {
        let mut parser = MultipartStreamParser::new("b");
        let mut sink = Recorder::default();

        assert_eq!(parser.feed(b"--b\r\n\r\none\r\n--b", &mut sink), MultipartStatus::More);
        assert_eq!(parser.feed(b"\r\n\r\ntwo\r\n--b--", &mut sink), MultipartStatus::Done);

        assert_eq!(sink.parts.len(), 2);
        assert_eq!(sink.parts[0].data, b"one");
        assert_eq!(sink.parts[1].data, b"two");
    }

    #[test]
    fn invalid_boundaries() {
        let too_long = "a".repeat(71);
        for boundary in ["", "has space", "semi;colon", "quote\"", too_long.as_str()] {
            let mut parser = MultipartStreamParser::new(boundary);
            assert_eq!(parser.feed(b"--x\r\n", &mut Recorder::default()), MultipartStatus::Error, "{boundary:?}");
            assert_eq!(parser.error(), Some(&MultipartError::InvalidBoundary));
        }

        let parser = MultipartStreamParser::new(&"a".repeat(70));
        assert!(parser.error().is_none());
    }

    #[test]
    fn malformed_delimiter_line() {
        let (status, _) = parse_whole(b"--XyZ-42junk\r\n");
        assert_eq!(status, MultipartStatus::Error);

        let (status, sink) = parse_whole(b"--XyZ-42\r\n\r\ndata\r\n--XyZ-42xx");
        assert_eq!(status, MultipartStatus::Error);
        assert_eq!(sink.parts[0].data, b"data");
    }

    #[test]
    fn malformed_part_headers() {
        let (status, _) = parse_whole(b"--XyZ-42\r\nno colon here\r\n\r\n");
        assert_eq!(status, MultipartStatus::Error);

        let (status, _) = parse_whole(b"--XyZ-42\r\nBad Name: x\r\n\r\n");
        assert_eq!(status, MultipartStatus::Error);
    }

    #[test]
    fn part_header_limits() {
        let mut parser = MultipartStreamParser::new("b");
        let mut sink = Recorder::default();
        parser.feed(b"--b\r\n", &mut sink);

        let line = format!("X-Filler: {}\r\n", "v".repeat(4000));
        let mut status = MultipartStatus::More;
        for _ in 0..17 {
            status = parser.feed(line.as_bytes(), &mut sink);
        }
        assert_eq!(status, MultipartStatus::Error);
        assert_eq!(parser.error(), Some(&MultipartError::TooLargeHeader { max_size: MAX_PART_HEADER_BYTES }));

        let mut parser = MultipartStreamParser::new("b");
        let long = format!("--b\r\nX-Long: {}", "v".repeat(MAX_PART_LINE_BYTES));
        assert_eq!(parser.feed(long.as_bytes(), &mut sink), MultipartStatus::Error);
        assert_eq!(parser.error(), Some(&MultipartError::TooLongLine { max_size: MAX_PART_LINE_BYTES }));
    }

    #[test]
    fn truncated_body() {
        let mut parser = MultipartStreamParser::new("b");
        let mut sink = Recorder::default();

        parser.feed(b"--b\r\n\r\npartial", &mut sink);
        assert_eq!(parser.finish(), Err(MultipartError::Truncated));
    }

    #[test]
    fn terminal_state_ignores_input() {
        let (status, sink) = parse_whole(b"--XyZ-42--\r\n");
        assert_eq!(status, MultipartStatus::Done);
        assert!(sink.parts.is_empty());

        let mut parser = MultipartStreamParser::new("XyZ-42");
        let mut sink = Recorder::default();
        parser.feed(b"--XyZ-42\r\n\r\n\r\n--XyZ-42--", &mut sink);
        assert_eq!(parser.feed(b"--XyZ-42\r\n\r\nmore", &mut sink), MultipartStatus::Done);
        assert_eq!(sink.parts.len(), 1);
    }
}
