//! Unified decoder for request payloads.
//!
//! Picks the strategy from the [`PayloadSize`] decided for the request head:
//! - Content-Length based payloads
//! - Chunked transfer encoding
//! - Requests with no body

use crate::codec::body::chunked_decoder::ChunkedDecoder;
use crate::codec::body::length_decoder::LengthDecoder;
use crate::protocol::{BodyError, PayloadItem, PayloadSize};
use bytes::{Buf, BytesMut};

/// A unified decoder for HTTP request payloads.
#[derive(Debug)]
pub struct PayloadDecoder {
    kind: Kind,
    max_body: Option<u64>,
}

#[derive(Debug)]
enum Kind {
    Length(LengthDecoder),
    Chunked(ChunkedDecoder),
    NoBody,
}

impl PayloadDecoder {
    pub fn empty() -> Self {
        Self { kind: Kind::NoBody, max_body: None }
    }

    /// Creates a chunked decoder whose decoded total may not exceed `max_body`.
    pub fn chunked(max_body: Option<u64>) -> Self {
        Self { kind: Kind::Chunked(ChunkedDecoder::new()), max_body }
    }

    pub fn fix_length(size: u64) -> Self {
        Self { kind: Kind::Length(LengthDecoder::new(size)), max_body: None }
    }

    /// Builds the decoder matching a framing decision.
    ///
    /// A response-only framing such as `CloseDelimited` is treated as no body.
    pub fn from_payload_size(payload_size: PayloadSize, max_body: Option<u64>) -> Self {
        match payload_size {
            PayloadSize::Length(size) => Self::fix_length(size),
            PayloadSize::Chunked => Self::chunked(max_body),
            PayloadSize::CloseDelimited | PayloadSize::Empty => Self::empty(),
        }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, Kind::NoBody)
    }

    /// Decodes the next payload item from `src`, consuming the bytes it used.
    ///
    /// Returns `Ok(None)` when more input is needed. After the body completed every call
    /// yields `Eof`, leaving the bytes of the next request in `src`.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<PayloadItem>, BodyError> {
        match &mut self.kind {
            Kind::Length(length_decoder) => Ok(length_decoder.decode(src)),
            Kind::Chunked(chunked_decoder) => {
                let consumed = chunked_decoder.feed(&src[..], self.max_body);
                src.advance(consumed);

                if let Some(e) = chunked_decoder.error() {
                    return Err(e.clone().into());
                }

                if chunked_decoder.has_decoded() {
                    return Ok(Some(PayloadItem::Chunk(chunked_decoder.take_decoded().freeze())));
                }

                if chunked_decoder.is_done() { Ok(Some(PayloadItem::Eof)) } else { Ok(None) }
            }
            Kind::NoBody => Ok(Some(PayloadItem::Eof)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn collect(decoder: &mut PayloadDecoder, src: &mut BytesMut) -> Result<(Vec<u8>, bool), BodyError> {
        let mut body = Vec::new();
        while let Some(item) = decoder.decode(src)? {
            match item {
                PayloadItem::Chunk(bytes) => body.extend_from_slice(&bytes),
                PayloadItem::Eof => return Ok((body, true)),
            }
        }
        Ok((body, false))
    }

    #[test]
    fn length_body() {
        let mut src = BytesMut::from(&b"0123456789GET"[..]);
        let mut decoder = PayloadDecoder::from_payload_size(PayloadSize::Length(10), None);

        let (body, eof) = collect(&mut decoder, &mut src).unwrap();
        assert!(eof);
        assert_eq!(body, b"0123456789");
        assert_eq!(&src[..], b"GET");
    }

    #[test]
    fn chunked_body() {
        let mut src = BytesMut::from(&b"3\r\nabc\r\n0\r\n\r\nNEXT"[..]);
        let mut decoder = PayloadDecoder::from_payload_size(PayloadSize::Chunked, Some(3));

        let (body, eof) = collect(&mut decoder, &mut src).unwrap();
        assert!(eof);
        assert_eq!(body, b"abc");
        assert_eq!(&src[..], b"NEXT");
    }

    #[test]
    fn chunked_partial_then_rest() {
        let mut src = BytesMut::from(&b"3\r\nab"[..]);
        let mut decoder = PayloadDecoder::chunked(None);

        let (body, eof) = collect(&mut decoder, &mut src).unwrap();
        assert!(!eof);
        assert_eq!(body, b"ab");
        assert!(src.is_empty());

        src.extend_from_slice(b"c\r\n0\r\n\r\n");
        let (body, eof) = collect(&mut decoder, &mut src).unwrap();
        assert!(eof);
        assert_eq!(body, b"c");
    }

    #[test]
    fn chunked_errors() {
        let mut src = BytesMut::from(&b"4\r\nabcd\r\n0\r\n\r\n"[..]);
        let mut decoder = PayloadDecoder::chunked(Some(3));
        assert_eq!(collect(&mut decoder, &mut src).unwrap_err().status_code(), StatusCode::PAYLOAD_TOO_LARGE);

        let mut src = BytesMut::from(&b"g\r\n"[..]);
        let mut decoder = PayloadDecoder::chunked(None);
        assert_eq!(collect(&mut decoder, &mut src).unwrap_err().status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn no_body() {
        let mut src = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        let mut decoder = PayloadDecoder::from_payload_size(PayloadSize::Empty, None);

        assert!(decoder.is_empty());
        assert!(decoder.decode(&mut src).unwrap().unwrap().is_eof());
        assert_eq!(src.len(), 16);
    }
}
