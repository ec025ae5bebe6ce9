//! Decoder for request bodies framed by `Content-Length`.

use std::cmp;

use crate::protocol::PayloadItem;
use bytes::BytesMut;

/// Tracks the bytes still owed by a `Content-Length` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthDecoder {
    /// The number of bytes remaining to be read from the payload
    length: u64,
}

impl LengthDecoder {
    pub fn new(length: u64) -> Self {
        Self { length }
    }

    pub fn remaining(&self) -> u64 {
        self.length
    }

    /// Splits at most the remaining length off `src`.
    ///
    /// Yields `Eof` once every declared byte was read, `None` when more input is needed.
    pub fn decode(&mut self, src: &mut BytesMut) -> Option<PayloadItem> {
        if self.length == 0 {
            return Some(PayloadItem::Eof);
        }

        if src.is_empty() {
            return None;
        }

        let len = cmp::min(self.length, src.len() as u64);
        let bytes = src.split_to(len as usize).freeze();

        self.length -= bytes.len() as u64;
        Some(PayloadItem::Chunk(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic() {
        let mut buffer: BytesMut = BytesMut::from(&b"101234567890abcdef\r\n\r\n"[..]);

        let mut length_decoder = LengthDecoder::new(10);
        let payload = length_decoder.decode(&mut buffer).unwrap();
        assert!(payload.is_chunk());

        let bytes = payload.as_bytes().unwrap();
        assert_eq!(&bytes[..], b"1012345678");
        assert_eq!(&buffer[..], b"90abcdef\r\n\r\n");

        assert!(length_decoder.decode(&mut buffer).unwrap().is_eof());
    }

    #[test]
    fn test_partial() {
        let mut buffer = BytesMut::from(&b"abc"[..]);
        let mut length_decoder = LengthDecoder::new(5);

        assert_eq!(length_decoder.decode(&mut buffer).unwrap().as_bytes().unwrap().as_ref(), b"abc");
        assert_eq!(length_decoder.remaining(), 2);
        assert!(length_decoder.decode(&mut buffer).is_none());
    }
}
