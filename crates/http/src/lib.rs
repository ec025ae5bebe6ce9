//! HTTP/1.x protocol engine for a readiness-polled web server.
//!
//! This crate holds everything that can be done to bytes without touching a socket: request
//! head decoding, body framing (Content-Length and chunked transfer-coding), streaming
//! `multipart/form-data` parsing and response encoding. Every codec works incrementally on
//! `BytesMut` buffers, so a single-threaded event loop can drive it one partial read at a
//! time.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use tokio_util::codec::Decoder;
//! use webserv_http::codec::{HeaderDecoder, PayloadDecoder, parse_payload};
//! use webserv_http::protocol::PayloadItem;
//!
//! let mut buf = BytesMut::from("POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello");
//!
//! let header = HeaderDecoder.decode(&mut buf).unwrap().unwrap();
//! let payload_size = parse_payload(&header, Some(1024)).unwrap();
//!
//! let mut decoder = PayloadDecoder::from_payload_size(payload_size, Some(1024));
//! let item = decoder.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(item, PayloadItem::Chunk("hello".into()));
//! ```
//!
//! # Architecture
//!
//! - [`protocol`]: request/response types and the error enums
//! - [`codec`]: decoders and encoders for the wire format
//!
//! # Limits
//!
//! - request head: 32 KiB, 8 KiB per line, 100 header lines
//! - chunk size and trailer lines: 8 KiB
//! - multipart part headers: 64 KiB per part, 8 KiB per line

pub mod codec;
pub mod protocol;

mod utils;
pub(crate) use utils::ensure;
