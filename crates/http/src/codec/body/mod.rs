//! Request payload decoding and response payload encoding.
//!
//! ## Decoders
//! - [`ChunkedDecoder`]: incremental chunked transfer-coding decoder
//! - [`PayloadDecoder`]: picks the length, chunked or empty strategy for a request
//!
//! ## Encoders
//! - [`PayloadEncoder`]: writes a response payload as fixed length, chunked or
//!   close-delimited bytes

mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;

pub use chunked_decoder::{ChunkedDecoder, MAX_CHUNK_LINE};
pub use chunked_encoder::ChunkedEncoder;
pub use length_decoder::LengthDecoder;
pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
