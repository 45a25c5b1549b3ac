//! Newline-delimited framing for the child's stdio streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! misbehaving child cannot make the bridge buffer an unbounded line. Partial
//! lines are held in the read buffer until their `\n` arrives, however the
//! underlying pipe happens to chunk them.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum line length accepted from the child: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One decoded unit of the child's stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line, without its trailing `\n`.
    Line(String),
    /// A line exceeded the length limit and was skipped up to its `\n`.
    Discarded,
}

/// Line codec for the child's stdout (decode) and stdin (encode).
///
/// Oversized inbound lines are reported as [`Frame::Discarded`] instead of
/// an error: `FramedRead` ends the stream after a decoder error, and one bad
/// line must not stop the bridge from reading the lines behind it.
#[derive(Debug)]
pub struct LineCodec(LinesCodec);

impl LineCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line limit.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max_length))
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = Frame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        lift(self.0.decode(src))
    }

    /// A final unterminated line is still yielded when the child closes stdout.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        lift(self.0.decode_eof(src))
    }
}

impl Encoder<String> for LineCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(|err| match err {
            LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
            LinesCodecError::MaxLineLengthExceeded => {
                AppError::Child("line too long for encoding".into())
            }
        })
    }
}

fn lift(decoded: std::result::Result<Option<String>, LinesCodecError>) -> Result<Option<Frame>> {
    match decoded {
        Ok(line) => Ok(line.map(Frame::Line)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Discarded)),
        Err(LinesCodecError::Io(io_err)) => Err(AppError::Io(io_err.to_string())),
    }
}
