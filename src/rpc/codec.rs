//! `Content-Length` frame codec for JSON-RPC peers.
//!
//! Each frame on the wire is:
//!
//! ```text
//! Content-Length: <decimal body length>\r\n\r\n<body>
//! ```
//!
//! [`decode`] is a pure, incremental function over a byte slice and is the
//! single source of framing rules. [`FrameCodec`] wraps the same scanner for
//! [`tokio_util::codec::FramedRead`] / [`tokio_util::codec::FramedWrite`].
//!
//! Decoding never blocks on garbage: a header without a parseable length
//! is skipped, and a body that is not a JSON-RPC object is dropped. Both
//! are logged and never surfaced to callers.

use std::ops::Range;

use bytes::{Buf, BufMut, BytesMut};
use lazy_static::lazy_static;
use regex::bytes::Regex;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::rpc::message::Message;
use crate::{AppError, Result};

/// Separator between the header block and the body.
pub const HEADER_DELIMITER: &[u8] = b"\r\n\r\n";

lazy_static! {
    #[allow(clippy::unwrap_used)] // Literal pattern.
    static ref CONTENT_LENGTH: Regex = Regex::new(r"(?i)Content-Length:\s*(\d+)").unwrap();
}

/// Outcome of scanning the front of a buffer for one frame.
#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// Header or body not fully buffered yet.
    Incomplete,
    /// Header block without a usable length; skip `skip` bytes.
    Malformed { skip: usize, header: String },
    /// Complete frame; `body` indexes into the buffer.
    Frame { body: Range<usize> },
}

fn scan(buf: &[u8]) -> Scan {
    let Some(header_end) = find_delimiter(buf) else {
        return Scan::Incomplete;
    };
    let body_start = header_end + HEADER_DELIMITER.len();
    let header = &buf[..header_end];

    let length = CONTENT_LENGTH
        .captures(header)
        .and_then(|caps| caps.get(1))
        .and_then(|m| std::str::from_utf8(m.as_bytes()).ok())
        .and_then(|digits| digits.parse::<usize>().ok());

    let Some(length) = length else {
        return Scan::Malformed {
            skip: body_start,
            header: String::from_utf8_lossy(header).into_owned(),
        };
    };

    match body_start.checked_add(length) {
        Some(end) if end <= buf.len() => Scan::Frame {
            body: body_start..end,
        },
        Some(_) => Scan::Incomplete,
        None => Scan::Malformed {
            skip: body_start,
            header: String::from_utf8_lossy(header).into_owned(),
        },
    }
}

/// Recoverable error for a header block the codec is about to skip.
fn malformed_header(header: &str) -> AppError {
    AppError::Framing(format!("no usable content-length in header {header:?}"))
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_DELIMITER.len())
        .position(|w| w == HEADER_DELIMITER)
}

fn parse_body(body: &[u8]) -> Result<Message> {
    let value: serde_json::Value = serde_json::from_slice(body)?;
    Message::from_value(value)
}

/// Serialize `message` into one complete frame.
///
/// # Errors
///
/// Returns [`AppError::Payload`] if the message cannot be serialized.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(&message.to_value())?;
    let mut out = Vec::with_capacity(body.len() + 32);
    out.extend_from_slice(format!("Content-Length: {}", body.len()).as_bytes());
    out.extend_from_slice(HEADER_DELIMITER);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode every complete frame at the front of `buf`.
///
/// Returns the decoded messages in wire order and the unconsumed tail. When
/// the first frame is not complete, no messages are returned and the tail
/// is `buf` itself, so the caller can append the next read and call again.
#[must_use]
pub fn decode(buf: &[u8]) -> (Vec<Message>, &[u8]) {
    let mut messages = Vec::new();
    let mut rest = buf;

    loop {
        match scan(rest) {
            Scan::Incomplete => break,
            Scan::Malformed { skip, header } => {
                warn!(error = %malformed_header(&header), "frame codec: skipping header");
                rest = &rest[skip..];
            }
            Scan::Frame { body } => {
                match parse_body(&rest[body.clone()]) {
                    Ok(msg) => messages.push(msg),
                    Err(err) => warn!(error = %err, "frame codec: dropping unparseable body"),
                }
                rest = &rest[body.end..];
            }
        }
    }

    (messages, rest)
}

/// Stream codec for framed JSON-RPC over a byte stream.
///
/// The decoder yields one [`Message`] per call and silently consumes
/// malformed headers and bodies, so it only ever fails on I/O errors
/// reported by the underlying stream.
///
/// # Examples
///
/// ```rust,ignore
/// use tokio_util::codec::FramedRead;
/// use peer_harness::rpc::codec::FrameCodec;
///
/// let reader = FramedRead::new(child_stdout, FrameCodec);
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match scan(src) {
                Scan::Incomplete => return Ok(None),
                Scan::Malformed { skip, header } => {
                    warn!(error = %malformed_header(&header), "frame codec: skipping header");
                    src.advance(skip);
                }
                Scan::Frame { body } => {
                    let frame = src.split_to(body.end);
                    match parse_body(&frame[body]) {
                        Ok(msg) => return Ok(Some(msg)),
                        Err(err) => {
                            warn!(error = %err, "frame codec: dropping unparseable body");
                        }
                    }
                }
            }
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let frame = encode(&item)?;
        dst.reserve(frame.len());
        dst.put_slice(&frame);
        Ok(())
    }
}
