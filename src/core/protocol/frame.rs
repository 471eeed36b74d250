// src/core/protocol/frame.rs

//! RESP2 wire frames and the `Encoder`/`Decoder` pair used for all network
//! communication with the store.
//!
//! The frame model is client-oriented: null bulk strings and null arrays are
//! folded into `Bulk(None)` and `Array(None)` so "key absent" replies map
//! directly onto `Option`.

use crate::core::StoreError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The CRLF sequence terminating every RESP line.
const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

// Limits guarding against a misbehaving peer.
const MAX_ARRAY_ELEMENTS: usize = 1_024 * 1_024;
const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;
const MAX_DEPTH: usize = 64;

/// A single RESP2 frame as exchanged with the store.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<WireFrame>>),
}

impl WireFrame {
    /// Builds a command frame (an array of bulk strings) from its parts.
    pub fn command(parts: Vec<Bytes>) -> WireFrame {
        WireFrame::Array(Some(
            parts.into_iter().map(|p| WireFrame::Bulk(Some(p))).collect(),
        ))
    }

    /// Short human-readable description used in error messages.
    pub fn describe(&self) -> String {
        match self {
            WireFrame::Simple(s) => format!("simple string '{s}'"),
            WireFrame::Error(s) => format!("error '{s}'"),
            WireFrame::Integer(i) => format!("integer {i}"),
            WireFrame::Bulk(Some(b)) => format!("bulk string ({} bytes)", b.len()),
            WireFrame::Bulk(None) => "null bulk string".to_string(),
            WireFrame::Array(Some(a)) => format!("array ({} elements)", a.len()),
            WireFrame::Array(None) => "null array".to_string(),
        }
    }
}

/// `tokio_util::codec` implementation for [`WireFrame`]s.
#[derive(Debug, Default)]
pub struct WireCodec;

impl Encoder<WireFrame> for WireCodec {
    type Error = StoreError;

    fn encode(&mut self, item: WireFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            WireFrame::Simple(s) => {
                dst.extend_from_slice(b"+");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            WireFrame::Error(s) => {
                dst.extend_from_slice(b"-");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            WireFrame::Integer(i) => {
                dst.extend_from_slice(b":");
                dst.extend_from_slice(i.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
            WireFrame::Bulk(Some(b)) => {
                dst.extend_from_slice(b"$");
                dst.extend_from_slice(b.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                dst.extend_from_slice(&b);
                dst.extend_from_slice(CRLF);
            }
            WireFrame::Bulk(None) => dst.extend_from_slice(b"$-1\r\n"),
            WireFrame::Array(Some(arr)) => {
                dst.extend_from_slice(b"*");
                dst.extend_from_slice(arr.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for frame in arr {
                    self.encode(frame, dst)?;
                }
            }
            WireFrame::Array(None) => dst.extend_from_slice(b"*-1\r\n"),
        }
        Ok(())
    }
}

impl Decoder for WireCodec {
    type Item = WireFrame;
    type Error = StoreError;

    /// Decodes one frame from the buffer, returning `Ok(None)` until a
    /// complete frame is available.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut bytes = &src[..];
        match parse_frame(&mut bytes, 0) {
            Ok(frame) => {
                let consumed = src.len() - bytes.len();
                src.advance(consumed);
                Ok(Some(frame))
            }
            // Incomplete input is not an error at this layer; wait for more.
            Err(StoreError::IncompleteData) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Recursively parses a frame, advancing `bytes` past what was consumed.
fn parse_frame(bytes: &mut &[u8], depth: usize) -> Result<WireFrame, StoreError> {
    if depth > MAX_DEPTH {
        return Err(StoreError::Protocol(
            "frame nesting depth limit exceeded".to_string(),
        ));
    }

    if bytes.is_empty() {
        return Err(StoreError::IncompleteData);
    }

    let kind = bytes[0];
    *bytes = &bytes[1..];
    match kind {
        b'+' => Ok(WireFrame::Simple(lossy(read_line(bytes)?))),
        b'-' => Ok(WireFrame::Error(lossy(read_line(bytes)?))),
        b':' => {
            let line = read_line(bytes)?;
            let i = parse_int(line)?;
            Ok(WireFrame::Integer(i))
        }
        b'$' => parse_bulk(bytes),
        b'*' => parse_array(bytes, depth),
        other => Err(StoreError::Protocol(format!(
            "unknown frame type byte 0x{other:02x}"
        ))),
    }
}

/// Returns the next CRLF-terminated line, advancing past it.
fn read_line<'a>(bytes: &mut &'a [u8]) -> Result<&'a [u8], StoreError> {
    match bytes.windows(CRLF_LEN).position(|w| w == CRLF) {
        Some(pos) => {
            let line = &bytes[..pos];
            *bytes = &bytes[pos + CRLF_LEN..];
            Ok(line)
        }
        None => Err(StoreError::IncompleteData),
    }
}

fn parse_bulk(bytes: &mut &[u8]) -> Result<WireFrame, StoreError> {
    let len = parse_int(read_line(bytes)?)?;
    if len == -1 {
        return Ok(WireFrame::Bulk(None));
    }
    let len = usize::try_from(len)
        .map_err(|_| StoreError::Protocol(format!("negative bulk length {len}")))?;
    if len > MAX_BULK_SIZE {
        return Err(StoreError::Protocol(format!(
            "bulk string of {len} bytes exceeds limit"
        )));
    }

    if bytes.len() < len + CRLF_LEN {
        return Err(StoreError::IncompleteData);
    }
    if &bytes[len..len + CRLF_LEN] != CRLF {
        return Err(StoreError::Protocol(
            "bulk string not terminated by CRLF".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(&bytes[..len]);
    *bytes = &bytes[len + CRLF_LEN..];
    Ok(WireFrame::Bulk(Some(data)))
}

fn parse_array(bytes: &mut &[u8], depth: usize) -> Result<WireFrame, StoreError> {
    let len = parse_int(read_line(bytes)?)?;
    if len == -1 {
        return Ok(WireFrame::Array(None));
    }
    let len = usize::try_from(len)
        .map_err(|_| StoreError::Protocol(format!("negative array length {len}")))?;
    if len > MAX_ARRAY_ELEMENTS {
        return Err(StoreError::Protocol(format!(
            "array of {len} elements exceeds limit"
        )));
    }

    let mut frames = Vec::with_capacity(len);
    for _ in 0..len {
        frames.push(parse_frame(bytes, depth + 1)?);
    }
    Ok(WireFrame::Array(Some(frames)))
}

fn parse_int(line: &[u8]) -> Result<i64, StoreError> {
    let s = std::str::from_utf8(line)
        .map_err(|_| StoreError::Protocol("non-UTF-8 integer line".to_string()))?;
    s.parse::<i64>()
        .map_err(|_| StoreError::Protocol(format!("invalid integer '{s}'")))
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).to_string()
}
