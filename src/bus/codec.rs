// src/bus/codec.rs
//
// Bus frame codec. Wire layout:
//
//   offset  size  field
//   0       4     method length     (big-endian u32)
//   4       4     uri length
//   8       4     replyto length    (0 = absent)
//   12      4     process name length
//   16      4     username length
//   20      4     body length
//   24      ...   the six fields, concatenated in header order
//
// The metadata header is read first, then the variable part in one piece,
// mirroring the two-vector read on the receive side.

use super::{BusError, BusMessage, Method};

/// Fixed metadata header size.
pub const META_LEN: usize = 24;

/// Upper bound on a frame's variable part. Bodies are register maps rendered
/// as JSON; a megabyte is far beyond any configured component.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Field lengths from a metadata header.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MetaHeader {
    pub method_len: u32,
    pub uri_len: u32,
    pub replyto_len: u32,
    pub process_name_len: u32,
    pub username_len: u32,
    pub body_len: u32,
}

impl MetaHeader {
    pub fn decode(buf: &[u8; META_LEN]) -> MetaHeader {
        let word = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        MetaHeader {
            method_len: word(0),
            uri_len: word(4),
            replyto_len: word(8),
            process_name_len: word(12),
            username_len: word(16),
            body_len: word(20),
        }
    }

    pub fn encode(&self) -> [u8; META_LEN] {
        let mut buf = [0u8; META_LEN];
        buf[0..4].copy_from_slice(&self.method_len.to_be_bytes());
        buf[4..8].copy_from_slice(&self.uri_len.to_be_bytes());
        buf[8..12].copy_from_slice(&self.replyto_len.to_be_bytes());
        buf[12..16].copy_from_slice(&self.process_name_len.to_be_bytes());
        buf[16..20].copy_from_slice(&self.username_len.to_be_bytes());
        buf[20..24].copy_from_slice(&self.body_len.to_be_bytes());
        buf
    }

    pub fn payload_len(&self) -> usize {
        self.method_len as usize
            + self.uri_len as usize
            + self.replyto_len as usize
            + self.process_name_len as usize
            + self.username_len as usize
            + self.body_len as usize
    }
}

/// Encode a message into one wire frame.
pub fn encode_frame(msg: &BusMessage) -> Vec<u8> {
    let method = msg.method.as_str().as_bytes();
    let replyto = msg.replyto.as_deref().unwrap_or("");
    let header = MetaHeader {
        method_len: method.len() as u32,
        uri_len: msg.uri.len() as u32,
        replyto_len: replyto.len() as u32,
        process_name_len: msg.process_name.len() as u32,
        username_len: msg.username.len() as u32,
        body_len: msg.body.len() as u32,
    };

    let mut frame = Vec::with_capacity(META_LEN + header.payload_len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(method);
    frame.extend_from_slice(msg.uri.as_bytes());
    frame.extend_from_slice(replyto.as_bytes());
    frame.extend_from_slice(msg.process_name.as_bytes());
    frame.extend_from_slice(msg.username.as_bytes());
    frame.extend_from_slice(msg.body.as_bytes());
    frame
}

/// Decode the variable part of a frame, given its already-decoded header.
pub fn decode_payload(header: &MetaHeader, payload: &[u8]) -> Result<BusMessage, BusError> {
    if payload.len() != header.payload_len() {
        return Err(BusError::Malformed(format!(
            "payload length {} does not match header total {}",
            payload.len(),
            header.payload_len()
        )));
    }

    let mut at = 0usize;
    let mut field = |len: u32| -> Result<String, BusError> {
        let end = at + len as usize;
        let s = std::str::from_utf8(&payload[at..end])
            .map_err(|_| BusError::Malformed("field is not valid UTF-8".to_string()))?;
        at = end;
        Ok(s.to_string())
    };

    let method_str = field(header.method_len)?;
    let uri = field(header.uri_len)?;
    let replyto = field(header.replyto_len)?;
    let process_name = field(header.process_name_len)?;
    let username = field(header.username_len)?;
    let body = field(header.body_len)?;

    let method = Method::from_str(&method_str)
        .ok_or_else(|| BusError::Malformed(format!("unknown method '{}'", method_str)))?;

    Ok(BusMessage {
        method,
        uri,
        replyto: if replyto.is_empty() { None } else { Some(replyto) },
        process_name,
        username,
        body,
    })
}

// ============================================================================
// Tests
// ============================================================================
