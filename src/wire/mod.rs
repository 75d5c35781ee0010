//! Binary wire protocol framing.
//!
//! Every message starts with a fixed 16-byte header, all integers
//! little-endian:
//!
//! ```text
//! messageLength:i32  requestId:i32  responseTo:i32  opCode:i32
//! ```
//!
//! Outbound messages live in [`request`]; the single inbound message type
//! lives in [`reply`]. Document payloads go through serde and BSON, so the
//! framing layer never interprets document contents.

pub mod reply;
pub mod request;

use std::sync::atomic::{AtomicI32, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::error::{DriverError, ProtocolError};

/// Wire operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

/// Size of the fixed message header.
pub const HEADER_LEN: usize = 16;

/// Upper bound a sane peer will ever declare for one message.
pub(crate) const MAX_MESSAGE_LEN: i32 = 48 * 1024 * 1024;

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Allocate the next request id.
///
/// Ids only need to be unique among requests in flight on one connection,
/// so wrapping on overflow is fine.
pub fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// An outbound protocol message that knows how to serialize its body.
pub trait RequestMessage {
    fn op_code(&self) -> OpCode;

    /// Append the type-specific body (everything after the header).
    fn write_body(&self, buf: &mut BytesMut) -> Result<(), DriverError>;
}

/// Frame a request message: header plus body, with the length filled in.
pub fn encode_frame(message: &impl RequestMessage) -> Result<Bytes, DriverError> {
    let mut body = BytesMut::with_capacity(128);
    message.write_body(&mut body)?;

    let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
    frame.put_i32_le((HEADER_LEN + body.len()) as i32);
    frame.put_i32_le(next_request_id());
    frame.put_i32_le(0);
    frame.put_i32_le(message.op_code() as i32);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

pub(crate) fn put_cstring(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

pub(crate) fn put_document<S: Serialize>(
    buf: &mut BytesMut,
    value: &S,
) -> Result<(), DriverError> {
    let bytes = bson::to_vec(value).map_err(ProtocolError::Encode)?;
    buf.put_slice(&bytes);
    Ok(())
}
