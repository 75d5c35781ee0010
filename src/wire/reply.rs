//! The inbound reply message.
//!
//! ```text
//! struct {
//!     MsgHeader header;          // standard message header
//!     int32     responseFlags;   // normally zero, non-zero on failure
//!     int64     cursorId;        // cursor created for this query, 0 = none
//!     int32     startingFrom;    // offset of this batch within the cursor
//!     int32     numberReturned;  // number of documents in the reply
//!     BSON[]    documents;
//! }
//! ```

use bytes::{Buf, Bytes};
use serde::de::DeserializeOwned;

use super::{OpCode, HEADER_LEN};
use crate::error::{DriverError, ProtocolError};

/// Response flag bit: the get-more referenced a cursor id the server does
/// not know (reaped or never existed).
pub const RESPONSE_CURSOR_NOT_FOUND: i32 = 1;
/// Response flag bit: the query failed; the single document carries `$err`.
pub const RESPONSE_QUERY_FAILURE: i32 = 2;

/// A decoded reply frame.
///
/// Documents are kept as raw length-prefixed byte ranges and decoded on
/// demand, so one decode path serves every target type.
#[derive(Debug, Clone)]
pub struct Reply {
    pub request_id: i32,
    pub response_to: i32,
    pub response_flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<Bytes>,
}

impl Reply {
    /// Decode a complete reply frame, header included.
    pub fn decode(frame: Bytes) -> Result<Self, DriverError> {
        const FIXED_LEN: usize = HEADER_LEN + 20;

        if frame.len() < FIXED_LEN {
            return Err(ProtocolError::Truncated(format!(
                "frame of {} bytes is shorter than the fixed reply fields",
                frame.len()
            ))
            .into());
        }

        let mut buf = frame.clone();
        let message_length = buf.get_i32_le();
        if message_length as usize != frame.len() {
            return Err(ProtocolError::Truncated(format!(
                "header declares {} bytes but frame has {}",
                message_length,
                frame.len()
            ))
            .into());
        }

        let request_id = buf.get_i32_le();
        let response_to = buf.get_i32_le();
        let op_code = buf.get_i32_le();
        if op_code != OpCode::Reply as i32 {
            return Err(ProtocolError::UnexpectedOpCode(op_code).into());
        }

        let response_flags = buf.get_i32_le();
        let cursor_id = buf.get_i64_le();
        let starting_from = buf.get_i32_le();
        let number_returned = buf.get_i32_le();
        if number_returned < 0 {
            return Err(ProtocolError::Truncated(format!(
                "negative document count {}",
                number_returned
            ))
            .into());
        }

        let mut documents = Vec::with_capacity(number_returned as usize);
        for index in 0..number_returned {
            if buf.remaining() < 4 {
                return Err(ProtocolError::Truncated(format!(
                    "frame ends inside document {} of {}",
                    index + 1,
                    number_returned
                ))
                .into());
            }
            let document_length = {
                let mut peek = buf.clone();
                peek.get_i32_le()
            };
            if document_length < 5 || document_length as usize > buf.remaining() {
                return Err(ProtocolError::Truncated(format!(
                    "document {} declares {} bytes with {} remaining",
                    index + 1,
                    document_length,
                    buf.remaining()
                ))
                .into());
            }
            documents.push(buf.copy_to_bytes(document_length as usize));
        }

        Ok(Self {
            request_id,
            response_to,
            response_flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }

    pub fn is_cursor_not_found(&self) -> bool {
        self.response_flags & RESPONSE_CURSOR_NOT_FOUND != 0
    }

    pub fn is_query_failure(&self) -> bool {
        self.response_flags & RESPONSE_QUERY_FAILURE != 0
    }

    /// Decode every document in the batch.
    pub fn decode_documents<T: DeserializeOwned>(&self) -> Result<Vec<T>, DriverError> {
        self.documents
            .iter()
            .map(|raw| bson::from_slice(raw).map_err(|e| ProtocolError::Decode(e).into()))
            .collect()
    }

    /// Decode the first document of the batch, if any.
    pub fn decode_first<T: DeserializeOwned>(&self) -> Result<Option<T>, DriverError> {
        match self.documents.first() {
            Some(raw) => {
                let document = bson::from_slice(raw).map_err(ProtocolError::Decode)?;
                Ok(Some(document))
            }
            None => Ok(None),
        }
    }

    /// The `$err` text of a query-failure reply, when decodable.
    pub(crate) fn error_message(&self) -> Option<String> {
        let document: bson::Document = self
            .documents
            .first()
            .and_then(|raw| bson::from_slice(raw).ok())?;
        document.get_str("$err").ok().map(str::to_string)
    }
}
