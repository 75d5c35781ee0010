//! Outbound message types.
//!
//! Body layouts (after the 16-byte header, all integers little-endian):
//!
//! ```text
//! query:        flags:i32  fullCollectionName:cstring  numberToSkip:i32
//!               numberToReturn:i32  query:document  [returnFieldSelector:document]
//! get-more:     reserved:i32=0  fullCollectionName:cstring  numberToReturn:i32
//!               cursorId:i64
//! kill-cursors: reserved:i32=0  numberOfCursorIds:i32=1  cursorId:i64
//! insert:       flags:i32  fullCollectionName:cstring  documents...
//! update:       reserved:i32=0  fullCollectionName:cstring  flags:i32
//!               selector:document  update:document
//! delete:       reserved:i32=0  fullCollectionName:cstring  flags:i32
//!               selector:document
//! ```

use std::ops::BitOr;

use bytes::{BufMut, BytesMut};
use serde::Serialize;

use super::{put_cstring, put_document, OpCode, RequestMessage};
use crate::error::DriverError;

/// Option bits for a query message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryFlags(i32);

impl QueryFlags {
    pub const NONE: QueryFlags = QueryFlags(0);
    /// Cursor stays open after the last data is returned; the caller can
    /// resume it later from where it stopped.
    pub const TAILABLE_CURSOR: QueryFlags = QueryFlags(2);
    /// Allow querying a replica secondary.
    pub const SLAVE_OK: QueryFlags = QueryFlags(4);
    /// Prevent the server from reaping the cursor after its idle period.
    pub const NO_CURSOR_TIMEOUT: QueryFlags = QueryFlags(16);
    /// With a tailable cursor, block at the end of data instead of
    /// returning an empty batch.
    pub const AWAIT_DATA: QueryFlags = QueryFlags(32);
    /// Stream all results in consecutive packages.
    pub const EXHAUST: QueryFlags = QueryFlags(64);

    pub fn bits(self) -> i32 {
        self.0
    }

    pub fn contains(self, other: QueryFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for QueryFlags {
    type Output = QueryFlags;

    fn bitor(self, rhs: QueryFlags) -> QueryFlags {
        QueryFlags(self.0 | rhs.0)
    }
}

/// Option bits for an update message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateFlags(i32);

impl UpdateFlags {
    pub const NONE: UpdateFlags = UpdateFlags(0);
    /// Insert the supplied document when no document matches the selector.
    pub const UPSERT: UpdateFlags = UpdateFlags(1);
    /// Update every matching document instead of only the first.
    pub const MULTI_UPDATE: UpdateFlags = UpdateFlags(2);

    pub fn bits(self) -> i32 {
        self.0
    }
}

impl BitOr for UpdateFlags {
    type Output = UpdateFlags;

    fn bitor(self, rhs: UpdateFlags) -> UpdateFlags {
        UpdateFlags(self.0 | rhs.0)
    }
}

/// Option bits for a delete message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteFlags(i32);

impl DeleteFlags {
    pub const NONE: DeleteFlags = DeleteFlags(0);
    /// Remove only the first matching document.
    pub const SINGLE_REMOVE: DeleteFlags = DeleteFlags(1);

    pub fn bits(self) -> i32 {
        self.0
    }
}

/// Option bits for an insert message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InsertFlags(i32);

impl InsertFlags {
    pub const NONE: InsertFlags = InsertFlags(0);
    /// Keep inserting the remaining documents after an error.
    pub const CONTINUE_ON_ERROR: InsertFlags = InsertFlags(1);

    pub fn bits(self) -> i32 {
        self.0
    }
}

/// First message of a cursor: asks the server to run a query.
///
/// A `number_to_return` of zero lets the server pick the batch size; a
/// negative value asks for a single batch whose cursor closes immediately
/// (used for commands).
#[derive(Debug)]
pub struct QueryMessage<'a, Q: Serialize> {
    pub flags: QueryFlags,
    pub full_collection_name: &'a str,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: &'a Q,
    pub field_selector: Option<&'a bson::Document>,
}

impl<'a, Q: Serialize> RequestMessage for QueryMessage<'a, Q> {
    fn op_code(&self) -> OpCode {
        OpCode::Query
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), DriverError> {
        buf.put_i32_le(self.flags.bits());
        put_cstring(buf, self.full_collection_name);
        buf.put_i32_le(self.number_to_skip);
        buf.put_i32_le(self.number_to_return);
        put_document(buf, self.query)?;
        if let Some(selector) = self.field_selector {
            put_document(buf, selector)?;
        }
        Ok(())
    }
}

/// Fetches the next batch for an existing server-side cursor.
#[derive(Debug)]
pub struct GetMoreMessage<'a> {
    pub full_collection_name: &'a str,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

impl<'a> RequestMessage for GetMoreMessage<'a> {
    fn op_code(&self) -> OpCode {
        OpCode::GetMore
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), DriverError> {
        buf.put_i32_le(0);
        put_cstring(buf, self.full_collection_name);
        buf.put_i32_le(self.number_to_return);
        buf.put_i64_le(self.cursor_id);
        Ok(())
    }
}

/// Releases one server-side cursor.
#[derive(Debug)]
pub struct KillCursorsMessage {
    pub cursor_id: i64,
}

impl RequestMessage for KillCursorsMessage {
    fn op_code(&self) -> OpCode {
        OpCode::KillCursors
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), DriverError> {
        buf.put_i32_le(0);
        buf.put_i32_le(1);
        buf.put_i64_le(self.cursor_id);
        Ok(())
    }
}

/// Inserts documents into a collection. No reply; pair with a safemode
/// round-trip at a higher layer when acknowledgement matters.
#[derive(Debug)]
pub struct InsertMessage<'a, D: Serialize> {
    pub flags: InsertFlags,
    pub full_collection_name: &'a str,
    pub documents: &'a [D],
}

impl<'a, D: Serialize> RequestMessage for InsertMessage<'a, D> {
    fn op_code(&self) -> OpCode {
        OpCode::Insert
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), DriverError> {
        buf.put_i32_le(self.flags.bits());
        put_cstring(buf, self.full_collection_name);
        for document in self.documents {
            put_document(buf, document)?;
        }
        Ok(())
    }
}

/// Updates documents matching a selector. No reply.
#[derive(Debug)]
pub struct UpdateMessage<'a, S: Serialize, U: Serialize> {
    pub full_collection_name: &'a str,
    pub flags: UpdateFlags,
    pub selector: &'a S,
    pub update: &'a U,
}

impl<'a, S: Serialize, U: Serialize> RequestMessage for UpdateMessage<'a, S, U> {
    fn op_code(&self) -> OpCode {
        OpCode::Update
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), DriverError> {
        buf.put_i32_le(0);
        put_cstring(buf, self.full_collection_name);
        buf.put_i32_le(self.flags.bits());
        put_document(buf, self.selector)?;
        put_document(buf, self.update)?;
        Ok(())
    }
}

/// Removes documents matching a selector. No reply.
#[derive(Debug)]
pub struct DeleteMessage<'a, S: Serialize> {
    pub full_collection_name: &'a str,
    pub flags: DeleteFlags,
    pub selector: &'a S,
}

impl<'a, S: Serialize> RequestMessage for DeleteMessage<'a, S> {
    fn op_code(&self) -> OpCode {
        OpCode::Delete
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), DriverError> {
        buf.put_i32_le(0);
        put_cstring(buf, self.full_collection_name);
        buf.put_i32_le(self.flags.bits());
        put_document(buf, self.selector)?;
        Ok(())
    }
}
