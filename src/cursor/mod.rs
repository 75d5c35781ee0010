//! Cursor protocol state machine.
//!
//! A cursor issues one query message, then get-more messages while the
//! server keeps a cursor id open, and releases the server-side cursor when
//! the consumer is done. The untyped bookkeeping lives in [`CursorState`]
//! and is implemented once; [`Cursor`] layers document decoding for a
//! caller-chosen type on top.

use std::collections::VecDeque;
use std::marker::PhantomData;

use bson::{Bson, Document};
use bytes::Bytes;
use futures::stream::{self, Stream};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::connection::RawConnection;
use crate::core::pool::PooledConnection;
use crate::error::{DriverError, ProtocolError};
use crate::wire::reply::Reply;
use crate::wire::request::{GetMoreMessage, KillCursorsMessage, QueryFlags, QueryMessage};

/// Untyped cursor bookkeeping: message building, id and position tracking,
/// and server-side cleanup. Everything that does not depend on the document
/// type lives here.
#[derive(Debug)]
struct CursorState {
    full_collection_name: String,
    spec: Document,
    /// Reserved keys ($orderby, $hint, $snapshot, $explain) merged into the
    /// outgoing spec, mirroring server convention.
    spec_options: Document,
    fields: Option<Document>,
    flags: QueryFlags,
    limit: i32,
    skip: i32,
    cursor_id: i64,
    starting_from: i32,
    number_returned: i32,
    opened: bool,
    modifiable: bool,
    keep_open: bool,
}

impl CursorState {
    fn new(full_collection_name: String) -> Self {
        Self {
            full_collection_name,
            spec: Document::new(),
            spec_options: Document::new(),
            fields: None,
            flags: QueryFlags::NONE,
            limit: 0,
            skip: 0,
            cursor_id: 0,
            starting_from: 0,
            number_returned: 0,
            opened: false,
            modifiable: true,
            keep_open: false,
        }
    }

    fn ensure_modifiable(&self) -> Result<(), DriverError> {
        if self.modifiable {
            Ok(())
        } else {
            Err(DriverError::CursorNotModifiable)
        }
    }

    /// Offset just past the last returned batch.
    fn position(&self) -> i32 {
        self.starting_from + self.number_returned
    }

    fn set_spec_option(&mut self, key: &str, value: Option<Bson>) {
        match value {
            Some(value) => {
                self.spec_options.insert(key, value);
            }
            None => {
                self.spec_options.remove(key);
            }
        }
    }

    /// The spec as sent on the wire: bare, or wrapped under `$query` next
    /// to the reserved keys when any are set.
    fn build_spec(&self) -> Document {
        if self.spec_options.is_empty() {
            return self.spec.clone();
        }
        let mut wrapped = self.spec_options.clone();
        wrapped.insert("$query", self.spec.clone());
        wrapped
    }

    /// Run one protocol round: the initial query, or a get-more against the
    /// open cursor id.
    async fn fetch_next_batch(
        &mut self,
        connection: &RawConnection,
    ) -> Result<Reply, DriverError> {
        self.modifiable = false;

        let reply = if !self.opened {
            let spec = self.build_spec();
            let message = QueryMessage {
                flags: self.flags,
                full_collection_name: &self.full_collection_name,
                number_to_skip: self.skip,
                number_to_return: self.limit,
                query: &spec,
                field_selector: self.fields.as_ref(),
            };
            connection.send_and_receive(&message).await?
        } else {
            let message = GetMoreMessage {
                full_collection_name: &self.full_collection_name,
                number_to_return: self.limit,
                cursor_id: self.cursor_id,
            };
            connection.send_and_receive(&message).await?
        };
        self.opened = true;

        if reply.is_query_failure() {
            self.cursor_id = 0;
            let message = reply
                .error_message()
                .unwrap_or_else(|| "no error document returned".to_string());
            return Err(ProtocolError::QueryFailure(message).into());
        }
        if reply.is_cursor_not_found() {
            let missing = self.cursor_id;
            self.cursor_id = 0;
            return Err(ProtocolError::CursorNotFound(missing).into());
        }

        self.cursor_id = reply.cursor_id;
        self.starting_from = reply.starting_from;
        self.number_returned = reply.number_returned;
        Ok(reply)
    }

    /// Whether another round can still produce documents.
    fn has_more(&self) -> bool {
        self.cursor_id != 0 && (self.limit == 0 || self.position() < self.limit)
    }

    /// Release the server-side cursor if one is still held. With the
    /// connection already gone there is nothing server-side left to clean
    /// up, so that case only logs.
    async fn kill(&mut self, connection: &RawConnection) -> Result<(), DriverError> {
        if self.cursor_id == 0 {
            return Ok(());
        }
        if !connection.is_connected() {
            debug!(
                "Connection closed before cursor {} was killed; nothing to release",
                self.cursor_id
            );
            self.cursor_id = 0;
            return Ok(());
        }

        let message = KillCursorsMessage {
            cursor_id: self.cursor_id,
        };
        connection.send_only(&message).await?;
        self.cursor_id = 0;
        Ok(())
    }
}

/// Lazy, forward-only, non-restartable stream of query results.
///
/// A cursor owns its pooled connection; the connection returns to the pool
/// when the cursor is dropped or closed. Option setters are chainable and
/// only valid until the first batch is requested:
///
/// ```no_run
/// # use zaguan::{ConnectionPool, Cursor};
/// # use bson::doc;
/// # async fn run(pool: std::sync::Arc<ConnectionPool>) -> Result<(), zaguan::DriverError> {
/// let mut cursor = Cursor::<bson::Document>::new(pool.acquire().await?, "app", "users");
/// cursor
///     .spec(doc! { "active": true })?
///     .sort(doc! { "name": 1 })?
///     .limit(20)?;
/// while let Some(user) = cursor.try_next().await? {
///     println!("{}", user);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Cursor<T> {
    connection: PooledConnection,
    state: CursorState,
    buffer: VecDeque<Bytes>,
    _documents: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Cursor<T> {
    /// Create an unopened cursor over `database.collection`. Nothing is
    /// sent until the first read.
    pub fn new(connection: PooledConnection, database: &str, collection: &str) -> Self {
        Self {
            connection,
            state: CursorState::new(format!("{}.{}", database, collection)),
            buffer: VecDeque::new(),
            _documents: PhantomData,
        }
    }

    /// The namespace this cursor queries.
    pub fn full_collection_name(&self) -> &str {
        &self.state.full_collection_name
    }

    /// Server-assigned cursor id; zero while no server-side cursor is held.
    pub fn cursor_id(&self) -> i64 {
        self.state.cursor_id
    }

    /// Offset just past the last returned batch.
    pub fn position(&self) -> i32 {
        self.state.position()
    }

    /// Whether option setters are still accepted.
    pub fn is_modifiable(&self) -> bool {
        self.state.modifiable
    }

    /// Set the query spec.
    pub fn spec(&mut self, spec: Document) -> Result<&mut Self, DriverError> {
        self.state.ensure_modifiable()?;
        self.state.spec = spec;
        Ok(self)
    }

    /// Cap the number of documents the server returns.
    pub fn limit(&mut self, limit: i32) -> Result<&mut Self, DriverError> {
        self.state.ensure_modifiable()?;
        self.state.limit = limit;
        Ok(self)
    }

    /// Skip the first `skip` matching documents.
    pub fn skip(&mut self, skip: i32) -> Result<&mut Self, DriverError> {
        self.state.ensure_modifiable()?;
        self.state.skip = skip;
        Ok(self)
    }

    /// Project only the selected fields.
    pub fn fields(&mut self, fields: Document) -> Result<&mut Self, DriverError> {
        self.state.ensure_modifiable()?;
        self.state.fields = if fields.is_empty() {
            None
        } else {
            Some(fields)
        };
        Ok(self)
    }

    /// Sort order, encoded as the reserved `$orderby` key.
    pub fn sort(&mut self, fields: Document) -> Result<&mut Self, DriverError> {
        self.state.ensure_modifiable()?;
        self.state
            .set_spec_option("$orderby", Some(Bson::Document(fields)));
        Ok(self)
    }

    /// Index hint, encoded as the reserved `$hint` key.
    pub fn hint(&mut self, index: Document) -> Result<&mut Self, DriverError> {
        self.state.ensure_modifiable()?;
        self.state
            .set_spec_option("$hint", Some(Bson::Document(index)));
        Ok(self)
    }

    /// Snapshot mode, encoded as the reserved `$snapshot` key.
    pub fn snapshot(&mut self) -> Result<&mut Self, DriverError> {
        self.state.ensure_modifiable()?;
        self.state.set_spec_option("$snapshot", Some(Bson::Boolean(true)));
        Ok(self)
    }

    /// Wire-level query flags.
    pub fn options(&mut self, flags: QueryFlags) -> Result<&mut Self, DriverError> {
        self.state.ensure_modifiable()?;
        self.state.flags = flags;
        Ok(self)
    }

    /// Keep the server-side cursor open past iteration. Unlike the other
    /// setters this may be flipped at any time.
    pub fn keep_open(&mut self, value: bool) -> &mut Self {
        self.state.keep_open = value;
        self
    }

    /// The next document, fetching batches from the server as needed.
    ///
    /// Returns `Ok(None)` once the results are exhausted; at that point the
    /// server-side cursor has been released unless `keep_open` is set.
    /// Transport failures surface as-is and are not retried.
    pub async fn try_next(&mut self) -> Result<Option<T>, DriverError> {
        loop {
            if let Some(raw) = self.buffer.pop_front() {
                let document = bson::from_slice(&raw).map_err(ProtocolError::Decode)?;
                return Ok(Some(document));
            }

            let can_fetch = !self.state.opened || self.state.has_more();
            if !can_fetch {
                self.finish().await?;
                return Ok(None);
            }

            let reply = self.state.fetch_next_batch(&self.connection).await?;
            if reply.documents.is_empty() {
                // An open cursor that returns nothing has no more data for
                // a non-tailable query.
                self.finish().await?;
                return Ok(None);
            }
            self.buffer.extend(reply.documents);
        }
    }

    /// Drain every remaining document into a vector and close the cursor.
    pub async fn documents(mut self) -> Result<Vec<T>, DriverError> {
        let mut documents = Vec::new();
        while let Some(document) = self.try_next().await? {
            documents.push(document);
        }
        self.close().await?;
        Ok(documents)
    }

    /// Adapt the cursor into a `futures::Stream` of documents.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, DriverError>> {
        stream::try_unfold(self, |mut cursor| async move {
            match cursor.try_next().await? {
                Some(document) => Ok(Some((document, cursor))),
                None => Ok(None),
            }
        })
    }

    /// Run the query in explain mode and return the single diagnostic
    /// document.
    ///
    /// Explain results are not meant to be iterated: whatever cursor the
    /// server opened for them is killed before this returns, win or fail.
    pub async fn explain(mut self) -> Result<Document, DriverError> {
        self.state.ensure_modifiable()?;
        self.state
            .set_spec_option("$explain", Some(Bson::Boolean(true)));

        let fetched = self.state.fetch_next_batch(&self.connection).await;
        let killed = self.state.kill(&self.connection).await;

        let reply = fetched?;
        let document = reply
            .decode_first::<Document>()?
            .ok_or_else(|| DriverError::unexpected_reply("explain returned no document"))?;
        killed?;
        Ok(document)
    }

    /// Kill any open server-side cursor and return the connection to its
    /// pool. Dropping the cursor does the same with best-effort cleanup;
    /// closing is the deterministic path.
    pub async fn close(mut self) -> Result<(), DriverError> {
        self.state.kill(&self.connection).await
    }

    async fn finish(&mut self) -> Result<(), DriverError> {
        if self.state.keep_open {
            return Ok(());
        }
        self.state.kill(&self.connection).await
    }
}

impl<T> Drop for Cursor<T> {
    fn drop(&mut self) {
        if self.state.cursor_id == 0 || self.state.keep_open || !self.connection.is_connected() {
            return;
        }

        let connection = self.connection.shared();
        let cursor_id = self.state.cursor_id;
        tokio::spawn(async move {
            let message = KillCursorsMessage { cursor_id };
            if let Err(e) = connection.send_only(&message).await {
                debug!("Failed to kill abandoned cursor {}: {}", cursor_id, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::core::pool::ConnectionPool;
    use crate::core::EndPoint;
    use crate::discovery::{PrimaryProbe, ProbeReport};
    use crate::wire::testsupport::{encode_reply, read_request, RequestFrame};
    use crate::wire::OpCode;
    use async_trait::async_trait;
    use bson::doc;
    use futures::TryStreamExt;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct AlwaysPrimary;

    #[async_trait]
    impl PrimaryProbe for AlwaysPrimary {
        async fn probe(&self, _endpoint: &EndPoint) -> Result<ProbeReport, DriverError> {
            Ok(ProbeReport {
                is_primary: true,
                hosts: Vec::new(),
            })
        }
    }

    /// One scripted reply batch.
    struct Batch {
        cursor_id: i64,
        starting_from: i32,
        documents: Vec<Document>,
    }

    /// Fake server that answers each query/get-more with the next scripted
    /// batch and records every request frame it sees.
    async fn spawn_script_server(
        batches: Vec<Batch>,
    ) -> (SocketAddr, mpsc::UnboundedReceiver<RequestFrame>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (sender, receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut batches = batches.into_iter();

            while let Ok(request) = read_request(&mut stream).await {
                let expects_reply = request.op_code == OpCode::Query as i32
                    || request.op_code == OpCode::GetMore as i32;
                if expects_reply {
                    let batch = batches.next().expect("script ran out of batches");
                    let reply = encode_reply(
                        request.request_id,
                        0,
                        batch.cursor_id,
                        batch.starting_from,
                        &batch.documents,
                    );
                    if stream.write_all(&reply).await.is_err() {
                        break;
                    }
                }
                if sender.send(request).is_err() {
                    break;
                }
            }
        });

        (addr, receiver)
    }

    async fn cursor_for(addr: SocketAddr) -> Cursor<Document> {
        let config = ClientConfig::new(vec![addr.to_string()]);
        let pool = ConnectionPool::with_probe(&config, Box::new(AlwaysPrimary)).unwrap();
        let connection = pool.acquire().await.unwrap();
        Cursor::new(connection, "app", "items")
    }

    fn kill_cursor_id(frame: &RequestFrame) -> i64 {
        i64::from_le_bytes(frame.body[8..16].try_into().unwrap())
    }

    /// Query body layout: flags + cstring + skip + return + spec document.
    fn query_spec(frame: &RequestFrame) -> Document {
        let nul = frame.body[4..].iter().position(|b| *b == 0).unwrap();
        bson::from_slice(&frame.body[4 + nul + 1 + 8..]).unwrap()
    }

    #[tokio::test]
    async fn test_iterates_across_batches_without_kill() {
        let (addr, mut requests) = spawn_script_server(vec![
            Batch {
                cursor_id: 99,
                starting_from: 0,
                documents: vec![doc! { "n": 1i32 }, doc! { "n": 2i32 }],
            },
            Batch {
                cursor_id: 0,
                starting_from: 2,
                documents: vec![doc! { "n": 3i32 }],
            },
        ])
        .await;

        let mut cursor = cursor_for(addr).await;
        let mut seen = Vec::new();
        while let Some(document) = cursor.try_next().await.unwrap() {
            seen.push(document.get_i32("n").unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(cursor.cursor_id(), 0);
        assert_eq!(cursor.position(), 3);

        drop(cursor);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Exactly one query and one get-more; the server closed the cursor
        // itself, so no kill goes out.
        let ops: Vec<i32> = std::iter::from_fn(|| requests.try_recv().ok())
            .map(|r| r.op_code)
            .collect();
        assert_eq!(ops, vec![OpCode::Query as i32, OpCode::GetMore as i32]);
    }

    #[tokio::test]
    async fn test_limit_satisfied_kills_open_cursor() {
        let (addr, mut requests) = spawn_script_server(vec![Batch {
            cursor_id: 42,
            starting_from: 0,
            documents: vec![doc! { "n": 1i32 }, doc! { "n": 2i32 }],
        }])
        .await;

        let mut cursor = cursor_for(addr).await;
        cursor.limit(2).unwrap();

        assert!(cursor.try_next().await.unwrap().is_some());
        assert!(cursor.try_next().await.unwrap().is_some());
        assert!(cursor.try_next().await.unwrap().is_none());
        assert_eq!(cursor.cursor_id(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let ops: Vec<RequestFrame> = std::iter::from_fn(|| requests.try_recv().ok()).collect();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1].op_code, OpCode::KillCursors as i32);
        assert_eq!(kill_cursor_id(&ops[1]), 42);
    }

    #[tokio::test]
    async fn test_exactly_limit_results_need_no_kill() {
        let (addr, mut requests) = spawn_script_server(vec![Batch {
            cursor_id: 0,
            starting_from: 0,
            documents: vec![doc! { "n": 1i32 }, doc! { "n": 2i32 }],
        }])
        .await;

        let mut cursor = cursor_for(addr).await;
        cursor.limit(2).unwrap();

        let mut count = 0;
        while cursor.try_next().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
        assert_eq!(cursor.cursor_id(), 0);

        drop(cursor);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let ops: Vec<i32> = std::iter::from_fn(|| requests.try_recv().ok())
            .map(|r| r.op_code)
            .collect();
        assert_eq!(ops, vec![OpCode::Query as i32]);
    }

    #[tokio::test]
    async fn test_early_close_kills_with_last_cursor_id() {
        let (addr, mut requests) = spawn_script_server(vec![Batch {
            cursor_id: 55,
            starting_from: 0,
            documents: vec![doc! { "n": 1i32 }, doc! { "n": 2i32 }],
        }])
        .await;

        let mut cursor = cursor_for(addr).await;
        assert!(cursor.try_next().await.unwrap().is_some());
        cursor.close().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let ops: Vec<RequestFrame> = std::iter::from_fn(|| requests.try_recv().ok()).collect();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1].op_code, OpCode::KillCursors as i32);
        assert_eq!(kill_cursor_id(&ops[1]), 55);
    }

    #[tokio::test]
    async fn test_abandoned_cursor_is_killed_on_drop() {
        let (addr, mut requests) = spawn_script_server(vec![Batch {
            cursor_id: 77,
            starting_from: 0,
            documents: vec![doc! { "n": 1i32 }],
        }])
        .await;

        let mut cursor = cursor_for(addr).await;
        assert!(cursor.try_next().await.unwrap().is_some());
        drop(cursor);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let ops: Vec<RequestFrame> = std::iter::from_fn(|| requests.try_recv().ok()).collect();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1].op_code, OpCode::KillCursors as i32);
        assert_eq!(kill_cursor_id(&ops[1]), 77);
    }

    #[tokio::test]
    async fn test_keep_open_skips_kill() {
        let (addr, mut requests) = spawn_script_server(vec![Batch {
            cursor_id: 88,
            starting_from: 0,
            documents: vec![doc! { "n": 1i32 }],
        }])
        .await;

        let mut cursor = cursor_for(addr).await;
        cursor.limit(1).unwrap().keep_open(true);

        assert!(cursor.try_next().await.unwrap().is_some());
        assert!(cursor.try_next().await.unwrap().is_none());
        assert_eq!(cursor.cursor_id(), 88);

        drop(cursor);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let ops: Vec<i32> = std::iter::from_fn(|| requests.try_recv().ok())
            .map(|r| r.op_code)
            .collect();
        assert_eq!(ops, vec![OpCode::Query as i32]);
    }

    #[tokio::test]
    async fn test_setters_rejected_after_first_fetch() {
        let (addr, _requests) = spawn_script_server(vec![Batch {
            cursor_id: 0,
            starting_from: 0,
            documents: vec![doc! { "n": 1i32 }],
        }])
        .await;

        let mut cursor = cursor_for(addr).await;
        assert!(cursor.is_modifiable());
        cursor
            .spec(doc! { "n": { "$gt": 0 } })
            .unwrap()
            .limit(10)
            .unwrap()
            .skip(2)
            .unwrap();

        cursor.try_next().await.unwrap();
        assert!(!cursor.is_modifiable());

        assert!(matches!(
            cursor.spec(doc! {}),
            Err(DriverError::CursorNotModifiable)
        ));
        assert!(matches!(
            cursor.limit(1),
            Err(DriverError::CursorNotModifiable)
        ));
        assert!(matches!(
            cursor.sort(doc! { "n": 1 }),
            Err(DriverError::CursorNotModifiable)
        ));
        assert!(matches!(
            cursor.snapshot(),
            Err(DriverError::CursorNotModifiable)
        ));

        // keep_open stays settable on an opened cursor.
        cursor.keep_open(true);
    }

    #[tokio::test]
    async fn test_reserved_keys_wrap_the_spec() {
        let (addr, mut requests) = spawn_script_server(vec![Batch {
            cursor_id: 0,
            starting_from: 0,
            documents: vec![],
        }])
        .await;

        let mut cursor = cursor_for(addr).await;
        cursor
            .spec(doc! { "active": true })
            .unwrap()
            .sort(doc! { "name": 1i32 })
            .unwrap()
            .hint(doc! { "name": 1i32 })
            .unwrap()
            .snapshot()
            .unwrap();

        assert!(cursor.try_next().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let query = requests.try_recv().unwrap();
        let spec = query_spec(&query);
        assert_eq!(spec.get_document("$query").unwrap(), &doc! { "active": true });
        assert_eq!(spec.get_document("$orderby").unwrap(), &doc! { "name": 1i32 });
        assert_eq!(spec.get_document("$hint").unwrap(), &doc! { "name": 1i32 });
        assert_eq!(spec.get_bool("$snapshot").unwrap(), true);
    }

    #[tokio::test]
    async fn test_bare_spec_stays_unwrapped() {
        let (addr, mut requests) = spawn_script_server(vec![Batch {
            cursor_id: 0,
            starting_from: 0,
            documents: vec![],
        }])
        .await;

        let mut cursor = cursor_for(addr).await;
        cursor.spec(doc! { "active": true }).unwrap();
        assert!(cursor.try_next().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let query = requests.try_recv().unwrap();
        let spec = query_spec(&query);
        assert_eq!(spec, doc! { "active": true });
    }

    #[tokio::test]
    async fn test_documents_drains_everything() {
        let (addr, _requests) = spawn_script_server(vec![
            Batch {
                cursor_id: 31,
                starting_from: 0,
                documents: vec![doc! { "n": 1i32 }],
            },
            Batch {
                cursor_id: 0,
                starting_from: 1,
                documents: vec![doc! { "n": 2i32 }],
            },
        ])
        .await;

        let cursor = cursor_for(addr).await;
        let documents = cursor.documents().await.unwrap();
        assert_eq!(documents.len(), 2);
    }

    #[tokio::test]
    async fn test_stream_adapter_yields_documents() {
        let (addr, _requests) = spawn_script_server(vec![Batch {
            cursor_id: 0,
            starting_from: 0,
            documents: vec![doc! { "n": 1i32 }, doc! { "n": 2i32 }],
        }])
        .await;

        let cursor = cursor_for(addr).await;
        let numbers: Vec<i32> = cursor
            .into_stream()
            .map_ok(|d: Document| d.get_i32("n").unwrap())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_explain_returns_plan_and_kills_cursor() {
        let (addr, mut requests) = spawn_script_server(vec![Batch {
            cursor_id: 13,
            starting_from: 0,
            documents: vec![doc! { "cursor": "BasicCursor", "nscanned": 5i32 }],
        }])
        .await;

        let cursor = cursor_for(addr).await;
        let plan = cursor.explain().await.unwrap();
        assert_eq!(plan.get_str("cursor").unwrap(), "BasicCursor");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let ops: Vec<RequestFrame> = std::iter::from_fn(|| requests.try_recv().ok()).collect();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1].op_code, OpCode::KillCursors as i32);
        assert_eq!(kill_cursor_id(&ops[1]), 13);

        let spec = query_spec(&ops[0]);
        assert_eq!(spec.get_bool("$explain").unwrap(), true);
    }

    #[tokio::test]
    async fn test_typed_cursor_decodes_into_struct() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct Item {
            n: i32,
        }

        let (addr, _requests) = spawn_script_server(vec![Batch {
            cursor_id: 0,
            starting_from: 0,
            documents: vec![doc! { "n": 7i32 }],
        }])
        .await;

        let config = ClientConfig::new(vec![addr.to_string()]);
        let pool = ConnectionPool::with_probe(&config, Box::new(AlwaysPrimary)).unwrap();
        let mut cursor: Cursor<Item> =
            Cursor::new(pool.acquire().await.unwrap(), "app", "items");

        assert_eq!(cursor.try_next().await.unwrap(), Some(Item { n: 7 }));
        assert_eq!(cursor.try_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_query_failure_surfaces() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await.unwrap();
            let reply = encode_reply(
                request.request_id,
                crate::wire::reply::RESPONSE_QUERY_FAILURE,
                0,
                0,
                &[doc! { "$err": "unknown operator" }],
            );
            stream.write_all(&reply).await.unwrap();
        });

        let mut cursor = cursor_for(addr).await;
        let error = cursor.try_next().await.unwrap_err();
        match error {
            DriverError::Protocol(ProtocolError::QueryFailure(message)) => {
                assert_eq!(message, "unknown operator")
            }
            other => panic!("expected query failure, got {:?}", other),
        }
        assert_eq!(cursor.cursor_id(), 0);
    }

    #[tokio::test]
    async fn test_connection_returns_to_pool_after_cursor_drop() {
        let (addr, _requests) = spawn_script_server(vec![Batch {
            cursor_id: 0,
            starting_from: 0,
            documents: vec![],
        }])
        .await;

        let config = ClientConfig::new(vec![addr.to_string()]);
        let pool = ConnectionPool::with_probe(&config, Box::new(AlwaysPrimary)).unwrap();

        let mut cursor: Cursor<Document> =
            Cursor::new(pool.acquire().await.unwrap(), "app", "items");
        assert!(cursor.try_next().await.unwrap().is_none());
        drop(cursor);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = pool.stats().await;
        assert_eq!((stats.free, stats.used), (1, 0));
    }
}
