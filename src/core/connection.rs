//! Raw wire connections.
//!
//! A [`RawConnection`] owns exactly one TCP socket to one endpoint. The
//! protocol has no multiplexing: a request must be answered before the next
//! one is written, so the exchange lock spans the write and the read of a
//! round-trip.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::EndPoint;
use crate::error::{DriverError, ProtocolError};
use crate::wire::reply::Reply;
use crate::wire::request::{KillCursorsMessage, QueryFlags, QueryMessage};
use crate::wire::{encode_frame, RequestMessage, HEADER_LEN, MAX_MESSAGE_LEN};

/// One live connection on the wire, managed by the pool.
pub struct RawConnection {
    endpoint: EndPoint,
    stream: Mutex<Option<TcpStream>>,
    created_at: Instant,
    io_timeout: Duration,
    authenticated: StdMutex<HashSet<String>>,
    invalid: AtomicBool,
    closed: AtomicBool,
}

impl RawConnection {
    /// Open a TCP connection with the send delay disabled and the given
    /// deadline applied to the handshake and every later read and write.
    pub async fn open(endpoint: EndPoint, connect_timeout: Duration) -> Result<Self, DriverError> {
        let address = (endpoint.host().to_string(), endpoint.port());
        let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(DriverError::Connect { endpoint, source }),
            Err(_) => {
                return Err(DriverError::Connect {
                    endpoint,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to disable send delay for {}: {}", endpoint, e);
        }

        debug!("Opened connection to {}", endpoint);
        Ok(Self {
            endpoint,
            stream: Mutex::new(Some(stream)),
            created_at: Instant::now(),
            io_timeout: connect_timeout,
            authenticated: StdMutex::new(HashSet::new()),
            invalid: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &EndPoint {
        &self.endpoint
    }

    /// Time since the connection was opened.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::SeqCst)
    }

    /// Flag the connection as unusable. The socket stays open until the
    /// pool evicts and shuts it down, so an in-flight exchange is never cut.
    pub fn mark_invalid(&self) {
        self.invalid.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Whether the pool may hand this connection out again: connected, not
    /// marked invalid, and within the configured lifetime (zero means
    /// unlimited).
    pub fn is_alive(&self, lifetime: Duration) -> bool {
        self.is_connected() && !self.is_invalid() && (lifetime.is_zero() || self.age() <= lifetime)
    }

    /// Check whether a database was already authenticated on this
    /// connection.
    pub fn is_authenticated(&self, database: &str) -> bool {
        self.authenticated
            .lock()
            .expect("authenticated set lock poisoned")
            .contains(database)
    }

    /// Remember that a database was authenticated on this connection.
    pub fn mark_authenticated(&self, database: &str) {
        self.authenticated
            .lock()
            .expect("authenticated set lock poisoned")
            .insert(database.to_string());
    }

    /// Write one request and read the paired reply.
    ///
    /// Any transport failure marks the connection invalid before it
    /// surfaces; so does a desynchronized reply header.
    pub async fn send_and_receive(
        &self,
        message: &impl RequestMessage,
    ) -> Result<Reply, DriverError> {
        let frame = encode_frame(message)?;

        let raw = {
            let mut guard = self.stream.lock().await;
            let stream = guard.as_mut().ok_or(DriverError::ConnectionClosed)?;
            self.write_frame(stream, &frame).await?;
            self.read_frame(stream).await?
        };

        match Reply::decode(Bytes::from(raw)) {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.mark_invalid();
                Err(e)
            }
        }
    }

    /// Fire-and-forget write for messages without a reply (insert, update,
    /// delete, kill-cursors).
    pub async fn send_only(&self, message: &impl RequestMessage) -> Result<(), DriverError> {
        let frame = encode_frame(message)?;

        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(DriverError::ConnectionClosed)?;
        self.write_frame(stream, &frame).await
    }

    /// Run a database command through the `$cmd` pseudo-collection and
    /// decode the single-document reply.
    pub async fn send_command<C, R>(&self, database: &str, command: &C) -> Result<R, DriverError>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        let namespace = format!("{}.$cmd", database);
        let query = QueryMessage {
            flags: QueryFlags::NONE,
            full_collection_name: &namespace,
            number_to_skip: 0,
            number_to_return: -1,
            query: command,
            field_selector: None,
        };

        let reply = self.send_and_receive(&query).await?;

        // Commands answer in one batch; release any cursor the server
        // opened anyway.
        if reply.cursor_id > 0 {
            self.send_only(&KillCursorsMessage {
                cursor_id: reply.cursor_id,
            })
            .await?;
        }

        reply.decode_first::<R>()?.ok_or_else(|| {
            DriverError::unexpected_reply(format!(
                "command against '{}' returned no document",
                namespace
            ))
        })
    }

    /// Close the socket. Safe to call more than once; exchanges attempted
    /// afterwards fail with `ConnectionClosed`.
    pub async fn shutdown(&self) {
        let mut guard = self.stream.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        if let Some(mut stream) = guard.take() {
            debug!("Closing connection to {}", self.endpoint);
            if let Err(e) = stream.shutdown().await {
                debug!("Error closing connection to {}: {}", self.endpoint, e);
            }
        }
    }

    async fn write_frame(&self, stream: &mut TcpStream, frame: &[u8]) -> Result<(), DriverError> {
        match timeout(self.io_timeout, stream.write_all(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(self.transport_failure(source)),
            Err(_) => Err(self.transport_failure(io::Error::new(
                io::ErrorKind::TimedOut,
                "write timed out",
            ))),
        }
    }

    /// Read one length-prefixed frame off the stream.
    async fn read_frame(&self, stream: &mut TcpStream) -> Result<Vec<u8>, DriverError> {
        let mut length_bytes = [0u8; 4];
        self.read_exact(stream, &mut length_bytes).await?;

        let length = i32::from_le_bytes(length_bytes);
        if length < HEADER_LEN as i32 || length > MAX_MESSAGE_LEN {
            self.mark_invalid();
            return Err(ProtocolError::Truncated(format!(
                "peer declared a message of {} bytes",
                length
            ))
            .into());
        }

        let mut frame = vec![0u8; length as usize];
        frame[..4].copy_from_slice(&length_bytes);
        self.read_exact(stream, &mut frame[4..]).await?;
        Ok(frame)
    }

    async fn read_exact(
        &self,
        stream: &mut TcpStream,
        buf: &mut [u8],
    ) -> Result<(), DriverError> {
        match timeout(self.io_timeout, stream.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(source)) => Err(self.transport_failure(source)),
            Err(_) => Err(self.transport_failure(io::Error::new(
                io::ErrorKind::TimedOut,
                "read timed out",
            ))),
        }
    }

    fn transport_failure(&self, source: io::Error) -> DriverError {
        debug!("Transport failure on {}: {}", self.endpoint, source);
        self.mark_invalid();
        DriverError::transport(self.endpoint.clone(), source)
    }
}

impl std::fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConnection")
            .field("endpoint", &self.endpoint)
            .field("age", &self.age())
            .field("invalid", &self.is_invalid())
            .field("connected", &self.is_connected())
            .finish()
    }
}
