//! zaguan: a connection-pooled wire-protocol client driver for
//! MongoDB-compatible document databases.
//!
//! The crate covers the transport core of a driver: endpoint addressing,
//! pooled TCP connections with replica-set primary discovery, binary
//! message framing, and the batched cursor protocol. Documents cross the
//! wire through serde and the `bson` crate, so callers bring their own
//! document shapes: any `Serialize` value can go out, any
//! `DeserializeOwned` type can come back.
//!
//! ```no_run
//! use bson::doc;
//! use zaguan::{ClientConfig, ConnectionPool, Cursor};
//!
//! # async fn run() -> Result<(), zaguan::DriverError> {
//! let config = ClientConfig::new(vec![
//!     "db1.example.com:27017".to_string(),
//!     "db2.example.com:27017".to_string(),
//! ]);
//! let pool = ConnectionPool::new(&config)?;
//!
//! let connection = pool.acquire().await?;
//! let mut cursor = Cursor::<bson::Document>::new(connection, "app", "events");
//! cursor.spec(doc! { "kind": "login" })?.limit(50)?;
//! while let Some(event) = cursor.try_next().await? {
//!     println!("{}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod cursor;
pub mod discovery;
pub mod error;
pub mod wire;

pub use crate::config::{ClientConfig, ConfigError, PoolSettings};
pub use crate::core::connection::RawConnection;
pub use crate::core::pool::{ConnectionPool, PoolStats, PooledConnection};
pub use crate::core::{EndPoint, DEFAULT_PORT};
pub use crate::cursor::Cursor;
pub use crate::discovery::{PrimaryProbe, ProbeReport, WireProbe};
pub use crate::error::{DriverError, DriverResult, ProtocolError};
pub use crate::wire::reply::Reply;
pub use crate::wire::request::{DeleteFlags, InsertFlags, QueryFlags, UpdateFlags};
