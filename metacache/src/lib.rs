//! Asynchronous Memcached client speaking the meta protocol.
//!
//! A [`MemcachedConnection`] wraps a single TCP stream. Commands may be
//! issued concurrently from any task; they are serialized onto the wire in
//! submission order and correlated with responses positionally, which is
//! how the meta protocol pipelines.
//!
//! The wire codec lives in the [`protocol_meta`] crate; the types a caller
//! needs day to day are re-exported here.
//!
//! # Example
//!
//! ```no_run
//! use metacache::{ConnectionConfig, MemcachedConnection, TimeToLive};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> metacache::Result<()> {
//!     let connection = MemcachedConnection::new(ConnectionConfig::new("127.0.0.1", 11211));
//!     let runner = {
//!         let connection = connection.clone();
//!         tokio::spawn(async move { connection.run().await })
//!     };
//!
//!     connection
//!         .set_with_ttl(
//!             "session:1",
//!             &String::from("opaque-token"),
//!             TimeToLive::expires_in(Duration::from_secs(300)),
//!         )
//!         .await?;
//!     let token: Option<String> = connection.get("session:1").await?;
//!     println!("token: {token:?}");
//!
//!     connection.close();
//!     runner.await.expect("runner panicked")?;
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod error;

pub use config::ConnectionConfig;
pub use connection::MemcachedConnection;
pub use error::{Error, ErrorKind, Result};

pub use protocol_meta::{
    ArithmeticMode, MetaBuf, MetaFlags, MetaValue, Response, ReturnCode, StorageMode, TimeToLive,
};
