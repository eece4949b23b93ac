//! Wire codec for the Memcached meta protocol.
//!
//! The meta protocol is Memcached's newer text protocol. Every command is a
//! single line built from a two-letter verb, a key, and a block of flag
//! tokens; every response starts with a two-letter return code:
//!
//! ```text
//! ms <key> <len>[ <flags>]\r\n<payload>\r\n    store
//! mg <key>[ <flags>]\r\n                       fetch / touch
//! md <key>\r\n                                 delete
//! ma <key>[ <flags>]\r\n                       increment / decrement
//!
//! <RC>[ <datalen>][ <flag> ...]\r\n[<data>\r\n]
//! ```
//!
//! This crate is transport-agnostic: [`Request::encode`] fills a byte
//! buffer, and [`ResponseDecoder`] incrementally consumes whatever prefix
//! of the reply stream has arrived.
//!
//! # Example - encoding a request
//!
//! ```
//! use protocol_meta::{MetaBuf, MetaFlags, Request};
//! use bytes::Bytes;
//!
//! let mut buf = MetaBuf::new();
//! let request = Request::get(Bytes::from_static(b"mykey"), MetaFlags::returning_value());
//! request.encode(&mut buf);
//! assert_eq!(buf.readable(), b"mg mykey v\r\n");
//! ```
//!
//! # Example - decoding a response
//!
//! ```
//! use protocol_meta::{ResponseDecoder, ReturnCode};
//! use bytes::BytesMut;
//!
//! let mut decoder = ResponseDecoder::new();
//! let mut src = BytesMut::from(&b"VA 5\r\nhello\r\n"[..]);
//! let response = decoder.decode(&mut src).unwrap().unwrap();
//! assert_eq!(response.return_code, ReturnCode::Value);
//! assert_eq!(response.value.as_deref(), Some(&b"hello"[..]));
//! ```

mod buffer;
mod decoder;
mod error;
mod flags;
mod request;
mod response;
mod value;

pub use buffer::MetaBuf;
pub use decoder::{ResponseDecoder, MAX_DATA_LEN};
pub use error::ParseError;
pub use flags::{
    ArithmeticMode, MetaFlags, StorageMode, TimeToLive, MAX_RELATIVE_EXPIRY_SECS,
};
pub use request::Request;
pub use response::{Response, ReturnCode};
pub use value::MetaValue;
