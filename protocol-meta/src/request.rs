//! Client-side request encoding for the Memcached meta protocol.
//!
//! Wire formats, one line per request (flags optional):
//!
//! - `ms <key> <len>[<flags>]\r\n<payload>\r\n`
//! - `mg <key>[<flags>]\r\n`
//! - `md <key>\r\n`
//! - `ma <key>[<flags>]\r\n`

use bytes::Bytes;

use crate::buffer::MetaBuf;
use crate::flags::MetaFlags;

/// An encodable meta-protocol request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Meta-set: store `value` under `key`.
    Set {
        key: Bytes,
        value: Bytes,
        flags: Option<MetaFlags>,
    },
    /// Meta-get; also used for touch-style requests via the `T` flag.
    Get { key: Bytes, flags: MetaFlags },
    /// Meta-delete.
    Delete { key: Bytes },
    /// Meta-arithmetic (increment / decrement).
    Arithmetic { key: Bytes, flags: MetaFlags },
}

impl Request {
    /// Create a meta-set request.
    #[inline]
    pub fn set(key: Bytes, value: Bytes, flags: Option<MetaFlags>) -> Self {
        Request::Set { key, value, flags }
    }

    /// Create a meta-get request.
    #[inline]
    pub fn get(key: Bytes, flags: MetaFlags) -> Self {
        Request::Get { key, flags }
    }

    /// Create a meta-delete request.
    #[inline]
    pub fn delete(key: Bytes) -> Self {
        Request::Delete { key }
    }

    /// Create a meta-arithmetic request.
    #[inline]
    pub fn arithmetic(key: Bytes, flags: MetaFlags) -> Self {
        Request::Arithmetic { key, flags }
    }

    /// The key this request operates on.
    pub fn key(&self) -> &Bytes {
        match self {
            Request::Set { key, .. }
            | Request::Get { key, .. }
            | Request::Delete { key }
            | Request::Arithmetic { key, .. } => key,
        }
    }

    /// Append the wire form of this request to `buf`.
    ///
    /// Encoding is total: it cannot fail, but an empty key or a flag set
    /// carrying both storage and arithmetic modes is a programmer error.
    pub fn encode(&self, buf: &mut MetaBuf) {
        assert!(!self.key().is_empty(), "request key must not be empty");
        match self {
            Request::Set { key, value, flags } => encode_set(buf, key, value, flags.as_ref()),
            Request::Get { key, flags } => encode_line(buf, b"mg ", key, flags),
            Request::Delete { key } => {
                buf.put_slice(b"md ");
                buf.put_slice(key);
                buf.put_slice(b"\r\n");
            }
            Request::Arithmetic { key, flags } => encode_line(buf, b"ma ", key, flags),
        }
    }
}

/// Encode `ms <key> <len>[<flags>]\r\n<payload>\r\n`.
fn encode_set(buf: &mut MetaBuf, key: &[u8], value: &[u8], flags: Option<&MetaFlags>) {
    buf.put_slice(b"ms ");
    buf.put_slice(key);
    buf.put_u8(b' ');
    buf.put_u64_ascii(value.len() as u64);
    if let Some(flags) = flags {
        flags.emit(buf);
    }
    buf.put_slice(b"\r\n");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}

/// Encode `<verb><key>[<flags>]\r\n`.
fn encode_line(buf: &mut MetaBuf, verb: &[u8], key: &[u8], flags: &MetaFlags) {
    buf.put_slice(verb);
    buf.put_slice(key);
    flags.emit(buf);
    buf.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{ArithmeticMode, StorageMode, TimeToLive};

    fn encoded(request: &Request) -> Vec<u8> {
        let mut buf = MetaBuf::new();
        request.encode(&mut buf);
        buf.readable().to_vec()
    }

    #[test]
    fn test_encode_get() {
        let request = Request::get(Bytes::from_static(b"foo"), MetaFlags::returning_value());
        assert_eq!(encoded(&request), b"mg foo v\r\n");
    }

    #[test]
    fn test_encode_get_without_flags() {
        let request = Request::get(Bytes::from_static(b"foo"), MetaFlags::default());
        assert_eq!(encoded(&request), b"mg foo\r\n");
    }

    #[test]
    fn test_encode_get_with_ttl_request() {
        let flags = MetaFlags {
            return_value: true,
            return_ttl: true,
            ..Default::default()
        };
        let request = Request::get(Bytes::from_static(b"foo"), flags);
        assert_eq!(encoded(&request), b"mg foo v t\r\n");
    }

    #[test]
    fn test_encode_set() {
        let flags = MetaFlags {
            time_to_live: Some(TimeToLive::Indefinitely),
            ..Default::default()
        };
        let request = Request::set(
            Bytes::from_static(b"foo"),
            Bytes::from_static(b"bar"),
            Some(flags),
        );
        assert_eq!(encoded(&request), b"ms foo 3 T0\r\nbar\r\n");
    }

    #[test]
    fn test_encode_set_empty_value() {
        let request = Request::set(Bytes::from_static(b"k"), Bytes::new(), None);
        assert_eq!(encoded(&request), b"ms k 0\r\n\r\n");
    }

    #[test]
    fn test_encode_add() {
        let flags = MetaFlags {
            storage_mode: Some(StorageMode::Add),
            ..Default::default()
        };
        let request = Request::set(
            Bytes::from_static(b"k"),
            Bytes::from_static(b"v2"),
            Some(flags),
        );
        assert_eq!(encoded(&request), b"ms k 2 ME\r\nv2\r\n");
    }

    #[test]
    fn test_encode_delete() {
        let request = Request::delete(Bytes::from_static(b"foo"));
        assert_eq!(encoded(&request), b"md foo\r\n");
    }

    #[test]
    fn test_encode_increment() {
        let flags = MetaFlags {
            arithmetic_mode: Some(ArithmeticMode::Increment(1)),
            ..Default::default()
        };
        let request = Request::arithmetic(Bytes::from_static(b"counter"), flags);
        assert_eq!(encoded(&request), b"ma counter M+ D1\r\n");
    }

    #[test]
    fn test_encode_decrement() {
        let flags = MetaFlags {
            arithmetic_mode: Some(ArithmeticMode::Decrement(10)),
            ..Default::default()
        };
        let request = Request::arithmetic(Bytes::from_static(b"counter"), flags);
        assert_eq!(encoded(&request), b"ma counter M- D10\r\n");
    }

    #[test]
    fn test_distinct_requests_encode_distinctly() {
        let requests = [
            Request::get(Bytes::from_static(b"k"), MetaFlags::returning_value()),
            Request::get(Bytes::from_static(b"k"), MetaFlags::default()),
            Request::get(Bytes::from_static(b"k2"), MetaFlags::returning_value()),
            Request::delete(Bytes::from_static(b"k")),
            Request::set(Bytes::from_static(b"k"), Bytes::from_static(b"v"), None),
            Request::set(Bytes::from_static(b"k"), Bytes::from_static(b"w"), None),
        ];
        let mut seen = std::collections::HashSet::new();
        for request in &requests {
            assert!(seen.insert(encoded(request)), "duplicate encoding: {request:?}");
        }
    }

    #[test]
    #[should_panic(expected = "key must not be empty")]
    fn test_empty_key_panics() {
        let request = Request::delete(Bytes::new());
        let mut buf = MetaBuf::new();
        request.encode(&mut buf);
    }
}
