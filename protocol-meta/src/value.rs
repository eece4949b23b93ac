//! Typed conversion between user values and raw payload bytes.
//!
//! Payloads on the wire are opaque byte runs; this trait maps them onto
//! application types. Integers travel as decimal ASCII, strings as raw
//! UTF-8, byte containers verbatim.

use bytes::Bytes;

use crate::buffer::MetaBuf;

/// A value that can be stored to and fetched from a Memcached server.
///
/// `read_from` consumes the entire readable region of the buffer and
/// returns `None` when the bytes cannot be interpreted as `Self` (for
/// example non-digit content for an integer type).
pub trait MetaValue: Sized {
    /// Append the wire form of this value to the buffer.
    fn write_to(&self, buf: &mut MetaBuf);

    /// Interpret the readable region of the buffer as a value of this type.
    fn read_from(buf: &mut MetaBuf) -> Option<Self>;
}

fn parse_ascii<T: std::str::FromStr>(buf: &mut MetaBuf) -> Option<T> {
    let parsed = std::str::from_utf8(buf.readable()).ok()?.parse().ok()?;
    buf.advance(buf.remaining());
    Some(parsed)
}

macro_rules! impl_meta_value_unsigned {
    ($($ty:ty),*) => {
        $(
            impl MetaValue for $ty {
                fn write_to(&self, buf: &mut MetaBuf) {
                    buf.put_u64_ascii(*self as u64);
                }

                fn read_from(buf: &mut MetaBuf) -> Option<Self> {
                    parse_ascii(buf)
                }
            }
        )*
    };
}

macro_rules! impl_meta_value_signed {
    ($($ty:ty),*) => {
        $(
            impl MetaValue for $ty {
                fn write_to(&self, buf: &mut MetaBuf) {
                    if *self < 0 {
                        buf.put_u8(b'-');
                    }
                    buf.put_u64_ascii(self.unsigned_abs() as u64);
                }

                fn read_from(buf: &mut MetaBuf) -> Option<Self> {
                    parse_ascii(buf)
                }
            }
        )*
    };
}

impl_meta_value_unsigned!(u8, u16, u32, u64, usize);
impl_meta_value_signed!(i8, i16, i32, i64, isize);

impl MetaValue for String {
    fn write_to(&self, buf: &mut MetaBuf) {
        buf.put_slice(self.as_bytes());
    }

    fn read_from(buf: &mut MetaBuf) -> Option<Self> {
        let text = std::str::from_utf8(buf.readable()).ok()?.to_owned();
        buf.advance(buf.remaining());
        Some(text)
    }
}

impl MetaValue for Vec<u8> {
    fn write_to(&self, buf: &mut MetaBuf) {
        buf.put_slice(self);
    }

    fn read_from(buf: &mut MetaBuf) -> Option<Self> {
        let data = buf.readable().to_vec();
        buf.advance(buf.remaining());
        Some(data)
    }
}

impl MetaValue for Bytes {
    fn write_to(&self, buf: &mut MetaBuf) {
        buf.put_slice(self);
    }

    fn read_from(buf: &mut MetaBuf) -> Option<Self> {
        let data = Bytes::copy_from_slice(buf.readable());
        buf.advance(buf.remaining());
        Some(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<V: MetaValue + PartialEq + std::fmt::Debug + Clone>(value: V) {
        let mut buf = MetaBuf::new();
        value.write_to(&mut buf);
        let decoded = V::read_from(&mut buf).expect("roundtrip decode");
        assert_eq!(decoded, value);
        assert!(buf.is_empty(), "decode must consume the whole payload");
    }

    #[test]
    fn test_unsigned_roundtrip() {
        roundtrip(0u8);
        roundtrip(u8::MAX);
        roundtrip(u16::MAX);
        roundtrip(u32::MAX);
        roundtrip(u64::MAX);
        roundtrip(42usize);
    }

    #[test]
    fn test_signed_roundtrip() {
        roundtrip(i8::MIN);
        roundtrip(-1i16);
        roundtrip(0i32);
        roundtrip(i64::MIN);
        roundtrip(i64::MAX);
        roundtrip(-99isize);
    }

    #[test]
    fn test_integer_wire_form() {
        let mut buf = MetaBuf::new();
        1024u32.write_to(&mut buf);
        assert_eq!(buf.readable(), b"1024");

        let mut buf = MetaBuf::new();
        (-17i64).write_to(&mut buf);
        assert_eq!(buf.readable(), b"-17");
    }

    #[test]
    fn test_integer_rejects_garbage() {
        let mut buf = MetaBuf::from_slice(b"12x");
        assert_eq!(u64::read_from(&mut buf), None);

        let mut buf = MetaBuf::from_slice(b"");
        assert_eq!(u32::read_from(&mut buf), None);

        // out of range for the narrow type
        let mut buf = MetaBuf::from_slice(b"300");
        assert_eq!(u8::read_from(&mut buf), None);
    }

    #[test]
    fn test_string_roundtrip() {
        roundtrip(String::from("hello world"));
        roundtrip(String::new());
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        let mut buf = MetaBuf::from_slice(&[0xff, 0xfe]);
        assert_eq!(String::read_from(&mut buf), None);
    }

    #[test]
    fn test_byte_containers_roundtrip() {
        roundtrip(vec![0u8, 1, 2, 255]);
        roundtrip(Bytes::from_static(b"\x00raw\xff"));
    }
}
