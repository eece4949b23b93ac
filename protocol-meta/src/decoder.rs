//! Incremental decoder for meta-protocol responses.
//!
//! A TCP read may deliver any prefix of a response, so decoding is driven
//! as a resumable state machine over the inbound buffer:
//!
//! ```text
//! ReturnCode -> DataLength -> Flags -> Value -> ReturnCode
//!                                  \__________________^   (non-VA)
//! ```
//!
//! `decode` returns `Ok(None)` while the current step is short of bytes and
//! never consumes a partially-available step; the next call resumes from
//! the same state.

use bytes::{Buf, BytesMut};

use crate::buffer::MetaBuf;
use crate::error::ParseError;
use crate::flags::MetaFlags;
use crate::response::{Response, ReturnCode};

/// Maximum payload size accepted from a server (memcached default is 1MB).
pub const MAX_DATA_LEN: u64 = 1024 * 1024;

/// Maximum length of a response line (return code, length, flags).
const MAX_LINE_LEN: usize = 1024;

#[derive(Debug, Clone)]
enum DecodeState {
    ReturnCode,
    DataLength {
        code: ReturnCode,
    },
    Flags {
        code: ReturnCode,
        data_length: Option<u64>,
    },
    Value {
        data_length: u64,
        flags: Option<MetaFlags>,
    },
}

/// Streaming decoder turning a byte stream into a sequence of [`Response`]s.
#[derive(Debug)]
pub struct ResponseDecoder {
    state: DecodeState,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseDecoder {
    /// Create a decoder positioned at the start of a response.
    pub fn new() -> Self {
        Self {
            state: DecodeState::ReturnCode,
        }
    }

    /// Try to decode one response from `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Errors are fatal: the
    /// stream is no longer in a decodable state and the connection must be
    /// torn down.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>, ParseError> {
        loop {
            match self.state {
                DecodeState::ReturnCode => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let tag = [src[0], src[1]];
                    let code =
                        ReturnCode::from_bytes(tag).ok_or(ParseError::UnknownReturnCode(tag))?;
                    src.advance(2);
                    self.state = DecodeState::DataLength { code };
                }
                DecodeState::DataLength { code } => {
                    if code != ReturnCode::Value {
                        self.state = DecodeState::Flags {
                            code,
                            data_length: None,
                        };
                        continue;
                    }
                    let Some(length) = incomplete_to_none(read_data_length(src))? else {
                        return Ok(None);
                    };
                    if length > MAX_DATA_LEN {
                        return Err(ParseError::Protocol("value data too large"));
                    }
                    self.state = DecodeState::Flags {
                        code,
                        data_length: Some(length),
                    };
                }
                DecodeState::Flags { code, data_length } => {
                    let Some(line_end) = incomplete_to_none(find_crlf(src))? else {
                        return Ok(None);
                    };
                    let flags = if line_end == 0 {
                        None
                    } else {
                        let mut tokens = MetaBuf::from_slice(&src[..line_end]);
                        Some(MetaFlags::parse(&mut tokens)?)
                    };
                    src.advance(line_end + 2);
                    if code == ReturnCode::Value {
                        let data_length =
                            data_length.ok_or(ParseError::Protocol("VA without data length"))?;
                        self.state = DecodeState::Value { data_length, flags };
                    } else {
                        self.state = DecodeState::ReturnCode;
                        return Ok(Some(Response {
                            return_code: code,
                            data_length,
                            flags,
                            value: None,
                        }));
                    }
                }
                DecodeState::Value { data_length, flags } => {
                    let length = data_length as usize;
                    if src.len() < length + 2 {
                        return Ok(None);
                    }
                    if &src[length..length + 2] != b"\r\n" {
                        return Err(ParseError::Protocol("missing data terminator"));
                    }
                    let value = src.split_to(length).freeze();
                    src.advance(2);
                    self.state = DecodeState::ReturnCode;
                    return Ok(Some(Response {
                        return_code: ReturnCode::Value,
                        data_length: Some(data_length),
                        flags,
                        value: Some(value),
                    }));
                }
            }
        }
    }

    /// Classify end-of-stream.
    ///
    /// Clean only at a response boundary with nothing buffered; anything
    /// else means the peer hung up mid-response.
    pub fn decode_eof(&self, src: &BytesMut) -> Result<(), ParseError> {
        if matches!(self.state, DecodeState::ReturnCode) && src.is_empty() {
            Ok(())
        } else {
            Err(ParseError::UnexpectedEof)
        }
    }
}

/// Map the non-fatal `Incomplete` signal onto the decoder's `Ok(None)`.
fn incomplete_to_none<T>(result: Result<T, ParseError>) -> Result<Option<T>, ParseError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(error) if error.is_incomplete() => Ok(None),
        Err(error) => Err(error),
    }
}

/// Read ` <digits>` after a `VA` tag. `Incomplete` while the digit run may
/// still be growing.
fn read_data_length(src: &mut BytesMut) -> Result<u64, ParseError> {
    let Some(&first) = src.first() else {
        return Err(ParseError::Incomplete);
    };
    if first != b' ' {
        return Err(ParseError::Protocol("expected data length"));
    }
    let mut end = 1;
    while end < src.len() && src[end].is_ascii_digit() {
        end += 1;
    }
    if end == src.len() {
        // the run may continue in the next read
        return Err(ParseError::Incomplete);
    }
    if end == 1 {
        return Err(ParseError::InvalidNumber);
    }
    let mut digits = MetaBuf::from_slice(&src[1..end]);
    let length = digits.read_u64_ascii().ok_or(ParseError::InvalidNumber)?;
    src.advance(end);
    Ok(length)
}

/// Find the CRLF terminating the current line, returning the offset of the
/// `\r`. `Incomplete` when the terminator has not arrived yet.
fn find_crlf(src: &BytesMut) -> Result<usize, ParseError> {
    match memchr::memchr(b'\r', src) {
        Some(pos) if pos + 1 >= src.len() => Err(ParseError::Incomplete),
        Some(pos) if src[pos + 1] == b'\n' => Ok(pos),
        Some(_) => Err(ParseError::Protocol("malformed line terminator")),
        None if src.len() > MAX_LINE_LEN => Err(ParseError::Protocol("response line too long")),
        None => Err(ParseError::Incomplete),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::TimeToLive;

    fn decode_all(data: &[u8]) -> Vec<Response> {
        let mut decoder = ResponseDecoder::new();
        let mut src = BytesMut::from(data);
        let mut out = Vec::new();
        while let Some(response) = decoder.decode(&mut src).unwrap() {
            out.push(response);
        }
        assert!(src.is_empty(), "undecoded bytes left: {src:?}");
        out
    }

    #[test]
    fn test_decode_success() {
        let responses = decode_all(b"HD\r\n");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].return_code, ReturnCode::Success);
        assert_eq!(responses[0].data_length, None);
        assert_eq!(responses[0].flags, None);
        assert_eq!(responses[0].value, None);
    }

    #[test]
    fn test_decode_simple_codes() {
        for (line, code) in [
            (&b"HD\r\n"[..], ReturnCode::Success),
            (b"NS\r\n", ReturnCode::NotStored),
            (b"EX\r\n", ReturnCode::Exists),
            (b"NF\r\n", ReturnCode::NotFound),
            (b"EN\r\n", ReturnCode::Miss),
        ] {
            let responses = decode_all(line);
            assert_eq!(responses.len(), 1);
            assert_eq!(responses[0].return_code, code);
        }
    }

    #[test]
    fn test_decode_value() {
        let responses = decode_all(b"VA 3\r\nbar\r\n");
        assert_eq!(responses.len(), 1);
        let response = &responses[0];
        assert_eq!(response.return_code, ReturnCode::Value);
        assert_eq!(response.data_length, Some(3));
        assert_eq!(response.value.as_deref(), Some(&b"bar"[..]));
    }

    #[test]
    fn test_decode_empty_value() {
        let responses = decode_all(b"VA 0\r\n\r\n");
        assert_eq!(responses[0].data_length, Some(0));
        assert_eq!(responses[0].value.as_deref(), Some(&b""[..]));
    }

    #[test]
    fn test_decode_value_with_flags() {
        let responses = decode_all(b"VA 2 t42\r\nhi\r\n");
        let response = &responses[0];
        assert_eq!(response.value.as_deref(), Some(&b"hi"[..]));
        let flags = response.flags.expect("flags present");
        assert_eq!(flags.ttl_remaining, Some(42));
    }

    #[test]
    fn test_decode_success_with_flags() {
        let responses = decode_all(b"HD T0\r\n");
        let flags = responses[0].flags.expect("flags present");
        assert_eq!(flags.time_to_live, Some(TimeToLive::Indefinitely));
    }

    #[test]
    fn test_decode_payload_containing_crlf() {
        let responses = decode_all(b"VA 6\r\na\r\nb\r\r\n");
        assert_eq!(responses[0].value.as_deref(), Some(&b"a\r\nb\r"[..]));
    }

    #[test]
    fn test_decode_pipelined_responses() {
        let responses = decode_all(b"HD\r\nVA 3\r\nfoo\r\nEN\r\n");
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].return_code, ReturnCode::Success);
        assert_eq!(responses[1].value.as_deref(), Some(&b"foo"[..]));
        assert_eq!(responses[2].return_code, ReturnCode::Miss);
    }

    #[test]
    fn test_decode_byte_by_byte() {
        // every proper prefix must report need-more-bytes; the final byte
        // must complete the response
        let data = b"VA 2\r\nhi\r\n";
        let mut decoder = ResponseDecoder::new();
        let mut src = BytesMut::new();
        for &byte in &data[..data.len() - 1] {
            src.extend_from_slice(&[byte]);
            assert_eq!(decoder.decode(&mut src).unwrap(), None);
        }
        src.extend_from_slice(&data[data.len() - 1..]);
        let response = decoder.decode(&mut src).unwrap().expect("complete");
        assert_eq!(response.return_code, ReturnCode::Value);
        assert_eq!(response.data_length, Some(2));
        assert_eq!(response.value.as_deref(), Some(&b"hi"[..]));
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_every_split_point() {
        // invariant: any two-chunk split of a framed response decodes to
        // exactly the same result
        let data = b"VA 5 t-1\r\nhello\r\nHD\r\n";
        for split in 1..data.len() {
            let mut decoder = ResponseDecoder::new();
            let mut src = BytesMut::from(&data[..split]);
            let mut responses = Vec::new();
            while let Some(r) = decoder.decode(&mut src).unwrap() {
                responses.push(r);
            }
            src.extend_from_slice(&data[split..]);
            while let Some(r) = decoder.decode(&mut src).unwrap() {
                responses.push(r);
            }
            assert_eq!(responses.len(), 2, "split at {split}");
            assert_eq!(responses[0].value.as_deref(), Some(&b"hello"[..]));
            assert_eq!(responses[0].flags.unwrap().ttl_remaining, Some(-1));
            assert_eq!(responses[1].return_code, ReturnCode::Success);
        }
    }

    #[test]
    fn test_unknown_return_code() {
        let mut decoder = ResponseDecoder::new();
        let mut src = BytesMut::from(&b"ZZ\r\n"[..]);
        assert_eq!(
            decoder.decode(&mut src),
            Err(ParseError::UnknownReturnCode(*b"ZZ"))
        );
    }

    #[test]
    fn test_missing_data_length() {
        let mut decoder = ResponseDecoder::new();
        let mut src = BytesMut::from(&b"VA x\r\n"[..]);
        assert_eq!(decoder.decode(&mut src), Err(ParseError::InvalidNumber));
    }

    #[test]
    fn test_value_without_space() {
        let mut decoder = ResponseDecoder::new();
        let mut src = BytesMut::from(&b"VAx"[..]);
        assert_eq!(
            decoder.decode(&mut src),
            Err(ParseError::Protocol("expected data length"))
        );
    }

    #[test]
    fn test_missing_data_terminator() {
        let mut decoder = ResponseDecoder::new();
        let mut src = BytesMut::from(&b"VA 3\r\nbarXX"[..]);
        assert_eq!(
            decoder.decode(&mut src),
            Err(ParseError::Protocol("missing data terminator"))
        );
    }

    #[test]
    fn test_unknown_flag_byte() {
        let mut decoder = ResponseDecoder::new();
        let mut src = BytesMut::from(&b"HD q\r\n"[..]);
        assert_eq!(decoder.decode(&mut src), Err(ParseError::UnknownFlag(b'q')));
    }

    #[test]
    fn test_lone_cr_in_line() {
        let mut decoder = ResponseDecoder::new();
        let mut src = BytesMut::from(&b"HD\rX"[..]);
        assert_eq!(
            decoder.decode(&mut src),
            Err(ParseError::Protocol("malformed line terminator"))
        );
    }

    #[test]
    fn test_oversized_value_rejected() {
        let mut decoder = ResponseDecoder::new();
        let mut src = BytesMut::from(&b"VA 10485761\r\n"[..]);
        assert_eq!(
            decoder.decode(&mut src),
            Err(ParseError::Protocol("value data too large"))
        );
    }

    #[test]
    fn test_decode_eof() {
        let decoder = ResponseDecoder::new();
        assert_eq!(decoder.decode_eof(&BytesMut::new()), Ok(()));

        // leftover bytes at EOF
        let src = BytesMut::from(&b"H"[..]);
        assert_eq!(decoder.decode_eof(&src), Err(ParseError::UnexpectedEof));

        // mid-response state at EOF
        let mut decoder = ResponseDecoder::new();
        let mut src = BytesMut::from(&b"VA 3\r\nba"[..]);
        assert_eq!(decoder.decode(&mut src).unwrap(), None);
        assert_eq!(decoder.decode_eof(&src), Err(ParseError::UnexpectedEof));
    }

    #[test]
    fn test_decoder_resumes_after_response() {
        let mut decoder = ResponseDecoder::new();
        let mut src = BytesMut::from(&b"HD\r\nNS"[..]);
        assert!(decoder.decode(&mut src).unwrap().is_some());
        assert_eq!(decoder.decode(&mut src).unwrap(), None);
        src.extend_from_slice(b"\r\n");
        let response = decoder.decode(&mut src).unwrap().expect("second response");
        assert_eq!(response.return_code, ReturnCode::NotStored);
    }
}
