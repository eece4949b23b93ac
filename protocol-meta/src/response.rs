//! Meta-protocol response types.
//!
//! Every response is a single line, optionally followed by a payload:
//!
//! ```text
//! <RC>[ <datalen>][ <flag> ...]\r\n
//! [<data>\r\n]            // iff RC == VA
//! ```
//!
//! where `<RC>` is one of `HD`, `NS`, `EX`, `NF`, `VA`, `EN`.

use bytes::Bytes;

use crate::flags::MetaFlags;

/// The two-byte status tag at the start of every response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    /// `HD` - success / stored.
    Success,
    /// `NS` - not stored (add collision, replace on a missing key).
    NotStored,
    /// `EX` - item exists (compare-and-swap conflict).
    Exists,
    /// `NF` - key not found.
    NotFound,
    /// `VA` - a value payload follows.
    Value,
    /// `EN` - meta-get miss.
    Miss,
}

impl ReturnCode {
    /// Decode a two-byte tag. Returns `None` for anything outside the set.
    pub fn from_bytes(bytes: [u8; 2]) -> Option<Self> {
        match &bytes {
            b"HD" => Some(ReturnCode::Success),
            b"NS" => Some(ReturnCode::NotStored),
            b"EX" => Some(ReturnCode::Exists),
            b"NF" => Some(ReturnCode::NotFound),
            b"VA" => Some(ReturnCode::Value),
            b"EN" => Some(ReturnCode::Miss),
            _ => None,
        }
    }

    /// The wire form of this code.
    pub fn as_bytes(self) -> [u8; 2] {
        match self {
            ReturnCode::Success => *b"HD",
            ReturnCode::NotStored => *b"NS",
            ReturnCode::Exists => *b"EX",
            ReturnCode::NotFound => *b"NF",
            ReturnCode::Value => *b"VA",
            ReturnCode::Miss => *b"EN",
        }
    }
}

impl std::fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.as_bytes();
        write!(f, "{}{}", bytes[0] as char, bytes[1] as char)
    }
}

/// A decoded meta-protocol response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Status tag of the response line.
    pub return_code: ReturnCode,
    /// Payload length; present iff `return_code` is `VA`.
    pub data_length: Option<u64>,
    /// Flag tokens echoed on the response line, if any.
    pub flags: Option<MetaFlags>,
    /// Payload bytes; present iff `return_code` is `VA`.
    pub value: Option<Bytes>,
}

impl Response {
    /// True when this response signals plain success.
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self.return_code, ReturnCode::Success)
    }

    /// True when this response signals a meta-get miss.
    #[inline]
    pub fn is_miss(&self) -> bool {
        matches!(self.return_code, ReturnCode::Miss)
    }
}
