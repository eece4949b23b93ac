//! Meta-protocol flag tokens.
//!
//! Flags ride on the command line after the key (and, for `ms`, after the
//! payload length). Each token is a single letter, optionally followed by a
//! value, and is preceded by one space:
//!
//! - `v` - return the value on meta-get
//! - `t` - return the remaining TTL on meta-get; echoed as `t<seconds>`
//!   (`t-1` for items that never expire)
//! - `T<n>` - set the TTL; `0` means never expire
//! - `M<E|A|P|R>` on `ms` - add / append / prepend / replace
//! - `M<+|->` plus `D<delta>` on `ma` - increment / decrement

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::buffer::MetaBuf;
use crate::error::ParseError;

/// TTLs up to 30 days travel as relative seconds; anything longer must be
/// sent as an absolute Unix timestamp (memcached convention).
pub const MAX_RELATIVE_EXPIRY_SECS: u64 = 60 * 60 * 24 * 30;

/// Expiration policy for a stored or touched item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeToLive {
    /// The item never expires. Serializes as `T0`.
    Indefinitely,
    /// The item expires at the given instant.
    ExpiresAt(Instant),
}

impl TimeToLive {
    /// Expire `duration` from now.
    #[inline]
    pub fn expires_in(duration: Duration) -> Self {
        TimeToLive::ExpiresAt(Instant::now() + duration)
    }

    /// The numeric value carried by the `T` flag.
    ///
    /// `0` for indefinite; relative seconds while the interval fits within
    /// 30 days; the absolute Unix timestamp of the expiry beyond that.
    /// An instant that has already passed yields `1`, never `0`: on the
    /// wire `0` means never expire.
    pub fn wire_value(&self) -> u64 {
        match self {
            TimeToLive::Indefinitely => 0,
            TimeToLive::ExpiresAt(at) => {
                let seconds = at.saturating_duration_since(Instant::now()).as_secs();
                if seconds == 0 {
                    1
                } else if seconds <= MAX_RELATIVE_EXPIRY_SECS {
                    seconds
                } else {
                    unix_now_secs() + seconds
                }
            }
        }
    }

    /// Interpret a decoded `T<n>` token.
    #[inline]
    pub fn from_wire(value: u64) -> Self {
        if value == 0 {
            TimeToLive::Indefinitely
        } else {
            TimeToLive::ExpiresAt(Instant::now() + Duration::from_secs(value))
        }
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Conditional storage mode for `ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Store only if the key does not exist (`ME`).
    Add,
    /// Append to an existing value (`MA`).
    Append,
    /// Prepend to an existing value (`MP`).
    Prepend,
    /// Store only if the key exists (`MR`).
    Replace,
}

impl StorageMode {
    #[inline]
    fn wire_byte(self) -> u8 {
        match self {
            StorageMode::Add => b'E',
            StorageMode::Append => b'A',
            StorageMode::Prepend => b'P',
            StorageMode::Replace => b'R',
        }
    }

    fn from_wire_byte(byte: u8) -> Option<Self> {
        match byte {
            b'E' => Some(StorageMode::Add),
            b'A' => Some(StorageMode::Append),
            b'P' => Some(StorageMode::Prepend),
            b'R' => Some(StorageMode::Replace),
            _ => None,
        }
    }
}

/// Arithmetic direction and delta for `ma`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticMode {
    /// `M+` with `D<delta>`.
    Increment(u64),
    /// `M-` with `D<delta>`.
    Decrement(u64),
}

/// The set of flags attached to a request or echoed on a response line.
///
/// `storage_mode` and `arithmetic_mode` are mutually exclusive; setting
/// both is a programmer error caught at serialization time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaFlags {
    /// Ask the server to return the value (`v`).
    pub return_value: bool,
    /// Ask the server to return the remaining TTL (`t`).
    pub return_ttl: bool,
    /// Set a new TTL (`T<n>`).
    pub time_to_live: Option<TimeToLive>,
    /// Conditional storage mode (`M<letter>`), `ms` only.
    pub storage_mode: Option<StorageMode>,
    /// Arithmetic mode (`M<+|-> D<delta>`), `ma` only.
    pub arithmetic_mode: Option<ArithmeticMode>,
    /// Remaining TTL echoed by the server (`t<seconds>`, `-1` = indefinite).
    /// Decode side only; never serialized.
    pub ttl_remaining: Option<i64>,
}

impl MetaFlags {
    /// Flags for a plain value fetch (`v`).
    #[inline]
    pub fn returning_value() -> Self {
        MetaFlags {
            return_value: true,
            ..Default::default()
        }
    }

    /// True when no token would be emitted.
    pub fn is_empty(&self) -> bool {
        !self.return_value
            && !self.return_ttl
            && self.time_to_live.is_none()
            && self.storage_mode.is_none()
            && self.arithmetic_mode.is_none()
    }

    /// Append the flag block, each token preceded by a single space, in the
    /// stable order `v`, `t`, `T`, `M`, `D`.
    pub fn emit(&self, buf: &mut MetaBuf) {
        assert!(
            self.storage_mode.is_none() || self.arithmetic_mode.is_none(),
            "storage_mode and arithmetic_mode are mutually exclusive"
        );
        if self.return_value {
            buf.put_slice(b" v");
        }
        if self.return_ttl {
            buf.put_slice(b" t");
        }
        if let Some(ttl) = &self.time_to_live {
            buf.put_slice(b" T");
            buf.put_u64_ascii(ttl.wire_value());
        }
        if let Some(mode) = self.storage_mode {
            buf.put_slice(b" M");
            buf.put_u8(mode.wire_byte());
        }
        if let Some(mode) = &self.arithmetic_mode {
            let (sign, delta) = match mode {
                ArithmeticMode::Increment(delta) => (b'+', *delta),
                ArithmeticMode::Decrement(delta) => (b'-', *delta),
            };
            buf.put_slice(b" M");
            buf.put_u8(sign);
            buf.put_slice(b" D");
            buf.put_u64_ascii(delta);
        }
    }

    /// Parse flag tokens from the readable region of `buf`.
    ///
    /// Consumes spaces between tokens and stops at a CR or at the end of
    /// the region. Any token starting with a byte outside the flag set is
    /// a protocol error.
    pub fn parse(buf: &mut MetaBuf) -> Result<MetaFlags, ParseError> {
        let mut flags = MetaFlags::default();
        loop {
            let byte = match buf.peek() {
                None | Some(b'\r') => break,
                Some(byte) => byte,
            };
            match byte {
                b' ' => buf.advance(1),
                b'v' => {
                    buf.advance(1);
                    flags.return_value = true;
                }
                b't' => {
                    buf.advance(1);
                    match buf.peek() {
                        Some(b'-') => {
                            buf.advance(1);
                            let seconds =
                                buf.read_u64_ascii().ok_or(ParseError::InvalidNumber)?;
                            flags.ttl_remaining = Some(-(seconds as i64));
                        }
                        Some(digit) if digit.is_ascii_digit() => {
                            let seconds =
                                buf.read_u64_ascii().ok_or(ParseError::InvalidNumber)?;
                            flags.ttl_remaining = Some(seconds as i64);
                        }
                        _ => flags.return_ttl = true,
                    }
                }
                b'T' => {
                    buf.advance(1);
                    let value = buf.read_u64_ascii().ok_or(ParseError::InvalidNumber)?;
                    flags.time_to_live = Some(TimeToLive::from_wire(value));
                }
                b'M' => {
                    buf.advance(1);
                    let mode = buf.peek().ok_or(ParseError::Protocol("truncated mode flag"))?;
                    buf.advance(1);
                    match mode {
                        b'+' => flags.arithmetic_mode = Some(ArithmeticMode::Increment(0)),
                        b'-' => flags.arithmetic_mode = Some(ArithmeticMode::Decrement(0)),
                        _ => {
                            let mode = StorageMode::from_wire_byte(mode)
                                .ok_or(ParseError::Protocol("unknown storage mode"))?;
                            flags.storage_mode = Some(mode);
                        }
                    }
                }
                b'D' => {
                    buf.advance(1);
                    let delta = buf.read_u64_ascii().ok_or(ParseError::InvalidNumber)?;
                    flags.arithmetic_mode = match flags.arithmetic_mode {
                        Some(ArithmeticMode::Increment(_)) => {
                            Some(ArithmeticMode::Increment(delta))
                        }
                        Some(ArithmeticMode::Decrement(_)) => {
                            Some(ArithmeticMode::Decrement(delta))
                        }
                        None => return Err(ParseError::Protocol("delta without arithmetic mode")),
                    };
                }
                other => return Err(ParseError::UnknownFlag(other)),
            }
        }
        Ok(flags)
    }
}
