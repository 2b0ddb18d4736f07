//! Mesh packets and their wire forms
//!
//! A packet travels as text at layer 3 and as a FEC-protected (optionally
//! encrypted) byte string at layer 2:
//!
//! ```text
//! L3:  TO<FROM:IDENT[,KEY[=VALUE]]* MESSAGE
//!
//! L2:  ┌──────────────────────────────┬──────────────┐
//!      │ L3 bytes, or encrypted L3    │ RS parity    │
//!      │ (marker 0x05 + IV + blocks)  │ (20 bytes)   │
//!      └──────────────────────────────┴──────────────┘
//! ```
//!
//! Decoding failures carry the numeric cause codes used in diagnostics,
//! see [`PacketError::code`].

use super::callsign::Callsign;
use super::crypto::{self, CipherKey, CryptoError};
use super::fec::{self, FecError};
use super::params::Params;
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Largest L3 frame accepted for transmission
pub const MAX_L3_LEN: usize = 180;

/// Packet codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("preamble lacks '<' or ':'")]
    UnterminatedPreamble,

    #[error("'<' must come before ':'")]
    DelimiterOrder,

    #[error("invalid callsign in preamble")]
    InvalidCallsign,

    #[error("invalid parameters or missing ident")]
    InvalidParams,

    #[error("L3 frame of {0} bytes exceeds {MAX_L3_LEN}")]
    FrameTooLong(usize),

    #[error("FEC: {0}")]
    Fec(#[from] FecError),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
}

impl PacketError {
    /// Numeric cause code
    pub fn code(&self) -> u16 {
        match self {
            PacketError::UnterminatedPreamble => 100,
            PacketError::DelimiterOrder => 101,
            PacketError::InvalidCallsign => 104,
            PacketError::InvalidParams => 105,
            PacketError::FrameTooLong(_) => 106,
            PacketError::Fec(FecError::BadLength(_)) => 999,
            PacketError::Fec(FecError::Uncorrectable(_)) => 998,
            PacketError::Fec(FecError::ParityMismatch(_)) => 997,
            PacketError::Fec(FecError::TooLong(_)) => 106,
            PacketError::Crypto(CryptoError::EncryptedWithoutKey) => 200,
            PacketError::Crypto(CryptoError::CleartextWithKey) => 201,
            PacketError::Crypto(_) => 202,
        }
    }
}

/// Result type for packet operations
pub type PacketResult<T> = Result<T, PacketError>;

/// Deduplication key: sender plus ident
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature {
    pub from: Callsign,
    pub ident: u32,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.from, self.ident)
    }
}

/// A mesh packet
///
/// Immutable once built; [`change_msg`](Self::change_msg) and
/// [`change_params`](Self::change_params) produce modified copies.
/// Equality ignores reception metadata (RSSI, encryption flag).
#[derive(Debug, Clone)]
pub struct Packet {
    to: Callsign,
    from: Callsign,
    params: Params,
    msg: Vec<u8>,
    rssi: i32,
    was_encrypted: bool,
}

impl Packet {
    pub fn new(to: Callsign, from: Callsign, params: Params, msg: impl Into<Vec<u8>>) -> Self {
        Self {
            to,
            from,
            params,
            msg: msg.into(),
            rssi: 0,
            was_encrypted: false,
        }
    }

    pub fn to(&self) -> &Callsign {
        &self.to
    }

    pub fn from(&self) -> &Callsign {
        &self.from
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn ident(&self) -> u32 {
        self.params.ident()
    }

    pub fn msg(&self) -> &[u8] {
        &self.msg
    }

    /// Message as text, invalid UTF-8 replaced
    pub fn msg_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.msg)
    }

    /// RSSI at reception, 0 for local packets
    pub fn rssi(&self) -> i32 {
        self.rssi
    }

    /// Frame arrived encrypted
    pub fn was_encrypted(&self) -> bool {
        self.was_encrypted
    }

    pub fn signature(&self) -> Signature {
        Signature {
            from: self.from.clone(),
            ident: self.params.ident(),
        }
    }

    pub fn is_dup(&self, other: &Packet) -> bool {
        self.signature() == other.signature()
    }

    /// Copy with a different message
    pub fn change_msg(&self, msg: impl Into<Vec<u8>>) -> Packet {
        Packet {
            msg: msg.into(),
            ..self.clone()
        }
    }

    /// Copy with a different parameter set
    pub fn change_params(&self, params: Params) -> Packet {
        Packet {
            params,
            ..self.clone()
        }
    }

    pub(crate) fn with_ident(mut self, ident: u32) -> Packet {
        self.params.set_ident(ident);
        self
    }

    /// Text form `TO<FROM:PARAMS MSG`
    pub fn encode_l3(&self) -> PacketResult<Vec<u8>> {
        if !self.params.is_encodable() {
            return Err(PacketError::InvalidParams);
        }
        let mut out = Vec::with_capacity(MAX_L3_LEN);
        out.extend_from_slice(self.to.as_str().as_bytes());
        out.push(b'<');
        out.extend_from_slice(self.from.as_str().as_bytes());
        out.push(b':');
        out.extend_from_slice(self.params.serialized().as_bytes());
        out.push(b' ');
        out.extend_from_slice(&self.msg);

        if out.len() > MAX_L3_LEN {
            return Err(PacketError::FrameTooLong(out.len()));
        }
        Ok(out)
    }

    /// Parse an L3 frame
    pub fn decode_l3(data: &[u8], rssi: i32) -> PacketResult<Packet> {
        let (preamble, msg) = match data.iter().position(|&c| c == b' ') {
            Some(pos) => (&data[..pos], &data[pos + 1..]),
            // no message
            None => (data, &data[data.len()..]),
        };

        let lt = preamble.iter().position(|&c| c == b'<');
        let colon = preamble.iter().position(|&c| c == b':');
        let (lt, colon) = match (lt, colon) {
            (Some(lt), Some(colon)) => (lt, colon),
            _ => return Err(PacketError::UnterminatedPreamble),
        };
        if lt >= colon {
            return Err(PacketError::DelimiterOrder);
        }

        let to = parse_callsign(&preamble[..lt]);
        let from = parse_callsign(&preamble[lt + 1..colon]);
        if !to.is_valid() || !from.is_valid() {
            return Err(PacketError::InvalidCallsign);
        }

        let params = std::str::from_utf8(&preamble[colon + 1..])
            .map(Params::parse)
            .map_err(|_| PacketError::InvalidParams)?;
        if !params.is_valid_with_ident() {
            return Err(PacketError::InvalidParams);
        }

        Ok(Packet {
            to,
            from,
            params,
            msg: msg.to_vec(),
            rssi,
            was_encrypted: false,
        })
    }

    /// Radio frame: L3, encrypted when a key is given, plus FEC parity
    pub fn encode_l2(&self, key: Option<&CipherKey>) -> PacketResult<Vec<u8>> {
        let l3 = self.encode_l3()?;
        let payload = match key {
            Some(key) => crypto::encrypt(key, &l3)?,
            None => l3,
        };
        Ok(fec::encode(&payload)?)
    }

    /// Parse a radio frame, decrypting when marked and a key is configured
    pub fn decode_l2(frame: &[u8], rssi: i32, key: Option<&CipherKey>) -> PacketResult<Packet> {
        let corrected = fec::decode(frame)?;
        let unwrapped = crypto::unwrap_frame(&corrected, key)?;
        let mut packet = Packet::decode_l3(unwrapped.bytes(), rssi)?;
        packet.was_encrypted = unwrapped.was_encrypted();
        Ok(packet)
    }
}

fn parse_callsign(bytes: &[u8]) -> Callsign {
    std::str::from_utf8(bytes)
        .map(Callsign::new)
        .unwrap_or_else(|_| Callsign::invalid())
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.to == other.to
            && self.from == other.from
            && self.params == other.params
            && self.msg == other.msg
    }
}

impl Eq for Packet {}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}<{}:{} {}",
            self.to,
            self.from,
            self.params,
            self.msg_str()
        )
    }
}
