//! Station callsigns
//!
//! A callsign identifies a station on the mesh. Two forms are accepted:
//!
//! - two-letter reserved tokens `Q` + letter (`QB` broadcast, `QC` broadcast
//!   with confirmation class, `QR` repeater broadcast, `QL` loopback)
//! - a 4 to 7 character alphanumeric prefix that does not start with `Q`,
//!   optionally followed by `-SSID` (one or two digits, no leading zero)
//!
//! Invalid input never panics; it produces a callsign for which
//! [`Callsign::is_valid`] is false and which compares unequal to everything,
//! itself included. Tables keyed by callsign refuse the invalid sentinel, so
//! [`Eq`] and [`Ord`] only ever see valid callsigns as keys.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Broadcast to every station
pub const BROADCAST: &str = "QB";
/// Broadcast, confirmation class
pub const BROADCAST_CONFIRM: &str = "QC";
/// Broadcast addressed to repeaters
pub const REPEATER_BROADCAST: &str = "QR";
/// Loopback, never leaves the node
pub const LOCALHOST: &str = "QL";

/// A validated station identifier
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct Callsign {
    /// Normalized text; empty when invalid
    text: String,
}

impl Callsign {
    /// Parse and validate a callsign. Case and surrounding whitespace are ignored.
    pub fn new(s: &str) -> Self {
        let candidate = s.trim().to_ascii_uppercase();
        if Self::check(&candidate) {
            Self { text: candidate }
        } else {
            Self::invalid()
        }
    }

    /// The permanently-invalid sentinel
    pub fn invalid() -> Self {
        Self { text: String::new() }
    }

    /// Broadcast destination (`QB`)
    pub fn broadcast() -> Self {
        Self { text: BROADCAST.to_string() }
    }

    /// Repeater broadcast destination (`QR`)
    pub fn repeater_broadcast() -> Self {
        Self { text: REPEATER_BROADCAST.to_string() }
    }

    /// Loopback destination (`QL`)
    pub fn localhost() -> Self {
        Self { text: LOCALHOST.to_string() }
    }

    pub fn is_valid(&self) -> bool {
        !self.text.is_empty()
    }

    /// Normalized text form, empty for an invalid callsign
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Reserved two-letter `Q` token
    pub fn is_q(&self) -> bool {
        self.text.starts_with('Q')
    }

    /// Any broadcast-class destination (`QB`, `QC`, `QR`)
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self.text.as_str(),
            BROADCAST | BROADCAST_CONFIRM | REPEATER_BROADCAST
        )
    }

    pub fn is_repeater_broadcast(&self) -> bool {
        self.text == REPEATER_BROADCAST
    }

    pub fn is_localhost(&self) -> bool {
        self.text == LOCALHOST
    }

    /// Destinations a user may not address directly as unicast
    pub fn is_reserved(&self) -> bool {
        self.text == BROADCAST || self.text == REPEATER_BROADCAST
    }

    /// Prefix without SSID (`PU5EPX-11` → `PU5EPX`)
    pub fn prefix(&self) -> &str {
        self.text.split('-').next().unwrap_or("")
    }

    fn check(s: &str) -> bool {
        let b = s.as_bytes();
        match b.len() {
            0 | 1 => false,
            2 => b[0] == b'Q' && b[1].is_ascii_uppercase(),
            _ => {
                if b[0] == b'Q' || !b[0].is_ascii_uppercase() {
                    return false;
                }

                let (prefix, ssid) = match s.find('-') {
                    Some(pos) => (&s[..pos], Some(&s[pos + 1..])),
                    None => (s, None),
                };

                if let Some(ssid) = ssid {
                    if ssid.is_empty() || ssid.len() > 2 {
                        return false;
                    }
                    if !ssid.bytes().all(|c| c.is_ascii_digit()) {
                        return false;
                    }
                    // non-significant zero
                    if ssid.starts_with('0') {
                        return false;
                    }
                }

                (4..=7).contains(&prefix.len())
                    && prefix
                        .bytes()
                        .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
            }
        }
    }
}

impl PartialEq for Callsign {
    fn eq(&self, other: &Self) -> bool {
        self.is_valid() && other.is_valid() && self.text == other.text
    }
}

impl Eq for Callsign {}

// Unordered against the invalid sentinel, like `==`
#[allow(clippy::non_canonical_partial_ord_impl)]
impl PartialOrd for Callsign {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        (self.is_valid() && other.is_valid()).then(|| self.text.cmp(&other.text))
    }
}

/// Orders by normalized text, the invalid sentinel first. Agrees with `==`
/// for valid callsigns.
impl Ord for Callsign {
    fn cmp(&self, other: &Self) -> Ordering {
        self.text.cmp(&other.text)
    }
}

impl Hash for Callsign {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

impl PartialEq<str> for Callsign {
    fn eq(&self, other: &str) -> bool {
        self.is_valid() && self.text.eq_ignore_ascii_case(other)
    }
}

impl PartialEq<&str> for Callsign {
    fn eq(&self, other: &&str) -> bool {
        self == *other
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Callsign({})", self.text)
        } else {
            write!(f, "Callsign(<invalid>)")
        }
    }
}

impl From<&str> for Callsign {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Callsign {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

impl From<Callsign> for String {
    fn from(c: Callsign) -> Self {
        c.text
    }
}
