//! Packet parameter sets
//!
//! The parameter block sits between the `:` and the first space of an L3
//! frame: `1234,C,H=0a1b2c3d4e5f`. It carries the packet ident (the rolling
//! sequence number) and an ordered set of upper-case keys, each either
//! "naked" (`C`) or with a value (`H=...`).

use std::collections::BTreeMap;
use std::fmt;

/// Largest ident accepted on the wire
pub const MAX_WIRE_IDENT: u32 = 999_999;

/// Value of a single parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    /// Key without `=value`
    Naked,
    /// Key with a (possibly empty) value
    Value(String),
}

/// Parameter set with packet ident
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Params {
    /// Packet ident, 0 = none
    ident: u32,
    /// Keys are stored upper-case, iteration is in key order
    items: BTreeMap<String, ParamValue>,
    /// Result of parsing; always true for sets built in code
    valid: bool,
}

impl Params {
    /// Empty, valid parameter set with no ident
    pub fn new() -> Self {
        Self {
            ident: 0,
            items: BTreeMap::new(),
            valid: true,
        }
    }

    /// Parse the wire form. Check the result with
    /// [`is_valid_with_ident`](Self::is_valid_with_ident) or
    /// [`is_valid_without_ident`](Self::is_valid_without_ident).
    pub fn parse(s: &str) -> Self {
        let mut params = Self::new();
        params.valid = params.parse_into(s);
        if !params.valid {
            params.ident = 0;
            params.items.clear();
        }
        params
    }

    fn parse_into(&mut self, s: &str) -> bool {
        if s.is_empty() {
            return true;
        }
        for segment in s.split(',') {
            let Some(first) = segment.bytes().next() else {
                // empty segment, e.g. "1,,a"
                return false;
            };
            if first.is_ascii_digit() {
                match parse_ident(segment) {
                    Some(ident) => self.ident = ident,
                    None => return false,
                }
            } else if first.is_ascii_alphabetic() {
                match parse_symbol(segment) {
                    Some((key, value)) => {
                        self.items.insert(key.to_ascii_uppercase(), value);
                    }
                    None => return false,
                }
            } else {
                return false;
            }
        }
        true
    }

    /// Parsed correctly and carries a non-zero ident (received packets)
    pub fn is_valid_with_ident(&self) -> bool {
        self.valid && self.ident != 0
    }

    /// Parsed correctly, ident optional
    pub fn is_valid_without_ident(&self) -> bool {
        self.valid
    }

    /// Packet ident, 0 if absent
    pub fn ident(&self) -> u32 {
        self.ident
    }

    pub fn set_ident(&mut self, ident: u32) {
        self.ident = ident;
    }

    /// Get a value by key (case-insensitive). Naked keys yield `Some("")`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .get(&key.to_ascii_uppercase())
            .map(|v| match v {
                ParamValue::Naked => "",
                ParamValue::Value(s) => s.as_str(),
            })
    }

    pub fn has(&self, key: &str) -> bool {
        self.items.contains_key(&key.to_ascii_uppercase())
    }

    /// True if the key exists and has no value
    pub fn is_naked(&self, key: &str) -> bool {
        matches!(
            self.items.get(&key.to_ascii_uppercase()),
            Some(ParamValue::Naked)
        )
    }

    /// True when every key and value can go on the wire without moving the
    /// frame's delimiters. Values set with [`put`](Self::put) are not checked
    /// until the packet is encoded.
    pub fn is_encodable(&self) -> bool {
        self.valid
            && self.items.iter().all(|(key, value)| {
                valid_key(key)
                    && match value {
                        ParamValue::Naked => true,
                        ParamValue::Value(v) => valid_value(v),
                    }
            })
    }

    /// Add or replace a key with value
    pub fn put(&mut self, key: &str, value: impl Into<String>) {
        self.items
            .insert(key.to_ascii_uppercase(), ParamValue::Value(value.into()));
    }

    /// Add or replace a naked key
    pub fn put_naked(&mut self, key: &str) {
        self.items.insert(key.to_ascii_uppercase(), ParamValue::Naked);
    }

    pub fn remove(&mut self, key: &str) {
        self.items.remove(&key.to_ascii_uppercase());
    }

    /// Number of keys, ident not included
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Keys in wire order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Wire form: ident first, then `,KEY` or `,KEY=VALUE` in key order
    pub fn serialized(&self) -> String {
        let mut out = self.ident.to_string();
        for (key, value) in &self.items {
            out.push(',');
            out.push_str(key);
            if let ParamValue::Value(v) = value {
                out.push('=');
                out.push_str(v);
            }
        }
        out
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialized())
    }
}

fn parse_ident(s: &str) -> Option<u32> {
    if !s.bytes().all(|c| c.is_ascii_digit()) || s.starts_with('0') || s.len() > 6 {
        return None;
    }
    let ident: u32 = s.parse().ok()?;
    (1..=MAX_WIRE_IDENT).contains(&ident).then_some(ident)
}

fn parse_symbol(s: &str) -> Option<(&str, ParamValue)> {
    let (key, value) = match s.split_once('=') {
        Some((k, v)) => (k, Some(v)),
        None => (s, None),
    };

    if !valid_key(key) {
        return None;
    }

    match value {
        None => Some((key, ParamValue::Naked)),
        Some(v) if valid_value(v) => Some((key, ParamValue::Value(v.to_string()))),
        Some(_) => None,
    }
}

fn valid_key(key: &str) -> bool {
    key.bytes().next().is_some_and(|c| c.is_ascii_alphabetic())
        && key.bytes().all(|c| c.is_ascii_alphanumeric())
}

fn valid_value(value: &str) -> bool {
    !value
        .chars()
        .any(|c| matches!(c, '=' | ' ' | ',' | ':' | '<' | '\0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ident_only() {
        let p = Params::parse("1234");
        assert!(p.is_valid_with_ident());
        assert_eq!(p.ident(), 1234);
        assert!(p.is_empty());
    }

    #[test]
    fn test_naked_and_valued() {
        let p = Params::parse("1235,abc");
        assert!(p.is_valid_with_ident());
        assert_eq!(p.ident(), 1235);
        assert!(p.has("ABC"));
        assert!(p.has("abc"));
        assert!(p.is_naked("ABC"));

        let p = Params::parse("1236,abc,def=ghi");
        assert!(p.is_valid_with_ident());
        assert_eq!(p.get("DEF"), Some("ghi"));
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn test_ident_anywhere() {
        let p = Params::parse("def=ghi,1239");
        assert!(p.is_valid_with_ident());
        assert_eq!(p.ident(), 1239);
        assert_eq!(p.len(), 1);

        let p = Params::parse("1,2,abc=def");
        assert!(p.is_valid_with_ident());
        assert_eq!(p.ident(), 2);
    }

    #[test]
    fn test_bad_idents() {
        assert!(!Params::parse("123a").is_valid_with_ident());
        assert!(!Params::parse("0123").is_valid_with_ident());
        assert!(!Params::parse("0").is_valid_with_ident());
        assert!(!Params::parse("abc").is_valid_with_ident());
        assert!(!Params::parse("abc=def").is_valid_with_ident());
        assert!(Params::parse("abc=def").is_valid_without_ident());
        assert!(!Params::parse("123,0bc=def").is_valid_with_ident());
        assert!(!Params::parse("123,0bc").is_valid_with_ident());
        assert!(Params::parse("999999,ac=d").is_valid_with_ident());
        assert!(!Params::parse("9999999,ac=d").is_valid_with_ident());
    }

    #[test]
    fn test_empty_segments() {
        assert!(!Params::parse("123,,bc").is_valid_without_ident());
        assert!(!Params::parse("1,,abc=def").is_valid_with_ident());
        assert!(!Params::parse("1,").is_valid_with_ident());
    }

    #[test]
    fn test_bad_keys_and_values() {
        assert!(!Params::parse("1,a#c=def").is_valid_with_ident());
        assert!(!Params::parse("1,a:c=d ef").is_valid_with_ident());
        assert!(!Params::parse("1,ac=d ef").is_valid_with_ident());
        assert!(!Params::parse("ac$c=d").is_valid_without_ident());
        assert!(!Params::parse("AC$c=d").is_valid_without_ident());
        assert!(!Params::parse("3,ac=d,e, f=").is_valid_without_ident());
        assert!(!Params::parse("1,a=b=c").is_valid_without_ident());
    }

    #[test]
    fn test_empty_value_is_not_naked() {
        let p = Params::parse("3,ac=d,e,f=");
        assert!(p.is_valid_with_ident());
        assert!(p.is_naked("E"));
        assert!(!p.is_naked("F"));
        assert_eq!(p.get("F"), Some(""));
        assert!(Params::parse("ac=d,e,f=").is_valid_without_ident());
    }

    #[test]
    fn test_serialized_is_sorted() {
        let mut p = Params::new();
        p.set_ident(123);
        p.put("y", "456");
        p.put_naked("x");
        assert_eq!(p.serialized(), "123,X,Y=456");

        p.put_naked("E");
        p.put_naked("E");
        p.put("F", "G");
        assert_eq!(p.serialized(), "123,E,F=G,X,Y=456");

        p.remove("x");
        assert!(!p.has("X"));
    }

    #[test]
    fn test_encodable() {
        let mut p = Params::parse("1,ac=d,e");
        assert!(p.is_encodable());

        p.put("X", "a b");
        assert!(!p.is_encodable());
        p.put("X", "a,b");
        assert!(!p.is_encodable());
        p.put("X", "ab");
        assert!(p.is_encodable());

        p.put_naked("9a");
        assert!(!p.is_encodable());
        p.remove("9a");
        p.put_naked("a-b");
        assert!(!p.is_encodable());

        assert!(!Params::parse("1,,x").is_encodable());
    }
}
