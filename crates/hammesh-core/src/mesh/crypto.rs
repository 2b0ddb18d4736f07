//! Frame encryption and packet authentication
//!
//! Two independent mechanisms, each keyed by its own pre-shared key:
//!
//! - **Encryption** wraps the whole L3 frame before FEC. AES-256 is used only
//!   as a block primitive; chaining is done here:
//!
//! ```text
//! [ IV (16, byte 0 = 0x05) ][ len (2, LE) | plaintext | zero pad ]
//!                            \________ CBC, block i ^= block i-1 ________/
//! ```
//!
//! - **HMAC** signs `to || from || ident || msg` with HMAC-SHA256 and keeps
//!   the first 48 bits as 12 lowercase hex characters (param `H`).
//!
//! Keys live in the configuration store and are cached by [`KeyCache`] until
//! [`KeyCache::invalidate`] is called.

use super::callsign::Callsign;
use crate::config::{ConfigStore, NodeSettings};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::cell::OnceCell;
use thiserror::Error;

/// First byte of every encrypted frame
pub const MAGIC: u8 = 0x05;

/// AES block size
pub const BLOCK_LEN: usize = 16;

/// Length prefix inside the encrypted envelope
const LENGTH_LEN: usize = 2;

/// Truncated HMAC size in hex characters (48 bits)
pub const HMAC_HEX_LEN: usize = 12;

type HmacSha256 = Hmac<Sha256>;

/// Crypto failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encrypted frame too short ({0} bytes)")]
    TooShort(usize),

    #[error("encrypted frame not a multiple of block size ({0} bytes)")]
    NotBlockMultiple(usize),

    #[error("encrypted frame with unknown preamble")]
    BadMarker,

    #[error("stated length {stated} inconsistent with {blocks} blocks")]
    LengthMismatch { stated: usize, blocks: usize },

    #[error("plaintext of {0} bytes too long to encrypt")]
    PayloadTooLong(usize),

    #[error("encrypted frame but no key configured")]
    EncryptedWithoutKey,

    #[error("cleartext frame but encryption key configured")]
    CleartextWithKey,

    #[error("invalid key length")]
    InvalidKeyLength,

    #[error("invalid HMAC size ({0} chars)")]
    HmacSize(usize),

    #[error("bad HMAC")]
    HmacMismatch,
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// AES-256 key derived from a pre-shared key string
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey([u8; 32]);

impl CipherKey {
    /// Zero-pad (or truncate) the PSK to 32 bytes
    pub fn from_psk(psk: &[u8]) -> Self {
        let mut key = [0u8; 32];
        let n = psk.len().min(32);
        key[..n].copy_from_slice(&psk[..n]);
        Self(key)
    }

    fn cipher(&self) -> Aes256 {
        Aes256::new(GenericArray::from_slice(&self.0))
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CipherKey").field(&"[REDACTED]").finish()
    }
}

/// Lazily loaded key material
///
/// Owned by the routing engine. Call [`invalidate`](Self::invalidate) after
/// any configuration change so the next access reloads from the store.
#[derive(Default)]
pub struct KeyCache {
    hmac: OnceCell<Option<Vec<u8>>>,
    cipher: OnceCell<Option<CipherKey>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// HMAC key used to sign or verify traffic from `station`
    ///
    /// All stations share the node-wide key for now; per-prefix keys would
    /// be looked up here.
    pub fn hmac_key_for<'a>(
        &'a self,
        store: &dyn ConfigStore,
        _station: &Callsign,
    ) -> Option<&'a [u8]> {
        self.hmac
            .get_or_init(|| store.hmac_psk().map(String::into_bytes))
            .as_deref()
    }

    /// Frame encryption key, if configured
    pub fn cipher_key<'a>(&'a self, store: &dyn ConfigStore) -> Option<&'a CipherKey> {
        self.cipher
            .get_or_init(|| store.crypto_psk().map(|psk| CipherKey::from_psk(psk.as_bytes())))
            .as_ref()
    }

    /// Drop cached keys
    pub fn invalidate(&mut self) {
        self.hmac.take();
        self.cipher.take();
    }
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field("hmac_loaded", &self.hmac.get().is_some())
            .field("cipher_loaded", &self.cipher.get().is_some())
            .finish()
    }
}

/// Encrypt a frame into `[IV][len][plaintext][pad]` with hand-built CBC
pub fn encrypt(key: &CipherKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    encrypt_with_rng(key, plaintext, &mut rand::thread_rng())
}

pub fn encrypt_with_rng<R: RngCore + ?Sized>(
    key: &CipherKey,
    plaintext: &[u8],
    rng: &mut R,
) -> CryptoResult<Vec<u8>> {
    let payload_len =
        u16::try_from(plaintext.len()).map_err(|_| CryptoError::PayloadTooLong(plaintext.len()))?;

    let blocks = envelope_blocks(plaintext.len());
    let mut buffer = vec![0u8; blocks * BLOCK_LEN];

    rng.fill_bytes(&mut buffer[..BLOCK_LEN]);
    buffer[0] = MAGIC;
    buffer[BLOCK_LEN..BLOCK_LEN + LENGTH_LEN].copy_from_slice(&payload_len.to_le_bytes());
    buffer[BLOCK_LEN + LENGTH_LEN..BLOCK_LEN + LENGTH_LEN + plaintext.len()]
        .copy_from_slice(plaintext);

    let cipher = key.cipher();
    for i in 1..blocks {
        let (previous, current) = buffer.split_at_mut(i * BLOCK_LEN);
        let previous = &previous[(i - 1) * BLOCK_LEN..];
        let block = &mut current[..BLOCK_LEN];
        for (b, p) in block.iter_mut().zip(previous) {
            *b ^= p;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }

    Ok(buffer)
}

/// Reverse [`encrypt`], validating the envelope
pub fn decrypt(key: &CipherKey, frame: &[u8]) -> CryptoResult<Vec<u8>> {
    if frame.len() < 2 * BLOCK_LEN {
        return Err(CryptoError::TooShort(frame.len()));
    }
    if frame.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::NotBlockMultiple(frame.len()));
    }
    if frame[0] != MAGIC {
        return Err(CryptoError::BadMarker);
    }

    let blocks = frame.len() / BLOCK_LEN;
    let mut buffer = frame.to_vec();
    let cipher = key.cipher();

    // last block first, so block i-1 is still ciphertext when used
    for i in (1..blocks).rev() {
        let (previous, current) = buffer.split_at_mut(i * BLOCK_LEN);
        let previous = &previous[(i - 1) * BLOCK_LEN..];
        let block = &mut current[..BLOCK_LEN];
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
        for (b, p) in block.iter_mut().zip(previous) {
            *b ^= p;
        }
    }

    let stated = u16::from_le_bytes([buffer[BLOCK_LEN], buffer[BLOCK_LEN + 1]]) as usize;
    if envelope_blocks(stated) != blocks {
        return Err(CryptoError::LengthMismatch { stated, blocks });
    }

    let start = BLOCK_LEN + LENGTH_LEN;
    Ok(buffer[start..start + stated].to_vec())
}

fn envelope_blocks(payload_len: usize) -> usize {
    (BLOCK_LEN + LENGTH_LEN + payload_len).div_ceil(BLOCK_LEN)
}

/// Result of inspecting a received frame in "maybe encrypted" mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unwrapped<'a> {
    /// No key configured and the frame was cleartext
    Cleartext(&'a [u8]),
    /// Frame carried the marker and decrypted cleanly
    Decrypted(Vec<u8>),
}

impl Unwrapped<'_> {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Unwrapped::Cleartext(b) => b,
            Unwrapped::Decrypted(b) => b,
        }
    }

    pub fn was_encrypted(&self) -> bool {
        matches!(self, Unwrapped::Decrypted(_))
    }
}

/// Decrypt a frame if it is marked encrypted and a key is configured
pub fn unwrap_frame<'a>(frame: &'a [u8], key: Option<&CipherKey>) -> CryptoResult<Unwrapped<'a>> {
    let marked = frame.first() == Some(&MAGIC);
    match (marked, key) {
        (true, Some(key)) => decrypt(key, frame).map(Unwrapped::Decrypted),
        (true, None) => Err(CryptoError::EncryptedWithoutKey),
        (false, Some(_)) => Err(CryptoError::CleartextWithKey),
        (false, None) => Ok(Unwrapped::Cleartext(frame)),
    }
}

fn hmac_input(to: &Callsign, from: &Callsign, ident: u32, msg: &[u8]) -> Vec<u8> {
    let ident = ident.to_string();
    let mut data = Vec::with_capacity(to.as_str().len() + from.as_str().len() + ident.len() + msg.len());
    data.extend_from_slice(to.as_str().as_bytes());
    data.extend_from_slice(from.as_str().as_bytes());
    data.extend_from_slice(ident.as_bytes());
    data.extend_from_slice(msg);
    data
}

/// Truncated HMAC-SHA256 tag as 12 lowercase hex characters
pub fn hmac_tag(
    key: &[u8],
    to: &Callsign,
    from: &Callsign,
    ident: u32,
    msg: &[u8],
) -> CryptoResult<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    mac.update(&hmac_input(to, from, ident, msg));
    let digest = mac.finalize().into_bytes();
    Ok(hex::encode(&digest[..HMAC_HEX_LEN / 2]))
}

/// Check a received tag against the packet tuple
pub fn verify_hmac(
    key: &[u8],
    to: &Callsign,
    from: &Callsign,
    ident: u32,
    msg: &[u8],
    tag: &str,
) -> CryptoResult<()> {
    if tag.len() != HMAC_HEX_LEN {
        return Err(CryptoError::HmacSize(tag.len()));
    }
    let received = hex::decode(tag).map_err(|_| CryptoError::HmacMismatch)?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    mac.update(&hmac_input(to, from, ident, msg));
    mac.verify_truncated_left(&received)
        .map_err(|_| CryptoError::HmacMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{keys, MemoryStore};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn key() -> CipherKey {
        CipherKey::from_psk(b"abracadabra")
    }

    #[test]
    fn test_encrypt_layout() {
        let mut rng = StdRng::seed_from_u64(7);
        let out = encrypt_with_rng(&key(), b"AAAA<BBBB:1 hi", &mut rng).unwrap();
        assert_eq!(out[0], MAGIC);
        // 16 IV + ceil((2 + 14) / 16) blocks
        assert_eq!(out.len(), 32);
        assert_eq!(decrypt(&key(), &out).unwrap(), b"AAAA<BBBB:1 hi");
    }

    #[test]
    fn test_encrypt_boundaries() {
        for len in [0usize, 13, 14, 15, 30, 180] {
            let plain: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let out = encrypt(&key(), &plain).unwrap();
            assert_eq!(out.len() % BLOCK_LEN, 0);
            assert_eq!(decrypt(&key(), &out).unwrap(), plain, "len {}", len);
        }
    }

    #[test]
    fn test_decrypt_rejects_garbage() {
        assert_eq!(decrypt(&key(), &[MAGIC; 16]), Err(CryptoError::TooShort(16)));
        assert_eq!(decrypt(&key(), &[MAGIC; 33]), Err(CryptoError::NotBlockMultiple(33)));
        assert_eq!(decrypt(&key(), &[0u8; 32]), Err(CryptoError::BadMarker));

        // extra block appended: stated length no longer matches block count
        let mut out = encrypt(&key(), b"hello").unwrap();
        out.extend_from_slice(&[0u8; 16]);
        assert!(matches!(decrypt(&key(), &out), Err(CryptoError::LengthMismatch { .. })));
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let out = encrypt(&key(), b"AAAA<BBBB:1 a secret message").unwrap();
        let other = CipherKey::from_psk(b"not the key");
        match decrypt(&other, &out) {
            Err(CryptoError::LengthMismatch { .. }) => {}
            Ok(plain) => assert_ne!(plain, b"AAAA<BBBB:1 a secret message"),
            Err(e) => panic!("unexpected error {:?}", e),
        }
    }

    #[test]
    fn test_unwrap_frame_outcomes() {
        let k = key();
        let enc = encrypt(&k, b"AAAA<BBBB:1").unwrap();

        assert_eq!(
            unwrap_frame(&enc, Some(&k)).unwrap(),
            Unwrapped::Decrypted(b"AAAA<BBBB:1".to_vec())
        );
        assert_eq!(unwrap_frame(&enc, None), Err(CryptoError::EncryptedWithoutKey));
        assert_eq!(unwrap_frame(b"AAAA<BBBB:1", Some(&k)), Err(CryptoError::CleartextWithKey));
        assert_eq!(
            unwrap_frame(b"AAAA<BBBB:1", None).unwrap(),
            Unwrapped::Cleartext(b"AAAA<BBBB:1")
        );
    }

    #[test]
    fn test_hmac_tag_and_verify() {
        let to = Callsign::new("AAAA");
        let from = Callsign::new("BBBB-1");
        let tag = hmac_tag(b"psk", &to, &from, 42, b"hello").unwrap();
        assert_eq!(tag.len(), HMAC_HEX_LEN);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(tag, hmac_tag(b"psk", &to, &from, 42, b"hello").unwrap());

        assert!(verify_hmac(b"psk", &to, &from, 42, b"hello", &tag).is_ok());
        assert_eq!(
            verify_hmac(b"psk", &to, &from, 43, b"hello", &tag),
            Err(CryptoError::HmacMismatch)
        );
        assert_eq!(
            verify_hmac(b"psk", &to, &from, 42, b"hellp", &tag),
            Err(CryptoError::HmacMismatch)
        );
        assert_eq!(
            verify_hmac(b"psk", &to, &from, 42, b"hello", &tag[..10]),
            Err(CryptoError::HmacSize(10))
        );
    }

    #[test]
    fn test_hmac_single_bit_flips() {
        let to = Callsign::new("AAAA");
        let from = Callsign::new("BBBB");
        let msg = b"switch on".to_vec();
        let tag = hmac_tag(b"k", &to, &from, 7, &msg).unwrap();
        for byte in 0..msg.len() {
            for bit in 0..8 {
                let mut flipped = msg.clone();
                flipped[byte] ^= 1 << bit;
                assert!(verify_hmac(b"k", &to, &from, 7, &flipped, &tag).is_err());
            }
        }
        // flip one hex digit of the tag
        let mut bad_tag: Vec<char> = tag.chars().collect();
        bad_tag[0] = if bad_tag[0] == '0' { '1' } else { '0' };
        let bad_tag: String = bad_tag.into_iter().collect();
        assert!(verify_hmac(b"k", &to, &from, 7, &msg, &bad_tag).is_err());
    }

    #[test]
    fn test_key_cache_invalidate() {
        let mut store = MemoryStore::new();
        let mut cache = KeyCache::new();
        let me = Callsign::new("PU5EPX");

        assert!(cache.hmac_key_for(&store, &me).is_none());
        store.set(keys::HMAC_PSK, "secret");
        // still cached
        assert!(cache.hmac_key_for(&store, &me).is_none());

        cache.invalidate();
        assert_eq!(cache.hmac_key_for(&store, &me), Some(&b"secret"[..]));

        store.set(keys::CRYPTO_PSK, "other");
        cache.invalidate();
        assert_eq!(cache.cipher_key(&store), Some(&CipherKey::from_psk(b"other")));
    }
}
