//! Direct-message body transform: XOR against a key derived from the two
//! participant ids, then base64. The key is derivable by anyone who knows
//! both user ids, so this is obfuscation against casual inspection of stored
//! rows, not encryption. Nothing in this crate claims otherwise.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use shared::domain::UserId;

pub const KEY_LEN: usize = 16;

/// Derives the shared transform key for a direct conversation. The ids are
/// sorted lexicographically first so both participants compute the same key
/// regardless of who initiates, then the joined form is cycled to fill the
/// fixed key width.
pub fn derive_key(a: &UserId, b: &UserId) -> [u8; KEY_LEN] {
    let (lo, hi) = if a.as_str() <= b.as_str() {
        (a, b)
    } else {
        (b, a)
    };
    let joined = format!("{}:{}", lo.as_str(), hi.as_str());
    let bytes = joined.as_bytes();
    let mut key = [0u8; KEY_LEN];
    for (i, slot) in key.iter_mut().enumerate() {
        *slot = bytes[i % bytes.len()];
    }
    key
}

pub fn encode(key: &[u8; KEY_LEN], plaintext: &str) -> String {
    let mixed: Vec<u8> = plaintext
        .bytes()
        .enumerate()
        .map(|(i, byte)| byte ^ key[i % KEY_LEN])
        .collect();
    STANDARD.encode(mixed)
}

/// Inverse of [`encode`]. Fails soft: input that does not decode as
/// base64-wrapped XOR output (rows written before the transform existed, or
/// by surfaces that never applied it) is returned unchanged.
pub fn decode(key: &[u8; KEY_LEN], stored: &str) -> String {
    let Ok(raw) = STANDARD.decode(stored) else {
        return stored.to_string();
    };
    let mixed: Vec<u8> = raw
        .iter()
        .enumerate()
        .map(|(i, byte)| byte ^ key[i % KEY_LEN])
        .collect();
    match String::from_utf8(mixed) {
        Ok(text) => text,
        Err(_) => stored.to_string(),
    }
}
