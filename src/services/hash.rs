//! Salted one-way hashing of mail addresses.
//!
//! A hash is `HMAC-SHA512(key = salt, data)` with the ASCII prefix `sha512:` in front of the
//! digest, stored base64 encoded. Salts are 64 random bytes, also base64 encoded.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha512;

type HmacSha512 = Hmac<Sha512>;

const PREFIX: &[u8] = b"sha512:";
const SALT_LEN: usize = 64;

pub fn new_salt() -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    STANDARD.encode(salt)
}

fn mac_for(data: &str, salt: &str) -> Option<HmacSha512> {
    let salt = STANDARD.decode(salt).ok()?;
    let mut mac = HmacSha512::new_from_slice(&salt).expect("HMAC can take key of any size");
    mac.update(data.as_bytes());
    Some(mac)
}

/// Hashes `data` with an existing salt. `None` if the salt is not valid base64.
pub fn hash_with_salt(data: &str, salt: &str) -> Option<String> {
    let digest = mac_for(data, salt)?.finalize().into_bytes();
    let mut out = PREFIX.to_vec();
    out.extend_from_slice(&digest);
    Some(STANDARD.encode(out))
}

/// Returns `(hash, salt)` for a fresh random salt.
pub fn hash(data: &str) -> (String, String) {
    let salt = new_salt();
    // A freshly generated salt always decodes.
    let hashed = hash_with_salt(data, &salt).unwrap_or_default();
    (hashed, salt)
}

/// Constant-time check whether `hashed` was produced from `data` and `salt`.
pub fn verify(data: &str, salt: &str, hashed: &str) -> bool {
    let Ok(stored) = STANDARD.decode(hashed) else {
        return false;
    };
    let Some(digest) = stored.strip_prefix(PREFIX) else {
        return false;
    };
    match mac_for(data, salt) {
        Some(mac) => mac.verify_slice(digest).is_ok(),
        None => false,
    }
}
