//! Opaque random tokens for password resets and session ids.

use rand::{rngs::OsRng, RngCore};
use time::{Duration, OffsetDateTime};

/// 32 bytes of OS entropy.
pub const TOKEN_BYTES: usize = 32;
/// Hex encoding doubles the length.
pub const TOKEN_LEN: usize = TOKEN_BYTES * 2;

pub fn generate() -> String {
    let mut buf = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn expiry_from(now: OffsetDateTime, hours: i64) -> OffsetDateTime {
    now + Duration::hours(hours)
}

/// Shape check only (length and lowercase hex). Used to skip the repository
/// for obviously bogus input, not as an authorization check.
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
