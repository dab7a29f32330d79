//! RFC 6238 time-based one-time passwords (HMAC-SHA1, 30 second step, 6 digits).

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

pub const STEP_SECS: u64 = 30;
const DIGITS: u32 = 6;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TotpError {
    #[error("secret is empty")]
    Empty,
    #[error("invalid base32 character '{0}'")]
    InvalidChar(char),
}

/// Decode an RFC 4648 base32 secret. Case, spaces, dashes and trailing
/// padding are ignored, as authenticator apps display them.
pub fn decode_secret(secret: &str) -> Result<Vec<u8>, TotpError> {
    let mut out = Vec::with_capacity(secret.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;

    for c in secret.trim_end_matches('=').chars() {
        if c == ' ' || c == '-' {
            continue;
        }
        let value = match c.to_ascii_uppercase() {
            u @ 'A'..='Z' => u as u32 - 'A' as u32,
            d @ '2'..='7' => d as u32 - '2' as u32 + 26,
            other => return Err(TotpError::InvalidChar(other)),
        };
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    if out.is_empty() {
        return Err(TotpError::Empty);
    }
    Ok(out)
}

/// Compute the 6-digit code for `secret` at `unix_time`.
pub fn generate_totp(secret: &str, unix_time: u64) -> Result<String, TotpError> {
    let key = decode_secret(secret)?;
    let counter = unix_time / STEP_SECS;

    // HMAC accepts keys of any length
    let mut mac = HmacSha1::new_from_slice(&key).map_err(|_| TotpError::Empty)?;
    mac.update(&counter.to_be_bytes());
    let hash = mac.finalize().into_bytes();

    let offset = (hash[hash.len() - 1] & 0x0f) as usize;
    let truncated = u32::from_be_bytes([
        hash[offset] & 0x7f,
        hash[offset + 1],
        hash[offset + 2],
        hash[offset + 3],
    ]);

    let code = truncated % 10u32.pow(DIGITS);
    Ok(format!("{:0width$}", code, width = DIGITS as usize))
}

/// Code for the current wall-clock time.
pub fn current_code(secret: &str) -> Result<String, TotpError> {
    generate_totp(secret, now())
}

/// Seconds until the code valid at `unix_time` rolls over.
pub fn seconds_remaining(unix_time: u64) -> u64 {
    STEP_SECS - unix_time % STEP_SECS
}

pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
