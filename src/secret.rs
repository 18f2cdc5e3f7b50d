//! Opaque secret generation for device credentials.

use crate::error::{GatewayError, GatewayResult};
use rand::rngs::OsRng;
use rand::RngCore;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

// Largest multiple of the alphabet size below 256; bytes at or above it are
// re-drawn so every symbol stays equally likely.
const REJECT_AT: u8 = 248;

/// Generate a random alphanumeric secret of `length` characters from the OS
/// random source. Fails with [`GatewayError::EntropyUnavailable`] if the
/// source cannot be read; there is no weaker fallback.
pub fn generate_secret(length: usize) -> GatewayResult<String> {
    let mut secret = String::with_capacity(length);
    let mut buf = [0u8; 64];

    while secret.len() < length {
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(GatewayError::EntropyUnavailable)?;
        for &byte in buf.iter() {
            if secret.len() == length {
                break;
            }
            if byte < REJECT_AT {
                secret.push(ALPHABET[(byte % ALPHABET.len() as u8) as usize] as char);
            }
        }
    }

    Ok(secret)
}
