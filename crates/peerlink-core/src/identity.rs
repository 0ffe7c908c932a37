//! Peer identity generation and validation
//!
//! Generated ids look like `pl-3fQk9ZrT0aXbLm2N`: a fixed namespace prefix
//! followed by [`GENERATED_ID_LEN`] characters drawn uniformly from
//! `[A-Za-z0-9]` using the operating system's entropy source.

use crate::error::RelayError;
use crate::{DEFAULT_ID_PREFIX, GENERATED_ID_LEN, MAX_PEER_ID_LEN};

/// Characters used in generated ids
const ID_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Largest byte value that maps onto `ID_CHARS` without modulo bias
const UNBIASED_LIMIT: u8 = (256 - 256 % ID_CHARS.len()) as u8;

/// Produces candidate peer ids.
///
/// The generator does not know about the registry; admission decides
/// uniqueness and asks for another candidate on collision.
#[derive(Clone, Debug)]
pub struct IdGenerator {
    prefix: String,
}

impl IdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Generate a fresh candidate id
    pub fn generate(&self) -> Result<String, RelayError> {
        let mut id = String::with_capacity(self.prefix.len() + GENERATED_ID_LEN);
        id.push_str(&self.prefix);

        let mut remaining = GENERATED_ID_LEN;
        let mut bytes = [0u8; GENERATED_ID_LEN * 2];
        while remaining > 0 {
            getrandom::fill(&mut bytes).map_err(|e| RelayError::Entropy(e.to_string()))?;
            for b in bytes.iter().filter(|b| **b < UNBIASED_LIMIT).take(remaining) {
                id.push(ID_CHARS[(*b as usize) % ID_CHARS.len()] as char);
                remaining -= 1;
            }
        }

        Ok(id)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_ID_PREFIX)
    }
}

/// Check a client-supplied peer id.
///
/// Accepts alphanumeric words separated by single `-`, `_` or space, up to
/// [`MAX_PEER_ID_LEN`] bytes.
pub fn validate_peer_id(id: &str) -> Result<(), RelayError> {
    let invalid = || RelayError::InvalidId(id.to_string());

    if id.is_empty() || id.len() > MAX_PEER_ID_LEN {
        return Err(invalid());
    }

    let mut prev_sep = true;
    for c in id.chars() {
        if c.is_ascii_alphanumeric() {
            prev_sep = false;
        } else if matches!(c, '-' | '_' | ' ') && !prev_sep {
            prev_sep = true;
        } else {
            return Err(invalid());
        }
    }

    if prev_sep {
        return Err(invalid());
    }
    Ok(())
}
