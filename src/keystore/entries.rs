//! Keystore entries and the bootstrap seed

use std::borrow::Cow;
use std::collections::HashMap;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};

/// Secure settings keyed by setting name
pub type Settings = HashMap<String, Vec<u8>>;

/// Reserved setting present in every keystore
pub const SEED_SETTING_KEY: &str = "keystore.seed";

/// Length of a generated bootstrap seed
pub const SEED_LENGTH: usize = 20;

/// Alphabet the bootstrap seed is drawn from
pub const SEED_CHARS: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789~!@#$%^&*-_=+?";

/// Longest setting name the inner payload can encode (unsigned short length)
pub const MAX_NAME_LENGTH: usize = u16::MAX as usize;

/// A single named secret setting, borrowed from a [`Settings`] bag
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry<'a> {
    pub name: &'a str,
    pub value: &'a [u8],
}

/// Generate a random bootstrap seed from a cryptographically secure source.
///
/// Bytes are drawn from the OS RNG and mapped onto [`SEED_CHARS`] with
/// rejection sampling so that every character is equally likely.
pub fn generate_bootstrap_seed() -> Result<Vec<u8>> {
    let alphabet = SEED_CHARS.as_bytes();
    // Largest multiple of the alphabet size that fits in a byte
    let limit = (256 / alphabet.len() * alphabet.len()) as u8;

    let mut seed = Vec::with_capacity(SEED_LENGTH);
    let mut buf = [0u8; 32];
    while seed.len() < SEED_LENGTH {
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| Error::CryptoError(format!("failed to read random bytes: {e}")))?;
        for b in buf.iter().copied().filter(|b| *b < limit) {
            if seed.len() == SEED_LENGTH {
                break;
            }
            seed.push(alphabet[b as usize % alphabet.len()]);
        }
    }
    Ok(seed)
}

/// Return the settings with a bootstrap seed, generating one if missing.
///
/// The input is never mutated: when a seed has to be added a copy is returned.
pub fn ensure_bootstrap_seed(settings: &Settings) -> Result<Cow<'_, Settings>> {
    if settings.contains_key(SEED_SETTING_KEY) {
        return Ok(Cow::Borrowed(settings));
    }
    let mut with_seed = settings.clone();
    with_seed.insert(SEED_SETTING_KEY.to_string(), generate_bootstrap_seed()?);
    Ok(Cow::Owned(with_seed))
}

/// Convert settings into entries sorted by name.
///
/// `str` ordering is byte-wise, which is the lexicographic order of the UTF-8
/// encoding.
pub fn settings_to_entries(settings: &Settings) -> Vec<Entry<'_>> {
    let mut entries: Vec<Entry<'_>> = settings
        .iter()
        .map(|(name, value)| Entry {
            name: name.as_str(),
            value: value.as_slice(),
        })
        .collect();
    entries.sort_unstable_by(|a, b| a.name.cmp(b.name));
    entries
}
