//! Keystore bytes paired with their digest and settings hash

use super::codec::{create_with, KeystoreConfig, CONFIG};
use super::digest::{keystore_digest, settings_hash};
use super::entries::Settings;
use crate::error::Result;

#[derive(Clone, PartialEq, Eq)]
pub struct KeystoreArtifact {
    pub content: Vec<u8>,
    /// Hex SHA-256 of `content`, reported back by nodes after a reload
    pub digest: String,
    /// Hex SHA-256 of the input settings, used for change detection
    pub settings_hash: String,
}

impl KeystoreArtifact {
    pub fn build(settings: &Settings) -> Result<Self> {
        Self::build_with(settings, &CONFIG)
    }

    pub fn build_with(settings: &Settings, config: &KeystoreConfig) -> Result<Self> {
        let content = create_with(settings, config)?;
        Ok(Self {
            digest: keystore_digest(&content),
            settings_hash: settings_hash(settings),
            content,
        })
    }
}

// Content is encrypted but still secret material, keep it out of logs
impl std::fmt::Debug for KeystoreArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoreArtifact")
            .field("len", &self.content.len())
            .field("digest", &self.digest)
            .field("settings_hash", &self.settings_hash)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::{ByteOrder, SEED_SETTING_KEY};

    const FAST: KeystoreConfig = KeystoreConfig {
        kdf_iterations: 1_000,
        cipher_key_bits: 256,
        outer_byte_order: ByteOrder::Little,
    };

    #[test]
    fn test_same_settings_same_hash_different_digest() {
        let settings: Settings = [("a.b".to_string(), b"c".to_vec())].into();
        let first = KeystoreArtifact::build_with(&settings, &FAST).unwrap();
        let second = KeystoreArtifact::build_with(&settings, &FAST).unwrap();

        assert_eq!(first.settings_hash, second.settings_hash);
        assert_ne!(first.digest, second.digest);
        assert_eq!(first.digest, keystore_digest(&first.content));
    }

    #[test]
    fn test_settings_hash_excludes_generated_seed() {
        let settings = Settings::new();
        let artifact = KeystoreArtifact::build_with(&settings, &FAST).unwrap();
        assert_eq!(artifact.settings_hash, settings_hash(&settings));
        assert!(!settings.contains_key(SEED_SETTING_KEY));
    }
}
