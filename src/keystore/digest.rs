//! Keystore digest and settings hash
//!
//! The two hashes serve different purposes and must not be mixed up:
//! the digest of the produced file is what every node reports back once it
//! has reloaded the keystore, while the settings hash decides whether the
//! file has to be regenerated at all. The file embeds a random salt and IV,
//! so regenerating identical settings changes the digest but not the hash.

use sha2::{Digest, Sha256};

use super::entries::{settings_to_entries, Settings};

/// Lowercase hex SHA-256 of the keystore file content
pub fn keystore_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Lowercase hex SHA-256 over `name 0x00 value 0x00` for every setting,
/// in name order.
pub fn settings_hash(settings: &Settings) -> String {
    let mut hasher = Sha256::new();
    for entry in settings_to_entries(settings) {
        hasher.update(entry.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(entry.value);
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keystore_digest_is_lowercase_hex_sha256() {
        assert_eq!(
            keystore_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(keystore_digest(b"abc").len(), 64);
    }

    #[test]
    fn test_settings_hash_single_setting() {
        let name = "xpack.notification.email.account.foo.smtp.secure_password";
        let settings: Settings = [(name.to_string(), b"secret".to_vec())].into();

        let mut raw = Vec::new();
        raw.extend_from_slice(name.as_bytes());
        raw.push(0);
        raw.extend_from_slice(b"secret");
        raw.push(0);

        assert_eq!(settings_hash(&settings), hex::encode(Sha256::digest(&raw)));
    }

    #[test]
    fn test_settings_hash_ignores_insertion_order() {
        let mut a = Settings::new();
        a.insert("b".to_string(), b"2".to_vec());
        a.insert("a".to_string(), b"1".to_vec());
        a.insert("c".to_string(), b"3".to_vec());

        let mut b = Settings::new();
        b.insert("c".to_string(), b"3".to_vec());
        b.insert("a".to_string(), b"1".to_vec());
        b.insert("b".to_string(), b"2".to_vec());

        assert_eq!(settings_hash(&a), settings_hash(&b));
    }

    #[test]
    fn test_settings_hash_discriminates() {
        let base: Settings = [("a".to_string(), b"1".to_vec())].into();
        let other_value: Settings = [("a".to_string(), b"2".to_vec())].into();
        let other_name: Settings = [("b".to_string(), b"1".to_vec())].into();
        // separators keep "a"+"b1" distinct from "ab"+"1"
        let shifted: Settings = [("a".to_string(), b"b1".to_vec())].into();
        let shifted_back: Settings = [("ab".to_string(), b"1".to_vec())].into();

        assert_ne!(settings_hash(&base), settings_hash(&other_value));
        assert_ne!(settings_hash(&base), settings_hash(&other_name));
        assert_ne!(settings_hash(&shifted), settings_hash(&shifted_back));
        assert_ne!(settings_hash(&base), settings_hash(&Settings::new()));
    }
}
