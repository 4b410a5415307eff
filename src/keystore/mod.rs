//! Elasticsearch keystore file generation
//!
//! Produces `elasticsearch.keystore` files that the Java `KeyStoreWrapper`
//! loads without modification:
//!
//! | Part           | Encoding                                         |
//! |----------------|--------------------------------------------------|
//! | Lucene header  | big-endian magic, VInt codec name, version 7     |
//! | Password flag  | single `0x00` byte (empty password)              |
//! | Data block     | little-endian lengths: salt, IV, ciphertext      |
//! | Ciphertext     | AES-256-GCM over the big-endian entry payload    |
//! | Lucene footer  | big-endian magic, algorithm id, CRC32            |
//!
//! The module is write-only: it never parses an existing keystore.

mod artifact;
mod codec;
mod digest;
mod entries;

pub use artifact::KeystoreArtifact;
pub use codec::{
    create, create_with, derive_key, encrypt, generate_iv, generate_salt, serialize_entries,
    write_header, write_vint, ByteOrder, ChecksumWriter, KeystoreConfig, CODEC_MAGIC, CODEC_NAME,
    CONFIG, FOOTER_LENGTH, FOOTER_MAGIC, GCM_TAG_LENGTH, INNER_BYTE_ORDER, IV_LENGTH,
    KEYSTORE_VERSION, SALT_LENGTH,
};
pub use digest::{keystore_digest, settings_hash};
pub use entries::{
    ensure_bootstrap_seed, generate_bootstrap_seed, settings_to_entries, Entry, Settings,
    MAX_NAME_LENGTH, SEED_CHARS, SEED_LENGTH, SEED_SETTING_KEY,
};
