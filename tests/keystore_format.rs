//! Checks of the produced keystore file through the public API only

use es_keystore_k8s::keystore::{
    keystore_digest, settings_hash, KeystoreArtifact, Settings, CODEC_MAGIC, CODEC_NAME,
    FOOTER_LENGTH, FOOTER_MAGIC, KEYSTORE_VERSION, SALT_LENGTH,
};

fn settings() -> Settings {
    [
        ("s3.client.default.access_key".to_string(), b"AKIA".to_vec()),
        ("s3.client.default.secret_key".to_string(), b"secret".to_vec()),
    ]
    .into()
}

#[test]
fn test_production_keystore_layout() {
    let artifact = KeystoreArtifact::build(&settings()).unwrap();
    let content = &artifact.content;

    // Lucene header
    assert_eq!(&content[0..4], &CODEC_MAGIC.to_be_bytes());
    assert_eq!(content[4] as usize, CODEC_NAME.len());
    let name_end = 5 + CODEC_NAME.len();
    assert_eq!(&content[5..name_end], CODEC_NAME.as_bytes());
    assert_eq!(
        &content[name_end..name_end + 4],
        &KEYSTORE_VERSION.to_be_bytes()
    );

    // no password, then the little-endian data block
    let mut pos = name_end + 4;
    assert_eq!(content[pos], 0);
    pos += 1;
    let data_size = i32::from_le_bytes(content[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4;
    assert_eq!(pos + data_size + FOOTER_LENGTH, content.len());
    let salt_len = i32::from_le_bytes(content[pos..pos + 4].try_into().unwrap()) as usize;
    assert_eq!(salt_len, SALT_LENGTH);

    // footer with a checksum over everything before it
    let footer = &content[content.len() - FOOTER_LENGTH..];
    assert_eq!(&footer[0..4], &FOOTER_MAGIC.to_be_bytes());
    assert_eq!(&footer[4..8], &0i32.to_be_bytes());
    let crc = i64::from_be_bytes(footer[8..16].try_into().unwrap());
    let expected = crc32fast::hash(&content[..content.len() - 8]);
    assert_eq!(crc, i64::from(expected));

    assert_eq!(artifact.digest, keystore_digest(content));
    assert_eq!(artifact.settings_hash, settings_hash(&settings()));
}

#[test]
fn test_settings_hash_ignores_insertion_order() {
    let mut reversed = Settings::new();
    reversed.insert("s3.client.default.secret_key".to_string(), b"secret".to_vec());
    reversed.insert("s3.client.default.access_key".to_string(), b"AKIA".to_vec());

    assert_eq!(settings_hash(&settings()), settings_hash(&reversed));

    reversed.insert("s3.client.default.secret_key".to_string(), b"rotated".to_vec());
    assert_ne!(settings_hash(&settings()), settings_hash(&reversed));
}
