//! Keystore binary codec
//!
//! Two byte orders are in play. The Lucene header and footer and the
//! encrypted entry payload are big-endian, the data block that carries salt,
//! IV and ciphertext uses the order configured in [`KeystoreConfig`]
//! (little-endian for format version 7). Every integer write names its order
//! explicitly so the two never get crossed.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;

use super::entries::{
    ensure_bootstrap_seed, settings_to_entries, Entry, Settings, MAX_NAME_LENGTH,
};
use crate::error::{Error, Result};

/// Lucene codec header magic
pub const CODEC_MAGIC: u32 = 0x3FD7_6C17;

/// Lucene codec footer magic
pub const FOOTER_MAGIC: u32 = !CODEC_MAGIC;

/// Codec name written in the header
pub const CODEC_NAME: &str = "elasticsearch.keystore";

/// Keystore format version
pub const KEYSTORE_VERSION: i32 = 7;

pub const SALT_LENGTH: usize = 64;
pub const IV_LENGTH: usize = 12;
pub const GCM_TAG_LENGTH: usize = 16;

/// Footer magic, algorithm id and checksum
pub const FOOTER_LENGTH: usize = 4 + 4 + 8;

/// Byte order of the encrypted entry payload (Java `DataOutputStream`)
pub const INNER_BYTE_ORDER: ByteOrder = ByteOrder::Big;

/// Byte order of the Lucene header and footer
const LUCENE_BYTE_ORDER: ByteOrder = ByteOrder::Big;

/// Empty-password flag
const PASSWORD_ABSENT: u8 = 0x00;

/// Footer checksum algorithm id
const FOOTER_ALGORITHM_ID: i32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    fn i32_bytes(self, v: i32) -> [u8; 4] {
        match self {
            ByteOrder::Big => v.to_be_bytes(),
            ByteOrder::Little => v.to_le_bytes(),
        }
    }

    fn u32_bytes(self, v: u32) -> [u8; 4] {
        match self {
            ByteOrder::Big => v.to_be_bytes(),
            ByteOrder::Little => v.to_le_bytes(),
        }
    }

    fn i64_bytes(self, v: i64) -> [u8; 8] {
        match self {
            ByteOrder::Big => v.to_be_bytes(),
            ByteOrder::Little => v.to_le_bytes(),
        }
    }
}

/// Format parameters for a keystore version
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeystoreConfig {
    pub kdf_iterations: u32,
    pub cipher_key_bits: usize,
    pub outer_byte_order: ByteOrder,
}

impl KeystoreConfig {
    fn key_length(&self) -> Result<usize> {
        match self.cipher_key_bits {
            128 | 256 => Ok(self.cipher_key_bits / 8),
            bits => Err(Error::CryptoError(format!(
                "unsupported AES key size: {bits} bits"
            ))),
        }
    }
}

/// Parameters of keystore format version 7
pub const CONFIG: KeystoreConfig = KeystoreConfig {
    kdf_iterations: 210_000,
    cipher_key_bits: 256,
    outer_byte_order: ByteOrder::Little,
};

/// Output buffer that keeps a running CRC32 over everything written
#[derive(Default)]
pub struct ChecksumWriter {
    buf: Vec<u8>,
    hasher: crc32fast::Hasher,
}

impl ChecksumWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            hasher: crc32fast::Hasher::new(),
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    pub fn write_i32(&mut self, v: i32, order: ByteOrder) {
        self.write_bytes(&order.i32_bytes(v));
    }

    pub fn write_u32(&mut self, v: u32, order: ByteOrder) {
        self.write_bytes(&order.u32_bytes(v));
    }

    pub fn write_i64(&mut self, v: i64, order: ByteOrder) {
        self.write_bytes(&order.i64_bytes(v));
    }

    /// CRC32 of all bytes written so far
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Write a Lucene VInt: 7 bits per byte, high bit set when more bytes follow.
pub fn write_vint(w: &mut ChecksumWriter, mut i: u32) {
    while i & !0x7F != 0 {
        w.write_u8(((i & 0x7F) | 0x80) as u8);
        i >>= 7;
    }
    w.write_u8(i as u8);
}

/// Write the Lucene codec header
pub fn write_header(w: &mut ChecksumWriter) -> Result<()> {
    w.write_u32(CODEC_MAGIC, LUCENE_BYTE_ORDER);
    let name_len = u32::try_from(CODEC_NAME.len())
        .map_err(|_| Error::ValidationError("codec name too long".to_string()))?;
    write_vint(w, name_len);
    w.write_bytes(CODEC_NAME.as_bytes());
    w.write_i32(KEYSTORE_VERSION, LUCENE_BYTE_ORDER);
    Ok(())
}

/// Write the Lucene codec footer, closing the checksum
fn write_footer(w: &mut ChecksumWriter) {
    w.write_u32(FOOTER_MAGIC, LUCENE_BYTE_ORDER);
    w.write_i32(FOOTER_ALGORITHM_ID, LUCENE_BYTE_ORDER);
    let crc = w.checksum();
    w.write_i64(i64::from(crc), LUCENE_BYTE_ORDER);
}

fn length_i32(len: usize, what: &str) -> Result<i32> {
    i32::try_from(len).map_err(|_| Error::ValidationError(format!("{what} too large: {len} bytes")))
}

/// Serialize sorted entries into the plaintext payload.
///
/// Layout: entry count, then per entry the name length as an unsigned short,
/// the UTF-8 name, the value length and the value. All big-endian.
pub fn serialize_entries(entries: &[Entry<'_>]) -> Result<Vec<u8>> {
    let capacity = 4 + entries
        .iter()
        .map(|e| 2 + e.name.len() + 4 + e.value.len())
        .sum::<usize>();
    let mut out = Vec::with_capacity(capacity);

    out.extend_from_slice(&INNER_BYTE_ORDER.i32_bytes(length_i32(entries.len(), "entry count")?));
    for entry in entries {
        let name = entry.name.as_bytes();
        if name.len() > MAX_NAME_LENGTH {
            return Err(Error::ValidationError(format!(
                "setting name exceeds {MAX_NAME_LENGTH} bytes: {} bytes",
                name.len()
            )));
        }
        let name_len = name.len() as u16;
        out.extend_from_slice(&match INNER_BYTE_ORDER {
            ByteOrder::Big => name_len.to_be_bytes(),
            ByteOrder::Little => name_len.to_le_bytes(),
        });
        out.extend_from_slice(name);
        out.extend_from_slice(
            &INNER_BYTE_ORDER.i32_bytes(length_i32(entry.value.len(), "setting value")?),
        );
        out.extend_from_slice(entry.value);
    }
    Ok(out)
}

fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::CryptoError(format!("failed to read random bytes: {e}")))?;
    Ok(bytes)
}

pub fn generate_salt() -> Result<[u8; SALT_LENGTH]> {
    random_bytes()
}

pub fn generate_iv() -> Result<[u8; IV_LENGTH]> {
    random_bytes()
}

/// PBKDF2-HMAC-SHA512 with an empty password
pub fn derive_key(salt: &[u8], iterations: u32, key_length: usize) -> Result<Vec<u8>> {
    if iterations == 0 {
        return Err(Error::CryptoError(
            "PBKDF2 iteration count must be positive".to_string(),
        ));
    }
    let mut key = vec![0u8; key_length];
    pbkdf2::pbkdf2_hmac::<Sha512>(b"", salt, iterations, &mut key);
    Ok(key)
}

/// AES-GCM encryption with the salt as additional authenticated data.
///
/// The returned ciphertext has the 128-bit tag appended.
pub fn encrypt(key: &[u8], iv: &[u8], salt: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if iv.len() != IV_LENGTH {
        return Err(Error::CryptoError(format!(
            "IV length {} does not match GCM nonce size {IV_LENGTH}",
            iv.len()
        )));
    }
    let nonce = Nonce::from_slice(iv);
    let payload = Payload {
        msg: plaintext,
        aad: salt,
    };
    let sealed = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|e| Error::CryptoError(format!("failed to create cipher: {e}")))?
            .encrypt(nonce, payload),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::CryptoError(format!("failed to create cipher: {e}")))?
            .encrypt(nonce, payload),
        len => {
            return Err(Error::CryptoError(format!(
                "invalid AES key length: {len} bytes"
            )))
        }
    };
    sealed.map_err(|e| Error::CryptoError(format!("failed to encrypt keystore: {e}")))
}

/// Produce a keystore for the given settings with the version 7 format.
pub fn create(settings: &Settings) -> Result<Vec<u8>> {
    create_with(settings, &CONFIG)
}

/// Produce a keystore with explicit format parameters.
pub fn create_with(settings: &Settings, config: &KeystoreConfig) -> Result<Vec<u8>> {
    let settings = ensure_bootstrap_seed(settings)?;
    let entries = settings_to_entries(&settings);
    let plaintext = serialize_entries(&entries)?;

    let salt = generate_salt()?;
    let iv = generate_iv()?;
    let key = derive_key(&salt, config.kdf_iterations, config.key_length()?)?;
    let ciphertext = encrypt(&key, &iv, &salt, &plaintext)?;

    let data_size = 4 + salt.len() + 4 + iv.len() + 4 + ciphertext.len();
    let order = config.outer_byte_order;

    let header_size = 4 + 1 + CODEC_NAME.len() + 4;
    let mut w = ChecksumWriter::with_capacity(header_size + 1 + 4 + data_size + FOOTER_LENGTH);
    write_header(&mut w)?;
    w.write_u8(PASSWORD_ABSENT);

    w.write_i32(length_i32(data_size, "data block")?, order);
    w.write_i32(length_i32(salt.len(), "salt")?, order);
    w.write_bytes(&salt);
    w.write_i32(length_i32(iv.len(), "IV")?, order);
    w.write_bytes(&iv);
    w.write_i32(length_i32(ciphertext.len(), "ciphertext")?, order);
    w.write_bytes(&ciphertext);

    write_footer(&mut w);
    Ok(w.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::entries::{SEED_CHARS, SEED_LENGTH, SEED_SETTING_KEY};

    const FAST: KeystoreConfig = KeystoreConfig {
        kdf_iterations: 1_000,
        cipher_key_bits: 256,
        outer_byte_order: ByteOrder::Little,
    };

    /// Decoded view of a keystore, used to check what the encoder produced
    struct Decoded {
        version: i32,
        salt: Vec<u8>,
        iv: Vec<u8>,
        entries: Vec<(String, Vec<u8>)>,
    }

    struct Reader<'a> {
        data: &'a [u8],
        pos: usize,
    }

    impl<'a> Reader<'a> {
        fn take(&mut self, n: usize) -> &'a [u8] {
            let out = &self.data[self.pos..self.pos + n];
            self.pos += n;
            out
        }

        fn u8(&mut self) -> u8 {
            self.take(1)[0]
        }

        fn u16_be(&mut self) -> u16 {
            u16::from_be_bytes(self.take(2).try_into().unwrap())
        }

        fn u32_be(&mut self) -> u32 {
            u32::from_be_bytes(self.take(4).try_into().unwrap())
        }

        fn i32_be(&mut self) -> i32 {
            i32::from_be_bytes(self.take(4).try_into().unwrap())
        }

        fn i32_le(&mut self) -> i32 {
            i32::from_le_bytes(self.take(4).try_into().unwrap())
        }

        fn i64_be(&mut self) -> i64 {
            i64::from_be_bytes(self.take(8).try_into().unwrap())
        }

        fn vint(&mut self) -> u32 {
            let mut value = 0u32;
            let mut shift = 0;
            loop {
                let b = self.u8();
                value |= u32::from(b & 0x7F) << shift;
                if b & 0x80 == 0 {
                    return value;
                }
                shift += 7;
            }
        }
    }

    fn decode(data: &[u8], iterations: u32) -> Decoded {
        let mut r = Reader { data, pos: 0 };
        assert_eq!(r.u32_be(), CODEC_MAGIC);
        let name_len = r.vint() as usize;
        assert_eq!(r.take(name_len), CODEC_NAME.as_bytes());
        let version = r.i32_be();
        assert_eq!(r.u8(), 0, "password flag");

        let data_size = r.i32_le() as usize;
        let block_start = r.pos;
        let salt_len = r.i32_le() as usize;
        let salt = r.take(salt_len).to_vec();
        let iv_len = r.i32_le() as usize;
        let iv = r.take(iv_len).to_vec();
        let ct_len = r.i32_le() as usize;
        let ciphertext = r.take(ct_len).to_vec();
        assert_eq!(r.pos - block_start, data_size);

        let crc_end = r.pos + 8;
        assert_eq!(r.u32_be(), FOOTER_MAGIC);
        assert_eq!(r.i32_be(), 0);
        let expected_crc = crc32fast::hash(&data[..crc_end]);
        assert_eq!(r.i64_be(), i64::from(expected_crc));
        assert_eq!(r.pos, data.len());

        let mut key = vec![0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha512>(b"", &salt, iterations, &mut key);
        let plaintext = Aes256Gcm::new_from_slice(&key)
            .unwrap()
            .decrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: &ciphertext,
                    aad: &salt,
                },
            )
            .unwrap();

        let mut p = Reader {
            data: &plaintext,
            pos: 0,
        };
        let count = p.i32_be();
        let mut entries = Vec::new();
        for _ in 0..count {
            let name_len = p.u16_be() as usize;
            let name = String::from_utf8(p.take(name_len).to_vec()).unwrap();
            let value_len = p.i32_be() as usize;
            entries.push((name, p.take(value_len).to_vec()));
        }
        assert_eq!(p.pos, plaintext.len());

        Decoded {
            version,
            salt,
            iv,
            entries,
        }
    }

    fn vint_bytes(i: u32) -> Vec<u8> {
        let mut w = ChecksumWriter::new();
        write_vint(&mut w, i);
        w.into_inner()
    }

    #[test]
    fn test_vint_boundaries() {
        assert_eq!(vint_bytes(0), vec![0x00]);
        assert_eq!(vint_bytes(1), vec![0x01]);
        assert_eq!(vint_bytes(127), vec![0x7F]);
        assert_eq!(vint_bytes(128), vec![0x80, 0x01]);
        assert_eq!(vint_bytes(16383), vec![0xFF, 0x7F]);
        assert_eq!(vint_bytes(16384), vec![0x80, 0x80, 0x01]);
    }

    #[test]
    fn test_header_layout() {
        let mut w = ChecksumWriter::new();
        write_header(&mut w).unwrap();
        let header = w.into_inner();

        assert_eq!(&header[..4], &[0x3F, 0xD7, 0x6C, 0x17]);
        assert_eq!(header[4] as usize, CODEC_NAME.len());
        assert_eq!(&header[5..5 + CODEC_NAME.len()], CODEC_NAME.as_bytes());
        assert_eq!(&header[5 + CODEC_NAME.len()..], &[0, 0, 0, 7]);
    }

    #[test]
    fn test_checksum_writer_tracks_crc() {
        let mut w = ChecksumWriter::new();
        w.write_bytes(b"hello ");
        w.write_i32(1, ByteOrder::Little);
        w.write_i32(1, ByteOrder::Big);
        assert_eq!(w.len(), 14);
        let crc = w.checksum();
        assert_eq!(crc, crc32fast::hash(&w.into_inner()));
    }

    #[test]
    fn test_footer_magic_is_complement_of_header() {
        assert_eq!(FOOTER_MAGIC, 0xC028_93E8);
    }

    #[test]
    fn test_serialize_entries_layout() {
        let entries = [
            Entry {
                name: "a",
                value: b"xy",
            },
            Entry {
                name: "bc",
                value: b"",
            },
        ];
        let out = serialize_entries(&entries).unwrap();
        assert_eq!(
            out,
            vec![
                0, 0, 0, 2, // count
                0, 1, b'a', 0, 0, 0, 2, b'x', b'y', // first entry
                0, 2, b'b', b'c', 0, 0, 0, 0, // second entry
            ]
        );
    }

    #[test]
    fn test_serialize_entries_rejects_long_name() {
        let name = "n".repeat(MAX_NAME_LENGTH + 1);
        let entries = [Entry {
            name: &name,
            value: b"v",
        }];
        let err = serialize_entries(&entries).unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }

    #[test]
    fn test_serialize_entries_accepts_max_name() {
        let name = "n".repeat(MAX_NAME_LENGTH);
        let entries = [Entry {
            name: &name,
            value: b"v",
        }];
        let out = serialize_entries(&entries).unwrap();
        assert_eq!(&out[4..6], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_encrypt_rejects_wrong_iv_length() {
        let err = encrypt(&[0u8; 32], &[0u8; 16], &[0u8; SALT_LENGTH], b"data").unwrap_err();
        assert!(matches!(err, Error::CryptoError(_)));
    }

    #[test]
    fn test_encrypt_appends_tag() {
        let ct = encrypt(&[7u8; 32], &[1u8; IV_LENGTH], &[2u8; SALT_LENGTH], b"payload").unwrap();
        assert_eq!(ct.len(), b"payload".len() + GCM_TAG_LENGTH);
    }

    #[test]
    fn test_derive_key_length_and_determinism() {
        let salt = [3u8; SALT_LENGTH];
        let k1 = derive_key(&salt, 10, 32).unwrap();
        let k2 = derive_key(&salt, 10, 32).unwrap();
        let k3 = derive_key(&[4u8; SALT_LENGTH], 10, 32).unwrap();
        assert_eq!(k1.len(), 32);
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_unsupported_key_size() {
        let config = KeystoreConfig {
            cipher_key_bits: 192,
            ..FAST
        };
        let err = create_with(&Settings::new(), &config).unwrap_err();
        assert!(matches!(err, Error::CryptoError(_)));
    }

    #[test]
    fn test_create_empty_settings() {
        let data = create(&Settings::new()).unwrap();
        assert!(!data.is_empty());

        let decoded = decode(&data, CONFIG.kdf_iterations);
        assert_eq!(decoded.version, KEYSTORE_VERSION);
        assert_eq!(decoded.salt.len(), SALT_LENGTH);
        assert_eq!(decoded.iv.len(), IV_LENGTH);
        assert_eq!(decoded.entries.len(), 1);
        let (name, seed) = &decoded.entries[0];
        assert_eq!(name, SEED_SETTING_KEY);
        assert_eq!(seed.len(), SEED_LENGTH);
        assert!(seed.iter().all(|b| SEED_CHARS.as_bytes().contains(b)));
    }

    #[test]
    fn test_create_single_setting() {
        let name = "xpack.notification.email.account.foo.smtp.secure_password";
        let settings: Settings = [(name.to_string(), b"secret".to_vec())].into();

        let decoded = decode(&create_with(&settings, &FAST).unwrap(), FAST.kdf_iterations);
        let names: Vec<&str> = decoded.entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec![SEED_SETTING_KEY, name]);
        assert_eq!(decoded.entries[1].1, b"secret");
    }

    #[test]
    fn test_create_preserves_existing_seed() {
        let settings: Settings = [
            (SEED_SETTING_KEY.to_string(), b"fixed-seed".to_vec()),
            ("b.setting".to_string(), b"b".to_vec()),
        ]
        .into();

        let decoded = decode(&create_with(&settings, &FAST).unwrap(), FAST.kdf_iterations);
        let seeds: Vec<_> = decoded
            .entries
            .iter()
            .filter(|(n, _)| n == SEED_SETTING_KEY)
            .collect();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].1, b"fixed-seed");
    }

    #[test]
    fn test_create_entries_strictly_sorted() {
        let settings: Settings = [
            "zeta", "alpha", "s3.client.default.secret_key", "Beta", "keystore.seedling", "m",
        ]
        .iter()
        .map(|n| (n.to_string(), n.as_bytes().to_vec()))
        .collect();

        let decoded = decode(&create_with(&settings, &FAST).unwrap(), FAST.kdf_iterations);
        assert_eq!(decoded.entries.len(), settings.len() + 1);
        assert!(decoded.entries.windows(2).all(|w| w[0].0 < w[1].0));
        for (name, value) in &decoded.entries {
            if name != SEED_SETTING_KEY {
                assert_eq!(value, name.as_bytes());
            }
        }
    }

    #[test]
    fn test_create_uses_fresh_salt_and_iv() {
        let settings: Settings = [("a".to_string(), b"1".to_vec())].into();
        let first = decode(&create_with(&settings, &FAST).unwrap(), FAST.kdf_iterations);
        let second = decode(&create_with(&settings, &FAST).unwrap(), FAST.kdf_iterations);
        assert_ne!(first.salt, second.salt);
        assert_ne!(first.iv, second.iv);
    }

    #[test]
    fn test_data_block_is_little_endian() {
        let data = create_with(&Settings::new(), &FAST).unwrap();
        let block = 4 + 1 + CODEC_NAME.len() + 4 + 1;
        let salt_len = &data[block + 4..block + 8];
        assert_eq!(salt_len, &(SALT_LENGTH as i32).to_le_bytes());
    }
}
