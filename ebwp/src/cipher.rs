//! Per-chunk encryption
//!
//! Every chunk read from a source file is sealed on its own:
//!
//! ```text
//! IV                              xx xx xx xx xx xx xx xx
//!                                 xx xx xx xx xx xx xx xx (16 bytes, random)
//! ciphertext                      AES-256-CBC, PKCS#7 padded
//!                                 ... (plain length rounded up to the next block)
//! ```
//!
//! There is no state carried between chunks, so a reader needs to know where a
//! chunk ends independently of the ciphertext. There is also no authentication
//! tag: decrypting with the wrong key produces wrong bytes, not an error.

use crate::config::FileInfo;
use crate::error::{Error, Result};
use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use ring::rand::{SecureRandom, SystemRandom};
use std::num::NonZeroU32;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const KEY_LEN: usize = 32;
pub const AES_BLOCK_LEN: usize = 16;
pub const SALT_LEN: usize = 16;
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Cipher recorded in the archive metadata. The framing does not change with
/// the cipher, so new modes are new variants here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CipherKind {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "aes-256-cbc")]
    Aes256Cbc,
}

/// Seals and opens single chunks.
pub trait ChunkCipher {
    fn kind(&self) -> CipherKind;

    fn iv_len(&self) -> usize;

    /// Length of `encrypt` output for a chunk of `plain_len` bytes.
    fn sealed_len(&self, plain_len: usize) -> usize;

    /// Returns `IV || ciphertext`.
    fn encrypt(&self, chunk: &[u8]) -> Result<Vec<u8>>;

    /// Splits off the IV and decrypts the remainder.
    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>>;
}

/// 256-bit symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        EncryptionKey(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| Error::InvalidKey)?;
        Ok(EncryptionKey(key))
    }

    /// PBKDF2-HMAC-SHA256 over the passphrase.
    pub fn derive(passphrase: &str, salt: &[u8]) -> Self {
        let mut key = [0u8; KEY_LEN];
        // PBKDF2_ITERATIONS is a non-zero constant.
        let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN);
        ring::pbkdf2::derive(
            ring::pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt,
            passphrase.as_bytes(),
            &mut key,
        );
        EncryptionKey(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "EncryptionKey(..)")
    }
}

/// Random salt for [`EncryptionKey::derive`].
pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new().fill(&mut salt)?;
    Ok(salt)
}

/// Build the cipher an archive was written with. Unencrypted archives need
/// none; encrypted ones need the password the key was derived from.
pub fn cipher_for(file_info: &FileInfo, password: Option<&str>) -> Result<Option<Box<dyn ChunkCipher>>> {
    if !file_info.encrypt {
        return Ok(None);
    }
    let password = password.ok_or(Error::PasswordRequired)?;
    let salt = match file_info.key_salt.as_deref() {
        Some(salt) => hex::decode(salt)?,
        None => Vec::new(),
    };
    let key = EncryptionKey::derive(password, &salt);
    match file_info.cipher {
        // Configs written before the cipher field existed leave it unset on
        // encrypted archives. AES-256-CBC was the only cipher then.
        CipherKind::Aes256Cbc | CipherKind::None => Ok(Some(Box::new(Aes256CbcCipher::new(key)))),
    }
}

pub struct Aes256CbcCipher {
    key: EncryptionKey,
    rng: SystemRandom,
}

impl Aes256CbcCipher {
    pub fn new(key: EncryptionKey) -> Self {
        Aes256CbcCipher {
            key,
            rng: SystemRandom::new(),
        }
    }
}

impl ChunkCipher for Aes256CbcCipher {
    fn kind(&self) -> CipherKind {
        CipherKind::Aes256Cbc
    }

    fn iv_len(&self) -> usize {
        AES_BLOCK_LEN
    }

    fn sealed_len(&self, plain_len: usize) -> usize {
        AES_BLOCK_LEN + (plain_len / AES_BLOCK_LEN + 1) * AES_BLOCK_LEN
    }

    fn encrypt(&self, chunk: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; AES_BLOCK_LEN];
        self.rng.fill(&mut iv)?;

        let ciphertext = Aes256CbcEnc::new(self.key.as_bytes().into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(chunk);

        let mut sealed = Vec::with_capacity(iv.len() + ciphertext.len());
        sealed.extend_from_slice(&iv);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < AES_BLOCK_LEN {
            return Err(Error::InvalidFormat(format!(
                "Encrypted chunk shorter than its IV: {} bytes",
                sealed.len()
            )));
        }
        let (iv, ciphertext) = sealed.split_at(AES_BLOCK_LEN);

        // Only whole blocks can be decrypted; a ragged tail means the chunk
        // was cut short and is dropped.
        let whole = ciphertext.len() - ciphertext.len() % AES_BLOCK_LEN;
        if whole != ciphertext.len() {
            tracing::warn!(
                "Encrypted chunk has {} trailing bytes outside a cipher block",
                ciphertext.len() - whole
            );
        }

        let mut buffer = ciphertext[..whole].to_vec();
        let iv: [u8; AES_BLOCK_LEN] = iv.try_into().map_err(|_| Error::InvalidKey)?;
        let plain_len = Aes256CbcDec::new(self.key.as_bytes().into(), &iv.into())
            .decrypt_padded_mut::<NoPadding>(&mut buffer)
            .map_err(|_| Error::InvalidFormat("Cipher block misalignment".to_string()))?
            .len();
        buffer.truncate(plain_len);

        let unpadded = lenient_unpad(&buffer);
        buffer.truncate(unpadded);
        Ok(buffer)
    }
}

/// PKCS#7 unpadding that never fails: a padding byte outside 1..=16 (which is
/// what a wrong key usually produces) leaves the block untouched.
fn lenient_unpad(data: &[u8]) -> usize {
    match data.last() {
        Some(&pad) if (1..=AES_BLOCK_LEN as u8).contains(&pad) && pad as usize <= data.len() => {
            data.len() - pad as usize
        }
        _ => data.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(byte: u8) -> EncryptionKey {
        EncryptionKey::from_bytes([byte; KEY_LEN])
    }

    #[test]
    fn test_encrypt_decrypt_chunk() {
        let cipher = Aes256CbcCipher::new(test_key(7));
        let chunk = b"first test file";
        let sealed = cipher.encrypt(chunk).unwrap();

        assert_eq!(sealed.len(), cipher.sealed_len(chunk.len()));
        assert_eq!(cipher.decrypt(&sealed).unwrap(), chunk);
    }

    #[test]
    fn test_fresh_iv_per_chunk() {
        let cipher = Aes256CbcCipher::new(test_key(7));
        let a = cipher.encrypt(b"same bytes").unwrap();
        let b = cipher.encrypt(b"same bytes").unwrap();
        assert_ne!(a[..AES_BLOCK_LEN], b[..AES_BLOCK_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_sealed_len_grows_by_at_least_iv() {
        let cipher = Aes256CbcCipher::new(test_key(1));
        assert_eq!(cipher.sealed_len(0), 32);
        assert_eq!(cipher.sealed_len(15), 32);
        assert_eq!(cipher.sealed_len(16), 48);
        assert_eq!(cipher.sealed_len(512 * 1024), 512 * 1024 + 32);
        for len in [0usize, 1, 16, 1000] {
            assert!(cipher.sealed_len(len) > len + cipher.iv_len() - 1);
        }
    }

    #[test]
    fn test_empty_chunk() {
        let cipher = Aes256CbcCipher::new(test_key(3));
        let sealed = cipher.encrypt(b"").unwrap();
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"");
    }

    #[test]
    fn test_wrong_key_is_not_an_error() {
        let plain = vec![0x42u8; 4096];
        let sealed = Aes256CbcCipher::new(test_key(1)).encrypt(&plain).unwrap();
        let opened = Aes256CbcCipher::new(test_key(2)).decrypt(&sealed).unwrap();
        assert_ne!(opened, plain);
    }

    #[test]
    fn test_derive_is_deterministic() {
        let salt = [9u8; SALT_LEN];
        assert_eq!(
            EncryptionKey::derive("asdfasdf1234", &salt),
            EncryptionKey::derive("asdfasdf1234", &salt)
        );
        assert_ne!(
            EncryptionKey::derive("asdfasdf1234", &salt),
            EncryptionKey::derive("other", &salt)
        );
    }

    #[test]
    fn test_cipher_for_file_info() {
        let mut info = FileInfo::default();
        assert!(cipher_for(&info, None).unwrap().is_none());

        info.encrypt = true;
        info.cipher = CipherKind::Aes256Cbc;
        info.key_salt = Some(hex::encode([1u8; SALT_LEN]));
        assert!(matches!(cipher_for(&info, None), Err(Error::PasswordRequired)));

        let cipher = cipher_for(&info, Some("secret")).unwrap().unwrap();
        let again = cipher_for(&info, Some("secret")).unwrap().unwrap();
        let sealed = cipher.encrypt(b"payload").unwrap();
        assert_eq!(again.decrypt(&sealed).unwrap(), b"payload");

        info.cipher = CipherKind::None;
        let legacy = cipher_for(&info, Some("secret")).unwrap().unwrap();
        assert_eq!(legacy.kind(), CipherKind::Aes256Cbc);
        assert_eq!(legacy.decrypt(&sealed).unwrap(), b"payload");

        info.key_salt = Some("not hex".to_string());
        assert!(matches!(cipher_for(&info, Some("secret")), Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn test_key_from_slice() {
        assert!(EncryptionKey::from_slice(&[0u8; 31]).is_err());
        assert!(EncryptionKey::from_slice(&[0u8; 32]).is_ok());
    }
}
