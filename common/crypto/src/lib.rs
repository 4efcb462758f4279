use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;

/// Errors produced by the common-crypto helpers.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("ciphertext missing nonce")]
    MissingNonce,
    #[error("encryption failure")]
    EncryptFailure,
    #[error("decryption failure")]
    DecryptFailure,
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
    #[error("invalid HMAC key length")]
    InvalidMacKey,
}

/// Wrapper around the tenant master key used to encrypt data encryption keys (DEKs).
#[derive(Clone)]
pub struct MasterKey(Zeroizing<[u8; KEY_LENGTH]>);

impl MasterKey {
    /// Construct a master key from a base64-encoded string.
    pub fn from_base64(value: &str) -> Result<Self, CryptoError> {
        let decoded = BASE64_STANDARD.decode(value.trim())?;
        Self::from_bytes(decoded)
    }

    /// Construct a master key from raw bytes.
    pub fn from_bytes<B>(bytes: B) -> Result<Self, CryptoError>
    where
        B: AsRef<[u8]>,
    {
        let slice = bytes.as_ref();
        if slice.len() != KEY_LENGTH {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_LENGTH,
                actual: slice.len(),
            });
        }
        let mut array = [0u8; KEY_LENGTH];
        array.copy_from_slice(slice);
        Ok(Self(Zeroizing::new(array)))
    }

    /// Encrypt a tenant DEK for storage using AES-256-GCM.
    pub fn encrypt_tenant_dek(&self, dek: &[u8; KEY_LENGTH]) -> Result<Vec<u8>, CryptoError> {
        encrypt_with_key(&self.0, dek)
    }

    /// Decrypt the tenant DEK that was previously encrypted with this master key.
    pub fn decrypt_tenant_dek(&self, blob: &[u8]) -> Result<[u8; KEY_LENGTH], CryptoError> {
        let plaintext = decrypt_with_key(&self.0, blob)?;
        if plaintext.len() != KEY_LENGTH {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_LENGTH,
                actual: plaintext.len(),
            });
        }
        let mut array = [0u8; KEY_LENGTH];
        array.copy_from_slice(&plaintext);
        Ok(array)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"***redacted***")
            .finish()
    }
}

/// Generate a new random tenant DEK (32 bytes).
pub fn generate_dek() -> [u8; KEY_LENGTH] {
    let mut bytes = [0u8; KEY_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Encrypt arbitrary plaintext with the supplied tenant DEK using AES-256-GCM.
pub fn encrypt_field(
    tenant_key: &[u8; KEY_LENGTH],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    encrypt_with_key(tenant_key, plaintext)
}

/// Decrypt previously encrypted ciphertext with the supplied tenant DEK.
pub fn decrypt_field(
    tenant_key: &[u8; KEY_LENGTH],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    decrypt_with_key(tenant_key, ciphertext)
}

/// Produce a deterministic HMAC-SHA256 hash for equality queries.
pub fn deterministic_hash(
    tenant_key: &[u8; KEY_LENGTH],
    value: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mac_key = derive_hash_key(tenant_key);
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(&mac_key).map_err(|_| CryptoError::InvalidMacKey)?;
    mac.update(value);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn derive_hash_key(tenant_key: &[u8; KEY_LENGTH]) -> [u8; KEY_LENGTH] {
    let mut hasher = Sha256::new();
    hasher.update(tenant_key);
    hasher.update(b"novapos-hash-key");
    let digest = hasher.finalize();
    let mut out = [0u8; KEY_LENGTH];
    out.copy_from_slice(&digest);
    out
}

fn encrypt_with_key(key: &[u8; KEY_LENGTH], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_LENGTH,
        actual: key.len(),
    })?;
    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptFailure)?;
    let mut output = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.append(&mut ciphertext);
    Ok(output)
}

fn decrypt_with_key(key: &[u8; KEY_LENGTH], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() <= NONCE_LENGTH {
        return Err(CryptoError::MissingNonce);
    }
    let (nonce_bytes, encrypted) = ciphertext.split_at(NONCE_LENGTH);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_LENGTH,
        actual: key.len(),
    })?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), encrypted)
        .map_err(|_| CryptoError::DecryptFailure)
}

/// Read-only support for the AES-CBC + HMAC-SHA256 ("Fernet-style") ciphertext format
/// used before the vault switched to AES-256-GCM. New writes always use the current
/// [`encrypt_field`]/[`decrypt_field`] format; this module exists only so tokens
/// encrypted under the old scheme keep decrypting after the cutover.
pub mod legacy {
    use super::{CryptoError, KEY_LENGTH};
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine as _;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    /// Ciphertexts in the legacy format are prefixed with this marker before the
    /// base64 payload, e.g. `F1:<base64(salt||iv||tag||ciphertext)>`.
    pub const MAGIC_PREFIX: &str = "F1:";

    const SALT_LEN: usize = 16;
    const IV_LEN: usize = 16;
    const TAG_LEN: usize = 32;

    type HmacSha256 = Hmac<Sha256>;

    /// Returns true if `ciphertext` looks like it was produced by the legacy scheme.
    pub fn is_legacy_ciphertext(ciphertext: &str) -> bool {
        ciphertext.starts_with(MAGIC_PREFIX)
    }

    /// Decrypt a legacy-format ciphertext given the same 32-byte master key used for
    /// the current AEAD scheme. Two independent sub-keys (one for CBC decryption, one
    /// for HMAC verification) are derived from it via SHA-256, so a single key
    /// provisioned for the vault covers both formats.
    pub fn decrypt(key: &[u8; KEY_LENGTH], ciphertext: &str) -> Result<Vec<u8>, CryptoError> {
        let encoded = ciphertext
            .strip_prefix(MAGIC_PREFIX)
            .ok_or(CryptoError::DecryptFailure)?;
        let blob = BASE64_STANDARD.decode(encoded)?;
        if blob.len() < SALT_LEN + IV_LEN + TAG_LEN {
            return Err(CryptoError::DecryptFailure);
        }
        let (salt, rest) = blob.split_at(SALT_LEN);
        let (iv, rest) = rest.split_at(IV_LEN);
        let (tag, body) = rest.split_at(TAG_LEN);

        let (cbc_key, mac_key) = derive_legacy_subkeys(key, salt);

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&mac_key)
            .map_err(|_| CryptoError::InvalidMacKey)?;
        mac.update(iv);
        mac.update(body);
        mac.verify_slice(tag).map_err(|_| CryptoError::DecryptFailure)?;

        cbc_decrypt(&cbc_key, iv, body).ok_or(CryptoError::DecryptFailure)
    }

    fn derive_legacy_subkeys(key: &[u8; KEY_LENGTH], salt: &[u8]) -> ([u8; KEY_LENGTH], [u8; KEY_LENGTH]) {
        use sha2::{Digest, Sha256 as Sha256Digest};
        let mut cbc_hasher = Sha256Digest::new();
        cbc_hasher.update(key);
        cbc_hasher.update(salt);
        cbc_hasher.update(b"legacy-cbc-key");
        let cbc_digest = cbc_hasher.finalize();
        let mut cbc_key = [0u8; KEY_LENGTH];
        cbc_key.copy_from_slice(&cbc_digest);

        let mut mac_hasher = Sha256Digest::new();
        mac_hasher.update(key);
        mac_hasher.update(salt);
        mac_hasher.update(b"legacy-mac-key");
        let mac_digest = mac_hasher.finalize();
        let mut mac_key = [0u8; KEY_LENGTH];
        mac_key.copy_from_slice(&mac_digest);

        (cbc_key, mac_key)
    }

    fn cbc_decrypt(key: &[u8; KEY_LENGTH], iv: &[u8], body: &[u8]) -> Option<Vec<u8>> {
        use aes::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
        type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
        let decryptor = Aes256CbcDec::new(key.into(), iv.into());
        decryptor.decrypt_padded_vec_mut::<Pkcs7>(body).ok()
    }

    #[cfg(test)]
    pub(super) fn encrypt_for_test(key: &[u8; KEY_LENGTH], plaintext: &[u8]) -> String {
        use aes::cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
        use rand::rngs::OsRng;
        use rand::RngCore;
        type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let (cbc_key, mac_key) = derive_legacy_subkeys(key, &salt);
        let encryptor = Aes256CbcEnc::new(cbc_key.as_slice().into(), iv.as_slice().into());
        let body = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&mac_key).expect("mac key");
        mac.update(&iv);
        mac.update(&body);
        let tag = mac.finalize().into_bytes();

        let mut blob = Vec::with_capacity(SALT_LEN + IV_LEN + TAG_LEN + body.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&tag);
        blob.extend_from_slice(&body);
        format!("{MAGIC_PREFIX}{}", BASE64_STANDARD.encode(blob))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_field_encryption() {
        let dek = generate_dek();
        let plaintext = b"sensitive-data";
        let ciphertext = encrypt_field(&dek, plaintext).expect("encrypt");
        assert_ne!(ciphertext, plaintext);
        let decrypted = decrypt_field(&dek, &ciphertext).expect("decrypt");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn envelope_encrypt_decrypt_dek() {
        let master = MasterKey::from_bytes([1u8; KEY_LENGTH]).expect("master");
        let dek = generate_dek();
        let blob = master.encrypt_tenant_dek(&dek).expect("encrypt dek");
        let recovered = master.decrypt_tenant_dek(&blob).expect("decrypt dek");
        assert_eq!(recovered, dek);
    }

    #[test]
    fn deterministic_hash_is_stable() {
        let dek = [7u8; KEY_LENGTH];
        let a = deterministic_hash(&dek, b"alice@example.com").expect("hash");
        let b = deterministic_hash(&dek, b"alice@example.com").expect("hash");
        let c = deterministic_hash(&dek, b"bob@example.com").expect("hash");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn base64_master_key_parsing() {
        let key = [9u8; KEY_LENGTH];
        let encoded = BASE64_STANDARD.encode(key);
        let parsed = MasterKey::from_base64(&encoded).expect("parse");
        let blob = parsed.encrypt_tenant_dek(&key).expect("encrypt");
        let recovered = parsed.decrypt_tenant_dek(&blob).expect("decrypt");
        assert_eq!(recovered, key);
    }

    #[test]
    fn legacy_ciphertext_round_trips_and_is_detected() {
        let key = [3u8; KEY_LENGTH];
        let plaintext = b"refresh-token-abc123";
        let ciphertext = legacy::encrypt_for_test(&key, plaintext);
        assert!(legacy::is_legacy_ciphertext(&ciphertext));
        let recovered = legacy::decrypt(&key, &ciphertext).expect("legacy decrypt");
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn legacy_decrypt_rejects_tampered_ciphertext() {
        let key = [4u8; KEY_LENGTH];
        let ciphertext = legacy::encrypt_for_test(&key, b"secret");
        let mut tampered = ciphertext.clone();
        tampered.push('x');
        assert!(legacy::decrypt(&key, &tampered).is_err());
    }
}
