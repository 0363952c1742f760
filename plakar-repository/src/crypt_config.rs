//! Authenticated encryption envelope.
//!
//! Cipher is AES-256-GCM. The master key is derived from a passphrase with
//! scrypt and verified through a canary sealed at repository creation.
//! Every stream gets a fresh random subkey sealed under the master key;
//! data follows in 64 KiB chunks, each with its own nonce and tag:
//!
//! ```text
//! [ subkey_nonce(12) | sealed_subkey(32) | subkey_tag(16) ]
//! [ chunk: nonce(12) | ciphertext | tag(16) ] ...
//! ```

use anyhow::{bail, Error};
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};

use plakar_types::config::{EncryptionConfig, KdfParams};
use plakar_types::RepositoryError;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

const SCRYPT_N: u64 = 1 << 15;
const SCRYPT_R: u64 = 8;
const SCRYPT_P: u64 = 1;
const SCRYPT_SALT_SIZE: usize = 16;
// scrypt needs roughly 128 * r * n bytes
const SCRYPT_MAX_MEM: u64 = 1025 * 1024 * 1024;

#[derive(Clone)]
pub struct CryptConfig {
    master_key: [u8; KEY_SIZE],
}

/// Derive a candidate master key from a passphrase and stored parameters.
pub fn derive_key(params: &KdfParams, passphrase: &[u8]) -> Result<[u8; KEY_SIZE], Error> {
    if params.key_len != KEY_SIZE {
        bail!("unsupported key length {}", params.key_len);
    }
    let mut key = [0u8; KEY_SIZE];
    openssl::pkcs5::scrypt(
        passphrase,
        &params.salt,
        params.n,
        params.r,
        params.p,
        SCRYPT_MAX_MEM,
        &mut key,
    )?;
    Ok(key)
}

/// Generate a fresh encryption section for a new repository.
///
/// Returns the section (salt, KDF parameters, canary) and the master key.
pub fn generate_encryption_config(
    passphrase: &[u8],
) -> Result<(EncryptionConfig, [u8; KEY_SIZE]), Error> {
    let mut salt = vec![0u8; SCRYPT_SALT_SIZE];
    openssl::rand::rand_bytes(&mut salt)?;

    let params = KdfParams {
        salt,
        n: SCRYPT_N,
        r: SCRYPT_R,
        p: SCRYPT_P,
        key_len: KEY_SIZE,
    };
    let master_key = derive_key(&params, passphrase)?;

    let crypt = CryptConfig::new(master_key);
    let mut payload = [0u8; 32];
    openssl::rand::rand_bytes(&mut payload)?;
    let canary = crypt.encrypt_stream(&payload)?;

    Ok((
        EncryptionConfig {
            algorithm: "aes-256-gcm".to_string(),
            kdf: "scrypt".to_string(),
            kdf_params: params,
            canary,
        },
        master_key,
    ))
}

impl CryptConfig {
    pub fn new(master_key: [u8; KEY_SIZE]) -> Self {
        Self { master_key }
    }

    pub fn master_key(&self) -> &[u8; KEY_SIZE] {
        &self.master_key
    }

    /// A candidate key is accepted iff the canary decrypts (the AEAD tag
    /// verifies).
    pub fn verify_canary(&self, canary: &[u8]) -> bool {
        match self.decrypt_stream(canary) {
            Ok(payload) => payload.len() == 32,
            Err(_) => false,
        }
    }

    pub fn encrypt_stream(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let cipher = Cipher::aes_256_gcm();

        let mut subkey = [0u8; KEY_SIZE];
        openssl::rand::rand_bytes(&mut subkey)?;
        let mut subkey_nonce = [0u8; NONCE_SIZE];
        openssl::rand::rand_bytes(&mut subkey_nonce)?;

        let mut out =
            Vec::with_capacity(NONCE_SIZE + KEY_SIZE + TAG_SIZE + plaintext.len() + 2 * TAG_SIZE);

        let mut tag = [0u8; TAG_SIZE];
        let sealed = encrypt_aead(
            cipher,
            &self.master_key,
            Some(&subkey_nonce),
            b"",
            &subkey,
            &mut tag,
        )?;
        out.extend_from_slice(&subkey_nonce);
        out.extend_from_slice(&sealed);
        out.extend_from_slice(&tag);

        let mut chunks: Vec<&[u8]> = plaintext.chunks(STREAM_CHUNK_SIZE).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        for chunk in chunks {
            let mut nonce = [0u8; NONCE_SIZE];
            openssl::rand::rand_bytes(&mut nonce)?;
            let mut tag = [0u8; TAG_SIZE];
            let ciphertext = encrypt_aead(cipher, &subkey, Some(&nonce), b"", chunk, &mut tag)?;
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&ciphertext);
            out.extend_from_slice(&tag);
        }
        Ok(out)
    }

    pub fn decrypt_stream(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let cipher = Cipher::aes_256_gcm();
        let header_size = NONCE_SIZE + KEY_SIZE + TAG_SIZE;
        if data.len() < header_size {
            return Err(integrity("encrypted stream too short"));
        }

        let subkey_nonce = &data[..NONCE_SIZE];
        let sealed = &data[NONCE_SIZE..NONCE_SIZE + KEY_SIZE];
        let subkey_tag = &data[NONCE_SIZE + KEY_SIZE..header_size];

        let subkey = decrypt_aead(
            cipher,
            &self.master_key,
            Some(subkey_nonce),
            b"",
            sealed,
            subkey_tag,
        )
        .map_err(|_| integrity("stream subkey does not authenticate"))?;

        let mut out = Vec::with_capacity(data.len() - header_size);
        let mut rest = &data[header_size..];
        while !rest.is_empty() {
            if rest.len() < NONCE_SIZE + TAG_SIZE {
                return Err(integrity("truncated stream chunk"));
            }
            let nonce = &rest[..NONCE_SIZE];
            let body_len = std::cmp::min(rest.len() - NONCE_SIZE, STREAM_CHUNK_SIZE + TAG_SIZE);
            let ciphertext = &rest[NONCE_SIZE..NONCE_SIZE + body_len - TAG_SIZE];
            let tag = &rest[NONCE_SIZE + body_len - TAG_SIZE..NONCE_SIZE + body_len];

            let plain = decrypt_aead(cipher, &subkey, Some(nonce), b"", ciphertext, tag)
                .map_err(|_| integrity("stream chunk does not authenticate"))?;
            out.extend_from_slice(&plain);
            rest = &rest[NONCE_SIZE + body_len..];
        }
        Ok(out)
    }
}

fn integrity(message: &str) -> Error {
    RepositoryError::Integrity(message.to_string()).into()
}
