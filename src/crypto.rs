//! Origin envelope format
//!
//! `base64(JSON {"nonce", "tag", "ciphertext"})`, each field itself base64,
//! sealed with AES-256-GCM. Plaintext is JSON right-padded with a filler
//! character to a fixed block size before sealing.

use aes_gcm::{
    aead::{consts::U15, Aead, KeyInit},
    aes::Aes256,
    Aes256Gcm, AesGcm, Nonce,
};
use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::remote::Decryptor;

/// Plaintext block size used by the vitals generator.
pub const PLAINTEXT_BLOCK: usize = 5120;

/// Standard 96-bit GCM nonce
pub const NONCE_LEN: usize = 12;
/// Length of the origin's default nonce (`thisisgcmnonce!`)
pub const ORIGIN_NONCE_LEN: usize = 15;
const TAG_LEN: usize = 16;

type Aes256Gcm15 = AesGcm<Aes256, U15>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    InvalidKey,
    Encoding(String),
    /// Nonce is neither 12 nor 15 bytes
    NonceLength(usize),
    TagLength(usize),
    /// Authentication failed (wrong key or tampered data)
    Authentication,
    NotUtf8,
    TooLarge { len: usize, block: usize },
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "AES-256 key must be 32 bytes"),
            Self::Encoding(e) => write!(f, "bad envelope encoding: {}", e),
            Self::NonceLength(n) => write!(f, "unsupported nonce length {}", n),
            Self::TagLength(n) => write!(f, "unexpected tag length {}", n),
            Self::Authentication => write!(f, "envelope authentication failed"),
            Self::NotUtf8 => write!(f, "plaintext is not UTF-8"),
            Self::TooLarge { len, block } => {
                write!(f, "payload of {} bytes exceeds {} byte block", len, block)
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    nonce: String,
    tag: String,
    ciphertext: String,
}

/// Right-pad `json` with `filler` up to `block` bytes.
pub fn pad_plaintext(json: &str, block: usize, filler: char) -> Result<String, EnvelopeError> {
    let len = json.len();
    if len > block {
        return Err(EnvelopeError::TooLarge { len, block });
    }
    let mut padded = String::with_capacity(block);
    padded.push_str(json);
    padded.extend(std::iter::repeat(filler).take((block - len) / filler.len_utf8()));
    Ok(padded)
}

fn b64(field: &str, value: &str) -> Result<Vec<u8>, EnvelopeError> {
    STANDARD
        .decode(value)
        .map_err(|e| EnvelopeError::Encoding(format!("{field}: {e}")))
}

/// Local AES-256-GCM opener for origin envelopes.
#[derive(Clone)]
pub struct AesGcmDecryptor {
    cipher: Aes256Gcm,
    cipher_n15: Aes256Gcm15,
}

impl AesGcmDecryptor {
    pub fn new(key: &[u8]) -> Result<Self, EnvelopeError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EnvelopeError::InvalidKey)?;
        let cipher_n15 = Aes256Gcm15::new_from_slice(key).map_err(|_| EnvelopeError::InvalidKey)?;
        Ok(Self { cipher, cipher_n15 })
    }

    /// Key taken as the raw UTF-8 bytes of an environment variable.
    pub fn from_env(var: &str) -> anyhow::Result<Self> {
        let key = std::env::var(var).with_context(|| format!("{var} is not set"))?;
        Self::new(key.as_bytes()).with_context(|| format!("{var} is not a usable AES-256 key"))
    }

    /// Seal under a caller-chosen nonce of `NONCE_LEN` or `ORIGIN_NONCE_LEN` bytes.
    pub fn seal_envelope(&self, nonce: &[u8], plaintext: &[u8]) -> Result<String, EnvelopeError> {
        let mut sealed = match nonce.len() {
            NONCE_LEN => self.cipher.encrypt(Nonce::from_slice(nonce), plaintext),
            ORIGIN_NONCE_LEN => self.cipher_n15.encrypt(Nonce::from_slice(nonce), plaintext),
            n => return Err(EnvelopeError::NonceLength(n)),
        }
        .map_err(|_| EnvelopeError::Authentication)?;
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        let envelope = Envelope {
            nonce: STANDARD.encode(nonce),
            tag: STANDARD.encode(tag),
            ciphertext: STANDARD.encode(&sealed),
        };
        let json = serde_json::to_vec(&envelope).map_err(|e| EnvelopeError::Encoding(e.to_string()))?;
        Ok(STANDARD.encode(json))
    }

    /// Seal with a fresh random nonce.
    pub fn seal_random<R: RngCore>(&self, rng: &mut R, plaintext: &[u8]) -> Result<String, EnvelopeError> {
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        self.seal_envelope(&nonce, plaintext)
    }

    pub fn open_envelope(&self, blob: &str) -> Result<String, EnvelopeError> {
        let json = b64("envelope", blob.trim())?;
        let envelope: Envelope =
            serde_json::from_slice(&json).map_err(|e| EnvelopeError::Encoding(e.to_string()))?;

        let nonce = b64("nonce", &envelope.nonce)?;
        if nonce.len() != NONCE_LEN && nonce.len() != ORIGIN_NONCE_LEN {
            return Err(EnvelopeError::NonceLength(nonce.len()));
        }
        let tag = b64("tag", &envelope.tag)?;
        if tag.len() != TAG_LEN {
            return Err(EnvelopeError::TagLength(tag.len()));
        }
        let mut sealed = b64("ciphertext", &envelope.ciphertext)?;
        sealed.extend_from_slice(&tag);

        let plaintext = if nonce.len() == NONCE_LEN {
            self.cipher.decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
        } else {
            self.cipher_n15.decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
        }
        .map_err(|_| EnvelopeError::Authentication)?;
        String::from_utf8(plaintext).map_err(|_| EnvelopeError::NotUtf8)
    }
}

#[async_trait::async_trait]
impl Decryptor for AesGcmDecryptor {
    async fn decrypt(&self, blob: &str) -> anyhow::Result<String> {
        Ok(self.open_envelope(blob)?)
    }
}
