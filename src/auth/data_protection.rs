//! Data protection for state round-tripped through the browser.
//!
//! A [`DataProtectionProvider`] hands out protectors scoped by a list of
//! purpose strings; payloads protected under one purpose chain cannot be
//! unprotected under another. [`PropertiesDataFormat`] layers JSON
//! serialization of [`AuthenticationProperties`] on top.

use std::{collections::BTreeMap, fmt, sync::Arc};

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_DERIVATION_LABEL: &[u8] = b"wsfed.data-protection.v1";

#[derive(Debug, thiserror::Error)]
pub enum DataProtectionError {
    #[error("Protected payload is not valid base64")]
    Encoding,

    #[error("Protected payload is truncated")]
    Truncated,

    #[error("Protected payload failed authentication")]
    Authentication,

    #[error("Failed to encrypt payload")]
    Encryption,

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Payload serialization error: {0}")]
    Serialization(String),
}

/// Encrypts and authenticates opaque payloads.
pub trait DataProtector: Send + Sync {
    fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>, DataProtectionError>;
    fn unprotect(&self, protected: &[u8]) -> Result<Vec<u8>, DataProtectionError>;
}

/// Host capability that creates purpose-scoped protectors.
pub trait DataProtectionProvider: Send + Sync {
    fn create_protector(
        &self,
        purposes: &[&str],
    ) -> Result<Arc<dyn DataProtector>, DataProtectionError>;
}

/// Derives one AES-256-GCM key per purpose chain from a master secret
/// using HKDF-SHA256.
pub struct KeyedDataProtectionProvider {
    master_key: Vec<u8>,
}

impl KeyedDataProtectionProvider {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            master_key: secret.as_ref().to_vec(),
        }
    }
}

impl fmt::Debug for KeyedDataProtectionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedDataProtectionProvider")
            .field("master_key", &"[REDACTED]")
            .finish()
    }
}

impl DataProtectionProvider for KeyedDataProtectionProvider {
    fn create_protector(
        &self,
        purposes: &[&str],
    ) -> Result<Arc<dyn DataProtector>, DataProtectionError> {
        // Length-prefix each purpose so ["ab", "c"] and ["a", "bc"] differ.
        let mut info = KEY_DERIVATION_LABEL.to_vec();
        for purpose in purposes {
            info.extend_from_slice(&(purpose.len() as u32).to_be_bytes());
            info.extend_from_slice(purpose.as_bytes());
        }

        let mut key = [0u8; 32];
        Hkdf::<Sha256>::new(None, &self.master_key)
            .expand(&info, &mut key)
            .map_err(|_| DataProtectionError::KeyDerivation)?;

        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|_| DataProtectionError::KeyDerivation)?;

        Ok(Arc::new(AesGcmProtector { cipher }))
    }
}

/// Output layout: `nonce (12) || ciphertext || tag (16)`.
struct AesGcmProtector {
    cipher: Aes256Gcm,
}

impl DataProtector for AesGcmProtector {
    fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>, DataProtectionError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| DataProtectionError::Encryption)?;

        let mut output = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        output.extend_from_slice(&nonce);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    fn unprotect(&self, protected: &[u8]) -> Result<Vec<u8>, DataProtectionError> {
        if protected.len() < NONCE_LEN + TAG_LEN {
            return Err(DataProtectionError::Truncated);
        }
        let (nonce, ciphertext) = protected.split_at(NONCE_LEN);

        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| DataProtectionError::Authentication)
    }
}

/// State carried across the sign-in redirect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationProperties {
    /// Where to send the browser once sign-in completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub is_persistent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub items: BTreeMap<String, String>,
}

impl AuthenticationProperties {
    pub fn with_redirect_uri(redirect_uri: impl Into<String>) -> Self {
        Self {
            redirect_uri: Some(redirect_uri.into()),
            ..Self::default()
        }
    }
}

/// Serializes and protects values into URL-safe strings.
pub trait SecureDataFormat<T>: Send + Sync {
    fn protect(&self, data: &T) -> Result<String, DataProtectionError>;
    fn unprotect(&self, protected: &str) -> Result<T, DataProtectionError>;
}

/// [`SecureDataFormat`] for [`AuthenticationProperties`].
pub struct PropertiesDataFormat {
    protector: Arc<dyn DataProtector>,
}

impl PropertiesDataFormat {
    pub fn new(protector: Arc<dyn DataProtector>) -> Self {
        Self { protector }
    }
}

impl SecureDataFormat<AuthenticationProperties> for PropertiesDataFormat {
    fn protect(&self, data: &AuthenticationProperties) -> Result<String, DataProtectionError> {
        let json = serde_json::to_vec(data)
            .map_err(|e| DataProtectionError::Serialization(e.to_string()))?;
        let protected = self.protector.protect(&json)?;
        Ok(URL_SAFE_NO_PAD.encode(protected))
    }

    fn unprotect(&self, protected: &str) -> Result<AuthenticationProperties, DataProtectionError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(protected)
            .map_err(|_| DataProtectionError::Encoding)?;
        let json = self.protector.unprotect(&bytes)?;
        serde_json::from_slice(&json).map_err(|e| DataProtectionError::Serialization(e.to_string()))
    }
}
