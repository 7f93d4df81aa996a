//! RSA key material for local actors
//!
//! The instance actor key lives in a PEM file; per-user keys live in the
//! store next to the account.

use std::path::Path;
use std::sync::Arc;

use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use super::urls::LocalUrls;
use crate::data::FederationStore;
use crate::error::AppError;

/// PEM-encoded RSA key pair
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key_pem: String,
    pub public_key_pem: String,
}

impl KeyPair {
    /// Generate a new pair (PKCS#8 private, SPKI public)
    pub fn generate(bits: usize) -> Result<Self, AppError> {
        let mut rng = rand::thread_rng();
        let private_key =
            RsaPrivateKey::new(&mut rng, bits).map_err(|e| AppError::Internal(e.into()))?;
        Self::from_private_key(&private_key)
    }

    /// Parse a private key and derive its public half
    pub fn from_private_key_pem(pem: &str) -> Result<Self, AppError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| AppError::Config(format!("Invalid private key: {}", e)))?;
        Self::from_private_key(&private_key)
    }

    fn from_private_key(private_key: &RsaPrivateKey) -> Result<Self, AppError> {
        let public_key = RsaPublicKey::from(private_key);

        // Encode keys to PEM
        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(e.into()))?
            .to_string();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            private_key_pem,
            public_key_pem,
        })
    }

    /// Load the instance key, generating it when allowed
    ///
    /// # Errors
    /// A missing file without `generate_missing`, or an unparsable file,
    /// is a configuration error.
    pub fn load_or_generate(
        path: &Path,
        generate_missing: bool,
        bits: usize,
    ) -> Result<Self, AppError> {
        if path.exists() {
            let pem = std::fs::read_to_string(path).map_err(|e| {
                AppError::Config(format!("Failed to read key file {}: {}", path.display(), e))
            })?;
            let pair = Self::from_private_key_pem(&pem).map_err(|e| {
                AppError::Config(format!("Corrupt key file {}: {}", path.display(), e))
            })?;
            tracing::info!(path = %path.display(), "Instance key loaded");
            return Ok(pair);
        }

        if !generate_missing {
            return Err(AppError::Config(format!(
                "Instance key file {} is missing and generation is disabled",
                path.display()
            )));
        }

        let pair = Self::generate(bits)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::Config(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        std::fs::write(path, &pair.private_key_pem).map_err(|e| {
            AppError::Config(format!("Failed to write key file {}: {}", path.display(), e))
        })?;
        tracing::info!(path = %path.display(), bits, "Instance key generated");
        Ok(pair)
    }
}

/// Everything needed to sign as one local actor
#[derive(Debug, Clone)]
pub struct LocalSigner {
    pub actor_uri: String,
    pub key_id: String,
    pub private_key_pem: String,
}

/// Maps local actor URIs to their signing keys
pub struct KeyRing {
    store: Arc<dyn FederationStore>,
    urls: LocalUrls,
    instance: LocalSigner,
    instance_public_key_pem: String,
}

impl KeyRing {
    pub fn new(store: Arc<dyn FederationStore>, urls: LocalUrls, instance_keys: KeyPair) -> Self {
        let actor_uri = urls.instance_actor();
        Self {
            store,
            instance: LocalSigner {
                key_id: LocalUrls::key_id(&actor_uri),
                actor_uri,
                private_key_pem: instance_keys.private_key_pem,
            },
            instance_public_key_pem: instance_keys.public_key_pem,
            urls,
        }
    }

    pub fn instance_signer(&self) -> &LocalSigner {
        &self.instance
    }

    pub fn instance_public_key_pem(&self) -> &str {
        &self.instance_public_key_pem
    }

    /// Key for the local actor that authored an outgoing activity
    pub async fn signer_for_actor(&self, actor_uri: &str) -> Result<LocalSigner, AppError> {
        if actor_uri == self.instance.actor_uri {
            return Ok(self.instance.clone());
        }

        let username = self.urls.username_from_actor(actor_uri).ok_or_else(|| {
            AppError::Validation(format!("Not a local actor: {}", actor_uri))
        })?;
        let account = self
            .store
            .get_local_account_by_username(username)
            .await?
            .ok_or(AppError::NotFound)?;

        Ok(LocalSigner {
            actor_uri: actor_uri.to_string(),
            key_id: LocalUrls::key_id(actor_uri),
            private_key_pem: account.private_key_pem,
        })
    }
}
