//! Local account service

use std::sync::Arc;

use chrono::Utc;

use crate::data::{EntityId, FederationStore, LocalAccount};
use crate::error::AppError;
use crate::federation::KeyPair;

const MAX_USERNAME_LEN: usize = 30;

/// Creates and looks up the users hosted here
pub struct AccountService {
    store: Arc<dyn FederationStore>,
    rsa_key_bits: usize,
}

impl AccountService {
    pub fn new(store: Arc<dyn FederationStore>, rsa_key_bits: usize) -> Self {
        Self {
            store,
            rsa_key_bits,
        }
    }

    /// Create a local account with a fresh RSA key pair
    ///
    /// # Arguments
    /// * `username` - `[a-z0-9_]`, at most 30 characters
    /// * `display_name` - Optional display name
    /// * `summary` - Optional bio (plain text, escaped on output)
    ///
    /// # Errors
    /// `Validation` for a malformed or taken username.
    pub async fn create(
        &self,
        username: &str,
        display_name: Option<String>,
        summary: Option<String>,
    ) -> Result<LocalAccount, AppError> {
        let username = username.trim().to_ascii_lowercase();
        validate_username(&username)?;

        if self
            .store
            .get_local_account_by_username(&username)
            .await?
            .is_some()
        {
            return Err(AppError::Validation(format!(
                "username is already taken: {}",
                username
            )));
        }

        let bits = self.rsa_key_bits;
        let keys = tokio::task::spawn_blocking(move || KeyPair::generate(bits))
            .await
            .map_err(|e| AppError::Internal(e.into()))??;

        let account = LocalAccount {
            id: EntityId::new().0,
            username,
            display_name: display_name.filter(|name| !name.trim().is_empty()),
            summary: summary.filter(|summary| !summary.trim().is_empty()),
            private_key_pem: keys.private_key_pem,
            public_key_pem: keys.public_key_pem,
            created_at: Utc::now(),
        };
        self.store.insert_local_account(&account).await?;

        tracing::info!(username = %account.username, "Created local account");
        Ok(account)
    }

    pub async fn get_by_username(&self, username: &str) -> Result<LocalAccount, AppError> {
        self.store
            .get_local_account_by_username(&username.to_ascii_lowercase())
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn get(&self, id: &str) -> Result<LocalAccount, AppError> {
        self.store
            .get_local_account(id)
            .await?
            .ok_or(AppError::NotFound)
    }
}

fn validate_username(username: &str) -> Result<(), AppError> {
    if username.is_empty() || username.len() > MAX_USERNAME_LEN {
        return Err(AppError::Validation(format!(
            "username must be 1 to {} characters",
            MAX_USERNAME_LEN
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(AppError::Validation(
            "username may only contain a-z, 0-9 and _".to_string(),
        ));
    }
    // Reserved for the instance actor
    if username == "actor" {
        return Err(AppError::Validation("username is reserved".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryStore;

    #[tokio::test]
    async fn create_generates_keys_and_rejects_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let service = AccountService::new(store.clone(), 1024);

        let account = service
            .create("Alice", Some("Alice A.".to_string()), None)
            .await
            .unwrap();
        assert_eq!(account.username, "alice");
        assert!(account.public_key_pem.contains("BEGIN PUBLIC KEY"));
        assert!(KeyPair::from_private_key_pem(&account.private_key_pem).is_ok());

        assert!(matches!(
            service.create("alice", None, None).await,
            Err(AppError::Validation(_))
        ));
        assert_eq!(service.get_by_username("ALICE").await.unwrap().id, account.id);
    }

    #[test]
    fn usernames_are_restricted() {
        assert!(validate_username("bob_42").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("bob smith").is_err());
        assert!(validate_username("actor").is_err());
        assert!(validate_username(&"a".repeat(31)).is_err());
    }
}
