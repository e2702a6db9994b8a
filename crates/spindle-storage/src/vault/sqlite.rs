// Embedded vault backend over the secrets table

use async_trait::async_trait;

use spindle_core::secret::{is_valid_key_ident, DidSlashRepo, LockedSecret, Secret};
use spindle_core::traits::Vault;
use spindle_core::VaultError;

use crate::encryption::EncryptionService;
use crate::models::SecretRow;
use crate::repositories::Database;

pub struct SqliteVault {
    db: Database,
    /// When configured, values are encrypted at rest
    encryption: Option<EncryptionService>,
}

impl SqliteVault {
    pub fn new(db: Database, encryption: Option<EncryptionService>) -> Self {
        Self { db, encryption }
    }

    fn store_value(&self, value: &str) -> Result<String, VaultError> {
        match &self.encryption {
            Some(service) => service.encrypt(value).map_err(VaultError::Backend),
            None => Ok(value.to_string()),
        }
    }

    fn load_value(&self, stored: &str) -> Result<String, VaultError> {
        if !EncryptionService::is_encrypted(stored) {
            return Ok(stored.to_string());
        }
        match &self.encryption {
            Some(service) => service.decrypt(stored).map_err(VaultError::Backend),
            None => Err(VaultError::backend(
                "secret is encrypted but no encryption key is configured",
            )),
        }
    }

    fn row_to_secret(&self, row: SecretRow) -> Result<Secret, VaultError> {
        let repo = DidSlashRepo::try_from(row.repo).map_err(VaultError::backend)?;
        Ok(Secret {
            repo,
            key: row.key,
            value: self.load_value(&row.value)?,
            created_at: row.created_at,
            created_by: row.created_by,
        })
    }
}

#[async_trait]
impl Vault for SqliteVault {
    async fn add_secret(&self, secret: Secret) -> Result<(), VaultError> {
        if !is_valid_key_ident(&secret.key) {
            return Err(VaultError::InvalidKeyIdent(secret.key));
        }
        let stored = self.store_value(&secret.value)?;

        let result = sqlx::query(
            r#"
            INSERT INTO secrets (repo, key, value, created_at, created_by)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(secret.repo.as_str())
        .bind(&secret.key)
        .bind(&stored)
        .bind(secret.created_at)
        .bind(&secret.created_by)
        .execute(self.db.pool())
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(VaultError::KeyAlreadyPresent)
            }
            Err(err) => Err(VaultError::Backend(err.into())),
        }
    }

    async fn remove_secret(&self, repo: &DidSlashRepo, key: &str) -> Result<(), VaultError> {
        let result = sqlx::query("DELETE FROM secrets WHERE repo = $1 AND key = $2")
            .bind(repo.as_str())
            .bind(key)
            .execute(self.db.pool())
            .await
            .map_err(|e| VaultError::Backend(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(VaultError::KeyNotFound);
        }
        Ok(())
    }

    async fn secrets_locked(&self, repo: &DidSlashRepo) -> Result<Vec<LockedSecret>, VaultError> {
        Ok(self
            .secrets_unlocked(repo)
            .await?
            .iter()
            .map(LockedSecret::from)
            .collect())
    }

    async fn secrets_unlocked(&self, repo: &DidSlashRepo) -> Result<Vec<Secret>, VaultError> {
        let rows = sqlx::query_as::<_, SecretRow>(
            r#"
            SELECT repo, key, value, created_at, created_by
            FROM secrets
            WHERE repo = $1
            ORDER BY key ASC
            "#,
        )
        .bind(repo.as_str())
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| VaultError::Backend(e.into()))?;

        rows.into_iter().map(|row| self.row_to_secret(row)).collect()
    }
}
