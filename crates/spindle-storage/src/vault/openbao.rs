// Remote vault backend: OpenBao KV v2
//
// Secrets live at <mount>/repos/<did>/<repo>/<key>; the repo segment comes
// from DidSlashRepo, which already rejects traversal. Listing goes through
// the metadata index. A background task renews the client token until
// stop() is called.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use spindle_core::secret::{is_valid_key_ident, DidSlashRepo, LockedSecret, Secret};
use spindle_core::traits::Vault;
use spindle_core::VaultError;

#[derive(Debug, Clone)]
pub struct OpenBaoConfig {
    /// Base address, e.g. "https://bao.example.com:8200"
    pub addr: String,
    pub token: String,
    /// KV v2 mount name
    pub mount: String,
    /// How often to renew the client token
    pub renew_interval: Duration,
}

impl OpenBaoConfig {
    pub fn new(addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            token: token.into(),
            mount: "secret".to_string(),
            renew_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SecretData {
    value: String,
    created_at: DateTime<Utc>,
    created_by: String,
}

#[derive(Deserialize)]
struct ReadResponse {
    data: ReadData,
}

#[derive(Deserialize)]
struct ReadData {
    data: SecretData,
}

#[derive(Deserialize)]
struct ListResponse {
    data: ListKeys,
}

#[derive(Deserialize)]
struct ListKeys {
    keys: Vec<String>,
}

pub struct OpenBaoVault {
    http: reqwest::Client,
    config: OpenBaoConfig,
    renewer: Mutex<Option<JoinHandle<()>>>,
}

impl OpenBaoVault {
    pub fn new(config: OpenBaoConfig) -> Self {
        let http = reqwest::Client::new();
        let renewer = spawn_token_renewer(http.clone(), config.clone());
        Self {
            http,
            config,
            renewer: Mutex::new(Some(renewer)),
        }
    }

    fn data_url(&self, repo: &DidSlashRepo, key: &str) -> String {
        format!(
            "{}/v1/{}/data/repos/{}/{}",
            self.config.addr, self.config.mount, repo, key
        )
    }

    fn metadata_url(&self, repo: &DidSlashRepo, key: &str) -> String {
        format!(
            "{}/v1/{}/metadata/repos/{}/{}",
            self.config.addr, self.config.mount, repo, key
        )
    }

    fn list_url(&self, repo: &DidSlashRepo) -> String {
        format!(
            "{}/v1/{}/metadata/repos/{}",
            self.config.addr, self.config.mount, repo
        )
    }

    async fn read_secret(
        &self,
        repo: &DidSlashRepo,
        key: &str,
    ) -> Result<Option<SecretData>, VaultError> {
        let response = self
            .http
            .get(self.data_url(repo, key))
            .header("X-Vault-Token", &self.config.token)
            .send()
            .await
            .map_err(|e| VaultError::Backend(e.into()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: ReadResponse = response
                    .json()
                    .await
                    .map_err(|e| VaultError::Backend(e.into()))?;
                Ok(Some(body.data.data))
            }
            status => Err(VaultError::backend(format!(
                "openbao read failed with status {status}"
            ))),
        }
    }

    async fn list_keys(&self, repo: &DidSlashRepo) -> Result<Vec<String>, VaultError> {
        let method = Method::from_bytes(b"LIST").expect("LIST is a valid method");
        let response = self
            .http
            .request(method, self.list_url(repo))
            .header("X-Vault-Token", &self.config.token)
            .send()
            .await
            .map_err(|e| VaultError::Backend(e.into()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => {
                let body: ListResponse = response
                    .json()
                    .await
                    .map_err(|e| VaultError::Backend(e.into()))?;
                Ok(body.data.keys)
            }
            status => Err(VaultError::backend(format!(
                "openbao list failed with status {status}"
            ))),
        }
    }
}

#[async_trait]
impl Vault for OpenBaoVault {
    async fn add_secret(&self, secret: Secret) -> Result<(), VaultError> {
        if !is_valid_key_ident(&secret.key) {
            return Err(VaultError::InvalidKeyIdent(secret.key));
        }
        if self.read_secret(&secret.repo, &secret.key).await?.is_some() {
            return Err(VaultError::KeyAlreadyPresent);
        }

        let payload = serde_json::json!({
            "data": SecretData {
                value: secret.value,
                created_at: secret.created_at,
                created_by: secret.created_by,
            }
        });
        let response = self
            .http
            .post(self.data_url(&secret.repo, &secret.key))
            .header("X-Vault-Token", &self.config.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| VaultError::Backend(e.into()))?;

        if !response.status().is_success() {
            return Err(VaultError::backend(format!(
                "openbao write failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn remove_secret(&self, repo: &DidSlashRepo, key: &str) -> Result<(), VaultError> {
        if self.read_secret(repo, key).await?.is_none() {
            return Err(VaultError::KeyNotFound);
        }

        // Deleting the metadata path destroys every version
        let response = self
            .http
            .delete(self.metadata_url(repo, key))
            .header("X-Vault-Token", &self.config.token)
            .send()
            .await
            .map_err(|e| VaultError::Backend(e.into()))?;

        if !response.status().is_success() {
            return Err(VaultError::backend(format!(
                "openbao delete failed with status {}",
                response.status()
            )));
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
        let mut secrets = Vec::new();
        for key in self.list_keys(repo).await? {
            let Some(data) = self.read_secret(repo, &key).await? else {
                // Deleted between list and read
                continue;
            };
            secrets.push(Secret {
                repo: repo.clone(),
                key,
                value: data.value,
                created_at: data.created_at,
                created_by: data.created_by,
            });
        }
        Ok(secrets)
    }

    async fn stop(&self) {
        if let Some(handle) = self.renewer.lock().await.take() {
            handle.abort();
            debug!("Stopped openbao token renewal");
        }
    }
}

fn spawn_token_renewer(http: reqwest::Client, config: OpenBaoConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let url = format!("{}/v1/auth/token/renew-self", config.addr);
        loop {
            tokio::time::sleep(config.renew_interval).await;
            let result = http
                .post(&url)
                .header("X-Vault-Token", &config.token)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!("Renewed openbao token");
                }
                Ok(response) => {
                    warn!(status = %response.status(), "Openbao token renewal rejected");
                }
                Err(err) => {
                    warn!(error = %err, "Openbao token renewal failed");
                }
            }
        }
    })
}
