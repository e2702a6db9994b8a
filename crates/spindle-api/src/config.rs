// Environment configuration
// Decision: required fields fail fast at startup; everything else defaults

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretsProvider {
    Sqlite,
    OpenBao,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub db_path: PathBuf,
    /// This spindle's own hostname; the self DID is did:web:<hostname>
    pub hostname: String,
    /// Owner DID
    pub owner: String,
    pub jetstream_endpoint: String,
    pub dev: bool,
    pub subscribed_knots: Vec<String>,
    pub log_dir: PathBuf,
    pub workflow_timeout: Duration,
    pub queue_size: usize,
    pub queue_workers: usize,
    pub consumer_workers: usize,
    pub nixery_host: String,
    pub secrets_provider: SecretsProvider,
    pub openbao_addr: Option<String>,
    pub openbao_token: Option<String>,
    pub openbao_mount: String,
    pub plc_directory: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let hostname = var("HOSTNAME").context("HOSTNAME environment variable required")?;
        let owner = var("OWNER").context("OWNER environment variable required")?;

        let secrets_provider = match var("SECRETS_PROVIDER").as_deref() {
            None | Some("sqlite") => SecretsProvider::Sqlite,
            Some("openbao") => SecretsProvider::OpenBao,
            Some(other) => anyhow::bail!("Unknown SECRETS_PROVIDER {other:?}"),
        };

        Ok(Self {
            listen_addr: var("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:6555".to_string()),
            db_path: var("DB_PATH").unwrap_or_else(|| "spindle.db".to_string()).into(),
            hostname,
            owner,
            jetstream_endpoint: var("JETSTREAM_ENDPOINT")
                .unwrap_or_else(|| "wss://jetstream1.us-east.bsky.network/subscribe".to_string()),
            dev: var("DEV").map(|v| v == "1" || v == "true").unwrap_or(false),
            subscribed_knots: var("SUBSCRIBED_KNOTS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            log_dir: var("LOG_DIR").unwrap_or_else(|| "/var/log/spindle".to_string()).into(),
            workflow_timeout: Duration::from_secs(
                var("WORKFLOW_TIMEOUT_SECS")
                    .map(|v| v.parse().context("WORKFLOW_TIMEOUT_SECS must be an integer"))
                    .transpose()?
                    .unwrap_or(300),
            ),
            queue_size: parse_or(&var, "QUEUE_SIZE", 100)?,
            queue_workers: parse_or(&var, "QUEUE_WORKERS", 4)?,
            consumer_workers: parse_or(&var, "CONSUMER_WORKERS", 10)?,
            nixery_host: var("NIXERY_HOST").unwrap_or_else(|| "nixery.dev".to_string()),
            secrets_provider,
            openbao_addr: var("OPENBAO_ADDR"),
            openbao_token: var("OPENBAO_TOKEN"),
            openbao_mount: var("OPENBAO_MOUNT").unwrap_or_else(|| "secret".to_string()),
            plc_directory: var("PLC_DIRECTORY")
                .unwrap_or_else(|| "https://plc.directory".to_string()),
        })
    }

    /// The DID other services address this spindle by
    pub fn self_did(&self) -> String {
        format!("did:web:{}", self.hostname)
    }
}

fn parse_or(var: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> Result<usize> {
    var(key)
        .map(|v| v.parse().with_context(|| format!("{key} must be an integer")))
        .transpose()
        .map(|parsed| parsed.unwrap_or(default))
}
