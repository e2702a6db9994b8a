// Identity and record resolution
//
// Resolves DID documents through the configured directory (plc) or the
// did:web well-known path, finds PDS endpoints and verification keys, and
// fetches repo records over com.atproto.repo.getRecord. Resolved repos are
// cached in the repos table.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use spindle_core::DidSlashRepo;
use spindle_storage::{Database, RepoRow};

/// Parsed `at://<authority>/<collection>/<rkey>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtUri {
    pub authority: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("at://")
            .with_context(|| format!("not an at-uri: {uri:?}"))?;
        let mut parts = rest.splitn(3, '/');
        let authority = parts.next().unwrap_or_default();
        let collection = parts.next().unwrap_or_default();
        let rkey = parts.next().unwrap_or_default();
        if authority.is_empty() || collection.is_empty() || rkey.is_empty() {
            anyhow::bail!("malformed at-uri: {uri:?}");
        }
        Ok(Self {
            authority: authority.to_string(),
            collection: collection.to_string(),
            rkey: rkey.to_string(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    pub id: String,
    #[serde(default)]
    pub verification_method: Vec<VerificationMethod>,
    #[serde(default)]
    pub service: Vec<Service>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub method_type: String,
    #[serde(default)]
    pub public_key_jwk: Option<PublicKeyJwk>,
    #[serde(default)]
    pub public_key_multibase: Option<String>,
}

/// JWK fields needed for ES256 verification
#[derive(Debug, Clone, Deserialize)]
pub struct PublicKeyJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    #[serde(default)]
    pub y: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub service_endpoint: String,
}

#[derive(Deserialize)]
struct GetRecordResponse {
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct RepoRecord {
    name: String,
    #[serde(default)]
    knot: String,
}

#[derive(Clone)]
pub struct IdResolver {
    http: reqwest::Client,
    plc_directory: String,
    dev: bool,
    db: Database,
}

impl IdResolver {
    pub fn new(plc_directory: impl Into<String>, dev: bool, db: Database) -> Self {
        Self {
            http: reqwest::Client::new(),
            plc_directory: plc_directory.into(),
            dev,
            db,
        }
    }

    pub async fn resolve_did_doc(&self, did: &str) -> Result<DidDocument> {
        let url = if did.starts_with("did:plc:") {
            format!("{}/{did}", self.plc_directory)
        } else if let Some(host) = did.strip_prefix("did:web:") {
            let scheme = if self.dev { "http" } else { "https" };
            // did:web encodes ports with %3A
            format!("{scheme}://{}/.well-known/did.json", host.replace("%3A", ":"))
        } else {
            anyhow::bail!("unsupported did method: {did:?}");
        };

        debug!(did, url, "Resolving DID document");
        let doc: DidDocument = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch DID document for {did}"))?
            .error_for_status()
            .with_context(|| format!("Directory rejected lookup for {did}"))?
            .json()
            .await
            .with_context(|| format!("Invalid DID document for {did}"))?;

        if doc.id != did {
            anyhow::bail!("DID document id {:?} does not match {did:?}", doc.id);
        }
        Ok(doc)
    }

    /// The atproto signing key as an ES256 JWK (x, y). Keys published only
    /// as multibase are not supported by this verifier.
    pub async fn verification_jwk(&self, did: &str) -> Result<(String, String)> {
        let doc = self.resolve_did_doc(did).await?;
        let method = doc
            .verification_method
            .iter()
            .find(|m| m.id.ends_with("#atproto"))
            .with_context(|| format!("no #atproto verification method for {did}"))?;

        match &method.public_key_jwk {
            Some(jwk) if jwk.kty == "EC" && jwk.crv == "P-256" => {
                let y = jwk
                    .y
                    .clone()
                    .context("P-256 JWK is missing the y coordinate")?;
                Ok((jwk.x.clone(), y))
            }
            Some(jwk) => anyhow::bail!(
                "unsupported verification key {}/{} for {did}",
                jwk.kty,
                jwk.crv
            ),
            None if method.public_key_multibase.is_some() => {
                anyhow::bail!("multibase-encoded verification keys are not supported")
            }
            None => anyhow::bail!("verification method for {did} carries no key material"),
        }
    }

    pub fn pds_endpoint(doc: &DidDocument) -> Result<String> {
        doc.service
            .iter()
            .find(|s| s.id.ends_with("#atproto_pds") || s.service_type == "AtprotoPersonalDataServer")
            .map(|s| s.service_endpoint.clone())
            .with_context(|| format!("no PDS service in DID document for {}", doc.id))
    }

    /// Resolve a repo at-uri to its `<did>/<name>` identity: DID doc → PDS →
    /// getRecord → record name. Hits the repos table cache first.
    pub async fn resolve_repo(&self, at_uri: &str) -> Result<DidSlashRepo> {
        let parsed = AtUri::parse(at_uri)?;
        if !parsed.authority.starts_with("did:") {
            anyhow::bail!("at-uri authority must be a DID: {at_uri:?}");
        }

        if let Some(cached) = self.db.get_repo(at_uri).await? {
            return DidSlashRepo::new(&cached.did, &cached.name)
                .map_err(|err| anyhow::anyhow!("cached repo is invalid: {err}"));
        }

        let doc = self.resolve_did_doc(&parsed.authority).await?;
        let pds = Self::pds_endpoint(&doc)?;

        let url = format!(
            "{pds}/xrpc/com.atproto.repo.getRecord?repo={}&collection={}&rkey={}",
            parsed.authority, parsed.collection, parsed.rkey
        );
        let response: GetRecordResponse = self
            .http
            .get(&url)
            .send()
            .await
            .context("Failed to fetch repo record from PDS")?
            .error_for_status()
            .context("PDS rejected the record fetch")?
            .json()
            .await
            .context("Invalid getRecord response")?;

        let record: RepoRecord =
            serde_json::from_value(response.value).context("record is not a repo record")?;

        let repo = DidSlashRepo::new(&parsed.authority, &record.name)
            .map_err(|err| anyhow::anyhow!("repo record names an unsafe path: {err}"))?;

        self.db
            .upsert_repo(&RepoRow {
                at_uri: at_uri.to_string(),
                did: parsed.authority.clone(),
                name: record.name.clone(),
                knot: record.knot.clone(),
            })
            .await?;

        Ok(repo)
    }
}
