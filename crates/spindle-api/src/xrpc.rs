// Secret-management XRPC routes
//
// addSecret / removeSecret / listSecrets are gated by service auth; owner is
// public so other services can discover who operates this spindle.

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use spindle_core::traits::Vault;
use spindle_core::{nsid, LockedSecret, Secret};
use spindle_storage::Enforcer;

use crate::auth::{service_auth, ActorDid, AuthState};
use crate::error::XrpcError;
use crate::identity::IdResolver;

#[derive(Clone)]
pub struct AppState {
    pub vault: Arc<dyn Vault>,
    pub enforcer: Enforcer,
    pub resolver: Arc<IdResolver>,
}

/// Locked secret as returned over the wire
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretView {
    pub repo: String,
    pub key: String,
    /// Short digest of the value, for drift detection
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

impl From<LockedSecret> for SecretView {
    fn from(secret: LockedSecret) -> Self {
        Self {
            repo: secret.repo.to_string(),
            key: secret.key,
            fingerprint: secret.fingerprint,
            created_at: secret.created_at,
            created_by: secret.created_by,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddSecretRequest {
    /// At-uri of the repo record
    pub repo: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RemoveSecretRequest {
    pub repo: String,
    pub key: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ListSecretsParams {
    pub repo: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListSecretsResponse {
    pub secrets: Vec<SecretView>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OwnerResponse {
    pub owner: String,
}

pub fn routes(state: AppState, auth: AuthState) -> Router {
    let protected = Router::new()
        .route(&format!("/xrpc/{}", nsid::ADD_SECRET), post(add_secret))
        .route(&format!("/xrpc/{}", nsid::REMOVE_SECRET), post(remove_secret))
        .route(&format!("/xrpc/{}", nsid::LIST_SECRETS), get(list_secrets))
        .layer(axum::middleware::from_fn_with_state(auth, service_auth))
        .with_state(state.clone());

    let public = Router::new()
        .route(&format!("/xrpc/{}", nsid::OWNER), get(owner))
        .with_state(state);

    protected.merge(public)
}

/// Resolve the repo at-uri and check the actor may touch its settings
async fn authorize(
    state: &AppState,
    actor: Option<Extension<ActorDid>>,
    repo_uri: &str,
) -> Result<(String, spindle_core::DidSlashRepo), XrpcError> {
    let Some(Extension(ActorDid(actor))) = actor else {
        return Err(XrpcError::missing_actor());
    };

    let repo = state
        .resolver
        .resolve_repo(repo_uri)
        .await
        .map_err(|err| XrpcError::invalid_repo(err.to_string()))?;

    let allowed = state
        .enforcer
        .is_settings_allowed(&actor, "thisserver", repo.as_str())
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "Enforcer query failed");
            XrpcError::generic("access check failed")
        })?;
    if !allowed {
        return Err(XrpcError::access_denied());
    }

    Ok((actor, repo))
}

/// POST /xrpc/sh.tangled.spindle.addSecret
#[utoipa::path(
    post,
    path = "/xrpc/sh.tangled.spindle.addSecret",
    request_body = AddSecretRequest,
    responses(
        (status = 200, description = "Secret stored"),
        (status = 401, description = "Actor lacks access", body = crate::error::ErrorBody),
        (status = 409, description = "Key already present", body = crate::error::ErrorBody)
    ),
    tag = "secrets"
)]
pub async fn add_secret(
    State(state): State<AppState>,
    actor: Option<Extension<ActorDid>>,
    Json(request): Json<AddSecretRequest>,
) -> Result<Json<serde_json::Value>, XrpcError> {
    let (actor, repo) = authorize(&state, actor, &request.repo).await?;

    state
        .vault
        .add_secret(Secret {
            repo,
            key: request.key,
            value: request.value,
            created_at: Utc::now(),
            created_by: actor,
        })
        .await?;

    Ok(Json(serde_json::json!({})))
}

/// POST /xrpc/sh.tangled.spindle.removeSecret
#[utoipa::path(
    post,
    path = "/xrpc/sh.tangled.spindle.removeSecret",
    request_body = RemoveSecretRequest,
    responses(
        (status = 200, description = "Secret removed"),
        (status = 404, description = "No such key", body = crate::error::ErrorBody)
    ),
    tag = "secrets"
)]
pub async fn remove_secret(
    State(state): State<AppState>,
    actor: Option<Extension<ActorDid>>,
    Json(request): Json<RemoveSecretRequest>,
) -> Result<Json<serde_json::Value>, XrpcError> {
    let (_, repo) = authorize(&state, actor, &request.repo).await?;

    state.vault.remove_secret(&repo, &request.key).await?;

    Ok(Json(serde_json::json!({})))
}

/// GET /xrpc/sh.tangled.spindle.listSecrets
#[utoipa::path(
    get,
    path = "/xrpc/sh.tangled.spindle.listSecrets",
    params(("repo" = String, Query, description = "At-uri of the repo record")),
    responses(
        (status = 200, description = "Locked secrets", body = ListSecretsResponse),
        (status = 401, description = "Actor lacks access", body = crate::error::ErrorBody)
    ),
    tag = "secrets"
)]
pub async fn list_secrets(
    State(state): State<AppState>,
    actor: Option<Extension<ActorDid>>,
    Query(params): Query<ListSecretsParams>,
) -> Result<Json<ListSecretsResponse>, XrpcError> {
    let (_, repo) = authorize(&state, actor, &params.repo).await?;

    let secrets = state.vault.secrets_locked(&repo).await?;

    Ok(Json(ListSecretsResponse {
        secrets: secrets.into_iter().map(SecretView::from).collect(),
    }))
}

/// GET /xrpc/sh.tangled.spindle.owner
#[utoipa::path(
    get,
    path = "/xrpc/sh.tangled.spindle.owner",
    responses((status = 200, description = "Configured owner DID", body = OwnerResponse)),
    tag = "secrets"
)]
pub async fn owner(State(state): State<AppState>) -> Json<OwnerResponse> {
    Json(OwnerResponse {
        owner: state.enforcer.owner().to_string(),
    })
}
