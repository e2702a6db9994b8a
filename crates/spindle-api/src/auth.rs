// Inter-service auth
//
// Requests to the secret-management surface carry a bearer JWT signed by the
// calling service's atproto key. Verification: resolve the issuer's DID
// document through the identity directory, check the signature (ES256),
// the audience (this spindle's DID) and the method binding (lxm).

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::XrpcError;
use crate::identity::IdResolver;

/// The authenticated caller, bound into request extensions on success
#[derive(Debug, Clone)]
pub struct ActorDid(pub String);

#[async_trait]
pub trait ServiceAuthValidator: Send + Sync {
    /// Validate a bearer token for the given method NSID; returns the actor
    /// DID on success and a human-readable reason on failure
    async fn validate(&self, token: &str, lxm: &str) -> Result<String, String>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    iss: String,
    #[allow(dead_code)]
    aud: String,
    #[allow(dead_code)]
    exp: i64,
    #[serde(default)]
    lxm: Option<String>,
}

/// Production validator: ES256 against the issuer's published JWK
pub struct JwtServiceAuth {
    audience: String,
    resolver: Arc<IdResolver>,
}

impl JwtServiceAuth {
    pub fn new(audience: impl Into<String>, resolver: Arc<IdResolver>) -> Self {
        Self {
            audience: audience.into(),
            resolver,
        }
    }
}

/// Read the issuer out of an unverified token; verification follows once the
/// issuer's key is known
fn peek_issuer(token: &str) -> Result<String, String> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| "token is not a JWT".to_string())?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| "token payload is not base64url".to_string())?;
    let claims: Claims =
        serde_json::from_slice(&bytes).map_err(|_| "token claims are malformed".to_string())?;
    Ok(claims.iss)
}

#[async_trait]
impl ServiceAuthValidator for JwtServiceAuth {
    async fn validate(&self, token: &str, lxm: &str) -> Result<String, String> {
        let header = decode_header(token).map_err(|err| err.to_string())?;
        if header.alg != Algorithm::ES256 {
            return Err(format!("unsupported algorithm {:?}", header.alg));
        }

        let issuer = peek_issuer(token)?;
        let (x, y) = self
            .resolver
            .verification_jwk(&issuer)
            .await
            .map_err(|err| err.to_string())?;
        let key = DecodingKey::from_ec_components(&x, &y).map_err(|err| err.to_string())?;

        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "aud"]);

        let data = decode::<Claims>(token, &key, &validation).map_err(|err| err.to_string())?;

        if let Some(bound) = &data.claims.lxm {
            if bound != lxm {
                return Err(format!("token is bound to {bound}, not {lxm}"));
            }
        }
        Ok(data.claims.iss)
    }
}

#[derive(Clone)]
pub struct AuthState {
    pub validator: Arc<dyn ServiceAuthValidator>,
}

/// Axum middleware gating the XRPC surface
pub async fn service_auth(
    State(state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let lxm = request
        .uri()
        .path()
        .strip_prefix("/xrpc/")
        .unwrap_or_default()
        .to_string();

    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);

    let Some(token) = token else {
        return XrpcError::auth("missing bearer token").into_response();
    };

    match state.validator.validate(&token, &lxm).await {
        Ok(did) => {
            request.extensions_mut().insert(ActorDid(did));
            next.run(request).await
        }
        Err(reason) => {
            XrpcError::auth(format!("signature verification failed: {reason}")).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Extension, Router};
    use tower::ServiceExt;

    struct FakeValidator;

    #[async_trait]
    impl ServiceAuthValidator for FakeValidator {
        async fn validate(&self, token: &str, lxm: &str) -> Result<String, String> {
            if token == "good" && lxm == "sh.tangled.spindle.listSecrets" {
                Ok("did:plc:caller".to_string())
            } else {
                Err("bad token".to_string())
            }
        }
    }

    fn app() -> Router {
        let state = AuthState {
            validator: Arc::new(FakeValidator),
        };
        Router::new()
            .route(
                "/xrpc/sh.tangled.spindle.listSecrets",
                get(|Extension(actor): Extension<ActorDid>| async move { actor.0 }),
            )
            .layer(axum::middleware::from_fn_with_state(state, service_auth))
    }

    #[tokio::test]
    async fn test_missing_token_is_rejected() {
        let response = app()
            .oneshot(
                axum::http::Request::get("/xrpc/sh.tangled.spindle.listSecrets")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Auth");
    }

    #[tokio::test]
    async fn test_invalid_token_reports_verification_failure() {
        let response = app()
            .oneshot(
                axum::http::Request::get("/xrpc/sh.tangled.spindle.listSecrets")
                    .header(AUTHORIZATION, "Bearer forged")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["message"]
            .as_str()
            .unwrap()
            .starts_with("signature verification failed"));
    }

    #[tokio::test]
    async fn test_valid_token_binds_actor_did() {
        let response = app()
            .oneshot(
                axum::http::Request::get("/xrpc/sh.tangled.spindle.listSecrets")
                    .header(AUTHORIZATION, "Bearer good")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"did:plc:caller");
    }

    #[test]
    fn test_peek_issuer() {
        let claims = URL_SAFE_NO_PAD.encode(
            serde_json::json!({
                "iss": "did:plc:caller",
                "aud": "did:web:spindle.test",
                "exp": 2000000000i64
            })
            .to_string(),
        );
        let token = format!("eyJhbGciOiJFUzI1NiJ9.{claims}.c2ln");
        assert_eq!(peek_issuer(&token).unwrap(), "did:plc:caller");

        assert!(peek_issuer("garbage").is_err());
    }
}
