//! Bearer token authentication.
//!
//! Tokens are HS512 JWTs signed with the gateway secret and carrying
//! `userId` and `deviceId` claims. `exp` and `nbf`, when present, are checked
//! against the current time; both may be integer or fractional seconds.
//! `iat`, `iss`, `aud` and any other claim are not inspected.
//!
//! The [`AuthLayer`] runs before routing: a present but invalid token is
//! rejected with 401, a valid one attaches an [`Identity`] to the request.
//! With `only_authorized`, requests without an identity are rejected too.

use crate::error::status_response;
use axum::{body::Body, http::Request, http::StatusCode, response::Response};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha512;
use std::sync::Arc;
use thiserror::Error;
use tower::{Layer, Service};
use tracing::{debug, warn};

type HmacSha512 = Hmac<Sha512>;

const ALGORITHM: &str = "HS512";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("unsupported algorithm: {0}")]
    Algorithm(String),
    #[error("signature mismatch")]
    Signature,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("missing claim: {0}")]
    MissingClaim(&'static str),
    #[error("request carries no identity")]
    MissingIdentity,
}

/// Claims understood by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: String,
    pub device_id: String,
    /// Expiry, unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Not valid before, unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
}

/// Authenticated caller, attached to the request by [`AuthLayer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub device_id: String,
}

/// Signs and verifies HS512 tokens with one shared secret.
#[derive(Clone)]
pub struct JwtVerifier {
    secret: Arc<[u8]>,
}

impl JwtVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: Arc::from(secret.as_ref()),
        }
    }

    fn mac(&self) -> Result<HmacSha512, AuthError> {
        HmacSha512::new_from_slice(&self.secret).map_err(|_| AuthError::Signature)
    }

    /// Issue a token for `claims`.
    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        let header = serde_json::json!({"alg": ALGORITHM, "typ": "JWT"});
        let header = URL_SAFE_NO_PAD.encode(header.to_string());
        let payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).map_err(|_| AuthError::Malformed)?);

        let mut mac = self.mac()?;
        mac.update(format!("{header}.{payload}").as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{header}.{payload}.{signature}"))
    }

    /// Check signature, algorithm and validity window; extract the identity.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let mut parts = token.split('.');
        let (Some(header_segment), Some(payload_segment), Some(signature_segment), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed);
        };

        let header = decode_segment(header_segment)?;
        match header.get("alg").and_then(Value::as_str) {
            Some(ALGORITHM) => {}
            Some(other) => return Err(AuthError::Algorithm(other.to_string())),
            None => return Err(AuthError::Malformed),
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_segment)
            .map_err(|_| AuthError::Malformed)?;
        let mut mac = self.mac()?;
        mac.update(format!("{header_segment}.{payload_segment}").as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::Signature)?;

        let claims = decode_segment(payload_segment)?;
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        if let Some(exp) = numeric_date(&claims, "exp")? {
            if now >= exp {
                return Err(AuthError::Expired);
            }
        }
        if let Some(nbf) = numeric_date(&claims, "nbf")? {
            if now < nbf {
                return Err(AuthError::NotYetValid);
            }
        }

        let claim = |name: &'static str| {
            claims
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(AuthError::MissingClaim(name))
        };
        Ok(Identity {
            user_id: claim("userId")?,
            device_id: claim("deviceId")?,
        })
    }
}

/// A NumericDate claim. Present but not a number is malformed.
fn numeric_date(claims: &Value, name: &str) -> Result<Option<f64>, AuthError> {
    match claims.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_f64().map(Some).ok_or(AuthError::Malformed),
    }
}

fn decode_segment(segment: &str) -> Result<Value, AuthError> {
    let raw = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::Malformed)?;
    serde_json::from_slice(&raw).map_err(|_| AuthError::Malformed)
}

/// Token from an `Authorization: Bearer <token>` header, if any.
fn bearer_token<B>(req: &Request<B>) -> Option<&str> {
    let value = req.headers().get(axum::http::header::AUTHORIZATION)?;
    let value = value.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!token.is_empty()).then_some(token)
}

/// Authentication configuration
#[derive(Clone)]
pub struct AuthConfig {
    /// Tokens are ignored when no secret is configured.
    pub verifier: Option<JwtVerifier>,
    /// Reject requests without a valid token.
    pub only_authorized: bool,
}

/// Authentication layer
#[derive(Clone)]
pub struct AuthLayer {
    config: Arc<AuthConfig>,
}

impl AuthLayer {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            config: Arc::clone(&self.config),
        }
    }
}

/// Authentication service
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    config: Arc<AuthConfig>,
}

impl<S> Service<Request<Body>> for AuthService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let config = Arc::clone(&self.config);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let verified = bearer_token(&req)
                .zip(config.verifier.as_ref())
                .map(|(token, verifier)| verifier.verify(token));
            let identity = match verified {
                Some(Ok(identity)) => Some(identity),
                Some(Err(e)) => {
                    warn!(uri = %req.uri(), error = %e, "Rejected bearer token");
                    return Ok(status_response(StatusCode::UNAUTHORIZED));
                }
                None => None,
            };

            match identity {
                Some(identity) => {
                    debug!(user = %identity.user_id, device = %identity.device_id, "Authenticated");
                    req.extensions_mut().insert(identity);
                }
                None if config.only_authorized => {
                    warn!(uri = %req.uri(), error = %AuthError::MissingIdentity, "Request rejected");
                    return Ok(status_response(StatusCode::UNAUTHORIZED));
                }
                None => {}
            }

            inner.call(req).await
        })
    }
}
