//! Bearer token verification for the personalized timeline.
//!
//! Tokens are JWTs issued to AT Protocol clients. Only the claims are
//! checked here: signatures are not verified against the issuer's key, so a
//! passing token proves well-formedness, not authenticity.

use axum::extract::Request;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiError;

/// Capability marker a token's scope must contain.
const REQUIRED_SCOPE: &str = "atproto";

/// Subject prefix of a decentralized identifier.
const DID_PREFIX: &str = "did:";

/// Why a bearer token was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    /// The token is not a decodable JWT.
    #[error("verification failed")]
    VerificationFailed,

    /// `sub`, `aud` or `iss` is missing or empty.
    #[error("invalid claims")]
    InvalidClaims,

    #[error("expired")]
    Expired,

    /// `sub` is not a DID.
    #[error("invalid subject")]
    InvalidSubject,

    #[error("insufficient scope")]
    InsufficientScope,
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InsufficientScope => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// Metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::VerificationFailed => "verification_failed",
            Self::InvalidClaims => "invalid_claims",
            Self::Expired => "expired",
            Self::InvalidSubject => "invalid_subject",
            Self::InsufficientScope => "insufficient_scope",
        }
    }
}

/// The caller behind a verified token. Inserted into request extensions by
/// [`require_auth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity {
    /// Subject DID.
    pub subject: String,
    pub audience: String,
    pub issuer: String,
    pub scope: String,
    /// `iat`, unix seconds.
    pub issued_at: Option<i64>,
    /// `exp`, unix seconds.
    pub expires_at: Option<i64>,
}

/// Registered claims as they appear on the wire.
///
/// String claims are kept untyped so a wrong type reads as an invalid claim
/// rather than an undecodable token. NumericDates may be fractional.
#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Value,
    #[serde(default)]
    aud: Value,
    #[serde(default)]
    iss: Value,
    #[serde(default)]
    scope: Value,
    iat: Option<f64>,
    exp: Option<f64>,
}

impl Claims {
    /// First non-empty audience; `aud` may be a string or an array.
    fn audience(&self) -> Option<&str> {
        match &self.aud {
            Value::Array(auds) => auds.iter().find_map(non_empty_str),
            aud => non_empty_str(aud),
        }
    }
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| !s.is_empty())
}

/// Verify an `Authorization` header value at time `now_unix` (seconds).
pub fn verify_bearer(
    header: Option<&str>,
    now_unix: i64,
) -> Result<AuthenticatedIdentity, AuthError> {
    let token = header
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingToken)?;

    let claims = decode_claims(token)?;

    let subject = non_empty_str(&claims.sub).ok_or(AuthError::InvalidClaims)?;
    let audience = claims.audience().ok_or(AuthError::InvalidClaims)?;
    let issuer = non_empty_str(&claims.iss).ok_or(AuthError::InvalidClaims)?;

    if let Some(exp) = claims.exp
        && exp < now_unix as f64
    {
        return Err(AuthError::Expired);
    }

    if !subject.starts_with(DID_PREFIX) {
        return Err(AuthError::InvalidSubject);
    }

    let scope = claims.scope.as_str().unwrap_or_default();
    if !scope.contains(REQUIRED_SCOPE) {
        return Err(AuthError::InsufficientScope);
    }

    Ok(AuthenticatedIdentity {
        subject: subject.to_string(),
        audience: audience.to_string(),
        issuer: issuer.to_string(),
        scope: scope.to_string(),
        issued_at: claims.iat.map(|iat| iat as i64),
        expires_at: claims.exp.map(|exp| exp as i64),
    })
}

/// Decode the token's claims without checking its signature.
///
/// Expiry and audience are checked by [`verify_bearer`] so each failure
/// keeps its own reason.
fn decode_claims(token: &str) -> Result<Claims, AuthError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| {
            tracing::trace!(kind = ?e.kind(), "undecodable bearer token");
            AuthError::VerificationFailed
        })
}

/// Middleware that requires a valid bearer token.
///
/// On success the [`AuthenticatedIdentity`] is available to handlers as an
/// `Extension`.
pub async fn require_auth(mut request: Request, next: Next) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match verify_bearer(header, chrono::Utc::now().timestamp()) {
        Ok(identity) => {
            tracing::debug!(did = %identity.subject, "authenticated request");
            request.extensions_mut().insert(identity);
            Ok(next.run(request).await)
        }
        Err(e) => {
            tracing::debug!(reason = %e, "rejected bearer token");
            metrics::counter!("auth_failures_total", "reason" => e.label()).increment(1);
            Err(e.into())
        }
    }
}
