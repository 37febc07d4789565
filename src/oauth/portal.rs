//! Signed portal-link tokens.
//!
//! The broker hands users an authorization link when no valid credential
//! exists. The link carries a compact HS256-signed token binding the flow
//! to that user, so a forwarded link cannot connect someone else's
//! account. Format is `header.payload.signature` with URL-safe unpadded
//! base64 segments.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by a portal-link token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortalClaims {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Expiry (epoch seconds)
    pub exp: i64,
}

/// Portal token validation errors.
#[derive(Debug, PartialEq)]
pub enum PortalTokenError {
    /// Not three dot-separated base64 segments, or undecodable payload
    Malformed,
    /// Signature does not verify under the portal signing secret
    BadSignature,
    /// `exp` is in the past
    Expired,
}

impl std::fmt::Display for PortalTokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortalTokenError::Malformed => write!(f, "malformed portal token"),
            PortalTokenError::BadSignature => write!(f, "invalid portal token signature"),
            PortalTokenError::Expired => write!(f, "portal token expired"),
        }
    }
}

impl std::error::Error for PortalTokenError {}

/// Signs claims into a portal token.
pub fn mint(signing_secret: &str, claims: &PortalClaims) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload =
        URL_SAFE_NO_PAD.encode(serde_json::to_string(claims).expect("claims serialize"));

    let message = format!("{}.{}", header, payload);
    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    format!("{}.{}", message, signature)
}

/// Verifies a portal token and returns its claims.
///
/// Signature comparison is constant-time via `Mac::verify_slice`.
pub fn verify(
    signing_secret: &str,
    token: &str,
    now: i64,
) -> Result<PortalClaims, PortalTokenError> {
    let mut parts = token.splitn(3, '.');
    let (header, payload, signature) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s)) if !h.is_empty() && !p.is_empty() && !s.is_empty() => {
            (h, p, s)
        }
        _ => return Err(PortalTokenError::Malformed),
    };

    let provided = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| PortalTokenError::Malformed)?;

    let message = format!("{}.{}", header, payload);
    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    mac.verify_slice(&provided)
        .map_err(|_| PortalTokenError::BadSignature)?;

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| PortalTokenError::Malformed)?;
    let claims: PortalClaims =
        serde_json::from_slice(&payload_bytes).map_err(|_| PortalTokenError::Malformed)?;

    if now > claims.exp {
        return Err(PortalTokenError::Expired);
    }

    Ok(claims)
}
