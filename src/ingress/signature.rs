//! Inbound webhook signature verification.
//!
//! The platform signs `v0:{timestamp}:{raw body}` with a shared secret
//! and sends the hex HMAC-SHA256 as `v0=<hex>`. Requests older (or newer)
//! than the tolerance window are rejected before the HMAC is checked, so
//! a captured request cannot be replayed later.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signature scheme version prefix.
pub const SIGNATURE_VERSION: &str = "v0";

/// Header carrying the signing timestamp (epoch seconds).
pub const TIMESTAMP_HEADER: &str = "x-conduit-request-timestamp";

/// Header carrying the signature (`v0=<hex>`).
pub const SIGNATURE_HEADER: &str = "x-conduit-signature";

/// Verification failures. All map to a rejected request; the variants
/// exist for logging.
#[derive(Debug, PartialEq)]
pub enum SignatureError {
    MissingTimestamp,
    MalformedTimestamp,
    /// Timestamp outside the tolerance window (replay mitigation)
    StaleTimestamp,
    MissingSignature,
    MalformedSignature,
    /// HMAC mismatch
    Mismatch,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::MissingTimestamp => write!(f, "missing timestamp header"),
            SignatureError::MalformedTimestamp => write!(f, "malformed timestamp header"),
            SignatureError::StaleTimestamp => write!(f, "timestamp outside tolerance window"),
            SignatureError::MissingSignature => write!(f, "missing signature header"),
            SignatureError::MalformedSignature => write!(f, "malformed signature header"),
            SignatureError::Mismatch => write!(f, "signature mismatch"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Computes the signature header value for a request.
///
/// Exposed for the signing side of tests and local tooling.
pub fn sign(signing_secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(format!("{}:{}:", SIGNATURE_VERSION, timestamp).as_bytes());
    mac.update(body);
    format!("{}={}", SIGNATURE_VERSION, hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a request signature.
///
/// `timestamp_header` and `signature_header` are the raw header values;
/// `now` is the current epoch second. Comparison is constant-time via
/// `Mac::verify_slice`.
pub fn verify(
    signing_secret: &str,
    timestamp_header: Option<&str>,
    signature_header: Option<&str>,
    body: &[u8],
    tolerance_seconds: i64,
    now: i64,
) -> Result<(), SignatureError> {
    let timestamp: i64 = timestamp_header
        .ok_or(SignatureError::MissingTimestamp)?
        .trim()
        .parse()
        .map_err(|_| SignatureError::MalformedTimestamp)?;

    if (now - timestamp).abs() > tolerance_seconds {
        return Err(SignatureError::StaleTimestamp);
    }

    let signature = signature_header.ok_or(SignatureError::MissingSignature)?;
    let hex_sig = signature
        .strip_prefix("v0=")
        .ok_or(SignatureError::MalformedSignature)?;
    let provided = hex::decode(hex_sig).map_err(|_| SignatureError::MalformedSignature)?;

    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(format!("{}:{}:", SIGNATURE_VERSION, timestamp).as_bytes());
    mac.update(body);

    mac.verify_slice(&provided)
        .map_err(|_| SignatureError::Mismatch)
}
