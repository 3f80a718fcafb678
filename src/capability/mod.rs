//! Capability tokens: signed, time-bounded envelopes of executor authority.
//!
//! A token is three base64url segments separated by `.`:
//!
//! ```text
//! base64url(header) . base64url(claims) . base64url(HMAC-SHA256(secret, header.claims))
//! ```
//!
//! The header pins the algorithm; the claims carry exactly the authority
//! the dispatcher granted (mounts, network policy, timeout, output cap).
//! The executor entrypoint verifies the token before running any task,
//! and any component minting a derivative scope verifies first.
//!
//! The signing secret is process-wide init state and is never serialised.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Grace added to the task timeout when computing token lifetime.
const LIFETIME_GRACE_SECS: u64 = 30;

// ─── Claims ───────────────────────────────────────────────────────────────────

/// Outbound network authority carried by a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// No network: the container runs with `--network=none`.
    None,
    /// Egress limited to TCP/443 toward the listed domains.
    Restricted { allowed_domains: Vec<String> },
}

/// One mount claim: host path, container path, writability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountClaim {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// The authority claims embedded in a capability token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityClaims {
    pub executor_type: String,
    pub mounts: Vec<MountClaim>,
    pub network: NetworkPolicy,
    pub timeout_seconds: u64,
    pub max_output_bytes: usize,
    /// Seconds since the UNIX epoch.
    pub issued_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

impl Header {
    fn expected() -> Self {
        Self {
            alg: "HS256".to_owned(),
            typ: "WCT".to_owned(),
        }
    }
}

// ─── Mint / verify ────────────────────────────────────────────────────────────

/// Compute a token lifetime: task timeout plus a small grace, capped.
pub fn token_lifetime_secs(task_timeout_secs: u64, hard_cap_secs: u64) -> u64 {
    (task_timeout_secs + LIFETIME_GRACE_SECS).min(hard_cap_secs)
}

/// Sign `claims` into a compact token string.
pub fn mint(claims: &CapabilityClaims, secret: &[u8]) -> Result<String, String> {
    let header = serde_json::to_vec(&Header::expected())
        .map_err(|e| format!("capability header serialise error: {e}"))?;
    let body = serde_json::to_vec(claims)
        .map_err(|e| format!("capability claims serialise error: {e}"))?;

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header),
        URL_SAFE_NO_PAD.encode(body)
    );

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| format!("capability secret invalid: {e}"))?;
    mac.update(signing_input.as_bytes());
    let sig = mac.finalize().into_bytes();

    Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

/// Verify a token's signature and expiry, returning its claims.
///
/// Rejects: malformed structure, unknown header, bad signature, and
/// tokens whose `expires_at` is in the past.
pub fn verify(token: &str, secret: &[u8]) -> Result<CapabilityClaims, String> {
    let mut parts = token.split('.');
    let (header_b64, claims_b64, sig_b64) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(c), Some(s)) if parts.next().is_none() => (h, c, s),
        _ => return Err("capability token must have exactly three segments".to_string()),
    };

    let header_raw = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|e| format!("capability header decode error: {e}"))?;
    let header: Header = serde_json::from_slice(&header_raw)
        .map_err(|e| format!("capability header parse error: {e}"))?;
    let expected = Header::expected();
    if header.alg != expected.alg || header.typ != expected.typ {
        return Err(format!("unsupported capability header: {}/{}", header.alg, header.typ));
    }

    // Recompute the MAC over the exact received segments.
    let signing_input = format!("{header_b64}.{claims_b64}");
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| format!("capability secret invalid: {e}"))?;
    mac.update(signing_input.as_bytes());
    let sig = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|e| format!("capability signature decode error: {e}"))?;
    mac.verify_slice(&sig)
        .map_err(|_| "capability signature mismatch".to_string())?;

    let claims_raw = URL_SAFE_NO_PAD
        .decode(claims_b64)
        .map_err(|e| format!("capability claims decode error: {e}"))?;
    let claims: CapabilityClaims = serde_json::from_slice(&claims_raw)
        .map_err(|e| format!("capability claims parse error: {e}"))?;

    if claims.expires_at <= Utc::now().timestamp() {
        return Err("capability token expired".to_string());
    }

    Ok(claims)
}

// ─── Tests ────────────────────────────────────────────────────────────────────
