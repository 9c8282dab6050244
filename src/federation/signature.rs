//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Outbound requests always sign `(request-target) host date`. Inbound
//! requests are verified against whatever header list the signer declared,
//! in the order it was declared.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use super::registry::KeyResolver;
use crate::error::AppError;

/// Header list used for every outbound signature.
pub const SIGNED_HEADERS: &str = "(request-target) host date";

/// Format a timestamp the way the `Date` header carries it.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Key id advertised for a local actor.
pub fn key_id_for(actor_uri: &str) -> String {
    format!("{}#main-key", actor_uri)
}

/// Canonical string for the outbound header list.
pub fn signing_string(method: &str, path: &str, host: &str, date: &str) -> String {
    format!(
        "(request-target): {} {}\nhost: {}\ndate: {}",
        method.to_lowercase(),
        path,
        host,
        date
    )
}

/// Headers to add for signed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeaders {
    /// Host header value (exactly what was signed)
    pub host: String,
    /// Date header value (exactly what was signed)
    pub date: String,
    /// Signature header value
    pub signature: String,
}

/// Sign an outgoing request
///
/// # Arguments
/// * `private_key_pem` - Actor's RSA private key (PKCS#8 PEM)
/// * `actor_uri` - Actor URI; the key id is `<actor_uri>#main-key`
/// * `method` - HTTP method (e.g., "POST")
/// * `path` - Request path including query
/// * `host` - Target host authority
/// * `at` - Timestamp placed in the Date header
///
/// # Errors
/// `AppError::KeyUnavailable` if the private key cannot be parsed.
pub fn sign_request(
    private_key_pem: &str,
    actor_uri: &str,
    method: &str,
    path: &str,
    host: &str,
    at: DateTime<Utc>,
) -> Result<SignatureHeaders, AppError> {
    let date = http_date(at);
    let canonical = signing_string(method, path, host, &date);
    let signature_b64 = sign_string(private_key_pem, &canonical)?;

    let signature = format!(
        "keyId=\"{}\",headers=\"{}\",signature=\"{}\"",
        key_id_for(actor_uri),
        SIGNED_HEADERS,
        signature_b64
    );

    Ok(SignatureHeaders {
        host: host.to_string(),
        date,
        signature,
    })
}

/// RSA-SHA256 sign a string and base64-encode the result.
pub fn sign_string(private_key_pem: &str, data: &str) -> Result<String, AppError> {
    if private_key_pem.trim().is_empty() {
        return Err(AppError::KeyUnavailable("empty private key".to_string()));
    }

    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::KeyUnavailable(format!("Invalid private key: {}", e)))?;

    let signing_key = SigningKey::<Sha256>::new(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, data.as_bytes());
    Ok(BASE64.encode(signature.to_bytes()))
}

/// Verify a base64 RSA-SHA256 signature over `data`.
///
/// Every failure, including an empty or unparsable key, is
/// `AppError::InvalidSignature`.
pub fn verify_string(public_key_pem: &str, data: &str, signature_b64: &str) -> Result<(), AppError> {
    if public_key_pem.trim().is_empty() {
        return Err(AppError::InvalidSignature);
    }

    let public_key =
        RsaPublicKey::from_public_key_pem(public_key_pem).map_err(|_| AppError::InvalidSignature)?;
    let signature_bytes = BASE64
        .decode(signature_b64)
        .map_err(|_| AppError::InvalidSignature)?;
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| AppError::InvalidSignature)?;

    VerifyingKey::<Sha256>::new(public_key)
        .verify(data.as_bytes(), &signature)
        .map_err(|_| AppError::InvalidSignature)
}

/// Parsed Signature header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm, when the signer declared one
    pub algorithm: Option<String>,
    /// Signed header names, in declared order
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

impl ParsedSignature {
    /// Actor URI the key id belongs to.
    pub fn actor_uri(&self) -> &str {
        self.key_id.split('#').next().unwrap_or(&self.key_id)
    }
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",headers="...",signature="..."
/// ```
///
/// # Errors
/// `AppError::MalformedSignature` if `keyId`, `headers` or `signature` is missing.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect::<Vec<_>>(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    let missing = |field: &str| AppError::MalformedSignature(format!("Missing {}", field));

    let key_id = key_id.filter(|v| !v.is_empty()).ok_or_else(|| missing("keyId"))?;
    let headers = headers
        .filter(|v: &Vec<String>| !v.is_empty())
        .ok_or_else(|| missing("headers"))?;
    let signature = signature
        .filter(|v| !v.is_empty())
        .ok_or_else(|| missing("signature"))?;

    Ok(ParsedSignature {
        key_id,
        algorithm,
        headers,
        signature,
    })
}

/// Reject a Date header that is missing, unparsable, or outside `max_age`.
pub fn check_date(
    date: Option<&str>,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Result<DateTime<Utc>, AppError> {
    let date = date.ok_or(AppError::SignatureExpired)?;
    let parsed = DateTime::parse_from_rfc2822(date)
        .map_err(|_| AppError::SignatureExpired)?
        .with_timezone(&Utc);

    let window = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    let skew = now - parsed;
    if skew > window || -skew > window {
        return Err(AppError::SignatureExpired);
    }
    Ok(parsed)
}

/// An incoming request as seen by the verifier
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub method: &'a str,
    /// Path and query as received
    pub path: &'a str,
    pub headers: &'a http::HeaderMap,
    pub body: Option<&'a [u8]>,
}

impl<'a> InboundRequest<'a> {
    fn header(&self, name: &str) -> Result<Option<&'a str>, AppError> {
        match self.headers.get(name) {
            Some(value) => value
                .to_str()
                .map(Some)
                .map_err(|_| AppError::MalformedSignature(format!("Invalid {} header", name))),
            None => Ok(None),
        }
    }
}

/// Successful verification result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedOrigin {
    pub key_id: String,
    pub actor_uri: String,
    /// Signer's host, to be cross-checked against the activity's actor
    pub host: String,
}

/// Rebuild the canonical string from the signer's declared header list.
pub fn reconstruct_signing_string(
    request: &InboundRequest<'_>,
    headers: &[String],
) -> Result<String, AppError> {
    let mut parts = Vec::with_capacity(headers.len());

    for name in headers {
        let value = if name == "(request-target)" {
            format!("{} {}", request.method.to_lowercase(), request.path)
        } else {
            request
                .header(name)?
                .ok_or_else(|| {
                    AppError::MalformedSignature(format!("Missing signed header: {}", name))
                })?
                .to_string()
        };
        parts.push(format!("{}: {}", name, value));
    }

    Ok(parts.join("\n"))
}

/// Verify an incoming signed request
///
/// # Steps
/// 1. Date present and within `max_age` of `now`
/// 2. Signature header parses
/// 3. Canonical string rebuilt from the declared header list
/// 4. Signer key fetched through `keys`
/// 5. RSA-SHA256 verification
///
/// # Errors
/// - `SignatureExpired` for a missing or stale Date
/// - `MalformedSignature` for an unparsable Signature header
/// - `InvalidSignature` for any verification failure
pub async fn verify_request(
    request: &InboundRequest<'_>,
    keys: &dyn KeyResolver,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<VerifiedOrigin, AppError> {
    check_date(request.header("date")?, now, max_age)?;

    let signature_header = request
        .header("signature")?
        .ok_or_else(|| AppError::MalformedSignature("Missing Signature header".to_string()))?;
    let parsed = parse_signature_header(signature_header)?;

    if parsed.headers.iter().any(|h| h == "digest") {
        verify_digest(request)?;
    }

    let canonical = reconstruct_signing_string(request, &parsed.headers)?;
    let host = signer_host(&parsed.key_id)?;

    let public_key_pem = keys.get_public_key(parsed.actor_uri()).await.map_err(|e| {
        tracing::warn!(key_id = %parsed.key_id, error = %e, "Failed to resolve signer key");
        AppError::InvalidSignature
    })?;

    verify_string(&public_key_pem, &canonical, &parsed.signature)?;

    Ok(VerifiedOrigin {
        actor_uri: parsed.actor_uri().to_string(),
        key_id: parsed.key_id,
        host,
    })
}

fn verify_digest(request: &InboundRequest<'_>) -> Result<(), AppError> {
    let digest = request
        .header("digest")?
        .ok_or_else(|| AppError::MalformedSignature("Missing Digest header".to_string()))?;
    let expected = generate_digest(request.body.unwrap_or_default());
    if digest != expected {
        return Err(AppError::InvalidSignature);
    }
    Ok(())
}

/// Host component of a key id.
pub fn signer_host(key_id: &str) -> Result<String, AppError> {
    let actor_url = key_id.split('#').next().unwrap_or(key_id);
    let parsed = url::Url::parse(actor_url)
        .map_err(|e| AppError::MalformedSignature(format!("Invalid keyId: {}", e)))?;
    parsed
        .host_str()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| AppError::MalformedSignature("Missing host in keyId".to_string()))
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}
