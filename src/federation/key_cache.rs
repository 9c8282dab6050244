//! Public Key Caching
//!
//! Resolves remote actors' public keys for inbound verification and caches
//! them to reduce remote requests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::registry::KeyResolver;
use crate::error::AppError;

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve actor host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(
            "No DNS records for actor host".to_string(),
        ));
    }

    Ok(())
}

/// Extract and validate remote actor domain from an actor URL or key ID URL.
///
/// This rejects non-HTTP(S) URLs and obvious local/private hosts.
pub fn extract_actor_domain(actor_or_key_id: &str) -> Result<String, AppError> {
    let actor_url = actor_or_key_id.split('#').next().unwrap_or(actor_or_key_id);
    let parsed = url::Url::parse(actor_url)
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported actor URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in actor URL".to_string()))?
        .to_ascii_lowercase();

    if is_disallowed_host(&host) {
        return Err(AppError::Forbidden);
    }

    Ok(host)
}

/// Fetch an actor document and return its `publicKey.publicKeyPem`.
pub async fn fetch_public_key(
    actor_uri: &str,
    http_client: &reqwest::Client,
) -> Result<String, AppError> {
    // Validate actor URL/domain before any network traffic.
    let actor_domain = extract_actor_domain(actor_uri)?;
    let parsed_actor_url = url::Url::parse(actor_uri)
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;
    let actor_port = parsed_actor_url
        .port_or_known_default()
        .ok_or_else(|| AppError::Validation("Missing port in actor URL".to_string()))?;

    // Hosts that look public but resolve internally are rejected too.
    validate_resolved_host_ips(&actor_domain, actor_port).await?;

    let response = http_client
        .get(actor_uri)
        .header("Accept", "application/activity+json")
        .send()
        .await
        .map_err(|e| AppError::Federation(format!("Failed to fetch actor: {}", e)))?;

    if !response.status().is_success() {
        return Err(AppError::Federation(format!(
            "Failed to fetch actor: HTTP {}",
            response.status()
        )));
    }

    let actor: serde_json::Value = response
        .json()
        .await
        .map_err(|e| AppError::Federation(format!("Failed to parse actor: {}", e)))?;

    public_key_pem_of(&actor)
}

fn public_key_pem_of(actor: &serde_json::Value) -> Result<String, AppError> {
    actor
        .get("publicKey")
        .and_then(|key| key.get("publicKeyPem"))
        .and_then(|pem| pem.as_str())
        .filter(|pem| !pem.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Federation("Missing publicKeyPem in actor".to_string()))
}

/// Cached public key entry
#[derive(Debug, Clone)]
struct CachedKey {
    pem: String,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedKey {
    fn is_valid(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// Public key cache
///
/// Thread-safe cache for remote actor public keys, keyed by actor URI.
pub struct PublicKeyCache {
    cache: Arc<RwLock<HashMap<String, CachedKey>>>,
    http_client: reqwest::Client,
    default_ttl: Duration,
}

impl PublicKeyCache {
    /// Create new public key cache
    ///
    /// # Arguments
    /// * `http_client` - HTTP client for fetching actor documents
    /// * `default_ttl` - TTL for cached keys (default: 1 hour)
    pub fn new(http_client: reqwest::Client, default_ttl: Option<Duration>) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            http_client,
            default_ttl: default_ttl.unwrap_or(Duration::from_secs(3600)),
        }
    }

    /// Get public key for an actor
    ///
    /// Checks cache first, fetches from remote if not cached or expired.
    pub async fn get(&self, actor_uri: &str) -> Result<String, AppError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(actor_uri) {
                if cached.is_valid() {
                    tracing::debug!("Public key cache hit for {}", actor_uri);
                    return Ok(cached.pem.clone());
                }
                tracing::debug!("Public key cache expired for {}", actor_uri);
            }
        }

        tracing::debug!("Public key cache miss for {}, fetching...", actor_uri);
        let pem = fetch_public_key(actor_uri, &self.http_client).await?;
        self.insert(actor_uri, pem.clone()).await;

        Ok(pem)
    }

    /// Seed or replace an entry
    pub async fn insert(&self, actor_uri: &str, pem: String) {
        let mut cache = self.cache.write().await;
        cache.insert(
            actor_uri.to_string(),
            CachedKey {
                pem,
                cached_at: Instant::now(),
                ttl: self.default_ttl,
            },
        );
    }

    /// Invalidate a cached key
    ///
    /// Useful when a key is known to be invalid or rotated.
    pub async fn invalidate(&self, actor_uri: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(actor_uri);
        tracing::debug!("Invalidated public key cache for {}", actor_uri);
    }

    /// Clear all cached keys
    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        cache.clear();
        tracing::debug!("Cleared all public key cache entries");
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.read().await;
        let total = cache.len();
        let valid = cache.values().filter(|v| v.is_valid()).count();

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
        }
    }

    /// Prune expired entries
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, v| v.is_valid());
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!("Pruned {} expired public key cache entries", removed);
        }
    }
}

#[async_trait]
impl KeyResolver for PublicKeyCache {
    async fn get_public_key(&self, actor_uri: &str) -> Result<String, AppError> {
        self.get(actor_uri).await
    }
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
}
