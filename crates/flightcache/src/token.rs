//! The token-cache application of the expiring store.
//!
//! Stores `{token, payload, expires_at, refresh_token}` records whose
//! freshness is driven by the token's own expiry: the precomputed
//! `expires_at` if present, otherwise the JWT `exp` claim, otherwise a
//! fixed fallback lifetime.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::CacheConfig;
use crate::error::StoreRejected;
use crate::key::CacheKey;
use crate::store::{KeyedStore, TlruStore};

/// Fallback lifetime for tokens without a usable expiry.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// A cached token record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    /// Decoded claims, if the producer already had them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Unix timestamp after which the token must no longer be used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl TokenEntry {
    pub fn new(token: impl Into<String>) -> Self {
        TokenEntry {
            token: token.into(),
            payload: None,
            expires_at: None,
            refresh_token: None,
        }
    }

    /// The absolute unix expiry of this entry.
    ///
    /// Prefers the precomputed `expires_at`; otherwise reads the `exp`
    /// claim from the stored payload or, failing that, from the token
    /// itself.
    pub fn expiry_timestamp(&self) -> Option<u64> {
        if let Some(ts) = self.expires_at {
            return Some(ts);
        }
        let claims = match &self.payload {
            Some(payload) => payload.clone(),
            None => decode_jwt_payload(&self.token).ok()?,
        };
        claims.get("exp").and_then(Value::as_u64)
    }
}

/// An error decoding a JWT's claims.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("invalid JWT: not enough segments")]
    NotEnoughSegments,
    #[error("invalid JWT payload: {0}")]
    Malformed(String),
}

/// Decodes a JWT's payload segment.
///
/// Does NOT verify the signature; intended only to read claims like `exp`.
pub fn decode_jwt_payload(token: &str) -> Result<Value, TokenError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or(TokenError::NotEnoughSegments)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| TokenError::Malformed(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| TokenError::Malformed(e.to_string()))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The default time-to-use for token entries.
///
/// Returns the absolute deadline matching the token's own expiry, falling
/// back to [`DEFAULT_TOKEN_TTL`] when none can be determined.
pub fn jwt_exp_ttu(key: &CacheKey, entry: &TokenEntry, now: Instant) -> Instant {
    match entry.expiry_timestamp() {
        Some(deadline) => now + Duration::from_secs(deadline.saturating_sub(unix_now())),
        None => {
            tracing::warn!(%key, "token has no usable expiry, using default TTL");
            now + DEFAULT_TOKEN_TTL
        }
    }
}

/// A typed token store over the same expiring-map machinery.
///
/// Entries expire when the time-to-use function says so; additionally,
/// `get` re-checks the entry's own `expires_at` and evicts lazily, so a
/// token that expired a second ago is reported absent even if the store
/// has not reaped it yet.
#[derive(Debug, Clone)]
pub struct TokenCache {
    store: TlruStore<TokenEntry>,
}

impl TokenCache {
    /// A token cache using [`jwt_exp_ttu`] for freshness.
    pub fn new(config: &CacheConfig) -> Self {
        TokenCache {
            store: TlruStore::new(config, jwt_exp_ttu),
        }
    }

    /// A token cache with a custom time-to-use function.
    pub fn with_ttu(
        config: &CacheConfig,
        ttu: impl Fn(&CacheKey, &TokenEntry, Instant) -> Instant + Send + Sync + 'static,
    ) -> Self {
        TokenCache {
            store: TlruStore::new(config, ttu),
        }
    }

    /// The key for a provider's token of the given type, e.g.
    /// `("keycloak-prod", "access")`.
    pub fn entry_key(name: &str, token_type: &str) -> CacheKey {
        CacheKey::of(format!("{name}:{token_type}"))
    }

    pub fn get(&self, key: &CacheKey) -> Option<TokenEntry> {
        let entry = self.store.get(key)?;
        if entry
            .expiry_timestamp()
            .is_some_and(|ts| ts <= unix_now())
        {
            // expired by the token's own clock: evict and report absent
            self.store.delete(key);
            return None;
        }
        Some(entry)
    }

    pub fn set(&self, key: &CacheKey, entry: TokenEntry) -> Result<(), StoreRejected> {
        self.store.set(key, entry)
    }

    pub fn delete(&self, key: &CacheKey) {
        self.store.delete(key);
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.store.keys()
    }

    pub fn clear(&self) {
        self.store.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt_with_claims(claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn test_decode_jwt_payload() {
        let claims = serde_json::json!({"exp": 1234, "sub": "alice"});
        let decoded = decode_jwt_payload(&jwt_with_claims(&claims)).unwrap();
        assert_eq!(decoded, claims);

        assert_eq!(
            decode_jwt_payload("no-segments"),
            Err(TokenError::NotEnoughSegments)
        );
        assert!(matches!(
            decode_jwt_payload("a.!!!.c"),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn test_expiry_prefers_precomputed_timestamp() {
        let claims = serde_json::json!({"exp": 100});
        let mut entry = TokenEntry::new(jwt_with_claims(&claims));
        assert_eq!(entry.expiry_timestamp(), Some(100));

        entry.expires_at = Some(50);
        assert_eq!(entry.expiry_timestamp(), Some(50));

        let opaque = TokenEntry::new("not-a-jwt");
        assert_eq!(opaque.expiry_timestamp(), None);
    }

    #[test]
    fn test_expired_entry_is_absent_on_next_get() {
        let cache = TokenCache::new(&CacheConfig::default());
        let key = TokenCache::entry_key("keycloak", "access");

        let mut entry = TokenEntry::new("opaque-token");
        entry.expires_at = Some(unix_now() - 1);
        cache.set(&key, entry).unwrap();

        assert_eq!(cache.get(&key), None);
    }

    #[test]
    fn test_fresh_entry_roundtrips() {
        let cache = TokenCache::new(&CacheConfig::default());
        let key = TokenCache::entry_key("keycloak", "access");

        let mut entry = TokenEntry::new("opaque-token");
        entry.expires_at = Some(unix_now() + 60);
        entry.refresh_token = Some("refresh".into());
        cache.set(&key, entry.clone()).unwrap();

        assert_eq!(cache.get(&key), Some(entry));
        assert_eq!(cache.keys().len(), 1);

        cache.delete(&key);
        assert_eq!(cache.get(&key), None);
    }

    #[test]
    fn test_token_without_expiry_uses_fallback_ttl() {
        // a token we cannot read an expiry from is still cached, under the
        // default lifetime
        let cache = TokenCache::new(&CacheConfig::default());
        let key = TokenCache::entry_key("keycloak", "access");

        cache.set(&key, TokenEntry::new("opaque-token")).unwrap();
        assert!(cache.get(&key).is_some());
    }

    #[test]
    fn test_clear_drops_all_entries() {
        let cache = TokenCache::new(&CacheConfig::default());
        let mut entry = TokenEntry::new("opaque-token");
        entry.expires_at = Some(unix_now() + 60);

        cache
            .set(&TokenCache::entry_key("a", "access"), entry.clone())
            .unwrap();
        cache
            .set(&TokenCache::entry_key("b", "access"), entry)
            .unwrap();
        cache.clear();
        assert_eq!(cache.get(&TokenCache::entry_key("a", "access")), None);
        assert_eq!(cache.get(&TokenCache::entry_key("b", "access")), None);
    }
}
