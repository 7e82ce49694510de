//! Per-endpoint credential cache backing Kubernetes impersonation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use common::model::{Endpoint, EndpointId, SecurityContext};
use metrics::counter;
use tokio::sync::Mutex;

use crate::stores::{IssuedToken, TokenIssuer};

/// Caches short-lived cluster tokens for one endpoint, keyed by the calling
/// user so backend audit logs attribute actions to the real principal.
pub struct TokenCache {
    issuer: Arc<dyn TokenIssuer>,
    entries: Mutex<HashMap<i64, IssuedToken>>,
}

impl TokenCache {
    pub fn new(issuer: Arc<dyn TokenIssuer>) -> Self {
        Self {
            issuer,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get-or-create under the lock so concurrent requests for the same user
    /// never race to mint divergent tokens.
    pub async fn bearer_for(
        &self,
        endpoint: &Endpoint,
        ctx: &SecurityContext,
    ) -> anyhow::Result<String> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();

        if let Some(entry) = entries.get(&ctx.user_id) {
            if !entry.is_expired(now) {
                counter!("gateway_token_cache_total", "result" => "hit").increment(1);
                return Ok(entry.token.clone());
            }
        }

        counter!("gateway_token_cache_total", "result" => "miss").increment(1);
        let issued = self.issuer.issue(endpoint, ctx).await?;
        let token = issued.token.clone();
        entries.insert(ctx.user_id, issued);
        Ok(token)
    }
}

/// Owns one token cache per endpoint. Outlives individual proxy
/// constructions; a proxy built for a request reuses the endpoint's cache.
#[derive(Clone)]
pub struct TokenCacheRegistry {
    issuer: Arc<dyn TokenIssuer>,
    caches: Arc<Mutex<HashMap<EndpointId, Arc<TokenCache>>>>,
}

impl TokenCacheRegistry {
    pub fn new(issuer: Arc<dyn TokenIssuer>) -> Self {
        Self {
            issuer,
            caches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn cache_for(&self, endpoint: EndpointId) -> Arc<TokenCache> {
        let mut caches = self.caches.lock().await;
        caches
            .entry(endpoint)
            .or_insert_with(|| Arc::new(TokenCache::new(self.issuer.clone())))
            .clone()
    }
}
