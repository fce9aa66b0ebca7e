//! Claim audit helpers: IP hashing, user-agent truncation, rate limiting.

use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::SqliteConnection;
use std::time::Duration;

use crate::config::ClaimConfig;
use crate::ledger::types::now_secs;
use crate::ledger::{LedgerResult, LedgerStore};

/// Environment variable holding the IP hashing secret.
pub const IP_HASH_SECRET_ENV_VAR: &str = "VOUCHER_IP_HASH_SECRET";

/// Builds the privacy-preserving fields of a claim audit row and enforces
/// the per-window attempt limit.
#[derive(Clone)]
pub struct ClaimAuditor {
    secret: String,
    user_agent_max_len: usize,
    rate_limit: u32,
    window: Duration,
}

impl ClaimAuditor {
    pub fn new(config: &ClaimConfig, secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            user_agent_max_len: config.user_agent_max_len,
            rate_limit: config.rate_limit_per_window,
            window: Duration::from_secs(config.rate_limit_window_secs),
        }
    }

    /// Secret from `VOUCHER_IP_HASH_SECRET`. Without it a random secret is
    /// generated, so hashes are not comparable across restarts.
    pub fn from_env(config: &ClaimConfig) -> Self {
        let secret = match std::env::var(IP_HASH_SECRET_ENV_VAR) {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                tracing::warn!(
                    env = IP_HASH_SECRET_ENV_VAR,
                    "IP hash secret not set; using a per-process random secret"
                );
                alloy::hex::encode(rand::thread_rng().gen::<[u8; 32]>())
            }
        };
        Self::new(config, secret)
    }

    /// `sha256(ip + secret)` as lowercase hex.
    pub fn hash_ip(&self, ip: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(ip.as_bytes());
        hasher.update(self.secret.as_bytes());
        alloy::hex::encode(hasher.finalize())
    }

    /// Cut to the configured length on a char boundary.
    pub fn truncate_user_agent(&self, user_agent: &str) -> String {
        user_agent.chars().take(self.user_agent_max_len).collect()
    }

    pub fn rate_limit_enabled(&self) -> bool {
        self.rate_limit > 0
    }

    /// Whether another attempt from this email or IP hash is over the limit.
    pub async fn is_rate_limited(
        &self,
        store: &LedgerStore,
        conn: &mut SqliteConnection,
        email: Option<&str>,
        ip_hash: Option<&str>,
    ) -> LedgerResult<bool> {
        if !self.rate_limit_enabled() || (email.is_none() && ip_hash.is_none()) {
            return Ok(false);
        }
        let since = now_secs() - self.window.as_secs() as i64;
        let recent = store
            .recent_claim_requests(conn, email, ip_hash, since)
            .await?;
        Ok(recent >= i64::from(self.rate_limit))
    }
}

impl std::fmt::Debug for ClaimAuditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimAuditor")
            .field("user_agent_max_len", &self.user_agent_max_len)
            .field("rate_limit", &self.rate_limit)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auditor(limit: u32) -> ClaimAuditor {
        let config = ClaimConfig {
            rate_limit_per_window: limit,
            user_agent_max_len: 8,
            ..Default::default()
        };
        ClaimAuditor::new(&config, "pepper")
    }

    #[test]
    fn test_hash_ip_is_salted() {
        let a = auditor(0);
        let b = ClaimAuditor::new(&ClaimConfig::default(), "other");

        let hash = a.hash_ip("203.0.113.7");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, a.hash_ip("203.0.113.7"));
        assert_ne!(hash, b.hash_ip("203.0.113.7"));
    }

    #[test]
    fn test_truncate_user_agent() {
        let a = auditor(0);
        assert_eq!(a.truncate_user_agent("Mozilla/5.0 (X11)"), "Mozilla/");
        assert_eq!(a.truncate_user_agent("curl"), "curl");
        assert_eq!(a.truncate_user_agent("ééééééééé").chars().count(), 8);
    }

    #[test]
    fn test_debug_hides_secret() {
        assert!(!format!("{:?}", auditor(3)).contains("pepper"));
    }

    #[tokio::test]
    async fn test_disabled_limit_never_limits() {
        let store = LedgerStore::new(crate::ledger::LedgerPool::in_memory().await.unwrap());
        let mut conn = store.acquire().await.unwrap();
        let limited = auditor(0)
            .is_rate_limited(&store, &mut conn, Some("a@x.io"), Some("h"))
            .await
            .unwrap();
        assert!(!limited);
    }
}
