//! Configuration validation.
//!
//! Serde handles syntax; this pass checks value ranges and cross-field rules.
//! Every violation is reported, not just the first.

use alloy::primitives::Address;
use std::fmt;

use crate::config::schema::{SettlementConfig, SettlementMode, PLACEHOLDER_ADMIN_KEY};

/// A single semantic violation, keyed by the offending field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &SettlementConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.database.url.trim().is_empty() {
        errors.push(ValidationError::new("database.url", "must not be empty"));
    }
    if config.database.max_connections == 0 {
        errors.push(ValidationError::new(
            "database.max_connections",
            "must be at least 1",
        ));
    }
    if config.database.url.contains(":memory:") && config.database.max_connections != 1 {
        errors.push(ValidationError::new(
            "database.max_connections",
            "in-memory databases require exactly one connection",
        ));
    }

    let chain = &config.blockchain;
    if chain.enabled {
        if chain.rpc_url.trim().is_empty() {
            errors.push(ValidationError::new("blockchain.rpc_url", "must not be empty"));
        } else if chain.rpc_url.parse::<url::Url>().is_err() {
            errors.push(ValidationError::new(
                "blockchain.rpc_url",
                format!("'{}' is not a valid URL", chain.rpc_url),
            ));
        }
        if chain.contract_address.parse::<Address>().is_err() {
            errors.push(ValidationError::new(
                "blockchain.contract_address",
                format!("'{}' is not a 20-byte hex address", chain.contract_address),
            ));
        }
        if chain.chain_id == 0 {
            errors.push(ValidationError::new("blockchain.chain_id", "must be non-zero"));
        }
    }
    if chain.rpc_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "blockchain.rpc_timeout_secs",
            "must be greater than 0",
        ));
    }
    if chain.receipt_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "blockchain.receipt_timeout_secs",
            "must be greater than 0",
        ));
    }
    if chain.receipt_poll_interval_ms == 0 {
        errors.push(ValidationError::new(
            "blockchain.receipt_poll_interval_ms",
            "must be greater than 0",
        ));
    }
    if chain.fallback_gas_limit < 21_000 {
        errors.push(ValidationError::new(
            "blockchain.fallback_gas_limit",
            "must cover the 21000 intrinsic gas",
        ));
    }

    if config.queue.poll_interval_secs == 0 {
        errors.push(ValidationError::new(
            "queue.poll_interval_secs",
            "must be greater than 0",
        ));
    }
    if config.queue.max_backoff_secs < config.queue.poll_interval_secs {
        errors.push(ValidationError::new(
            "queue.max_backoff_secs",
            "must not be below queue.poll_interval_secs",
        ));
    }

    if config.claims.max_concurrent_sync_mints == 0 {
        errors.push(ValidationError::new(
            "claims.max_concurrent_sync_mints",
            "must be at least 1",
        ));
    }
    // Other writers wait on the lock for at most busy_timeout while an
    // immediate claim holds it across the chain round trips.
    if config.claims.settlement == SettlementMode::Immediate {
        let budget = chain.sync_mint_budget_secs(config.claims.wait_for_receipt);
        if config.database.busy_timeout_secs <= budget {
            errors.push(ValidationError::new(
                "database.busy_timeout_secs",
                format!(
                    "must exceed {}s, the longest an immediate claim holds the writer lock",
                    budget
                ),
            ));
        }
    }
    if config.claims.rate_limit_per_window > 0 && config.claims.rate_limit_window_secs == 0 {
        errors.push(ValidationError::new(
            "claims.rate_limit_window_secs",
            "must be greater than 0 when rate limiting is enabled",
        ));
    }

    if config.custody.provider.trim().is_empty() || config.custody.provider == "external" {
        errors.push(ValidationError::new(
            "custody.provider",
            "must be a non-empty tag other than 'external'",
        ));
    }

    if config.admin.enabled && config.admin.api_key == PLACEHOLDER_ADMIN_KEY {
        errors.push(ValidationError::new(
            "admin.api_key",
            "placeholder key must be replaced when the admin API is enabled",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
