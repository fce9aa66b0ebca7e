//! Claim orchestration: validate, issue, settle, audit.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::claims::audit::ClaimAuditor;
use crate::config::{ClaimConfig, SettlementMode};
use crate::ledger::types::now_secs;
use crate::ledger::{ClaimCode, ClaimRequestRecord, LedgerError, TxKind, VoucherType};
use crate::observability::metrics;
use crate::vouchers::{ServiceError, VoucherService};

/// Every claim attempt ends in exactly one of these, and that value is what
/// the audit trail stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome {
    Ok,
    RateLimited,
    Used,
    Expired,
    Inactive,
    LimitReached,
    MintFailed,
    NotFound,
}

impl ClaimOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimOutcome::Ok => "ok",
            ClaimOutcome::RateLimited => "rate_limited",
            ClaimOutcome::Used => "used",
            ClaimOutcome::Expired => "expired",
            ClaimOutcome::Inactive => "inactive",
            ClaimOutcome::LimitReached => "limit_reached",
            ClaimOutcome::MintFailed => "mint_failed",
            ClaimOutcome::NotFound => "not_found",
        }
    }
}

impl fmt::Display for ClaimOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claim failure. Rejections are expected business outcomes; `Failed`
/// means issuance or settlement broke and the ledger was rolled back.
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("Claim rejected: {0}")]
    Rejected(ClaimOutcome),

    #[error("Claim failed: {0}")]
    Failed(#[from] ServiceError),
}

impl ClaimError {
    pub fn outcome(&self) -> ClaimOutcome {
        match self {
            ClaimError::Rejected(outcome) => *outcome,
            ClaimError::Failed(_) => ClaimOutcome::MintFailed,
        }
    }
}

impl From<LedgerError> for ClaimError {
    fn from(e: LedgerError) -> Self {
        ClaimError::Failed(ServiceError::Ledger(e))
    }
}

/// What is being claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimTarget {
    /// Single-use QR code.
    Code(String),
    /// Shareable voucher link.
    Slug(String),
}

impl fmt::Display for ClaimTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimTarget::Code(code) => write!(f, "code:{}", code),
            ClaimTarget::Slug(slug) => write!(f, "slug:{}", slug),
        }
    }
}

/// Client context recorded with every attempt.
#[derive(Debug, Clone, Default)]
pub struct ClaimContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Successful claim.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimReceipt {
    pub voucher_type_id: Uuid,
    pub voucher_slug: String,
    pub wallet_id: Uuid,
    pub wallet_address: String,
    pub settlement: SettlementMode,
    /// Queued intent (deferred settlement).
    pub tx_id: Option<Uuid>,
    /// Broadcast transaction (immediate settlement).
    pub tx_hash: Option<String>,
}

/// Vouchers granted per successful claim.
const CLAIM_AMOUNT: i64 = 1;

/// Turns a claim request into a ledger credit plus its on-chain settlement.
pub struct ClaimOrchestrator {
    service: Arc<VoucherService>,
    auditor: ClaimAuditor,
    settlement: SettlementMode,
    wait_for_receipt: bool,
}

impl ClaimOrchestrator {
    pub fn new(service: Arc<VoucherService>, auditor: ClaimAuditor, config: &ClaimConfig) -> Self {
        Self {
            service,
            auditor,
            settlement: config.settlement,
            wait_for_receipt: config.wait_for_receipt,
        }
    }

    pub fn service(&self) -> &Arc<VoucherService> {
        &self.service
    }

    pub fn auditor(&self) -> &ClaimAuditor {
        &self.auditor
    }

    /// Process one claim and append its audit row, whatever the outcome.
    pub async fn claim(
        &self,
        user_id: Uuid,
        target: &ClaimTarget,
        ctx: &ClaimContext,
    ) -> Result<ClaimReceipt, ClaimError> {
        let mut record = ClaimRequestRecord {
            ip_hash: ctx.ip.as_deref().map(|ip| self.auditor.hash_ip(ip)),
            user_agent: ctx
                .user_agent
                .as_deref()
                .map(|ua| self.auditor.truncate_user_agent(ua)),
            email: ctx.email.clone(),
            phone: ctx.phone.clone(),
            ..Default::default()
        };

        let result = self.process(user_id, target, &mut record).await;

        let outcome = match &result {
            Ok(_) => ClaimOutcome::Ok,
            Err(e) => e.outcome(),
        };
        record.result = outcome.as_str().to_string();
        self.audit(&record).await;
        metrics::record_claim(outcome.as_str());

        match &result {
            Ok(receipt) => tracing::info!(
                user_id = %user_id,
                target = %target,
                wallet_id = %receipt.wallet_id,
                tx_id = ?receipt.tx_id,
                tx_hash = ?receipt.tx_hash,
                "Claim succeeded"
            ),
            Err(ClaimError::Rejected(outcome)) => {
                tracing::info!(user_id = %user_id, target = %target, outcome = %outcome, "Claim rejected")
            }
            Err(e) => tracing::error!(user_id = %user_id, target = %target, error = %e, "Claim failed"),
        }

        result
    }

    async fn audit(&self, record: &ClaimRequestRecord) {
        let store = self.service.store();
        let written = match store.acquire().await {
            Ok(mut conn) => store.log_claim_request(&mut conn, record).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::error!(result = %record.result, error = %e, "Failed to write claim audit row");
        }
    }

    async fn process(
        &self,
        user_id: Uuid,
        target: &ClaimTarget,
        record: &mut ClaimRequestRecord,
    ) -> Result<ClaimReceipt, ClaimError> {
        let store = self.service.store();

        {
            let mut conn = store.acquire().await?;
            let limited = self
                .auditor
                .is_rate_limited(
                    store,
                    &mut conn,
                    record.email.as_deref(),
                    record.ip_hash.as_deref(),
                )
                .await?;
            if limited {
                return Err(ClaimError::Rejected(ClaimOutcome::RateLimited));
            }
        }

        // Taken before the transaction so queued claimants hold no lock.
        let _permit = match self.settlement {
            SettlementMode::Immediate => Some(self.service.mint_permit().await?),
            SettlementMode::Deferred => None,
        };

        let mut tx = store.begin().await?;

        let (code, voucher) = match target {
            ClaimTarget::Code(code) => {
                let code: ClaimCode = store
                    .claim_code(&mut tx, code)
                    .await?
                    .ok_or(ClaimError::Rejected(ClaimOutcome::NotFound))?;
                record.claim_code_id = Some(code.id);
                record.voucher_type_id = Some(code.voucher_type_id);

                if code.is_used() {
                    return Err(ClaimError::Rejected(ClaimOutcome::Used));
                }
                if code.is_expired(now_secs()) {
                    return Err(ClaimError::Rejected(ClaimOutcome::Expired));
                }
                let voucher = store
                    .voucher_type(&mut tx, code.voucher_type_id)
                    .await?
                    .ok_or(ClaimError::Rejected(ClaimOutcome::NotFound))?;
                (Some(code), voucher)
            }
            ClaimTarget::Slug(slug) => {
                let voucher: VoucherType = store
                    .voucher_by_slug(&mut tx, slug)
                    .await?
                    .ok_or(ClaimError::Rejected(ClaimOutcome::NotFound))?;
                record.voucher_type_id = Some(voucher.id);
                (None, voucher)
            }
        };

        if !voucher.active {
            return Err(ClaimError::Rejected(ClaimOutcome::Inactive));
        }

        let allowance = self
            .service
            .can_user_claim_in(&mut tx, user_id, voucher.id, CLAIM_AMOUNT)
            .await?;
        if !allowance.allowed {
            tracing::debug!(
                user_id = %user_id,
                claimed = allowance.claimed,
                limit = allowance.limit,
                "Per-user claim limit reached"
            );
            return Err(ClaimError::Rejected(ClaimOutcome::LimitReached));
        }

        if let Some(code) = &code {
            if !store.consume_claim_code(&mut tx, code.id, user_id).await? {
                return Err(ClaimError::Rejected(ClaimOutcome::Used));
            }
        }

        let (receipt, custodial) = match self.settlement {
            SettlementMode::Deferred => {
                let issued = self
                    .service
                    .issue_in(&mut tx, user_id, voucher.id, CLAIM_AMOUNT)
                    .await?;
                let enqueued = store
                    .enqueue_intent(
                        &mut tx,
                        TxKind::Mint1155,
                        voucher.id,
                        issued.wallet.id,
                        CLAIM_AMOUNT,
                    )
                    .await;
                let intent = self.service.note_rollback(user_id, &issued, enqueued)?;
                let receipt = ClaimReceipt {
                    voucher_type_id: voucher.id,
                    voucher_slug: voucher.slug.clone(),
                    wallet_id: issued.wallet.id,
                    wallet_address: issued.wallet.address.to_hex(),
                    settlement: self.settlement,
                    tx_id: Some(intent.id),
                    tx_hash: None,
                };
                (receipt, issued)
            }
            SettlementMode::Immediate => {
                let custodial = self
                    .service
                    .ensure_custodial_wallet_in(&mut tx, user_id)
                    .await?;
                let minted = self
                    .service
                    .mint_in(
                        &mut tx,
                        custodial.wallet.id,
                        voucher.id,
                        CLAIM_AMOUNT,
                        self.wait_for_receipt,
                    )
                    .await;
                let tx_hash = self.service.note_rollback(user_id, &custodial, minted)?;
                let receipt = ClaimReceipt {
                    voucher_type_id: voucher.id,
                    voucher_slug: voucher.slug.clone(),
                    wallet_id: custodial.wallet.id,
                    wallet_address: custodial.wallet.address.to_hex(),
                    settlement: self.settlement,
                    tx_id: None,
                    tx_hash: Some(tx_hash),
                };
                (receipt, custodial)
            }
        };

        self.service
            .note_rollback(user_id, &custodial, tx.commit().await)
            .map_err(LedgerError::from)?;
        Ok(receipt)
    }
}
