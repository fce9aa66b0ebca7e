//! Balance ledger service: one database transaction per business event.

use alloy::primitives::U256;
use serde::Serialize;
use sqlx::SqliteConnection;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};
use uuid::Uuid;

use crate::blockchain::{hash_hex, BlockchainError, TokenChain};
use crate::ledger::{
    Debit, LedgerError, LedgerStore, NewWallet, OnchainTx, TransferReason, Transition, TxKind,
    VoucherType, Wallet, WalletAddress, EXTERNAL_PROVIDER,
};
use crate::vouchers::custody::{CustodyError, WalletProvisioner};

/// SQLite admits one writer, and a synchronous mint holds it from credit to
/// commit, so only one synchronous mint can make progress at a time.
pub const SQLITE_WRITER_SLOTS: usize = 1;

/// Errors surfaced by the voucher service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Chain(#[from] BlockchainError),

    #[error(transparent)]
    Custody(#[from] CustodyError),

    #[error("Synchronous mint capacity closed")]
    Closed(#[from] AcquireError),
}

/// Result of a per-user claim limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClaimAllowance {
    pub allowed: bool,
    pub claimed: i64,
    pub limit: i64,
}

/// A custodial wallet resolved inside a transaction.
#[derive(Debug, Clone)]
pub struct CustodialWallet {
    pub wallet: Wallet,
    /// The provisioner created the key for this call. If the transaction
    /// rolls back, the key outlives the wallet row.
    pub provisioned: bool,
}

/// Outcome of an export to an external wallet.
#[derive(Debug, Clone, Serialize)]
pub struct ExportReceipt {
    pub tx_id: Uuid,
    pub to_address: String,
    pub remaining: i64,
}

/// Transactional voucher operations.
///
/// Every public method opens and commits its own ledger transaction. The
/// `*_in` variants run on a caller-supplied connection so several of them can
/// share one transaction.
pub struct VoucherService {
    store: LedgerStore,
    chain: Option<Arc<dyn TokenChain>>,
    provisioner: Arc<dyn WalletProvisioner>,
    chain_id: u64,
    sync_mints: Semaphore,
}

impl VoucherService {
    pub fn new(
        store: LedgerStore,
        chain: Option<Arc<dyn TokenChain>>,
        provisioner: Arc<dyn WalletProvisioner>,
        chain_id: u64,
        max_concurrent_sync_mints: usize,
    ) -> Self {
        let slots = max_concurrent_sync_mints.clamp(1, SQLITE_WRITER_SLOTS);
        if slots != max_concurrent_sync_mints {
            tracing::warn!(
                requested = max_concurrent_sync_mints,
                slots,
                "Synchronous mints share the single SQLite writer; clamping concurrency"
            );
        }
        Self {
            store,
            chain,
            provisioner,
            chain_id,
            sync_mints: Semaphore::new(slots),
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn chain(&self) -> Result<&Arc<dyn TokenChain>, ServiceError> {
        self.chain.as_ref().ok_or_else(|| {
            BlockchainError::NotAvailable("blockchain integration is disabled".to_string()).into()
        })
    }

    /// Wait for a synchronous mint slot. Take it before opening the ledger
    /// transaction that will hold the mint, so a second mint queues here
    /// instead of timing out on the writer lock.
    pub async fn mint_permit(&self) -> Result<SemaphorePermit<'_>, ServiceError> {
        Ok(self.sync_mints.acquire().await?)
    }

    /// Slots currently free for synchronous mints.
    pub fn available_mint_permits(&self) -> usize {
        self.sync_mints.available_permits()
    }

    async fn voucher_in(
        &self,
        conn: &mut SqliteConnection,
        voucher_type_id: Uuid,
    ) -> Result<VoucherType, ServiceError> {
        self.store
            .voucher_type(conn, voucher_type_id)
            .await?
            .ok_or_else(|| {
                LedgerError::ReferenceNotFound(format!("voucher type {}", voucher_type_id)).into()
            })
    }

    async fn wallet_in(
        &self,
        conn: &mut SqliteConnection,
        wallet_id: Uuid,
    ) -> Result<Wallet, ServiceError> {
        self.store
            .wallet(conn, wallet_id)
            .await?
            .ok_or_else(|| LedgerError::ReferenceNotFound(format!("wallet {}", wallet_id)).into())
    }

    /// The user's custodial wallet on the configured chain, created on first need.
    pub async fn ensure_custodial_wallet_in(
        &self,
        conn: &mut SqliteConnection,
        user_id: Uuid,
    ) -> Result<CustodialWallet, ServiceError> {
        if let Some(wallet) = self
            .store
            .custodial_wallet_for(conn, user_id, self.chain_id)
            .await?
        {
            return Ok(CustodialWallet {
                wallet,
                provisioned: false,
            });
        }

        let provisioned = self.provisioner.create_wallet(user_id).await?;
        let wallet = self
            .store
            .insert_wallet(
                conn,
                &NewWallet {
                    user_id,
                    provider: self.provisioner.provider().to_string(),
                    provider_ref: provisioned.provider_ref,
                    chain_id: self.chain_id,
                    address: provisioned.address,
                    exportable: provisioned.exportable,
                },
            )
            .await?;
        tracing::debug!(
            user_id = %user_id,
            provider_ref = %wallet.provider_ref,
            "Custodial wallet provisioned"
        );
        Ok(CustodialWallet {
            wallet,
            provisioned: true,
        })
    }

    /// Pass `result` through; on error, warn when `custodial` was provisioned
    /// in the transaction about to roll back, since its key is now orphaned.
    pub fn note_rollback<T, E: fmt::Display>(
        &self,
        user_id: Uuid,
        custodial: &CustodialWallet,
        result: Result<T, E>,
    ) -> Result<T, E> {
        if let Err(e) = &result {
            if custodial.provisioned {
                tracing::warn!(
                    user_id = %user_id,
                    provider = %custodial.wallet.provider,
                    provider_ref = %custodial.wallet.provider_ref,
                    address = %custodial.wallet.address,
                    error = %e,
                    "Transaction rolled back after provisioning; custodial key is orphaned"
                );
            }
        }
        result
    }

    /// Resolve or create the user's wallet and credit it.
    pub async fn issue_in(
        &self,
        conn: &mut SqliteConnection,
        user_id: Uuid,
        voucher_type_id: Uuid,
        amount: i64,
    ) -> Result<CustodialWallet, ServiceError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount).into());
        }
        let custodial = self.ensure_custodial_wallet_in(conn, user_id).await?;
        let credited = self
            .store
            .credit(conn, custodial.wallet.id, voucher_type_id, amount)
            .await;
        self.note_rollback(user_id, &custodial, credited)?;
        Ok(custodial)
    }

    /// Credit `amount` to the user's custodial wallet.
    pub async fn issue_voucher(
        &self,
        user_id: Uuid,
        voucher_type_id: Uuid,
        amount: i64,
    ) -> Result<Wallet, ServiceError> {
        let mut tx = self.store.begin().await?;
        let issued = self.issue_in(&mut tx, user_id, voucher_type_id, amount).await?;
        self.note_rollback(user_id, &issued, tx.commit().await)
            .map_err(LedgerError::from)?;
        let wallet = issued.wallet;

        tracing::info!(
            user_id = %user_id,
            wallet_id = %wallet.id,
            voucher_type_id = %voucher_type_id,
            amount,
            "Voucher issued"
        );
        Ok(wallet)
    }

    /// Credit and queue the matching mint in one transaction.
    pub async fn issue_and_enqueue(
        &self,
        user_id: Uuid,
        voucher_type_id: Uuid,
        amount: i64,
    ) -> Result<(Wallet, OnchainTx), ServiceError> {
        let mut tx = self.store.begin().await?;
        let issued = self.issue_in(&mut tx, user_id, voucher_type_id, amount).await?;
        let enqueued = self
            .store
            .enqueue_intent(
                &mut tx,
                TxKind::Mint1155,
                voucher_type_id,
                issued.wallet.id,
                amount,
            )
            .await;
        let intent = self.note_rollback(user_id, &issued, enqueued)?;
        self.note_rollback(user_id, &issued, tx.commit().await)
            .map_err(LedgerError::from)?;
        let wallet = issued.wallet;

        tracing::info!(
            user_id = %user_id,
            tx_id = %intent.id,
            amount,
            "Voucher issued, mint queued"
        );
        Ok((wallet, intent))
    }

    /// Debit a wallet and log the transfer.
    pub async fn debit_voucher(
        &self,
        wallet_id: Uuid,
        voucher_type_id: Uuid,
        amount: i64,
        reason: TransferReason,
        to_wallet_id: Option<Uuid>,
        pos_ref: Option<String>,
    ) -> Result<Uuid, ServiceError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount).into());
        }

        let mut tx = self.store.begin().await?;
        let transfer_id = self
            .store
            .debit(
                &mut tx,
                &Debit {
                    wallet_id,
                    voucher_type_id,
                    amount,
                    reason,
                    to_wallet_id,
                    pos_ref,
                },
            )
            .await?;
        tx.commit().await.map_err(LedgerError::from)?;

        tracing::info!(
            wallet_id = %wallet_id,
            voucher_type_id = %voucher_type_id,
            amount,
            reason = %reason,
            "Voucher debited"
        );
        Ok(transfer_id)
    }

    /// Queue an on-chain intent.
    pub async fn enqueue_onchain(
        &self,
        kind: TxKind,
        voucher_type_id: Uuid,
        to_wallet_id: Uuid,
        amount: i64,
    ) -> Result<OnchainTx, ServiceError> {
        let mut tx = self.store.begin().await?;
        let intent = self
            .store
            .enqueue_intent(&mut tx, kind, voucher_type_id, to_wallet_id, amount)
            .await?;
        tx.commit().await.map_err(LedgerError::from)?;

        tracing::debug!(tx_id = %intent.id, kind = %kind, "On-chain intent queued");
        Ok(intent)
    }

    /// Credit and mint on the caller's transaction. The intent row moves
    /// `queued → sent`, and on to `confirmed` when `wait` is set; any error
    /// leaves the caller to roll everything back.
    pub async fn mint_in(
        &self,
        conn: &mut SqliteConnection,
        wallet_id: Uuid,
        voucher_type_id: Uuid,
        amount: i64,
        wait: bool,
    ) -> Result<String, ServiceError> {
        let chain = self.chain()?.clone();
        let voucher = self.voucher_in(conn, voucher_type_id).await?;
        let wallet = self.wallet_in(conn, wallet_id).await?;

        self.store
            .credit(conn, wallet.id, voucher.id, amount)
            .await?;
        let intent = self
            .store
            .enqueue_intent(conn, TxKind::Mint1155, voucher.id, wallet.id, amount)
            .await?;

        let submission = chain
            .mint_to(
                wallet.address.0,
                voucher.token_id.0,
                U256::from(amount.unsigned_abs()),
                None,
            )
            .await?;
        let tx_hash = hash_hex(&submission.tx_hash);
        self.store
            .advance(
                conn,
                intent.id,
                Transition::Sent {
                    tx_hash: tx_hash.clone(),
                    nonce: submission.nonce,
                },
            )
            .await?;

        if wait {
            if let Err(e) = chain
                .wait_for_receipt(submission.tx_hash, chain.receipt_timeout())
                .await
            {
                tracing::warn!(
                    tx_hash = %tx_hash,
                    error = %e,
                    "Synchronous mint broadcast but not settled; ledger changes roll back"
                );
                return Err(e.into());
            }
            self.store
                .advance(
                    conn,
                    intent.id,
                    Transition::Confirmed {
                        gas_price: Some(submission.fee.recorded_price_native()),
                    },
                )
                .await?;
        }

        Ok(tx_hash)
    }

    /// Synchronous mint: credit, submit and record in one transaction.
    pub async fn mint_now(
        &self,
        wallet_id: Uuid,
        voucher_type_id: Uuid,
        amount: i64,
        wait: bool,
    ) -> Result<String, ServiceError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount).into());
        }
        let _permit = self.mint_permit().await?;

        let mut tx = self.store.begin().await?;
        let tx_hash = self
            .mint_in(&mut tx, wallet_id, voucher_type_id, amount, wait)
            .await?;
        tx.commit().await.map_err(LedgerError::from)?;

        tracing::info!(
            wallet_id = %wallet_id,
            voucher_type_id = %voucher_type_id,
            tx_hash = %tx_hash,
            waited = wait,
            "Synchronous mint recorded"
        );
        Ok(tx_hash)
    }

    /// Per-user limit check against everything the user ever claimed.
    /// A missing or zero limit means unlimited.
    pub async fn can_user_claim_in(
        &self,
        conn: &mut SqliteConnection,
        user_id: Uuid,
        voucher_type_id: Uuid,
        amount: i64,
    ) -> Result<ClaimAllowance, ServiceError> {
        let voucher = self.voucher_in(conn, voucher_type_id).await?;
        let limit = voucher.per_user_limit.unwrap_or(0);
        if limit <= 0 {
            return Ok(ClaimAllowance {
                allowed: true,
                claimed: 0,
                limit: 0,
            });
        }

        let claimed = self
            .store
            .claimed_total(conn, user_id, voucher_type_id)
            .await?;
        Ok(ClaimAllowance {
            allowed: claimed + amount.max(0) <= limit,
            claimed,
            limit,
        })
    }

    pub async fn can_user_claim(
        &self,
        user_id: Uuid,
        voucher_type_id: Uuid,
        amount: i64,
    ) -> Result<ClaimAllowance, ServiceError> {
        let mut conn = self.store.acquire().await?;
        self.can_user_claim_in(&mut conn, user_id, voucher_type_id, amount)
            .await
    }

    /// Register a user-supplied address. Re-linking the same address by the
    /// same user returns the existing wallet.
    pub async fn link_external_wallet(
        &self,
        user_id: Uuid,
        address: &str,
    ) -> Result<Wallet, ServiceError> {
        let address = WalletAddress::parse(address)?;

        let mut tx = self.store.begin().await?;
        let wallet = self.link_external_in(&mut tx, user_id, address).await?;
        tx.commit().await.map_err(LedgerError::from)?;
        Ok(wallet)
    }

    async fn link_external_in(
        &self,
        conn: &mut SqliteConnection,
        user_id: Uuid,
        address: WalletAddress,
    ) -> Result<Wallet, ServiceError> {
        if let Some(existing) = self
            .store
            .wallet_by_address(conn, self.chain_id, &address)
            .await?
        {
            if existing.user_id != user_id {
                return Err(LedgerError::AddressTaken(address.to_hex()).into());
            }
            return Ok(existing);
        }

        let hex = address.to_hex();
        let wallet = self
            .store
            .insert_wallet(
                conn,
                &NewWallet {
                    user_id,
                    provider: EXTERNAL_PROVIDER.to_string(),
                    provider_ref: format!("external:{}", hex.trim_start_matches("0x")),
                    chain_id: self.chain_id,
                    address,
                    exportable: false,
                },
            )
            .await?;
        tracing::info!(user_id = %user_id, address = %hex, "External wallet linked");
        Ok(wallet)
    }

    /// Move vouchers from the user's custodial balance to an external
    /// address: debit with reason `export` and queue the transfer, atomically.
    pub async fn export_voucher(
        &self,
        user_id: Uuid,
        voucher_slug: &str,
        to_address: &str,
        amount: i64,
    ) -> Result<ExportReceipt, ServiceError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount).into());
        }
        let destination = WalletAddress::parse(to_address)?;

        let mut tx = self.store.begin().await?;
        let voucher = self
            .store
            .voucher_by_slug(&mut tx, voucher_slug)
            .await?
            .ok_or_else(|| LedgerError::ReferenceNotFound(format!("voucher {}", voucher_slug)))?;
        let source = self
            .store
            .custodial_wallet_for(&mut tx, user_id, self.chain_id)
            .await?
            .ok_or_else(|| {
                LedgerError::ReferenceNotFound(format!("custodial wallet for user {}", user_id))
            })?;
        let external = self.link_external_in(&mut tx, user_id, destination).await?;

        self.store
            .debit(
                &mut tx,
                &Debit {
                    wallet_id: source.id,
                    voucher_type_id: voucher.id,
                    amount,
                    reason: TransferReason::Export,
                    to_wallet_id: Some(external.id),
                    pos_ref: None,
                },
            )
            .await?;
        let intent = self
            .store
            .enqueue_intent(
                &mut tx,
                TxKind::SafeTransfer1155,
                voucher.id,
                external.id,
                amount,
            )
            .await?;
        let remaining = self.store.balance(&mut tx, source.id, voucher.id).await?;
        tx.commit().await.map_err(LedgerError::from)?;

        tracing::info!(
            user_id = %user_id,
            voucher = voucher_slug,
            to = %destination,
            amount,
            tx_id = %intent.id,
            "Voucher export queued"
        );
        Ok(ExportReceipt {
            tx_id: intent.id,
            to_address: destination.to_hex(),
            remaining,
        })
    }
}
