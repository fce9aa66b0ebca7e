//! Ledger store: balances, audit trail and on-chain intents.
//!
//! Every mutating operation takes the connection of an open transaction so the
//! caller decides the atomic boundary. Write transactions are opened with
//! `BEGIN IMMEDIATE` (see [`LedgerStore::begin`]), which takes the database
//! writer lock before the first read; the `(wallet, voucher_type)` balance row
//! read under that lock cannot change until commit or rollback.

use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::ledger::pool::LedgerPool;
use crate::ledger::types::{
    now_secs, LedgerError, LedgerResult, NewVoucherType, NewWallet, OnchainTx, TransferLogEntry,
    TransferReason, Transition, TxKind, TxStatus, VoucherType, Wallet, WalletAddress,
    EXTERNAL_PROVIDER,
};

/// An open ledger transaction.
pub type Tx = sqlx::Transaction<'static, Sqlite>;

/// Parameters of a debit.
#[derive(Debug, Clone)]
pub struct Debit {
    pub wallet_id: Uuid,
    pub voucher_type_id: Uuid,
    pub amount: i64,
    pub reason: TransferReason,
    pub to_wallet_id: Option<Uuid>,
    pub pos_ref: Option<String>,
}

/// Handle over the ledger database.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    pool: LedgerPool,
}

impl LedgerStore {
    pub fn new(pool: LedgerPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &LedgerPool {
        &self.pool
    }

    /// Open a write transaction holding the writer lock from its first statement.
    pub async fn begin(&self) -> LedgerResult<Tx> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Borrow a pooled connection for reads or single autocommit statements.
    pub async fn acquire(&self) -> LedgerResult<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    // ------------------------------------------------------------------
    // Balances
    // ------------------------------------------------------------------

    /// Lock the balance row for `(wallet, voucher_type)`, creating it at zero
    /// if absent, and return the current balance.
    pub async fn get_balance_for_update(
        &self,
        conn: &mut SqliteConnection,
        wallet_id: Uuid,
        voucher_type_id: Uuid,
    ) -> LedgerResult<i64> {
        let insert = r#"
            INSERT INTO voucher_balance (wallet_id, voucher_type_id, balance, updated_at)
            VALUES ($1, $2, 0, $3)
            ON CONFLICT (wallet_id, voucher_type_id) DO NOTHING
        "#;
        sqlx::query(insert)
            .bind(wallet_id)
            .bind(voucher_type_id)
            .bind(now_secs())
            .execute(&mut *conn)
            .await
            .map_err(|e| missing_reference(e, wallet_id, voucher_type_id))?;

        let balance = sqlx::query_scalar::<_, i64>(
            "SELECT balance FROM voucher_balance WHERE wallet_id = $1 AND voucher_type_id = $2",
        )
        .bind(wallet_id)
        .bind(voucher_type_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(balance)
    }

    /// Increase a balance and append a `claim` row with no source wallet.
    pub async fn credit(
        &self,
        conn: &mut SqliteConnection,
        wallet_id: Uuid,
        voucher_type_id: Uuid,
        amount: i64,
    ) -> LedgerResult<Uuid> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        self.get_balance_for_update(conn, wallet_id, voucher_type_id)
            .await?;
        self.apply_delta(conn, wallet_id, voucher_type_id, amount)
            .await?;

        self.append_log(
            conn,
            None,
            Some(wallet_id),
            voucher_type_id,
            amount,
            TransferReason::Claim,
            None,
        )
        .await
    }

    /// Decrease a balance and append the matching audit row.
    ///
    /// Fails without touching the balance when the amount is not positive or
    /// exceeds the locked balance.
    pub async fn debit(&self, conn: &mut SqliteConnection, debit: &Debit) -> LedgerResult<Uuid> {
        if debit.amount <= 0 {
            return Err(LedgerError::InvalidAmount(debit.amount));
        }

        let available = self
            .get_balance_for_update(conn, debit.wallet_id, debit.voucher_type_id)
            .await?;
        if available < debit.amount {
            return Err(LedgerError::InsufficientBalance {
                available,
                requested: debit.amount,
            });
        }

        self.apply_delta(conn, debit.wallet_id, debit.voucher_type_id, -debit.amount)
            .await?;

        self.append_log(
            conn,
            Some(debit.wallet_id),
            debit.to_wallet_id,
            debit.voucher_type_id,
            debit.amount,
            debit.reason,
            debit.pos_ref.as_deref(),
        )
        .await
    }

    async fn apply_delta(
        &self,
        conn: &mut SqliteConnection,
        wallet_id: Uuid,
        voucher_type_id: Uuid,
        delta: i64,
    ) -> LedgerResult<()> {
        let query = r#"
            UPDATE voucher_balance
            SET balance = balance + $1, updated_at = $2
            WHERE wallet_id = $3 AND voucher_type_id = $4
        "#;
        sqlx::query(query)
            .bind(delta)
            .bind(now_secs())
            .bind(wallet_id)
            .bind(voucher_type_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn append_log(
        &self,
        conn: &mut SqliteConnection,
        from_wallet_id: Option<Uuid>,
        to_wallet_id: Option<Uuid>,
        voucher_type_id: Uuid,
        amount: i64,
        reason: TransferReason,
        pos_ref: Option<&str>,
    ) -> LedgerResult<Uuid> {
        let id = Uuid::new_v4();
        let query = r#"
            INSERT INTO voucher_transfer_log
                (id, from_wallet_id, to_wallet_id, voucher_type_id, amount, reason, pos_ref, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#;
        sqlx::query(query)
            .bind(id)
            .bind(from_wallet_id)
            .bind(to_wallet_id)
            .bind(voucher_type_id)
            .bind(amount)
            .bind(reason.as_str())
            .bind(pos_ref)
            .bind(now_secs())
            .execute(&mut *conn)
            .await?;
        Ok(id)
    }

    /// Current balance without locking; zero when no row exists.
    pub async fn balance(
        &self,
        conn: &mut SqliteConnection,
        wallet_id: Uuid,
        voucher_type_id: Uuid,
    ) -> LedgerResult<i64> {
        let balance = sqlx::query_scalar::<_, i64>(
            "SELECT balance FROM voucher_balance WHERE wallet_id = $1 AND voucher_type_id = $2",
        )
        .bind(wallet_id)
        .bind(voucher_type_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(balance.unwrap_or(0))
    }

    /// Audit trail for a voucher type, oldest first.
    pub async fn transfer_log(
        &self,
        conn: &mut SqliteConnection,
        voucher_type_id: Uuid,
    ) -> LedgerResult<Vec<TransferLogEntry>> {
        let query = r#"
            SELECT * FROM voucher_transfer_log
            WHERE voucher_type_id = $1
            ORDER BY created_at ASC, rowid ASC
        "#;
        Ok(sqlx::query_as(query)
            .bind(voucher_type_id)
            .fetch_all(&mut *conn)
            .await?)
    }

    /// Total amount ever claimed by a user for a voucher type, across all of
    /// the user's wallets.
    pub async fn claimed_total(
        &self,
        conn: &mut SqliteConnection,
        user_id: Uuid,
        voucher_type_id: Uuid,
    ) -> LedgerResult<i64> {
        let query = r#"
            SELECT COALESCE(SUM(l.amount), 0)
            FROM voucher_transfer_log l
            JOIN wallet w ON w.id = l.to_wallet_id
            WHERE w.user_id = $1 AND l.voucher_type_id = $2 AND l.reason = 'claim'
        "#;
        Ok(sqlx::query_scalar::<_, i64>(query)
            .bind(user_id)
            .bind(voucher_type_id)
            .fetch_one(&mut *conn)
            .await?)
    }

    // ------------------------------------------------------------------
    // On-chain intents
    // ------------------------------------------------------------------

    /// Create an intent in `queued` state.
    pub async fn enqueue_intent(
        &self,
        conn: &mut SqliteConnection,
        kind: TxKind,
        voucher_type_id: Uuid,
        to_wallet_id: Uuid,
        amount: i64,
    ) -> LedgerResult<OnchainTx> {
        self.insert_intent(conn, kind.as_str(), voucher_type_id, to_wallet_id, amount, None)
            .await
    }

    async fn insert_intent(
        &self,
        conn: &mut SqliteConnection,
        kind: &str,
        voucher_type_id: Uuid,
        to_wallet_id: Uuid,
        amount: i64,
        retry_of: Option<Uuid>,
    ) -> LedgerResult<OnchainTx> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let now = now_secs();
        let query = r#"
            INSERT INTO onchain_tx
                (id, kind, voucher_type_id, to_wallet_id, amount, status, retry_of, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'queued', $6, $7, $7)
            RETURNING *
        "#;
        sqlx::query_as(query)
            .bind(Uuid::new_v4())
            .bind(kind)
            .bind(voucher_type_id)
            .bind(to_wallet_id)
            .bind(amount)
            .bind(retry_of)
            .bind(now)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| missing_reference(e, to_wallet_id, voucher_type_id))
    }

    /// Apply a state-machine transition.
    ///
    /// The update is a compare-and-set on the status read here, so a row that
    /// moved concurrently is reported as an invalid transition rather than
    /// overwritten.
    pub async fn advance(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
        transition: Transition,
    ) -> LedgerResult<OnchainTx> {
        let current = self
            .onchain_tx(conn, id)
            .await?
            .ok_or_else(|| LedgerError::ReferenceNotFound(format!("onchain tx {}", id)))?;

        let target = transition.target();
        if !current.status.can_transition_to(target) {
            return Err(LedgerError::InvalidTransition {
                id,
                from: current.status,
                to: target,
            });
        }

        let now = now_secs();
        let updated: Option<OnchainTx> = match &transition {
            Transition::Sent { tx_hash, nonce } => {
                let query = r#"
                    UPDATE onchain_tx
                    SET status = 'sent', tx_hash = $1, nonce = $2, last_error = NULL, updated_at = $3
                    WHERE id = $4 AND status = $5
                    RETURNING *
                "#;
                sqlx::query_as(query)
                    .bind(tx_hash)
                    .bind(*nonce as i64)
                    .bind(now)
                    .bind(id)
                    .bind(current.status.as_str())
                    .fetch_optional(&mut *conn)
                    .await?
            }
            Transition::Confirmed { gas_price } => {
                let query = r#"
                    UPDATE onchain_tx
                    SET status = 'confirmed', gas_price = $1, updated_at = $2
                    WHERE id = $3 AND status = $4
                    RETURNING *
                "#;
                sqlx::query_as(query)
                    .bind(gas_price)
                    .bind(now)
                    .bind(id)
                    .bind(current.status.as_str())
                    .fetch_optional(&mut *conn)
                    .await?
            }
            Transition::Failed { error } => {
                let query = r#"
                    UPDATE onchain_tx
                    SET status = 'failed', last_error = $1, updated_at = $2
                    WHERE id = $3 AND status = $4
                    RETURNING *
                "#;
                sqlx::query_as(query)
                    .bind(error)
                    .bind(now)
                    .bind(id)
                    .bind(current.status.as_str())
                    .fetch_optional(&mut *conn)
                    .await?
            }
        };

        updated.ok_or(LedgerError::InvalidTransition {
            id,
            from: current.status,
            to: target,
        })
    }

    /// Operator retry of a failed intent.
    ///
    /// The failed row stays terminal; a new `queued` row with the same payload
    /// is created and linked through `retry_of`. Rows that were broadcast
    /// (`tx_hash` set) may still land on-chain and are refused unless `force`.
    pub async fn requeue(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
        force: bool,
    ) -> LedgerResult<OnchainTx> {
        let failed = self
            .onchain_tx(conn, id)
            .await?
            .ok_or_else(|| LedgerError::ReferenceNotFound(format!("onchain tx {}", id)))?;

        if failed.status != TxStatus::Failed {
            return Err(LedgerError::RequeueRefused {
                id,
                reason: format!("status is {}, only failed rows can be requeued", failed.status),
            });
        }
        if let (Some(tx_hash), false) = (&failed.tx_hash, force) {
            return Err(LedgerError::RequeueRefused {
                id,
                reason: format!(
                    "{} was broadcast and may still confirm; reconcile first or force",
                    tx_hash
                ),
            });
        }
        let (Some(voucher_type_id), Some(to_wallet_id)) =
            (failed.voucher_type_id, failed.to_wallet_id)
        else {
            return Err(LedgerError::RequeueRefused {
                id,
                reason: "voucher type or wallet reference is missing".to_string(),
            });
        };

        self.insert_intent(
            conn,
            &failed.kind,
            voucher_type_id,
            to_wallet_id,
            failed.amount,
            Some(failed.id),
        )
        .await
    }

    pub async fn onchain_tx(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> LedgerResult<Option<OnchainTx>> {
        Ok(sqlx::query_as("SELECT * FROM onchain_tx WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?)
    }

    /// Oldest `queued` intent by creation order.
    pub async fn oldest_queued(
        &self,
        conn: &mut SqliteConnection,
    ) -> LedgerResult<Option<OnchainTx>> {
        let query = r#"
            SELECT * FROM onchain_tx
            WHERE status = 'queued'
            ORDER BY created_at ASC, rowid ASC
            LIMIT 1
        "#;
        Ok(sqlx::query_as(query).fetch_optional(&mut *conn).await?)
    }

    /// Row count per status; every status is present, zero included.
    pub async fn count_by_status(
        &self,
        conn: &mut SqliteConnection,
    ) -> LedgerResult<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM onchain_tx GROUP BY status")
                .fetch_all(&mut *conn)
                .await?;

        let mut counts: BTreeMap<String, i64> = TxStatus::ALL
            .iter()
            .map(|status| (status.as_str().to_string(), 0))
            .collect();
        counts.extend(rows);
        Ok(counts)
    }

    /// Failed intents that were broadcast before failing.
    pub async fn failed_with_hash(
        &self,
        conn: &mut SqliteConnection,
    ) -> LedgerResult<Vec<OnchainTx>> {
        let query = r#"
            SELECT * FROM onchain_tx
            WHERE status = 'failed' AND tx_hash IS NOT NULL
            ORDER BY created_at ASC, rowid ASC
        "#;
        Ok(sqlx::query_as(query).fetch_all(&mut *conn).await?)
    }

    // ------------------------------------------------------------------
    // Voucher types
    // ------------------------------------------------------------------

    pub async fn insert_voucher_type(
        &self,
        conn: &mut SqliteConnection,
        new: &NewVoucherType,
    ) -> LedgerResult<VoucherType> {
        let query = r#"
            INSERT INTO voucher_type
                (id, slug, name, contract_address, token_id, max_supply, per_user_limit, active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 1, $8)
            RETURNING *
        "#;
        Ok(sqlx::query_as(query)
            .bind(Uuid::new_v4())
            .bind(&new.slug)
            .bind(&new.name)
            .bind(new.contract_address.to_lowercase())
            .bind(new.token_id.to_string())
            .bind(new.max_supply)
            .bind(new.per_user_limit)
            .bind(now_secs())
            .fetch_one(&mut *conn)
            .await?)
    }

    pub async fn set_voucher_active(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
        active: bool,
    ) -> LedgerResult<()> {
        let result = sqlx::query("UPDATE voucher_type SET active = $1 WHERE id = $2")
            .bind(active)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::ReferenceNotFound(format!("voucher type {}", id)));
        }
        Ok(())
    }

    pub async fn voucher_type(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> LedgerResult<Option<VoucherType>> {
        Ok(sqlx::query_as("SELECT * FROM voucher_type WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?)
    }

    pub async fn voucher_by_slug(
        &self,
        conn: &mut SqliteConnection,
        slug: &str,
    ) -> LedgerResult<Option<VoucherType>> {
        Ok(sqlx::query_as("SELECT * FROM voucher_type WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&mut *conn)
            .await?)
    }

    // ------------------------------------------------------------------
    // Wallets
    // ------------------------------------------------------------------

    pub async fn insert_wallet(
        &self,
        conn: &mut SqliteConnection,
        new: &NewWallet,
    ) -> LedgerResult<Wallet> {
        let query = r#"
            INSERT INTO wallet
                (id, user_id, provider, provider_ref, chain_id, address, exportable, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
        "#;
        sqlx::query_as(query)
            .bind(Uuid::new_v4())
            .bind(new.user_id)
            .bind(&new.provider)
            .bind(&new.provider_ref)
            .bind(new.chain_id as i64)
            .bind(new.address.as_bytes())
            .bind(new.exportable)
            .bind(now_secs())
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    LedgerError::AddressTaken(new.address.to_hex())
                }
                other => LedgerError::Database(other),
            })
    }

    pub async fn wallet(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> LedgerResult<Option<Wallet>> {
        Ok(sqlx::query_as("SELECT * FROM wallet WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?)
    }

    /// Most recent custodial (non-external) wallet of a user on a chain.
    pub async fn custodial_wallet_for(
        &self,
        conn: &mut SqliteConnection,
        user_id: Uuid,
        chain_id: u64,
    ) -> LedgerResult<Option<Wallet>> {
        let query = r#"
            SELECT * FROM wallet
            WHERE user_id = $1 AND chain_id = $2 AND provider != $3
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
        "#;
        Ok(sqlx::query_as(query)
            .bind(user_id)
            .bind(chain_id as i64)
            .bind(EXTERNAL_PROVIDER)
            .fetch_optional(&mut *conn)
            .await?)
    }

    pub async fn wallet_by_address(
        &self,
        conn: &mut SqliteConnection,
        chain_id: u64,
        address: &WalletAddress,
    ) -> LedgerResult<Option<Wallet>> {
        Ok(
            sqlx::query_as("SELECT * FROM wallet WHERE chain_id = $1 AND address = $2")
                .bind(chain_id as i64)
                .bind(address.as_bytes())
                .fetch_optional(&mut *conn)
                .await?,
        )
    }
}

fn missing_reference(error: sqlx::Error, wallet_id: Uuid, voucher_type_id: Uuid) -> LedgerError {
    match error {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => LedgerError::ReferenceNotFound(
            format!("wallet {} or voucher type {}", wallet_id, voucher_type_id),
        ),
        other => LedgerError::Database(other),
    }
}
