//! Ledger entities, the on-chain intent state machine and ledger errors.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Provider tag for user-supplied wallets.
pub const EXTERNAL_PROVIDER: &str = "external";

/// Current unix time in seconds.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Errors raised by the ledger store.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Debit larger than the locked balance.
    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: i64, requested: i64 },

    /// Amounts must be positive integers.
    #[error("Invalid amount {0}: must be positive")]
    InvalidAmount(i64),

    /// A referenced voucher type, wallet or transaction does not exist.
    #[error("Reference not found: {0}")]
    ReferenceNotFound(String),

    /// Attempted a transition the state machine forbids.
    #[error("Invalid transition for onchain tx {id}: {from} -> {to}")]
    InvalidTransition { id: Uuid, from: TxStatus, to: TxStatus },

    /// Operator requeue refused.
    #[error("Cannot requeue onchain tx {id}: {reason}")]
    RequeueRefused { id: Uuid, reason: String },

    /// External address registered to a different user.
    #[error("Address {0} already registered to another user")]
    AddressTaken(String),

    /// Malformed address input.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Underlying database failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failure.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl LedgerError {
    /// Another connection holds the writer lock (`SQLITE_BUSY` or
    /// `SQLITE_LOCKED`, extended codes included) or no connection was free.
    pub fn is_busy(&self) -> bool {
        match self {
            LedgerError::Database(sqlx::Error::Database(e)) => e
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
            LedgerError::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// ERC-1155 token id (up to 256 bits), stored as a decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId(pub U256);

impl TryFrom<String> for TokenId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        U256::from_str_radix(value.trim(), 10)
            .map(TokenId)
            .map_err(|e| format!("invalid token id '{}': {}", value, e))
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 20-byte account address as stored in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WalletAddress(pub Address);

impl WalletAddress {
    /// Parse user input: trims, lowercases, accepts an optional `0x`, and
    /// requires exactly 40 hex characters.
    pub fn parse(input: &str) -> LedgerResult<Self> {
        let normalized = input.trim().to_lowercase();
        let hex_part = normalized.strip_prefix("0x").unwrap_or(&normalized);
        if hex_part.len() != 40 {
            return Err(LedgerError::InvalidAddress(
                "address must be 20 bytes (40 hex chars)".to_string(),
            ));
        }
        let bytes = alloy::hex::decode(hex_part).map_err(|_| {
            LedgerError::InvalidAddress("address contains non-hex characters".to_string())
        })?;
        Ok(Self(Address::from_slice(&bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Lowercase `0x`-prefixed rendering used on every external surface.
    pub fn to_hex(&self) -> String {
        format!("0x{}", alloy::hex::encode(self.0.as_slice()))
    }
}

impl TryFrom<Vec<u8>> for WalletAddress {
    type Error = String;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != 20 {
            return Err(format!("address must be 20 bytes, got {}", value.len()));
        }
        Ok(Self(Address::from_slice(&value)))
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A claimable and redeemable token class.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VoucherType {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub contract_address: String,
    #[sqlx(try_from = "String")]
    pub token_id: TokenId,
    pub max_supply: Option<i64>,
    pub per_user_limit: Option<i64>,
    pub active: bool,
    pub created_at: i64,
}

/// Fields for creating a voucher type.
#[derive(Debug, Clone)]
pub struct NewVoucherType {
    pub slug: String,
    pub name: String,
    pub contract_address: String,
    pub token_id: U256,
    pub max_supply: Option<i64>,
    pub per_user_limit: Option<i64>,
}

/// A blockchain address bound to one user and one chain.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    pub provider_ref: String,
    pub chain_id: i64,
    #[sqlx(try_from = "Vec<u8>")]
    pub address: WalletAddress,
    pub exportable: bool,
    pub created_at: i64,
}

impl Wallet {
    pub fn is_external(&self) -> bool {
        self.provider == EXTERNAL_PROVIDER
    }
}

/// Fields for creating a wallet.
#[derive(Debug, Clone)]
pub struct NewWallet {
    pub user_id: Uuid,
    pub provider: String,
    pub provider_ref: String,
    pub chain_id: u64,
    pub address: WalletAddress,
    pub exportable: bool,
}

/// Why a balance moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferReason {
    Claim,
    Pos,
    Export,
}

impl TransferReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferReason::Claim => "claim",
            TransferReason::Pos => "pos",
            TransferReason::Export => "export",
        }
    }
}

impl fmt::Display for TransferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable row of the transfer audit trail.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TransferLogEntry {
    pub id: Uuid,
    pub from_wallet_id: Option<Uuid>,
    pub to_wallet_id: Option<Uuid>,
    pub voucher_type_id: Uuid,
    pub amount: i64,
    pub reason: String,
    pub pos_ref: Option<String>,
    pub created_at: i64,
}

/// On-chain operation requested by an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    #[serde(rename = "mint1155")]
    Mint1155,
    #[serde(rename = "safeTransfer1155")]
    SafeTransfer1155,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Mint1155 => "mint1155",
            TxKind::SafeTransfer1155 => "safeTransfer1155",
        }
    }
}

impl FromStr for TxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mint1155" => Ok(TxKind::Mint1155),
            "safeTransfer1155" => Ok(TxKind::SafeTransfer1155),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settlement status of an on-chain intent.
///
/// ```text
/// queued ──▶ sent ──▶ confirmed
///    │         │
///    └──▶ failed ◀──┘
/// ```
/// `confirmed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Queued,
    Sent,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub const ALL: [TxStatus; 4] = [
        TxStatus::Queued,
        TxStatus::Sent,
        TxStatus::Confirmed,
        TxStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Queued => "queued",
            TxStatus::Sent => "sent",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Failed)
    }

    pub fn can_transition_to(&self, next: TxStatus) -> bool {
        matches!(
            (self, next),
            (TxStatus::Queued, TxStatus::Sent)
                | (TxStatus::Queued, TxStatus::Failed)
                | (TxStatus::Sent, TxStatus::Confirmed)
                | (TxStatus::Sent, TxStatus::Failed)
        )
    }
}

impl FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TxStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown tx status '{}'", s))
    }
}

impl TryFrom<String> for TxStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intent and record of a blockchain-mutating operation.
///
/// `kind` stays raw text so rows written by other tools with unknown kinds can
/// still be loaded and failed explicitly by the queue processor.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OnchainTx {
    pub id: Uuid,
    pub kind: String,
    pub voucher_type_id: Option<Uuid>,
    pub to_wallet_id: Option<Uuid>,
    pub amount: i64,
    pub nonce: Option<i64>,
    pub gas_price: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: TxStatus,
    pub tx_hash: Option<String>,
    pub last_error: Option<String>,
    pub retry_of: Option<Uuid>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OnchainTx {
    pub fn parsed_kind(&self) -> Result<TxKind, String> {
        self.kind.parse()
    }
}

/// A state change applied through `LedgerStore::advance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Broadcast accepted by the node.
    Sent { tx_hash: String, nonce: u64 },
    /// Receipt reported success; gas price in native units.
    Confirmed { gas_price: Option<String> },
    /// Terminal failure with the recorded error text.
    Failed { error: String },
}

impl Transition {
    pub fn target(&self) -> TxStatus {
        match self {
            Transition::Sent { .. } => TxStatus::Sent,
            Transition::Confirmed { .. } => TxStatus::Confirmed,
            Transition::Failed { .. } => TxStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use TxStatus::*;
        let allowed = [(Queued, Sent), (Queued, Failed), (Sent, Confirmed), (Sent, Failed)];

        for from in TxStatus::ALL {
            for to in TxStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for to in TxStatus::ALL {
            assert!(!TxStatus::Confirmed.can_transition_to(to));
            assert!(!TxStatus::Failed.can_transition_to(to));
        }
        assert!(TxStatus::Confirmed.is_terminal());
        assert!(!TxStatus::Sent.is_terminal());
    }

    #[test]
    fn test_busy_classification() {
        assert!(LedgerError::Database(sqlx::Error::PoolTimedOut).is_busy());
        assert!(!LedgerError::Database(sqlx::Error::RowNotFound).is_busy());
        assert!(!LedgerError::InvalidAmount(0).is_busy());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("mint1155".parse::<TxKind>(), Ok(TxKind::Mint1155));
        assert_eq!(
            "safeTransfer1155".parse::<TxKind>(),
            Ok(TxKind::SafeTransfer1155)
        );
        assert_eq!("burn1155".parse::<TxKind>(), Err("burn1155".to_string()));
    }

    #[test]
    fn test_address_normalization() {
        let addr = WalletAddress::parse("  0xF39FD6E51AAD88F6F4CE6AB8827279CFFFB92266 ").unwrap();
        assert_eq!(addr.to_hex(), "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266");

        let bare = WalletAddress::parse("f39fd6e51aad88f6f4ce6ab8827279cfffb92266").unwrap();
        assert_eq!(addr, bare);

        assert!(matches!(
            WalletAddress::parse("0x1234"),
            Err(LedgerError::InvalidAddress(_))
        ));
        assert!(matches!(
            WalletAddress::parse("0xz39fd6e51aad88f6f4ce6ab8827279cfffb92266"),
            Err(LedgerError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_token_id_big_values() {
        let max = U256::MAX.to_string();
        let id = TokenId::try_from(max.clone()).unwrap();
        assert_eq!(id.to_string(), max);
        assert!(TokenId::try_from("-1".to_string()).is_err());
    }
}
