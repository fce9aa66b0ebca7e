//! Shared fixtures for integration tests.

#![allow(dead_code)]

use alloy::primitives::{keccak256, Address, Bytes, TxHash, U256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use voucher_settlement::blockchain::{
    BlockchainError, BlockchainResult, FeeQuote, SettledReceipt, Submission, TokenChain,
};
use voucher_settlement::config::DatabaseConfig;
use voucher_settlement::ledger::{
    LedgerPool, LedgerStore, NewVoucherType, NewWallet, VoucherType, Wallet, WalletAddress,
};
use voucher_settlement::vouchers::{
    CustodyError, ProvisionedWallet, VoucherService, WalletProvisioner,
};

pub const CHAIN_ID: u64 = 31337;
pub const CONTRACT: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";

/// 30 gwei max fee; recorded as `0.000000030000000000`.
pub const MAX_FEE_WEI: u128 = 30_000_000_000;

pub async fn store() -> LedgerStore {
    LedgerStore::new(LedgerPool::in_memory().await.unwrap())
}

/// File-backed ledger so several connections contend for the writer lock.
pub async fn file_store(busy_timeout_secs: u64) -> (LedgerStore, std::path::PathBuf) {
    let path = std::env::temp_dir().join(format!("voucher-ledger-{}.db", Uuid::new_v4()));
    let pool = LedgerPool::connect(&DatabaseConfig {
        url: format!("sqlite://{}", path.display()),
        max_connections: 4,
        busy_timeout_secs,
    })
    .await
    .unwrap();
    (LedgerStore::new(pool), path)
}

pub fn cleanup(path: &std::path::Path) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
    }
}

pub async fn seed_voucher(
    store: &LedgerStore,
    slug: &str,
    token_id: u64,
    per_user_limit: Option<i64>,
) -> VoucherType {
    let mut conn = store.acquire().await.unwrap();
    store
        .insert_voucher_type(
            &mut conn,
            &NewVoucherType {
                slug: slug.to_string(),
                name: format!("Voucher {}", slug),
                contract_address: CONTRACT.to_string(),
                token_id: U256::from(token_id),
                max_supply: None,
                per_user_limit,
            },
        )
        .await
        .unwrap()
}

pub fn random_address() -> WalletAddress {
    WalletAddress(PrivateKeySigner::random().address())
}

pub async fn seed_wallet(store: &LedgerStore, user_id: Uuid) -> Wallet {
    let mut conn = store.acquire().await.unwrap();
    store
        .insert_wallet(
            &mut conn,
            &NewWallet {
                user_id,
                provider: "local".to_string(),
                provider_ref: Uuid::new_v4().simple().to_string(),
                chain_id: CHAIN_ID,
                address: random_address(),
                exportable: false,
            },
        )
        .await
        .unwrap()
}

pub async fn credit(store: &LedgerStore, wallet: &Wallet, voucher: &VoucherType, amount: i64) {
    let mut tx = store.begin().await.unwrap();
    store
        .credit(&mut tx, wallet.id, voucher.id, amount)
        .await
        .unwrap();
    tx.commit().await.unwrap();
}

pub async fn balance(store: &LedgerStore, wallet_id: Uuid, voucher_id: Uuid) -> i64 {
    let mut conn = store.acquire().await.unwrap();
    store.balance(&mut conn, wallet_id, voucher_id).await.unwrap()
}

pub fn service(store: &LedgerStore, chain: Option<Arc<FakeChain>>) -> VoucherService {
    service_with(store, chain, Arc::new(FakeProvisioner::default()))
}

/// Like [`service`], with a provisioner the test can inspect. Asks for four
/// synchronous mint slots, which the service clamps.
pub fn service_with(
    store: &LedgerStore,
    chain: Option<Arc<FakeChain>>,
    provisioner: Arc<FakeProvisioner>,
) -> VoucherService {
    VoucherService::new(
        store.clone(),
        chain.map(|c| c as Arc<dyn TokenChain>),
        provisioner,
        CHAIN_ID,
        4,
    )
}

/// Provisioner that invents addresses without touching disk.
#[derive(Default)]
pub struct FakeProvisioner {
    pub created: AtomicU64,
}

#[async_trait]
impl WalletProvisioner for FakeProvisioner {
    fn provider(&self) -> &str {
        "local"
    }

    async fn create_wallet(&self, _user_id: Uuid) -> Result<ProvisionedWallet, CustodyError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(ProvisionedWallet {
            address: random_address(),
            provider_ref: Uuid::new_v4().simple().to_string(),
            exportable: false,
        })
    }
}

/// How the next receipt wait ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptScript {
    Confirm,
    Revert,
    Timeout,
}

/// One submission the fake chain accepted or rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainCall {
    Mint {
        to: Address,
        token_id: U256,
        amount: U256,
    },
    Transfer {
        from: Address,
        to: Address,
        token_id: U256,
        amount: U256,
    },
}

/// Scripted [`TokenChain`]: submissions succeed unless an error was queued,
/// receipts confirm unless a different ending was queued.
pub struct FakeChain {
    signer: Address,
    next_nonce: AtomicU64,
    submit_errors: Mutex<VecDeque<Option<BlockchainError>>>,
    receipts: Mutex<VecDeque<ReceiptScript>>,
    landed: Mutex<HashSet<TxHash>>,
    receipt_delay: Mutex<Duration>,
    healthy: AtomicBool,
    pub calls: Mutex<Vec<ChainCall>>,
}

impl Default for FakeChain {
    fn default() -> Self {
        Self {
            signer: PrivateKeySigner::random().address(),
            next_nonce: AtomicU64::new(0),
            submit_errors: Mutex::new(VecDeque::new()),
            receipts: Mutex::new(VecDeque::new()),
            landed: Mutex::new(HashSet::new()),
            receipt_delay: Mutex::new(Duration::ZERO),
            healthy: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next submission with `error`.
    pub fn fail_next_submit(&self, error: BlockchainError) {
        self.submit_errors.lock().unwrap().push_back(Some(error));
    }

    /// Let the next submission through (to interleave with failures).
    pub fn pass_next_submit(&self) {
        self.submit_errors.lock().unwrap().push_back(None);
    }

    pub fn script_receipt(&self, script: ReceiptScript) {
        self.receipts.lock().unwrap().push_back(script);
    }

    /// Make `receipt()` report `tx_hash` as mined.
    pub fn mark_landed(&self, tx_hash: TxHash) {
        self.landed.lock().unwrap().insert(tx_hash);
    }

    /// Make every receipt wait take `delay` before it ends.
    pub fn set_receipt_delay(&self, delay: Duration) {
        *self.receipt_delay.lock().unwrap() = delay;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ChainCall> {
        self.calls.lock().unwrap().clone()
    }

    fn submit(&self, call: ChainCall) -> BlockchainResult<Submission> {
        self.calls.lock().unwrap().push(call);
        if let Some(Some(error)) = self.submit_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        let nonce = self.next_nonce.fetch_add(1, Ordering::SeqCst);
        Ok(Submission {
            tx_hash: keccak256(nonce.to_be_bytes()),
            nonce,
            fee: FeeQuote::Eip1559 {
                max_fee_per_gas: MAX_FEE_WEI,
                max_priority_fee_per_gas: 2_000_000_000,
            },
        })
    }

    fn settled(tx_hash: TxHash) -> SettledReceipt {
        SettledReceipt {
            tx_hash,
            block_number: Some(7),
            gas_used: 51_000,
            effective_gas_price: MAX_FEE_WEI,
        }
    }
}

#[async_trait]
impl TokenChain for FakeChain {
    fn signer_address(&self) -> Address {
        self.signer
    }

    fn receipt_timeout(&self) -> Duration {
        Duration::from_millis(50)
    }

    async fn balance_of(&self, _owner: Address, _token_id: U256) -> BlockchainResult<U256> {
        Ok(U256::ZERO)
    }

    async fn mint_to(
        &self,
        to: Address,
        token_id: U256,
        amount: U256,
        _data: Option<Bytes>,
    ) -> BlockchainResult<Submission> {
        self.submit(ChainCall::Mint {
            to,
            token_id,
            amount,
        })
    }

    async fn safe_transfer(
        &self,
        from: Address,
        to: Address,
        token_id: U256,
        amount: U256,
        _data: Option<Bytes>,
    ) -> BlockchainResult<Submission> {
        self.submit(ChainCall::Transfer {
            from,
            to,
            token_id,
            amount,
        })
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> BlockchainResult<SettledReceipt> {
        let delay = *self.receipt_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let script = self
            .receipts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ReceiptScript::Confirm);
        match script {
            ReceiptScript::Confirm => Ok(Self::settled(tx_hash)),
            ReceiptScript::Revert => Err(BlockchainError::Reverted { tx_hash }),
            ReceiptScript::Timeout => Err(BlockchainError::ReceiptTimeout {
                tx_hash,
                secs: timeout.as_secs(),
            }),
        }
    }

    async fn receipt(&self, tx_hash: TxHash) -> BlockchainResult<Option<SettledReceipt>> {
        if self.landed.lock().unwrap().contains(&tx_hash) {
            Ok(Some(Self::settled(tx_hash)))
        } else {
            Ok(None)
        }
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
