//! Claim orchestration and the service paths it relies on.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

use voucher_settlement::blockchain::BlockchainError;
use voucher_settlement::claims::{
    ClaimAuditor, ClaimContext, ClaimError, ClaimOrchestrator, ClaimOutcome, ClaimTarget,
};
use voucher_settlement::config::{ClaimConfig, SettlementMode};
use voucher_settlement::ledger::types::now_secs;
use voucher_settlement::ledger::{LedgerError, LedgerStore, TxStatus};
use voucher_settlement::vouchers::{ServiceError, VoucherService};

mod common;
use common::{FakeChain, ReceiptScript};

fn claim_config(settlement: SettlementMode, rate_limit: u32) -> ClaimConfig {
    ClaimConfig {
        settlement,
        rate_limit_per_window: rate_limit,
        ..Default::default()
    }
}

fn orchestrator(
    store: &LedgerStore,
    chain: Option<Arc<FakeChain>>,
    config: &ClaimConfig,
) -> ClaimOrchestrator {
    let service = Arc::new(common::service(store, chain));
    ClaimOrchestrator::new(service, ClaimAuditor::new(config, "test-secret"), config)
}

fn ctx(ip: &str, email: &str) -> ClaimContext {
    ClaimContext {
        ip: Some(ip.to_string()),
        user_agent: Some("x".repeat(500)),
        email: Some(email.to_string()),
        phone: None,
    }
}

async fn audit_results(store: &LedgerStore, code_id: Uuid) -> Vec<String> {
    let mut conn = store.acquire().await.unwrap();
    store
        .claim_requests_for_code(&mut conn, code_id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.result)
        .collect()
}

async fn status_counts(store: &LedgerStore) -> std::collections::BTreeMap<String, i64> {
    let mut conn = store.acquire().await.unwrap();
    store.count_by_status(&mut conn).await.unwrap()
}

#[tokio::test]
async fn test_deferred_code_claim_credits_and_queues() {
    let store = common::store().await;
    let voucher = common::seed_voucher(&store, "breakfast", 3, None).await;
    let code = {
        let mut conn = store.acquire().await.unwrap();
        store
            .insert_claim_code(&mut conn, "QR-1", voucher.id, Some("gala"), None)
            .await
            .unwrap()
    };
    let orchestrator = orchestrator(&store, None, &claim_config(SettlementMode::Deferred, 0));
    let user = Uuid::new_v4();

    let receipt = orchestrator
        .claim(user, &ClaimTarget::Code("QR-1".into()), &ctx("198.51.100.4", "g@x.io"))
        .await
        .unwrap();

    assert!(receipt.tx_id.is_some());
    assert!(receipt.tx_hash.is_none());
    assert_eq!(common::balance(&store, receipt.wallet_id, voucher.id).await, 1);
    assert_eq!(status_counts(&store).await["queued"], 1);

    let mut conn = store.acquire().await.unwrap();
    let consumed = store.claim_code(&mut conn, "QR-1").await.unwrap().unwrap();
    assert!(consumed.is_used());
    assert_eq!(consumed.used_by_user, Some(user));

    let audit = store.claim_requests_for_code(&mut conn, code.id).await.unwrap();
    drop(conn);
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].result, "ok");
    assert_eq!(audit[0].user_agent.as_ref().unwrap().len(), 200);
    let ip_hash = audit[0].ip_hash.clone().unwrap();
    assert_eq!(ip_hash, orchestrator.auditor().hash_ip("198.51.100.4"));
    assert_ne!(ip_hash, "198.51.100.4");
}

#[tokio::test]
async fn test_code_cannot_be_claimed_twice() {
    let store = common::store().await;
    let voucher = common::seed_voucher(&store, "breakfast", 3, None).await;
    let code = {
        let mut conn = store.acquire().await.unwrap();
        store
            .insert_claim_code(&mut conn, "QR-2", voucher.id, None, None)
            .await
            .unwrap()
    };
    let orchestrator = orchestrator(&store, None, &claim_config(SettlementMode::Deferred, 0));
    let target = ClaimTarget::Code("QR-2".into());

    orchestrator
        .claim(Uuid::new_v4(), &target, &ClaimContext::default())
        .await
        .unwrap();
    let err = orchestrator
        .claim(Uuid::new_v4(), &target, &ClaimContext::default())
        .await
        .unwrap_err();

    assert_eq!(err.outcome(), ClaimOutcome::Used);
    assert_eq!(status_counts(&store).await["queued"], 1);
    assert_eq!(audit_results(&store, code.id).await, vec!["used", "ok"]);
}

#[tokio::test]
async fn test_expired_and_unknown_codes() {
    let store = common::store().await;
    let voucher = common::seed_voucher(&store, "breakfast", 3, None).await;
    let code = {
        let mut conn = store.acquire().await.unwrap();
        store
            .insert_claim_code(&mut conn, "QR-OLD", voucher.id, None, Some(now_secs() - 60))
            .await
            .unwrap()
    };
    let orchestrator = orchestrator(&store, None, &claim_config(SettlementMode::Deferred, 0));
    let user = Uuid::new_v4();

    let expired = orchestrator
        .claim(user, &ClaimTarget::Code("QR-OLD".into()), &ClaimContext::default())
        .await
        .unwrap_err();
    assert_eq!(expired.outcome(), ClaimOutcome::Expired);
    assert_eq!(audit_results(&store, code.id).await, vec!["expired"]);

    let unknown = orchestrator
        .claim(user, &ClaimTarget::Code("QR-NOPE".into()), &ClaimContext::default())
        .await
        .unwrap_err();
    assert_eq!(unknown.outcome(), ClaimOutcome::NotFound);

    let mut conn = store.acquire().await.unwrap();
    let still_new = store.claim_code(&mut conn, "QR-OLD").await.unwrap().unwrap();
    assert!(!still_new.is_used());
}

#[tokio::test]
async fn test_inactive_voucher_is_rejected() {
    let store = common::store().await;
    let voucher = common::seed_voucher(&store, "brunch", 3, None).await;
    {
        let mut conn = store.acquire().await.unwrap();
        store
            .set_voucher_active(&mut conn, voucher.id, false)
            .await
            .unwrap();
    }
    let orchestrator = orchestrator(&store, None, &claim_config(SettlementMode::Deferred, 0));

    let err = orchestrator
        .claim(Uuid::new_v4(), &ClaimTarget::Slug("brunch".into()), &ClaimContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClaimError::Rejected(ClaimOutcome::Inactive)));
}

#[tokio::test]
async fn test_per_user_limit_on_slug_claims() {
    let store = common::store().await;
    let voucher = common::seed_voucher(&store, "coffee", 3, Some(2)).await;
    let orchestrator = orchestrator(&store, None, &claim_config(SettlementMode::Deferred, 0));
    let user = Uuid::new_v4();
    let target = ClaimTarget::Slug("coffee".into());

    let first = orchestrator
        .claim(user, &target, &ClaimContext::default())
        .await
        .unwrap();
    orchestrator
        .claim(user, &target, &ClaimContext::default())
        .await
        .unwrap();
    let third = orchestrator
        .claim(user, &target, &ClaimContext::default())
        .await
        .unwrap_err();

    assert_eq!(third.outcome(), ClaimOutcome::LimitReached);
    assert_eq!(common::balance(&store, first.wallet_id, voucher.id).await, 2);
    assert_eq!(status_counts(&store).await["queued"], 2);
}

#[tokio::test]
async fn test_rate_limit_counts_attempts_by_email_or_ip() {
    let store = common::store().await;
    common::seed_voucher(&store, "coffee", 3, None).await;
    let orchestrator = orchestrator(&store, None, &claim_config(SettlementMode::Deferred, 2));
    let target = ClaimTarget::Slug("coffee".into());

    orchestrator
        .claim(Uuid::new_v4(), &target, &ctx("203.0.113.1", "a@x.io"))
        .await
        .unwrap();
    orchestrator
        .claim(Uuid::new_v4(), &target, &ctx("203.0.113.2", "a@x.io"))
        .await
        .unwrap();

    // Same email, new IP.
    let by_email = orchestrator
        .claim(Uuid::new_v4(), &target, &ctx("203.0.113.3", "a@x.io"))
        .await
        .unwrap_err();
    assert_eq!(by_email.outcome(), ClaimOutcome::RateLimited);

    // Same IP as the first attempt, new email: one earlier hit, under the limit.
    orchestrator
        .claim(Uuid::new_v4(), &target, &ctx("203.0.113.1", "b@x.io"))
        .await
        .unwrap();

    // Unrelated client is untouched.
    orchestrator
        .claim(Uuid::new_v4(), &target, &ctx("192.0.2.9", "c@x.io"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_immediate_claim_mints_inside_the_transaction() {
    let store = common::store().await;
    let voucher = common::seed_voucher(&store, "coffee", 3, None).await;
    let chain = FakeChain::new();
    let orchestrator = orchestrator(
        &store,
        Some(chain.clone()),
        &claim_config(SettlementMode::Immediate, 0),
    );

    let receipt = orchestrator
        .claim(Uuid::new_v4(), &ClaimTarget::Slug("coffee".into()), &ClaimContext::default())
        .await
        .unwrap();

    assert!(receipt.tx_hash.is_some());
    assert_eq!(chain.calls().len(), 1);
    assert_eq!(common::balance(&store, receipt.wallet_id, voucher.id).await, 1);

    let counts = status_counts(&store).await;
    assert_eq!(counts["confirmed"], 1);
    assert_eq!(counts["queued"], 0);
    assert_eq!(orchestrator.service().available_mint_permits(), 1);
}

#[tokio::test]
async fn test_immediate_claim_failure_rolls_back_everything() {
    let store = common::store().await;
    let voucher = common::seed_voucher(&store, "breakfast", 3, None).await;
    let code = {
        let mut conn = store.acquire().await.unwrap();
        store
            .insert_claim_code(&mut conn, "QR-9", voucher.id, None, None)
            .await
            .unwrap()
    };
    let chain = FakeChain::new();
    chain.fail_next_submit(BlockchainError::ChainConnection("all endpoints down".into()));
    let orchestrator = orchestrator(
        &store,
        Some(chain.clone()),
        &claim_config(SettlementMode::Immediate, 0),
    );
    let user = Uuid::new_v4();

    let err = orchestrator
        .claim(user, &ClaimTarget::Code("QR-9".into()), &ClaimContext::default())
        .await
        .unwrap_err();
    assert_eq!(err.outcome(), ClaimOutcome::MintFailed);
    assert!(matches!(
        err,
        ClaimError::Failed(ServiceError::Chain(BlockchainError::ChainConnection(_)))
    ));

    let mut conn = store.acquire().await.unwrap();
    assert!(!store.claim_code(&mut conn, "QR-9").await.unwrap().unwrap().is_used());
    assert!(store
        .custodial_wallet_for(&mut conn, user, common::CHAIN_ID)
        .await
        .unwrap()
        .is_none());
    assert!(store.transfer_log(&mut conn, voucher.id).await.unwrap().is_empty());
    drop(conn);
    assert_eq!(status_counts(&store).await.values().sum::<i64>(), 0);
    assert_eq!(audit_results(&store, code.id).await, vec!["mint_failed"]);

    // The code is still claimable once the chain recovers.
    orchestrator
        .claim(user, &ClaimTarget::Code("QR-9".into()), &ClaimContext::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_rolled_back_provisioning_leaves_no_wallet_row() {
    let store = common::store().await;
    common::seed_voucher(&store, "coffee", 3, None).await;
    let provisioner = Arc::new(common::FakeProvisioner::default());
    let chain = FakeChain::new();
    let service = Arc::new(common::service_with(
        &store,
        Some(chain.clone()),
        provisioner.clone(),
    ));
    let user = Uuid::new_v4();

    {
        let mut tx = store.begin().await.unwrap();
        let first = service.ensure_custodial_wallet_in(&mut tx, user).await.unwrap();
        assert!(first.provisioned);
        let again = service.ensure_custodial_wallet_in(&mut tx, user).await.unwrap();
        assert!(!again.provisioned);
        assert_eq!(again.wallet.id, first.wallet.id);
        tx.rollback().await.unwrap();
    }
    assert_eq!(provisioner.created.load(Ordering::SeqCst), 1);

    chain.fail_next_submit(BlockchainError::ChainConnection("all endpoints down".into()));
    let config = claim_config(SettlementMode::Immediate, 0);
    let orchestrator =
        ClaimOrchestrator::new(service, ClaimAuditor::new(&config, "test-secret"), &config);
    let err = orchestrator
        .claim(user, &ClaimTarget::Slug("coffee".into()), &ClaimContext::default())
        .await
        .unwrap_err();
    assert_eq!(err.outcome(), ClaimOutcome::MintFailed);

    // Two keys provisioned, neither referenced by a wallet row.
    assert_eq!(provisioner.created.load(Ordering::SeqCst), 2);
    let mut conn = store.acquire().await.unwrap();
    assert!(store
        .custodial_wallet_for(&mut conn, user, common::CHAIN_ID)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_immediate_claim_without_chain_fails_cleanly() {
    let store = common::store().await;
    common::seed_voucher(&store, "coffee", 3, None).await;
    let orchestrator = orchestrator(&store, None, &claim_config(SettlementMode::Immediate, 0));

    let err = orchestrator
        .claim(Uuid::new_v4(), &ClaimTarget::Slug("coffee".into()), &ClaimContext::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClaimError::Failed(ServiceError::Chain(BlockchainError::NotAvailable(_)))
    ));
}

#[tokio::test]
async fn test_concurrent_sync_mints_queue_for_the_writer() {
    // A receipt wait longer than the busy timeout: a second mint that raced
    // for the writer lock would fail with "database is locked".
    let (store, path) = common::file_store(1).await;
    let voucher = common::seed_voucher(&store, "coffee", 3, None).await;
    let first = common::seed_wallet(&store, Uuid::new_v4()).await;
    let second = common::seed_wallet(&store, Uuid::new_v4()).await;
    let chain = FakeChain::new();
    chain.set_receipt_delay(std::time::Duration::from_millis(1500));
    let service = Arc::new(common::service(&store, Some(chain.clone())));
    assert_eq!(service.available_mint_permits(), 1);

    let mints: Vec<_> = [first.id, second.id]
        .into_iter()
        .map(|wallet_id| {
            let service = service.clone();
            let voucher_id = voucher.id;
            tokio::spawn(async move { service.mint_now(wallet_id, voucher_id, 1, true).await })
        })
        .collect();
    for mint in mints {
        mint.await.unwrap().unwrap();
    }

    assert_eq!(chain.calls().len(), 2);
    assert_eq!(status_counts(&store).await["confirmed"], 2);
    assert_eq!(common::balance(&store, first.id, voucher.id).await, 1);
    assert_eq!(common::balance(&store, second.id, voucher.id).await, 1);
    assert_eq!(service.available_mint_permits(), 1);
    common::cleanup(&path);
}

#[tokio::test]
async fn test_mint_now_records_state_machine() {
    let store = common::store().await;
    let voucher = common::seed_voucher(&store, "coffee", 3, None).await;
    let wallet = common::seed_wallet(&store, Uuid::new_v4()).await;
    let chain = FakeChain::new();
    let service = common::service(&store, Some(chain.clone()));

    service.mint_now(wallet.id, voucher.id, 2, false).await.unwrap();
    let counts = status_counts(&store).await;
    assert_eq!(counts["sent"], 1);
    assert_eq!(common::balance(&store, wallet.id, voucher.id).await, 2);

    chain.script_receipt(ReceiptScript::Revert);
    assert!(service.mint_now(wallet.id, voucher.id, 1, true).await.is_err());
    assert_eq!(common::balance(&store, wallet.id, voucher.id).await, 2);
    assert_eq!(status_counts(&store).await["sent"], 1);

    let err = service.mint_now(wallet.id, voucher.id, 0, true).await.unwrap_err();
    assert!(matches!(err, ServiceError::Ledger(LedgerError::InvalidAmount(0))));
}

async fn custodial_user(
    store: &LedgerStore,
    service: &VoucherService,
    voucher_id: Uuid,
    amount: i64,
) -> (Uuid, Uuid) {
    let user = Uuid::new_v4();
    let wallet = service.issue_voucher(user, voucher_id, amount).await.unwrap();
    assert_eq!(common::balance(store, wallet.id, voucher_id).await, amount);
    (user, wallet.id)
}

#[tokio::test]
async fn test_export_debits_and_queues_transfer() {
    let store = common::store().await;
    let voucher = common::seed_voucher(&store, "coffee", 3, None).await;
    let service = common::service(&store, None);
    let (user, wallet_id) = custodial_user(&store, &service, voucher.id, 5).await;
    let destination = common::random_address();

    let receipt = service
        .export_voucher(user, "coffee", &destination.to_hex().to_uppercase().replace("0X", "0x"), 3)
        .await
        .unwrap();
    assert_eq!(receipt.remaining, 2);
    assert_eq!(receipt.to_address, destination.to_hex());
    assert_eq!(common::balance(&store, wallet_id, voucher.id).await, 2);

    let mut conn = store.acquire().await.unwrap();
    let intent = store.onchain_tx(&mut conn, receipt.tx_id).await.unwrap().unwrap();
    assert_eq!(intent.kind, "safeTransfer1155");
    assert_eq!(intent.status, TxStatus::Queued);
    assert_eq!(intent.amount, 3);

    let external = store
        .wallet_by_address(&mut conn, common::CHAIN_ID, &destination)
        .await
        .unwrap()
        .unwrap();
    assert!(external.is_external());
    assert_eq!(intent.to_wallet_id, Some(external.id));
    drop(conn);

    let err = service
        .export_voucher(user, "coffee", &destination.to_hex(), 3)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Ledger(LedgerError::InsufficientBalance { available: 2, requested: 3 })
    ));
}

#[tokio::test]
async fn test_external_address_belongs_to_one_user() {
    let store = common::store().await;
    let service = common::service(&store, None);
    let address = common::random_address().to_hex();

    let owner = Uuid::new_v4();
    let first = service.link_external_wallet(owner, &address).await.unwrap();
    let again = service
        .link_external_wallet(owner, &format!("  {}  ", address.trim_start_matches("0x")))
        .await
        .unwrap();
    assert_eq!(first.id, again.id);

    let err = service
        .link_external_wallet(Uuid::new_v4(), &address)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Ledger(LedgerError::AddressTaken(_))));

    let err = service
        .link_external_wallet(owner, "0x1234")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Ledger(LedgerError::InvalidAddress(_))));
}
