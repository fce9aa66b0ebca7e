//! Voucher settlement service.
//!
//! # Architecture Overview
//!
//! ```text
//!   claims / exports (library callers)
//!        │
//!        ▼
//!   ┌──────────────┐    ┌──────────────┐    ┌────────────────┐
//!   │   vouchers   │───▶│    ledger    │◀───│   settlement   │
//!   │   service    │    │ (SQLite via  │    │ queue worker / │
//!   └──────┬───────┘    │    sqlx)     │    │  drain command │
//!          │ immediate  └──────────────┘    └───────┬────────┘
//!          ▼                                        ▼
//!   ┌─────────────────────────────────────────────────────────┐
//!   │ blockchain: failover RPC, nonce allocator, ERC-1155     │
//!   └─────────────────────────────────────────────────────────┘
//!
//!   admin API (axum) ── status / queue / tx / requeue / drain
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use voucher_settlement::admin::{self, AdminState};
use voucher_settlement::blockchain::{Erc1155Client, TokenChain, Wallet};
use voucher_settlement::config::{resolve_config, SettlementConfig};
use voucher_settlement::ledger::{LedgerPool, LedgerStore};
use voucher_settlement::lifecycle::{watch_signals, Shutdown};
use voucher_settlement::observability::{init_logging, metrics};
use voucher_settlement::settlement::{QueueProcessor, SettlementWorker};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "voucher-settlement")]
#[command(about = "On-chain settlement of loyalty vouchers", version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, env = "VOUCHER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the queue worker and, when enabled, the admin API (default)
    Run,
    /// Run a single drain pass and exit
    Drain,
    /// Report failed intents whose transaction landed anyway
    Audit,
    /// Apply the ledger schema and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = resolve_config(cli.config.as_deref())?;

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "voucher-settlement starting");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Drain => {
            let processor = build_processor(&config).await?;
            let report = processor.drain_once().await?;
            println!("{}", serde_json::to_string(&report)?);
            Ok(())
        }
        Commands::Audit => {
            let processor = build_processor(&config).await?;
            let landed = processor.audit_failed().await?;
            println!("{}", serde_json::to_string_pretty(&landed)?);
            Ok(())
        }
        Commands::Migrate => {
            LedgerPool::connect(&config.database).await?;
            tracing::info!(url = %config.database.url, "Ledger schema up to date");
            Ok(())
        }
    }
}

async fn build_processor(
    config: &SettlementConfig,
) -> Result<QueueProcessor, Box<dyn std::error::Error>> {
    let store = LedgerStore::new(LedgerPool::connect(&config.database).await?);
    let wallet = Wallet::from_env(config.blockchain.chain_id)?;
    let client = Erc1155Client::connect(&config.blockchain, wallet).await?;

    tracing::info!(
        signer = %client.signer_address(),
        contract = %client.contract(),
        chain_id = client.chain_id(),
        "Chain client ready"
    );

    let chain: Arc<dyn TokenChain> = Arc::new(client);
    Ok(QueueProcessor::new(store, chain)
        .with_receipt_timeout(Duration::from_secs(config.blockchain.receipt_timeout_secs)))
}

async fn run(config: SettlementConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let processor = Arc::new(build_processor(&config).await?);

    match processor.audit_failed().await {
        Ok(landed) if !landed.is_empty() => tracing::warn!(
            count = landed.len(),
            "Failed intents have landed on-chain; reconcile before requeueing"
        ),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Startup reconciliation audit skipped"),
    }

    let shutdown = Shutdown::new();
    let mut tasks = Vec::new();

    let worker = SettlementWorker::new(processor.clone(), config.queue.clone());
    tasks.push(tokio::spawn(worker.run(shutdown.subscribe())));

    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        let state = AdminState::new(
            processor.store().clone(),
            processor.clone(),
            &config.admin.api_key,
        );
        let rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = admin::serve(listener, state, rx).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        }));
    }

    let mut stop = shutdown.subscribe();
    tokio::spawn(watch_signals(shutdown.clone()));
    let _ = stop.recv().await;
    drop(stop);

    if shutdown.join(tasks, SHUTDOWN_DEADLINE).await {
        tracing::info!("Shutdown complete");
    }
    Ok(())
}
