use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "voucher-cli")]
#[command(about = "Operator CLI for the voucher settlement admin API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081", env = "VOUCHER_ADMIN_URL")]
    url: String,

    #[arg(short, long, env = "VOUCHER_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Service version, chain health and queue counts
    Status,
    /// On-chain intent counts per status
    Queue,
    /// Inspect one on-chain intent
    Tx { id: Uuid },
    /// Queue a fresh attempt for a failed intent
    Requeue {
        id: Uuid,
        /// Requeue even though the failed attempt was broadcast
        #[arg(long)]
        force: bool,
    },
    /// Run one drain pass now
    Drain,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let request = match cli.command {
        Commands::Status => client.get(format!("{}/admin/status", base)),
        Commands::Queue => client.get(format!("{}/admin/queue", base)),
        Commands::Tx { id } => client.get(format!("{}/admin/tx/{}", base, id)),
        Commands::Requeue { id, force } => client
            .post(format!("{}/admin/tx/{}/requeue", base, id))
            .query(&[("force", force)]),
        Commands::Drain => client.post(format!("{}/admin/drain", base)),
    };

    let res = request.headers(headers).send().await?;
    let ok = print_response(res).await?;
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<bool, Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(false);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(true)
}
