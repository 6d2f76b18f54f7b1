use std::path::PathBuf;
use std::time::Duration;

use acme_dns_renewer::renewal::RenewalDecision;
use acme_dns_renewer::service::build_orchestrator;
use acme_dns_renewer::{ManagerConfig, RenewalOrchestrator, RenewalRequest};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "acme-dns-renewer")]
#[command(about = "Renews ACME certificates through DNS-01 challenges", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML configuration
    #[arg(short, long, default_value = "renewer.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Show whether each certificate is due, without renewing anything
    Check,
    /// Renew every certificate that is due
    Renew {
        /// Renew regardless of the stored certificate
        #[arg(long)]
        force: bool,
        /// Only consider the certificate with this name
        #[arg(long)]
        only: Option<String>,
    },
    /// Re-run the renewal batch on a fixed interval
    Watch {
        #[arg(long, default_value_t = 60)]
        interval_minutes: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = ManagerConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let orchestrator = build_orchestrator(&config)?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling the current run");
            signal_token.cancel();
        }
    });

    match cli.command {
        Commands::Check => check(&orchestrator).await,
        Commands::Renew { force, only } => {
            let request = RenewalRequest { force, only };
            let summary = orchestrator.renew_selected(&request, &cancel).await?;
            println!(
                "renewed: {}",
                if summary.renewed.is_empty() {
                    "none".to_string()
                } else {
                    summary.renewed.join(", ")
                }
            );
            Ok(())
        }
        Commands::Watch { interval_minutes } => {
            watch(&orchestrator, Duration::from_secs(interval_minutes.max(1) * 60), &cancel).await
        }
    }
}

async fn check(orchestrator: &RenewalOrchestrator) -> Result<()> {
    for check in orchestrator.evaluate_all().await? {
        match check.decision {
            RenewalDecision::Renew(reason) => println!("{:<32} renew ({})", check.name, reason),
            RenewalDecision::Current => println!("{:<32} current", check.name),
        }
    }
    Ok(())
}

async fn watch(
    orchestrator: &RenewalOrchestrator,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    info!("watching every {} minute(s)", interval.as_secs() / 60);
    loop {
        match orchestrator.renew_certificates(cancel).await {
            Ok(summary) if summary.renewed.is_empty() => info!("nothing to renew"),
            Ok(summary) => info!("renewed {}", summary.renewed.join(", ")),
            Err(err) => error!("{err}"),
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("watch stopped");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
