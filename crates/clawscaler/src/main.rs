//! clawscaler - Clawbernetes autoscaling daemon
//!
//! Turns workload metrics into replica counts.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use claw_autoscaler::load_policies;
use clawscaler::{shutdown_signal, Daemon, DaemonConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "clawscaler")]
#[command(about = "Clawbernetes autoscaling daemon")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "CLAWSCALER_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the autoscaler
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/clawscaler/config.json")]
        config: PathBuf,
    },

    /// Check a config file or a policy document
    Validate {
        /// Path to config file; its policy document is checked too
        #[arg(short, long, conflicts_with = "policies")]
        config: Option<PathBuf>,

        /// Path to a policy document
        #[arg(short, long)]
        policies: Option<PathBuf>,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/clawscaler/config.json")]
        output: PathBuf,

        /// Policy document the config points at
        #[arg(long, default_value = "/etc/clawscaler/policies.json")]
        policies: PathBuf,
    },
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("clawscaler=info".parse()?);
    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .with(filter)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = DaemonConfig::from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            init_tracing(cli.json_logs || config.json_logs)?;
            run(config).await?;
        }

        Commands::Validate { config, policies } => {
            init_tracing(cli.json_logs)?;
            validate(config, policies)?;
        }

        Commands::InitConfig { output, policies } => {
            init_config(&output, policies)?;
        }
    }

    Ok(())
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let daemon = Daemon::new(config)?;
    let token = daemon.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });

    let running = daemon.start().await?;
    if let Some(addr) = running.status_addr() {
        info!(addr = %addr, "status endpoint ready");
    }
    running.wait().await?;
    Ok(())
}

fn validate(config: Option<PathBuf>, policies: Option<PathBuf>) -> anyhow::Result<()> {
    let path = match (config, policies) {
        (Some(config), _) => {
            let config = DaemonConfig::from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            println!("Config OK");
            config.policies_path
        }
        (None, Some(policies)) => policies,
        (None, None) => anyhow::bail!("pass --config or --policies"),
    };

    let report = load_policies(&path).with_context(|| format!("loading {}", path.display()))?;
    for policy in &report.policies {
        println!(
            "  {} ({}..={} replicas, {} metric(s)){}",
            policy.workload,
            policy.min_replicas,
            policy.max_replicas,
            policy.targets.len(),
            if policy.enabled { "" } else { " [disabled]" }
        );
    }
    for rejected in &report.rejected {
        println!("  REJECTED {}: {}", rejected.workload, rejected.reason);
    }

    if report.has_rejections() {
        anyhow::bail!(
            "{} of {} policies rejected",
            report.rejected.len(),
            report.rejected.len() + report.policies.len()
        );
    }
    println!("{} policies OK", report.policies.len());
    Ok(())
}

fn init_config(output: &Path, policies: PathBuf) -> anyhow::Result<()> {
    let config = DaemonConfig::new(policies);
    config.save(output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Point policies_path at your policy document, then run:");
    println!("  clawscaler validate --config {}", output.display());
    println!("  clawscaler run --config {}", output.display());

    Ok(())
}
