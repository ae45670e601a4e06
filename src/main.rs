use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use floodgate::config::FloodgateConfig;
use floodgate::ratelimit::{Decision, Identifier, LimitEnforcer, Rejection};

/// Inspect and exercise Floodgate rate limit policies.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run checks against a policy, consuming quota
    Check {
        /// Policy name
        policy: String,

        /// Explicit caller identifier (skips header resolution)
        #[arg(long)]
        identifier: Option<String>,

        /// Value of the forwarded-address chain header
        #[arg(long)]
        forwarded_for: Option<String>,

        /// Value of the real-address header
        #[arg(long)]
        real_ip: Option<String>,

        /// Number of checks to run
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
    /// Show remaining quota without consuming any
    Status {
        /// Policy name
        policy: String,

        /// Caller identifier
        identifier: String,
    },
    /// List configured policies
    Policies,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckOutput {
    #[serde(flatten)]
    decision: Decision,
    retry_after: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    rejection: Option<Rejection>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PolicyOutput<'a> {
    name: &'a str,
    window_secs: u64,
    max_requests: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = FloodgateConfig::load(cli.config.as_deref())?;
    info!(
        store = config.store.url.is_some(),
        policies = config.policies.len(),
        "Configuration loaded"
    );

    let enforcer = LimitEnforcer::from_config(&config).await?;

    match cli.command {
        Command::Check {
            policy,
            identifier,
            forwarded_for,
            real_ip,
            repeat,
        } => {
            let mut headers: Vec<(&str, &str)> = Vec::new();
            if let Some(chain) = forwarded_for.as_deref() {
                headers.push((config.identifier.forwarded_header.as_str(), chain));
            }
            if let Some(ip) = real_ip.as_deref() {
                headers.push((config.identifier.real_ip_header.as_str(), ip));
            }

            for _ in 0..repeat {
                let decision = enforcer
                    .enforce(&policy, headers.as_slice(), identifier.as_deref())
                    .await?;
                print_json(&check_output(decision, &enforcer))?;
            }

            info!(stats = ?enforcer.stats(), "Checks complete");
        }
        Command::Status { policy, identifier } => {
            let decision = enforcer
                .inspector()
                .status(&policy, &Identifier::new(identifier))
                .await?;
            print_json(&decision)?;
        }
        Command::Policies => {
            for policy in enforcer.registry().policies() {
                print_json(&PolicyOutput {
                    name: policy.name(),
                    window_secs: policy.window().as_secs(),
                    max_requests: policy.max_requests(),
                })?;
            }
        }
    }

    Ok(())
}

fn check_output(decision: Decision, enforcer: &LimitEnforcer) -> CheckOutput {
    let now = enforcer.now();
    CheckOutput {
        retry_after: decision.retry_after_secs(now),
        rejection: decision.rejection(now),
        decision,
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}
