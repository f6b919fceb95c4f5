//! spot-gpu CLI - budget-capped GPU spot instance provisioning.

use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spot_gpu::pricing::{best_zone, PriceStats, Savings};
use spot_gpu::provision::AttemptState;
use spot_gpu::readiness::SubsystemStatus;
use spot_gpu::{
    CloudApi, ConfigError, Ec2Client, Orchestrator, OrchestratorError, ProvisioningError,
    ReadinessError, ReadinessReport, RegionOutcome, SelectionError, Settings, Shortlist,
};

/// spot-gpu - Provision the most cost-efficient GPU spot instance under a budget.
#[derive(Parser)]
#[command(name = "spot-gpu")]
#[command(about = "Select, provision and validate GPU spot instances under an hourly budget")]
struct Cli {
    /// Settings file (TOML).
    #[arg(long, env = "SPOT_GPU_CONFIG")]
    config: Option<PathBuf>,

    /// Hourly budget in USD (overrides settings and `SPOT_GPU_BUDGET`).
    #[arg(long)]
    budget: Option<f64>,

    /// Primary region (overrides settings and `SPOT_GPU_REGION`).
    #[arg(long)]
    region: Option<String>,

    /// Also search the extra regions.
    #[arg(long, default_value = "false")]
    cross_region: bool,

    /// Candidate instance types (comma-separated).
    #[arg(long, value_delimiter = ',')]
    instance_types: Vec<String>,

    /// Provisioning API endpoint.
    #[arg(long, env = "SPOT_GPU_ENDPOINT")]
    endpoint: Option<String>,

    /// Abort the whole run after this many seconds (0 = no limit).
    #[arg(long, default_value = "0")]
    timeout_secs: u64,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Rank candidate configurations and show the winner.
    Select {
        /// Print the shortlist as JSON.
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Select, provision and validate an instance.
    Provision {
        /// Stop once the instance is running.
        #[arg(long, default_value = "false")]
        skip_validation: bool,
    },

    /// Run readiness validation against an existing host.
    Validate {
        /// Host address.
        #[arg(long)]
        host: String,
    },

    /// Show spot price statistics and savings for an instance type.
    Prices {
        /// Instance type.
        #[arg(long)]
        instance_type: String,

        /// Region (defaults to the primary region).
        #[arg(long)]
        region: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => return Err(report_failure(e.into())),
    };

    let mut client = Ec2Client::new().context("Failed to create provisioning API client")?;
    if let Some(endpoint) = cli.endpoint.clone().or_else(|| settings.market.endpoint.clone()) {
        client = client.with_endpoint(endpoint);
    }
    let api: Arc<dyn CloudApi> = Arc::new(client);
    let remote = Arc::new(settings.ssh_executor());
    let orchestrator = Orchestrator::from_settings(&settings, Arc::clone(&api), remote);

    let cancel = CancellationToken::new();
    spawn_cancel_watcher(cancel.clone(), cli.timeout_secs);

    let regions = settings.regions();

    match cli.command {
        Commands::Select { json } => {
            let shortlist = orchestrator
                .selector()
                .shortlist(settings.budget, &regions, &settings.instance_types)
                .await;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&shortlist)
                        .context("Failed to serialize shortlist")?
                );
                return shortlist.into_best().map(|_| ()).map_err(|e| {
                    // stdout carries the JSON document
                    write_remedies(&mut std::io::stderr(), &e.remedies());
                    anyhow::Error::from(e).context("Selection failed")
                });
            }
            print_shortlist(&shortlist);

            match shortlist.into_best() {
                Ok(best) => {
                    println!(
                        "\n🏆 Selected {} in {} at ${:.4}/hr (efficiency {:.1})",
                        best.instance_type, best.zone, best.spot_price, best.efficiency_score
                    );
                    if best.on_demand_price > 0.0 {
                        let savings = best.savings();
                        println!(
                            "   Saves ${:.4}/hr, ${:.2}/month ({:.1}%) over on-demand",
                            savings.hourly, savings.monthly, savings.percent
                        );
                    }
                }
                Err(e) => return Err(report_failure(e.into())),
            }
        }

        Commands::Provision { skip_validation } => {
            let host = match orchestrator
                .select_and_provision(
                    settings.budget,
                    &regions,
                    &settings.instance_types,
                    &cancel,
                )
                .await
            {
                Ok(host) => host,
                Err(e) => return Err(report_failure(e)),
            };

            println!("\n✅ Instance running!");
            println!("   ID:       {}", host.instance_id);
            println!("   Type:     {}", host.instance_type);
            println!("   Image:    {}", host.image_id);
            println!("   Zone:     {}", host.zone);
            println!("   Ceiling:  ${:.4}/hr", host.max_price);
            let address = host.address().unwrap_or_default().to_string();
            println!("   Address:  {address}");
            println!("   Attempts: {}", host.attempts.len());

            if skip_validation {
                println!(
                    "\n💡 Run `spot-gpu validate --host {address}` to check readiness"
                );
                return Ok(());
            }

            println!("\n⏳ Waiting for {address} to become ready...");
            match orchestrator.validate_readiness(&address, &cancel).await {
                Ok(report) => print_report(&report),
                Err(e) => return Err(report_failure(e)),
            }
        }

        Commands::Validate { host } => {
            println!("⏳ Validating {host}...");
            match orchestrator.validate_readiness(&host, &cancel).await {
                Ok(report) => print_report(&report),
                Err(e) => return Err(report_failure(e)),
            }
        }

        Commands::Prices {
            instance_type,
            region,
        } => {
            let region = region.unwrap_or_else(|| settings.region.clone());
            let samples = api
                .get_spot_price_history(&region, std::slice::from_ref(&instance_type), None)
                .await
                .context("Failed to fetch spot price history")?;
            let samples: Vec<_> = samples
                .into_iter()
                .filter(|s| s.instance_type == instance_type)
                .collect();

            let stats = PriceStats::from_samples(&samples);
            println!("\n💰 Spot prices for {instance_type} in {region}");
            println!("{}", "=".repeat(78));
            println!(
                "{:<18} {:>10} {:>10} {:>10} {:>10} {:>10} {:>5}",
                "ZONE", "CURRENT", "AVG", "MIN", "MAX", "VOLATIL.", "N"
            );
            for s in &stats {
                println!(
                    "{:<18} {:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>9.1}% {:>5}",
                    s.zone,
                    s.current_price,
                    s.avg_price,
                    s.min_price,
                    s.max_price,
                    s.volatility * 100.0,
                    s.sample_count
                );
            }

            let table = orchestrator.selector().price_table();
            match best_zone(&stats) {
                Some(best) => {
                    println!("\n🏆 Cheapest zone: {} at ${:.4}/hr", best.zone, best.current_price);
                    if let Some(entry) = table.lookup(&region, &instance_type) {
                        let savings = Savings::new(best.current_price, entry.on_demand_price);
                        println!(
                            "   On-demand ${:.4}/hr, saving ${:.4}/hr, ${:.2}/day, ${:.2}/month ({:.1}%)",
                            entry.on_demand_price,
                            savings.hourly,
                            savings.daily,
                            savings.monthly,
                            savings.percent
                        );
                    }
                }
                None => {
                    println!("\n⚠️  No live prices for {instance_type} in {region}");
                    if let Some(entry) = table.lookup(&region, &instance_type) {
                        println!(
                            "   Fallback table ({}): spot ~${:.4}/hr, on-demand ${:.4}/hr",
                            table.version, entry.spot_price_estimate, entry.on_demand_price
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

/// Settings from file and environment, with CLI flags on top.
fn load_settings(cli: &Cli) -> Result<Settings, ConfigError> {
    let mut settings = Settings::load(cli.config.as_deref())?;

    if let Some(budget) = cli.budget {
        settings.budget = budget;
    }
    if let Some(region) = &cli.region {
        settings.region.clone_from(region);
    }
    if cli.cross_region {
        settings.cross_region = true;
    }
    if !cli.instance_types.is_empty() {
        settings.instance_types.clone_from(&cli.instance_types);
    }

    settings.validate()?;
    Ok(settings)
}

/// Cancel the run on Ctrl-C or when the overall deadline passes.
fn spawn_cancel_watcher(cancel: CancellationToken, timeout_secs: u64) {
    tokio::spawn(watch_cancel(cancel, timeout_secs, tokio::signal::ctrl_c()));
}

/// Fire `cancel` on `interrupt` or after `timeout_secs` (0 = never).
///
/// If the interrupt listener fails, the deadline still applies.
async fn watch_cancel<F>(cancel: CancellationToken, timeout_secs: u64, interrupt: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    let deadline = async {
        if timeout_secs == 0 {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
        }
    };
    tokio::pin!(deadline);

    tokio::select! {
        result = interrupt => match result {
            Ok(()) => info!("Interrupted, cleaning up"),
            Err(e) => {
                warn!("Failed to listen for Ctrl-C, only the run deadline applies: {e}");
                tokio::select! {
                    () = &mut deadline => info!(timeout_secs, "Run deadline reached, cleaning up"),
                    () = cancel.cancelled() => return,
                }
            }
        },
        () = &mut deadline => info!(timeout_secs, "Run deadline reached, cleaning up"),
        () = cancel.cancelled() => return,
    }
    cancel.cancel();
}

fn print_shortlist(shortlist: &Shortlist) {
    println!("\n🎮 Candidate configurations (budget ${:.2}/hr)", shortlist.budget);
    println!("{}", "=".repeat(96));
    println!(
        "{:<14} {:<16} {:>9} {:>9} {:>6} {:>9} {:>9} {:<9} {:<6}",
        "TYPE", "ZONE", "SPOT", "ON-DEM", "SCORE", "EFFIC.", "WEIGHTED", "IMAGE", "PRICE"
    );

    for c in &shortlist.ranked {
        let marker = if c.spot_price <= shortlist.budget { "🟢" } else { "🔴" };
        println!(
            "{marker} {:<11} {:<16} {:>9.4} {:>9.4} {:>6} {:>9.1} {:>9.1} {:<9} {:<6}",
            c.instance_type,
            c.zone,
            c.spot_price,
            c.on_demand_price,
            c.performance_score,
            c.efficiency_score,
            c.weighted_efficiency(),
            c.image_tier.to_string(),
            if c.price_source == spot_gpu::scoring::PriceSource::Live { "live" } else { "table" },
        );
    }

    println!();
    for outcome in &shortlist.outcomes {
        match outcome {
            RegionOutcome::Affordable {
                region,
                best,
                in_budget,
            } => println!(
                "   📍 {region}: {} in {} at ${:.4}/hr ({in_budget} in budget)",
                best.instance_type, best.zone, best.spot_price
            ),
            RegionOutcome::OverBudget {
                region,
                closest_miss,
            } => println!(
                "   📍 {region}: nothing in budget, closest {} at ${:.4}/hr",
                closest_miss.instance_type, closest_miss.spot_price
            ),
            RegionOutcome::Skipped { region, reason } => {
                println!("   📍 {region}: skipped ({reason})");
            }
        }
    }
}

fn print_report(report: &ReadinessReport) {
    println!("\n✅ {} is ready!", report.host);
    for phase in &report.phases {
        println!(
            "   {:<16} {:>4} checks, {}s",
            phase.phase.to_string(),
            phase.attempts,
            phase.elapsed.as_secs()
        );
    }
    for check in &report.subsystems {
        let emoji = match check.status {
            SubsystemStatus::Pass => "🟢",
            SubsystemStatus::Warn => "🟡",
        };
        println!("   {emoji} {:<18} {}", check.name, check.detail);
    }
    if !report.all_subsystems_pass() {
        println!("\n⚠️  Some subsystems need attention; the host is reachable");
    }
}

/// Print an error with its context and remedies, returning it for exit.
fn report_failure(err: OrchestratorError) -> anyhow::Error {
    println!("\n❌ {err}");

    match &err {
        OrchestratorError::Selection(SelectionError::NoAffordableConfiguration {
            outcomes, ..
        }
        | SelectionError::NoCandidates { outcomes, .. }) => {
            for outcome in outcomes {
                if let RegionOutcome::Skipped { region, reason } = outcome {
                    println!("   📍 {region}: {reason}");
                }
            }
        }
        OrchestratorError::Provisioning(
            ProvisioningError::Exhausted { attempts, .. }
            | ProvisioningError::Cancelled { attempts, .. },
        ) => {
            for attempt in attempts {
                let emoji = match attempt.state {
                    AttemptState::Active => "🟢",
                    AttemptState::Cancelled => "🟡",
                    AttemptState::Pending | AttemptState::Failed => "🔴",
                };
                println!(
                    "   {emoji} {:<16} {:<10} {}",
                    attempt.zone,
                    attempt.state.to_string(),
                    attempt
                        .reason
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default()
                );
            }
        }
        OrchestratorError::Readiness(ReadinessError::Timeout { diagnostics, .. }) => {
            if let Some(checkpoint) = &diagnostics.last_checkpoint {
                println!("   Last check #{}: {}", checkpoint.attempt, checkpoint.detail);
            }
            for error in &diagnostics.recent_errors {
                println!("   {error}");
            }
            if let Some(usage) = &diagnostics.resource_usage {
                println!("\n   Resource usage:");
                for line in usage.lines() {
                    println!("   {line}");
                }
            }
            print_log_tail(&diagnostics.log_tail);
        }
        OrchestratorError::Readiness(ReadinessError::Setup {
            log_tail, progress, ..
        }) => {
            for stage in progress {
                println!("   {:<26} {:?}", stage.stage, stage.status);
            }
            print_log_tail(log_tail);
        }
        _ => {}
    }

    write_remedies(&mut std::io::stdout(), &err.remedies());
    err.into()
}

fn write_remedies(out: &mut impl Write, remedies: &[String]) {
    if remedies.is_empty() {
        return;
    }
    let _ = writeln!(out);
    for remedy in remedies {
        let _ = writeln!(out, "💡 {remedy}");
    }
}

fn print_log_tail(lines: &[String]) {
    if lines.is_empty() {
        return;
    }
    println!("\n   Last log lines:");
    for line in lines {
        println!("   │ {line}");
    }
}
