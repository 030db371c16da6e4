use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fleetmedic::audit::AuditLogger;
use fleetmedic::config::{FleetConfig, LoggingConfig};
use fleetmedic::incident::{CloseOutcome, Incident, IncidentRegistry};
use fleetmedic::storage::Store;

#[derive(Parser)]
#[command(
    name = "fleetmedic",
    about = "Detect, diagnose and remediate faults across a service fleet",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $FLEETMEDIC_CONFIG, then /etc/fleetmedic/fleetmedic.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the database path from the configuration
    #[arg(long, global = true, env = "FLEETMEDIC_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (control loop + dashboard API)
    Run,

    /// Drive the built-in simulated fleet with injected faults
    Simulate {
        /// Maximum number of ticks to run
        #[arg(long, default_value = "60")]
        cycles: u32,

        /// Number of random faults to inject before the first tick
        #[arg(long, default_value = "2")]
        faults: usize,

        /// Seed for the fleet baseline and fault selection
        #[arg(long)]
        seed: Option<u64>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect or close incidents
    Incidents {
        #[command(subcommand)]
        action: IncidentAction,
    },

    /// Read the audit trail
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Subcommand)]
enum IncidentAction {
    /// List recent incidents
    List {
        /// Only incidents that are not yet resolved, escalated or abandoned
        #[arg(long)]
        open: bool,

        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Show one incident with its history, decisions and attempts
    Show {
        id: Uuid,
    },

    /// Abandon an open incident
    Abandon {
        id: Uuid,

        #[arg(long, default_value = "abandoned by operator")]
        reason: String,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Print audit records as JSON lines
    Tail {
        /// Start after this sequence number
        #[arg(long, default_value = "0")]
        after: i64,

        #[arg(long, default_value = "100")]
        limit: usize,

        /// Keep polling for new records until interrupted
        #[arg(long)]
        follow: bool,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
        }
        child.cancel();
    });
    token
}

fn open_store(config: &FleetConfig) -> Result<Store> {
    fleetmedic::open_store(&config.storage.db_path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = FleetConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    if let Some(db) = &cli.db {
        config.storage.db_path = db.clone();
    }

    match cli.command {
        Commands::Run => {
            tracing::info!(db_path = %config.storage.db_path.display(), "starting fleetmedic daemon");
            let shutdown = shutdown_on_ctrl_c();
            let runtime = fleetmedic::assemble(config, shutdown.clone()).await?;
            runtime.run(shutdown).await?;
        }
        Commands::Simulate {
            cycles,
            faults,
            seed,
            json,
        } => {
            if cli.db.is_none() {
                config.storage.db_path =
                    std::env::temp_dir().join(format!("fleetmedic-sim-{}.db", Uuid::new_v4()));
            }
            if let Some(seed) = seed {
                config.source.seed = seed;
            }
            let report = fleetmedic::simulate(config, cycles, faults).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
            } else {
                print_report(&report);
            }
        }
        Commands::Incidents { action } => {
            let store = open_store(&config)?;
            match action {
                IncidentAction::List { open, limit } => {
                    let incidents = store.list_incidents(open, limit)?;
                    if incidents.is_empty() {
                        println!("No incidents found.");
                    } else {
                        print_incident_table(&incidents);
                    }
                }
                IncidentAction::Show { id } => {
                    let incident = store
                        .get_incident(&id)?
                        .with_context(|| format!("incident {id} not found"))?;
                    let detail = serde_json::json!({
                        "incident": incident,
                        "decisions": store.decisions_for_incident(&id)?,
                        "attempts": store.attempts_for_incident(&id)?,
                    });
                    println!("{}", serde_json::to_string_pretty(&detail)?);
                }
                IncidentAction::Abandon { id, reason } => {
                    let audit = Arc::new(AuditLogger::new(store, config.store_retry.clone()));
                    let registry = IncidentRegistry::new(audit, config.orchestrator.max_attempts);
                    let incident = registry.close(id, CloseOutcome::Abandoned { reason }).await?;
                    println!("Incident {} is now {}.", incident.incident_id, incident.state);
                }
            }
        }
        Commands::Audit { action } => match action {
            AuditAction::Tail { after, limit, follow } => {
                let store = open_store(&config)?;
                tail_audit(&store, after, limit, follow).await?;
            }
        },
    }

    Ok(())
}

fn print_incident_table(incidents: &[Incident]) {
    println!(
        "{:<36} | {:<12} | {:<8} | {:<8} | Signature",
        "Incident", "State", "Severity", "Attempts"
    );
    println!("{:-<36}-|-{:-<12}-|-{:-<8}-|-{:-<8}-|-{:-<30}", "", "", "", "", "");
    for i in incidents {
        println!(
            "{:<36} | {:<12} | {:<8} | {:<8} | {}",
            i.incident_id, i.state, i.severity, i.attempt_count, i.signature
        );
    }
}

fn report_json(report: &fleetmedic::SimulationReport) -> serde_json::Value {
    let faults = |list: &[(String, fleetmedic::sim::FaultScenario)]| {
        list.iter()
            .map(|(svc, f)| serde_json::json!({"service": svc, "fault": f.as_str()}))
            .collect::<Vec<_>>()
    };
    serde_json::json!({
        "ticks": report.ticks,
        "injected": faults(&report.injected),
        "remaining_faults": faults(&report.remaining_faults),
        "incidents": report.incidents,
    })
}

fn print_report(report: &fleetmedic::SimulationReport) {
    println!("\n=== fleetmedic simulation ===");
    println!("Ticks run: {}", report.ticks);
    println!("\nInjected faults:");
    for (svc, fault) in &report.injected {
        println!(" - {svc}: {fault}");
    }
    println!("\nIncidents:");
    if report.incidents.is_empty() {
        println!(" (none)");
    } else {
        print_incident_table(&report.incidents);
    }
    if report.remaining_faults.is_empty() {
        println!("\nAll injected faults cleared.");
    } else {
        println!("\nStill faulted:");
        for (svc, fault) in &report.remaining_faults {
            println!(" - {svc}: {fault}");
        }
    }
    println!();
}

async fn tail_audit(store: &Store, mut after: i64, limit: usize, follow: bool) -> Result<()> {
    let shutdown = if follow { Some(shutdown_on_ctrl_c()) } else { None };
    loop {
        let records = store.audit_after(after, limit.max(1))?;
        for record in &records {
            println!("{}", serde_json::to_string(record)?);
            if let Some(seq) = record.seq {
                after = seq;
            }
        }
        let Some(token) = &shutdown else {
            return Ok(());
        };
        if records.len() >= limit.max(1) {
            continue;
        }
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
}
