//! Admin CLI for the recurrence and orchestration engines.
//!
//! Exit codes: 0 success, 2 bad input, 3 not found, 4 conflict
//! (including an observed idempotency replay), 5 internal.

mod builtin;
mod config;
mod stores;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use uuid::Uuid;

use baton::{DlqReason, Env, Orchestrator};
use config::Config;
use metronome::Generator;
use stores::{PgDefinitionStore, PgDlqStore, PgExecutionStore, PgLedger, PgRuleStore};

#[derive(Parser)]
#[command(name = "engine-admin", about = "Recurrence and orchestration engine admin")]
struct Cli {
    /// Tenant every command operates on.
    #[arg(long, global = true, default_value = "default")]
    tenant: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recurrence rules
    Rules {
        #[command(subcommand)]
        command: RulesCommand,
    },
    /// Workflow definitions
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommand,
    },
    /// Workflow executions
    Executions {
        #[command(subcommand)]
        command: ExecutionsCommand,
    },
    /// Dead letter queue review
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
    /// Apply database migrations
    Migrate,
}

#[derive(Subcommand)]
enum RulesCommand {
    /// Materialize periods starting within the horizon
    Tick {
        /// Window size, e.g. "30d" or "12h"
        #[arg(long)]
        horizon: String,
        /// Restrict to one rule
        #[arg(long)]
        rule: Option<Uuid>,
    },
    /// Materialize history up to a timestamp
    Backfill {
        #[arg(long)]
        rule: Uuid,
        /// RFC 3339 timestamp or YYYY-MM-DD
        #[arg(long)]
        until: String,
    },
    Pause {
        #[arg(long)]
        rule: Uuid,
    },
    Resume {
        #[arg(long)]
        rule: Uuid,
    },
    Cancel {
        #[arg(long)]
        rule: Uuid,
    },
}

#[derive(Subcommand)]
enum WorkflowCommand {
    /// Publish a definition JSON file as the next version of its code
    Publish { file: PathBuf },
}

#[derive(Subcommand)]
enum ExecutionsCommand {
    /// Start an execution (idempotent per key)
    Start {
        code: String,
        key: String,
        /// Input JSON document
        input: String,
    },
    /// Drive an execution until it blocks or completes
    Advance { id: Uuid },
}

#[derive(Subcommand)]
enum DlqCommand {
    List {
        /// e.g. max_attempts_exceeded, non_retryable_error
        #[arg(long)]
        reason: Option<String>,
    },
    Reprocess {
        id: Uuid,
        #[arg(long)]
        outcome: String,
        #[arg(long, default_value = "admin-cli")]
        by: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::from(2);
        }
    };

    match run(cli, &config).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err, &config);
            ExitCode::from(classify_exit(&err))
        }
    }
}

fn report_error(err: &anyhow::Error, config: &Config) {
    match &config.default_timezone {
        Some(zone) => eprintln!("error: {err:#} (default zone: {zone})"),
        None => eprintln!("error: {err:#}"),
    }
}

fn classify_exit(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<metronome::Error>() {
        return match e {
            metronome::Error::BadRule(_) => 2,
            metronome::Error::NotFound(_) => 3,
            metronome::Error::Conflict(_) => 4,
            _ => 5,
        };
    }
    if let Some(e) = err.downcast_ref::<baton::Error>() {
        return match e {
            baton::Error::BadDefinition(_) | baton::Error::BadInput(_) => 2,
            baton::Error::NotFound(_) => 3,
            baton::Error::Conflict(_) => 4,
            _ => 5,
        };
    }
    5
}

async fn run(cli: Cli, config: &Config) -> Result<ExitCode> {
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")?;

    if let Commands::Migrate = cli.command {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("applying migrations")?;
        println!("migrations applied");
        return Ok(ExitCode::SUCCESS);
    }

    let generator = Generator::new(
        Arc::new(metronome::SystemClock),
        Arc::new(PgRuleStore::new(pool.clone())),
        Arc::new(PgLedger::new(pool.clone())),
        builtin::factories(pool.clone()),
    );
    let orchestrator = Orchestrator::new(
        Env::system(config.rng_seed),
        Arc::new(PgDefinitionStore::new(pool.clone())),
        Arc::new(PgExecutionStore::new(pool.clone())),
        Arc::new(PgDlqStore::new(pool.clone())),
        Arc::new(builtin::handlers()),
    );

    let tenant = cli.tenant.as_str();
    match cli.command {
        Commands::Migrate => unreachable!("handled above"),

        Commands::Rules { command } => match command {
            RulesCommand::Tick { horizon, rule } => {
                let horizon = parse_horizon(&horizon)?;
                let subset = rule.map(|id| vec![id]);
                let report = generator
                    .tick(tenant, horizon, subset.as_deref())
                    .await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            RulesCommand::Backfill { rule, until } => {
                let until = parse_timestamp(&until)?;
                let report = generator.backfill(tenant, rule, until).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            RulesCommand::Pause { rule } => {
                generator.pause(tenant, rule).await?;
                println!("rule {rule} paused");
            }
            RulesCommand::Resume { rule } => {
                generator.resume(tenant, rule).await?;
                println!("rule {rule} resumed");
            }
            RulesCommand::Cancel { rule } => {
                generator.cancel(tenant, rule).await?;
                println!("rule {rule} canceled");
            }
        },

        Commands::Workflow { command } => match command {
            WorkflowCommand::Publish { file } => {
                let raw = std::fs::read_to_string(&file)
                    .with_context(|| format!("reading {}", file.display()))?;
                let spec: serde_json::Value = serde_json::from_str(&raw)
                    .map_err(|e| baton::Error::BadDefinition(e.to_string()))?;
                let definition = orchestrator.publish(tenant, spec).await?;
                println!(
                    "published {} version {} ({})",
                    definition.code, definition.version, definition.id
                );
            }
        },

        Commands::Executions { command } => match command {
            ExecutionsCommand::Start { code, key, input } => {
                let input: serde_json::Value = serde_json::from_str(&input)
                    .map_err(|e| baton::Error::BadInput(e.to_string()))?;
                let started = orchestrator.start(tenant, &code, input, &key).await?;
                println!("{}", serde_json::to_string_pretty(&started.execution)?);
                if started.replayed {
                    // Replay is success for the engine; the exit code lets
                    // scripts see it happened.
                    return Ok(ExitCode::from(4));
                }
            }
            ExecutionsCommand::Advance { id } => {
                let advanced = orchestrator.drain(id).await?;
                match advanced.outcome {
                    baton::AdvanceOutcome::Completed(status) => {
                        println!("execution {id}: {}", status.as_str());
                    }
                    baton::AdvanceOutcome::WaitUntil(t) => {
                        println!("execution {id}: waiting until {t}");
                    }
                    other => println!("execution {id}: {other:?}"),
                }
            }
        },

        Commands::Dlq { command } => match command {
            DlqCommand::List { reason } => {
                let reason = match reason {
                    Some(raw) => Some(
                        raw.parse::<DlqReason>()
                            .map_err(|e| baton::Error::BadInput(e))?,
                    ),
                    None => None,
                };
                let entries = orchestrator.list_dlq(tenant, reason).await?;
                println!("{}", serde_json::to_string_pretty(&entries)?);
            }
            DlqCommand::Reprocess { id, outcome, by } => {
                let entry = orchestrator.reprocess_dlq(tenant, id, &by, &outcome).await?;
                println!("{}", serde_json::to_string_pretty(&entry)?);
            }
        },
    }

    Ok(ExitCode::SUCCESS)
}

fn parse_horizon(raw: &str) -> Result<chrono::Duration> {
    let std_duration = humantime::parse_duration(raw)
        .map_err(|e| metronome::Error::BadRule(format!("bad horizon: {e}")))?;
    chrono::Duration::from_std(std_duration)
        .map_err(|e| metronome::Error::BadRule(format!("horizon out of range: {e}")).into())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Ok(instant.with_timezone(&Utc));
    }
    let date = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| metronome::Error::BadRule(format!("bad timestamp: {e}")))?;
    Ok(date.and_time(chrono::NaiveTime::MIN).and_utc())
}
