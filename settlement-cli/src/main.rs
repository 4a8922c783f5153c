//! Settlement CLI
//!
//! Operator front end for the settlement engine. Ledger commands run
//! against PostgreSQL; `split` and `demo` need no database.

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use settlement_engine::{
    clock::{ManualClock, SystemClock},
    config::SettlementConfig,
    engine::NewEngagement,
    models::{CancelReason, PaymentStatus, Role},
    notifier::{LogNotifier, RecordingNotifier},
    refund_policy::{self, RefundSplit},
    store::{InMemoryLedger, PgLedger},
    ConfirmOutcome, SettlementEngine,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "settlement", version, about = "Escrow settlement ledger operations")]
struct Cli {
    /// Path to a configuration file (defaults to ./settlement.toml if present)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply the ledger schema migrations
    Migrate,

    /// Book a new engagement
    Book {
        #[arg(long)]
        requester: String,
        #[arg(long)]
        provider: String,
        /// Scheduled date, YYYY-MM-DD (UTC)
        #[arg(long)]
        date: NaiveDate,
        /// Start time, HH:MM:SS
        #[arg(long)]
        start: Option<NaiveTime>,
        /// End time, HH:MM:SS
        #[arg(long)]
        end: Option<NaiveTime>,
        /// Amount in whole currency units
        #[arg(long)]
        amount: i64,
    },

    /// Record captured funds as held in escrow
    Hold {
        #[arg(long)]
        event: Uuid,
        #[arg(long)]
        payer: String,
    },

    /// Confirm an engagement for one party
    Confirm {
        #[arg(long)]
        event: Uuid,
        #[arg(long)]
        actor: String,
        /// requester | provider
        #[arg(long, value_parser = parse_role)]
        role: Role,
    },

    /// Cancel an engagement and refund the escrowed payment
    Cancel {
        #[arg(long)]
        event: Uuid,
        #[arg(long)]
        actor: String,
        /// requester | provider
        #[arg(long, value_parser = parse_role)]
        by: Role,
        /// requester_cancelled | provider_cancelled | provider_no_show
        #[arg(long, value_parser = parse_reason)]
        reason: CancelReason,
    },

    /// List an actor's engagements, finalizing past ones first
    List {
        #[arg(long)]
        actor: String,
    },

    /// Show the payment of an engagement with its split
    Payment {
        #[arg(long)]
        event: Uuid,
    },

    /// Show the audit trail of an engagement
    Audit {
        #[arg(long)]
        event: Uuid,
    },

    /// Compute a split without touching the ledger
    Split {
        #[arg(long)]
        amount: i64,
        /// RELEASED | REFUNDED_FULL | REFUNDED_PARTIAL
        #[arg(long, value_parser = parse_status)]
        status: PaymentStatus,
    },

    /// Play a dual confirmation against an in-memory ledger
    Demo,
}

fn parse_role(value: &str) -> Result<Role, String> {
    serde_json::from_value(json!(value)).map_err(|_| format!("unknown role: {}", value))
}

fn parse_reason(value: &str) -> Result<CancelReason, String> {
    serde_json::from_value(json!(value)).map_err(|_| format!("unknown cancel reason: {}", value))
}

fn parse_status(value: &str) -> Result<PaymentStatus, String> {
    serde_json::from_value(json!(value.to_uppercase()))
        .map_err(|_| format!("unknown payment status: {}", value))
}

fn split_for(amount: i64, status: PaymentStatus) -> Result<RefundSplit> {
    anyhow::ensure!(
        amount > 0 && amount <= refund_policy::MAX_AMOUNT,
        "amount must be between 1 and {}, got {}",
        refund_policy::MAX_AMOUNT,
        amount
    );
    refund_policy::split(amount, status).context("funds still in escrow have no split")
}

fn init_tracing(fallback: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn confirm_json(outcome: &ConfirmOutcome) -> serde_json::Value {
    json!({
        "accepted": outcome.accepted,
        "both_confirmed": outcome.both_confirmed,
        "engagement": outcome.engagement,
        "payment": outcome.release.as_ref().map(|release| release.payment()),
        "released_by_this_call": outcome.release.as_ref().is_some_and(|release| release.fired()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = SettlementConfig::load(cli.config.as_deref())
        .context("failed to load settlement configuration")?;
    init_tracing(&config.log_filter);

    match cli.command {
        Commands::Split { amount, status } => print_json(&json!(split_for(amount, status)?)),
        Commands::Demo => run_demo(&config).await,
        command => run_ledger_command(&config, command).await,
    }
}

async fn run_ledger_command(config: &SettlementConfig, command: Commands) -> Result<()> {
    let ledger = PgLedger::connect(config)
        .await
        .context("failed to connect to the settlement ledger")?;

    if let Commands::Migrate = command {
        ledger.migrate().await?;
        return Ok(());
    }

    let engine = SettlementEngine::new(
        config,
        Arc::new(ledger),
        Arc::new(LogNotifier),
        Arc::new(SystemClock),
    );

    match command {
        Commands::Book {
            requester,
            provider,
            date,
            start,
            end,
            amount,
        } => {
            let engagement = engine
                .book(NewEngagement {
                    requester_id: requester,
                    provider_id: provider,
                    date,
                    start_time: start,
                    end_time: end,
                    final_amount: amount,
                })
                .await?;
            print_json(&json!(engagement))
        }
        Commands::Hold { event, payer } => {
            let payment = engine.hold_funds(event, &payer).await?;
            print_json(&json!(payment))
        }
        Commands::Confirm { event, actor, role } => {
            let outcome = engine.confirm(event, &actor, role).await?;
            print_json(&confirm_json(&outcome))
        }
        Commands::Cancel {
            event,
            actor,
            by,
            reason,
        } => {
            let outcome = engine.cancel(event, &actor, by, reason).await?;
            print_json(&json!({
                "accepted": outcome.accepted,
                "engagement": outcome.engagement,
                "split": outcome.split(),
            }))
        }
        Commands::List { actor } => {
            let engagements = engine.get_engagements_for(&actor).await?;
            print_json(&json!(engagements))
        }
        Commands::Payment { event } => match engine.payment_for(event).await? {
            Some(view) => print_json(&json!(view)),
            None => {
                println!("No payment recorded for engagement {}", event);
                Ok(())
            }
        },
        Commands::Audit { event } => {
            let trail = engine.audit_trail(event).await?;
            print_json(&json!(trail))
        }
        Commands::Migrate | Commands::Split { .. } | Commands::Demo => Ok(()),
    }
}

async fn run_demo(config: &SettlementConfig) -> Result<()> {
    let notifier = RecordingNotifier::new();
    let start = Utc
        .with_ymd_and_hms(2026, 6, 1, 9, 0, 0)
        .single()
        .context("invalid demo clock")?;
    let clock = Arc::new(ManualClock::new(start));
    let engine = SettlementEngine::new(
        config,
        Arc::new(InMemoryLedger::new()),
        Arc::new(notifier.clone()),
        clock,
    );

    let engagement = engine
        .book(NewEngagement {
            requester_id: "requester-1".to_string(),
            provider_id: "provider-1".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 6, 3).context("invalid demo date")?,
            start_time: NaiveTime::from_hms_opt(19, 0, 0),
            end_time: NaiveTime::from_hms_opt(22, 0, 0),
            final_amount: 100_000,
        })
        .await?;
    engine.hold_funds(engagement.id, "requester-1").await?;
    info!(event_id = %engagement.id, "demo engagement funded");

    let first = engine.confirm(engagement.id, "requester-1", Role::Requester).await?;
    print_json(&confirm_json(&first))?;
    let second = engine.confirm(engagement.id, "provider-1", Role::Provider).await?;
    print_json(&confirm_json(&second))?;

    print_json(&json!({
        "payment": engine.payment_for(engagement.id).await?,
        "audit": engine.audit_trail(engagement.id).await?,
        "notices": notifier.sent().await,
    }))
}
