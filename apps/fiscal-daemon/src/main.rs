//! # fiscal-daemon
//!
//! Runs the contingency workers, or performs one admin operation and exits.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          fiscal-daemon                                  │
//! │                                                                         │
//! │  FiscalConfig (file + FISCAL_* env) ──► Database (SQLite, migrations)   │
//! │                                              │                          │
//! │                          build_gateway ──────┤                          │
//! │                                              ▼                          │
//! │   run ──────────► ContingencyAgent (close / batch / poll sweeps)        │
//! │   periods, lotes,                                                       │
//! │   events, reconcile,                                                    │
//! │   trace ────────► AdminService                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod cli;

use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fiscal_core::{DateRange, Scope};
use fiscal_db::{Database, DbConfig, EventFilter, LoteFilter, PeriodFilter};
use fiscal_sync::{
    build_gateway, AdminService, ContingencyAgentBuilder, FiscalConfig, FiscalEngine,
    ReconcileOptions,
};

use crate::cli::{Cli, Commands, LoteCmd, PeriodCmd, ReconcileArgs};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = FiscalConfig::load(cli.config.clone()).context("loading configuration")?;
    let db = Arc::new(open_database(&config).await?);

    match cli.cmd {
        Commands::Run => run(config, db).await,
        cmd => {
            let gateway = build_gateway(&config)?;
            let engine = FiscalEngine::new(db.clone(), gateway, &config)?;
            admin(AdminService::new(db, engine), cmd).await
        }
    }
}

/// Initializes the tracing subscriber. `RUST_LOG` overrides the default
/// `info` level.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fiscal=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_database(config: &FiscalConfig) -> Result<Database> {
    let settings = &config.database;
    if let Some(dir) = settings.path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating database directory {}", dir.display()))?;
    }

    let db = Database::new(
        DbConfig::new(&settings.path)
            .max_connections(settings.max_connections)
            .busy_timeout(Duration::from_millis(settings.busy_timeout_ms)),
    )
    .await
    .with_context(|| format!("opening database {}", settings.path.display()))?;
    Ok(db)
}

async fn run(config: FiscalConfig, db: Arc<Database>) -> Result<()> {
    info!(mode = %config.authority.mode, "Starting fiscal daemon");
    let gateway = build_gateway(&config)?;

    let mut agent = ContingencyAgentBuilder::new(config)
        .with_database(db.clone())
        .with_gateway(gateway)
        .build()?;
    agent.start().await?;

    shutdown_signal().await;

    agent.shutdown().await?;
    db.close().await;
    info!("Fiscal daemon stopped");
    Ok(())
}

async fn admin(service: AdminService, cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Run => anyhow::bail!("`run` is not an admin command"),

        Commands::Periods { cmd } => match cmd {
            PeriodCmd::List {
                status,
                from,
                to,
                limit,
            } => {
                let filter = PeriodFilter {
                    status,
                    from: from.map(start_of_day),
                    // Inclusive of the whole `to` day.
                    to: to.and_then(|d| d.succ_opt()).map(start_of_day),
                    limit,
                };
                print_json(&service.list_periods(&filter).await?)
            }
            PeriodCmd::Show { id } => print_json(&service.get_period(&id).await?),
            PeriodCmd::Close { id } => print_json(&service.close_period(&id).await?),
            PeriodCmd::Attention => print_json(&service.periods_needing_attention().await?),
        },

        Commands::Lotes { cmd } => match cmd {
            LoteCmd::List {
                status,
                period,
                limit,
            } => {
                let filter = LoteFilter {
                    status,
                    period_id: period,
                    limit,
                };
                print_json(&service.list_lotes(&filter).await?)
            }
            LoteCmd::Show { id } => print_json(&service.get_lote(&id).await?),
            LoteCmd::Poll { id } => print_json(&service.poll_lote(&id).await?),
        },

        Commands::Events { status, limit } => {
            print_json(&service.list_events(&EventFilter { status, limit }).await?)
        }

        Commands::Reconcile(args) => reconcile(&service, args).await,

        Commands::ReconcileDocument { generation_code } => {
            print_json(&service.reconcile_document(&generation_code).await?)
        }

        Commands::Trace { document } => print_json(&service.document_trace(&document).await?),
    }
}

async fn reconcile(service: &AdminService, args: ReconcileArgs) -> Result<()> {
    let scope = Scope::new(args.company, args.establishment, args.point_of_sale, args.environment);
    let range = DateRange::new(args.from, args.to);
    let options = ReconcileOptions {
        include_matches: args.include_matches,
    };

    match args.csv {
        None => print_json(&service.reconcile(&scope, &range, options).await?),
        Some(path) if path.as_os_str() == "-" => {
            let stdout = std::io::stdout();
            service.reconcile_csv(&scope, &range, options, stdout.lock()).await?;
            Ok(())
        }
        Some(path) => {
            let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
            let totals = service.reconcile_csv(&scope, &range, options, file).await?;
            info!(
                path = %path.display(),
                total = totals.total,
                discrepancies = totals.discrepancies,
                "Reconciliation report written"
            );
            Ok(())
        }
    }
}

fn start_of_day(date: NaiveDate) -> chrono::DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(?e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping workers");
}
