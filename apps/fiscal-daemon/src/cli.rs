//! Command-line surface.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use fiscal_core::{Environment, EventStatus, LoteStatus, PeriodStatus};

#[derive(Parser)]
#[command(name = "fiscal-daemon")]
#[command(about = "Contingency workers and admin tools for electronic fiscal documents", long_about = None)]
pub struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the background sweeps until interrupted
    Run,

    /// Contingency periods
    Periods {
        #[command(subcommand)]
        cmd: PeriodCmd,
    },

    /// Lotes
    Lotes {
        #[command(subcommand)]
        cmd: LoteCmd,
    },

    /// Contingency notifications
    Events {
        #[arg(long)]
        status: Option<EventStatus>,

        #[arg(long)]
        limit: Option<u32>,
    },

    /// Compare local documents with the authority's records
    Reconcile(ReconcileArgs),

    /// Compare a single document with the authority's record
    ReconcileDocument {
        generation_code: String,
    },

    /// Show a document's full submission trace
    Trace {
        /// Document id or generation code
        document: String,
    },
}

#[derive(Subcommand)]
pub enum PeriodCmd {
    /// List periods, newest first
    List {
        #[arg(long)]
        status: Option<PeriodStatus>,

        /// Started on or after (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Started on or before (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,

        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show a period with its notification, documents and lotes
    Show { id: String },

    /// Close an active period and notify the authority
    Close { id: String },

    /// Periods whose notification keeps failing or was rejected
    Attention,
}

#[derive(Subcommand)]
pub enum LoteCmd {
    List {
        #[arg(long)]
        status: Option<LoteStatus>,

        #[arg(long)]
        period: Option<String>,

        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show a lote with its documents' status breakdown
    Show { id: String },

    /// Poll a lote's status now
    Poll { id: String },
}

#[derive(Args)]
pub struct ReconcileArgs {
    #[arg(long)]
    pub company: String,

    #[arg(long)]
    pub establishment: String,

    #[arg(long = "pos")]
    pub point_of_sale: String,

    /// test | production
    #[arg(long, default_value = "test")]
    pub environment: Environment,

    /// First issue date (YYYY-MM-DD)
    #[arg(long)]
    pub from: NaiveDate,

    /// Last issue date (YYYY-MM-DD)
    #[arg(long)]
    pub to: NaiveDate,

    /// List matching documents too
    #[arg(long, default_value_t = false)]
    pub include_matches: bool,

    /// Write CSV to this file instead of printing JSON ("-" for stdout)
    #[arg(long)]
    pub csv: Option<PathBuf>,
}
