//! # Backlog Seeder
//!
//! Populates a development database with a closed contingency period full of
//! backlog documents, so the batcher and poller have work to do.
//!
//! ## Usage
//! ```bash
//! # 250 documents in one closed period (default)
//! cargo run -p fiscal-db --bin seed
//!
//! # Custom amount and database path
//! cargo run -p fiscal-db --bin seed -- --count 1000 --db ./data/fiscal.db
//! ```
//!
//! Documents cycle through every document kind, are issued over the last
//! week, and all share one scope (`DEV-COMPANY/M001/P001@test`).

use chrono::{Duration, Utc};
use fiscal_core::{
    ContingencyCause, ContingencyType, Document, DocumentKind, Environment, NewDocument, Scope,
};
use fiscal_db::{Database, DbConfig};
use std::env;

const KINDS: &[DocumentKind] = &[
    DocumentKind::Invoice,
    DocumentKind::CreditFiscalInvoice,
    DocumentKind::RemissionNote,
    DocumentKind::CreditNote,
    DocumentKind::DebitNote,
    DocumentKind::PurchaseReceipt,
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut count: usize = 250;
    let mut db_path = String::from("./fiscal_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(250);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Fiscal backlog seeder");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>    Number of backlog documents (default: 250)");
                println!("  -d, --db <PATH>    Database file path (default: ./fiscal_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("Fiscal backlog seeder");
    println!("=====================");
    println!("Database:  {}", db_path);
    println!("Documents: {}", count);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    println!("✓ Connected, migrations applied");

    let scope = Scope::new("DEV-COMPANY", "M001", "P001", Environment::Test);
    if db.periods().find_active(&scope).await?.is_some() {
        println!("⚠ {} already has an active period; skipping seed.", scope);
        return Ok(());
    }

    let started = Utc::now() - Duration::hours(2);
    let cause = ContingencyCause::new(ContingencyType::AuthorityUnavailable, "seeded outage");
    let period = db.periods().find_or_create_active(&scope, &cause, started).await?;
    println!("✓ Opened period {}", period.id);

    let start = std::time::Instant::now();
    let mut seeded = 0usize;
    for n in 0..count {
        let kind = KINDS[n % KINDS.len()];
        let now = Utc::now();
        let doc = Document::finalized(
            NewDocument {
                generation_code: None,
                control_number: format!("DTE-{}-M001P001-{:015}", kind.code(), n + 1),
                kind,
                scope: scope.clone(),
                issued_on: (now - Duration::days((n % 7) as i64)).date_naive(),
                signed_payload: format!("seed.{}.signature", n),
            },
            now,
        );

        if let Err(e) = db.documents().insert(&doc).await {
            eprintln!("Failed to insert {}: {}", doc.control_number, e);
            continue;
        }
        db.documents().mark_submitting(&doc.id, now).await?;
        if !db.documents().attach_to_period(&doc.id, &period.id, now).await? {
            eprintln!("Failed to attach {}", doc.control_number);
            continue;
        }

        seeded += 1;
        if seeded % 100 == 0 {
            println!("  Seeded {} documents...", seeded);
        }
    }

    db.periods().begin_reporting(&period.id, Utc::now()).await?;
    db.periods().mark_closed(&period.id, Utc::now()).await?;

    println!();
    println!("✓ Seeded {} documents in {:?}", seeded, start.elapsed());
    println!("✓ Period {} closed; ready for batching", period.id);

    Ok(())
}
