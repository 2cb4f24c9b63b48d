use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info};

use grays_scraper::fetch::CancelFlag;
use grays_scraper::pipeline;
use grays_scraper::session::{BrowserSession, HttpSession};
use grays_scraper::{ScraperConfig, SessionCredential};

const USAGE: &str = "Usage:
  grays-scraper discover [--max-pages N]
  grays-scraper refresh [--id LOT_ID]... [--headed]

Common options:
  --cookie HEADER          raw Cookie header (or GRAYS_COOKIE env var)
  --storage-state FILE     browser storage-state JSON (or GRAYS_STORAGE_STATE)
  --data-dir DIR           table directory (default: data)";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first().cloned() else {
        eprintln!("{USAGE}");
        return Ok(());
    };

    let headless = !args.iter().any(|a| a == "--headed");
    if !headless {
        info!("Running in headed mode (browser visible)");
    }
    let max_pages = flag_value(&args, "--max-pages")
        .map(|v| v.parse::<u32>())
        .transpose()
        .context("--max-pages must be a number")?;
    let ids = flag_values(&args, "--id");

    let mut config = ScraperConfig::default();
    if let Some(dir) = flag_value(&args, "--data-dir") {
        config.data_dir = PathBuf::from(dir);
    }
    config.ensure_data_dir()?;

    // The credential is resolved once, here at the edge; components only
    // ever see the explicit value.
    let cookie = flag_value(&args, "--cookie")
        .map(str::to_string)
        .or_else(|| env::var("GRAYS_COOKIE").ok());
    let storage_state = flag_value(&args, "--storage-state")
        .map(PathBuf::from)
        .or_else(|| env::var("GRAYS_STORAGE_STATE").ok().map(PathBuf::from));
    let credential = SessionCredential::resolve(cookie, storage_state)?;

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received; finishing in-flight fetches");
                cancel.cancel();
            }
        });
    }

    match command.as_str() {
        "discover" => {
            let session = HttpSession::new(&credential, &config)?;
            let summary = pipeline::run_discovery(&session, &config, max_pages, Utc::now()).await?;
            info!(
                "Saved {} references ({} new this run) to {}",
                summary.total_known,
                summary.new_references,
                config.reference_table_path().display()
            );
        }
        "refresh" => {
            let session = BrowserSession::launch(&credential, &config, headless).await?;
            let filter = (!ids.is_empty()).then_some(ids.as_slice());
            let result = pipeline::run_refresh(&session, &config, filter, &cancel, Utc::now()).await;
            session.close().await?;
            let summary = result?;
            info!(
                "Saved {} records ({} updated, {} failed, {} skipped) to {}",
                summary.total_rows,
                summary.updated,
                summary.failed,
                summary.skipped,
                config.record_table_path().display()
            );
            if !summary.failed_identifiers.is_empty() {
                info!("Needs attention: {}", summary.failed_identifiers.join(", "));
            }
        }
        other => {
            error!("Unknown command '{other}'");
            eprintln!("{USAGE}");
        }
    }

    Ok(())
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn flag_values(args: &[String], name: &str) -> Vec<String> {
    args.windows(2)
        .filter(|w| w[0] == name)
        .map(|w| w[1].clone())
        .collect()
}
