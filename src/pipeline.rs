use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::{MissingListingPolicy, ScraperConfig};
use crate::discover;
use crate::error::ScrapeError;
use crate::extract;
use crate::fetch::{self, CancelFlag};
use crate::models::{DiscoverySummary, ListingRecord, RefreshSummary};
use crate::session::PageFetcher;
use crate::store::{RecordTable, ReferenceTable};

/// Discovery flow: paginate search results and fold the found references
/// into the reference table. Idempotent; safe on zero prior state.
pub async fn run_discovery(
    fetcher: &dyn PageFetcher,
    config: &ScraperConfig,
    max_pages: Option<u32>,
    now: DateTime<Utc>,
) -> Result<DiscoverySummary, ScrapeError> {
    let links = discover::discover(fetcher, config, max_pages).await?;

    let path = config.reference_table_path();
    let mut table = ReferenceTable::load(&path)?;
    let new_references = table.merge_references(&links.references, now);
    table.write_atomic(&path)?;

    let summary = DiscoverySummary {
        pages_visited: links.pages_visited,
        discovered: links.references.len(),
        new_references,
        total_known: table.len(),
    };
    info!(
        "Discovery complete: {} pages visited, {} listings seen, {} new ({} known in total)",
        summary.pages_visited, summary.discovered, summary.new_references, summary.total_known
    );
    Ok(summary)
}

/// Refresh flow: fetch detail pages for known references (optionally a
/// caller-supplied subset), extract each independently, and merge into the
/// record table with one atomic write.
///
/// Per-item failures only dent the counts; authentication and merge
/// integrity errors abort the flow before anything is persisted.
pub async fn run_refresh(
    fetcher: &dyn PageFetcher,
    config: &ScraperConfig,
    filter: Option<&[String]>,
    cancel: &CancelFlag,
    now: DateTime<Utc>,
) -> Result<RefreshSummary, ScrapeError> {
    let record_path = config.record_table_path();
    let mut references = ReferenceTable::load(&config.reference_table_path())?.references();
    if let Some(ids) = filter {
        references.retain(|r| ids.iter().any(|id| id == &r.identifier));
    }

    let mut table = RecordTable::load(&record_path)?;
    if references.is_empty() {
        // First run or empty filter: still leave a well-formed table behind.
        table.write_atomic(&record_path)?;
        info!("No references to refresh; record table has {} rows", table.len());
        return Ok(RefreshSummary {
            total_rows: table.len(),
            ..RefreshSummary::default()
        });
    }
    info!("Refreshing {} listings", references.len());

    let batch = fetch::fetch_all(fetcher, &references, config, cancel).await;

    let mut records: Vec<ListingRecord> = Vec::new();
    let mut summary = RefreshSummary::default();
    for page in &batch.pages {
        if page.success {
            match extract::extract(page) {
                Ok(record) => records.push(record),
                Err(failure) => {
                    warn!("Skipping {}: {failure}", page.reference.identifier);
                    summary.skipped += 1;
                    summary
                        .failed_identifiers
                        .push(page.reference.identifier.clone());
                }
            }
        } else {
            warn!(
                "Failed to fetch {}: {}",
                page.reference.identifier,
                page.error.as_deref().unwrap_or("unknown reason")
            );
            summary.failed += 1;
            summary
                .failed_identifiers
                .push(page.reference.identifier.clone());
            if page.is_not_found()
                && config.missing_listing_policy == MissingListingPolicy::MarkWithdrawn
                && table.mark_withdrawn(&page.reference.identifier)
            {
                info!("Marked vanished listing {} withdrawn", page.reference.identifier);
            }
        }
    }

    if let Some(reason) = batch.auth_failure {
        // Nothing is persisted from this run; the previous table stands.
        return Err(ScrapeError::auth(format!(
            "{reason} ({} fetches completed, {} extracted before abort)",
            batch.pages.len(),
            records.len()
        )));
    }
    if batch.cancelled {
        info!("Refresh cancelled; merging the {} completed listings", records.len());
    }

    let stats = table.merge(&records, now)?;
    table.write_atomic(&record_path)?;

    summary.updated = records.len();
    summary.total_rows = stats.total;
    info!(
        "Refresh complete: {} updated ({} new rows), {} failed, {} skipped, {} rows total",
        summary.updated, stats.inserted, summary.failed, summary.skipped, summary.total_rows
    );
    Ok(summary)
}
