use std::collections::HashSet;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::ScraperConfig;
use crate::error::ScrapeError;
use crate::extract;
use crate::models::ListingReference;
use crate::session::{FetchedPage, PageFetcher};

const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// Result of one discovery run. References are deduplicated by identifier
/// in first-seen order; nothing is persisted here.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredLinks {
    pub references: Vec<ListingReference>,
    pub pages_visited: u32,
}

/// Paginate the search-results endpoint from page 1 until `max_pages` is
/// hit, a page yields no new listings, or the site signals end-of-results.
///
/// Transient failures on a single page are retried with backoff, then
/// treated as end-of-results; a 401/403 aborts the whole run since retrying
/// without fresh credentials is pointless.
pub async fn discover(
    fetcher: &dyn PageFetcher,
    config: &ScraperConfig,
    max_pages: Option<u32>,
) -> Result<DiscoveredLinks, ScrapeError> {
    let bound = max_pages.unwrap_or(config.default_max_pages);
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = DiscoveredLinks::default();

    let mut page_no = 1u32;
    while page_no <= bound {
        let url = config.search_page_url(page_no);
        info!("Fetching search page {page_no}: {url}");

        let Some(page) = fetch_with_retry(fetcher, &url, config).await? else {
            info!("Retries exhausted on page {page_no}; treating as end of results");
            break;
        };
        if page.is_auth_failure() {
            return Err(ScrapeError::auth(format!(
                "search page {page_no} rejected the session (status {:?})",
                page.status
            )));
        }
        if let Some(status) = page.status {
            if !(200..300).contains(&status) {
                info!("Search page {page_no} returned status {status}; end of results");
                break;
            }
        }

        out.pages_visited += 1;
        let before = seen.len();
        for reference in extract::listing_links(&page.body, &config.search_base_url) {
            if seen.insert(reference.identifier.clone()) {
                out.references.push(reference);
            }
        }
        let added = seen.len() - before;
        info!("Page {page_no} added {added} new listings (total {})", seen.len());

        if added == 0 {
            info!("No new listings on page {page_no}; assuming end of pagination");
            break;
        }
        page_no += 1;
    }

    Ok(out)
}

/// Fetch one results page, retrying transient failures (timeout, 5xx) with
/// doubling backoff. `None` means retries were exhausted.
async fn fetch_with_retry(
    fetcher: &dyn PageFetcher,
    url: &str,
    config: &ScraperConfig,
) -> Result<Option<FetchedPage>, ScrapeError> {
    let mut delay = RETRY_BASE_DELAY;
    for attempt in 0..=config.max_retries {
        match fetcher.fetch_page(url).await {
            Ok(page) if page.is_server_error() => {
                warn!(
                    "Server error {:?} for {url} (attempt {})",
                    page.status,
                    attempt + 1
                );
            }
            Ok(page) => return Ok(Some(page)),
            Err(ScrapeError::TransientFetch { reason, .. }) => {
                warn!("Attempt {} failed for {url}: {reason}", attempt + 1);
            }
            Err(other) => return Err(other),
        }
        if attempt < config.max_retries {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
    Ok(None)
}
