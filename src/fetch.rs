use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ScraperConfig;
use crate::error::ScrapeError;
use crate::models::{ListingReference, RawPage};
use crate::session::PageFetcher;

const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// Caller-initiated abort, checked before each new fetch is issued.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one batch. On an authentication short-circuit `pages` holds
/// only the fetches completed before the cut-off; otherwise there is
/// exactly one page per input reference, success or failure.
#[derive(Debug, Default)]
pub struct FetchBatch {
    pub pages: Vec<RawPage>,
    pub auth_failure: Option<String>,
    pub cancelled: bool,
}

/// Fetch every referenced detail page with bounded concurrency.
///
/// Workers pull from a shared queue and keep a politeness delay between
/// their own requests. A failed fetch is isolated to its listing; an
/// authentication failure stops the whole batch since every remaining
/// fetch would fail the same way.
pub async fn fetch_all(
    fetcher: &dyn PageFetcher,
    references: &[ListingReference],
    config: &ScraperConfig,
    cancel: &CancelFlag,
) -> FetchBatch {
    let total = references.len();
    if total == 0 {
        return FetchBatch::default();
    }

    let queue: Mutex<VecDeque<ListingReference>> =
        Mutex::new(references.iter().cloned().collect());
    let pages: Mutex<Vec<RawPage>> = Mutex::new(Vec::with_capacity(total));
    let auth_flag = AtomicBool::new(false);
    let auth_failure: Mutex<Option<String>> = Mutex::new(None);

    let workers = config.concurrency.clamp(1, total);
    let worker_futures: Vec<_> = (0..workers)
        .map(|_| {
            run_worker(
                fetcher,
                &queue,
                &pages,
                &auth_flag,
                &auth_failure,
                cancel,
                config,
                total,
            )
        })
        .collect();
    join_all(worker_futures).await;

    let cancelled = cancel.is_cancelled();
    let auth_failure = auth_failure.into_inner();
    let mut pages = pages.into_inner();

    if cancelled && auth_failure.is_none() {
        // Abort between fetches: whatever was never issued counts as
        // failed, not retried, so every input still yields one page.
        let now = Utc::now();
        let mut remaining = queue.into_inner();
        while let Some(reference) = remaining.pop_front() {
            pages.push(RawPage::failed(reference, now, None, "cancelled before fetch"));
        }
    }

    FetchBatch {
        pages,
        auth_failure,
        cancelled,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    fetcher: &dyn PageFetcher,
    queue: &Mutex<VecDeque<ListingReference>>,
    pages: &Mutex<Vec<RawPage>>,
    auth_flag: &AtomicBool,
    auth_failure: &Mutex<Option<String>>,
    cancel: &CancelFlag,
    config: &ScraperConfig,
    total: usize,
) {
    let mut first_request = true;
    loop {
        if auth_flag.load(Ordering::SeqCst) || cancel.is_cancelled() {
            return;
        }
        let Some(reference) = queue.lock().await.pop_front() else {
            return;
        };
        if !first_request {
            tokio::time::sleep(config.politeness_delay).await;
        }
        first_request = false;

        let done = pages.lock().await.len();
        info!("[{}/{}] Fetching {}", done + 1, total, reference.url);
        match fetch_one(fetcher, &reference, config).await {
            FetchResult::Page(raw) => pages.lock().await.push(raw),
            FetchResult::Auth(reason) => {
                warn!("Authentication failure on {}: {reason}", reference.url);
                auth_flag.store(true, Ordering::SeqCst);
                auth_failure.lock().await.get_or_insert(reason);
                return;
            }
        }
    }
}

enum FetchResult {
    Page(RawPage),
    Auth(String),
}

/// One listing fetch with per-fetch timeout and bounded transient retries.
/// Anything short of an auth failure resolves to a `RawPage`.
async fn fetch_one(
    fetcher: &dyn PageFetcher,
    reference: &ListingReference,
    config: &ScraperConfig,
) -> FetchResult {
    let mut delay = RETRY_BASE_DELAY;
    let mut last_error = String::from("fetch failed");

    for attempt in 0..=config.max_retries {
        match tokio::time::timeout(config.fetch_timeout, fetcher.fetch_page(&reference.url)).await
        {
            Err(_) => {
                last_error = format!("timed out after {:?}", config.fetch_timeout);
            }
            Ok(Err(ScrapeError::TransientFetch { reason, .. })) => {
                last_error = reason;
            }
            Ok(Err(ScrapeError::AuthenticationRequired { reason })) => {
                return FetchResult::Auth(reason);
            }
            Ok(Err(other)) => {
                return FetchResult::Page(RawPage::failed(
                    reference.clone(),
                    Utc::now(),
                    None,
                    other.to_string(),
                ));
            }
            Ok(Ok(page)) => {
                if page.is_auth_failure() {
                    return FetchResult::Auth(format!(
                        "{} rejected the session (status {:?})",
                        reference.url, page.status
                    ));
                }
                if page.is_server_error() {
                    last_error = format!("server error {:?}", page.status);
                } else if let Some(status) = page.status.filter(|s| !(200..300).contains(s)) {
                    // 404 and friends: definitive for this listing, no retry.
                    return FetchResult::Page(RawPage::failed(
                        reference.clone(),
                        Utc::now(),
                        page.status,
                        format!("http status {status}"),
                    ));
                } else {
                    return FetchResult::Page(RawPage::ok(
                        reference.clone(),
                        Utc::now(),
                        page.status,
                        page.body,
                    ));
                }
            }
        }
        if attempt < config.max_retries {
            warn!(
                "Attempt {} failed for {}: {last_error}; retrying in {delay:?}",
                attempt + 1,
                reference.url
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    FetchResult::Page(RawPage::failed(
        reference.clone(),
        Utc::now(),
        None,
        last_error,
    ))
}
