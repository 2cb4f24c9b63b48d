use std::path::PathBuf;
use std::time::Duration;

/// What to do with a record whose listing page has permanently vanished
/// (definitive 404) as opposed to merely having sold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingListingPolicy {
    /// Keep the previous row untouched; its last_seen timestamp ages out
    /// naturally. Default.
    #[default]
    RetainStale,
    /// Flip the record's status to `withdrawn` so reporting can tell
    /// removal apart from a sale.
    MarkWithdrawn,
}

/// Explicit configuration for one scraper run. Constructed at the binary
/// edge and passed down; components never read ambient state themselves.
#[derive(Debug, Clone)]
pub struct ScraperConfig {
    /// Search-results endpoint; page numbers are appended as a query
    /// parameter.
    pub search_base_url: String,
    /// Directory holding both persisted tables.
    pub data_dir: PathBuf,
    /// Upper bound on concurrently in-flight detail fetches.
    pub concurrency: usize,
    /// Minimum spacing between requests issued by one worker.
    pub politeness_delay: Duration,
    /// Per-fetch timeout; hitting it counts as a transient failure.
    pub fetch_timeout: Duration,
    /// Bounded retries for transient failures before an item is marked
    /// failed.
    pub max_retries: u32,
    /// Safety bound on discovery pagination when the caller supplies none.
    pub default_max_pages: u32,
    pub user_agent: String,
    pub missing_listing_policy: MissingListingPolicy,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            search_base_url:
                "https://www.grays.com/search/automotive-trucks-and-marine/motor-vehiclesmotor-cycles/motor-vehicles"
                    .to_string(),
            data_dir: PathBuf::from("data"),
            concurrency: 4,
            politeness_delay: Duration::from_secs(2),
            fetch_timeout: Duration::from_secs(60),
            max_retries: 2,
            default_max_pages: 60,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                .to_string(),
            missing_listing_policy: MissingListingPolicy::default(),
        }
    }
}

impl ScraperConfig {
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Persisted set of all known listing identifiers/URLs.
    pub fn reference_table_path(&self) -> PathBuf {
        self.data_dir.join("all_vehicle_links.csv")
    }

    /// Persisted set of extracted structured attributes per listing.
    pub fn record_table_path(&self) -> PathBuf {
        self.data_dir.join("vehicle_details.csv")
    }

    pub fn search_page_url(&self, page: u32) -> String {
        let separator = if self.search_base_url.contains('?') { '&' } else { '?' };
        format!("{}{}tab=items&page={}", self.search_base_url, separator, page)
    }

    pub fn ensure_data_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}
