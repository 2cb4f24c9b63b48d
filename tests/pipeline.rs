use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use grays_scraper::fetch::CancelFlag;
use grays_scraper::pipeline;
use grays_scraper::session::{FetchedPage, PageFetcher};
use grays_scraper::{ScrapeError, ScraperConfig};

/// In-memory stand-in for the auction site: paginated search results plus
/// one detail page per lot.
struct FakeSite {
    lots: Vec<&'static str>,
    forbid_details: bool,
}

impl FakeSite {
    fn new(lots: Vec<&'static str>) -> Self {
        Self {
            lots,
            forbid_details: false,
        }
    }

    fn search_page(&self, page_no: usize) -> String {
        self.lots
            .chunks(2)
            .nth(page_no - 1)
            .unwrap_or_default()
            .iter()
            .map(|id| format!(r#"<a href="/lot/{id}/automotive/car">Lot {id}</a>"#))
            .collect()
    }

    fn detail_page(id: &str) -> String {
        format!(
            r##"<html><head>
                 <link rel="canonical" href="https://www.grays.com/lot/{id}/automotive/car"/>
               </head><body>
                 <span itemprop="price">$15,000</span>
                 <span id="lot-closing-countdown">1d 2h</span>
                 <a href="#">4 bids</a>
                 <dl>
                   <dt>Seller</dt><dd>Fleet</dd>
                   <dt>Odometer</dt><dd>88,000 km</dd>
                   <dt>Location</dt><dd>Brisbane QLD</dd>
                 </dl>
               </body></html>"##
        )
    }
}

#[async_trait]
impl PageFetcher for FakeSite {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, ScrapeError> {
        if url.contains("tab=items") {
            let page_no: usize = url
                .rsplit("page=")
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(1);
            return Ok(FetchedPage {
                body: self.search_page(page_no),
                status: Some(200),
                final_url: Some(url.to_string()),
            });
        }
        if self.forbid_details {
            return Ok(FetchedPage {
                body: String::new(),
                status: Some(403),
                final_url: None,
            });
        }
        let id = url
            .split("/lot/")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or_default();
        Ok(FetchedPage {
            body: FakeSite::detail_page(id),
            status: Some(200),
            final_url: Some(url.to_string()),
        })
    }
}

fn test_config(dir: &std::path::Path) -> ScraperConfig {
    ScraperConfig {
        search_base_url: "https://fake.test/search".to_string(),
        concurrency: 2,
        politeness_delay: Duration::ZERO,
        fetch_timeout: Duration::from_secs(5),
        max_retries: 0,
        ..ScraperConfig::default()
    }
    .with_data_dir(dir)
}

fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 20, 3, 0, 0).unwrap()
}

#[tokio::test]
async fn discovery_then_refresh_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let site = FakeSite::new(vec!["0001-1", "0001-2", "0002-1", "0002-2"]);

    let discovery = pipeline::run_discovery(&site, &config, None, fixed_now())
        .await
        .unwrap();
    assert_eq!(discovery.discovered, 4);
    assert_eq!(discovery.new_references, 4);
    assert_eq!(discovery.total_known, 4);

    let refresh = pipeline::run_refresh(&site, &config, None, &CancelFlag::new(), fixed_now())
        .await
        .unwrap();
    assert_eq!(refresh.updated, 4);
    assert_eq!(refresh.failed, 0);
    assert_eq!(refresh.skipped, 0);
    assert_eq!(refresh.total_rows, 4);

    let records = std::fs::read_to_string(config.record_table_path()).unwrap();
    assert!(records.contains("0001-1"));
    assert!(records.contains("active"));
    assert!(records.contains("Brisbane QLD"));
    assert!(records.contains("88000"));
}

#[tokio::test]
async fn rerunning_both_flows_with_a_fixed_clock_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let site = FakeSite::new(vec!["0001-1", "0001-2", "0002-1"]);

    pipeline::run_discovery(&site, &config, None, fixed_now())
        .await
        .unwrap();
    pipeline::run_refresh(&site, &config, None, &CancelFlag::new(), fixed_now())
        .await
        .unwrap();
    let references_first = std::fs::read(config.reference_table_path()).unwrap();
    let records_first = std::fs::read(config.record_table_path()).unwrap();

    let discovery = pipeline::run_discovery(&site, &config, None, fixed_now())
        .await
        .unwrap();
    assert_eq!(discovery.new_references, 0);
    pipeline::run_refresh(&site, &config, None, &CancelFlag::new(), fixed_now())
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(config.reference_table_path()).unwrap(),
        references_first
    );
    assert_eq!(
        std::fs::read(config.record_table_path()).unwrap(),
        records_first
    );
}

#[tokio::test]
async fn refresh_with_zero_prior_state_leaves_a_well_formed_table() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let site = FakeSite::new(Vec::new());

    let summary = pipeline::run_refresh(&site, &config, None, &CancelFlag::new(), fixed_now())
        .await
        .unwrap();
    assert_eq!(summary.updated, 0);
    assert_eq!(summary.total_rows, 0);

    let contents = std::fs::read_to_string(config.record_table_path()).unwrap();
    assert!(contents.starts_with("identifier,url,price"));
}

#[tokio::test]
async fn auth_failure_during_refresh_persists_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let mut site = FakeSite::new(vec!["0001-1", "0001-2"]);

    pipeline::run_discovery(&site, &config, None, fixed_now())
        .await
        .unwrap();

    site.forbid_details = true;
    let err = pipeline::run_refresh(&site, &config, None, &CancelFlag::new(), fixed_now())
        .await
        .unwrap_err();
    assert!(matches!(err, ScrapeError::AuthenticationRequired { .. }));
    assert!(!config.record_table_path().exists());
}

#[tokio::test]
async fn refresh_can_be_filtered_to_a_subset_of_identifiers() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let site = FakeSite::new(vec!["0001-1", "0001-2", "0002-1", "0002-2"]);

    pipeline::run_discovery(&site, &config, None, fixed_now())
        .await
        .unwrap();

    let filter = vec!["0001-2".to_string()];
    let summary = pipeline::run_refresh(
        &site,
        &config,
        Some(&filter),
        &CancelFlag::new(),
        fixed_now(),
    )
    .await
    .unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.total_rows, 1);

    let records = std::fs::read_to_string(config.record_table_path()).unwrap();
    assert!(records.contains("0001-2"));
    assert!(!records.contains("0002-1"));
}
