use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, error, info};
use url::Url;

use crate::config::ScraperConfig;
use crate::error::ScrapeError;

/// How long to let a detail page settle after navigation before reading
/// its content; listing data is injected client-side.
const PAGE_SETTLE: Duration = Duration::from_secs(2);

/// The pre-captured credential for the authenticated browsing context.
/// Exactly one form must be supplied for any network operation to proceed.
#[derive(Debug, Clone)]
pub enum SessionCredential {
    /// A raw HTTP `Cookie` header value.
    CookieHeader(String),
    /// Path to a persisted browser storage-state file (Playwright format).
    StorageStateFile(PathBuf),
}

impl SessionCredential {
    pub fn resolve(
        cookie: Option<String>,
        storage_state: Option<PathBuf>,
    ) -> Result<Self, ScrapeError> {
        match (cookie, storage_state) {
            (Some(c), None) if !c.trim().is_empty() => Ok(Self::CookieHeader(c)),
            (Some(_), None) => Err(ScrapeError::Credential(
                "cookie header is empty".to_string(),
            )),
            (None, Some(p)) => Ok(Self::StorageStateFile(p)),
            (Some(_), Some(_)) => Err(ScrapeError::Credential(
                "supply either a cookie header or a storage-state file, not both".to_string(),
            )),
            (None, None) => Err(ScrapeError::Credential(
                "no session credential supplied; pass --cookie or --storage-state".to_string(),
            )),
        }
    }

    /// Flatten the credential into name/value cookie pairs.
    pub fn cookie_pairs(&self) -> Result<Vec<(String, String)>, ScrapeError> {
        match self {
            Self::CookieHeader(raw) => Ok(parse_cookie_header(raw)),
            Self::StorageStateFile(path) => {
                let state = StorageState::load(path)?;
                Ok(state
                    .cookies
                    .into_iter()
                    .map(|c| (c.name, c.value))
                    .collect())
            }
        }
    }

    /// Flatten the credential into a single `Cookie` header value.
    pub fn cookie_header(&self) -> Result<String, ScrapeError> {
        let pairs = self.cookie_pairs()?;
        if pairs.is_empty() {
            return Err(ScrapeError::Credential(
                "credential contains no cookies".to_string(),
            ));
        }
        Ok(pairs
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; "))
    }
}

fn parse_cookie_header(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Persisted browser storage state, as written by `context.storage_state()`.
/// Only the cookie jar is consumed; origins/local storage are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageState {
    #[serde(default)]
    pub cookies: Vec<StoredCookie>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl StorageState {
    pub fn load(path: &Path) -> Result<Self, ScrapeError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            ScrapeError::Credential(format!("malformed storage state {}: {e}", path.display()))
        })
    }
}

/// One fetched page. An HTTP error status still yields a `FetchedPage`;
/// only transport-level failures surface as errors.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub body: String,
    pub status: Option<u16>,
    pub final_url: Option<String>,
}

impl FetchedPage {
    /// Credential rejected: explicit 401/403, or a redirect onto the login
    /// flow (browser fetches expose no status code).
    pub fn is_auth_failure(&self) -> bool {
        if matches!(self.status, Some(401 | 403)) {
            return true;
        }
        self.final_url
            .as_deref()
            .map(|u| u.contains("/login") || u.contains("/signin"))
            .unwrap_or(false)
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self.status, Some(s) if s >= 500)
    }
}

/// Seam between the pipeline and the authenticated browsing context. The
/// discoverer and fetcher receive an implementation, never ambient state.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, ScrapeError>;
}

/// Plain HTTP session for search-results pages, which render server-side.
pub struct HttpSession {
    client: reqwest::Client,
    cookie_header: String,
}

impl HttpSession {
    pub fn new(credential: &SessionCredential, config: &ScraperConfig) -> Result<Self, ScrapeError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| ScrapeError::Http(e.to_string()))?;
        Ok(Self {
            client,
            cookie_header: credential.cookie_header()?,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpSession {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, ScrapeError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::COOKIE, self.cookie_header.as_str())
            .send()
            .await
            .map_err(|e| ScrapeError::transient(url, e.to_string()))?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| ScrapeError::transient(url, e.to_string()))?;
        Ok(FetchedPage {
            body,
            status: Some(status),
            final_url: Some(final_url),
        })
    }
}

/// Chromium-backed session for detail pages, which require a real browser
/// to render. Cookies from the credential are applied to every page before
/// navigation.
pub struct BrowserSession {
    browser: Browser,
    cookies: Vec<CookieParam>,
}

impl BrowserSession {
    pub async fn launch(
        credential: &SessionCredential,
        config: &ScraperConfig,
        headless: bool,
    ) -> Result<Self, ScrapeError> {
        info!("Initializing browser");
        let mut builder = BrowserConfig::builder();
        if !headless {
            builder = builder.with_head();
        }
        builder = builder.window_size(1920, 1080);
        builder = builder.viewport(None);
        let browser_config = builder.build().map_err(ScrapeError::Browser)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| ScrapeError::Browser(e.to_string()))?;

        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if let Err(e) = h {
                    error!("Browser handler error: {e:?}");
                }
            }
        });

        let cookies = cookie_params(credential, &config.search_base_url)?;
        Ok(Self { browser, cookies })
    }

    async fn load(&self, page: &chromiumoxide::Page, url: &str) -> Result<FetchedPage, ScrapeError> {
        if !self.cookies.is_empty() {
            page.set_cookies(self.cookies.clone())
                .await
                .map_err(|e| ScrapeError::transient(url, format!("setting cookies: {e}")))?;
        }
        page.goto(url)
            .await
            .map_err(|e| ScrapeError::transient(url, e.to_string()))?;
        tokio::time::sleep(PAGE_SETTLE).await;
        let body = page
            .content()
            .await
            .map_err(|e| ScrapeError::transient(url, e.to_string()))?;
        let final_url = page.url().await.ok().flatten();
        Ok(FetchedPage {
            body,
            status: None,
            final_url,
        })
    }

    pub async fn close(mut self) -> Result<(), ScrapeError> {
        self.browser
            .close()
            .await
            .map_err(|e| ScrapeError::Browser(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl PageFetcher for BrowserSession {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, ScrapeError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| ScrapeError::transient(url, e.to_string()))?;
        let result = self.load(&page, url).await;
        if let Err(e) = page.close().await {
            debug!("Failed to close page for {url}: {e}");
        }
        result
    }
}

fn cookie_params(
    credential: &SessionCredential,
    base_url: &str,
) -> Result<Vec<CookieParam>, ScrapeError> {
    let fallback_domain = Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .ok_or_else(|| ScrapeError::Credential(format!("cannot derive domain from {base_url}")))?;

    match credential {
        SessionCredential::CookieHeader(raw) => parse_cookie_header(raw)
            .into_iter()
            .map(|(name, value)| build_cookie(name, value, fallback_domain.clone(), "/".to_string()))
            .collect(),
        SessionCredential::StorageStateFile(path) => {
            let state = StorageState::load(path)?;
            state
                .cookies
                .into_iter()
                .map(|c| {
                    let domain = c.domain.unwrap_or_else(|| fallback_domain.clone());
                    let path = c.path.unwrap_or_else(|| "/".to_string());
                    build_cookie(c.name, c.value, domain, path)
                })
                .collect()
        }
    }
}

fn build_cookie(
    name: String,
    value: String,
    domain: String,
    path: String,
) -> Result<CookieParam, ScrapeError> {
    CookieParam::builder()
        .name(name)
        .value(value)
        .domain(domain)
        .path(path)
        .build()
        .map_err(ScrapeError::Credential)
}
