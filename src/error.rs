use thiserror::Error;

/// Run-level and item-level failure taxonomy for the scraping pipeline.
///
/// `AuthenticationRequired` and `MergeIntegrity` abort the current flow;
/// everything else is handled at the point of occurrence.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// Credential missing, expired, or rejected (401/403 or a login
    /// redirect). Retrying without a fresh credential is pointless.
    #[error("authentication required: {reason}; refresh the session cookie or storage state")]
    AuthenticationRequired { reason: String },

    /// Timeout, 5xx, connection reset. Retried with backoff where it
    /// occurs; exhausting retries fails only the affected item.
    #[error("transient fetch failure for {url}: {reason}")]
    TransientFetch { url: String, reason: String },

    /// Duplicate identifiers or structural mismatch while staging a new
    /// table. The previous table on disk is left untouched.
    #[error("merge integrity violation: {0}")]
    MergeIntegrity(String),

    #[error("invalid session credential: {0}")]
    Credential(String),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("http client error: {0}")]
    Http(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl ScrapeError {
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::AuthenticationRequired {
            reason: reason.into(),
        }
    }

    pub fn transient(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransientFetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationRequired { .. } | Self::MergeIntegrity(_) | Self::Credential(_)
        )
    }
}

/// A successfully fetched page that cannot yield a usable record because a
/// required field is absent. Localized to one listing; never aborts a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("required field '{field}' missing from {url}")]
pub struct ExtractionFailure {
    pub field: &'static str,
    pub url: String,
}

impl ExtractionFailure {
    pub fn new(field: &'static str, url: impl Into<String>) -> Self {
        Self {
            field,
            url: url.into(),
        }
    }
}
