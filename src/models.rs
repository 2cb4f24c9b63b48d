use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// A unique listing identifier plus its canonical URL.
///
/// The identifier is the path segment after `/lot/`, so incidental URL
/// variations (tracking parameters, fragments, trailing slashes) always map
/// to the same listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListingReference {
    pub identifier: String,
    pub url: String,
}

impl ListingReference {
    /// Derive a reference from any URL pointing at a lot page. Returns
    /// `None` for URLs that are not listings.
    pub fn from_url(raw: &str) -> Option<Self> {
        let parsed = Url::parse(raw).ok()?;
        let segments: Vec<String> = segments_of(&parsed)?;
        let lot_pos = segments.iter().position(|s| s == "lot")?;
        let identifier = segments.get(lot_pos + 1)?.clone();
        if identifier.is_empty() {
            return None;
        }

        let mut canonical = parsed;
        canonical.set_query(None);
        canonical.set_fragment(None);
        canonical.set_path(&format!("/{}", segments.join("/")));
        Some(Self {
            identifier,
            url: canonical.to_string(),
        })
    }
}

fn segments_of(url: &Url) -> Option<Vec<String>> {
    Some(
        url.path_segments()?
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Fetched content for one listing plus fetch metadata. Held in memory only
/// until extraction completes; never persisted.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub reference: ListingReference,
    pub fetched_at: DateTime<Utc>,
    /// HTTP status when the transport exposes one; browser fetches may not.
    pub status: Option<u16>,
    pub body: String,
    pub success: bool,
    pub error: Option<String>,
}

impl RawPage {
    pub fn ok(
        reference: ListingReference,
        fetched_at: DateTime<Utc>,
        status: Option<u16>,
        body: String,
    ) -> Self {
        Self {
            reference,
            fetched_at,
            status,
            body,
            success: true,
            error: None,
        }
    }

    pub fn failed(
        reference: ListingReference,
        fetched_at: DateTime<Utc>,
        status: Option<u16>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            reference,
            fetched_at,
            status,
            body: String::new(),
            success: false,
            error: Some(reason.into()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Active,
    Sold,
    Withdrawn,
    #[default]
    Unknown,
}

/// One row of the record table. Optional fields serialize as an explicit
/// `unknown` marker rather than an empty cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub identifier: String,
    pub url: String,
    #[serde(with = "unknown")]
    pub price: Option<f64>,
    #[serde(with = "unknown")]
    pub seller: Option<String>,
    #[serde(with = "unknown")]
    pub odometer: Option<u64>,
    #[serde(with = "unknown")]
    pub location: Option<String>,
    pub status: ListingStatus,
    pub bids: u32,
    #[serde(with = "unknown")]
    pub time_remaining_or_date_sold: Option<String>,
    pub last_seen: DateTime<Utc>,
}

/// Serde helper: absent optional fields are written as the literal
/// `unknown` marker and read back from `unknown` or an empty cell.
pub mod unknown {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::fmt::Display;
    use std::str::FromStr;

    pub const MARKER: &str = "unknown";

    pub fn serialize<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Display,
        S: Serializer,
    {
        match value {
            Some(v) => serializer.collect_str(v),
            None => serializer.serialize_str(MARKER),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(MARKER) {
            return Ok(None);
        }
        trimmed
            .parse::<T>()
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoverySummary {
    pub pages_visited: u32,
    pub discovered: usize,
    pub new_references: usize,
    pub total_known: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub updated: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_rows: usize,
    /// Identifiers that failed to fetch or extract this run, for operator
    /// follow-up.
    pub failed_identifiers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_is_stable_across_url_variants() {
        let variants = [
            "https://www.grays.com/lot/0012-3456789/automotive/2016-toyota-hilux",
            "https://www.grays.com/lot/0012-3456789/automotive/2016-toyota-hilux/",
            "https://www.grays.com/lot/0012-3456789/automotive/2016-toyota-hilux?utm_source=mail",
            "https://www.grays.com/lot/0012-3456789/automotive/2016-toyota-hilux#gallery",
        ];
        let refs: Vec<ListingReference> = variants
            .iter()
            .map(|u| ListingReference::from_url(u).unwrap())
            .collect();
        for r in &refs {
            assert_eq!(r.identifier, "0012-3456789");
            assert_eq!(r.url, refs[0].url);
        }
    }

    #[test]
    fn non_listing_urls_are_rejected() {
        assert!(ListingReference::from_url("https://www.grays.com/help/faq").is_none());
        assert!(ListingReference::from_url("not a url").is_none());
        assert!(ListingReference::from_url("https://www.grays.com/lot/").is_none());
    }
}
