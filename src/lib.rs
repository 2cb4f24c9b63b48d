pub mod config;
pub mod discover;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod models;
pub mod pipeline;
pub mod session;
pub mod store;

pub use config::{MissingListingPolicy, ScraperConfig};
pub use error::{ExtractionFailure, ScrapeError};
pub use models::{
    DiscoverySummary, ListingRecord, ListingReference, ListingStatus, RawPage, RefreshSummary,
};
pub use session::{PageFetcher, SessionCredential};
