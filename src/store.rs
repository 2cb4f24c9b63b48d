use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::info;

use crate::error::ScrapeError;
use crate::models::{ListingRecord, ListingReference, ListingStatus};

const REFERENCE_HEADERS: [&str; 3] = ["identifier", "url", "last_seen"];
const RECORD_HEADERS: [&str; 10] = [
    "identifier",
    "url",
    "price",
    "seller",
    "odometer",
    "location",
    "status",
    "bids",
    "time_remaining_or_date_sold",
    "last_seen",
];

/// One row of the reference table: every listing ever discovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRow {
    pub identifier: String,
    pub url: String,
    pub last_seen: DateTime<Utc>,
}

/// Persisted set of all known listing identifiers/URLs, keyed by
/// identifier. Only the merger writes it; everything else reads.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    rows: BTreeMap<String, ReferenceRow>,
}

impl ReferenceTable {
    /// A missing file is an empty table, so a first run works from zero
    /// state.
    pub fn load(path: &Path) -> Result<Self, ScrapeError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let mut reader = csv::Reader::from_path(path)?;
        let mut rows = BTreeMap::new();
        for row in reader.deserialize::<ReferenceRow>() {
            let row = row?;
            if rows.insert(row.identifier.clone(), row.clone()).is_some() {
                return Err(ScrapeError::MergeIntegrity(format!(
                    "reference table {} contains duplicate identifier '{}'",
                    path.display(),
                    row.identifier
                )));
            }
        }
        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.rows.contains_key(identifier)
    }

    pub fn references(&self) -> Vec<ListingReference> {
        self.rows
            .values()
            .map(|row| ListingReference {
                identifier: row.identifier.clone(),
                url: row.url.clone(),
            })
            .collect()
    }

    /// Fold newly discovered references in: unseen identifiers are added,
    /// known ones only get their last_seen refreshed (existing metadata is
    /// never overwritten by discovery). Returns how many were new.
    pub fn merge_references(
        &mut self,
        references: &[ListingReference],
        now: DateTime<Utc>,
    ) -> usize {
        let mut added = 0;
        for reference in references {
            match self.rows.get_mut(&reference.identifier) {
                Some(existing) => existing.last_seen = now,
                None => {
                    self.rows.insert(
                        reference.identifier.clone(),
                        ReferenceRow {
                            identifier: reference.identifier.clone(),
                            url: reference.url.clone(),
                            last_seen: now,
                        },
                    );
                    added += 1;
                }
            }
        }
        added
    }

    pub fn write_atomic(&self, path: &Path) -> Result<(), ScrapeError> {
        write_atomic_rows(path, self.rows.values(), &REFERENCE_HEADERS)?;
        info!("Wrote {} references to {}", self.rows.len(), path.display());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub updated: usize,
    pub total: usize,
}

/// Persisted structured attributes per listing, keyed by identifier.
/// Rows are never deleted automatically: a listing that disappears from
/// search results simply stops having its last_seen refreshed.
#[derive(Debug, Clone, Default)]
pub struct RecordTable {
    rows: BTreeMap<String, ListingRecord>,
}

impl RecordTable {
    pub fn load(path: &Path) -> Result<Self, ScrapeError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let mut reader = csv::Reader::from_path(path)?;
        let mut rows = BTreeMap::new();
        for row in reader.deserialize::<ListingRecord>() {
            let row = row?;
            if rows.insert(row.identifier.clone(), row.clone()).is_some() {
                return Err(ScrapeError::MergeIntegrity(format!(
                    "record table {} contains duplicate identifier '{}'",
                    path.display(),
                    row.identifier
                )));
            }
        }
        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, identifier: &str) -> Option<&ListingRecord> {
        self.rows.get(identifier)
    }

    /// Merge freshly extracted records: existing identifiers are fully
    /// overwritten and stamped with `now`, new ones inserted, untouched
    /// rows retained as-is. The staged batch is validated before any state
    /// changes, so a `MergeIntegrity` error leaves the table exactly as it
    /// was.
    pub fn merge(
        &mut self,
        new_records: &[ListingRecord],
        now: DateTime<Utc>,
    ) -> Result<MergeStats, ScrapeError> {
        let mut staged: HashSet<&str> = HashSet::new();
        for record in new_records {
            if !staged.insert(&record.identifier) {
                return Err(ScrapeError::MergeIntegrity(format!(
                    "duplicate identifier '{}' in staged batch",
                    record.identifier
                )));
            }
        }

        let mut stats = MergeStats::default();
        for record in new_records {
            let mut row = record.clone();
            row.last_seen = now;
            if self.rows.insert(row.identifier.clone(), row).is_some() {
                stats.updated += 1;
            } else {
                stats.inserted += 1;
            }
        }
        stats.total = self.rows.len();
        Ok(stats)
    }

    /// Flip a record to withdrawn when its page has definitively vanished
    /// (the `MarkWithdrawn` missing-listing policy).
    pub fn mark_withdrawn(&mut self, identifier: &str) -> bool {
        match self.rows.get_mut(identifier) {
            Some(row) => {
                row.status = ListingStatus::Withdrawn;
                true
            }
            None => false,
        }
    }

    pub fn write_atomic(&self, path: &Path) -> Result<(), ScrapeError> {
        write_atomic_rows(path, self.rows.values(), &RECORD_HEADERS)?;
        info!("Wrote {} records to {}", self.rows.len(), path.display());
        Ok(())
    }
}

/// Stage the full table into a temp file next to the target and swap it in
/// only after every row serialized cleanly. A crash mid-write leaves the
/// previous good table untouched.
fn write_atomic_rows<'a, T: Serialize + 'a>(
    path: &Path,
    rows: impl ExactSizeIterator<Item = &'a T>,
    headers: &[&str],
) -> Result<(), ScrapeError> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        std::fs::create_dir_all(parent)?;
    }
    let temp = NamedTempFile::new_in(parent.unwrap_or_else(|| Path::new(".")))?;
    {
        let mut writer = csv::Writer::from_writer(temp.as_file());
        if rows.len() == 0 {
            // serde only emits headers alongside a first row; an empty
            // table still needs to be well-formed.
            writer.write_record(headers)?;
        }
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush().map_err(ScrapeError::Io)?;
    }
    temp.persist(path).map_err(|e| ScrapeError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap()
    }

    fn record(id: &str, price: Option<f64>, status: ListingStatus) -> ListingRecord {
        ListingRecord {
            identifier: id.to_string(),
            url: format!("https://www.grays.com/lot/{id}/automotive/car"),
            price,
            seller: Some("Dealer".to_string()),
            odometer: Some(100_000),
            location: Some("Sydney NSW".to_string()),
            status,
            bids: 3,
            time_remaining_or_date_sold: None,
            last_seen: fixed_now(),
        }
    }

    #[test]
    fn rows_absent_from_the_batch_are_retained_unchanged() {
        let mut table = RecordTable::default();
        let old = record("0001-1", Some(5000.0), ListingStatus::Sold);
        table
            .merge(std::slice::from_ref(&old), fixed_now())
            .unwrap();

        let later = Utc.with_ymd_and_hms(2026, 8, 2, 12, 0, 0).unwrap();
        table
            .merge(&[record("0002-2", Some(7000.0), ListingStatus::Active)], later)
            .unwrap();

        let retained = table.get("0001-1").unwrap();
        assert_eq!(retained, &old);
        assert_eq!(retained.last_seen, fixed_now());
        assert_eq!(table.get("0002-2").unwrap().last_seen, later);
    }

    #[test]
    fn batch_version_wins_over_existing_row() {
        let mut table = RecordTable::default();
        table
            .merge(
                &[record("0001-1", Some(5000.0), ListingStatus::Active)],
                fixed_now(),
            )
            .unwrap();

        let later = Utc.with_ymd_and_hms(2026, 8, 3, 12, 0, 0).unwrap();
        let stats = table
            .merge(&[record("0001-1", Some(6200.0), ListingStatus::Sold)], later)
            .unwrap();

        assert_eq!(stats.updated, 1);
        assert_eq!(stats.inserted, 0);
        let row = table.get("0001-1").unwrap();
        assert_eq!(row.price, Some(6200.0));
        assert_eq!(row.status, ListingStatus::Sold);
        assert_eq!(row.last_seen, later);
    }

    #[test]
    fn duplicate_identifiers_in_the_batch_abort_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");

        let mut table = RecordTable::default();
        table
            .merge(
                &[record("0001-1", Some(5000.0), ListingStatus::Active)],
                fixed_now(),
            )
            .unwrap();
        table.write_atomic(&path).unwrap();
        let bytes_before = std::fs::read(&path).unwrap();

        let mut colliding = record("0002-2", Some(1.0), ListingStatus::Active);
        colliding.url = "https://www.grays.com/lot/0002-2/a".to_string();
        let mut other = record("0002-2", Some(2.0), ListingStatus::Active);
        other.url = "https://www.grays.com/lot/0002-2/b".to_string();

        let err = table.merge(&[colliding, other], fixed_now()).unwrap_err();
        assert!(matches!(err, ScrapeError::MergeIntegrity(_)));

        // In-memory state untouched, persisted table byte-identical.
        assert_eq!(table.len(), 1);
        assert!(table.get("0002-2").is_none());
        assert_eq!(std::fs::read(&path).unwrap(), bytes_before);
    }

    #[test]
    fn merging_the_same_batch_twice_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        let batch = vec![
            record("0001-1", Some(5000.0), ListingStatus::Active),
            record("0002-2", None, ListingStatus::Unknown),
        ];

        let mut table = RecordTable::load(&path).unwrap();
        table.merge(&batch, fixed_now()).unwrap();
        table.write_atomic(&path).unwrap();
        let first = std::fs::read(&path).unwrap();

        let mut table = RecordTable::load(&path).unwrap();
        table.merge(&batch, fixed_now()).unwrap();
        table.write_atomic(&path).unwrap();
        let second = std::fs::read(&path).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn empty_table_writes_a_well_formed_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        RecordTable::default().write_atomic(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("identifier,url,price"));
        assert!(RecordTable::load(&path).unwrap().is_empty());
    }

    #[test]
    fn unknown_markers_round_trip_through_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        let mut row = record("0001-1", None, ListingStatus::Unknown);
        row.odometer = None;
        row.seller = None;

        let mut table = RecordTable::default();
        table.merge(std::slice::from_ref(&row), fixed_now()).unwrap();
        table.write_atomic(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("unknown"));
        let reloaded = RecordTable::load(&path).unwrap();
        assert_eq!(reloaded.get("0001-1").unwrap(), &row);
    }

    #[test]
    fn discovery_merge_refreshes_last_seen_but_keeps_existing_url() {
        let mut table = ReferenceTable::default();
        let original = ListingReference {
            identifier: "0001-1".to_string(),
            url: "https://www.grays.com/lot/0001-1/original".to_string(),
        };
        assert_eq!(table.merge_references(&[original], fixed_now()), 1);

        let later = Utc.with_ymd_and_hms(2026, 8, 5, 0, 0, 0).unwrap();
        let rediscovered = ListingReference {
            identifier: "0001-1".to_string(),
            url: "https://www.grays.com/lot/0001-1/renamed-slug".to_string(),
        };
        assert_eq!(table.merge_references(&[rediscovered], later), 0);

        let refs = table.references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].url, "https://www.grays.com/lot/0001-1/original");
    }
}
