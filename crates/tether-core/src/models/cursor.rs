//! Download position within the remote change feed.

use std::collections::BTreeSet;

use super::{EntityType, RemoteRecord};

/// Newest applied remote `updated_at` plus the records already applied at
/// exactly that instant.
///
/// Pulls include `updated_at == watermark_ms`, so a record committed in the
/// same millisecond after an earlier pull is still seen. Records listed in
/// `boundary` were applied before and are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCursor {
    pub watermark_ms: i64,
    pub boundary: BTreeSet<String>,
}

impl SyncCursor {
    pub const fn new(watermark_ms: i64) -> Self {
        Self {
            watermark_ms,
            boundary: BTreeSet::new(),
        }
    }

    /// Boundary key of one record
    pub fn key(entity_type: EntityType, id: &str) -> String {
        format!("{entity_type}:{id}")
    }

    /// Whether a pulled record was already applied by an earlier cycle.
    pub fn covers(&self, record: &RemoteRecord) -> bool {
        record.updated_at < self.watermark_ms
            || (record.updated_at == self.watermark_ms
                && self
                    .boundary
                    .contains(&Self::key(record.entity_type, &record.id)))
    }

    /// Cursor after applying `records`. Never moves backwards.
    #[must_use]
    pub fn advanced(&self, records: &[RemoteRecord]) -> Self {
        let newest = records
            .iter()
            .map(|record| record.updated_at)
            .fold(self.watermark_ms, i64::max);

        let mut boundary = if newest == self.watermark_ms {
            self.boundary.clone()
        } else {
            BTreeSet::new()
        };
        boundary.extend(
            records
                .iter()
                .filter(|record| record.updated_at == newest)
                .map(|record| Self::key(record.entity_type, &record.id)),
        );

        Self {
            watermark_ms: newest,
            boundary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::Map;

    fn record(id: &str, updated_at: i64) -> RemoteRecord {
        RemoteRecord {
            id: id.to_string(),
            entity_type: EntityType::Task,
            data: Map::new(),
            updated_at,
            deleted: false,
        }
    }

    #[test]
    fn test_same_instant_records_accumulate() {
        let first = SyncCursor::default().advanced(&[record("a", 5), record("b", 9)]);
        assert_eq!(first.watermark_ms, 9);
        assert_eq!(first.boundary, BTreeSet::from(["task:b".to_string()]));

        let second = first.advanced(&[record("c", 9)]);
        assert_eq!(second.watermark_ms, 9);
        assert_eq!(second.boundary.len(), 2);

        assert!(second.covers(&record("b", 9)));
        assert!(second.covers(&record("a", 5)));
        assert!(!second.covers(&record("d", 9)));
        assert!(!second.covers(&record("b", 10)));
    }

    #[test]
    fn test_newer_instant_resets_boundary() {
        let cursor = SyncCursor::default()
            .advanced(&[record("a", 9)])
            .advanced(&[record("b", 12)]);
        assert_eq!(cursor.watermark_ms, 12);
        assert_eq!(cursor.boundary, BTreeSet::from(["task:b".to_string()]));
    }

    #[test]
    fn test_never_moves_backwards() {
        let cursor = SyncCursor::new(20).advanced(&[record("a", 3)]);
        assert_eq!(cursor, SyncCursor::new(20));
    }
}
