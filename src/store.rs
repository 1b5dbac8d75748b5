use crate::errors::EnrichError;
use crate::models::{EnrichmentStatus, LeadRecord};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// Boundary to the persisted lead rows.
///
/// Rows are independent: implementations must tolerate concurrent per-row
/// writes without a global lock. A failed write is reported to the caller
/// and logged, never fatal to the run — the row stays eligible next run
/// (at-least-once semantics).
#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Read up to `limit` rows eligible for processing. Stored statuses are
    /// normalized on the way in: anything but Enriched comes back Pending;
    /// Enriched rows are returned as-is so the skip policy can see them.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<LeadRecord>, EnrichError>;

    /// Persist one row's fields, status, score, and last error.
    async fn write_result(&self, lead: &LeadRecord) -> Result<(), EnrichError>;
}

/// Normalize a stored status for a fresh run (see `fetch_pending`).
pub fn normalize_stored_status(status: EnrichmentStatus) -> EnrichmentStatus {
    match status {
        EnrichmentStatus::Enriched => EnrichmentStatus::Enriched,
        _ => EnrichmentStatus::Pending,
    }
}

/// In-memory lead store for tests and local dry runs.
pub struct MemoryLeadStore {
    rows: Mutex<BTreeMap<String, LeadRecord>>,
}

impl MemoryLeadStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn insert(&self, lead: LeadRecord) {
        let mut rows = self.rows.lock().await;
        rows.insert(lead.key.clone(), lead);
    }

    pub async fn get(&self, key: &str) -> Option<LeadRecord> {
        let rows = self.rows.lock().await;
        rows.get(key).cloned()
    }

    pub async fn snapshot(&self) -> Vec<LeadRecord> {
        let rows = self.rows.lock().await;
        rows.values().cloned().collect()
    }
}

impl Default for MemoryLeadStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeadStore for MemoryLeadStore {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<LeadRecord>, EnrichError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .take(limit)
            .cloned()
            .map(|mut lead| {
                lead.status = normalize_stored_status(lead.status);
                lead
            })
            .collect())
    }

    async fn write_result(&self, lead: &LeadRecord) -> Result<(), EnrichError> {
        let mut rows = self.rows.lock().await;
        rows.insert(lead.key.clone(), lead.clone());
        Ok(())
    }
}
