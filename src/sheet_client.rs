use crate::errors::EnrichError;
use crate::models::{EnrichmentStatus, FieldMap, LeadRecord, ScoreResult};
use crate::store::{normalize_stored_status, LeadStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client for the spreadsheet gateway REST API.
///
/// The gateway owns sheet credentials and cell addressing; this client only
/// sees rows with a stable key, the raw URL columns, and the enrichment
/// columns written back per row.
#[derive(Clone)]
pub struct SheetStoreClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

/// Row shape exchanged with the gateway.
#[derive(Debug, Serialize, Deserialize)]
struct SheetRow {
    key: String,
    linkedin_person_url: String,
    #[serde(default)]
    linkedin_company_url: Option<String>,
    #[serde(default)]
    fields: FieldMap,
    #[serde(default)]
    status: Option<EnrichmentStatus>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    score_rationale: Option<String>,
    #[serde(default)]
    last_error: Option<String>,
}

impl SheetStoreClient {
    pub fn new(base_url: String, token: String) -> Result<Self, EnrichError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EnrichError::Store(format!("Failed to create sheet client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn row_from_lead(lead: &LeadRecord) -> SheetRow {
        SheetRow {
            key: lead.key.clone(),
            linkedin_person_url: lead.linkedin_person_url.clone(),
            linkedin_company_url: lead.linkedin_company_url.clone(),
            fields: lead.fields.clone(),
            status: Some(lead.status),
            score: lead.score.as_ref().map(|s| s.value),
            score_rationale: lead.score.as_ref().map(|s| s.rationale.clone()),
            last_error: lead.last_error.clone(),
        }
    }

    fn lead_from_row(row: SheetRow) -> LeadRecord {
        let score = match (row.score, row.score_rationale) {
            (Some(value), rationale) => Some(ScoreResult {
                value,
                rationale: rationale.unwrap_or_default(),
            }),
            _ => None,
        };
        LeadRecord {
            key: row.key,
            linkedin_person_url: row.linkedin_person_url,
            linkedin_company_url: row.linkedin_company_url,
            fields: row.fields,
            status: normalize_stored_status(row.status.unwrap_or(EnrichmentStatus::Pending)),
            score,
            last_error: row.last_error,
        }
    }
}

#[async_trait]
impl LeadStore for SheetStoreClient {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<LeadRecord>, EnrichError> {
        let url = format!("{}/rows?limit={}", self.base_url, limit);
        tracing::debug!("Fetching up to {} rows from sheet gateway", limit);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|e| EnrichError::Store(format!("Gateway fetch failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EnrichError::Store(format!(
                "Gateway returned {}: {}",
                status, error_text
            )));
        }

        let rows: Vec<SheetRow> = response
            .json()
            .await
            .map_err(|e| EnrichError::Store(format!("Failed to parse gateway rows: {}", e)))?;

        Ok(rows.into_iter().map(Self::lead_from_row).collect())
    }

    async fn write_result(&self, lead: &LeadRecord) -> Result<(), EnrichError> {
        let url = format!("{}/rows/{}", self.base_url, lead.key);
        tracing::debug!("Writing result for row {} ({:?})", lead.key, lead.status);

        let response = self
            .client
            .put(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(&Self::row_from_lead(lead))
            .send()
            .await
            .map_err(|e| EnrichError::Store(format!("Gateway write failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EnrichError::Store(format!(
                "Gateway write for row {} returned {}: {}",
                lead.key, status, error_text
            )));
        }

        Ok(())
    }
}
