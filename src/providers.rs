use crate::config::{ProviderConfig, ProviderKind, WaterfallFile};
use crate::errors::EnrichError;
use crate::models::{
    discovered_email, extract_company_url, flatten_payload, normalize_linkedin_url, FieldMap,
    LeadRecord, ProviderResult, ProviderStatus,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Uniform interface over one external data capability.
///
/// `call` never returns `Err`: every vendor failure is classified into
/// exactly one `ProviderStatus` variant so the waterfall can fold it into
/// the next-provider decision. One invocation means one billed external
/// call; duplicate-call avoidance is the resolver's job.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Identifier referenced by goal chains and rate-limit buckets.
    fn id(&self) -> &str;

    /// Declared cost estimate per call, used for ceiling pre-checks.
    fn cost_per_call(&self) -> f64;

    /// The URL or email this provider would act on for the given lead.
    /// `None` means the provider cannot serve this lead at all.
    fn target(&self, lead: &LeadRecord) -> Option<String>;

    async fn call(&self, lead: &LeadRecord) -> ProviderResult;
}

/// Map a non-success HTTP status onto the provider taxonomy. Ambiguous
/// statuses default to TransientError (safe: retried, bounded).
pub fn classify_http_status(status: StatusCode, body: &str) -> ProviderStatus {
    match status {
        StatusCode::NOT_FOUND => ProviderStatus::NotFound,
        StatusCode::TOO_MANY_REQUESTS => ProviderStatus::RateLimited,
        StatusCode::REQUEST_TIMEOUT => {
            ProviderStatus::TransientError(format!("{}: {}", status, truncate(body)))
        }
        s if s.is_server_error() => {
            ProviderStatus::TransientError(format!("{}: {}", status, truncate(body)))
        }
        s if s.is_client_error() => {
            ProviderStatus::FatalError(format!("{}: {}", status, truncate(body)))
        }
        s => ProviderStatus::TransientError(format!("unexpected status {}", s)),
    }
}

/// Transport-level failures (connect, timeout, protocol) are transient.
pub fn classify_transport(err: &reqwest::Error) -> ProviderStatus {
    ProviderStatus::TransientError(err.to_string())
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}

fn build_client(timeout: Duration) -> Result<Client, EnrichError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| EnrichError::Provider(format!("Failed to create HTTP client: {}", e)))
}

/// Search-engine based scraper: the cheap first rung of the profile chain.
/// Queries the vendor's SERP endpoint for the profile URL and extracts what
/// is visible from the result titles and snippets.
pub struct SerpSearchProvider {
    id: String,
    client: Client,
    base_url: String,
    api_key: String,
    cost: f64,
}

impl SerpSearchProvider {
    pub fn new(cfg: &ProviderConfig, api_key: String) -> Result<Self, EnrichError> {
        Ok(Self {
            id: cfg.id.clone(),
            client: build_client(Duration::from_secs(30))?,
            base_url: cfg.base_url.clone(),
            api_key,
            cost: cfg.cost_per_call,
        })
    }

    fn fields_from_results(results: &[Value]) -> FieldMap {
        let mut fields = FieldMap::new();
        let first = match results.first() {
            Some(v) => v,
            None => return fields,
        };

        // SERP titles for LinkedIn profiles read "Name - Position - Company".
        if let Some(title) = first.get("title").and_then(|t| t.as_str()) {
            let mut parts = title.split(" - ").map(str::trim);
            if let Some(name) = parts.next() {
                if !name.is_empty() {
                    fields.insert("name".to_string(), name.to_string());
                }
            }
            if let Some(position) = parts.next() {
                if !position.is_empty() {
                    fields.insert("position".to_string(), position.to_string());
                }
            }
        }
        if let Some(snippet) = first.get("snippet").and_then(|s| s.as_str()) {
            if !snippet.is_empty() {
                fields.insert("about".to_string(), snippet.to_string());
            }
        }
        fields
    }
}

#[async_trait]
impl ProviderAdapter for SerpSearchProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn cost_per_call(&self) -> f64 {
        self.cost
    }

    fn target(&self, lead: &LeadRecord) -> Option<String> {
        normalize_linkedin_url(&lead.linkedin_person_url)
    }

    async fn call(&self, lead: &LeadRecord) -> ProviderResult {
        let target = match self.target(lead) {
            Some(t) => t,
            None => {
                return ProviderResult::of(
                    ProviderStatus::FatalError("lead has no usable person URL".to_string()),
                    self.cost,
                )
            }
        };

        let url = match reqwest::Url::parse_with_params(
            &format!("{}/search", self.base_url),
            &[("api_key", self.api_key.as_str()), ("q", target.as_str())],
        ) {
            Ok(url) => url,
            Err(e) => {
                return ProviderResult::of(
                    ProviderStatus::FatalError(format!("Failed to build URL: {}", e)),
                    self.cost,
                )
            }
        };

        tracing::debug!(
            "SERP lookup via '{}': {}/search?api_key=[REDACTED]&q={}",
            self.id,
            self.base_url,
            target
        );

        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return ProviderResult::of(classify_transport(&e), self.cost),
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return ProviderResult::of(classify_http_status(status, &body), self.cost);
        }

        let payload: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                return ProviderResult::of(
                    ProviderStatus::TransientError(format!("malformed SERP payload: {}", e)),
                    self.cost,
                )
            }
        };

        let results = payload
            .get("results")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();
        let fields = Self::fields_from_results(&results);
        if fields.is_empty() {
            return ProviderResult::of(ProviderStatus::NotFound, self.cost);
        }
        ProviderResult::success(fields, self.cost)
    }
}

/// Dataset scraper for person profiles (Bright-Data style): POST the URL to
/// a dataset trigger endpoint, get the scraped record back.
pub struct ProfileScrapeProvider {
    id: String,
    client: Client,
    base_url: String,
    api_key: String,
    dataset_id: String,
    cost: f64,
}

impl ProfileScrapeProvider {
    pub fn new(cfg: &ProviderConfig, api_key: String) -> Result<Self, EnrichError> {
        let dataset_id = cfg.dataset_id.clone().ok_or_else(|| {
            EnrichError::Provider(format!("provider '{}' requires a dataset_id", cfg.id))
        })?;
        Ok(Self {
            id: cfg.id.clone(),
            client: build_client(Duration::from_secs(30))?,
            base_url: cfg.base_url.clone(),
            api_key,
            dataset_id,
            cost: cfg.cost_per_call,
        })
    }
}

/// Trigger a dataset scrape for one URL and classify the response.
/// Shared by the profile and company scrapers, which differ only in the
/// dataset they hit and how the payload maps onto columns.
async fn scrape_one(
    client: &Client,
    base_url: &str,
    api_key: &str,
    dataset_id: &str,
    provider_id: &str,
    target: &str,
    cost: f64,
) -> Result<Value, ProviderResult> {
    let url = match reqwest::Url::parse_with_params(
        &format!("{}/datasets/trigger", base_url),
        &[("dataset_id", dataset_id), ("include_errors", "true")],
    ) {
        Ok(url) => url,
        Err(e) => {
            return Err(ProviderResult::of(
                ProviderStatus::FatalError(format!("Failed to build URL: {}", e)),
                cost,
            ))
        }
    };

    tracing::debug!(
        "Scrape via '{}' (dataset {}): {}",
        provider_id,
        dataset_id,
        target
    );

    let response = match client
        .post(url)
        .header("Authorization", format!("Bearer {}", api_key))
        .json(&json!([{ "url": target }]))
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => return Err(ProviderResult::of(classify_transport(&e), cost)),
    };

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderResult::of(classify_http_status(status, &body), cost));
    }

    let payload: Value = match response.json().await {
        Ok(v) => v,
        Err(e) => {
            return Err(ProviderResult::of(
                ProviderStatus::TransientError(format!("malformed scrape payload: {}", e)),
                cost,
            ))
        }
    };

    // The vendor answers with either the record itself or a one-element
    // batch; an empty batch means the page had no data.
    let record = match payload {
        Value::Array(mut items) => {
            if items.is_empty() {
                return Err(ProviderResult::of(ProviderStatus::NotFound, cost));
            }
            items.remove(0)
        }
        other => other,
    };
    Ok(record)
}

#[async_trait]
impl ProviderAdapter for ProfileScrapeProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn cost_per_call(&self) -> f64 {
        self.cost
    }

    fn target(&self, lead: &LeadRecord) -> Option<String> {
        normalize_linkedin_url(&lead.linkedin_person_url)
    }

    async fn call(&self, lead: &LeadRecord) -> ProviderResult {
        let target = match self.target(lead) {
            Some(t) => t,
            None => {
                return ProviderResult::of(
                    ProviderStatus::FatalError("lead has no usable person URL".to_string()),
                    self.cost,
                )
            }
        };

        let record = match scrape_one(
            &self.client,
            &self.base_url,
            &self.api_key,
            &self.dataset_id,
            &self.id,
            &target,
            self.cost,
        )
        .await
        {
            Ok(record) => record,
            Err(result) => return result,
        };

        let fields = flatten_payload(&record);
        if fields.is_empty() {
            return ProviderResult::of(ProviderStatus::NotFound, self.cost);
        }
        ProviderResult::success(fields, self.cost)
    }
}

/// Dataset scraper for company pages. Targets the lead's company URL,
/// taken from the input column or discovered in the merged profile fields.
pub struct CompanyScrapeProvider {
    id: String,
    client: Client,
    base_url: String,
    api_key: String,
    dataset_id: String,
    cost: f64,
}

impl CompanyScrapeProvider {
    pub fn new(cfg: &ProviderConfig, api_key: String) -> Result<Self, EnrichError> {
        let dataset_id = cfg.dataset_id.clone().ok_or_else(|| {
            EnrichError::Provider(format!("provider '{}' requires a dataset_id", cfg.id))
        })?;
        Ok(Self {
            id: cfg.id.clone(),
            client: build_client(Duration::from_secs(30))?,
            base_url: cfg.base_url.clone(),
            api_key,
            dataset_id,
            cost: cfg.cost_per_call,
        })
    }

    fn prefix_company_fields(fields: FieldMap) -> FieldMap {
        fields
            .into_iter()
            .map(|(k, v)| {
                if k.starts_with("company") {
                    (k, v)
                } else {
                    (format!("company_{}", k), v)
                }
            })
            .collect()
    }
}

#[async_trait]
impl ProviderAdapter for CompanyScrapeProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn cost_per_call(&self) -> f64 {
        self.cost
    }

    fn target(&self, lead: &LeadRecord) -> Option<String> {
        if let Some(url) = &lead.linkedin_company_url {
            return normalize_linkedin_url(url);
        }
        lead.fields
            .get("current_company")
            .and_then(|entry| extract_company_url(entry))
    }

    async fn call(&self, lead: &LeadRecord) -> ProviderResult {
        let target = match self.target(lead) {
            Some(t) => t,
            None => {
                return ProviderResult::of(
                    ProviderStatus::FatalError("lead has no company URL".to_string()),
                    self.cost,
                )
            }
        };

        let record = match scrape_one(
            &self.client,
            &self.base_url,
            &self.api_key,
            &self.dataset_id,
            &self.id,
            &target,
            self.cost,
        )
        .await
        {
            Ok(record) => record,
            Err(result) => return result,
        };

        let fields = Self::prefix_company_fields(flatten_payload(&record));
        if fields.is_empty() {
            return ProviderResult::of(ProviderStatus::NotFound, self.cost);
        }
        ProviderResult::success(fields, self.cost)
    }
}

/// Email deliverability verifier. Consumes the email discovered during
/// profile enrichment and writes `email_status`/`email_score` columns.
pub struct EmailVerifyProvider {
    id: String,
    client: Client,
    base_url: String,
    api_key: String,
    cost: f64,
}

impl EmailVerifyProvider {
    pub fn new(cfg: &ProviderConfig, api_key: String) -> Result<Self, EnrichError> {
        Ok(Self {
            id: cfg.id.clone(),
            client: build_client(Duration::from_secs(30))?,
            base_url: cfg.base_url.clone(),
            api_key,
            cost: cfg.cost_per_call,
        })
    }
}

#[async_trait]
impl ProviderAdapter for EmailVerifyProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn cost_per_call(&self) -> f64 {
        self.cost
    }

    fn target(&self, lead: &LeadRecord) -> Option<String> {
        discovered_email(&lead.fields)
    }

    async fn call(&self, lead: &LeadRecord) -> ProviderResult {
        let email = match self.target(lead) {
            Some(email) => email,
            None => {
                return ProviderResult::of(
                    ProviderStatus::FatalError("lead has no email to verify".to_string()),
                    self.cost,
                )
            }
        };

        let url = match reqwest::Url::parse_with_params(
            &format!("{}/v1/verify", self.base_url),
            &[("api_key", self.api_key.as_str()), ("email", email.as_str())],
        ) {
            Ok(url) => url,
            Err(e) => {
                return ProviderResult::of(
                    ProviderStatus::FatalError(format!("Failed to build URL: {}", e)),
                    self.cost,
                )
            }
        };

        tracing::debug!(
            "Email verification via '{}': {}/v1/verify?api_key=[REDACTED]&email={}",
            self.id,
            self.base_url,
            email
        );

        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return ProviderResult::of(classify_transport(&e), self.cost),
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return ProviderResult::of(classify_http_status(status, &body), self.cost);
        }

        let payload: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                return ProviderResult::of(
                    ProviderStatus::TransientError(format!("malformed verifier payload: {}", e)),
                    self.cost,
                )
            }
        };

        let result = payload
            .get("result")
            .and_then(|r| r.as_str())
            .unwrap_or("unknown");
        if result == "unknown" {
            return ProviderResult::of(ProviderStatus::NotFound, self.cost);
        }

        let mut fields = FieldMap::new();
        fields.insert("email_status".to_string(), result.to_string());
        if let Some(score) = payload.get("score").and_then(|s| s.as_f64()) {
            fields.insert("email_score".to_string(), format!("{:.2}", score));
        }
        ProviderResult::success(fields, self.cost)
    }
}

/// Fixed registry of provider adapters, built once per run from the
/// waterfall file. Unknown identifiers are rejected here, at startup,
/// rather than mid-run.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn from_config(
        file: &WaterfallFile,
        api_keys: &HashMap<String, String>,
    ) -> Result<Self, EnrichError> {
        let mut registry = Self::new();
        for cfg in &file.providers {
            let key = api_keys.get(&cfg.id).cloned().unwrap_or_default();
            let adapter: Arc<dyn ProviderAdapter> = match cfg.kind {
                ProviderKind::SerpSearch => Arc::new(SerpSearchProvider::new(cfg, key)?),
                ProviderKind::ProfileScrape => Arc::new(ProfileScrapeProvider::new(cfg, key)?),
                ProviderKind::CompanyScrape => Arc::new(CompanyScrapeProvider::new(cfg, key)?),
                ProviderKind::EmailVerify => Arc::new(EmailVerifyProvider::new(cfg, key)?),
            };
            registry.register(adapter);
        }
        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.providers.insert(adapter.id().to_string(), adapter);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.providers.get(id).cloned()
    }

    /// Resolve an ordered chain of provider ids into adapters, failing on
    /// the first unknown identifier.
    pub fn resolve_chain(&self, ids: &[String]) -> Result<Vec<Arc<dyn ProviderAdapter>>, EnrichError> {
        if ids.is_empty() {
            return Err(EnrichError::Config("empty provider chain".to_string()));
        }
        ids.iter()
            .map(|id| {
                self.get(id)
                    .ok_or_else(|| EnrichError::Config(format!("unknown provider id '{}'", id)))
            })
            .collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
