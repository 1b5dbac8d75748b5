use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use url::Url;

/// Enrichment fields accumulated across providers.
///
/// Keys are column names, values are flattened display strings. A `BTreeMap`
/// keeps persistence and test output deterministic.
pub type FieldMap = BTreeMap<String, String>;

/// Lifecycle status of a lead row. Transitions are one-directional within a
/// run: Pending → InProgress → {Enriched | PartiallyEnriched | Failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Pending,
    InProgress,
    Enriched,
    PartiallyEnriched,
    Failed,
}

impl EnrichmentStatus {
    fn rank(self) -> u8 {
        match self {
            EnrichmentStatus::Pending => 0,
            EnrichmentStatus::InProgress => 1,
            EnrichmentStatus::Enriched
            | EnrichmentStatus::PartiallyEnriched
            | EnrichmentStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

/// One lead row, owned by the batch coordinator for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadRecord {
    /// Stable row key from the lead store.
    pub key: String,
    pub linkedin_person_url: String,
    #[serde(default)]
    pub linkedin_company_url: Option<String>,
    #[serde(default)]
    pub fields: FieldMap,
    pub status: EnrichmentStatus,
    #[serde(default)]
    pub score: Option<ScoreResult>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl LeadRecord {
    pub fn new(key: impl Into<String>, person_url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            linkedin_person_url: person_url.into(),
            linkedin_company_url: None,
            fields: FieldMap::new(),
            status: EnrichmentStatus::Pending,
            score: None,
            last_error: None,
        }
    }

    /// Advance the status, ignoring regressions. Returns whether the
    /// transition was applied.
    pub fn transition(&mut self, next: EnrichmentStatus) -> bool {
        if next.rank() >= self.status.rank() && next != self.status {
            self.status = next;
            true
        } else if next == self.status {
            true
        } else {
            tracing::debug!(
                "Ignoring status regression for lead {}: {:?} -> {:?}",
                self.key,
                self.status,
                next
            );
            false
        }
    }
}

/// Classification of a single provider call. Every vendor failure maps to
/// exactly one variant; ambiguous errors default to `TransientError`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Success,
    NotFound,
    RateLimited,
    TransientError(String),
    FatalError(String),
}

/// Outcome of one provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResult {
    pub status: ProviderStatus,
    /// Partial field mapping; non-empty only on Success.
    #[serde(default)]
    pub fields: FieldMap,
    /// Cost estimate for this call, in dollars.
    pub cost: f64,
}

impl ProviderResult {
    pub fn success(fields: FieldMap, cost: f64) -> Self {
        Self {
            status: ProviderStatus::Success,
            fields,
            cost,
        }
    }

    pub fn of(status: ProviderStatus, cost: f64) -> Self {
        Self {
            status,
            fields: FieldMap::new(),
            cost,
        }
    }
}

/// LLM score for an enriched lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    /// Numeric score on the configured 0-10 scale.
    pub value: f64,
    /// Free-text justification returned alongside the score.
    pub rationale: String,
}

/// Terminal classification of one waterfall run against one lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Acceptance predicate satisfied.
    Sufficient,
    /// Some fields merged, predicate not satisfied.
    Partial,
    /// Nothing merged.
    Exhausted,
}

/// Why the waterfall stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Acceptance predicate satisfied.
    Accepted,
    /// Provider list walked to the end.
    ChainExhausted,
    /// Next call would exceed the per-lead cost ceiling.
    LeadBudget,
    /// Run-level budget refused the reservation.
    RunBudget,
}

/// Terminal result of running one waterfall spec against one lead.
#[derive(Debug, Clone)]
pub struct EnrichmentOutcome {
    pub status: OutcomeStatus,
    pub reason: StopReason,
    /// Full merged field map after this waterfall.
    pub fields: FieldMap,
    /// Providers attempted, in chain order.
    pub attempted: Vec<String>,
    /// Providers whose response was merged.
    pub succeeded: Vec<String>,
    /// Cumulative cost charged against this lead by this waterfall.
    pub cost: f64,
}

impl EnrichmentOutcome {
    /// Map the waterfall outcome onto the lead lifecycle status.
    pub fn lead_status(&self) -> EnrichmentStatus {
        match self.status {
            OutcomeStatus::Sufficient => EnrichmentStatus::Enriched,
            OutcomeStatus::Partial => EnrichmentStatus::PartiallyEnriched,
            OutcomeStatus::Exhausted => EnrichmentStatus::Failed,
        }
    }
}

/// Merge `incoming` into `accepted`, inserting only keys not already present.
///
/// Later (lower-priority) providers may add fields but never replace a value
/// accepted from an earlier provider. Empty incoming values are dropped.
/// Returns the number of fields added.
pub fn merge_missing(accepted: &mut FieldMap, incoming: FieldMap) -> usize {
    let mut added = 0;
    for (key, value) in incoming {
        if value.is_empty() {
            continue;
        }
        if !accepted.contains_key(&key) {
            accepted.insert(key, value);
            added += 1;
        }
    }
    added
}

/// Convert a nested JSON value into a human-readable column string.
///
/// Lists of objects become `k: v | k: v` segments joined by commas, objects
/// become `k: v | k: v`, scalars print as-is.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(format_value)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{}: {}", k, format_value(v)))
            .collect::<Vec<_>>()
            .join(" | "),
    }
}

/// Keys that describe the request rather than the lead; never merged.
const PAYLOAD_SKIP_KEYS: [&str; 5] = [
    "input_url",
    "url",
    "similar_profiles",
    "people_also_viewed",
    "timestamp",
];

/// Flatten a provider payload object into enrichment fields.
///
/// A `name` value is additionally split into `first_name`/`last_name`
/// columns, matching the sheet layout downstream consumers expect.
pub fn flatten_payload(payload: &Value) -> FieldMap {
    let mut fields = FieldMap::new();
    let obj = match payload.as_object() {
        Some(obj) => obj,
        None => return fields,
    };

    if let Some(full_name) = obj.get("name").and_then(|n| n.as_str()) {
        let mut parts = full_name.splitn(2, ' ');
        if let Some(first) = parts.next() {
            if !first.is_empty() {
                fields.insert("first_name".to_string(), first.to_string());
            }
        }
        if let Some(last) = parts.next() {
            fields.insert("last_name".to_string(), last.to_string());
        }
    }

    for (key, value) in obj {
        if PAYLOAD_SKIP_KEYS.contains(&key.as_str()) {
            continue;
        }
        let formatted = format_value(value);
        if formatted.is_empty() {
            continue;
        }
        fields.insert(key.clone(), formatted);
    }

    fields
}

/// Normalize a LinkedIn URL: drop the query string and any trailing slash.
pub fn normalize_linkedin_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    url.set_query(None);
    url.set_fragment(None);
    let mut normalized = url.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }
    Some(normalized)
}

/// Extract a company LinkedIn URL from a `current_company` column value.
///
/// The column carries `|`-separated segments; a `link:` segment holds the
/// URL directly, a `company_id:` segment yields one by construction.
pub fn extract_company_url(entry: &str) -> Option<String> {
    for part in entry.split('|') {
        let part = part.trim();
        if let Some(raw) = part.strip_prefix("link:") {
            if let Some(url) = normalize_linkedin_url(raw) {
                return Some(url);
            }
        } else if let Some(id) = part.strip_prefix("company_id:") {
            let id = id.trim();
            if !id.is_empty() {
                return Some(format!("https://www.linkedin.com/company/{}", id));
            }
        }
    }
    None
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // RFC 5322 simplified: local@domain.tld
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$",
        )
        .expect("email regex is valid")
    })
}

/// Validate an email address before spending a verifier call on it.
pub fn is_valid_email(email: &str) -> bool {
    if email.len() < 5 || !email.contains('@') || !email.contains('.') {
        return false;
    }
    email_regex().is_match(email)
}

/// First plausible email discovered among the merged fields.
pub fn discovered_email(fields: &FieldMap) -> Option<String> {
    fields
        .get("email")
        .map(|s| s.trim().to_string())
        .filter(|s| is_valid_email(s))
}
