use crate::config::ScoringConfig;
use crate::errors::EnrichError;
use crate::models::{FieldMap, ProviderStatus, ScoreResult};
use crate::providers::{classify_http_status, classify_transport};
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::OnceLock;
use std::time::Duration;

/// Prompt-driven lead scorer.
///
/// One scoring call is a single-provider waterfall step: the caller drives
/// rate limiting and retries through the same machinery as enrichment
/// providers (bucket id `"scorer"`). A malformed response is a FatalError
/// and degrades the lead to enriched-unscored; it never fails the run.
pub struct LeadScorer {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    prompt: String,
    fields: Vec<String>,
    cost: f64,
}

impl LeadScorer {
    pub fn new(cfg: &ScoringConfig, api_key: String) -> Result<Self, EnrichError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| EnrichError::Scoring(format!("Failed to create scorer client: {}", e)))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.clone(),
            api_key,
            model: cfg.model.clone(),
            prompt: cfg.prompt.clone(),
            fields: cfg.fields.clone(),
            cost: cfg.cost_per_call,
        })
    }

    pub fn cost_per_call(&self) -> f64 {
        self.cost
    }

    /// Fill `{field}` placeholders from the merged lead fields. Fields the
    /// waterfall never produced render as empty strings rather than
    /// aborting the scoring call.
    pub fn render_prompt(&self, fields: &FieldMap) -> String {
        let mut prompt = self.prompt.clone();
        for name in &self.fields {
            let placeholder = format!("{{{}}}", name);
            let value = fields.get(name).map(String::as_str).unwrap_or("");
            prompt = prompt.replace(&placeholder, value);
        }
        prompt
    }

    /// One scoring attempt. Failures come back classified so the caller can
    /// fold them into the retry decision like any provider call.
    pub async fn score(&self, fields: &FieldMap) -> Result<ScoreResult, ProviderStatus> {
        let prompt = self.render_prompt(fields);
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = match self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return Err(classify_transport(&e)),
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_status(status, &text));
        }

        let payload: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                return Err(ProviderStatus::TransientError(format!(
                    "malformed completion payload: {}",
                    e
                )))
            }
        };

        let content = payload
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("");

        match parse_score(content) {
            Some(score) => {
                tracing::info!("Scored lead: {:.1} ({} chars rationale)", score.value, score.rationale.len());
                Ok(score)
            }
            None => Err(ProviderStatus::FatalError(format!(
                "unparseable score response: '{}'",
                content.chars().take(120).collect::<String>()
            ))),
        }
    }
}

fn score_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([0-9]+(?:\.[0-9]+)?)").expect("score regex is valid"))
}

/// Parse the scoring contract: a leading numeric score on the first line
/// (0-10 scale), everything after it is the rationale.
pub fn parse_score(content: &str) -> Option<ScoreResult> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut lines = trimmed.lines();
    let first = lines.next()?.trim();
    let captures = score_regex().captures(first)?;
    let matched = captures.get(1)?;
    let value: f64 = matched.as_str().parse().ok()?;
    if !(0.0..=10.0).contains(&value) {
        return None;
    }

    let mut rest = first[matched.end()..].trim_start();
    // Tolerate a "7/10"-style scale suffix.
    if let Some(stripped) = rest.strip_prefix("/10") {
        rest = stripped;
    }
    let first_rest = rest.trim_start_matches(['-', ':', '|', ' ']).trim();
    let mut rationale_parts: Vec<&str> = Vec::new();
    if !first_rest.is_empty() {
        rationale_parts.push(first_rest);
    }
    for line in lines {
        let line = line.trim();
        if !line.is_empty() {
            rationale_parts.push(line);
        }
    }

    Some(ScoreResult {
        value,
        rationale: rationale_parts.join(" "),
    })
}
