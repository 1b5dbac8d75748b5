use serde::Deserialize;
use std::collections::{HashMap, HashSet};

/// Enrichment goals with a configurable provider chain.
pub const GOALS: [&str; 3] = ["profile", "company", "email"];

/// Run-level knobs, all overridable from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Rows fetched from the store per batch.
    pub chunk_size: usize,
    /// Worker pool size.
    pub max_concurrency: usize,
    /// Hard cost cap for the whole run, in dollars.
    pub run_cost_ceiling: f64,
    /// Default per-lead cost cap; a goal may override it.
    pub per_lead_cost_ceiling: f64,
    /// Retry ceiling for transient provider failures.
    pub retry_attempts: u32,
    /// Re-process rows already marked Enriched.
    pub force_refresh: bool,
    /// Minimum merged fields before the scorer is worth invoking.
    pub min_fields_for_scoring: usize,
}

/// Which adapter a provider entry instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    SerpSearch,
    ProfileScrape,
    CompanyScrape,
    EmailVerify,
}

/// One vendor entry in the waterfall file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Identifier referenced by goal chains.
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    /// Name of the environment variable holding this vendor's API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Scrape-dataset selector, for vendors that need one.
    #[serde(default)]
    pub dataset_id: Option<String>,
    /// Vendor's published limit minus safety margin, tokens per second.
    pub rate_per_sec: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Declared cost estimate per call, in dollars.
    pub cost_per_call: f64,
}

fn default_burst() -> u32 {
    1
}

/// Ordered provider chain plus acceptance predicate for one goal.
#[derive(Debug, Clone, Deserialize)]
pub struct WaterfallSpec {
    /// Provider ids in attempt order, cheapest first. Ties in declared cost
    /// keep this order (stable).
    pub providers: Vec<String>,
    /// Minimum field set that marks a lead sufficiently enriched.
    pub required_fields: Vec<String>,
    /// Per-lead cost ceiling for this goal; falls back to the run default.
    #[serde(default)]
    pub cost_ceiling: Option<f64>,
}

impl WaterfallSpec {
    pub fn effective_ceiling(&self, default_ceiling: f64) -> f64 {
        self.cost_ceiling.unwrap_or(default_ceiling)
    }
}

/// Scoring provider settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    pub model: String,
    /// Prompt template with `{field}` placeholders.
    pub prompt: String,
    /// Fields substituted into the template; absent fields render empty.
    pub fields: Vec<String>,
    pub cost_per_call: f64,
    #[serde(default = "default_scoring_rate")]
    pub rate_per_sec: f64,
    #[serde(default = "default_scoring_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

fn default_scoring_rate() -> f64 {
    1.0
}

fn default_scoring_timeout() -> u64 {
    60
}

fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}

/// The waterfall configuration file: provider table, goal chains, scoring.
#[derive(Debug, Clone, Deserialize)]
pub struct WaterfallFile {
    pub providers: Vec<ProviderConfig>,
    /// Goal name -> chain spec. Recognized goals: profile, company, email.
    pub goals: HashMap<String, WaterfallSpec>,
    #[serde(default)]
    pub scoring: Option<ScoringConfig>,
}

impl WaterfallFile {
    /// Reject broken configuration eagerly rather than failing mid-run.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut ids = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                anyhow::bail!("provider entry with empty id");
            }
            if !ids.insert(provider.id.as_str()) {
                anyhow::bail!("duplicate provider id '{}'", provider.id);
            }
            if provider.rate_per_sec <= 0.0 {
                anyhow::bail!("provider '{}' rate_per_sec must be > 0", provider.id);
            }
            if provider.cost_per_call < 0.0 {
                anyhow::bail!("provider '{}' cost_per_call must be >= 0", provider.id);
            }
            if !provider.base_url.starts_with("http://")
                && !provider.base_url.starts_with("https://")
            {
                anyhow::bail!(
                    "provider '{}' base_url must start with http:// or https://",
                    provider.id
                );
            }
        }

        if self.goals.is_empty() {
            anyhow::bail!("no enrichment goals configured");
        }
        for (goal, spec) in &self.goals {
            if !GOALS.contains(&goal.as_str()) {
                anyhow::bail!("unknown enrichment goal '{}'", goal);
            }
            if spec.providers.is_empty() {
                anyhow::bail!("goal '{}' has an empty provider chain", goal);
            }
            if spec.required_fields.is_empty() {
                anyhow::bail!("goal '{}' has an empty required-field set", goal);
            }
            for id in &spec.providers {
                if !ids.contains(id.as_str()) {
                    anyhow::bail!("goal '{}' references unknown provider '{}'", goal, id);
                }
            }
            if let Some(ceiling) = spec.cost_ceiling {
                if ceiling <= 0.0 {
                    anyhow::bail!("goal '{}' cost_ceiling must be > 0", goal);
                }
            }
        }

        if let Some(scoring) = &self.scoring {
            if scoring.model.trim().is_empty() {
                anyhow::bail!("scoring model cannot be empty");
            }
            if scoring.prompt.trim().is_empty() {
                anyhow::bail!("scoring prompt cannot be empty");
            }
        }

        Ok(())
    }
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub run: RunConfig,
    pub waterfall: WaterfallFile,
    pub sheet_gateway_url: String,
    pub sheet_gateway_token: String,
    pub openai_api_key: Option<String>,
    /// Provider id -> resolved API key.
    pub api_keys: HashMap<String, String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let run = RunConfig {
            chunk_size: std::env::var("CHUNK_SIZE")
                .unwrap_or_else(|_| "25".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("CHUNK_SIZE must be a positive integer"))?,
            max_concurrency: std::env::var("MAX_CONCURRENCY")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("MAX_CONCURRENCY must be a positive integer"))?,
            run_cost_ceiling: std::env::var("RUN_COST_CEILING")
                .unwrap_or_else(|_| "5.0".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("RUN_COST_CEILING must be a number"))?,
            per_lead_cost_ceiling: std::env::var("PER_LEAD_COST_CEILING")
                .unwrap_or_else(|_| "0.05".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PER_LEAD_COST_CEILING must be a number"))?,
            retry_attempts: std::env::var("RETRY_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("RETRY_ATTEMPTS must be an integer"))?,
            force_refresh: std::env::var("FORCE_REFRESH")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            min_fields_for_scoring: std::env::var("MIN_FIELDS_FOR_SCORING")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("MIN_FIELDS_FOR_SCORING must be an integer"))?,
        };
        if run.chunk_size == 0 {
            anyhow::bail!("CHUNK_SIZE cannot be 0");
        }
        if run.max_concurrency == 0 {
            anyhow::bail!("MAX_CONCURRENCY cannot be 0");
        }
        if run.run_cost_ceiling <= 0.0 {
            anyhow::bail!("RUN_COST_CEILING must be > 0");
        }
        if run.per_lead_cost_ceiling <= 0.0 {
            anyhow::bail!("PER_LEAD_COST_CEILING must be > 0");
        }

        let waterfall_path =
            std::env::var("WATERFALL_CONFIG").unwrap_or_else(|_| "waterfall.json".to_string());
        let raw = std::fs::read_to_string(&waterfall_path).map_err(|e| {
            anyhow::anyhow!("cannot read waterfall config '{}': {}", waterfall_path, e)
        })?;
        let waterfall: WaterfallFile = serde_json::from_str(&raw).map_err(|e| {
            anyhow::anyhow!("cannot parse waterfall config '{}': {}", waterfall_path, e)
        })?;
        waterfall.validate()?;

        let sheet_gateway_url = std::env::var("SHEET_GATEWAY_URL")
            .map_err(|_| anyhow::anyhow!("SHEET_GATEWAY_URL environment variable required"))
            .and_then(|url| {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    anyhow::bail!("SHEET_GATEWAY_URL must start with http:// or https://");
                }
                Ok(url)
            })?;
        let sheet_gateway_token = std::env::var("SHEET_GATEWAY_TOKEN")
            .map_err(|_| anyhow::anyhow!("SHEET_GATEWAY_TOKEN environment variable required"))
            .and_then(|token| {
                if token.trim().is_empty() {
                    anyhow::bail!("SHEET_GATEWAY_TOKEN cannot be empty");
                }
                Ok(token)
            })?;

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty());
        if waterfall.scoring.is_some() && openai_api_key.is_none() {
            anyhow::bail!("scoring is configured but OPENAI_API_KEY is not set");
        }

        // Resolve per-vendor API keys up front so a missing key fails the
        // run before any lead is touched.
        let mut api_keys = HashMap::new();
        for provider in &waterfall.providers {
            if let Some(env_name) = &provider.api_key_env {
                let key = std::env::var(env_name).map_err(|_| {
                    anyhow::anyhow!(
                        "provider '{}' requires environment variable {}",
                        provider.id,
                        env_name
                    )
                })?;
                if key.trim().is_empty() {
                    anyhow::bail!("{} cannot be empty", env_name);
                }
                api_keys.insert(provider.id.clone(), key);
            }
        }

        let config = Self {
            run,
            waterfall,
            sheet_gateway_url,
            sheet_gateway_token,
            openai_api_key,
            api_keys,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Sheet gateway URL: {}", config.sheet_gateway_url);
        tracing::debug!(
            "Providers: {}",
            config
                .waterfall
                .providers
                .iter()
                .map(|p| p.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        tracing::debug!(
            "Goals: {}",
            config
                .waterfall
                .goals
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
        tracing::debug!(
            "Run limits: chunk_size={} max_concurrency={} run_ceiling=${:.2}",
            config.run.chunk_size,
            config.run.max_concurrency,
            config.run.run_cost_ceiling
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            kind: ProviderKind::SerpSearch,
            base_url: "https://vendor.example.com".to_string(),
            api_key_env: None,
            dataset_id: None,
            rate_per_sec: 5.0,
            burst: 5,
            cost_per_call: 0.001,
        }
    }

    fn file_with_goal(goal: &str, chain: Vec<&str>) -> WaterfallFile {
        let mut goals = HashMap::new();
        goals.insert(
            goal.to_string(),
            WaterfallSpec {
                providers: chain.into_iter().map(String::from).collect(),
                required_fields: vec!["name".to_string()],
                cost_ceiling: None,
            },
        );
        WaterfallFile {
            providers: vec![provider("serp")],
            goals,
            scoring: None,
        }
    }

    #[test]
    fn valid_file_passes() {
        let file = file_with_goal("profile", vec!["serp"]);
        assert!(file.validate().is_ok());
    }

    #[test]
    fn unknown_chain_provider_rejected() {
        let file = file_with_goal("profile", vec!["nope"]);
        assert!(file.validate().is_err());
    }

    #[test]
    fn empty_chain_rejected() {
        let file = file_with_goal("profile", vec![]);
        assert!(file.validate().is_err());
    }

    #[test]
    fn unknown_goal_rejected() {
        let file = file_with_goal("sideways", vec!["serp"]);
        assert!(file.validate().is_err());
    }

    #[test]
    fn duplicate_provider_id_rejected() {
        let mut file = file_with_goal("profile", vec!["serp"]);
        file.providers.push(provider("serp"));
        assert!(file.validate().is_err());
    }
}
