//! Shared fixtures for integration tests: a scripted fake provider and
//! builders for the resolver wiring.
#![allow(dead_code)]

use async_trait::async_trait;
use lead_waterfall::circuit_breaker::{create_provider_breaker, ProviderBreaker};
use lead_waterfall::config::WaterfallSpec;
use lead_waterfall::models::{FieldMap, LeadRecord, ProviderResult, ProviderStatus};
use lead_waterfall::providers::{ProviderAdapter, ProviderRegistry};
use lead_waterfall::rate_limit::{RateLimiter, RetryPolicy};
use lead_waterfall::waterfall::{ResponseCache, RunBudget, WaterfallResolver};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Provider double that replays a scripted sequence of results and counts
/// calls. Once the script runs out it keeps answering NotFound.
pub struct FakeProvider {
    id: String,
    cost: f64,
    script: Mutex<VecDeque<ProviderResult>>,
    calls: AtomicUsize,
    has_target: bool,
}

impl FakeProvider {
    pub fn new(id: &str, cost: f64, script: Vec<ProviderResult>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            cost,
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            has_target: true,
        })
    }

    /// A provider that cannot serve any lead (no target).
    pub fn without_target(id: &str, cost: f64) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            cost,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            has_target: false,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for FakeProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn cost_per_call(&self) -> f64 {
        self.cost
    }

    fn target(&self, lead: &LeadRecord) -> Option<String> {
        if self.has_target {
            Some(lead.linkedin_person_url.clone())
        } else {
            None
        }
    }

    async fn call(&self, _lead: &LeadRecord) -> ProviderResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        script
            .pop_front()
            .unwrap_or_else(|| ProviderResult::of(ProviderStatus::NotFound, self.cost))
    }
}

/// Convenience constructors for scripted results.
pub fn success(pairs: &[(&str, &str)], cost: f64) -> ProviderResult {
    let mut fields = FieldMap::new();
    for (k, v) in pairs {
        fields.insert(k.to_string(), v.to_string());
    }
    ProviderResult::success(fields, cost)
}

pub fn not_found(cost: f64) -> ProviderResult {
    ProviderResult::of(ProviderStatus::NotFound, cost)
}

pub fn rate_limited(cost: f64) -> ProviderResult {
    ProviderResult::of(ProviderStatus::RateLimited, cost)
}

pub fn transient(cost: f64) -> ProviderResult {
    ProviderResult::of(ProviderStatus::TransientError("503".to_string()), cost)
}

pub fn fatal(cost: f64) -> ProviderResult {
    ProviderResult::of(ProviderStatus::FatalError("401".to_string()), cost)
}

/// Everything a resolver needs, with fast test-friendly settings.
pub struct Harness {
    pub registry: ProviderRegistry,
    pub limiter: Arc<RateLimiter>,
    pub breakers: Arc<HashMap<String, ProviderBreaker>>,
    pub retry: RetryPolicy,
    pub budget: Arc<RunBudget>,
    pub cache: ResponseCache,
}

impl Harness {
    pub fn new(providers: Vec<Arc<FakeProvider>>, run_ceiling: f64) -> Self {
        let mut registry = ProviderRegistry::new();
        let mut limiter = RateLimiter::with_cooldown(Duration::from_millis(10));
        let mut breakers = HashMap::new();
        for provider in providers {
            limiter.add_bucket(provider.id().to_string(), 10_000.0, 100);
            breakers.insert(provider.id().to_string(), create_provider_breaker());
            registry.register(provider);
        }
        Self {
            registry,
            limiter: Arc::new(limiter),
            breakers: Arc::new(breakers),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            },
            budget: Arc::new(RunBudget::new(run_ceiling)),
            cache: ResponseCache::new(1_000),
        }
    }

    pub fn resolver(
        &self,
        goal: &str,
        chain: Vec<&str>,
        required_fields: Vec<&str>,
        lead_ceiling: f64,
    ) -> WaterfallResolver {
        let spec = WaterfallSpec {
            providers: chain.into_iter().map(String::from).collect(),
            required_fields: required_fields.into_iter().map(String::from).collect(),
            cost_ceiling: None,
        };
        WaterfallResolver::new(
            goal,
            &spec,
            &self.registry,
            lead_ceiling,
            Arc::clone(&self.limiter),
            Arc::clone(&self.breakers),
            self.retry,
            Arc::clone(&self.budget),
            self.cache.clone(),
        )
        .expect("resolver builds")
    }
}

pub fn lead(key: &str) -> LeadRecord {
    LeadRecord::new(key, format!("https://www.linkedin.com/in/{}", key))
}
