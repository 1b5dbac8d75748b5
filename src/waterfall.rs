//! Waterfall Resolver: walks an ordered provider chain for one lead,
//! judging each response, merging accepted fields monotonically, and
//! stopping on sufficiency, exhaustion, or a budget ceiling.

use crate::circuit_breaker::{record_outcome, ProviderBreaker};
use crate::config::WaterfallSpec;
use crate::errors::{EnrichError, ResultExt};
use crate::models::{
    merge_missing, EnrichmentOutcome, LeadRecord, OutcomeStatus, ProviderResult, ProviderStatus,
    StopReason,
};
use crate::providers::{ProviderAdapter, ProviderRegistry};
use crate::rate_limit::{RateLimiter, RetryPolicy};
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Run-level cost accounting shared by every worker.
///
/// Reservation happens before a call is issued; once a reservation is
/// refused the exhausted flag stays set and no new provider calls start.
/// In-flight calls finish and persist their partial result.
pub struct RunBudget {
    ceiling: f64,
    spent: Mutex<f64>,
    exhausted: AtomicBool,
}

impl RunBudget {
    pub fn new(ceiling: f64) -> Self {
        Self {
            ceiling,
            spent: Mutex::new(0.0),
            exhausted: AtomicBool::new(false),
        }
    }

    /// Reserve `amount` against the run ceiling. Refusal flips the
    /// exhausted flag for the rest of the run.
    pub fn try_reserve(&self, amount: f64) -> bool {
        let mut spent = self.spent.lock().unwrap_or_else(|e| e.into_inner());
        if *spent + amount > self.ceiling + f64::EPSILON {
            self.exhausted.store(true, Ordering::SeqCst);
            false
        } else {
            *spent += amount;
            true
        }
    }

    pub fn spent(&self) -> f64 {
        *self.spent.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }
}

/// Per-run cache of successful provider responses keyed by
/// `provider:target`, so duplicate URLs across rows cost one scrape.
pub type ResponseCache = Cache<String, ProviderResult>;

fn cache_key(provider_id: &str, target: &str) -> String {
    format!("{}:{}", provider_id, target)
}

/// State machine driving one enrichment goal for one lead.
pub struct WaterfallResolver {
    goal: String,
    chain: Vec<Arc<dyn ProviderAdapter>>,
    required_fields: Vec<String>,
    cost_ceiling: f64,
    limiter: Arc<RateLimiter>,
    breakers: Arc<HashMap<String, ProviderBreaker>>,
    retry: RetryPolicy,
    budget: Arc<RunBudget>,
    cache: ResponseCache,
}

impl WaterfallResolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        goal: impl Into<String>,
        spec: &WaterfallSpec,
        registry: &ProviderRegistry,
        default_ceiling: f64,
        limiter: Arc<RateLimiter>,
        breakers: Arc<HashMap<String, ProviderBreaker>>,
        retry: RetryPolicy,
        budget: Arc<RunBudget>,
        cache: ResponseCache,
    ) -> Result<Self, EnrichError> {
        let goal = goal.into();
        let chain = registry
            .resolve_chain(&spec.providers)
            .with_context(|| format!("building chain for goal '{}'", goal))?;
        Ok(Self {
            goal,
            chain,
            required_fields: spec.required_fields.clone(),
            cost_ceiling: spec.effective_ceiling(default_ceiling),
            limiter,
            breakers,
            retry,
            budget,
            cache,
        })
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    /// Acceptance predicate: every required field present among the
    /// accepted fields. Fields merged by earlier goals count.
    fn satisfied(&self, lead: &LeadRecord) -> bool {
        self.required_fields
            .iter()
            .all(|field| lead.fields.contains_key(field))
    }

    /// Walk the chain for one lead. Provider attempts are strictly
    /// sequential: each provider must see which fields are already merged.
    pub async fn resolve(&self, lead: &mut LeadRecord) -> EnrichmentOutcome {
        let mut attempted: Vec<String> = Vec::new();
        let mut succeeded: Vec<String> = Vec::new();
        let mut cost = 0.0_f64;
        let mut added_total = 0usize;
        let mut reason = StopReason::ChainExhausted;

        if self.satisfied(lead) {
            // Nothing to do; fields accepted earlier already meet the goal.
            reason = StopReason::Accepted;
        } else {
            'chain: for provider in &self.chain {
                let id = provider.id().to_string();
                if attempted.iter().any(|a| a == &id) {
                    // A chain may list an id twice by mistake; at most one
                    // attempt per provider per run.
                    continue;
                }

                let target = provider.target(lead);

                // Cache probe: a duplicate URL across rows costs nothing.
                if let Some(t) = &target {
                    if let Some(hit) = self.cache.get(&cache_key(&id, t)).await {
                        tracing::debug!(
                            "Cache hit for '{}' on {} (goal {})",
                            id,
                            t,
                            self.goal
                        );
                        attempted.push(id.clone());
                        let added = merge_missing(&mut lead.fields, hit.fields);
                        if added > 0 {
                            added_total += added;
                            succeeded.push(id.clone());
                        }
                        if self.satisfied(lead) {
                            reason = StopReason::Accepted;
                            break 'chain;
                        }
                        continue;
                    }
                }

                let declared = provider.cost_per_call();
                if cost + declared > self.cost_ceiling + f64::EPSILON {
                    tracing::info!(
                        "Lead {} goal {}: ceiling ${:.4} would be exceeded by '{}', stopping",
                        lead.key,
                        self.goal,
                        self.cost_ceiling,
                        id
                    );
                    reason = StopReason::LeadBudget;
                    break 'chain;
                }

                let target = match target {
                    Some(t) => t,
                    None => {
                        // Provider cannot serve this lead (missing input).
                        tracing::debug!(
                            "Provider '{}' has no target for lead {}, skipping",
                            id,
                            lead.key
                        );
                        attempted.push(id);
                        continue;
                    }
                };

                if let Some(breaker) = self.breakers.get(&id) {
                    if !breaker.is_call_permitted() {
                        tracing::warn!(
                            "Provider '{}' circuit open, skipping for lead {}",
                            id,
                            lead.key
                        );
                        attempted.push(id);
                        continue;
                    }
                }

                attempted.push(id.clone());
                let mut transient_attempts = 0u32;

                loop {
                    // Budget gates are re-checked before every issued call,
                    // retries included, so cumulative cost never passes a
                    // ceiling.
                    if cost + declared > self.cost_ceiling + f64::EPSILON {
                        reason = StopReason::LeadBudget;
                        break 'chain;
                    }
                    if !self.budget.try_reserve(declared) {
                        tracing::warn!(
                            "Run budget exhausted before calling '{}' for lead {}",
                            id,
                            lead.key
                        );
                        reason = StopReason::RunBudget;
                        break 'chain;
                    }

                    self.limiter.acquire(&id).await;
                    let result = provider.call(lead).await;
                    cost += declared;

                    match result.status {
                        ProviderStatus::Success => {
                            if let Some(breaker) = self.breakers.get(&id) {
                                record_outcome(breaker, true);
                            }
                            self.cache
                                .insert(cache_key(&id, &target), result.clone())
                                .await;
                            let added = merge_missing(&mut lead.fields, result.fields);
                            added_total += added;
                            succeeded.push(id.clone());
                            tracing::info!(
                                "Provider '{}' merged {} field(s) for lead {} (goal {})",
                                id,
                                added,
                                lead.key,
                                self.goal
                            );
                            if self.satisfied(lead) {
                                reason = StopReason::Accepted;
                                break 'chain;
                            }
                            break;
                        }
                        ProviderStatus::RateLimited => {
                            // Never counted against retry exhaustion; the
                            // cooldown window throttles the next token.
                            self.limiter.penalize(&id).await;
                            continue;
                        }
                        ProviderStatus::TransientError(msg) => {
                            if let Some(breaker) = self.breakers.get(&id) {
                                record_outcome(breaker, false);
                            }
                            transient_attempts += 1;
                            if transient_attempts >= self.retry.max_attempts {
                                tracing::warn!(
                                    "Provider '{}' exhausted {} retries for lead {}: {}",
                                    id,
                                    self.retry.max_attempts,
                                    lead.key,
                                    msg
                                );
                                break;
                            }
                            let delay = self.retry.delay_for(transient_attempts - 1);
                            tracing::debug!(
                                "Provider '{}' transient failure ({}), retrying in {:?}",
                                id,
                                msg,
                                delay
                            );
                            tokio::time::sleep(delay).await;
                        }
                        ProviderStatus::NotFound => {
                            // The vendor answered; it just has no data.
                            if let Some(breaker) = self.breakers.get(&id) {
                                record_outcome(breaker, true);
                            }
                            tracing::debug!(
                                "Provider '{}' has no data for lead {}",
                                id,
                                lead.key
                            );
                            break;
                        }
                        ProviderStatus::FatalError(msg) => {
                            if let Some(breaker) = self.breakers.get(&id) {
                                record_outcome(breaker, false);
                            }
                            tracing::warn!(
                                "Provider '{}' cannot serve lead {}: {}",
                                id,
                                lead.key,
                                msg
                            );
                            break;
                        }
                    }
                }
            }
        }

        if reason == StopReason::ChainExhausted && self.satisfied(lead) {
            reason = StopReason::Accepted;
        }

        let status = if reason == StopReason::Accepted {
            OutcomeStatus::Sufficient
        } else if added_total > 0 {
            OutcomeStatus::Partial
        } else {
            OutcomeStatus::Exhausted
        };

        EnrichmentOutcome {
            status,
            reason,
            fields: lead.fields.clone(),
            attempted,
            succeeded,
            cost,
        }
    }
}
