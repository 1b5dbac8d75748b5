//! Batch coordinator: pulls lead rows in chunks, fans them out to a bounded
//! worker pool, runs the goal waterfalls plus scoring per lead, and writes
//! each row back as soon as it finishes.

use crate::errors::EnrichError;
use crate::models::{
    discovered_email, extract_company_url, EnrichmentStatus, LeadRecord, ProviderStatus,
    StopReason,
};
use crate::rate_limit::{RateLimiter, RetryPolicy};
use crate::scorer::LeadScorer;
use crate::store::LeadStore;
use crate::waterfall::{RunBudget, WaterfallResolver};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Aggregate counters for one run, logged at the end.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub processed: usize,
    pub enriched: usize,
    pub partially_enriched: usize,
    pub failed: usize,
    /// Rows already Enriched and skipped without any provider call.
    pub skipped: usize,
    pub scored: usize,
    /// Rows the run budget refused before any call was made; not persisted,
    /// still Pending for the next run.
    pub left_pending: usize,
    pub store_write_failures: usize,
    pub total_cost: f64,
    pub budget_stopped: bool,
}

/// Per-lead result handed back from a worker task.
struct LeadReport {
    status: Option<EnrichmentStatus>,
    skipped: bool,
    scored: bool,
    left_pending: bool,
    write_failed: bool,
}

/// Run-scoped coordinator wiring the store, resolvers, and scorer together.
pub struct BatchCoordinator {
    store: Arc<dyn LeadStore>,
    /// Goal name -> resolver; only configured goals are present.
    resolvers: HashMap<String, Arc<WaterfallResolver>>,
    scorer: Option<Arc<LeadScorer>>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    budget: Arc<RunBudget>,
    max_concurrency: usize,
    chunk_size: usize,
    force_refresh: bool,
    min_fields_for_scoring: usize,
}

impl BatchCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn LeadStore>,
        resolvers: HashMap<String, Arc<WaterfallResolver>>,
        scorer: Option<Arc<LeadScorer>>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        budget: Arc<RunBudget>,
        max_concurrency: usize,
        chunk_size: usize,
        force_refresh: bool,
        min_fields_for_scoring: usize,
    ) -> Self {
        Self {
            store,
            resolvers,
            scorer,
            limiter,
            retry,
            budget,
            max_concurrency,
            chunk_size,
            force_refresh,
            min_fields_for_scoring,
        }
    }

    /// Drive one full run: fetch chunks until the store runs dry or the run
    /// budget is exhausted, processing rows concurrently up to the pool size.
    pub async fn run(self: Arc<Self>) -> Result<RunSummary, EnrichError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = std::time::Instant::now();
        tracing::info!(
            "Starting enrichment run {} (chunk_size={}, max_concurrency={})",
            run_id,
            self.chunk_size,
            self.max_concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut seen: HashSet<String> = HashSet::new();
        let mut summary = RunSummary {
            run_id,
            started_at,
            duration: Duration::ZERO,
            processed: 0,
            enriched: 0,
            partially_enriched: 0,
            failed: 0,
            skipped: 0,
            scored: 0,
            left_pending: 0,
            store_write_failures: 0,
            total_cost: 0.0,
            budget_stopped: false,
        };

        'runs: loop {
            // The store returns rows from the top regardless of what this
            // run already touched, so the requested window must grow past
            // the handled prefix or later rows are never fetched.
            let batch = self
                .store
                .fetch_pending(seen.len() + self.chunk_size)
                .await?;
            let batch: Vec<LeadRecord> = batch
                .into_iter()
                .filter(|lead| !seen.contains(&lead.key))
                .take(self.chunk_size)
                .collect();
            if batch.is_empty() {
                break;
            }

            let mut workers: JoinSet<LeadReport> = JoinSet::new();
            for lead in batch {
                if self.budget.is_exhausted() {
                    tracing::warn!("Run budget exhausted, no new leads will be started");
                    summary.budget_stopped = true;
                    break;
                }
                seen.insert(lead.key.clone());

                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| EnrichError::Io(format!("worker pool closed: {}", e)))?;
                let coordinator = Arc::clone(&self);
                workers.spawn(async move {
                    let report = coordinator.process_lead(lead).await;
                    drop(permit);
                    report
                });
            }

            while let Some(joined) = workers.join_next().await {
                let report = match joined {
                    Ok(report) => report,
                    Err(e) => {
                        tracing::error!("Lead worker panicked: {}", e);
                        continue;
                    }
                };
                if report.skipped {
                    summary.skipped += 1;
                    continue;
                }
                if report.left_pending {
                    summary.left_pending += 1;
                    continue;
                }
                summary.processed += 1;
                match report.status {
                    Some(EnrichmentStatus::Enriched) => summary.enriched += 1,
                    Some(EnrichmentStatus::PartiallyEnriched) => summary.partially_enriched += 1,
                    Some(EnrichmentStatus::Failed) => summary.failed += 1,
                    _ => {}
                }
                if report.scored {
                    summary.scored += 1;
                }
                if report.write_failed {
                    summary.store_write_failures += 1;
                }
            }

            if self.budget.is_exhausted() {
                summary.budget_stopped = true;
                break 'runs;
            }
        }

        summary.total_cost = self.budget.spent();
        summary.duration = start.elapsed();
        tracing::info!(
            "Run {} finished in {:.1}s: {} processed ({} enriched, {} partial, {} failed), \
             {} skipped, {} scored, {} left pending, {} write failures, ${:.4} spent{}",
            run_id,
            summary.duration.as_secs_f64(),
            summary.processed,
            summary.enriched,
            summary.partially_enriched,
            summary.failed,
            summary.skipped,
            summary.scored,
            summary.left_pending,
            summary.store_write_failures,
            summary.total_cost,
            if summary.budget_stopped {
                " (stopped on budget)"
            } else {
                ""
            }
        );

        Ok(summary)
    }

    /// Enrich, score, and persist one lead.
    async fn process_lead(&self, mut lead: LeadRecord) -> LeadReport {
        if lead.status == EnrichmentStatus::Enriched && !self.force_refresh {
            tracing::debug!("Lead {} already enriched, skipping", lead.key);
            return LeadReport {
                status: None,
                skipped: true,
                scored: false,
                left_pending: false,
                write_failed: false,
            };
        }
        if self.force_refresh {
            lead.status = EnrichmentStatus::Pending;
        }
        lead.transition(EnrichmentStatus::InProgress);
        lead.last_error = None;

        let mut total_cost = 0.0_f64;
        let mut merged_by_side_goals = false;

        // The profile waterfall anchors the lead status; company and email
        // refine the field map afterwards.
        let profile_outcome = match self.resolvers.get("profile") {
            Some(resolver) => Some(resolver.resolve(&mut lead).await),
            None => None,
        };
        if let Some(outcome) = &profile_outcome {
            total_cost += outcome.cost;

            // A lead the run budget refused before any spend stays untouched
            // in the store so the next run picks it up cleanly.
            if outcome.reason == StopReason::RunBudget
                && outcome.cost == 0.0
                && outcome.succeeded.is_empty()
            {
                tracing::info!("Lead {} left pending: run budget refused first call", lead.key);
                return LeadReport {
                    status: None,
                    skipped: false,
                    scored: false,
                    left_pending: true,
                    write_failed: false,
                };
            }
        }

        // Company enrichment: the URL may come from the sheet row or from a
        // current_company field the profile scrape just merged.
        if let Some(resolver) = self.resolvers.get("company") {
            if lead.linkedin_company_url.is_none() {
                if let Some(company) = lead.fields.get("current_company") {
                    lead.linkedin_company_url = extract_company_url(company);
                }
            }
            if lead.linkedin_company_url.is_some() {
                let outcome = resolver.resolve(&mut lead).await;
                total_cost += outcome.cost;
                if !outcome.succeeded.is_empty() {
                    merged_by_side_goals = true;
                }
            }
        }

        // Email verification runs only when a plausible address surfaced.
        if let Some(resolver) = self.resolvers.get("email") {
            if discovered_email(&lead.fields).is_some() {
                let outcome = resolver.resolve(&mut lead).await;
                total_cost += outcome.cost;
                if !outcome.succeeded.is_empty() {
                    merged_by_side_goals = true;
                }
            }
        }

        let status = match &profile_outcome {
            Some(outcome) => {
                let base = outcome.lead_status();
                if base == EnrichmentStatus::Failed && merged_by_side_goals {
                    // Side goals salvaged fields the profile chain could not.
                    EnrichmentStatus::PartiallyEnriched
                } else {
                    base
                }
            }
            None if merged_by_side_goals => EnrichmentStatus::PartiallyEnriched,
            None => EnrichmentStatus::Failed,
        };
        lead.transition(status);
        if let Some(outcome) = &profile_outcome {
            if status == EnrichmentStatus::Failed {
                lead.last_error = Some(format!(
                    "no provider produced data (attempted: {})",
                    outcome.attempted.join(", ")
                ));
            }
        }

        let scored = self.score_lead(&mut lead).await;

        tracing::info!(
            "Lead {} finished: {:?}, {} fields, ${:.4}",
            lead.key,
            lead.status,
            lead.fields.len(),
            total_cost
        );

        let mut write_failed = false;
        if let Err(e) = self.store.write_result(&lead).await {
            tracing::error!("Failed to persist lead {}: {}", lead.key, e);
            write_failed = true;
        }

        LeadReport {
            status: Some(lead.status),
            skipped: false,
            scored,
            left_pending: false,
            write_failed,
        }
    }

    /// Score the lead if it qualifies. Scoring failures degrade the lead to
    /// enriched-unscored; they never change the enrichment status.
    async fn score_lead(&self, lead: &mut LeadRecord) -> bool {
        let scorer = match &self.scorer {
            Some(scorer) => scorer,
            None => return false,
        };
        let qualifies = matches!(
            lead.status,
            EnrichmentStatus::Enriched | EnrichmentStatus::PartiallyEnriched
        ) && lead.fields.len() >= self.min_fields_for_scoring;
        if !qualifies {
            return false;
        }

        let mut transient_attempts = 0u32;
        loop {
            if !self.budget.try_reserve(scorer.cost_per_call()) {
                tracing::warn!("Run budget exhausted before scoring lead {}", lead.key);
                return false;
            }
            self.limiter.acquire("scorer").await;

            match scorer.score(&lead.fields).await {
                Ok(score) => {
                    lead.score = Some(score);
                    return true;
                }
                Err(ProviderStatus::RateLimited) => {
                    self.limiter.penalize("scorer").await;
                }
                Err(ProviderStatus::TransientError(msg)) => {
                    transient_attempts += 1;
                    if transient_attempts >= self.retry.max_attempts {
                        tracing::warn!(
                            "Scoring lead {} exhausted {} retries: {}",
                            lead.key,
                            self.retry.max_attempts,
                            msg
                        );
                        lead.last_error = Some(format!("scoring failed: {}", msg));
                        return false;
                    }
                    tokio::time::sleep(self.retry.delay_for(transient_attempts - 1)).await;
                }
                Err(status) => {
                    tracing::warn!("Scoring lead {} failed: {:?}", lead.key, status);
                    lead.last_error = Some(format!("scoring failed: {:?}", status));
                    return false;
                }
            }
        }
    }
}
