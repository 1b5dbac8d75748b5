use lead_waterfall::batch::BatchCoordinator;
use lead_waterfall::circuit_breaker::{create_provider_breaker, ProviderBreaker};
use lead_waterfall::config::Config;
use lead_waterfall::providers::ProviderRegistry;
use lead_waterfall::rate_limit::{RateLimiter, RetryPolicy};
use lead_waterfall::scorer::LeadScorer;
use lead_waterfall::sheet_client::SheetStoreClient;
use lead_waterfall::store::LeadStore;
use lead_waterfall::waterfall::{ResponseCache, RunBudget, WaterfallResolver};
use std::collections::HashMap;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lead_waterfall=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let registry = ProviderRegistry::from_config(&config.waterfall, &config.api_keys)?;

    let mut limiter = RateLimiter::new();
    for provider in &config.waterfall.providers {
        limiter.add_bucket(provider.id.clone(), provider.rate_per_sec, provider.burst);
    }
    if let Some(scoring) = &config.waterfall.scoring {
        limiter.add_bucket("scorer", scoring.rate_per_sec, 1);
    }
    let limiter = Arc::new(limiter);

    let mut breakers: HashMap<String, ProviderBreaker> = HashMap::new();
    for provider in &config.waterfall.providers {
        breakers.insert(provider.id.clone(), create_provider_breaker());
    }
    let breakers = Arc::new(breakers);

    let budget = Arc::new(RunBudget::new(config.run.run_cost_ceiling));
    let cache: ResponseCache = ResponseCache::new(100_000);
    let retry = RetryPolicy::new(config.run.retry_attempts);

    let mut resolvers = HashMap::new();
    for (goal, spec) in &config.waterfall.goals {
        let resolver = WaterfallResolver::new(
            goal.clone(),
            spec,
            &registry,
            config.run.per_lead_cost_ceiling,
            Arc::clone(&limiter),
            Arc::clone(&breakers),
            retry,
            Arc::clone(&budget),
            cache.clone(),
        )?;
        resolvers.insert(goal.clone(), Arc::new(resolver));
    }

    let store: Arc<dyn LeadStore> = Arc::new(SheetStoreClient::new(
        config.sheet_gateway_url.clone(),
        config.sheet_gateway_token.clone(),
    )?);

    let scorer = match (&config.waterfall.scoring, &config.openai_api_key) {
        (Some(scoring), Some(key)) => Some(Arc::new(LeadScorer::new(scoring, key.clone())?)),
        _ => None,
    };

    let coordinator = Arc::new(BatchCoordinator::new(
        store,
        resolvers,
        scorer,
        limiter,
        retry,
        budget,
        config.run.max_concurrency,
        config.run.chunk_size,
        config.run.force_refresh,
        config.run.min_fields_for_scoring,
    ));

    let summary = coordinator.run().await?;
    tracing::info!(
        "Done: run {} spent ${:.4} across {} leads",
        summary.run_id,
        summary.total_cost,
        summary.processed
    );

    Ok(())
}
