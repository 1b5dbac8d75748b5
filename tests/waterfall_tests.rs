//! Waterfall resolver behavior: chain order, classification handling,
//! monotonic merge, and budget ceilings.

mod common;

use common::*;
use lead_waterfall::models::{OutcomeStatus, StopReason};

#[tokio::test]
async fn cheap_then_expensive_until_sufficient() {
    let serp = FakeProvider::new("serp", 0.001, vec![success(&[("name", "Ada")], 0.001)]);
    let scrape = FakeProvider::new(
        "scrape",
        0.01,
        vec![success(&[("name", "ignored"), ("position", "CTO")], 0.01)],
    );
    let harness = Harness::new(vec![serp.clone(), scrape.clone()], 10.0);
    let resolver = harness.resolver("profile", vec!["serp", "scrape"], vec!["name", "position"], 1.0);

    let mut record = lead("ada");
    let outcome = resolver.resolve(&mut record).await;

    assert_eq!(outcome.status, OutcomeStatus::Sufficient);
    assert_eq!(outcome.reason, StopReason::Accepted);
    assert_eq!(serp.calls(), 1);
    assert_eq!(scrape.calls(), 1);
    assert_eq!(outcome.attempted, vec!["serp", "scrape"]);
    assert_eq!(outcome.succeeded, vec!["serp", "scrape"]);
    assert!((outcome.cost - 0.011).abs() < 1e-9);
}

#[tokio::test]
async fn stops_at_first_sufficient_provider() {
    let serp = FakeProvider::new(
        "serp",
        0.001,
        vec![success(&[("name", "Ada"), ("position", "CTO")], 0.001)],
    );
    let scrape = FakeProvider::new("scrape", 0.01, vec![]);
    let harness = Harness::new(vec![serp.clone(), scrape.clone()], 10.0);
    let resolver = harness.resolver("profile", vec!["serp", "scrape"], vec!["name", "position"], 1.0);

    let mut record = lead("ada");
    let outcome = resolver.resolve(&mut record).await;

    assert_eq!(outcome.status, OutcomeStatus::Sufficient);
    assert_eq!(scrape.calls(), 0, "later providers must not be called");
}

#[tokio::test]
async fn all_not_found_is_exhausted() {
    let a = FakeProvider::new("a", 0.001, vec![not_found(0.001)]);
    let b = FakeProvider::new("b", 0.002, vec![not_found(0.002)]);
    let harness = Harness::new(vec![a.clone(), b.clone()], 10.0);
    let resolver = harness.resolver("profile", vec!["a", "b"], vec!["name"], 1.0);

    let mut record = lead("ghost");
    let outcome = resolver.resolve(&mut record).await;

    assert_eq!(outcome.status, OutcomeStatus::Exhausted);
    assert_eq!(outcome.reason, StopReason::ChainExhausted);
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 1);
    assert!(outcome.succeeded.is_empty());
}

#[tokio::test]
async fn provider_dearer_than_ceiling_is_never_called() {
    let pricey = FakeProvider::new("pricey", 5.0, vec![success(&[("name", "Ada")], 5.0)]);
    let harness = Harness::new(vec![pricey.clone()], 10.0);
    let resolver = harness.resolver("profile", vec!["pricey"], vec!["name"], 0.05);

    let mut record = lead("ada");
    let outcome = resolver.resolve(&mut record).await;

    assert_eq!(pricey.calls(), 0);
    assert_eq!(outcome.status, OutcomeStatus::Exhausted);
    assert_eq!(outcome.reason, StopReason::LeadBudget);
    assert_eq!(outcome.cost, 0.0);
}

#[tokio::test]
async fn accepted_fields_are_never_overwritten() {
    let first = FakeProvider::new("first", 0.001, vec![success(&[("name", "Ada Lovelace")], 0.001)]);
    let second = FakeProvider::new(
        "second",
        0.002,
        vec![success(&[("name", "WRONG"), ("position", "CTO")], 0.002)],
    );
    let harness = Harness::new(vec![first, second], 10.0);
    let resolver = harness.resolver("profile", vec!["first", "second"], vec!["name", "position"], 1.0);

    let mut record = lead("ada");
    resolver.resolve(&mut record).await;

    assert_eq!(record.fields.get("name").map(String::as_str), Some("Ada Lovelace"));
    assert_eq!(record.fields.get("position").map(String::as_str), Some("CTO"));
}

#[tokio::test]
async fn transient_failures_retry_then_succeed() {
    let flaky = FakeProvider::new(
        "flaky",
        0.001,
        vec![
            transient(0.001),
            transient(0.001),
            success(&[("name", "Ada")], 0.001),
        ],
    );
    let harness = Harness::new(vec![flaky.clone()], 10.0);
    let resolver = harness.resolver("profile", vec!["flaky"], vec!["name"], 1.0);

    let mut record = lead("ada");
    let outcome = resolver.resolve(&mut record).await;

    assert_eq!(outcome.status, OutcomeStatus::Sufficient);
    assert_eq!(flaky.calls(), 3);
    // Every issued attempt is charged, retries included.
    assert!((outcome.cost - 0.003).abs() < 1e-9);
}

#[tokio::test]
async fn transient_exhaustion_falls_through_to_next_provider() {
    let broken = FakeProvider::new(
        "broken",
        0.001,
        vec![transient(0.001), transient(0.001), transient(0.001)],
    );
    let backup = FakeProvider::new("backup", 0.002, vec![success(&[("name", "Ada")], 0.002)]);
    let harness = Harness::new(vec![broken.clone(), backup.clone()], 10.0);
    let resolver = harness.resolver("profile", vec!["broken", "backup"], vec!["name"], 1.0);

    let mut record = lead("ada");
    let outcome = resolver.resolve(&mut record).await;

    assert_eq!(outcome.status, OutcomeStatus::Sufficient);
    assert_eq!(broken.calls(), 3, "retry ceiling is 3 attempts");
    assert_eq!(backup.calls(), 1);
}

#[tokio::test]
async fn rate_limited_does_not_count_against_retries() {
    let throttled = FakeProvider::new(
        "throttled",
        0.001,
        vec![
            rate_limited(0.001),
            rate_limited(0.001),
            rate_limited(0.001),
            rate_limited(0.001),
            success(&[("name", "Ada")], 0.001),
        ],
    );
    let harness = Harness::new(vec![throttled.clone()], 10.0);
    let resolver = harness.resolver("profile", vec!["throttled"], vec!["name"], 1.0);

    let mut record = lead("ada");
    let outcome = resolver.resolve(&mut record).await;

    // Four 429s exceed the transient retry ceiling of 3, yet the call
    // eventually lands because 429s only trigger cooldowns.
    assert_eq!(outcome.status, OutcomeStatus::Sufficient);
    assert_eq!(throttled.calls(), 5);
}

#[tokio::test]
async fn fatal_error_skips_to_next_provider_without_retry() {
    let rejected = FakeProvider::new("rejected", 0.001, vec![fatal(0.001)]);
    let backup = FakeProvider::new("backup", 0.002, vec![success(&[("name", "Ada")], 0.002)]);
    let harness = Harness::new(vec![rejected.clone(), backup.clone()], 10.0);
    let resolver = harness.resolver("profile", vec!["rejected", "backup"], vec!["name"], 1.0);

    let mut record = lead("ada");
    let outcome = resolver.resolve(&mut record).await;

    assert_eq!(rejected.calls(), 1, "fatal responses are not retried");
    assert_eq!(backup.calls(), 1);
    assert_eq!(outcome.status, OutcomeStatus::Sufficient);
}

#[tokio::test]
async fn cumulative_cost_respects_lead_ceiling() {
    // Each retry costs 0.02; ceiling 0.05 permits at most two attempts.
    let flaky = FakeProvider::new(
        "flaky",
        0.02,
        vec![transient(0.02), transient(0.02), transient(0.02)],
    );
    let harness = Harness::new(vec![flaky.clone()], 10.0);
    let resolver = harness.resolver("profile", vec!["flaky"], vec!["name"], 0.05);

    let mut record = lead("ada");
    let outcome = resolver.resolve(&mut record).await;

    assert_eq!(flaky.calls(), 2);
    assert!(outcome.cost <= 0.05 + 1e-9);
    assert_eq!(outcome.reason, StopReason::LeadBudget);
}

#[tokio::test]
async fn run_budget_refusal_stops_the_chain() {
    let provider = FakeProvider::new("serp", 0.01, vec![success(&[("name", "Ada")], 0.01)]);
    let harness = Harness::new(vec![provider.clone()], 0.005);
    let resolver = harness.resolver("profile", vec!["serp"], vec!["name"], 1.0);

    let mut record = lead("ada");
    let outcome = resolver.resolve(&mut record).await;

    assert_eq!(provider.calls(), 0);
    assert_eq!(outcome.reason, StopReason::RunBudget);
    assert!(harness.budget.is_exhausted());
}

#[tokio::test]
async fn pre_satisfied_lead_makes_zero_calls() {
    let provider = FakeProvider::new("serp", 0.001, vec![success(&[("name", "Ada")], 0.001)]);
    let harness = Harness::new(vec![provider.clone()], 10.0);
    let resolver = harness.resolver("profile", vec!["serp"], vec!["name"], 1.0);

    let mut record = lead("ada");
    record.fields.insert("name".to_string(), "Ada".to_string());
    let outcome = resolver.resolve(&mut record).await;

    assert_eq!(provider.calls(), 0);
    assert_eq!(outcome.status, OutcomeStatus::Sufficient);
    assert_eq!(outcome.cost, 0.0);
}

#[tokio::test]
async fn partial_when_fields_merge_but_predicate_unmet() {
    let serp = FakeProvider::new("serp", 0.001, vec![success(&[("name", "Ada")], 0.001)]);
    let harness = Harness::new(vec![serp], 10.0);
    let resolver = harness.resolver("profile", vec!["serp"], vec!["name", "position"], 1.0);

    let mut record = lead("ada");
    let outcome = resolver.resolve(&mut record).await;

    assert_eq!(outcome.status, OutcomeStatus::Partial);
    assert_eq!(outcome.reason, StopReason::ChainExhausted);
}

#[tokio::test]
async fn provider_without_target_is_skipped() {
    let blind = FakeProvider::without_target("blind", 0.001);
    let backup = FakeProvider::new("backup", 0.002, vec![success(&[("name", "Ada")], 0.002)]);
    let harness = Harness::new(vec![blind.clone(), backup.clone()], 10.0);
    let resolver = harness.resolver("profile", vec!["blind", "backup"], vec!["name"], 1.0);

    let mut record = lead("ada");
    let outcome = resolver.resolve(&mut record).await;

    assert_eq!(blind.calls(), 0);
    assert_eq!(backup.calls(), 1);
    assert_eq!(outcome.status, OutcomeStatus::Sufficient);
    assert_eq!(outcome.attempted, vec!["blind", "backup"]);
}

#[tokio::test]
async fn duplicate_url_across_leads_hits_the_cache() {
    let provider = FakeProvider::new(
        "scrape",
        0.01,
        vec![success(&[("name", "Ada")], 0.01)],
    );
    let harness = Harness::new(vec![provider.clone()], 10.0);
    let resolver = harness.resolver("profile", vec!["scrape"], vec!["name"], 1.0);

    let mut first = lead("ada");
    let mut second = lead("ada-dup");
    second.linkedin_person_url = first.linkedin_person_url.clone();

    let first_outcome = resolver.resolve(&mut first).await;
    let second_outcome = resolver.resolve(&mut second).await;

    assert_eq!(provider.calls(), 1, "second lead must be served from cache");
    assert_eq!(first_outcome.status, OutcomeStatus::Sufficient);
    assert_eq!(second_outcome.status, OutcomeStatus::Sufficient);
    assert_eq!(second_outcome.cost, 0.0);
    assert_eq!(second.fields.get("name").map(String::as_str), Some("Ada"));
}

#[tokio::test]
async fn consecutive_failures_open_the_breaker() {
    // Five leads hit the same broken provider (3 transient attempts each
    // tripping the 5-consecutive-failures policy partway through).
    let script: Vec<_> = (0..15).map(|_| transient(0.001)).collect();
    let broken = FakeProvider::new("broken", 0.001, script);
    let harness = Harness::new(vec![broken.clone()], 10.0);
    let resolver = harness.resolver("profile", vec!["broken"], vec!["name"], 1.0);

    let mut calls_before_open = 0;
    for i in 0..5 {
        let mut record = lead(&format!("lead-{}", i));
        let before = broken.calls();
        resolver.resolve(&mut record).await;
        if broken.calls() == before {
            break;
        }
        calls_before_open = broken.calls();
    }

    // The breaker opened after 5 consecutive failures; later leads skip the
    // provider without issuing calls.
    assert!(calls_before_open <= 6);
    let mut last = lead("last");
    let before = broken.calls();
    let outcome = resolver.resolve(&mut last).await;
    assert_eq!(broken.calls(), before);
    assert_eq!(outcome.status, OutcomeStatus::Exhausted);
}
