//! Waterfall lead-enrichment orchestrator.
//!
//! Pulls lead rows (LinkedIn person/company URLs) from a spreadsheet
//! gateway, walks a cost-ordered provider chain per enrichment goal,
//! merges accepted fields monotonically, scores qualified leads with an
//! LLM, and writes every row back as it finishes. Concurrency is bounded,
//! provider calls are rate limited and circuit broken, and both per-lead
//! and run-level cost ceilings are enforced before every call.

pub mod batch;
pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod models;
pub mod providers;
pub mod rate_limit;
pub mod scorer;
pub mod sheet_client;
pub mod store;
pub mod waterfall;
