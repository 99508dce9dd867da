//! Provider usage accounting.
//!
//! Counts adapter calls, failures, tokens and estimated cost per provider,
//! plus cache hits. Read as plain data by observability collaborators; the
//! orchestrator never emits metrics itself.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::providers::TokenUsage;

/// Accumulated usage for one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderUsage {
    /// Adapter calls made, including failed ones
    pub calls: u64,

    pub failures: u64,

    pub prompt_tokens: u64,

    pub completion_tokens: u64,

    /// Estimated cost in USD
    pub estimated_cost_usd: f64,
}

impl ProviderUsage {
    fn add(&mut self, usage: &TokenUsage, model: &str) {
        self.calls += 1;
        self.prompt_tokens += u64::from(usage.prompt_tokens);
        self.completion_tokens += u64::from(usage.completion_tokens);
        self.estimated_cost_usd += estimate_cost(usage, model);
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Usage across every provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub providers: BTreeMap<String, ProviderUsage>,
    pub cache_hits: u64,
}

impl UsageSnapshot {
    pub fn total_calls(&self) -> u64 {
        self.providers.values().map(|p| p.calls).sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.providers.values().map(|p| p.total_tokens()).sum()
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.providers.values().map(|p| p.estimated_cost_usd).sum()
    }
}

/// Usage tracker shared by every call path.
#[derive(Debug, Default)]
pub struct UsageTracker {
    usage: RwLock<UsageSnapshot>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed adapter call.
    pub fn record_call(&self, provider: &str, model: &str, usage: &TokenUsage) {
        self.usage
            .write()
            .providers
            .entry(provider.to_string())
            .or_default()
            .add(usage, model);
    }

    /// Record an adapter call that returned an error.
    pub fn record_failure(&self, provider: &str) {
        let mut snapshot = self.usage.write();
        let entry = snapshot.providers.entry(provider.to_string()).or_default();
        entry.calls += 1;
        entry.failures += 1;
    }

    pub fn record_cache_hit(&self) {
        self.usage.write().cache_hits += 1;
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        self.usage.read().clone()
    }

    /// Adapter calls made so far, across providers.
    pub fn total_calls(&self) -> u64 {
        self.usage.read().total_calls()
    }

    pub fn reset(&self) {
        *self.usage.write() = UsageSnapshot::default();
    }
}

/// Estimate cost for a usage entry.
fn estimate_cost(usage: &TokenUsage, model: &str) -> f64 {
    // Pricing per million tokens
    let (input_rate, output_rate) = match model {
        m if m.contains("sonnet") => (3.0, 15.0),
        m if m.contains("opus") => (5.0, 25.0),
        m if m.contains("haiku") => (1.0, 5.0),
        m if m.contains("gpt-4o-mini") => (0.15, 0.6),
        m if m.contains("gpt-4o") => (2.5, 10.0),
        _ => (0.0, 0.0), // Local or unknown models are not priced
    };

    let input_cost = (usage.prompt_tokens as f64 / 1_000_000.0) * input_rate;
    let output_cost = (usage.completion_tokens as f64 / 1_000_000.0) * output_rate;

    input_cost + output_cost
}
