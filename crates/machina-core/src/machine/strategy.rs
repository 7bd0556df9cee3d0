//! Execution strategies wrapped around a single unit-of-work invocation.
//!
//! - **Default**: one call, failure propagates.
//! - **Retry**: sequential re-invocation with jittered backoff sleeps.
//! - **Parallel**: `n_samples` concurrent calls, settle-all, keep successes.
//! - **QuorumVote**: sequential samples until one canonical result leads the
//!   runner-up by `k_margin` votes.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use machina_types::machine::StrategyConfig;
use rand::Rng;
use serde_json::{Map, Value, json};

use crate::invoke::WorkError;

// ---------------------------------------------------------------------------
// ExecutionStrategy
// ---------------------------------------------------------------------------

/// A configured invocation policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionStrategy {
    config: StrategyConfig,
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        Self::new(StrategyConfig::Default)
    }
}

impl ExecutionStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    /// Build from a state's optional `execution` block.
    pub fn from_config(config: Option<&StrategyConfig>) -> Self {
        config.cloned().map(Self::new).unwrap_or_default()
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Run `work` under this strategy.
    ///
    /// `work` is called once per attempt or sample and must produce a fresh
    /// future each time.
    pub async fn execute<F, Fut>(&self, mut work: F) -> Result<Value, WorkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, WorkError>>,
    {
        match &self.config {
            StrategyConfig::Default => work().await,
            StrategyConfig::Retry { backoffs, jitter } => {
                retry(&mut work, backoffs, *jitter).await
            }
            StrategyConfig::Parallel { n_samples } => parallel(&mut work, *n_samples).await,
            StrategyConfig::QuorumVote {
                k_margin,
                max_candidates,
            } => quorum_vote(&mut work, *k_margin, *max_candidates).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

async fn retry<F, Fut>(work: &mut F, backoffs: &[f64], jitter: f64) -> Result<Value, WorkError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value, WorkError>>,
{
    let mut attempt = 0usize;
    loop {
        match work().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let Some(&backoff) = backoffs.get(attempt) else {
                    tracing::debug!(attempts = attempt + 1, error = %err, "retry exhausted");
                    return Err(err);
                };
                let delay = jittered_delay(backoff, jitter);
                tracing::debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// `backoff * (1 + jitter * U(-1, 1))` seconds, clamped at zero.
fn jittered_delay(backoff: f64, jitter: f64) -> Duration {
    let factor = if jitter > 0.0 {
        1.0 + jitter * rand::thread_rng().gen_range(-1.0..=1.0)
    } else {
        1.0
    };
    let seconds = backoff * factor;
    if seconds > 0.0 {
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

// ---------------------------------------------------------------------------
// Parallel
// ---------------------------------------------------------------------------

async fn parallel<F, Fut>(work: &mut F, n_samples: usize) -> Result<Value, WorkError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value, WorkError>>,
{
    let futures: Vec<Fut> = (0..n_samples).map(|_| work()).collect();
    let outcomes = futures_util::future::join_all(futures).await;

    let mut results = Vec::with_capacity(outcomes.len());
    let mut last_error = None;
    for outcome in outcomes {
        match outcome {
            Ok(value) => results.push(value),
            Err(err) => {
                tracing::debug!(error = %err, "parallel sample failed");
                last_error = Some(err);
            }
        }
    }

    if results.is_empty() {
        return Err(last_error
            .unwrap_or_else(|| WorkError::new("ParallelFailed", "no samples were requested")));
    }

    let count = results.len();
    Ok(json!({ "results": results, "count": count }))
}

// ---------------------------------------------------------------------------
// QuorumVote
// ---------------------------------------------------------------------------

struct Candidate {
    value: Value,
    votes: usize,
}

async fn quorum_vote<F, Fut>(
    work: &mut F,
    k_margin: usize,
    max_candidates: usize,
) -> Result<Value, WorkError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value, WorkError>>,
{
    // Insertion-ordered tally; the index map points into it.
    let mut tally: Vec<Candidate> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut last_error = None;

    for sample in 0..max_candidates {
        let value = match work().await {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(sample, error = %err, "quorum sample failed");
                last_error = Some(err);
                continue;
            }
        };

        let key = canonical_key(&value);
        match index.get(&key) {
            Some(&i) => tally[i].votes += 1,
            None => {
                index.insert(key, tally.len());
                tally.push(Candidate { value, votes: 1 });
            }
        }

        let (leader, runner_up) = standings(&tally);
        if tally[leader].votes - runner_up >= k_margin {
            tracing::debug!(
                samples = sample + 1,
                votes = tally[leader].votes,
                "quorum reached"
            );
            return Ok(tally.swap_remove(leader).value);
        }
    }

    if tally.is_empty() {
        return Err(last_error
            .unwrap_or_else(|| WorkError::new("QuorumFailed", "no candidates were sampled")));
    }

    let (leader, _) = standings(&tally);
    tracing::debug!(
        candidates = max_candidates,
        votes = tally[leader].votes,
        "quorum margin not reached, returning leader"
    );
    Ok(tally.swap_remove(leader).value)
}

/// Index of the leader (earliest wins ties) and the runner-up's vote count.
fn standings(tally: &[Candidate]) -> (usize, usize) {
    let mut leader = 0;
    for (i, candidate) in tally.iter().enumerate() {
        if candidate.votes > tally[leader].votes {
            leader = i;
        }
    }
    let runner_up = tally
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != leader)
        .map(|(_, c)| c.votes)
        .max()
        .unwrap_or(0);
    (leader, runner_up)
}

/// Stable serialization with recursively sorted object keys.
pub fn canonical_key(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
