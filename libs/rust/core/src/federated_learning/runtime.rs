//! In-process round driver.
//!
//! Plays the part of the federated runtime for a fixed set of local clients:
//! samples participants, fans the global parameters out, collects replies and
//! hands them to the [`AggregationStrategy`] one round at a time.

use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::classify::RawClientResult;
use super::fedavg::Failure;
use super::metrics::Metrics;
use super::parameters::Parameters;
use super::strategy::{AggregationStrategy, RoundOutcome};

/// Evaluation reply of one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateRes {
    pub loss: f64,
    pub num_examples: u64,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Error)]
#[error("client {client_id}: {reason}")]
pub struct ClientError {
    pub client_id: String,
    pub reason: String,
}

/// A participant holding local data. `fit` trains on the given global
/// parameters and replies in whatever protocol revision the client speaks.
pub trait Client: Send {
    fn client_id(&self) -> &str;
    fn fit(&mut self, round: u64, parameters: &Parameters) -> Result<RawClientResult, ClientError>;
    fn evaluate(&mut self, round: u64, parameters: &Parameters) -> Result<EvaluateRes, ClientError>;
}

#[derive(Debug, Error, PartialEq)]
pub enum RuntimeError {
    #[error("{available} clients available, at least {required} required")]
    NotEnoughClients { available: usize, required: usize },
    #[error("a run needs at least one round")]
    NoRounds,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundReport {
    pub round: u64,
    pub outcome: RoundOutcome,
    pub fit_failures: usize,
    pub eval_loss: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub rounds: Vec<RoundReport>,
    pub final_parameters: Parameters,
}

impl RunSummary {
    pub fn completed(&self) -> usize { self.rounds.iter().filter(|r| r.outcome == RoundOutcome::Aggregated).count() }
}

pub struct LocalRuntime {
    clients: Vec<Box<dyn Client>>,
}

impl LocalRuntime {
    pub fn new(clients: Vec<Box<dyn Client>>) -> Self { Self { clients } }

    /// Runs rounds `1..=num_rounds`. A round whose aggregate is missing keeps
    /// the previous global parameters for the next one.
    #[instrument(skip(self, strategy, initial))]
    pub fn run(&mut self, strategy: &AggregationStrategy, initial: Parameters, num_rounds: u64) -> Result<RunSummary, RuntimeError> {
        if num_rounds == 0 { return Err(RuntimeError::NoRounds); }
        let cfg = strategy.config().clone();
        if self.clients.len() < cfg.min_available_clients {
            return Err(RuntimeError::NotEnoughClients { available: self.clients.len(), required: cfg.min_available_clients });
        }
        let mut global = initial;
        let mut rounds = Vec::new();
        for round in 1..=num_rounds {
            let sampled = self.sample(cfg.num_fit_clients(self.clients.len()));
            let (results, failures) = self.fit_round(round, &sampled, &global);
            let fit_failures = failures.len();
            let agg = strategy.aggregate_fit(round, &results, &failures);
            if let Some(p) = agg.parameters { global = p; }

            let sampled = self.sample(cfg.num_evaluate_clients(self.clients.len()));
            let (evals, eval_failures) = self.evaluate_round(round, &sampled, &global);
            let (eval_loss, _) = strategy.aggregate_evaluate(round, &evals, &eval_failures);

            info!(round, outcome = agg.outcome.as_str(), fit_failures, ?eval_loss, "round_finished");
            rounds.push(RoundReport { round, outcome: agg.outcome, fit_failures, eval_loss });
        }
        let summary = RunSummary { rounds, final_parameters: global };
        info!(rounds = num_rounds, completed = summary.completed(), "run_finished");
        Ok(summary)
    }

    fn sample(&self, k: usize) -> Vec<usize> {
        let mut idx = (0..self.clients.len()).choose_multiple(&mut rand::thread_rng(), k);
        idx.sort_unstable();
        idx
    }

    fn fit_round(&mut self, round: u64, sampled: &[usize], global: &Parameters) -> (Vec<RawClientResult>, Vec<Failure>) {
        let mut results = Vec::with_capacity(sampled.len());
        let mut failures = Vec::new();
        for &i in sampled {
            match self.clients[i].fit(round, global) {
                Ok(r) => results.push(r),
                Err(e) => {
                    warn!(round, client = %e.client_id, reason = %e.reason, "fit_failed");
                    failures.push(Failure { client_id: e.client_id, reason: e.reason });
                }
            }
        }
        (results, failures)
    }

    fn evaluate_round(&mut self, round: u64, sampled: &[usize], global: &Parameters) -> (Vec<(String, EvaluateRes)>, Vec<Failure>) {
        let mut results = Vec::with_capacity(sampled.len());
        let mut failures = Vec::new();
        for &i in sampled {
            let client = &mut self.clients[i];
            match client.evaluate(round, global) {
                Ok(r) => results.push((client.client_id().to_string(), r)),
                Err(e) => {
                    warn!(round, client = %e.client_id, reason = %e.reason, "evaluate_failed");
                    failures.push(Failure { client_id: e.client_id, reason: e.reason });
                }
            }
        }
        (results, failures)
    }
}
