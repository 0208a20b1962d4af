//! Per-round aggregation policy invoked by the federated runtime.
//!
//! A fit round moves through filtering, averaging, persisting and recording.
//! Nothing that goes wrong inside a round escapes [`AggregationStrategy::aggregate_fit`]:
//! the runtime always gets a well-formed [`FitAggregate`] back and the outcome
//! tells it what actually happened.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use super::classify::{filter_results, FilteredResults, RawClientResult};
use super::fedavg::{FedAvg, FedAvgConfig, Failure, FitAggregator};
use super::history::{HistoryError, HistoryStore, RoundSummary};
use super::metrics::{weighted_average, weighted_loss_avg, Metrics};
use super::model::{ModelError, ModelFactory};
use super::parameters::{parameters_to_weights, weights_to_parameters, Parameters, ParametersError};
use super::runtime::EvaluateRes;
use super::state::SharedState;
use super::FED_METER;

struct FedMetrics {
    rounds_total: Counter<u64>,
    aggregation_latency_ms: Histogram<f64>,
}

impl FedMetrics {
    fn new() -> Self {
        Self {
            rounds_total: FED_METER.u64_counter("fed_rounds_total").with_description("Fit rounds handled, by outcome").build(),
            aggregation_latency_ms: FED_METER.f64_histogram("fed_aggregation_latency_ms").with_description("Fit aggregation latency ms").with_unit("ms").build(),
        }
    }
}

static FED_METRICS: Lazy<FedMetrics> = Lazy::new(FedMetrics::new);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    /// Model saved and history entry written.
    Aggregated,
    /// No usable client update; the global model is unchanged.
    Skipped,
    AveragingFailed,
    /// Weights were averaged but the model file or the history entry was not written.
    PersistFailed,
}

impl RoundOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundOutcome::Aggregated => "aggregated",
            RoundOutcome::Skipped => "skipped",
            RoundOutcome::AveragingFailed => "averaging_failed",
            RoundOutcome::PersistFailed => "persist_failed",
        }
    }
}

/// What the runtime receives for a fit round.
#[derive(Debug, Clone, PartialEq)]
pub struct FitAggregate {
    pub parameters: Option<Parameters>,
    pub metrics: Metrics,
    pub outcome: RoundOutcome,
}

impl FitAggregate {
    fn empty(outcome: RoundOutcome) -> Self { Self { parameters: None, metrics: Metrics::new(), outcome } }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("aggregated parameters do not decode: {0}")]
    Parameters(#[from] ParametersError),
    #[error("global model not saved: {0}")]
    Model(#[from] ModelError),
    #[error("round history not recorded: {0}")]
    History(#[from] HistoryError),
}

pub struct AggregationStrategy {
    averaging: Box<dyn FitAggregator>,
    models: Arc<dyn ModelFactory>,
    model_path: PathBuf,
    history: HistoryStore,
    state: SharedState,
    config: FedAvgConfig,
}

impl AggregationStrategy {
    pub fn new(config: FedAvgConfig, models: Arc<dyn ModelFactory>, model_path: impl Into<PathBuf>, history: HistoryStore, state: SharedState) -> Self {
        Self { averaging: Box::new(FedAvg::default()), models, model_path: model_path.into(), history, state, config }
    }

    pub fn with_aggregator(mut self, averaging: Box<dyn FitAggregator>) -> Self {
        self.averaging = averaging;
        self
    }

    pub fn config(&self) -> &FedAvgConfig { &self.config }
    pub fn state(&self) -> &SharedState { &self.state }
    pub fn history(&self) -> &HistoryStore { &self.history }
    pub fn model_path(&self) -> &Path { &self.model_path }

    #[instrument(skip(self, results, failures), fields(results = results.len(), failures = failures.len()))]
    pub fn aggregate_fit(&self, round: u64, results: &[RawClientResult], failures: &[Failure]) -> FitAggregate {
        let started = Instant::now();
        let filtered = filter_results(results);
        self.state.set_connected_clients(filtered.valid.len());
        if filtered.valid.is_empty() {
            info!(round, "no valid client updates; skipping round");
            return self.finish(started, FitAggregate::empty(RoundOutcome::Skipped));
        }

        let parameters = match self.averaging.aggregate_fit(round, &filtered.valid, failures) {
            Ok(Some(p)) => p,
            Ok(None) => {
                info!(round, "averaging produced no aggregate; skipping round");
                return self.finish(started, FitAggregate::empty(RoundOutcome::Skipped));
            }
            Err(e) => {
                error!(round, error = %e, "averaging failed");
                return self.finish(started, FitAggregate::empty(RoundOutcome::AveragingFailed));
            }
        };

        let out = match self.persist_and_record(round, &parameters, &filtered) {
            Ok(accuracy) => FitAggregate {
                parameters: Some(parameters),
                metrics: accuracy.map(|a| Metrics::from([("accuracy".to_string(), a)])).unwrap_or_default(),
                outcome: RoundOutcome::Aggregated,
            },
            Err(e) => {
                error!(round, error = ?e, "model saving/metrics logging failed");
                FitAggregate { parameters: Some(parameters), metrics: Metrics::new(), outcome: RoundOutcome::PersistFailed }
            }
        };
        self.finish(started, out)
    }

    fn persist_and_record(&self, round: u64, parameters: &Parameters, filtered: &FilteredResults) -> Result<Option<f64>, PersistenceError> {
        let mut model = self.models.create();
        model.set_weights(parameters_to_weights(parameters)?)?;
        model.save(&self.model_path)?;
        info!(round, path = %self.model_path.display(), "global_model_saved");

        let entries: Vec<(u64, Metrics)> = filtered
            .valid
            .iter()
            .filter(|v| v.num_examples > 0)
            .filter_map(|v| v.accuracy().filter(|a| a.is_finite()).map(|a| (v.num_examples, Metrics::from([("accuracy".to_string(), a)]))))
            .collect();
        if let Some(acc) = weighted_average(&entries).get("accuracy") {
            self.state.set_global_accuracy(*acc);
        }
        let global_accuracy = self.state.global_accuracy();
        info!(round, connected_clients = filtered.valid.len(), ?global_accuracy, client_metrics = ?filtered.client_metrics, "round_aggregated");

        let len = self.history.append(RoundSummary { round_number: round, global_accuracy, client_metrics: filtered.client_metrics.clone() })?;
        self.state.set_current_round(round);
        info!(round, history_len = len, "round_recorded");
        Ok(global_accuracy)
    }

    fn finish(&self, started: Instant, out: FitAggregate) -> FitAggregate {
        FED_METRICS.rounds_total.add(1, &[KeyValue::new("outcome", out.outcome.as_str())]);
        FED_METRICS.aggregation_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        out
    }

    /// Example-weighted loss and metrics of the clients that evaluated the
    /// current global model. Clients that evaluated no examples are ignored.
    #[instrument(skip(self, results, failures), fields(results = results.len(), failures = failures.len()))]
    pub fn aggregate_evaluate(&self, round: u64, results: &[(String, EvaluateRes)], failures: &[Failure]) -> (Option<f64>, Metrics) {
        let usable: Vec<&EvaluateRes> = results.iter().map(|(_, r)| r).filter(|r| r.num_examples > 0).collect();
        if usable.is_empty() { return (None, Metrics::new()); }
        if !failures.is_empty() { warn!(round, failures = failures.len(), "evaluation failures ignored"); }
        let loss = weighted_loss_avg(&usable.iter().map(|r| (r.num_examples, r.loss)).collect::<Vec<_>>());
        let metrics = weighted_average(&usable.iter().map(|r| (r.num_examples, r.metrics.clone())).collect::<Vec<_>>());
        info!(round, ?loss, ?metrics, "evaluation_aggregated");
        (loss, metrics)
    }

    /// Writes a fresh baseline model if none is stored yet.
    pub fn ensure_model_file(&self) -> Result<(), ModelError> {
        if self.model_path.exists() { return Ok(()); }
        self.models.create().save(&self.model_path)?;
        info!(path = %self.model_path.display(), "baseline_model_created");
        Ok(())
    }

    /// Weights the next run starts from: the stored global model, or a fresh
    /// baseline when it is missing or unreadable.
    pub fn initial_parameters(&self) -> Parameters {
        if let Err(e) = self.ensure_model_file() { warn!(error = %e, "could not write baseline model"); }
        let model = match self.models.load(&self.model_path) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to load existing model weights; rebuilding baseline model");
                self.models.create()
            }
        };
        weights_to_parameters(&model.get_weights())
    }

    /// Removes the stored global model. Returns whether a file was deleted.
    pub fn reset_model(&self) -> io::Result<bool> {
        match std::fs::remove_file(&self.model_path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
