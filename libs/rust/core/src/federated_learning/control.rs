//! Run control and status queries for the HTTP layer.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::history::RoundSummary;
use super::runtime::{LocalRuntime, RunSummary, RuntimeError};
use super::state::SharedState;
use super::strategy::AggregationStrategy;

#[derive(Debug, Error, PartialEq)]
pub enum ControlError {
    #[error("Training already in progress")]
    AlreadyRunning,
    #[error("num_rounds must be between 1 and {max}")]
    InvalidRounds { max: u64 },
}

/// Longest run accepted unless configured otherwise.
pub const DEFAULT_MAX_ROUNDS: u64 = 100;

/// Status document served on `/status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingStatus {
    pub round: u64,
    pub global_accuracy: f64,
    pub connected_clients: usize,
    pub total_rounds: u64,
    pub last_update: String,
    pub in_progress: bool,
}

/// Holds the training slot for the lifetime of a run.
struct TrainingSlot(SharedState);

impl Drop for TrainingSlot {
    fn drop(&mut self) { self.0.finish_training(); }
}

pub struct TrainingService {
    strategy: Arc<AggregationStrategy>,
    runtime: Arc<Mutex<LocalRuntime>>,
    total_rounds: u64,
    max_rounds: u64,
}

impl TrainingService {
    /// Restores round and accuracy from the history log so a restarted
    /// server reports where the last run left off.
    pub fn new(strategy: AggregationStrategy, runtime: LocalRuntime, total_rounds: u64) -> Self {
        match strategy.history().read_all() {
            Ok(history) => strategy.state().restore(&history),
            Err(e) => warn!(error = %e, "could not restore state from metrics history"),
        }
        Self { strategy: Arc::new(strategy), runtime: Arc::new(Mutex::new(runtime)), total_rounds, max_rounds: DEFAULT_MAX_ROUNDS }
    }

    pub fn with_max_rounds(mut self, max_rounds: u64) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn state(&self) -> &SharedState { self.strategy.state() }

    pub fn status(&self) -> TrainingStatus {
        let snap = self.state().snapshot();
        TrainingStatus {
            round: snap.current_round,
            global_accuracy: snap.global_accuracy.unwrap_or(0.0),
            connected_clients: snap.connected_clients,
            total_rounds: self.total_rounds,
            last_update: Utc::now().to_rfc3339(),
            in_progress: snap.training_in_progress,
        }
    }

    /// Recorded rounds, oldest first. An unreadable log is reported as empty.
    pub fn metrics_history(&self) -> Vec<RoundSummary> {
        self.strategy.history().read_all().unwrap_or_else(|e| {
            error!(error = %e, "failed to read metrics history");
            Vec::new()
        })
    }

    /// Starts a run of `num_rounds` (1..=max_rounds) on a blocking worker.
    /// Only one run may be active; the slot is claimed before this returns.
    pub fn start_training_run(&self, num_rounds: u64, reset_model: bool) -> Result<JoinHandle<Result<RunSummary, RuntimeError>>, ControlError> {
        if num_rounds == 0 || num_rounds > self.max_rounds { return Err(ControlError::InvalidRounds { max: self.max_rounds }); }
        if !self.state().try_begin_training() { return Err(ControlError::AlreadyRunning); }
        let slot = TrainingSlot(self.state().clone());
        let strategy = Arc::clone(&self.strategy);
        let runtime = Arc::clone(&self.runtime);
        info!(num_rounds, reset_model, "training_run_started");
        Ok(tokio::task::spawn_blocking(move || {
            let _slot = slot;
            if reset_model {
                match strategy.reset_model() {
                    Ok(removed) => info!(removed, path = %strategy.model_path().display(), "global_model_reset"),
                    Err(e) => warn!(error = %e, "could not remove stored model"),
                }
            }
            let initial = strategy.initial_parameters();
            let res = runtime.lock().run(&strategy, initial, num_rounds);
            match &res {
                Ok(s) => info!(rounds = s.rounds.len(), completed = s.completed(), "training_run_finished"),
                Err(e) => error!(error = %e, "training run aborted"),
            }
            res
        }))
    }
}
