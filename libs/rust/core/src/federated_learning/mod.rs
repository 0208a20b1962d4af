//! Federated aggregation for the pneumonia X-ray classifier.
//!
//! Hospitals train locally and send back weight updates; the
//! [`AggregationStrategy`] filters those replies, averages them, persists the
//! new global model and keeps a per-round metrics history. [`LocalRuntime`]
//! drives rounds against in-process clients and [`TrainingService`] exposes
//! status and run control to the HTTP layer.

use once_cell::sync::Lazy;
use opentelemetry::metrics::Meter;

pub(crate) static FED_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("growda_federation"));

pub mod parameters;
pub mod metrics;
mod storage;
pub mod history;
pub mod classify;
pub mod fedavg;
pub mod model;
pub mod state;
pub mod strategy;
pub mod runtime;
pub mod simulation;
pub mod control;

pub use classify::{classify, filter_results, ClientResult, FitRes, RawClientResult, ValidResult};
pub use control::{ControlError, TrainingService, TrainingStatus, DEFAULT_MAX_ROUNDS};
pub use fedavg::{FedAvg, FedAvgConfig, Failure, FitAggregator};
pub use history::{ClientMetric, HistoryError, HistoryStore, RoundSummary};
pub use metrics::{weighted_average, Metrics};
pub use model::{ModelFactory, SequentialFactory, TrainableModel};
pub use parameters::{parameters_to_weights, weights_to_parameters, Parameters, Tensor, Weights};
pub use runtime::{Client, EvaluateRes, LocalRuntime, RunSummary};
pub use simulation::{hospitals, SimulatedHospital};
pub use state::{RuntimeState, SharedState};
pub use strategy::{AggregationStrategy, FitAggregate, RoundOutcome};
