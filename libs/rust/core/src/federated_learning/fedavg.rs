//! Federated averaging: the numeric half of a round.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::classify::ValidResult;
use super::parameters::{same_layout, weights_to_parameters, Parameters, Tensor};

/// A client that did not deliver a reply for the round.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub client_id: String,
    pub reason: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum AggregationError {
    #[error("client {client_id} sent weights whose layout differs from the first client")]
    LayoutMismatch { client_id: String },
    #[error("no training examples reported across {clients} clients")]
    NoExamples { clients: usize },
}

/// Combines accepted client weights into the next global parameters.
pub trait FitAggregator: Send + Sync {
    /// `Ok(None)` means the algorithm declined to produce an aggregate this round.
    fn aggregate_fit(&self, round: u64, results: &[ValidResult], failures: &[Failure]) -> Result<Option<Parameters>, AggregationError>;
}

/// Client sampling knobs consumed by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FedAvgConfig {
    pub min_fit_clients: usize,
    pub min_evaluate_clients: usize,
    pub min_available_clients: usize,
    pub fraction_fit: f64,
    pub fraction_evaluate: f64,
}

impl Default for FedAvgConfig {
    fn default() -> Self { Self { min_fit_clients: 2, min_evaluate_clients: 2, min_available_clients: 2, fraction_fit: 1.0, fraction_evaluate: 1.0 } }
}

impl FedAvgConfig {
    pub fn num_fit_clients(&self, available: usize) -> usize { sample_size(available, self.fraction_fit, self.min_fit_clients) }
    pub fn num_evaluate_clients(&self, available: usize) -> usize { sample_size(available, self.fraction_evaluate, self.min_evaluate_clients) }
}

fn sample_size(available: usize, fraction: f64, min: usize) -> usize {
    let wanted = (available as f64 * fraction).floor() as usize;
    wanted.max(min).min(available)
}

/// Example-count weighted coordinate-wise mean of the clients' tensors.
#[derive(Debug, Clone)]
pub struct FedAvg {
    /// Aggregate even when some sampled clients failed.
    pub accept_failures: bool,
}

impl Default for FedAvg {
    fn default() -> Self { Self { accept_failures: true } }
}

impl FitAggregator for FedAvg {
    fn aggregate_fit(&self, round: u64, results: &[ValidResult], failures: &[Failure]) -> Result<Option<Parameters>, AggregationError> {
        if results.is_empty() { return Ok(None); }
        if !self.accept_failures && !failures.is_empty() {
            warn!(round, failures = failures.len(), "failures present and not accepted; no aggregate");
            return Ok(None);
        }
        let first = &results[0].weights;
        if let Some(bad) = results.iter().find(|r| !same_layout(first, &r.weights)) {
            return Err(AggregationError::LayoutMismatch { client_id: bad.client_id.clone() });
        }
        // Counts are client-supplied; summed as f64 so large values cannot overflow.
        let total: f64 = results.iter().map(|r| r.num_examples as f64).sum();
        if total <= 0.0 { return Err(AggregationError::NoExamples { clients: results.len() }); }

        let mut acc: Vec<Vec<f64>> = first.iter().map(|t| vec![0f64; t.len()]).collect();
        for r in results {
            let w = r.num_examples as f64;
            for (layer, tensor) in acc.iter_mut().zip(&r.weights) {
                for (a, v) in layer.iter_mut().zip(&tensor.values) { *a += *v as f64 * w; }
            }
        }
        let averaged: Vec<Tensor> = acc
            .into_iter()
            .zip(first)
            .map(|(layer, t)| Tensor { shape: t.shape.clone(), values: layer.into_iter().map(|v| (v / total) as f32).collect() })
            .collect();
        Ok(Some(weights_to_parameters(&averaged)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federated_learning::metrics::Metrics;
    use crate::federated_learning::parameters::parameters_to_weights;

    fn result(id: &str, values: Vec<f32>, n: u64) -> ValidResult {
        ValidResult { client_id: id.into(), weights: vec![Tensor { shape: vec![values.len()], values }], num_examples: n, metrics: Metrics::new() }
    }

    #[test]
    fn fedavg_aggregates() {
        let agg = FedAvg::default();
        let p = agg.aggregate_fit(1, &[result("n1", vec![0.1, 0.2, 0.3], 10), result("n2", vec![0.2, 0.4, 0.6], 30)], &[]).unwrap().expect("aggregate");
        let w = parameters_to_weights(&p).unwrap();
        // (0.1*10 + 0.2*30)/40 = 0.175
        assert!((w[0].values[0] - 0.175).abs() < 1e-6);
        assert!((w[0].values[2] - 0.525).abs() < 1e-6);
    }

    #[test]
    fn nothing_to_average() {
        assert_eq!(FedAvg::default().aggregate_fit(1, &[], &[]), Ok(None));
    }

    #[test]
    fn refuses_failures_when_configured() {
        let agg = FedAvg { accept_failures: false };
        let failures = [Failure { client_id: "n3".into(), reason: "timeout".into() }];
        assert_eq!(agg.aggregate_fit(1, &[result("n1", vec![1.0], 1)], &failures), Ok(None));
        assert!(FedAvg::default().aggregate_fit(1, &[result("n1", vec![1.0], 1)], &failures).unwrap().is_some());
    }

    #[test]
    fn layout_mismatch_and_zero_examples() {
        let agg = FedAvg::default();
        let err = agg.aggregate_fit(1, &[result("n1", vec![1.0, 2.0], 1), result("n2", vec![1.0], 1)], &[]).unwrap_err();
        assert_eq!(err, AggregationError::LayoutMismatch { client_id: "n2".into() });
        let err = agg.aggregate_fit(1, &[result("n1", vec![1.0], 0)], &[]).unwrap_err();
        assert_eq!(err, AggregationError::NoExamples { clients: 1 });
    }

    #[test]
    fn huge_example_counts_do_not_overflow() {
        let big = u64::MAX / 2 + 1;
        let p = FedAvg::default().aggregate_fit(1, &[result("n1", vec![1.0], big), result("n2", vec![3.0], big)], &[]).unwrap().expect("aggregate");
        assert!((parameters_to_weights(&p).unwrap()[0].values[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn sampling_respects_minimums() {
        let cfg = FedAvgConfig { fraction_fit: 0.5, min_fit_clients: 2, ..FedAvgConfig::default() };
        assert_eq!(cfg.num_fit_clients(10), 5);
        assert_eq!(cfg.num_fit_clients(3), 2);
        assert_eq!(cfg.num_fit_clients(1), 1);
        assert_eq!(FedAvgConfig::default().num_evaluate_clients(4), 4);
    }
}
