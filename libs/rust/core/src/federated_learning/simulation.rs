//! Simulated hospital clients.
//!
//! Stand-ins for the per-hospital training processes: each one pulls the
//! global weights toward its own optimum and reports plausible metrics, which
//! is enough to exercise the aggregation path end to end.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use super::classify::{FitRes, RawClientResult};
use super::metrics::Metrics;
use super::parameters::{parameters_to_weights, weights_to_parameters, Parameters, Weights};
use super::runtime::{Client, ClientError, EvaluateRes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Current,
    /// Replies `[client, num_examples]` without parameters.
    Legacy,
}

#[derive(Debug, Clone)]
pub struct HospitalProfile {
    pub train_examples: u64,
    pub val_examples: u64,
    pub base_accuracy: f64,
    /// Value every weight drifts toward when trained on this hospital's data.
    pub target: f32,
    pub learning_rate: f32,
    pub protocol: Protocol,
}

impl Default for HospitalProfile {
    fn default() -> Self { Self { train_examples: 1000, val_examples: 200, base_accuracy: 0.7, target: 0.0, learning_rate: 0.2, protocol: Protocol::Current } }
}

pub struct SimulatedHospital {
    id: String,
    profile: HospitalProfile,
    rng: StdRng,
    rounds_trained: u64,
}

impl SimulatedHospital {
    pub fn new(id: impl Into<String>, profile: HospitalProfile, seed: u64) -> Self {
        Self { id: id.into(), profile, rng: StdRng::seed_from_u64(seed), rounds_trained: 0 }
    }

    fn decode(&self, parameters: &Parameters) -> Result<Weights, ClientError> {
        parameters_to_weights(parameters).map_err(|e| ClientError { client_id: self.id.clone(), reason: e.to_string() })
    }

    fn distance(&self, weights: &Weights) -> f64 {
        let (sum, n) = weights.iter().flat_map(|t| &t.values).fold((0f64, 0usize), |(s, n), v| {
            let d = (*v - self.profile.target) as f64;
            (s + d * d, n + 1)
        });
        if n == 0 { 0.0 } else { sum / n as f64 }
    }

    fn accuracy(&mut self) -> f64 {
        let gain = 0.04 * self.rounds_trained as f64;
        let jitter = self.rng.gen_range(-0.01..0.01);
        (self.profile.base_accuracy + gain + jitter).clamp(0.0, 0.98)
    }
}

impl Client for SimulatedHospital {
    fn client_id(&self) -> &str { &self.id }

    fn fit(&mut self, _round: u64, parameters: &Parameters) -> Result<RawClientResult, ClientError> {
        if self.profile.protocol == Protocol::Legacy {
            return Ok(RawClientResult::legacy_tuple(json!(self.id), self.profile.train_examples as i64));
        }
        let mut weights = self.decode(parameters)?;
        let (lr, target) = (self.profile.learning_rate, self.profile.target);
        for v in weights.iter_mut().flat_map(|t| t.values.iter_mut()) {
            *v += lr * (target - *v) + self.rng.gen_range(-1e-3..1e-3);
        }
        self.rounds_trained += 1;
        let val_loss = self.distance(&weights);
        let accuracy = self.accuracy();
        let metrics = Metrics::from([
            ("loss".to_string(), 1.0 - accuracy),
            ("accuracy".to_string(), accuracy),
            ("val_loss".to_string(), val_loss),
            ("val_accuracy".to_string(), (accuracy - 0.02).max(0.0)),
        ]);
        let res = FitRes { parameters: weights_to_parameters(&weights), num_examples: self.profile.train_examples, metrics };
        Ok(RawClientResult::fit(self.id.clone(), &res))
    }

    fn evaluate(&mut self, _round: u64, parameters: &Parameters) -> Result<EvaluateRes, ClientError> {
        let weights = self.decode(parameters)?;
        let loss = self.distance(&weights);
        let accuracy = self.accuracy();
        Ok(EvaluateRes { loss, num_examples: self.profile.val_examples, metrics: Metrics::from([("accuracy".to_string(), accuracy)]) })
    }
}

/// `hospital_A`, `hospital_B`, ... with differing dataset sizes and optima.
pub fn hospitals(n: usize, seed: u64) -> Vec<Box<dyn Client>> {
    (0..n)
        .map(|i| {
            let id = match u8::try_from(i).ok().filter(|i| *i < 26) {
                Some(i) => format!("hospital_{}", (b'A' + i) as char),
                None => format!("hospital_{i}"),
            };
            let profile = HospitalProfile {
                train_examples: 800 + 400 * i as u64,
                val_examples: 160 + 80 * i as u64,
                base_accuracy: 0.68 + 0.02 * (i % 3) as f64,
                target: 0.01 * i as f32,
                ..HospitalProfile::default()
            };
            Box::new(SimulatedHospital::new(id, profile, seed.wrapping_add(i as u64))) as Box<dyn Client>
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federated_learning::classify::{classify, ClientResult};
    use crate::federated_learning::parameters::Tensor;

    fn params(v: f32) -> Parameters { weights_to_parameters(&[Tensor::new(vec![4], vec![v; 4]).unwrap()]) }

    #[test]
    fn fit_moves_weights_toward_target() {
        let mut h = SimulatedHospital::new("hospital_A", HospitalProfile { target: 1.0, learning_rate: 0.5, ..HospitalProfile::default() }, 7);
        let raw = h.fit(1, &params(0.0)).unwrap();
        let ClientResult::Valid(v) = classify(0, &raw) else { panic!("expected a valid reply") };
        assert_eq!(v.client_id, "hospital_A");
        assert_eq!(v.num_examples, 1000);
        assert!(v.weights[0].values.iter().all(|x| (x - 0.5).abs() < 0.01));
        for key in ["loss", "accuracy", "val_loss", "val_accuracy"] { assert!(v.metrics.contains_key(key), "{key}"); }
    }

    #[test]
    fn legacy_hospital_replies_without_parameters() {
        let mut h = SimulatedHospital::new("old", HospitalProfile { protocol: Protocol::Legacy, ..HospitalProfile::default() }, 1);
        assert_eq!(classify(0, &h.fit(1, &params(0.0)).unwrap()), ClientResult::LegacyTuple);
    }

    #[test]
    fn evaluate_reports_distance_as_loss() {
        let mut h = SimulatedHospital::new("h", HospitalProfile { target: 1.0, ..HospitalProfile::default() }, 3);
        let r = h.evaluate(1, &params(0.0)).unwrap();
        assert!((r.loss - 1.0).abs() < 1e-9);
        assert_eq!(r.num_examples, 200);
        assert!(h.evaluate(1, &Parameters { tensor_type: "bogus".into(), tensors: vec![] }).is_err());
    }

    #[test]
    fn named_hospitals() {
        let hs = hospitals(3, 42);
        let ids: Vec<_> = hs.iter().map(|h| h.client_id().to_string()).collect();
        assert_eq!(ids, ["hospital_A", "hospital_B", "hospital_C"]);
    }
}
