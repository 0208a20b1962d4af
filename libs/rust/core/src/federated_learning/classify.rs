//! Classification of raw per-client fit replies.
//!
//! Clients do not all speak the same protocol revision, so the runtime hands
//! every reply over as raw JSON. Each entry is inspected on its own and turned
//! into a [`ClientResult`]; an entry that cannot be understood becomes
//! `Malformed` and never affects its neighbours.

use once_cell::sync::Lazy;
use opentelemetry::{metrics::Counter, KeyValue};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::history::ClientMetric;
use super::metrics::Metrics;
use super::parameters::{parameters_to_weights, Parameters, ParametersError, Weights};
use super::FED_METER;

static CLASSIFIED_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    FED_METER.u64_counter("fed_client_results_total").with_description("Client fit results by classification").build()
});

/// Fit reply of a current-protocol client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitRes {
    pub parameters: Parameters,
    pub num_examples: u64,
    #[serde(default)]
    pub metrics: Metrics,
}

/// One client's reply exactly as delivered by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawClientResult(pub Value);

impl RawClientResult {
    /// `[{"cid": ..}, FitRes]`, the shape current clients produce.
    pub fn fit(client_id: impl Into<String>, res: &FitRes) -> Self {
        let cid: String = client_id.into();
        Self(json!([{ "cid": cid }, res]))
    }

    /// `[<tag>, <num_examples>]` from clients predating parameter payloads.
    pub fn legacy_tuple(tag: Value, num_examples: i64) -> Self { Self(json!([tag, num_examples])) }

    /// `[[..weights..], <num_examples>]` from clients that shipped bare weight lists.
    pub fn legacy_list_weights(weights: Vec<Vec<f32>>, num_examples: i64) -> Self { Self(json!([weights, num_examples])) }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidResult {
    pub client_id: String,
    pub weights: Weights,
    pub num_examples: u64,
    pub metrics: Metrics,
}

impl ValidResult {
    pub fn accuracy(&self) -> Option<f64> { self.metrics.get("accuracy").copied() }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientResult {
    Valid(ValidResult),
    LegacyTuple,
    LegacyListWeights,
    Malformed(String),
}

impl ClientResult {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientResult::Valid(_) => "valid",
            ClientResult::LegacyTuple => "legacy_tuple",
            ClientResult::LegacyListWeights => "legacy_list_weights",
            ClientResult::Malformed(_) => "malformed",
        }
    }
}

#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("expected a two-element [client, reply] array")]
    NotAPair,
    #[error("unrecognized reply shape: {0}")]
    UnrecognizedShape(&'static str),
    #[error("fit reply does not decode: {0}")]
    FitRes(#[from] serde_json::Error),
    #[error("parameters are not a well-formed weight collection: {0}")]
    Parameters(#[from] ParametersError),
}

/// Classifies the reply at position `index`. Never fails: anything that does
/// not fit a known shape is returned as `Malformed` with the reason.
pub fn classify(index: usize, raw: &RawClientResult) -> ClientResult {
    match inspect(index, &raw.0) {
        Ok(c) => c,
        Err(e) => ClientResult::Malformed(e.to_string()),
    }
}

fn inspect(index: usize, value: &Value) -> Result<ClientResult, ClassificationError> {
    let Some([head, reply]) = value.as_array().map(Vec::as_slice) else { return Err(ClassificationError::NotAPair) };
    if reply.get("parameters").is_some() {
        let res = FitRes::deserialize(reply)?;
        let weights = parameters_to_weights(&res.parameters)?;
        return Ok(ClientResult::Valid(ValidResult { client_id: client_id(head, index), weights, num_examples: res.num_examples, metrics: res.metrics }));
    }
    if reply.is_i64() || reply.is_u64() {
        return Ok(if head.is_array() { ClientResult::LegacyListWeights } else { ClientResult::LegacyTuple });
    }
    Err(ClassificationError::UnrecognizedShape("reply is neither a fit result nor an example count"))
}

fn client_id(head: &Value, index: usize) -> String {
    match head.get("cid") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => index.to_string(),
    }
}

/// Output of [`filter_results`]: averaging input plus one report row per entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilteredResults {
    pub valid: Vec<ValidResult>,
    pub client_metrics: Vec<ClientMetric>,
}

pub fn filter_results(raw: &[RawClientResult]) -> FilteredResults {
    let mut out = FilteredResults::default();
    for (idx, entry) in raw.iter().enumerate() {
        let class = classify(idx, entry);
        let kind = class.kind();
        CLASSIFIED_TOTAL.add(1, &[KeyValue::new("kind", kind)]);
        match class {
            ClientResult::Valid(v) => {
                debug!(index = idx, client = %v.client_id, num_examples = v.num_examples, "fit_result_accepted");
                out.client_metrics.push(ClientMetric { client_id: v.client_id.clone(), accuracy: v.accuracy() });
                out.valid.push(v);
            }
            ClientResult::LegacyTuple | ClientResult::LegacyListWeights => {
                warn!(index = idx, kind, "skipping legacy fit result");
                out.client_metrics.push(ClientMetric { client_id: format!("legacy_{idx}"), accuracy: None });
            }
            ClientResult::Malformed(reason) => {
                warn!(index = idx, %reason, "skipping malformed fit result");
                out.client_metrics.push(ClientMetric { client_id: format!("malformed_{idx}"), accuracy: None });
            }
        }
    }
    out
}
