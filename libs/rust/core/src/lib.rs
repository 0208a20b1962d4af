//! Core shared utilities for Growda federated training services.

use std::path::PathBuf;

use anyhow::{bail, Result};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::prelude::*;

pub mod federated_learning;

pub use federated_learning::*;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber once. `RUST_LOG` wins over `default_level`;
/// `GROWDA_JSON_LOG=1` switches to flattened JSON lines.
pub fn init_tracing(service: &str, default_level: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("GROWDA_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry.with(tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false)).try_init()?;
        } else {
            registry.with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true)).try_init()?;
        }
        Ok(())
    })?;
    info!(service, "tracing initialized");
    Ok(())
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub service_name: String,
    pub listen_addr: String,
    /// Browser origin allowed to call the API (the dashboard dev server by default).
    pub cors_origin: String,
    pub log_level: String,
    pub model_path: PathBuf,
    pub history_path: PathBuf,
    /// Rounds reported as the plan on `/status`.
    pub total_rounds: u64,
    /// Upper bound on `num_rounds` accepted by `POST /train_round`.
    pub max_rounds: u64,
    /// Number of simulated hospitals attached to the local runtime.
    pub clients: usize,
    pub client_seed: u64,
    pub fedavg: FedAvgConfig,
}

/// Defaults, then the optional file named by `GROWDA_CONFIG_FILE`, then
/// `GROWDA_*` environment variables (`__` separates nested keys, e.g.
/// `GROWDA_FEDAVG__MIN_FIT_CLIENTS`).
pub fn load_config(service: &str) -> Result<ServerConfig> {
    let mut builder = config::Config::builder()
        .set_default("service_name", service)?
        .set_default("listen_addr", "0.0.0.0:8000")?
        .set_default("cors_origin", "http://localhost:5173")?
        .set_default("log_level", "info")?
        .set_default("model_path", "global_model.bin")?
        .set_default("history_path", "metrics_history.json")?
        .set_default("total_rounds", 3_i64)?
        .set_default("max_rounds", DEFAULT_MAX_ROUNDS as i64)?
        .set_default("clients", 2_i64)?
        .set_default("client_seed", 42_i64)?
        .set_default("fedavg.min_fit_clients", 2_i64)?
        .set_default("fedavg.min_evaluate_clients", 2_i64)?
        .set_default("fedavg.min_available_clients", 2_i64)?
        .set_default("fedavg.fraction_fit", 1.0)?
        .set_default("fedavg.fraction_evaluate", 1.0)?;

    if let Ok(file) = std::env::var("GROWDA_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("GROWDA").prefix_separator("_").separator("__").try_parsing(true));
    let cfg: ServerConfig = builder.build()?.try_deserialize()?;
    if cfg.total_rounds == 0 { bail!("total_rounds must be at least 1"); }
    if cfg.max_rounds == 0 { bail!("max_rounds must be at least 1"); }
    let f = &cfg.fedavg;
    if !(f.fraction_fit > 0.0 && f.fraction_fit <= 1.0 && f.fraction_evaluate > 0.0 && f.fraction_evaluate <= 1.0) {
        bail!("fedavg fractions must lie in (0, 1]");
    }
    Ok(cfg)
}
