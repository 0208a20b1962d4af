use std::sync::Arc;

use anyhow::Result;
use growda_core::{hospitals, AggregationStrategy, HistoryStore, LocalRuntime, SequentialFactory, ServerConfig, SharedState, TrainingService};
use tracing::{info, warn};

/// Wires the aggregation strategy, the simulated hospitals and the run
/// controller together from the loaded configuration.
pub struct FederationModule {
    service: Arc<TrainingService>,
}

impl FederationModule {
    pub fn new(cfg: &ServerConfig) -> Result<Self> {
        let strategy = AggregationStrategy::new(
            cfg.fedavg.clone(),
            Arc::new(SequentialFactory::pneumonia()),
            &cfg.model_path,
            HistoryStore::new(&cfg.history_path),
            SharedState::new(),
        );
        if let Err(e) = strategy.ensure_model_file() {
            warn!(error = %e, "baseline model not written; it will be rebuilt on the first run");
        }
        let runtime = LocalRuntime::new(hospitals(cfg.clients, cfg.client_seed));
        let service = Arc::new(TrainingService::new(strategy, runtime, cfg.total_rounds).with_max_rounds(cfg.max_rounds));
        info!(clients = cfg.clients, total_rounds = cfg.total_rounds, max_rounds = cfg.max_rounds, model = %cfg.model_path.display(), "federation_module_initialized");
        Ok(Self { service })
    }

    pub fn service(&self) -> Arc<TrainingService> { Arc::clone(&self.service) }

    pub fn shutdown(&self) {
        let st = self.service.status();
        info!(round = st.round, in_progress = st.in_progress, "federation_module_shutdown");
    }
}
