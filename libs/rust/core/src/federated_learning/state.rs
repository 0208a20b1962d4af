use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use super::history::RoundSummary;

/// Live training status. Not persisted; [`SharedState::restore`] rebuilds it
/// from the history log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuntimeState {
    pub current_round: u64,
    pub global_accuracy: Option<f64>,
    pub connected_clients: usize,
    pub training_in_progress: bool,
}

/// Handle shared by the aggregation strategy (writer) and status queries (readers).
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<RwLock<RuntimeState>>,
}

impl SharedState {
    pub fn new() -> Self { Self::default() }

    pub fn snapshot(&self) -> RuntimeState { self.inner.read().clone() }

    pub fn set_connected_clients(&self, n: usize) { self.inner.write().connected_clients = n; }
    pub fn set_global_accuracy(&self, acc: f64) { self.inner.write().global_accuracy = Some(acc); }
    pub fn set_current_round(&self, round: u64) { self.inner.write().current_round = round; }
    pub fn global_accuracy(&self) -> Option<f64> { self.inner.read().global_accuracy }

    /// Claims the single training slot; false if a run already holds it.
    pub fn try_begin_training(&self) -> bool {
        let mut st = self.inner.write();
        if st.training_in_progress { return false; }
        st.training_in_progress = true;
        true
    }

    pub fn finish_training(&self) { self.inner.write().training_in_progress = false; }

    /// Round and accuracy as of the last recorded round.
    pub fn restore(&self, history: &[RoundSummary]) {
        let mut st = self.inner.write();
        if let Some(last) = history.last() { st.current_round = last.round_number; }
        st.global_accuracy = history.iter().rev().find_map(|s| s.global_accuracy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_training_slot() {
        let st = SharedState::new();
        assert!(st.try_begin_training());
        assert!(!st.clone().try_begin_training());
        st.finish_training();
        assert!(st.try_begin_training());
    }

    #[test]
    fn restore_from_history() {
        let st = SharedState::new();
        let hist = vec![
            RoundSummary { round_number: 1, global_accuracy: Some(0.6), client_metrics: vec![] },
            RoundSummary { round_number: 2, global_accuracy: None, client_metrics: vec![] },
        ];
        st.restore(&hist);
        let snap = st.snapshot();
        assert_eq!(snap.current_round, 2);
        assert_eq!(snap.global_accuracy, Some(0.6));
        assert!(!snap.training_in_progress);
    }
}
