//! Example-count weighted aggregation of client metrics.

use std::collections::BTreeMap;

pub type Metrics = BTreeMap<String, f64>;

/// Weighted mean of each metric named by the first entry.
///
/// Entries lacking a metric contribute 0.0 for it; names that only appear in
/// later entries are ignored. Returns an empty map when there is nothing to
/// weigh (no entries, or every weight is zero).
pub fn weighted_average(entries: &[(u64, Metrics)]) -> Metrics {
    let Some((_, schema)) = entries.first() else { return Metrics::new() };
    let total: f64 = entries.iter().map(|(w, _)| *w as f64).sum();
    if total <= 0.0 { return Metrics::new(); }
    schema
        .keys()
        .map(|name| {
            let weighted: f64 = entries.iter().map(|(w, m)| *w as f64 * m.get(name).copied().unwrap_or(0.0)).sum();
            (name.clone(), weighted / total)
        })
        .collect()
}

/// Example-weighted mean loss; `None` when no examples were evaluated.
pub fn weighted_loss_avg(results: &[(u64, f64)]) -> Option<f64> {
    let total: f64 = results.iter().map(|(n, _)| *n as f64).sum();
    if total <= 0.0 { return None; }
    Some(results.iter().map(|(n, loss)| *n as f64 * loss).sum::<f64>() / total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(pairs: &[(&str, f64)]) -> Metrics { pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect() }

    #[test]
    fn weights_by_example_count() {
        let out = weighted_average(&[(10, m(&[("a", 1.0)])), (30, m(&[("a", 0.0)]))]);
        assert_eq!(out, m(&[("a", 0.25)]));
    }

    #[test]
    fn empty_and_zero_weight_inputs_yield_nothing() {
        assert!(weighted_average(&[]).is_empty());
        assert!(weighted_average(&[(0, m(&[("a", 1.0)]))]).is_empty());
        assert!(weighted_average(&[(0, m(&[("a", 1.0)])), (0, m(&[("a", 0.5)]))]).is_empty());
    }

    #[test]
    fn first_entry_defines_the_schema() {
        let out = weighted_average(&[(1, m(&[("accuracy", 0.5)])), (1, m(&[("accuracy", 1.0), ("loss", 0.2)]))]);
        assert_eq!(out.len(), 1);
        assert!((out["accuracy"] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn missing_metric_counts_as_zero() {
        let out = weighted_average(&[(2, m(&[("accuracy", 0.9), ("loss", 0.3)])), (2, m(&[("accuracy", 0.7)]))]);
        assert!((out["accuracy"] - 0.8).abs() < 1e-12);
        assert!((out["loss"] - 0.15).abs() < 1e-12);
    }

    #[test]
    fn loss_average() {
        assert_eq!(weighted_loss_avg(&[]), None);
        assert_eq!(weighted_loss_avg(&[(0, 1.0)]), None);
        let l = weighted_loss_avg(&[(100, 0.2), (300, 0.6)]).unwrap();
        assert!((l - 0.5).abs() < 1e-12);
    }

    #[test]
    fn loss_average_with_huge_counts() {
        let big = u64::MAX / 2 + 1;
        let l = weighted_loss_avg(&[(big, 0.2), (big, 0.4)]).unwrap();
        assert!((l - 0.3).abs() < 1e-12);
    }
}
