//! Broker snapshot normalization.
//!
//! Agents report account state in whatever shape their bridge produces, so the
//! document is walked by dotted path rather than deserialized into a fixed struct.

use serde::Serialize;
use serde_json::Value;

const EQUITY_PATHS: &[&str] = &[
    "day_start_equity",
    "equity",
    "account_equity",
    "metrics.equity",
    "account.equity",
    "balance",
    "account.balance",
];

const REALIZED_PNL_PATHS: &[&str] = &[
    "closed_pnl_today",
    "daily_realized_pnl",
    "realized_pnl_today",
    "metrics.realized_pnl_today",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SnapshotMetrics {
    pub open_positions: i64,
    pub daily_loss_pct: f64,
    pub equity: f64,
    pub net_pnl: f64,
}

/// Read-only view over a schema-less snapshot document.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'a> {
    root: &'a Value,
}

impl<'a> Snapshot<'a> {
    pub fn new(root: &'a Value) -> Self {
        Self { root }
    }

    /// Dotted-path lookup. Missing segments and non-object parents yield `None`.
    pub fn get(&self, path: &str) -> Option<&'a Value> {
        path.split('.')
            .try_fold(self.root, |node, segment| node.as_object()?.get(segment))
    }

    /// Numeric value at `path`. Nulls and strings are absent.
    pub fn number(&self, path: &str) -> Option<f64> {
        self.get(path).and_then(Value::as_f64)
    }

    pub fn array(&self, path: &str) -> Option<&'a Vec<Value>> {
        self.get(path).and_then(Value::as_array)
    }

    fn first_number(&self, paths: &[&str]) -> f64 {
        paths.iter().find_map(|p| self.number(p)).unwrap_or(0.0)
    }
}

pub fn derive_snapshot_metrics(document: &Value) -> SnapshotMetrics {
    let snapshot = Snapshot::new(document);
    let open_positions = count_positions(&snapshot);
    let equity = snapshot.first_number(EQUITY_PATHS);
    let net_pnl = daily_pnl(&snapshot);

    let daily_loss_pct = if equity > 0.0 && net_pnl < 0.0 {
        (net_pnl.abs() / equity * 100.0).max(0.0)
    } else {
        0.0
    };

    SnapshotMetrics {
        open_positions,
        daily_loss_pct,
        equity,
        net_pnl,
    }
}

fn count_positions(snapshot: &Snapshot<'_>) -> i64 {
    if let Some(arr) = ["positions", "open_positions"]
        .iter()
        .find_map(|key| snapshot.array(key))
    {
        return arr.len() as i64;
    }
    snapshot.first_number(&["open_positions_count", "metrics.open_positions_count"]) as i64
}

fn daily_pnl(snapshot: &Snapshot<'_>) -> f64 {
    // An explicit daily total already includes open P&L.
    if let Some(v) = snapshot
        .number("daily_pnl")
        .or_else(|| snapshot.number("metrics.daily_pnl"))
    {
        return v;
    }

    let realized = snapshot.first_number(REALIZED_PNL_PATHS);
    let unrealized: f64 = snapshot
        .array("positions")
        .map(|positions| {
            positions
                .iter()
                .filter(|p| p.is_object())
                .map(|p| {
                    let pos = Snapshot::new(p);
                    ["profit", "swap", "commission"]
                        .iter()
                        .filter_map(|k| pos.number(k))
                        .sum::<f64>()
                })
                .sum()
        })
        .unwrap_or(0.0);

    realized + unrealized
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn explicit_daily_pnl_wins_over_positions() {
        let doc = json!({
            "equity": 10000,
            "daily_pnl": -210,
            "positions": [{"profit": 20}, {"profit": -30}]
        });
        let m = derive_snapshot_metrics(&doc);
        assert_eq!(m.open_positions, 2);
        assert_eq!(m.net_pnl, -210.0);
        assert!((m.daily_loss_pct - 2.10).abs() < 1e-9);
    }

    #[test]
    fn realized_plus_position_pnl() {
        let doc = json!({
            "day_start_equity": 5000,
            "realized_pnl_today": -60,
            "positions": [
                {"profit": -20, "swap": -1, "commission": -2},
                {"profit": 10}
            ]
        });
        let m = derive_snapshot_metrics(&doc);
        assert_eq!(m.open_positions, 2);
        assert!((m.net_pnl - -73.0).abs() < 1e-9);
        assert!((m.daily_loss_pct - 1.46).abs() < 1e-9);
        assert_eq!(m.equity, 5000.0);
    }

    #[test]
    fn nulls_and_strings_are_absent() {
        let doc = json!({
            "equity": "10000",
            "balance": 8000,
            "daily_pnl": null,
            "metrics": {"daily_pnl": "lots"},
            "positions": [{"profit": "-5"}, {"profit": null, "swap": -4}, 7]
        });
        let m = derive_snapshot_metrics(&doc);
        assert_eq!(m.equity, 8000.0);
        assert_eq!(m.net_pnl, -4.0);
        assert_eq!(m.open_positions, 3);
        assert!((m.daily_loss_pct - 0.05).abs() < 1e-9);
    }

    #[test]
    fn nested_paths_and_count_fallback() {
        let doc = json!({
            "account": {"equity": 2000},
            "metrics": {"open_positions_count": 4, "realized_pnl_today": -40}
        });
        let m = derive_snapshot_metrics(&doc);
        assert_eq!(m.open_positions, 4);
        assert_eq!(m.equity, 2000.0);
        assert!((m.daily_loss_pct - 2.0).abs() < 1e-9);
    }

    #[test]
    fn profit_day_reports_no_loss() {
        let m = derive_snapshot_metrics(&json!({"equity": 1000, "daily_pnl": 50}));
        assert_eq!(m.daily_loss_pct, 0.0);
        assert_eq!(m.net_pnl, 50.0);
    }

    #[test]
    fn empty_or_non_object_document() {
        assert_eq!(derive_snapshot_metrics(&json!({})), SnapshotMetrics::default());
        assert_eq!(derive_snapshot_metrics(&json!([1, 2])), SnapshotMetrics::default());
        assert_eq!(derive_snapshot_metrics(&Value::Null), SnapshotMetrics::default());
    }

    #[test]
    fn path_lookup_stops_at_scalars() {
        let doc = json!({"a": {"b": 1}, "c": 2});
        let s = Snapshot::new(&doc);
        assert_eq!(s.number("a.b"), Some(1.0));
        assert_eq!(s.get("c.d"), None);
        assert_eq!(s.get("a.x.y"), None);
    }
}
