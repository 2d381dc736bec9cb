// Reporter module - Result data models and JSON output
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::SystemTime;

use crate::config::RunConfig;
use crate::stats::Summary;

/// 実行結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub config: RunConfig,
    pub scenario: String,
    pub summary: Summary,
    pub started_at: String,
    pub finished_at: String,
}

impl RunReport {
    pub fn new(config: RunConfig, scenario: &str, summary: Summary, started_at: String) -> Self {
        Self {
            config,
            scenario: scenario.to_string(),
            summary,
            started_at,
            finished_at: unix_timestamp(),
        }
    }

    /// Failed and timed-out dialogs over all terminal dialogs.
    pub fn error_rate(&self) -> f64 {
        let report = &self.summary.report;
        if report.total == 0 {
            0.0
        } else {
            (report.failed + report.timed_out) as f64 / report.total as f64
        }
    }

    pub fn timeout_rate(&self) -> f64 {
        let report = &self.summary.report;
        if report.total == 0 {
            0.0
        } else {
            report.timed_out as f64 / report.total as f64
        }
    }
}

/// 結果比較レポート
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub cps_change_pct: f64,
    pub latency_p50_change_pct: f64,
    pub latency_p90_change_pct: f64,
    pub latency_p95_change_pct: f64,
    pub latency_p99_change_pct: f64,
    pub error_rate_change: f64,
    pub timeout_rate_change: f64,
    pub improvements: Vec<String>,
    pub regressions: Vec<String>,
}

/// Seconds since the Unix epoch as a string.
pub fn unix_timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", now.as_secs())
}

/// JSON結果をファイルに書き出す
pub fn write_json_result(result: &RunReport, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(result)?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write result file '{}'", path.display()))?;
    Ok(())
}

/// JSON結果をファイルから読み込む
pub fn load_json_result(path: &Path) -> anyhow::Result<RunReport> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read result file '{}'", path.display()))?;
    let report = serde_json::from_str(&content)
        .with_context(|| format!("'{}' is not a run result", path.display()))?;
    Ok(report)
}

/// パーセンテージ変化を計算する。previous が 0 の場合は 0.0 を返す。
fn pct_change(current: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        0.0
    } else {
        (current - previous) / previous * 100.0
    }
}

/// 2つの実行結果を比較する
pub fn compare_results(current: &RunReport, previous: &RunReport) -> ComparisonReport {
    let cur = &current.summary;
    let prev = &previous.summary;

    let cps_change_pct = pct_change(cur.effective_cps, prev.effective_cps);

    let latency_p50_change_pct = pct_change(cur.report.latency.p50_ms, prev.report.latency.p50_ms);
    let latency_p90_change_pct = pct_change(cur.report.latency.p90_ms, prev.report.latency.p90_ms);
    let latency_p95_change_pct = pct_change(cur.report.latency.p95_ms, prev.report.latency.p95_ms);
    let latency_p99_change_pct = pct_change(cur.report.latency.p99_ms, prev.report.latency.p99_ms);

    let error_rate_change = current.error_rate() - previous.error_rate();
    let timeout_rate_change = current.timeout_rate() - previous.timeout_rate();

    let mut improvements = Vec::new();
    let mut regressions = Vec::new();

    // CPS: higher is better
    if cps_change_pct > 0.0 {
        improvements.push(format!("CPS improved by {:.1}%", cps_change_pct));
    } else if cps_change_pct < 0.0 {
        regressions.push(format!("CPS regressed by {:.1}%", cps_change_pct.abs()));
    }

    // Latency: lower is better
    for (name, change) in [
        ("p50 latency", latency_p50_change_pct),
        ("p90 latency", latency_p90_change_pct),
        ("p95 latency", latency_p95_change_pct),
        ("p99 latency", latency_p99_change_pct),
    ] {
        if change < 0.0 {
            improvements.push(format!("{} improved by {:.1}%", name, change.abs()));
        } else if change > 0.0 {
            regressions.push(format!("{} regressed by {:.1}%", name, change));
        }
    }

    for (name, change) in [
        ("Error rate", error_rate_change),
        ("Timeout rate", timeout_rate_change),
    ] {
        if change < 0.0 {
            improvements.push(format!("{} improved by {:.4}", name, change.abs()));
        } else if change > 0.0 {
            regressions.push(format!("{} regressed by {:.4}", name, change));
        }
    }

    ComparisonReport {
        cps_change_pct,
        latency_p50_change_pct,
        latency_p90_change_pct,
        latency_p95_change_pct,
        latency_p99_change_pct,
        error_rate_change,
        timeout_rate_change,
        improvements,
        regressions,
    }
}

#[cfg(test)]
pub mod generators {
    use super::*;
    use crate::config::generators::arb_config;
    use crate::stats::{EndReason, LatencyStats, RollupReport};
    use proptest::prelude::*;

    /// Quarter steps keep floats exact through JSON.
    fn arb_ms() -> impl Strategy<Value = f64> {
        (0u32..400_000).prop_map(|n| f64::from(n) / 4.0)
    }

    fn arb_end_reason() -> impl Strategy<Value = EndReason> {
        prop_oneof![
            Just(EndReason::TargetReached),
            Just(EndReason::SourceExhausted),
            Just(EndReason::Cancelled),
        ]
    }

    fn arb_latency() -> impl Strategy<Value = LatencyStats> {
        (0u64..10_000, arb_ms(), arb_ms(), arb_ms(), arb_ms(), arb_ms(), arb_ms(), arb_ms()).prop_map(
            |(count, min_ms, mean_ms, max_ms, p50_ms, p90_ms, p95_ms, p99_ms)| LatencyStats {
                count,
                min_ms,
                mean_ms,
                max_ms,
                p50_ms,
                p90_ms,
                p95_ms,
                p99_ms,
            },
        )
    }

    pub fn arb_summary() -> impl Strategy<Value = Summary> {
        let counts = (0u64..100_000, 0u64..100_000, 0u64..100_000);
        let reasons = prop::collection::btree_map(
            prop_oneof![
                Just("unexpected".to_string()),
                Just("transport".to_string()),
                Just("cancelled".to_string()),
            ],
            1u64..1000,
            0..3,
        );
        (counts, reasons, arb_latency(), arb_end_reason(), 0usize..10_000, arb_ms(), arb_ms()).prop_map(
            |((completed, failed, timed_out), failures_by_reason, latency, end_reason, peak_active, elapsed_secs, effective_cps)| {
                let total = completed + failed + timed_out;
                Summary {
                    end_reason,
                    peak_active,
                    elapsed_secs,
                    effective_cps,
                    report: RollupReport {
                        total,
                        completed,
                        failed,
                        timed_out,
                        failures_by_reason,
                        latency,
                        per_step: Vec::new(),
                        last_sequence: total.checked_sub(1),
                    },
                }
            },
        )
    }

    pub fn arb_run_report() -> impl Strategy<Value = RunReport> {
        (arb_config(), "[a-z]{1,12}", arb_summary(), 1_600_000_000u64..1_900_000_000).prop_map(
            |(config, scenario, summary, started)| RunReport {
                config,
                scenario,
                summary,
                started_at: started.to_string(),
                finished_at: (started + 60).to_string(),
            },
        )
    }
}
