// Statistics aggregator module

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::dialog::Outcome;

/// Latency of one executed step. A step inside a loop appears once per pass.
#[derive(Debug, Clone, PartialEq)]
pub struct StepTiming {
    pub step: usize,
    pub latency: Duration,
}

/// Terminal record of one dialog. Never mutated after `record`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatSample {
    pub dialog_id: u64,
    pub row_index: usize,
    pub outcome: Outcome,
    pub duration: Duration,
    pub step_timings: Vec<StepTiming>,
    /// Assigned by `StatsAggregator::record`.
    pub sequence: u64,
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    TargetReached,
    SourceExhausted,
    Cancelled,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndReason::TargetReached => "target reached",
            EndReason::SourceExhausted => "data source exhausted",
            EndReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Latency distribution in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: u64,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl LatencyStats {
    pub fn from_durations(latencies: &[Duration]) -> Self {
        if latencies.is_empty() {
            return Self::default();
        }
        let ms = |d: Duration| d.as_nanos() as f64 / 1_000_000.0;
        let (p50, p90, p95, p99) = calculate_percentiles(latencies);
        let total: Duration = latencies.iter().sum();
        let min = latencies.iter().min().copied().unwrap_or_default();
        let max = latencies.iter().max().copied().unwrap_or_default();
        Self {
            count: latencies.len() as u64,
            min_ms: ms(min),
            mean_ms: ms(total) / latencies.len() as f64,
            max_ms: ms(max),
            p50_ms: ms(p50),
            p90_ms: ms(p90),
            p95_ms: ms(p95),
            p99_ms: ms(p99),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLatency {
    pub step: usize,
    pub latency: LatencyStats,
}

/// Rollup computed purely from recorded samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollupReport {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub failures_by_reason: BTreeMap<String, u64>,
    /// Call duration over completed dialogs.
    pub latency: LatencyStats,
    pub per_step: Vec<StepLatency>,
    /// Highest sequence number included.
    pub last_sequence: Option<u64>,
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub end_reason: EndReason,
    pub peak_active: usize,
    pub elapsed_secs: f64,
    pub effective_cps: f64,
    pub report: RollupReport,
}

impl Summary {
    pub fn total(&self) -> u64 {
        self.report.total
    }

    /// Count of failures whose reason kind is `reason`, e.g. "cancelled".
    pub fn failures(&self, reason: &str) -> u64 {
        self.report
            .failures_by_reason
            .get(reason)
            .copied()
            .unwrap_or(0)
    }
}

/// Thread-safe, append-only sample store.
/// Samples go to sharded buffers to reduce lock contention under high
/// concurrency; outcome counters are atomics.
pub struct StatsAggregator {
    shards: Vec<Mutex<Vec<StatSample>>>,
    shard_count: usize,
    next_sequence: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    start_time: Instant,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        let shard_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let shards = (0..shard_count).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            shards,
            shard_count,
            next_sequence: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Append a sample, stamping it with the next sequence number.
    pub fn record(&self, mut sample: StatSample) -> u64 {
        let seq = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        sample.sequence = seq;
        let counter = match sample.outcome {
            Outcome::Completed => &self.completed,
            Outcome::Failed(_) => &self.failed,
            Outcome::TimedOut => &self.timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let idx = self.shard_index();
        self.shards[idx]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sample);
        seq
    }

    /// Select a shard based on the current thread ID.
    fn shard_index(&self) -> usize {
        let thread_id = std::thread::current().id();
        let hash = format!("{:?}", thread_id);
        let mut h: usize = 0;
        for b in hash.bytes() {
            h = h.wrapping_mul(31).wrapping_add(b as usize);
        }
        h % self.shard_count
    }

    /// Samples recorded so far, merged from all shards, in sequence order.
    pub fn samples(&self) -> Vec<StatSample> {
        let mut all = Vec::new();
        for shard in &self.shards {
            let guard = shard.lock().unwrap_or_else(|e| e.into_inner());
            all.extend_from_slice(&guard);
        }
        all.sort_by_key(|s| s.sequence);
        all
    }

    /// Terminal dialogs recorded so far, without merging shards.
    pub fn recorded(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
            + self.failed.load(Ordering::Relaxed)
            + self.timed_out.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RollupReport {
        rollup(&self.samples())
    }

    /// Close out the run: rollup over every sample plus elapsed time and the
    /// effective call rate.
    pub fn finalize(&self, end_reason: EndReason, peak_active: usize) -> Summary {
        let report = self.snapshot();
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let effective_cps = if elapsed > 0.0 {
            report.total as f64 / elapsed
        } else {
            0.0
        };
        Summary {
            end_reason,
            peak_active,
            elapsed_secs: elapsed,
            effective_cps,
            report,
        }
    }
}

/// Build a rollup from samples sorted by sequence.
pub fn rollup(samples: &[StatSample]) -> RollupReport {
    let mut report = RollupReport {
        total: samples.len() as u64,
        last_sequence: samples.last().map(|s| s.sequence),
        ..Default::default()
    };

    let mut durations = Vec::new();
    let mut steps: BTreeMap<usize, Vec<Duration>> = BTreeMap::new();
    for sample in samples {
        match &sample.outcome {
            Outcome::Completed => {
                report.completed += 1;
                durations.push(sample.duration);
            }
            Outcome::Failed(reason) => {
                report.failed += 1;
                *report
                    .failures_by_reason
                    .entry(reason.kind().to_string())
                    .or_insert(0) += 1;
            }
            Outcome::TimedOut => report.timed_out += 1,
        }
        for timing in &sample.step_timings {
            steps.entry(timing.step).or_default().push(timing.latency);
        }
    }

    report.latency = LatencyStats::from_durations(&durations);
    report.per_step = steps
        .into_iter()
        .map(|(step, latencies)| StepLatency {
            step,
            latency: LatencyStats::from_durations(&latencies),
        })
        .collect();
    report
}

/// Calculate percentiles from a slice of durations.
/// Returns (p50, p90, p95, p99). Returns Duration::ZERO for empty input.
pub fn calculate_percentiles(latencies: &[Duration]) -> (Duration, Duration, Duration, Duration) {
    if latencies.is_empty() {
        return (
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
        );
    }

    let mut sorted = latencies.to_vec();
    sorted.sort();

    let len = sorted.len();
    let p50 = percentile_at(&sorted, len, 50.0);
    let p90 = percentile_at(&sorted, len, 90.0);
    let p95 = percentile_at(&sorted, len, 95.0);
    let p99 = percentile_at(&sorted, len, 99.0);

    (p50, p90, p95, p99)
}

/// Get the value at a given percentile from a sorted slice using nearest-rank method.
fn percentile_at(sorted: &[Duration], len: usize, pct: f64) -> Duration {
    if len == 1 {
        return sorted[0];
    }
    // Nearest-rank: index = ceil(pct/100 * len) - 1
    let rank = (pct / 100.0 * len as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(len - 1);
    sorted[idx]
}

/// Emit a periodic rollup as a log line.
pub fn log_rollup(report: &RollupReport, active: usize) {
    let reasons: Vec<String> = report
        .failures_by_reason
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect();
    tracing::info!(
        total = report.total,
        completed = report.completed,
        failed = report.failed,
        timed_out = report.timed_out,
        active,
        p50_ms = report.latency.p50_ms,
        p99_ms = report.latency.p99_ms,
        reasons = %reasons.join(","),
        "rollup"
    );
}

/// Display a final result summary.
pub fn display_final_summary(summary: &Summary) {
    let report = &summary.report;
    println!("=== Final Result Summary ===");
    println!("End Reason:       {}", summary.end_reason);
    println!("Total Calls:      {}", report.total);
    println!("Completed:        {}", report.completed);
    println!("Failed:           {}", report.failed);
    println!("Timed Out:        {}", report.timed_out);
    println!("Peak Active:      {}", summary.peak_active);
    println!("Elapsed:          {:.1}s", summary.elapsed_secs);
    println!("Effective CPS:    {:.1}", summary.effective_cps);
    println!(
        "Latency min: {:.1}ms | mean: {:.1}ms | max: {:.1}ms",
        report.latency.min_ms, report.latency.mean_ms, report.latency.max_ms,
    );
    println!(
        "Latency p50: {:.1}ms | p90: {:.1}ms | p95: {:.1}ms | p99: {:.1}ms",
        report.latency.p50_ms, report.latency.p90_ms, report.latency.p95_ms, report.latency.p99_ms,
    );
    if !report.failures_by_reason.is_empty() {
        println!("Failure Reasons:");
        for (reason, count) in &report.failures_by_reason {
            println!("  {}: {}", reason, count);
        }
    }
    if !report.per_step.is_empty() {
        println!("Per-step p50/p99:");
        for step in &report.per_step {
            println!(
                "  step {:>3}: {:.1}ms / {:.1}ms ({} samples)",
                step.step, step.latency.p50_ms, step.latency.p99_ms, step.latency.count
            );
        }
    }
    println!("============================");
}
