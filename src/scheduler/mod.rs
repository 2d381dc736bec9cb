// Call scheduler module
//
// Admits dialogs under a rate budget and a concurrency ceiling, reaps them as
// they terminate, and closes the run with a Summary.

pub mod rate;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::PatternConfig;
use crate::data_source::DataSource;
use crate::dialog::{DialogContext, DialogInstance, FailureReason, Outcome};
use crate::error::SipFlowError;
use crate::scenario::ScenarioModel;
use crate::stats::{log_rollup, EndReason, RollupReport, StatSample, StatsAggregator, Summary};
use crate::transport::Transport;

use self::rate::{expected_calls, RateLimitState};

/// Receives each periodic rollup together with the active dialog count.
pub type RollupHandler = Box<dyn Fn(&RollupReport, usize) + Send + Sync>;

/// Calculate the admission tick based on target CPS.
///
/// `1_000_000 / target_cps` microseconds, clamped to 1ms..=100ms.
/// cps <= 0 returns the maximum.
pub fn calculate_send_interval(target_cps: f64) -> Duration {
    const MIN_INTERVAL: Duration = Duration::from_millis(1);
    const MAX_INTERVAL: Duration = Duration::from_millis(100);

    if target_cps <= 0.0 {
        return MAX_INTERVAL;
    }

    let interval_us = (1_000_000.0 / target_cps) as u64;
    let interval = Duration::from_micros(interval_us);

    if interval < MIN_INTERVAL {
        MIN_INTERVAL
    } else if interval > MAX_INTERVAL {
        MAX_INTERVAL
    } else {
        interval
    }
}

pub struct SchedulerOptions {
    pub pattern: PatternConfig,
    pub report_interval: Duration,
    /// How long to wait for active dialogs after cancellation before abandoning them.
    pub drain_timeout: Duration,
    pub on_rollup: Option<RollupHandler>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            pattern: PatternConfig::Constant,
            report_interval: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
            on_rollup: None,
        }
    }
}

pub struct CallScheduler {
    transport: Arc<dyn Transport>,
    stats: Arc<StatsAggregator>,
    shutdown: CancellationToken,
    ctx: Arc<DialogContext>,
    options: SchedulerOptions,
}

/// Row and start time of a dialog the scheduler has not reaped yet.
struct InFlight {
    row_index: usize,
    started: Instant,
}

impl CallScheduler {
    pub fn new(
        transport: Arc<dyn Transport>,
        stats: Arc<StatsAggregator>,
        shutdown: CancellationToken,
        ctx: Arc<DialogContext>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            transport,
            stats,
            shutdown,
            ctx,
            options,
        }
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    /// Run the scenario until `total_calls` dialogs are terminal, the source
    /// runs dry, or the shutdown token is cancelled.
    pub async fn run(
        &self,
        model: Arc<ScenarioModel>,
        source: &DataSource,
        calls_per_second: f64,
        concurrency_ceiling: usize,
        total_calls: u64,
    ) -> Result<Summary, SipFlowError> {
        check_run_parameters(&model, source, calls_per_second, concurrency_ceiling, total_calls)?;

        let mut state = RateLimitState::new(concurrency_ceiling, total_calls);
        let mut tasks: JoinSet<StatSample> = JoinSet::new();
        let mut in_flight: HashMap<u64, InFlight> = HashMap::new();

        let mut tick = interval(calculate_send_interval(calls_per_second));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let report_every = self.options.report_interval.max(Duration::from_millis(1));
        let mut report = interval_at(Instant::now() + report_every, report_every);

        tracing::info!(
            scenario = model.name(),
            rows = source.len(),
            cycling = source.is_cycling(),
            calls_per_second,
            concurrency_ceiling,
            total_calls,
            "scheduler started"
        );

        let start = Instant::now();
        let mut exhausted = false;
        let mut next_id: u64 = 0;
        let mut last_rollup: Option<(u64, RollupReport)> = None;

        let end_reason = loop {
            if state.target_reached() {
                break EndReason::TargetReached;
            }
            if exhausted && state.active() == 0 {
                break EndReason::SourceExhausted;
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    break EndReason::Cancelled;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.reap(joined, &mut state, &mut in_flight);
                }
                _ = tick.tick(), if !exhausted => {
                    let expected = expected_calls(&self.options.pattern, calls_per_second, start.elapsed());
                    let budget = state.rate_budget(expected);
                    for _ in 0..state.admissible(budget) {
                        let row = match source.next() {
                            Ok(row) => row,
                            Err(_) => {
                                tracing::info!(placed = state.placed(), "data source exhausted, no further admissions");
                                exhausted = true;
                                break;
                            }
                        };
                        if !state.admit() {
                            break;
                        }
                        in_flight.insert(next_id, InFlight { row_index: row.index, started: Instant::now() });
                        let dialog = DialogInstance::new(next_id, row);
                        tracing::debug!(dialog = next_id, call_id = dialog.call_id(), "admitting dialog");
                        next_id += 1;
                        tasks.spawn(dialog.run(
                            Arc::clone(&self.transport),
                            Arc::clone(&model),
                            Arc::clone(&self.ctx),
                            self.shutdown.clone(),
                        ));
                    }
                }
                _ = report.tick() => {
                    self.emit_rollup(state.active(), &mut last_rollup);
                }
            }
        };

        if end_reason == EndReason::Cancelled {
            self.drain(&mut tasks, &mut state, &mut in_flight).await;
        }

        tracing::info!(%end_reason, placed = state.placed(), peak_active = state.peak_active(), "scheduler finished");
        Ok(self.stats.finalize(end_reason, state.peak_active()))
    }

    fn reap(
        &self,
        joined: Result<StatSample, JoinError>,
        state: &mut RateLimitState,
        in_flight: &mut HashMap<u64, InFlight>,
    ) {
        state.release();
        match joined {
            Ok(sample) => {
                in_flight.remove(&sample.dialog_id);
                self.stats.record(sample);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                tracing::error!(error = %e, "dialog task did not finish");
            }
        }
    }

    /// Collect the dialogs still running after cancellation. They observe the
    /// same token and finish as cancelled; whatever is left when the drain
    /// timeout expires is aborted and recorded as cancelled.
    async fn drain(
        &self,
        tasks: &mut JoinSet<StatSample>,
        state: &mut RateLimitState,
        in_flight: &mut HashMap<u64, InFlight>,
    ) {
        let active = tasks.len();
        if active == 0 {
            return;
        }
        tracing::info!(active, "draining active dialogs");

        let drained = tokio::time::timeout(self.options.drain_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                self.reap(joined, state, in_flight);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(abandoned = tasks.len(), "drain timed out, aborting remaining dialogs");
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                self.reap(joined, state, in_flight);
            }
            for (dialog_id, dialog) in in_flight.drain() {
                self.stats.record(StatSample {
                    dialog_id,
                    row_index: dialog.row_index,
                    outcome: Outcome::Failed(FailureReason::Cancelled),
                    duration: dialog.started.elapsed(),
                    step_timings: Vec::new(),
                    sequence: 0,
                });
            }
        }
    }

    /// Log a rollup and pass it to the handler. Samples are only recorded
    /// from this loop, so an unchanged count means the last report still holds.
    fn emit_rollup(&self, active: usize, last: &mut Option<(u64, RollupReport)>) {
        let recorded = self.stats.recorded();
        let report = match last.take() {
            Some((seen, report)) if seen == recorded => report,
            _ => self.stats.snapshot(),
        };
        log_rollup(&report, active);
        if let Some(handler) = &self.options.on_rollup {
            handler(&report, active);
        }
        *last = Some((recorded, report));
    }
}

fn check_run_parameters(
    model: &ScenarioModel,
    source: &DataSource,
    calls_per_second: f64,
    concurrency_ceiling: usize,
    total_calls: u64,
) -> Result<(), SipFlowError> {
    let mut errors = Vec::new();
    if !(calls_per_second > 0.0) || !calls_per_second.is_finite() {
        errors.push("calls_per_second must be greater than 0".to_string());
    }
    if concurrency_ceiling == 0 {
        errors.push("concurrency_ceiling must be greater than 0".to_string());
    }
    if total_calls == 0 {
        errors.push("total_calls must be greater than 0".to_string());
    }
    if source.is_empty() {
        errors.push("data source has no rows".to_string());
    } else if source.min_row_width() < model.fields_required() {
        errors.push(format!(
            "scenario reads {} fields per row but the shortest data row has {}",
            model.fields_required(),
            source.min_row_width()
        ));
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(SipFlowError::ConfigError(errors.join("; ")))
    }
}
