// Dialog instance module
//
// One DialogInstance is one simulated call walking the scenario steps. It is
// owned by exactly one task, so its state needs no synchronization; only the
// cancellation token is shared.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use crate::data_source::VariableRow;
use crate::scenario::template::{self, RenderContext};
use crate::scenario::{BranchCondition, MatchRule, ScenarioModel, ScenarioStep};
use crate::sip::message::SipMessage;
use crate::stats::{StatSample, StepTiming};
use crate::transport::{RecvResult, Transport, TransportSession};

thread_local! {
    static FAST_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy());
}

/// Generate a unique Call-ID string
pub fn generate_call_id() -> String {
    FAST_RNG.with(|rng| {
        let val: u128 = rng.borrow_mut().gen();
        format!("{:032x}", val)
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Inbound message matched nothing in the expectation window.
    Unexpected(String),
    Transport(String),
    Template(String),
    StepLimit,
    Cancelled,
}

impl FailureReason {
    /// Stable key used to aggregate failures.
    pub fn kind(&self) -> &'static str {
        match self {
            FailureReason::Unexpected(_) => "unexpected",
            FailureReason::Transport(_) => "transport",
            FailureReason::Template(_) => "template",
            FailureReason::StepLimit => "step_limit",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Unexpected(detail) => write!(f, "unexpected message: {}", detail),
            FailureReason::Transport(detail) => write!(f, "transport failure: {}", detail),
            FailureReason::Template(detail) => write!(f, "template failure: {}", detail),
            FailureReason::StepLimit => f.write_str("step execution limit exceeded"),
            FailureReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Terminal result of a dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(FailureReason),
    TimedOut,
}

/// Dialog lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogState {
    Created,
    Running,
    Completed,
    Failed(FailureReason),
    TimedOut,
}

impl DialogState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DialogState::Created | DialogState::Running)
    }

    fn outcome(&self) -> Option<Outcome> {
        match self {
            DialogState::Completed => Some(Outcome::Completed),
            DialogState::Failed(reason) => Some(Outcome::Failed(reason.clone())),
            DialogState::TimedOut => Some(Outcome::TimedOut),
            DialogState::Created | DialogState::Running => None,
        }
    }
}

impl From<Outcome> for DialogState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Completed => DialogState::Completed,
            Outcome::Failed(reason) => DialogState::Failed(reason),
            Outcome::TimedOut => DialogState::TimedOut,
        }
    }
}

/// Run-wide settings every dialog reads.
#[derive(Debug, Clone)]
pub struct DialogContext {
    pub remote: SocketAddr,
    pub local: SocketAddr,
    pub media: SocketAddr,
    pub default_pause: Duration,
    /// Consecutive transport errors tolerated before the dialog fails.
    pub transport_error_limit: u32,
    pub max_step_executions: u64,
}

impl DialogContext {
    pub fn new(remote: SocketAddr, local: SocketAddr) -> Self {
        Self {
            remote,
            local,
            media: SocketAddr::new(local.ip(), 6000),
            default_pause: Duration::from_millis(1000),
            transport_error_limit: 3,
            max_step_executions: 10_000,
        }
    }
}

/// One `ExpectRecv` step of the current matching window.
struct WindowEntry<'m> {
    index: usize,
    rule: &'m MatchRule,
    optional: bool,
    deadline: Instant,
}

/// Terminal outcomes short-circuit step execution through `Err`.
type StepResult<T = ()> = Result<T, Outcome>;

pub struct DialogInstance {
    id: u64,
    call_id: String,
    row: Arc<VariableRow>,
    cursor: usize,
    counters: HashMap<String, u32>,
    state: DialogState,
    timings: Vec<StepTiming>,
    consecutive_errors: u32,
    last_message: Option<SipMessage>,
    media_log: Vec<String>,
    cseq: u32,
    steps_executed: u64,
    started: Instant,
}

impl fmt::Debug for DialogInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialogInstance")
            .field("id", &self.id)
            .field("call_id", &self.call_id)
            .field("row", &self.row.index)
            .field("cursor", &self.cursor)
            .field("state", &self.state)
            .finish()
    }
}

impl DialogInstance {
    pub fn new(id: u64, row: Arc<VariableRow>) -> Self {
        Self::with_call_id(id, generate_call_id(), row)
    }

    pub fn with_call_id(id: u64, call_id: String, row: Arc<VariableRow>) -> Self {
        Self {
            id,
            call_id,
            row,
            cursor: 0,
            counters: HashMap::new(),
            state: DialogState::Created,
            timings: Vec::new(),
            consecutive_errors: 0,
            last_message: None,
            media_log: Vec::new(),
            cseq: 0,
            steps_executed: 0,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn state(&self) -> &DialogState {
        &self.state
    }

    /// Media assets scheduled for playback, in order.
    pub fn media_log(&self) -> &[String] {
        &self.media_log
    }

    pub fn counter(&self, label: &str) -> u32 {
        self.counters.get(label).copied().unwrap_or(0)
    }

    /// Execute the scenario to a terminal state and hand back its sample.
    pub async fn run(
        mut self,
        transport: Arc<dyn Transport>,
        model: Arc<ScenarioModel>,
        ctx: Arc<DialogContext>,
        cancel: CancellationToken,
    ) -> StatSample {
        self.execute(transport.as_ref(), &model, &ctx, &cancel).await;
        self.into_sample()
    }

    /// Drive the dialog until it reaches a terminal state.
    ///
    /// Cancellation races the step loop; whichever step was pending is
    /// dropped along with its timer.
    pub async fn execute(
        &mut self,
        transport: &dyn Transport,
        model: &ScenarioModel,
        ctx: &DialogContext,
        cancel: &CancellationToken,
    ) -> Outcome {
        if let Some(outcome) = self.state.outcome() {
            return outcome;
        }
        self.started = Instant::now();

        let mut session = match transport.open(&self.call_id) {
            Ok(session) => session,
            Err(e) => {
                return self.finish(Outcome::Failed(FailureReason::Transport(e.to_string())));
            }
        };

        self.state = DialogState::Running;
        tracing::debug!(dialog = self.id, call_id = %self.call_id, row = self.row.index, "dialog running");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Outcome::Failed(FailureReason::Cancelled)),
            result = self.drive(session.as_mut(), model, ctx) => result,
        };
        session.close();

        self.finish(match result {
            Ok(()) => Outcome::Completed,
            Err(outcome) => outcome,
        })
    }

    fn finish(&mut self, outcome: Outcome) -> Outcome {
        match &outcome {
            Outcome::Completed => {
                tracing::debug!(dialog = self.id, call_id = %self.call_id, "dialog completed")
            }
            Outcome::TimedOut => tracing::debug!(
                dialog = self.id,
                call_id = %self.call_id,
                step = self.cursor,
                "dialog timed out"
            ),
            Outcome::Failed(reason) => tracing::debug!(
                dialog = self.id,
                call_id = %self.call_id,
                step = self.cursor,
                %reason,
                "dialog failed"
            ),
        }
        self.state = outcome.clone().into();
        outcome
    }

    /// Consume a terminal dialog into its statistics record.
    pub fn into_sample(self) -> StatSample {
        let outcome = self
            .state
            .outcome()
            .unwrap_or(Outcome::Failed(FailureReason::Cancelled));
        StatSample {
            dialog_id: self.id,
            row_index: self.row.index,
            outcome,
            duration: self.started.elapsed(),
            step_timings: self.timings,
            sequence: 0,
        }
    }

    async fn drive(
        &mut self,
        session: &mut dyn TransportSession,
        model: &ScenarioModel,
        ctx: &DialogContext,
    ) -> StepResult {
        while let Some(step) = model.step(self.cursor) {
            self.steps_executed += 1;
            if self.steps_executed > ctx.max_step_executions {
                return Err(Outcome::Failed(FailureReason::StepLimit));
            }

            let index = self.cursor;
            let step_started = Instant::now();
            let mut timed_step = index;

            match step {
                ScenarioStep::Send { template } => {
                    self.send_step(template, session, ctx).await?;
                    self.cursor += 1;
                }
                ScenarioStep::ExpectRecv { .. } => {
                    timed_step = self.expect_step(session, model, ctx).await?;
                }
                ScenarioStep::Pause { duration_ms } => {
                    let pause = duration_ms
                        .map(Duration::from_millis)
                        .unwrap_or(ctx.default_pause);
                    tokio::time::sleep(pause).await;
                    self.cursor += 1;
                }
                ScenarioStep::LoopMarker { label } => {
                    *self.counters.entry(label.clone()).or_insert(0) += 1;
                    self.cursor += 1;
                }
                ScenarioStep::Branch { condition, target } => {
                    if self.evaluate(condition)? {
                        self.cursor = model.label_index(target).ok_or_else(|| {
                            Outcome::Failed(FailureReason::Template(format!(
                                "branch target '{}' is not defined",
                                target
                            )))
                        })?;
                        tokio::task::yield_now().await;
                    } else {
                        self.cursor += 1;
                    }
                }
                ScenarioStep::PlayMedia { asset } => {
                    tracing::debug!(dialog = self.id, asset = %asset, "media playback scheduled");
                    self.media_log.push(asset.clone());
                    self.cursor += 1;
                }
            }

            self.timings.push(StepTiming {
                step: timed_step,
                latency: step_started.elapsed(),
            });
        }
        Ok(())
    }

    async fn send_step(
        &mut self,
        template: &str,
        session: &mut dyn TransportSession,
        ctx: &DialogContext,
    ) -> StepResult {
        // ACK and CANCEL reuse the CSeq number of the request they refer to.
        if let Some(method) = template::request_method(template) {
            if method != "ACK" && method != "CANCEL" {
                self.cseq += 1;
            }
        }

        let bytes = {
            let render_ctx = RenderContext {
                call_id: &self.call_id,
                call_number: self.id,
                cseq: self.cseq,
                local: ctx.local,
                remote: ctx.remote,
                media: ctx.media,
                row: &self.row,
                last_message: self.last_message.as_ref(),
            };
            template::render(template, &render_ctx)
        }
        .map_err(|e| Outcome::Failed(FailureReason::Template(e.to_string())))?;

        loop {
            match session.send(&bytes, ctx.remote).await {
                Ok(()) => {
                    self.consecutive_errors = 0;
                    return Ok(());
                }
                Err(e) => self.transport_error(&e.to_string(), ctx)?,
            }
        }
    }

    fn transport_error(&mut self, error: &str, ctx: &DialogContext) -> StepResult {
        self.consecutive_errors += 1;
        tracing::warn!(
            dialog = self.id,
            call_id = %self.call_id,
            attempt = self.consecutive_errors,
            error,
            "transport error"
        );
        if self.consecutive_errors >= ctx.transport_error_limit {
            return Err(Outcome::Failed(FailureReason::Transport(error.to_string())));
        }
        Ok(())
    }

    /// Steps an inbound message is matched against: every leading optional
    /// `ExpectRecv` from the cursor plus the first mandatory one.
    fn expect_window<'m>(&self, model: &'m ScenarioModel) -> Vec<WindowEntry<'m>> {
        let now = Instant::now();
        let mut window = Vec::new();
        for (index, step) in model.steps().iter().enumerate().skip(self.cursor) {
            let ScenarioStep::ExpectRecv {
                rule,
                timeout_ms,
                optional,
            } = step
            else {
                break;
            };
            window.push(WindowEntry {
                index,
                rule,
                optional: *optional,
                deadline: now + Duration::from_millis(*timeout_ms),
            });
            if !optional {
                break;
            }
        }
        window
    }

    /// Wait for a message matching the window; returns the step it matched.
    ///
    /// Every entry keeps its own deadline. An optional entry whose deadline
    /// has passed no longer matches; the wait itself ends at the mandatory
    /// entry's deadline, or at the last optional one when none is mandatory.
    async fn expect_step(
        &mut self,
        session: &mut dyn TransportSession,
        model: &ScenarioModel,
        ctx: &DialogContext,
    ) -> StepResult<usize> {
        let window = self.expect_window(model);
        let (Some(first), Some(last)) = (window.first(), window.last()) else {
            return Err(Outcome::Failed(FailureReason::Unexpected(
                "no expectation at cursor".to_string(),
            )));
        };
        let (first, last_index, all_optional) = (first.index, last.index, last.optional);
        let deadline = if all_optional {
            window.iter().map(|e| e.deadline).max().unwrap_or(last.deadline)
        } else {
            last.deadline
        };

        loop {
            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            let received = if remaining.is_zero() {
                Ok(RecvResult::TimedOut)
            } else {
                session.recv(remaining).await
            };

            match received {
                Ok(RecvResult::Message(msg)) => {
                    self.consecutive_errors = 0;
                    let now = Instant::now();
                    let live: Vec<&WindowEntry<'_>> = window
                        .iter()
                        .filter(|e| !e.optional || now < e.deadline)
                        .collect();
                    let Some(matched) = live.iter().find(|e| e.rule.matches(&msg)).map(|e| e.index) else {
                        let expected: Vec<String> = live.iter().map(|e| e.rule.to_string()).collect();
                        return Err(Outcome::Failed(FailureReason::Unexpected(format!(
                            "received {} while expecting {}",
                            msg.summary(),
                            expected.join(" or ")
                        ))));
                    };
                    tracing::debug!(
                        dialog = self.id,
                        step = matched,
                        message = %msg.summary(),
                        "expectation matched"
                    );
                    self.last_message = Some(msg);
                    self.cursor = matched + 1;
                    return Ok(matched);
                }
                Ok(RecvResult::TimedOut) if all_optional => {
                    self.cursor = last_index + 1;
                    return Ok(first);
                }
                Ok(RecvResult::TimedOut) => {
                    self.cursor = last_index;
                    return Err(Outcome::TimedOut);
                }
                Err(e) => self.transport_error(&e.to_string(), ctx)?,
            }
        }
    }

    fn evaluate(&self, condition: &BranchCondition) -> StepResult<bool> {
        let field = |n: usize| {
            self.row.field(n).ok_or_else(|| {
                Outcome::Failed(FailureReason::Template(format!(
                    "branch condition references field {} but the row has {} fields",
                    n,
                    self.row.fields.len()
                )))
            })
        };
        Ok(match condition {
            BranchCondition::Always => true,
            BranchCondition::FieldEquals { field: n, value } => field(*n)? == value.as_str(),
            BranchCondition::FieldNotEquals { field: n, value } => field(*n)? != value.as_str(),
            BranchCondition::CounterBelow { label, limit } => self.counter(label) < *limit,
        })
    }
}
