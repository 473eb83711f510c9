//! orchestrator.rs
//! The experiment state machine. Runs on its own (control) thread.
//!
//! Idle -> ReadyToStart -> TrialRunning -> TrialFinished -> ... -> Resting -> ReadyToStart
//! -> ... -> Finished, with Stopped reachable from every non-terminal state.
//!
//! Every wait (subject id, operator confirmation, trial completion, feedback and rest
//! timers) is a crossbeam select over the wait's own event plus the stop signal and the
//! operator channel, so an emergency stop interrupts whatever the orchestrator is doing.
//! Any error ends the session in Stopped after the shutdown sequence:
//! routing off -> log drained and closed -> receiver stopped.

use crossbeam::channel::{after, never, select, Receiver, Sender};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{fmt, sync::Arc, time::Duration};
use log::{debug, error, info, warn};

use crate::display::RenderState;
use crate::link::{
    codec::{Position, LOG_HEADER},
    command::{CommandChannel, TrialCommand},
    receiver::TelemetryReceiver,
};
use crate::session::{
    cursor::CursorBridge,
    logger::EventLogger,
    router::{LiveState, TrialRouter},
    signal::{completion, CompletionSetter, CompletionWaiter, StopSignal},
};
use crate::utils::{
    config::ExperimentConfig,
    error::{ExperimentError, Result},
    export::{write_session_summary, BlockOutcome, BlockSummary},
    metrics::{MetricsSnapshot, SharedMetrics},
};

pub const FEEDBACK_NOTICE: &str = "Great!";
const REST_COUNTDOWN_STEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExperimentState {
    Idle,
    ReadyToStart,
    TrialRunning,
    TrialFinished,
    Resting,
    Finished,
    Stopped,
}

impl ExperimentState {
    /// Name as written to the ExperimentState column of the block log.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentState::Idle => "Idle",
            ExperimentState::ReadyToStart => "ReadyToStart",
            ExperimentState::TrialRunning => "TrialRunning",
            ExperimentState::TrialFinished => "TrialFinished",
            ExperimentState::Resting => "Resting",
            ExperimentState::Finished => "Finished",
            ExperimentState::Stopped => "Stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentState::Finished | ExperimentState::Stopped)
    }
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input from the operator console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorSignal {
    Subject(String),
    StartBlock,
    NextBlock,
    EmergencyStop,
}

impl OperatorSignal {
    /// Maps one console line to a signal. Keywords are case-insensitive; `id <ID>`
    /// always names a subject (so an id may spell a keyword, e.g. `id S`), and any
    /// other non-keyword text is taken as a subject id too.
    pub fn parse(line: &str) -> Option<OperatorSignal> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("id ") {
            // ASCII lowercasing keeps byte offsets, so the prefix is 3 bytes in `line` too.
            return Some(OperatorSignal::Subject(line[3..].trim().to_string()));
        }
        let signal = match lower.as_str() {
            "start" | "s" => OperatorSignal::StartBlock,
            "next" | "n" => OperatorSignal::NextBlock,
            "stop" | "x" | "esc" | "q" => OperatorSignal::EmergencyStop,
            _ => OperatorSignal::Subject(line.to_string()),
        };
        Some(signal)
    }
}

/// One trial's identity, targets and completion latch. Built fresh for every trial.
#[derive(Debug)]
pub struct TrialContext {
    pub block: u32,
    pub trial: u32,
    pub start: Position,
    pub end: Position,
    setter: CompletionSetter,
    waiter: CompletionWaiter,
}

impl TrialContext {
    /// Start lands within 1 of (-3, -3); end anywhere in x in [-4.5, 4.5], y in [-0.5, 0.5].
    pub fn random<R: Rng>(block: u32, trial: u32, rng: &mut R) -> Self {
        let start = Position::new(
            -3.0 + rng.random_range(-1.0..=1.0f32),
            -3.0 + rng.random_range(-1.0..=1.0f32),
        );
        let end = Position::new(rng.random_range(-4.5..=4.5f32), rng.random_range(-0.5..=0.5f32));
        let (setter, waiter) = completion();
        Self { block, trial, start, end, setter, waiter }
    }

    pub fn command(&self) -> TrialCommand {
        TrialCommand::StartTrial { start: self.start, end: self.end }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub final_state: ExperimentState,
    pub blocks: Vec<BlockSummary>,
    /// What ended the session early; None when it reached Finished.
    pub error: Option<ExperimentError>,
}

struct BlockProgress {
    block: u32,
    trials_completed: u32,
    baseline: MetricsSnapshot,
}

pub struct TrialOrchestrator {
    config: ExperimentConfig,
    receiver: Arc<TelemetryReceiver>,
    commands: CommandChannel,
    logger: Arc<EventLogger>,
    live: Arc<LiveState>,
    operator: Receiver<OperatorSignal>,
    stop: StopSignal,
    display: Sender<RenderState>,
    metrics: SharedMetrics,
    rng: StdRng,
    screen: RenderState,
    subject: Option<String>,
    progress: Option<BlockProgress>,
    blocks: Vec<BlockSummary>,
    shut_down: bool,
}

impl TrialOrchestrator {
    /// Wires a [`TrialRouter`] onto `receiver`; it must not have been started yet.
    pub fn new(
        config: ExperimentConfig,
        receiver: Arc<TelemetryReceiver>,
        cursor: Arc<CursorBridge>,
        operator: Receiver<OperatorSignal>,
        display: Sender<RenderState>,
        metrics: SharedMetrics,
    ) -> Self {
        let logger = Arc::new(EventLogger::new(metrics.clone()));
        let live = Arc::new(LiveState::new());
        receiver.subscribe(Arc::new(TrialRouter::new(
            live.clone(),
            logger.clone(),
            cursor,
            metrics.clone(),
        )));

        let commands = CommandChannel::new(config.command_addr(), config.connect_timeout);
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let screen = RenderState::new(
            ExperimentState::Idle,
            config.total_blocks,
            config.trials_per_block,
        );

        Self {
            config,
            receiver,
            commands,
            logger,
            live,
            operator,
            stop: StopSignal::new(),
            display,
            metrics,
            rng,
            screen,
            subject: None,
            progress: None,
            blocks: Vec::new(),
            shut_down: false,
        }
    }

    /// Emergency stop usable from any thread, before or during `run`.
    pub fn stop_handle(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn live(&self) -> Arc<LiveState> {
        self.live.clone()
    }

    /// Drives the whole session and returns once it is Finished or Stopped.
    pub fn run(mut self) -> RunReport {
        info!("[Orchestrator] session starting ({} blocks x {} trials)",
            self.config.total_blocks, self.config.trials_per_block);

        let outcome = self.session();
        let final_state = match &outcome {
            Ok(()) => ExperimentState::Finished,
            Err(e) => {
                if e.is_operator_abort() {
                    warn!("[Orchestrator] emergency stop");
                } else {
                    error!("[Orchestrator] session aborted: {}", e);
                }
                self.emergency_stop(e);
                ExperimentState::Stopped
            }
        };

        if let Some(subject) = &self.subject {
            if !self.blocks.is_empty() {
                if let Err(e) = write_session_summary(self.config.summary_path(subject), &self.blocks) {
                    error!("[Orchestrator] summary not written: {}", e);
                }
            }
        }

        info!("[Orchestrator] session ended in {}", final_state);
        RunReport { final_state, blocks: self.blocks, error: outcome.err() }
    }

    fn session(&mut self) -> Result<()> {
        self.show(ExperimentState::Idle);
        let subject = self.await_subject()?;
        self.subject = Some(subject.clone());

        let addr = self.receiver.start(self.config.udp_port)?;
        info!("[Orchestrator] subject '{}', telemetry on {}", subject, addr);

        for block in 1..=self.config.total_blocks {
            self.run_block(&subject, block)?;
            if block < self.config.total_blocks {
                self.rest(block)?;
            }
        }

        self.live.set_state(ExperimentState::Finished);
        self.screen.notice = None;
        self.show(ExperimentState::Finished);
        self.receiver.stop();
        self.shut_down = true;
        Ok(())
    }

    fn run_block(&mut self, subject: &str, block: u32) -> Result<()> {
        self.live.set_block(block);
        self.live.set_state(ExperimentState::ReadyToStart);
        self.screen.block = block;
        self.screen.trial = 0;
        self.screen.start = None;
        self.screen.end = None;
        self.screen.notice = None;
        self.show(ExperimentState::ReadyToStart);

        self.await_operator(ExperimentState::ReadyToStart, |s| *s == OperatorSignal::StartBlock)?;

        self.logger.open(self.config.block_log_path(subject, block), LOG_HEADER)?;
        self.progress = Some(BlockProgress {
            block,
            trials_completed: 0,
            baseline: self.metrics.snapshot(),
        });
        info!("[Orchestrator] block {} started", block);

        for trial in 1..=self.config.trials_per_block {
            self.run_trial(block, trial)?;
            if let Some(progress) = self.progress.as_mut() {
                progress.trials_completed += 1;
            }
        }

        let lines = self.logger.close()?.map_or(0, |r| r.lines_written);
        self.record_block(lines, BlockOutcome::Completed);
        info!("[Orchestrator] block {} complete", block);
        Ok(())
    }

    fn run_trial(&mut self, block: u32, trial: u32) -> Result<()> {
        let ctx = TrialContext::random(block, trial, &mut self.rng);
        self.live.begin_trial(block, trial);
        self.screen.trial = trial;
        self.screen.start = Some(ctx.start);
        self.screen.end = Some(ctx.end);
        self.screen.armed = false;
        self.screen.notice = None;
        self.show(ExperimentState::TrialRunning);

        self.commands.send_trial(&ctx.command())?;

        let TrialContext { setter, waiter, .. } = ctx;
        self.live.arm(setter);
        self.screen.armed = true;
        self.show(ExperimentState::TrialRunning);

        self.await_completion(waiter, block, trial)?;
        debug!("[Orchestrator] block {} trial {} complete", block, trial);

        // The router already moved the snapshot when it fired the latch; this is a no-op then.
        self.live.set_state(ExperimentState::TrialFinished);
        self.screen.armed = false;
        self.screen.notice = Some(FEEDBACK_NOTICE.to_string());
        self.show(ExperimentState::TrialFinished);
        self.pause(self.config.feedback)
    }

    fn rest(&mut self, block: u32) -> Result<()> {
        self.live.set_state(ExperimentState::Resting);
        self.screen.trial = 0;
        self.screen.start = None;
        self.screen.end = None;

        let mut remaining = self.config.rest;
        while !remaining.is_zero() {
            self.screen.notice = Some(format!("Rest: {}s", remaining.as_secs_f64().ceil() as u64));
            self.show(ExperimentState::Resting);
            let step = remaining.min(REST_COUNTDOWN_STEP);
            self.pause(step)?;
            remaining -= step;
        }

        self.screen.notice = Some(format!("Type 'next' to continue to block {}.", block + 1));
        self.show(ExperimentState::Resting);
        self.await_operator(ExperimentState::Resting, |s| *s == OperatorSignal::NextBlock)?;
        Ok(())
    }

    fn await_subject(&mut self) -> Result<String> {
        loop {
            if let OperatorSignal::Subject(id) =
                self.await_operator(ExperimentState::Idle, |s| matches!(s, OperatorSignal::Subject(_)))?
            {
                let id = id.trim();
                if !id.is_empty() {
                    return Ok(id.to_string());
                }
                debug!("[Orchestrator] empty subject id ignored");
            }
        }
    }

    /// Blocks until the operator sends a signal `accept` takes. Anything else is ignored.
    fn await_operator(
        &mut self,
        state: ExperimentState,
        accept: impl Fn(&OperatorSignal) -> bool,
    ) -> Result<OperatorSignal> {
        loop {
            select! {
                recv(self.stop.receiver()) -> _ => return Err(ExperimentError::OperatorAbort),
                recv(self.operator) -> msg => match msg {
                    Ok(signal) if accept(&signal) => return Ok(signal),
                    other => self.unexpected_signal(state, other)?,
                },
            }
        }
    }

    fn await_completion(&mut self, waiter: CompletionWaiter, block: u32, trial: u32) -> Result<()> {
        let timeout = self.config.trial_timeout;
        let deadline = timeout.map(after).unwrap_or_else(never);
        loop {
            select! {
                recv(waiter.receiver()) -> done => return match done {
                    Ok(()) => Ok(()),
                    // Only the live snapshot holds the setter, and only we disarm it.
                    Err(_) => Err(ExperimentError::SessionClosed),
                },
                recv(self.stop.receiver()) -> _ => return Err(ExperimentError::OperatorAbort),
                recv(self.operator) -> msg => self.unexpected_signal(ExperimentState::TrialRunning, msg)?,
                recv(deadline) -> _ => {
                    return Err(ExperimentError::TrialTimeout {
                        block,
                        trial,
                        timeout: timeout.unwrap_or_default(),
                    });
                }
            }
        }
    }

    /// Cancellable sleep.
    fn pause(&mut self, duration: Duration) -> Result<()> {
        let deadline = after(duration);
        let state = self.screen.state;
        loop {
            select! {
                recv(deadline) -> _ => return Ok(()),
                recv(self.stop.receiver()) -> _ => return Err(ExperimentError::OperatorAbort),
                recv(self.operator) -> msg => self.unexpected_signal(state, msg)?,
            }
        }
    }

    /// EmergencyStop and a hung-up operator channel abort; other signals are dropped.
    fn unexpected_signal<E>(
        &self,
        state: ExperimentState,
        msg: std::result::Result<OperatorSignal, E>,
    ) -> Result<()> {
        match msg {
            Ok(OperatorSignal::EmergencyStop) => Err(ExperimentError::OperatorAbort),
            Ok(signal) => {
                warn!("[Orchestrator] {:?} ignored in {}", signal, state);
                Ok(())
            }
            Err(_) => {
                warn!("[Orchestrator] operator input closed");
                Err(ExperimentError::OperatorAbort)
            }
        }
    }

    /// Idempotent. Routing stops first, then the log is drained, then the socket closes.
    fn emergency_stop(&mut self, reason: &ExperimentError) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.stop.trigger();

        self.live.set_state(ExperimentState::Stopped);

        let lines = match self.logger.close() {
            Ok(report) => report.map_or(0, |r| r.lines_written),
            Err(e) => {
                error!("[Orchestrator] log close during stop: {}", e);
                0
            }
        };
        self.record_block(lines, BlockOutcome::Stopped);

        self.receiver.stop();

        self.screen.armed = false;
        self.screen.notice = if reason.is_operator_abort() {
            None
        } else {
            Some(reason.to_string())
        };
        self.show(ExperimentState::Stopped);
    }

    fn record_block(&mut self, lines_written: u64, outcome: BlockOutcome) {
        let (Some(progress), Some(subject)) = (self.progress.take(), self.subject.as_ref()) else {
            return;
        };
        let delta = self.metrics.snapshot().since(&progress.baseline);
        self.blocks.push(BlockSummary {
            subject: subject.clone(),
            block: progress.block,
            trials_completed: progress.trials_completed,
            lines_written,
            datagrams: delta.datagrams,
            malformed: delta.malformed,
            outcome,
        });
    }

    fn show(&mut self, state: ExperimentState) {
        self.screen.state = state;
        // The display may already be gone; the session does not depend on it.
        let _ = self.display.send(self.screen.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::metrics::LinkMetrics;
    use crossbeam::channel::unbounded;
    use std::time::Instant;

    #[test]
    fn state_names_match_log_column() {
        let names: Vec<&str> = [
            ExperimentState::Idle,
            ExperimentState::ReadyToStart,
            ExperimentState::TrialRunning,
            ExperimentState::TrialFinished,
            ExperimentState::Resting,
            ExperimentState::Finished,
            ExperimentState::Stopped,
        ]
        .iter()
        .map(|s| s.as_str())
        .collect();
        assert_eq!(
            names,
            vec!["Idle", "ReadyToStart", "TrialRunning", "TrialFinished", "Resting", "Finished", "Stopped"]
        );
        assert_eq!(ExperimentState::Resting.to_string(), "Resting");
        assert!(ExperimentState::Stopped.is_terminal());
        assert!(!ExperimentState::TrialFinished.is_terminal());
    }

    #[test]
    fn operator_lines_parse() {
        assert_eq!(OperatorSignal::parse("  START "), Some(OperatorSignal::StartBlock));
        assert_eq!(OperatorSignal::parse("n"), Some(OperatorSignal::NextBlock));
        assert_eq!(OperatorSignal::parse("esc"), Some(OperatorSignal::EmergencyStop));
        assert_eq!(OperatorSignal::parse("S07"), Some(OperatorSignal::Subject("S07".to_string())));
        assert_eq!(OperatorSignal::parse("   "), None);
    }

    #[test]
    fn id_prefix_allows_keyword_lookalike_subjects() {
        for id in ["S", "n", "X", "q", "stop"] {
            assert_eq!(
                OperatorSignal::parse(&format!("id {}", id)),
                Some(OperatorSignal::Subject(id.to_string()))
            );
        }
        assert_eq!(OperatorSignal::parse("ID  s07 "), Some(OperatorSignal::Subject("s07".to_string())));
        // A bare keyword is still a command.
        assert_eq!(OperatorSignal::parse("x"), Some(OperatorSignal::EmergencyStop));
    }

    #[test]
    fn targets_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for trial in 1..=500 {
            let ctx = TrialContext::random(1, trial, &mut rng);
            assert!((-4.0..=-2.0).contains(&ctx.start.x) && (-4.0..=-2.0).contains(&ctx.start.y));
            assert!((-4.5..=4.5).contains(&ctx.end.x) && (-0.5..=0.5).contains(&ctx.end.y));
        }
    }

    #[test]
    fn seeded_targets_are_reproducible() {
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let (x, y) = (TrialContext::random(1, 1, &mut a), TrialContext::random(1, 1, &mut b));
        assert_eq!((x.start, x.end), (y.start, y.end));
    }

    fn idle_orchestrator() -> (TrialOrchestrator, Sender<OperatorSignal>, Receiver<RenderState>) {
        let metrics = LinkMetrics::shared();
        let receiver = Arc::new(TelemetryReceiver::new(metrics.clone(), Duration::from_millis(500)));
        let (op_tx, op_rx) = unbounded();
        let (screen_tx, screen_rx) = unbounded();
        let dir = std::env::temp_dir();
        let config = ExperimentConfig { udp_port: 0, log_dir: dir, ..Default::default() };
        let orch = TrialOrchestrator::new(
            config,
            receiver,
            Arc::new(CursorBridge::new()),
            op_rx,
            screen_tx,
            metrics,
        );
        (orch, op_tx, screen_rx)
    }

    #[test]
    fn stop_handle_ends_idle_session() {
        let (orch, _op, screens) = idle_orchestrator();
        orch.stop_handle().trigger();
        let report = orch.run();
        assert_eq!(report.final_state, ExperimentState::Stopped);
        assert!(report.error.unwrap().is_operator_abort());
        assert!(report.blocks.is_empty());
        let last = screens.try_iter().last().unwrap();
        assert_eq!(last.state, ExperimentState::Stopped);
    }

    #[test]
    fn operator_hangup_is_an_abort() {
        let (orch, op, _screens) = idle_orchestrator();
        drop(op);
        let begun = Instant::now();
        let report = orch.run();
        assert_eq!(report.final_state, ExperimentState::Stopped);
        assert!(report.error.unwrap().is_operator_abort());
        assert!(begun.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn signals_out_of_place_are_ignored() {
        let (orch, op, screens) = idle_orchestrator();
        let live = orch.live();
        op.send(OperatorSignal::StartBlock).unwrap();
        op.send(OperatorSignal::NextBlock).unwrap();
        op.send(OperatorSignal::Subject("  ".to_string())).unwrap();
        op.send(OperatorSignal::EmergencyStop).unwrap();

        let report = orch.run();
        assert_eq!(report.final_state, ExperimentState::Stopped);
        assert_eq!(live.state(), ExperimentState::Stopped);
        // Nothing moved the session out of Idle before the stop.
        assert!(screens
            .try_iter()
            .all(|s| matches!(s.state, ExperimentState::Idle | ExperimentState::Stopped)));
    }
}
