//! router.rs
//! The orchestrator's telemetry subscriber. Runs on the receive thread.
//!
//! Each record is attributed to the state and trial live at the moment it arrives:
//! the router holds the live snapshot's upgradable read guard while it hands the record
//! off, and the orchestrator needs the write guard to change state, so a transition can
//! never split one record's attribution. An armed finish flag moves the snapshot to
//! TrialFinished in the same critical section, before the orchestrator wakes. Hand-offs are all O(1): log queue push, cursor
//! overwrite, latch set.

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::sync::Arc;
use log::{debug, trace};

use crate::link::{codec::MovementRecord, receiver::TelemetrySink};
use crate::session::{
    cursor::CursorBridge,
    logger::EventLogger,
    orchestrator::ExperimentState,
    signal::CompletionSetter,
};
use crate::utils::metrics::SharedMetrics;

/// What the receive thread needs to know about the experiment right now.
#[derive(Debug, Clone)]
pub struct LiveSnapshot {
    pub state: ExperimentState,
    pub block: u32,
    pub trial: u32,
    /// Present only once the trial's start command has been sent.
    pub completion: Option<CompletionSetter>,
}

/// Snapshot written by the orchestrator, read by the router.
#[derive(Debug)]
pub struct LiveState {
    inner: RwLock<LiveSnapshot>,
}

impl Default for LiveState {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LiveSnapshot {
                state: ExperimentState::Idle,
                block: 0,
                trial: 0,
                completion: None,
            }),
        }
    }

    pub fn state(&self) -> ExperimentState {
        self.inner.read().state
    }

    pub fn snapshot(&self) -> LiveSnapshot {
        self.inner.read().clone()
    }

    /// Moves to `state`; any armed completion latch is disarmed.
    pub(crate) fn set_state(&self, state: ExperimentState) {
        let mut live = self.inner.write();
        live.state = state;
        live.completion = None;
    }

    /// Enters a new trial: positions and state change together, latch disarmed.
    pub(crate) fn begin_trial(&self, block: u32, trial: u32) {
        let mut live = self.inner.write();
        live.state = ExperimentState::TrialRunning;
        live.block = block;
        live.trial = trial;
        live.completion = None;
    }

    pub(crate) fn set_block(&self, block: u32) {
        self.inner.write().block = block;
    }

    /// Makes the trial's finish flag observable.
    pub(crate) fn arm(&self, setter: CompletionSetter) {
        self.inner.write().completion = Some(setter);
    }
}

pub struct TrialRouter {
    live: Arc<LiveState>,
    logger: Arc<EventLogger>,
    cursor: Arc<CursorBridge>,
    metrics: SharedMetrics,
}

impl TrialRouter {
    pub fn new(
        live: Arc<LiveState>,
        logger: Arc<EventLogger>,
        cursor: Arc<CursorBridge>,
        metrics: SharedMetrics,
    ) -> Self {
        Self { live, logger, cursor, metrics }
    }
}

impl TelemetrySink for TrialRouter {
    fn deliver(&self, record: &MovementRecord) {
        // Only the receive thread takes the upgradable guard.
        let live = self.live.inner.upgradable_read();

        if live.state != ExperimentState::TrialRunning {
            self.metrics.record_discarded();
            trace!("[TrialRouter] discarding record in {}", live.state);
            return;
        }

        self.metrics.record_routed();
        if let Err(e) = self.logger.append(record.to_log_row(live.state, live.trial)) {
            debug!("[TrialRouter] record for trial {} not logged: {}", live.trial, e);
        }
        self.cursor.publish(record.handle_position());

        if !record.is_trial_finished() {
            return;
        }
        self.metrics.record_finish_flag();

        let Some(setter) = live.completion.clone() else {
            debug!("[TrialRouter] finish flag before trial {} was armed", live.trial);
            return;
        };
        // The trial ends with this record: the next one already sees TrialFinished.
        let mut live = RwLockUpgradableReadGuard::upgrade(live);
        live.state = ExperimentState::TrialFinished;
        live.completion = None;
        if setter.set() {
            debug!("[TrialRouter] trial {} finish flag observed", live.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::codec::Position;
    use crate::session::signal::completion;
    use crate::utils::metrics::LinkMetrics;
    use std::{fs, time::Duration};

    struct Rig {
        live: Arc<LiveState>,
        logger: Arc<EventLogger>,
        cursor: Arc<CursorBridge>,
        metrics: SharedMetrics,
        router: TrialRouter,
    }

    fn rig() -> Rig {
        let metrics = LinkMetrics::shared();
        let live = Arc::new(LiveState::new());
        let logger = Arc::new(EventLogger::new(metrics.clone()));
        let cursor = Arc::new(CursorBridge::new());
        let router = TrialRouter::new(live.clone(), logger.clone(), cursor.clone(), metrics.clone());
        Rig { live, logger, cursor, metrics, router }
    }

    fn record(x: f32, finished: i32) -> MovementRecord {
        MovementRecord { handle_pos_x: x, handle_pos_y: -x, trial_finished: finished, ..Default::default() }
    }

    #[test]
    fn records_outside_a_trial_are_discarded() {
        let rig = rig();
        rig.router.deliver(&record(1.0, 1));
        rig.live.set_state(ExperimentState::Resting);
        rig.router.deliver(&record(2.0, 0));

        let snap = rig.metrics.snapshot();
        assert_eq!(snap.discarded, 2);
        assert_eq!(snap.routed, 0);
        assert_eq!(rig.cursor.consume(), None);
    }

    #[test]
    fn running_trial_logs_tags_and_completes() {
        let rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("S_Block1.csv");
        rig.logger.open(&path, "h").unwrap();

        rig.live.begin_trial(1, 2);
        let (setter, waiter) = completion();
        rig.live.arm(setter);

        rig.router.deliver(&record(0.5, 0));
        rig.router.deliver(&record(0.75, 0));
        rig.router.deliver(&record(1.0, 1));
        assert!(waiter.wait_timeout(Duration::from_millis(100)).is_ok());
        assert_eq!(rig.cursor.consume(), Some(Position::new(1.0, -1.0)));

        rig.logger.close().unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let tails: Vec<&str> = text
            .lines()
            .skip(1)
            .map(|l| l.splitn(12, ',').last().unwrap())
            .collect();
        assert_eq!(tails, vec!["TrialRunning,2,0", "TrialRunning,2,0", "TrialRunning,2,1"]);
    }

    #[test]
    fn records_after_the_finish_flag_are_not_logged() {
        let rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("S_Block1.csv");
        rig.logger.open(&path, "h").unwrap();

        rig.live.begin_trial(1, 1);
        let (setter, waiter) = completion();
        rig.live.arm(setter);

        for flag in [0, 0, 1, 0, 0, 0, 1, 0] {
            rig.router.deliver(&record(0.25, flag));
        }
        assert!(waiter.is_set());
        let snap = rig.live.snapshot();
        assert_eq!(snap.state, ExperimentState::TrialFinished);
        assert!(snap.completion.is_none());

        let counts = rig.metrics.snapshot();
        assert_eq!(counts.routed, 3);
        assert_eq!(counts.discarded, 5);

        rig.logger.close().unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1 + 3);
        assert!(text.lines().last().unwrap().ends_with("TrialRunning,1,1"));
    }

    #[test]
    fn finish_flag_before_arming_does_not_complete() {
        let rig = rig();
        rig.live.begin_trial(1, 1);
        rig.router.deliver(&record(0.0, 1));

        let (setter, waiter) = completion();
        rig.live.arm(setter);
        assert!(!waiter.is_set());
        assert_eq!(rig.metrics.snapshot().finish_flags, 1);
    }

    #[test]
    fn state_change_disarms_the_latch() {
        let rig = rig();
        rig.live.begin_trial(1, 1);
        let (setter, waiter) = completion();
        rig.live.arm(setter);
        rig.live.set_state(ExperimentState::TrialFinished);

        rig.router.deliver(&record(0.0, 1));
        assert!(!waiter.is_set());
    }
}
