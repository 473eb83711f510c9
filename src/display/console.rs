//! Console render loop.
//!
//! Ticks every 50 ms: applies the newest pushed RenderState (one line per screen change)
//! and, while a trial runs, rewrites a cursor line from the CursorBridge. Exits when the
//! orchestrator drops its RenderState sender.

use crossbeam::channel::{Receiver, RecvTimeoutError};
use std::{
    io::Write,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use log::{debug, info};

use crate::display::RenderState;
use crate::session::{cursor::CursorBridge, orchestrator::ExperimentState};

const TICK: Duration = Duration::from_millis(50);

pub fn spawn_console_display<W>(
    updates: Receiver<RenderState>,
    cursor: Arc<CursorBridge>,
    mut out: W,
) -> thread::JoinHandle<()>
where
    W: Write + Send + 'static,
{
    thread::Builder::new()
        .name("console-display".to_string())
        .spawn(move || {
            let mut current: Option<RenderState> = None;
            let mut next_tick = Instant::now() + TICK;

            loop {
                let wait = next_tick.saturating_duration_since(Instant::now());
                match updates.recv_timeout(wait) {
                    Ok(state) => {
                        if current.as_ref() != Some(&state) {
                            let _ = writeln!(out, "\n{}", describe(&state));
                            let _ = out.flush();
                        }
                        current = Some(state);
                        continue;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }

                next_tick = Instant::now() + TICK;
                let running = current
                    .as_ref()
                    .is_some_and(|s| s.state == ExperimentState::TrialRunning);
                if let (true, Some(pos)) = (running, cursor.consume()) {
                    let _ = write!(out, "\r  cursor {}      ", pos);
                    let _ = out.flush();
                }
            }

            let _ = writeln!(out);
            debug!("[Display] render loop exiting");
        })
        .unwrap_or_else(|e| {
            info!("[Display] console display unavailable: {}", e);
            thread::spawn(|| {})
        })
}

/// One-line description of a screen.
pub fn describe(s: &RenderState) -> String {
    let mut line = match s.state {
        ExperimentState::Idle => "Enter subject ID:".to_string(),
        ExperimentState::ReadyToStart => format!(
            "Block {}/{} ready. Type 'start' to begin.",
            s.block, s.total_blocks
        ),
        ExperimentState::TrialRunning => {
            let targets = match (s.start, s.end) {
                (Some(a), Some(b)) => format!(" {} -> {}", a, b),
                _ => String::new(),
            };
            let cue = if s.armed { " GO" } else { "" };
            format!(
                "Block {}/{} | Trial {}/{}{}{}",
                s.block, s.total_blocks, s.trial, s.trials_per_block, targets, cue
            )
        }
        ExperimentState::TrialFinished => format!("Trial {}/{} done.", s.trial, s.trials_per_block),
        ExperimentState::Resting => format!("Block {}/{} complete. Rest.", s.block, s.total_blocks),
        ExperimentState::Finished => "Experiment finished. Thank you.".to_string(),
        ExperimentState::Stopped => "Experiment stopped.".to_string(),
    };
    if let Some(notice) = &s.notice {
        line.push_str("  ");
        line.push_str(notice);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::codec::Position;
    use crossbeam::channel::unbounded;
    use std::io;

    #[test]
    fn trial_line_shows_progress_targets_and_cue() {
        let mut s = RenderState::new(ExperimentState::TrialRunning, 4, 30);
        s.block = 2;
        s.trial = 7;
        s.start = Some(Position::new(-3.0, -3.0));
        s.end = Some(Position::new(4.0, 0.5));
        assert_eq!(
            describe(&s),
            "Block 2/4 | Trial 7/30 (-3.000, -3.000) -> (4.000, 0.500)"
        );
        s.armed = true;
        assert!(describe(&s).ends_with(" GO"));
    }

    #[test]
    fn notice_is_appended() {
        let mut s = RenderState::new(ExperimentState::TrialFinished, 1, 3);
        s.trial = 1;
        s.notice = Some("Great!".to_string());
        assert_eq!(describe(&s), "Trial 1/3 done.  Great!");
    }

    #[test]
    fn loop_exits_when_orchestrator_hangs_up() {
        let (tx, rx) = unbounded();
        let handle = spawn_console_display(rx, Arc::new(CursorBridge::new()), io::sink());
        tx.send(RenderState::new(ExperimentState::Idle, 1, 1)).unwrap();
        drop(tx);
        handle.join().unwrap();
    }
}
