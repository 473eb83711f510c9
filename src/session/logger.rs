//! logger.rs
//! Durable append pipeline for the per-block CSV log.
//!
//! Producers (the receive thread in practice, any thread by contract) push finished
//! lines into an unbounded channel and return immediately. One drain thread per session
//! owns the file and writes lines in enqueue order. close() disconnects the channel,
//! which lets the drain thread empty the backlog, flush, fsync and hand back a report.
//! At most one session is open at a time.

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    thread::{self, JoinHandle},
    time::Duration,
};
use log::{debug, error, info, warn};

use crate::utils::error::{ExperimentError, Result};
use crate::utils::metrics::SharedMetrics;

// Idle flush: lines reach the OS within this long of the backlog emptying.
const IDLE_FLUSH: Duration = Duration::from_millis(5);
const FLUSH_EVERY_LINES: u64 = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub path: PathBuf,
    /// Lines written after the header.
    pub lines_written: u64,
}

struct LogSession {
    path: PathBuf,
    tx: Sender<String>,
    drain: JoinHandle<DrainOutcome>,
}

struct DrainOutcome {
    lines_written: u64,
    lost: u64,
    failure: Option<io::Error>,
}

pub struct EventLogger {
    session: RwLock<Option<LogSession>>,
    metrics: SharedMetrics,
}

impl EventLogger {
    pub fn new(metrics: SharedMetrics) -> Self {
        Self { session: RwLock::new(None), metrics }
    }

    pub fn is_open(&self) -> bool {
        self.session.read().is_some()
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.session.read().as_ref().map(|s| s.path.clone())
    }

    /// Creates parent directories, truncates `path`, writes `header` as the first line
    /// and starts the drain thread. An already-open session is closed first.
    pub fn open(&self, path: impl AsRef<Path>, header: &str) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let mut slot = self.session.write();

        if let Some(previous) = slot.take() {
            warn!("[EventLogger] {:?} still open, closing before {:?}", previous.path, path);
            if let Err(e) = finish(previous) {
                error!("[EventLogger] closing previous session: {}", e);
            }
        }

        let io_failure = |source: io::Error| ExperimentError::IoFailure {
            path: path.clone(),
            source,
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_failure)?;
        }
        let mut writer = BufWriter::new(File::create(&path).map_err(io_failure)?);
        writeln!(writer, "{}", header)
            .and_then(|_| writer.flush())
            .map_err(io_failure)?;

        let (tx, rx) = unbounded::<String>();
        let drain_path = path.clone();
        let drain = thread::Builder::new()
            .name("log-drain".to_string())
            .spawn(move || drain_loop(writer, rx, &drain_path))
            .map_err(io_failure)?;

        info!("[EventLogger] logging to {:?}", path);
        *slot = Some(LogSession { path, tx, drain });
        Ok(())
    }

    /// Enqueues one line without waiting on the file. Fails with `SessionClosed`
    /// when no session is open; the line is dropped and counted.
    pub fn append(&self, line: String) -> Result<()> {
        let guard = self.session.read();
        let Some(session) = guard.as_ref() else {
            self.metrics.record_dropped_line();
            warn!("[EventLogger] append with no open session, line dropped");
            return Err(ExperimentError::SessionClosed);
        };
        // The drain thread holds the receiver until the session's close, which needs
        // the write lock we are excluding; the send cannot find it gone.
        if session.tx.send(line).is_err() {
            self.metrics.record_dropped_line();
            return Err(ExperimentError::SessionClosed);
        }
        Ok(())
    }

    /// Drains every line enqueued so far to disk, flushes, syncs and closes the file.
    /// `Ok(None)` when nothing was open.
    pub fn close(&self) -> Result<Option<DrainReport>> {
        let Some(session) = self.session.write().take() else {
            return Ok(None);
        };
        finish(session).map(Some)
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("[EventLogger] close on drop: {}", e);
        }
    }
}

fn finish(session: LogSession) -> Result<DrainReport> {
    let LogSession { path, tx, drain } = session;
    drop(tx);

    let outcome = drain.join().map_err(|_| ExperimentError::IoFailure {
        path: path.clone(),
        source: io::Error::other("log drain thread panicked"),
    })?;

    if let Some(source) = outcome.failure {
        error!(
            "[EventLogger] {:?} closed with {} unwritten line(s): {}",
            path, outcome.lost, source
        );
        return Err(ExperimentError::DrainFailure { path, lost: outcome.lost, source });
    }

    info!("[EventLogger] closed {:?} ({} lines)", path, outcome.lines_written);
    Ok(DrainReport { path, lines_written: outcome.lines_written })
}

fn drain_loop(mut writer: BufWriter<File>, rx: Receiver<String>, path: &Path) -> DrainOutcome {
    let mut outcome = DrainOutcome { lines_written: 0, lost: 0, failure: None };
    let mut unflushed: u64 = 0;

    loop {
        match rx.recv_timeout(IDLE_FLUSH) {
            Ok(line) => {
                if outcome.failure.is_some() {
                    outcome.lost += 1;
                    continue;
                }
                match writeln!(writer, "{}", line) {
                    Ok(()) => {
                        outcome.lines_written += 1;
                        unflushed += 1;
                    }
                    Err(e) => {
                        error!("[EventLogger] write to {:?} failed: {}", path, e);
                        outcome.lost += 1;
                        outcome.failure = Some(e);
                        continue;
                    }
                }
                if unflushed >= FLUSH_EVERY_LINES {
                    flush_or_record(&mut writer, &mut outcome, &mut unflushed);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if unflushed > 0 {
                    flush_or_record(&mut writer, &mut outcome, &mut unflushed);
                }
            }
            // Every sender is gone and the backlog is empty.
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if outcome.failure.is_none() {
        let synced = writer
            .flush()
            .and_then(|_| writer.get_ref().sync_all());
        if let Err(e) = synced {
            outcome.failure = Some(e);
        }
    }
    debug!("[EventLogger] drain for {:?} exiting, {} written", path, outcome.lines_written);
    outcome
}

fn flush_or_record(writer: &mut BufWriter<File>, outcome: &mut DrainOutcome, unflushed: &mut u64) {
    if let Err(e) = writer.flush() {
        // Lines still in the buffer are not known to be on disk.
        outcome.lost += *unflushed;
        outcome.lines_written -= *unflushed;
        outcome.failure = Some(e);
    }
    *unflushed = 0;
}
