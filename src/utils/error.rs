//! error.rs
//! Error kinds surfaced by the link, the log pipeline and the orchestrator.
//!
//! Decode errors are absorbed inside the receive loop; everything else propagates
//! to the orchestrator, which is the only place that turns an error into a state change.

use std::{io, net::SocketAddr, path::PathBuf, time::Duration};

pub type Result<T> = std::result::Result<T, ExperimentError>;

#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    /// Datagram shorter than one movement record.
    #[error("telemetry datagram too short: got {actual} bytes, need {expected}")]
    ShortBuffer { expected: usize, actual: usize },

    #[error("failed to bind telemetry socket on port {port}: {source}")]
    BindFailure {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("log file {path:?}: {source}")]
    IoFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The drain thread could not write everything it dequeued.
    #[error("log file {path:?}: {lost} line(s) not written: {source}")]
    DrainFailure {
        path: PathBuf,
        lost: u64,
        #[source]
        source: io::Error,
    },

    #[error("connect to {addr} timed out after {}ms", .timeout.as_millis())]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    #[error("command delivery to {addr} failed: {source}")]
    SendFailure {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Append attempted with no open log session.
    #[error("log session is closed")]
    SessionClosed,

    #[error("trial {trial} of block {block} not completed within {}ms", .timeout.as_millis())]
    TrialTimeout {
        block: u32,
        trial: u32,
        timeout: Duration,
    },

    #[error("experiment stopped by operator")]
    OperatorAbort,
}

impl ExperimentError {
    /// True for the errors the receive loop skips over.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ExperimentError::ShortBuffer { .. })
    }

    pub fn is_operator_abort(&self) -> bool {
        matches!(self, ExperimentError::OperatorAbort)
    }
}
