//! command.rs
//! TCP command channel to the peripheral PC.
//!
//! One short-lived connection per command: connect with a deadline, write the ASCII
//! line, shut down, close. Nothing is pooled and nothing is retried; the caller owns
//! the decision of what a failed delivery means.

use std::{
    fmt,
    io::{self, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    time::{Duration, Instant},
};

use log::{debug, error, info};

use crate::link::codec::Position;
use crate::utils::error::{ExperimentError, Result};

/// Commands understood by the peripheral.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrialCommand {
    StartTrial { start: Position, end: Position },
}

impl fmt::Display for TrialCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrialCommand::StartTrial { start, end } => write!(
                f,
                "START_TRIAL;{};{};{};{}",
                start.x, start.y, end.x, end.y
            ),
        }
    }
}

/// Outcome of a successful [`CommandChannel::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent { bytes: usize, elapsed: Duration },
    /// Empty command: nothing was opened or written.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct CommandChannel {
    addr: SocketAddr,
    default_deadline: Duration,
}

impl CommandChannel {
    pub fn new(addr: SocketAddr, default_deadline: Duration) -> Self {
        Self { addr, default_deadline }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn default_deadline(&self) -> Duration {
        self.default_deadline
    }

    pub fn send_trial(&self, command: &TrialCommand) -> Result<Delivery> {
        self.send(&command.to_string(), self.default_deadline)
    }

    /// Opens one connection, writes `command`, closes it.
    ///
    /// `deadline` bounds the connect; the write gets the same bound so a stalled
    /// peer cannot hold the orchestrator.
    pub fn send(&self, command: &str, deadline: Duration) -> Result<Delivery> {
        if command.is_empty() {
            debug!("[CommandChannel] empty command, nothing sent");
            return Ok(Delivery::Skipped);
        }

        let started = Instant::now();
        let mut stream = TcpStream::connect_timeout(&self.addr, deadline)
            .map_err(|e| classify_connect_error(self.addr, deadline, e))?;

        let written = stream
            .set_write_timeout(Some(deadline))
            .and_then(|_| stream.set_nodelay(true))
            .and_then(|_| stream.write_all(command.as_bytes()))
            .and_then(|_| stream.flush());

        if let Err(e) = written {
            error!("[CommandChannel] write to {} failed: {}", self.addr, e);
            return Err(ExperimentError::SendFailure { addr: self.addr, source: e });
        }

        // The peer reads until EOF; a failed shutdown only means it already hung up.
        if let Err(e) = stream.shutdown(Shutdown::Both) {
            debug!("[CommandChannel] shutdown after write: {}", e);
        }

        let elapsed = started.elapsed();
        info!("[CommandChannel] sent '{}' to {} in {:?}", command, self.addr, elapsed);
        Ok(Delivery::Sent { bytes: command.len(), elapsed })
    }
}

fn classify_connect_error(addr: SocketAddr, deadline: Duration, e: io::Error) -> ExperimentError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            error!("[CommandChannel] connect to {} timed out after {:?}", addr, deadline);
            ExperimentError::ConnectTimeout { addr, timeout: deadline }
        }
        _ => {
            error!("[CommandChannel] connect to {} failed: {}", addr, e);
            ExperimentError::SendFailure { addr, source: e }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Read, net::TcpListener, thread};

    #[test]
    fn start_trial_wire_format() {
        let cmd = TrialCommand::StartTrial {
            start: Position::new(-3.25, -2.5),
            end: Position::new(4.0, 0.125),
        };
        assert_eq!(cmd.to_string(), "START_TRIAL;-3.25;-2.5;4;0.125");
    }

    #[test]
    fn one_connection_per_command() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = thread::spawn(move || {
            let mut received = Vec::new();
            for _ in 0..2 {
                let (mut conn, _) = listener.accept().unwrap();
                let mut line = String::new();
                conn.read_to_string(&mut line).unwrap();
                received.push(line);
            }
            received
        });

        let channel = CommandChannel::new(addr, Duration::from_millis(1_000));
        let first = channel.send("START_TRIAL;0;0;1;1", Duration::from_millis(1_000)).unwrap();
        assert!(matches!(first, Delivery::Sent { bytes: 19, .. }));
        channel.send("START_TRIAL;1;1;2;2", Duration::from_millis(1_000)).unwrap();

        let received = peer.join().unwrap();
        assert_eq!(received, vec!["START_TRIAL;0;0;1;1", "START_TRIAL;1;1;2;2"]);
    }

    #[test]
    fn empty_command_never_connects() {
        // Nothing listens on this address; an attempted connect would fail.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let channel = CommandChannel::new(addr, Duration::from_millis(100));
        assert_eq!(channel.send("", Duration::from_millis(100)).unwrap(), Delivery::Skipped);
    }

    #[test]
    fn refused_connection_is_a_send_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let channel = CommandChannel::new(addr, Duration::from_millis(500));
        match channel.send("START_TRIAL;0;0;1;1", Duration::from_millis(500)) {
            Err(ExperimentError::SendFailure { addr: a, .. }) => assert_eq!(a, addr),
            other => panic!("expected SendFailure, got {:?}", other),
        }
    }

    #[test]
    fn timed_out_connect_maps_to_connect_timeout() {
        let addr: SocketAddr = "10.255.255.1:20002".parse().unwrap();
        let err = classify_connect_error(
            addr,
            Duration::from_millis(1_000),
            io::Error::from(io::ErrorKind::TimedOut),
        );
        assert!(matches!(err, ExperimentError::ConnectTimeout { .. }));
    }
}
