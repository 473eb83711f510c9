//! receiver.rs
//! Owns the telemetry UDP socket and the dedicated receive thread.
//! - one iteration per datagram: receive, decode, fan out to subscribers in arrival order
//! - malformed datagrams are counted and skipped, never fatal to the loop
//! - stop() unblocks a pending receive by shutting the socket's read half and waits
//!   a bounded grace period for the thread

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use std::{
    io,
    net::{Shutdown, SocketAddr, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use thread_priority::{ThreadBuilderExt, ThreadPriority};
use log::{debug, error, info, warn};

use crate::link::codec::{self, MovementRecord};
use crate::utils::error::{ExperimentError, Result};
use crate::utils::metrics::SharedMetrics;

const MAX_DATAGRAM_SIZE: usize = 2048;
const RECV_BUFFER_BYTES: usize = 1 << 20;
// Fallback wake-up in case shutdown() does not interrupt recv on this platform.
const RECV_POLL: Duration = Duration::from_millis(100);

/// Receives decoded records on the receive thread.
///
/// Implementations run on the network path: they must hand the record off in O(1)
/// and never block.
pub trait TelemetrySink: Send + Sync {
    fn deliver(&self, record: &MovementRecord);
}

/// The plain subscriber: a typed channel whose receiving end the consumer owns.
/// A full or disconnected channel loses the record; each loss is counted.
pub struct ChannelSink {
    tx: Sender<MovementRecord>,
    metrics: SharedMetrics,
}

impl ChannelSink {
    pub fn new(tx: Sender<MovementRecord>, metrics: SharedMetrics) -> Self {
        Self { tx, metrics }
    }
}

impl TelemetrySink for ChannelSink {
    fn deliver(&self, record: &MovementRecord) {
        if let Err(e) = self.tx.try_send(*record) {
            self.metrics.record_dropped_record();
            warn!("[TelemetryReceiver] subscriber channel dropped record: {}", e);
        }
    }
}

struct Worker {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    exited: Receiver<()>,
}

pub struct TelemetryReceiver {
    sinks: Mutex<Vec<Arc<dyn TelemetrySink>>>,
    worker: Mutex<Option<Worker>>,
    metrics: SharedMetrics,
    grace: Duration,
    core: Option<usize>,
}

impl TelemetryReceiver {
    pub fn new(metrics: SharedMetrics, grace: Duration) -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
            metrics,
            grace,
            core: None,
        }
    }

    /// Pin the receive thread to `core` on the next start.
    pub fn with_core(mut self, core: Option<usize>) -> Self {
        self.core = core;
        self
    }

    /// Registers a subscriber. The receive thread takes its subscriber list at
    /// start, so subscribe before calling [`start`](Self::start).
    pub fn subscribe(&self, sink: Arc<dyn TelemetrySink>) {
        self.sinks.lock().push(sink);
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.worker.lock().as_ref().map(|w| w.local_addr)
    }

    /// Binds `0.0.0.0:port` and spawns the receive thread.
    /// Calling it while the thread is alive returns the existing address.
    pub fn start(&self, port: u16) -> Result<SocketAddr> {
        let mut slot = self.worker.lock();
        if let Some(w) = slot.as_ref() {
            if !w.handle.is_finished() {
                info!("[TelemetryReceiver] already receiving on {}", w.local_addr);
                return Ok(w.local_addr);
            }
        }
        if let Some(stale) = slot.take() {
            let _ = stale.handle.join();
        }

        let socket = bind_socket(port).map_err(|source| {
            error!("[TelemetryReceiver] bind on port {} failed: {}", port, source);
            ExperimentError::BindFailure { port, source }
        })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| ExperimentError::BindFailure { port, source })?;
        let socket = Arc::new(socket);

        let running = Arc::new(AtomicBool::new(true));
        let (exit_tx, exited) = bounded::<()>(1);
        let sinks: Vec<Arc<dyn TelemetrySink>> = self.sinks.lock().clone();
        let metrics = self.metrics.clone();
        let core = self.core;

        let loop_socket = socket.clone();
        let loop_running = running.clone();
        let handle = thread::Builder::new()
            .name("telemetry-rx".to_string())
            .spawn_with_priority(ThreadPriority::Max, move |priority| {
                if let Err(e) = priority {
                    debug!("[TelemetryReceiver] running without raised priority: {:?}", e);
                }
                pin_to_core(core);
                receive_loop(&loop_socket, &loop_running, &sinks, &metrics);
                // Dropping exit_tx disconnects the channel stop() is waiting on.
                drop(exit_tx);
            })
            .map_err(|source| ExperimentError::BindFailure { port, source })?;

        info!("[TelemetryReceiver] receiving telemetry on {}", local_addr);
        *slot = Some(Worker { socket, local_addr, running, handle, exited });
        Ok(local_addr)
    }

    /// Cancels the receive loop. Returns once the thread has exited or the grace
    /// period has passed; a thread that overruns the grace period is detached.
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        info!("[TelemetryReceiver] stopping receive on {}", worker.local_addr);
        worker.running.store(false, Ordering::Release);
        if let Err(e) = SockRef::from(worker.socket.as_ref()).shutdown(Shutdown::Read) {
            debug!("[TelemetryReceiver] socket shutdown: {}", e);
        }

        match worker.exited.recv_timeout(self.grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.handle.join();
                info!("[TelemetryReceiver] receive loop exited");
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "[TelemetryReceiver] receive loop still alive after {:?}, detaching",
                    self.grace
                );
            }
        }
    }
}

impl Drop for TelemetryReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // A larger kernel buffer absorbs bursts while a subscriber is slow to return.
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_BYTES) {
        debug!("[TelemetryReceiver] keeping default receive buffer: {}", e);
    }
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&SockAddr::from(addr))?;
    socket.set_read_timeout(Some(RECV_POLL))?;
    Ok(socket.into())
}

fn pin_to_core(core: Option<usize>) {
    let Some(core) = core else { return };
    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    match core_ids.get(core) {
        Some(id) if core_affinity::set_for_current(*id) => {
            info!("[TelemetryReceiver] receive thread pinned to core {}", core);
        }
        Some(_) => error!("[TelemetryReceiver] failed to pin receive thread to core {}", core),
        None => error!("[TelemetryReceiver] core {} not among available cores", core),
    }
}

fn receive_loop(
    socket: &UdpSocket,
    running: &AtomicBool,
    sinks: &[Arc<dyn TelemetrySink>],
    metrics: &SharedMetrics,
) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    while running.load(Ordering::Acquire) {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _peer)) => len,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                error!("[TelemetryReceiver] receive error: {}", e);
                continue;
            }
        };

        // A read-shutdown socket reports zero-length reads.
        if !running.load(Ordering::Acquire) {
            break;
        }

        metrics.record_datagram();
        match codec::decode(&buf[..len]) {
            Ok(record) => {
                for sink in sinks {
                    sink.deliver(&record);
                }
            }
            Err(e) => {
                metrics.record_malformed();
                warn!("[TelemetryReceiver] dropping datagram: {}", e);
            }
        }
    }

    debug!("[TelemetryReceiver] receive loop finished");
}
