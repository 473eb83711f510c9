//! config.rs
//! Static experiment configuration, built once at startup from the command line.
//!
//! Defaults mirror the lab setup: 4 blocks of 30 trials, 30 s rest, 1.5 s feedback,
//! peripheral PC on localhost with telemetry on UDP 20001 and commands on TCP 20002.

use clap::Parser;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

pub const DEFAULT_UDP_PORT: u16 = 20001;
pub const DEFAULT_TCP_PORT: u16 = 20002;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_RECEIVER_GRACE_MS: u64 = 1_000;

/// Command line for the experiment controller.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct ControlArgs {
    /// Number of blocks in the session
    #[arg(short = 'b', long = "blocks", default_value_t = 4)]
    pub blocks: u32,

    /// Trials per block
    #[arg(short = 't', long = "trials", default_value_t = 30)]
    pub trials: u32,

    /// Rest between blocks, in seconds
    #[arg(long = "rest", default_value_t = 30.0)]
    pub rest_secs: f64,

    /// Feedback display time after each trial, in seconds
    #[arg(long = "feedback", default_value_t = 1.5)]
    pub feedback_secs: f64,

    /// Address of the peripheral PC receiving trial commands
    #[arg(long = "peer", default_value = "127.0.0.1")]
    pub peer_ip: IpAddr,

    /// Local UDP port telemetry arrives on
    #[arg(long = "udp-port", default_value_t = DEFAULT_UDP_PORT)]
    pub udp_port: u16,

    /// TCP port of the peripheral command server
    #[arg(long = "tcp-port", default_value_t = DEFAULT_TCP_PORT)]
    pub tcp_port: u16,

    /// Connect deadline for each command, in milliseconds
    #[arg(long = "connect-timeout", default_value_t = DEFAULT_CONNECT_TIMEOUT_MS)]
    pub connect_timeout_ms: u64,

    /// Directory the per-block CSV logs are written to
    #[arg(short = 'o', long = "log-dir", default_value = "Logs")]
    pub log_dir: PathBuf,

    /// Abort the session if a trial does not finish within this many seconds
    #[arg(long = "trial-timeout")]
    pub trial_timeout_secs: Option<f64>,

    /// Seed for target placement (random when omitted)
    #[arg(long = "seed")]
    pub seed: Option<u64>,

    /// Pin the telemetry receive thread to this core
    #[arg(long = "rx-core")]
    pub rx_core: Option<usize>,

    /// Subject identifier; prompted for on the console when omitted
    #[arg(short = 's', long = "subject")]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub total_blocks: u32,
    pub trials_per_block: u32,
    pub rest: Duration,
    pub feedback: Duration,
    pub peer_ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub connect_timeout: Duration,
    pub receiver_grace: Duration,
    pub log_dir: PathBuf,
    pub trial_timeout: Option<Duration>,
    pub seed: Option<u64>,
    pub rx_core: Option<usize>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            total_blocks: 4,
            trials_per_block: 30,
            rest: Duration::from_secs(30),
            feedback: Duration::from_millis(1_500),
            peer_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_port: DEFAULT_UDP_PORT,
            tcp_port: DEFAULT_TCP_PORT,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            receiver_grace: Duration::from_millis(DEFAULT_RECEIVER_GRACE_MS),
            log_dir: PathBuf::from("Logs"),
            trial_timeout: None,
            seed: None,
            rx_core: None,
        }
    }
}

impl ExperimentConfig {
    pub fn command_addr(&self) -> SocketAddr {
        SocketAddr::new(self.peer_ip, self.tcp_port)
    }

    /// `<log_dir>/<subject>_Block<N>.csv`
    pub fn block_log_path(&self, subject: &str, block: u32) -> PathBuf {
        self.log_dir.join(format!("{}_Block{}.csv", subject, block))
    }

    pub fn summary_path(&self, subject: &str) -> PathBuf {
        self.log_dir.join(format!("{}_summary.csv", subject))
    }
}

impl From<&ControlArgs> for ExperimentConfig {
    fn from(args: &ControlArgs) -> Self {
        Self {
            total_blocks: args.blocks,
            trials_per_block: args.trials,
            rest: secs(args.rest_secs),
            feedback: secs(args.feedback_secs),
            peer_ip: args.peer_ip,
            udp_port: args.udp_port,
            tcp_port: args.tcp_port,
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            receiver_grace: Duration::from_millis(DEFAULT_RECEIVER_GRACE_MS),
            log_dir: args.log_dir.clone(),
            trial_timeout: args.trial_timeout_secs.map(secs),
            seed: args.seed,
            rx_core: args.rx_core,
        }
    }
}

// Negative or NaN input clamps to zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
