//! # Reaching Experiment Controller
//!
//! Sequences blocks of reaching trials against the peripheral (robot) PC.
//!
//! ## Flow
//! - Operator enters a subject id; telemetry reception starts on UDP.
//! - Per block: operator types `start`, the block log opens, each trial sends
//!   `START_TRIAL` over TCP and waits for the peripheral's finish flag.
//! - Between blocks: timed rest, then `next` and `start` again.
//! - `stop` (or `x`/`q`) at any prompt is an emergency stop.
//!
//! ## Threads
//! - **telemetry-rx:** max priority, optionally pinned (`--rx-core`); routes records.
//! - **log-drain:** one per open block log.
//! - **console-display:** renders screens and the live cursor.
//! - **operator-input:** stdin lines to operator signals.
//! - **main:** the orchestrator.
//!
//! ## Outputs
//! - `<log-dir>/<subject>_Block<N>.csv` per block.
//! - `<log-dir>/<subject>_summary.csv` per session.

use clap::Parser;
use crossbeam::channel::{unbounded, Sender};
use std::{
    io::{stdin, stdout, BufRead, Write},
    process::ExitCode,
    sync::Arc,
    thread,
};
use log::{error, info};

use reach_control::{
    display::console::spawn_console_display,
    link::receiver::TelemetryReceiver,
    session::{
        cursor::CursorBridge,
        orchestrator::{ExperimentState, OperatorSignal, TrialOrchestrator},
        signal::StopSignal,
    },
    utils::{
        config::{ControlArgs, ExperimentConfig},
        metrics::LinkMetrics,
    },
};

fn main() -> ExitCode {
    env_logger::init();
    let args = ControlArgs::parse();
    let config = ExperimentConfig::from(&args);
    info!("=== REACH CONTROL START ===");
    info!("[Main] {:?}", config);

    let metrics = LinkMetrics::shared();
    let receiver = Arc::new(
        TelemetryReceiver::new(metrics.clone(), config.receiver_grace).with_core(config.rx_core),
    );
    let cursor = Arc::new(CursorBridge::new());
    let (operator_tx, operator_rx) = unbounded::<OperatorSignal>();
    let (screen_tx, screen_rx) = unbounded();

    let orchestrator = TrialOrchestrator::new(
        config,
        receiver,
        cursor.clone(),
        operator_rx,
        screen_tx,
        metrics.clone(),
    );

    if let Some(subject) = args.subject.clone() {
        let _ = operator_tx.send(OperatorSignal::Subject(subject));
    }
    print_controls();
    spawn_operator_input(operator_tx, orchestrator.stop_handle());
    let display = spawn_console_display(screen_rx, cursor, stdout());

    let report = orchestrator.run();

    if display.join().is_err() {
        error!("[Main] display thread panicked");
    }

    let totals = metrics.snapshot();
    info!(
        "[Main] datagrams={} malformed={} routed={} discarded={} dropped_lines={} dropped_records={}",
        totals.datagrams,
        totals.malformed,
        totals.routed,
        totals.discarded,
        totals.dropped_lines,
        totals.dropped_records
    );
    for block in &report.blocks {
        println!(
            "Block {}: {} trial(s), {} line(s), {:?}",
            block.block, block.trials_completed, block.lines_written, block.outcome
        );
    }

    match report.final_state {
        ExperimentState::Finished => {
            info!("=== REACH CONTROL FINISHED ===");
            ExitCode::SUCCESS
        }
        state => {
            if let Some(e) = &report.error {
                error!("[Main] session ended in {}: {}", state, e);
            }
            ExitCode::FAILURE
        }
    }
}

fn print_controls() {
    println!("\n┌─────────────────────────────────────────────┐");
    println!("│     REACH CONTROL                           │");
    println!("├─────────────────────────────────────────────┤");
    println!("│  <id>          subject identifier           │");
    println!("│  id <id>       subject id that is a keyword │");
    println!("│  start | s     begin the block              │");
    println!("│  next  | n     continue after rest          │");
    println!("│  stop  | x | q emergency stop               │");
    println!("└─────────────────────────────────────────────┘");
    let _ = stdout().flush();
}

// Runs until stdin closes; dropping the sender then reads as an operator abort.
fn spawn_operator_input(tx: Sender<OperatorSignal>, stop: StopSignal) {
    let spawned = thread::Builder::new()
        .name("operator-input".to_string())
        .spawn(move || {
            for line in stdin().lock().lines() {
                let Ok(line) = line else { break };
                let Some(signal) = OperatorSignal::parse(&line) else { continue };
                if signal == OperatorSignal::EmergencyStop {
                    stop.trigger();
                }
                if tx.send(signal).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        error!("[Main] operator input unavailable: {}", e);
    }
}
