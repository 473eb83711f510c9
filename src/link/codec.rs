//! codec.rs
//! Fixed 48-byte movement record sent by the peripheral PC over UDP.
//!
//! Layout (little-endian): 11 x f32 followed by one i32 trial-finished flag.
//! Values are not range checked; NaN and infinities pass through untouched.

use std::fmt;

use crate::session::orchestrator::ExperimentState;
use crate::utils::error::{ExperimentError, Result};

pub const RECORD_SIZE: usize = 11 * 4 + 4;

/// CSV header written at the top of every block log.
pub const LOG_HEADER: &str = "Timestamp,HandlePosX,HandlePosY,HandleVelX,HandleVelY,HandleAccX,HandleAccY,\
TargetStartPosX,TargetStartPosY,TargetEndPosX,TargetEndPosY,\
ExperimentState,CurrentTrial,IsTrialFinished";

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3})", self.x, self.y)
    }
}

/// One telemetry sample. Immutable once decoded.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MovementRecord {
    pub time_step: f32,
    pub handle_pos_x: f32,
    pub handle_pos_y: f32,
    pub handle_vel_x: f32,
    pub handle_vel_y: f32,
    pub handle_acc_x: f32,
    pub handle_acc_y: f32,
    pub target_start_x: f32,
    pub target_start_y: f32,
    pub target_end_x: f32,
    pub target_end_y: f32,
    /// 0 = trial continuing, 1 = trial finished.
    pub trial_finished: i32,
}

impl MovementRecord {
    pub fn handle_position(&self) -> Position {
        Position::new(self.handle_pos_x, self.handle_pos_y)
    }

    pub fn is_trial_finished(&self) -> bool {
        self.trial_finished == 1
    }

    /// Renders one log line: the eleven floats, then state, trial number and flag.
    /// Float formatting is Rust's `Display`, which never depends on locale.
    pub fn to_log_row(&self, state: ExperimentState, trial: u32) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            self.time_step,
            self.handle_pos_x,
            self.handle_pos_y,
            self.handle_vel_x,
            self.handle_vel_y,
            self.handle_acc_x,
            self.handle_acc_y,
            self.target_start_x,
            self.target_start_y,
            self.target_end_x,
            self.target_end_y,
            state.as_str(),
            trial,
            self.trial_finished,
        )
    }
}

/// Decodes the first [`RECORD_SIZE`] bytes of `bytes`; trailing bytes are ignored.
pub fn decode(bytes: &[u8]) -> Result<MovementRecord> {
    let Some(frame) = bytes.first_chunk::<RECORD_SIZE>() else {
        return Err(ExperimentError::ShortBuffer {
            expected: RECORD_SIZE,
            actual: bytes.len(),
        });
    };

    let f = |i: usize| {
        let at = i * 4;
        f32::from_le_bytes([frame[at], frame[at + 1], frame[at + 2], frame[at + 3]])
    };

    Ok(MovementRecord {
        time_step: f(0),
        handle_pos_x: f(1),
        handle_pos_y: f(2),
        handle_vel_x: f(3),
        handle_vel_y: f(4),
        handle_acc_x: f(5),
        handle_acc_y: f(6),
        target_start_x: f(7),
        target_start_y: f(8),
        target_end_x: f(9),
        target_end_y: f(10),
        trial_finished: i32::from_le_bytes([frame[44], frame[45], frame[46], frame[47]]),
    })
}

/// Inverse of [`decode`]; used by the peripheral simulator in tests and benches.
pub fn encode(record: &MovementRecord) -> [u8; RECORD_SIZE] {
    let floats = [
        record.time_step,
        record.handle_pos_x,
        record.handle_pos_y,
        record.handle_vel_x,
        record.handle_vel_y,
        record.handle_acc_x,
        record.handle_acc_y,
        record.target_start_x,
        record.target_start_y,
        record.target_end_x,
        record.target_end_y,
    ];

    let mut out = [0u8; RECORD_SIZE];
    for (slot, value) in out.chunks_exact_mut(4).zip(floats) {
        slot.copy_from_slice(&value.to_le_bytes());
    }
    out[44..].copy_from_slice(&record.trial_finished.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MovementRecord {
        MovementRecord {
            time_step: 0.125,
            handle_pos_x: -3.5,
            handle_pos_y: 1.25,
            handle_vel_x: 0.5,
            handle_vel_y: -0.75,
            handle_acc_x: 9.81,
            handle_acc_y: -1.0,
            target_start_x: -3.0,
            target_start_y: -3.0,
            target_end_x: 4.0,
            target_end_y: 0.25,
            trial_finished: 1,
        }
    }

    #[test]
    fn round_trip() {
        let rec = sample();
        assert_eq!(decode(&encode(&rec)).unwrap(), rec);
    }

    #[test]
    fn field_offsets_are_fixed() {
        let bytes = encode(&sample());
        assert_eq!(&bytes[0..4], &0.125f32.to_le_bytes());
        assert_eq!(&bytes[4..8], &(-3.5f32).to_le_bytes());
        assert_eq!(&bytes[40..44], &0.25f32.to_le_bytes());
        assert_eq!(&bytes[44..48], &1i32.to_le_bytes());
    }

    #[test]
    fn short_input_is_rejected_at_every_length() {
        let bytes = encode(&sample());
        for len in 0..RECORD_SIZE {
            match decode(&bytes[..len]) {
                Err(ExperimentError::ShortBuffer { expected, actual }) => {
                    assert_eq!(expected, RECORD_SIZE);
                    assert_eq!(actual, len);
                }
                other => panic!("len {}: expected ShortBuffer, got {:?}", len, other),
            }
        }
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut long = encode(&sample()).to_vec();
        long.extend_from_slice(&[0xFF; 16]);
        assert_eq!(decode(&long).unwrap(), sample());
    }

    #[test]
    fn non_finite_values_pass_through() {
        let mut rec = sample();
        rec.handle_vel_x = f32::NAN;
        rec.handle_acc_y = f32::INFINITY;
        let back = decode(&encode(&rec)).unwrap();
        assert!(back.handle_vel_x.is_nan());
        assert_eq!(back.handle_acc_y, f32::INFINITY);
    }

    #[test]
    fn only_flag_one_means_finished() {
        let mut rec = sample();
        assert!(rec.is_trial_finished());
        rec.trial_finished = 2;
        assert!(!rec.is_trial_finished());
        rec.trial_finished = 0;
        assert!(!rec.is_trial_finished());
    }

    #[test]
    fn log_row_matches_header_columns() {
        let row = sample().to_log_row(ExperimentState::TrialRunning, 2);
        assert_eq!(
            row,
            "0.125,-3.5,1.25,0.5,-0.75,9.81,-1,-3,-3,4,0.25,TrialRunning,2,1"
        );
        assert_eq!(row.split(',').count(), LOG_HEADER.split(',').count());
    }
}
