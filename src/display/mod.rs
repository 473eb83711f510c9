//! Display collaborator interface.
//!
//! The orchestrator pushes a [`RenderState`] on every screen change; the display reads
//! the cursor separately from the [`CursorBridge`](crate::session::cursor::CursorBridge).

pub mod console;

use crate::link::codec::Position;
use crate::session::orchestrator::ExperimentState;

#[derive(Debug, Clone, PartialEq)]
pub struct RenderState {
    pub state: ExperimentState,
    pub block: u32,
    pub total_blocks: u32,
    pub trial: u32,
    pub trials_per_block: u32,
    pub start: Option<Position>,
    pub end: Option<Position>,
    /// The peripheral has the start command and the trial is waiting on its finish flag.
    pub armed: bool,
    pub notice: Option<String>,
}

impl RenderState {
    pub fn new(state: ExperimentState, total_blocks: u32, trials_per_block: u32) -> Self {
        Self {
            state,
            block: 0,
            total_blocks,
            trial: 0,
            trials_per_block,
            start: None,
            end: None,
            armed: false,
            notice: None,
        }
    }
}
