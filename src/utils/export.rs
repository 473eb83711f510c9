//! Session summary export: one CSV row per block, written when the session ends.
//!
//! `<log_dir>/<subject>_summary.csv`, columns in [`BlockSummary`] field order.

use csv::Writer;
use serde::Serialize;
use std::{
    fs::{create_dir_all, File},
    io::{self, BufWriter},
    path::{Path, PathBuf},
};

use log::info;

use crate::utils::error::{ExperimentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockOutcome {
    Completed,
    Stopped,
}

/// How one block went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockSummary {
    pub subject: String,
    pub block: u32,
    pub trials_completed: u32,
    pub lines_written: u64,
    pub datagrams: u64,
    pub malformed: u64,
    pub outcome: BlockOutcome,
}

/// Writes `rows` to `path`, replacing any previous summary.
pub fn write_session_summary(path: impl AsRef<Path>, rows: &[BlockSummary]) -> Result<PathBuf> {
    let path = path.as_ref().to_path_buf();
    let io_failure = |source: io::Error| ExperimentError::IoFailure {
        path: path.clone(),
        source,
    };

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        create_dir_all(dir).map_err(io_failure)?;
    }

    let mut wtr = Writer::from_writer(BufWriter::new(File::create(&path).map_err(io_failure)?));
    for row in rows {
        wtr.serialize(row).map_err(|e| io_failure(e.into()))?;
    }
    wtr.flush().map_err(io_failure)?;

    info!("[Export] session summary ({} block(s)) written to {:?}", rows.len(), path);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn row(block: u32, outcome: BlockOutcome) -> BlockSummary {
        BlockSummary {
            subject: "S01".to_string(),
            block,
            trials_completed: 3,
            lines_written: 120,
            datagrams: 121,
            malformed: 1,
            outcome,
        }
    }

    #[test]
    fn header_and_rows_follow_field_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("S01_summary.csv");
        write_session_summary(&path, &[row(1, BlockOutcome::Completed), row(2, BlockOutcome::Stopped)])
            .unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "subject,block,trials_completed,lines_written,datagrams,malformed,outcome",
                "S01,1,3,120,121,1,completed",
                "S01,2,3,120,121,1,stopped",
            ]
        );
    }

    #[test]
    fn unwritable_location_is_an_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "").unwrap();
        let err = write_session_summary(blocker.join("s.csv"), &[]).unwrap_err();
        assert!(matches!(err, ExperimentError::IoFailure { .. }));
    }
}
