//! Run checkpointing.
//!
//! Every `file_output.frequency` generations the driver dumps the full
//! resumable state: counters, agent bookkeeping, off-policy controller state,
//! the learner's hyperparameters and (when `serialize` is enabled) the replay
//! contents. A later run pointed at the same path picks the latest dump up
//! and resumes at the next generation.

use crate::agent::AgentState;
use crate::config::FileOutput;
use crate::driver::Counters;
use crate::error::{EngineError, Result};
use crate::replay::{OffPolicyState, ReplayState};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the pointer file holding the most recent dump.
const LATEST_FILE: &str = "latest.json";

/// A complete resumable run state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub counters: Counters,
    /// Agent bookkeeping; absent for optimizer-mode checkpoints.
    pub agent: Option<AgentState>,
    /// Replay contents, present when serialization is enabled.
    pub replay: Option<ReplayState>,
    pub off_policy: Option<OffPolicyState>,
    /// Opaque learner hyperparameters.
    pub hyperparameters: serde_json::Value,
}

/// Writes periodic checkpoints and tracks the dumped files.
pub struct Checkpointer {
    output: FileOutput,
    history: Vec<PathBuf>,
}

impl Checkpointer {
    /// Create a checkpointer, creating the output directory if needed.
    pub fn new(output: FileOutput) -> Result<Self> {
        fs::create_dir_all(&output.path)?;
        Ok(Self {
            output,
            history: Vec::new(),
        })
    }

    /// Whether a dump is due at this generation.
    pub fn should_save(&self, generation: usize) -> bool {
        generation > 0 && generation % self.output.frequency == 0
    }

    /// Paths of the dumps written so far.
    pub fn history(&self) -> &[PathBuf] {
        &self.history
    }

    /// Write one dump and refresh the latest pointer. Both writes go through
    /// a temporary file and a rename so a crash never leaves a torn file.
    pub fn save(&mut self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let serialized = serde_json::to_string(checkpoint)
            .map_err(|e| EngineError::checkpoint(format!("serialization failed: {}", e)))?;

        let filename = format!("checkpoint_{:08}.json", checkpoint.counters.generation);
        let path = self.output.path.join(&filename);
        write_atomically(&path, &serialized)?;
        write_atomically(&self.output.path.join(LATEST_FILE), &serialized)?;

        self.history.push(path.clone());
        Ok(path)
    }

    /// Load the latest dump under a path, if one exists.
    pub fn load_latest(path: &Path) -> Result<Option<Checkpoint>> {
        let latest = path.join(LATEST_FILE);
        if !latest.exists() {
            return Ok(None);
        }
        load(&latest).map(Some)
    }
}

/// Load and validate one checkpoint file.
pub fn load(path: &Path) -> Result<Checkpoint> {
    let contents = fs::read_to_string(path)?;
    let checkpoint: Checkpoint = serde_json::from_str(&contents)
        .map_err(|e| EngineError::checkpoint(format!("{}: {}", path.display(), e)))?;
    if checkpoint.agent.is_some() && checkpoint.off_policy.is_none() {
        return Err(EngineError::checkpoint(format!(
            "{}: agent state without off-policy state",
            path.display()
        )));
    }
    Ok(checkpoint)
}

fn write_atomically(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
