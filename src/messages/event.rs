//! Notifications sent from workers back to the coordinator.

use super::RankId;
use crate::replay::TerminationKind;

/// Worker-to-coordinator notification. Each variant carries the sender's rank
/// so completion handling can return the worker to the idle pool; results map
/// to their slot by the carried index, never by arrival order.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A fitness evaluation finished.
    FitnessReady {
        worker: RankId,
        sample: usize,
        fitness: f64,
    },

    /// An in-flight episode produced a new state; `reward` belongs to the
    /// previous action and is zero on the first step.
    EpisodeStep {
        worker: RankId,
        slot: usize,
        state: Vec<f64>,
        reward: f64,
    },

    /// An in-flight episode ended. `reward` belongs to the final action;
    /// truncated episodes carry the state they were cut at.
    EpisodeEnd {
        worker: RankId,
        slot: usize,
        termination: TerminationKind,
        reward: f64,
        truncated_state: Option<Vec<f64>>,
    },

    /// The worker's callback failed in a way that poisons the run.
    Fault { worker: RankId, detail: String },
}

impl WorkerEvent {
    /// Rank that produced this event.
    pub fn worker(&self) -> RankId {
        match self {
            WorkerEvent::FitnessReady { worker, .. }
            | WorkerEvent::EpisodeStep { worker, .. }
            | WorkerEvent::EpisodeEnd { worker, .. }
            | WorkerEvent::Fault { worker, .. } => *worker,
        }
    }
}
