//! Worker main loop for agent mode and the worker side of the episode
//! channel.

use crate::error::{EngineError, Result};
use crate::interfaces::{Environment, EpisodeLink};
use crate::messages::{Message, WorkerCommand, WorkerEvent};
use crate::replay::TerminationKind;
use crate::transport::Transport;

/// Worker side of the per-step episode channel.
///
/// Each exchange ships the current state (and the previous reward) to the
/// coordinator and blocks, pumping the inbox, until the answering action for
/// this slot arrives. A finalize command received mid-episode aborts the
/// exchange; the main loop then leaves without reporting a fault.
struct RemoteEpisodeLink<'a, T: Transport> {
    transport: &'a T,
    slot: usize,
    finalized: bool,
}

impl<T: Transport> EpisodeLink for RemoteEpisodeLink<'_, T> {
    fn exchange(&mut self, state: &[f64], reward: f64) -> Result<Vec<f64>> {
        self.transport.send(
            0,
            WorkerEvent::EpisodeStep {
                worker: self.transport.rank_id(),
                slot: self.slot,
                state: state.to_vec(),
                reward,
            }
            .into(),
        )?;

        loop {
            match self.transport.wait()? {
                Message::Command(WorkerCommand::Action { slot, action }) if slot == self.slot => {
                    return Ok(action);
                }
                Message::Command(WorkerCommand::Finalize) => {
                    self.finalized = true;
                    return Err(EngineError::transport("episode aborted by finalize"));
                }
                _ => {}
            }
        }
    }

    fn finish(
        &mut self,
        termination: TerminationKind,
        reward: f64,
        truncated_state: Option<&[f64]>,
    ) -> Result<()> {
        self.transport.send(
            0,
            WorkerEvent::EpisodeEnd {
                worker: self.transport.rank_id(),
                slot: self.slot,
                termination,
                reward,
                truncated_state: truncated_state.map(|s| s.to_vec()),
            }
            .into(),
        )
    }
}

/// Worker main loop for agent mode.
///
/// Runs one episode at a time on command, shipping steps through the episode
/// channel. An environment error is reported as a fault and the worker keeps
/// waiting for finalize; the coordinator decides to abort the run. The loop
/// closes with the final collective barrier.
pub fn agent_worker_main<T: Transport>(
    transport: &T,
    environment: &mut dyn Environment,
) -> Result<()> {
    let mut continue_evaluations = true;

    while continue_evaluations {
        match transport.wait()? {
            Message::Command(WorkerCommand::StartEpisode {
                slot,
                environment_id,
            }) => {
                let mut link = RemoteEpisodeLink {
                    transport,
                    slot,
                    finalized: false,
                };
                match environment.run_episode(environment_id, &mut link) {
                    Ok(()) => {}
                    Err(_) if link.finalized => {
                        continue_evaluations = false;
                    }
                    Err(error) => {
                        transport.send(
                            0,
                            WorkerEvent::Fault {
                                worker: transport.rank_id(),
                                detail: error.to_string(),
                            }
                            .into(),
                        )?;
                    }
                }
            }
            Message::Command(WorkerCommand::Finalize) => continue_evaluations = false,
            _ => {}
        }
    }

    transport.barrier()
}
