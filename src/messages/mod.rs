//! Message-passing vocabulary between the coordinator and the workers.
//!
//! All cross-rank traffic is fire-and-forget: a send completes locally and
//! the receiver drains its inbox at its next progress pump. Delivery is FIFO
//! per (source, destination) pair; nothing is assumed about cross-worker
//! ordering.
//!
//! # Architecture
//!
//! ```text
//!              +---------------------+
//!              |  Coordinator (0)    |
//!              +---------------------+
//!        WorkerCommand |     ^ WorkerEvent
//!                      v     |
//!              +---------------------+
//!              |  Worker ranks 1..N  |
//!              +---------------------+
//! ```

mod command;
mod event;

pub use command::WorkerCommand;
pub use event::WorkerEvent;

/// Rank identifier within the fabric. Rank 0 is the coordinator.
pub type RankId = usize;

/// A message travelling between ranks.
#[derive(Debug, Clone)]
pub enum Message {
    /// Coordinator-to-worker instruction.
    Command(WorkerCommand),
    /// Worker-to-coordinator notification.
    Event(WorkerEvent),
}

impl From<WorkerCommand> for Message {
    fn from(command: WorkerCommand) -> Self {
        Message::Command(command)
    }
}

impl From<WorkerEvent> for Message {
    fn from(event: WorkerEvent) -> Self {
        Message::Event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::TerminationKind;

    #[test]
    fn test_command_into_message() {
        let msg: Message = WorkerCommand::Evaluate { sample: 3 }.into();
        assert!(matches!(
            msg,
            Message::Command(WorkerCommand::Evaluate { sample: 3 })
        ));
    }

    #[test]
    fn test_event_into_message() {
        let msg: Message = WorkerEvent::EpisodeEnd {
            worker: 2,
            slot: 0,
            termination: TerminationKind::Terminal,
            reward: 1.0,
            truncated_state: None,
        }
        .into();
        assert!(matches!(msg, Message::Event(WorkerEvent::EpisodeEnd { worker: 2, .. })));
    }
}
