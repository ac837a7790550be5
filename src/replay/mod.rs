//! Experience replay: bounded storage, retrace estimation and off-policy
//! accounting.

pub mod buffer;
pub mod experience;
pub mod off_policy;
pub mod retrace;

pub use buffer::{MetadataRefresh, ReplayBuffer, ReplayState};
pub use experience::{Experience, ExperienceId, PolicySnapshot, TerminationKind};
pub use off_policy::{OffPolicyController, OffPolicyState};
pub use retrace::{compute_retrace, RetraceBootstrap};
