//! # Wavepool: distributed generation-based optimization and off-policy RL
//!
//! A framework for population-based stochastic optimization and off-policy
//! reinforcement learning in which every generation fans a λ-sized wave of
//! evaluations out over a fixed pool of ranks and folds the results back into
//! a sequential update rule.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Rank 0 (coordinator)                     │
//! │  GenerationDriver ─► OptimizerLoop / AgentLoop                   │
//! │        │                    │                                    │
//! │        │             SampleDispatcher ── WorkerPool (FIFO)       │
//! │        │                    │                                    │
//! │        │              ReplayBuffer ◄─ OffPolicyController        │
//! │        ▼                    ▼                                    │
//! │    Checkpointer         Transport (fire-and-forget + broadcast)  │
//! └─────────────────────────────┬────────────────────────────────────┘
//!                               │
//!            ┌──────────────────┼──────────────────┐
//!            ▼                  ▼                  ▼
//!       ┌─────────┐        ┌─────────┐        ┌─────────┐
//!       │ Rank 1  │        │ Rank 2  │        │ Rank N  │
//!       │ worker  │        │ worker  │        │ worker  │
//!       └─────────┘        └─────────┘        └─────────┘
//! ```
//!
//! Workers evaluate fitness candidates or run environment episodes; the
//! coordinator owns all sequential logic. Cross-rank state flows only through
//! messages, and each rank is single-threaded and cooperative: the only
//! suspension points are the progress pump, collective waits and the final
//! barrier.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wavepool::{run_optimization, EngineConfig, NullLogger};
//!
//! let config = EngineConfig::new()
//!     .with_rank_count(4)
//!     .with_population_size(32)
//!     .with_seed(42);
//!
//! let outcome = run_optimization(config, Box::new(my_updater), |_rank| MyProblem, &mut NullLogger)?;
//! println!("best fitness: {}", outcome.best_fitness);
//! ```

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod engine;
pub mod error;
pub mod interfaces;
pub mod messages;
pub mod metrics;
pub mod optimizer;
pub mod replay;
pub mod transport;

// Configuration and errors
pub use config::{
    EngineConfig, ExperienceReplaySettings, FileOutput, L2Regularization, MiniBatchStrategy, Mode,
    OffPolicySettings, RewardOutboundPenalization, TerminationCriteria,
};
pub use error::{EngineError, Result};

// Trait seams for collaborators
pub use interfaces::{DistributionUpdater, Environment, EpisodeLink, PolicyLearner, Problem};

// Replay memory
pub use replay::{
    compute_retrace, Experience, ExperienceId, MetadataRefresh, OffPolicyController,
    OffPolicyState, PolicySnapshot, ReplayBuffer, ReplayState, RetraceBootstrap, TerminationKind,
};

// Dispatch
pub use dispatch::{SampleDispatcher, SampleMatrix, WorkerPool};

// Agent and optimizer loops
pub use agent::{AgentLoop, AgentState, RewardRescaling, StateRescaling, TrainingHistory};
pub use optimizer::OptimizerLoop;

// Driver and engine entry points
pub use driver::{Counters, GenerationDriver, TerminationReason};
pub use engine::{
    report_fatal, run_optimization, run_training, OptimizationOutcome, TrainingOutcome,
};

// Messaging and transport
pub use messages::{Message, RankId, WorkerCommand, WorkerEvent};
pub use transport::{LocalEndpoint, LocalFabric, Transport};

// Checkpointing and metrics
pub use checkpoint::{Checkpoint, Checkpointer};
pub use metrics::{
    ConsoleLogger, CsvLogger, GenerationSnapshot, MetricsLogger, NullLogger, SharedMetrics,
};
