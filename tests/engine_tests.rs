//! End-to-end runs over the in-process fabric: optimizer waves, fan-out
//! fairness, agent training, testing mode, checkpoint resume and clean
//! shutdown.

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use serde_json::json;
use std::time::Duration;
use wavepool::{
    run_optimization, run_training, DistributionUpdater, EngineConfig, Environment, EpisodeLink,
    FileOutput, Mode, NullLogger, PolicyLearner, PolicySnapshot, Problem, ReplayBuffer, Result,
    TerminationCriteria, TerminationReason, TerminationKind,
};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

struct Rosenbrock;

impl Problem for Rosenbrock {
    fn parameter_count(&self) -> usize {
        2
    }

    fn evaluate_fitness(&self, p: &[f64]) -> f64 {
        let (x, y) = (p[0], p[1]);
        -((1.0 - x).powi(2) + 100.0 * (y - x * x).powi(2))
    }
}

/// Problem with a fixed per-evaluation cost, for fairness measurements.
struct SlowSphere {
    delay: Duration,
}

impl Problem for SlowSphere {
    fn parameter_count(&self) -> usize {
        2
    }

    fn evaluate_fitness(&self, p: &[f64]) -> f64 {
        std::thread::sleep(self.delay);
        -p.iter().map(|x| x * x).sum::<f64>()
    }
}

/// Elite-mean search distribution: samples around the mean, recenters on the
/// better half of the wave.
struct EliteMeanSearch {
    mean: Vec<f64>,
    spread: f64,
    rng: Xoshiro256StarStar,
    last_wave: Vec<f64>,
}

impl EliteMeanSearch {
    fn new(mean: Vec<f64>, spread: f64, seed: u64) -> Self {
        Self {
            mean,
            spread,
            rng: Xoshiro256StarStar::seed_from_u64(seed),
            last_wave: Vec::new(),
        }
    }
}

impl DistributionUpdater for EliteMeanSearch {
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn generate_wave(&mut self, samples: &mut [f64]) {
        let dim = self.mean.len();
        for sample in samples.chunks_exact_mut(dim) {
            for (value, mean) in sample.iter_mut().zip(self.mean.iter()) {
                *value = mean + self.spread * (2.0 * self.rng.gen::<f64>() - 1.0);
            }
        }
        self.last_wave = samples.to_vec();
    }

    fn update_distribution(&mut self, fitness: &[f64]) {
        let dim = self.mean.len();
        let mut order: Vec<usize> = (0..fitness.len()).collect();
        order.sort_by(|&a, &b| fitness[b].partial_cmp(&fitness[a]).unwrap());
        let elites = &order[..(order.len() / 2).max(1)];

        let mut mean = vec![0.0; dim];
        for &i in elites {
            for d in 0..dim {
                mean[d] += self.last_wave[i * dim + d];
            }
        }
        for value in mean.iter_mut() {
            *value /= elites.len() as f64;
        }
        self.mean = mean;
    }
}

/// Deterministic chain environment: five steps, reward peaks at action 0.5.
struct ChainEnv {
    length: usize,
}

impl Environment for ChainEnv {
    fn state_dimension(&self) -> usize {
        1
    }

    fn action_dimension(&self) -> usize {
        1
    }

    fn run_episode(&mut self, _environment_id: usize, link: &mut dyn EpisodeLink) -> Result<()> {
        let mut reward = 0.0;
        for step in 0..self.length {
            let action = link.exchange(&[step as f64], reward)?;
            reward = 1.0 - (action[0] - 0.5).abs();
        }
        link.finish(TerminationKind::Terminal, reward, None)
    }
}

/// Deterministic scalar policy: acts with its mean, learns from the retrace
/// residual. The whole state lives in the exported hyperparameters, so a
/// resumed run is bit-identical to an uninterrupted one.
struct ScalarPolicy {
    theta: f64,
    value: f64,
    updates: usize,
    sigma: f64,
}

impl ScalarPolicy {
    fn new() -> Self {
        Self {
            theta: 0.0,
            value: 0.0,
            updates: 0,
            sigma: 0.3,
        }
    }

    fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            state_value: self.value,
            distribution_parameters: vec![self.theta],
            ..Default::default()
        }
    }
}

impl PolicyLearner for ScalarPolicy {
    fn action(&mut self, _state: &[f64]) -> (Vec<f64>, PolicySnapshot) {
        (vec![self.theta], self.snapshot())
    }

    fn run_policy(&self, states: &[&[f64]]) -> Result<Vec<PolicySnapshot>> {
        Ok(states.iter().map(|_| self.snapshot()).collect())
    }

    fn importance_weight(
        &self,
        action: &[f64],
        current: &PolicySnapshot,
        behavior: &PolicySnapshot,
    ) -> f64 {
        let a = action[0];
        let current_mean = current.distribution_parameters[0];
        let behavior_mean = behavior.distribution_parameters[0];
        let scale = 2.0 * self.sigma * self.sigma;
        (((a - behavior_mean).powi(2) - (a - current_mean).powi(2)) / scale).exp()
    }

    fn step(
        &mut self,
        buffer: &ReplayBuffer,
        mini_batch: &[wavepool::ExperienceId],
        learning_rate: f64,
    ) -> Result<()> {
        let mut residual = 0.0;
        for &id in mini_batch {
            let experience = buffer.get(id).expect("mini-batch ids are live");
            residual += experience.retrace_value - experience.current_policy.state_value;
        }
        residual /= mini_batch.len() as f64;
        self.theta += learning_rate * residual * 0.1;
        self.value += learning_rate * residual;
        self.updates += 1;
        Ok(())
    }

    fn export_hyperparameters(&self) -> serde_json::Value {
        json!({
            "theta": self.theta,
            "value": self.value,
            "updates": self.updates,
        })
    }

    fn import_hyperparameters(&mut self, hyperparameters: serde_json::Value) -> Result<()> {
        self.theta = hyperparameters["theta"].as_f64().unwrap_or(0.0);
        self.value = hyperparameters["value"].as_f64().unwrap_or(0.0);
        self.updates = hyperparameters["updates"].as_u64().unwrap_or(0) as usize;
        Ok(())
    }
}

fn training_config(seed: u64) -> EngineConfig {
    let mut config = EngineConfig::new()
        .with_seed(seed)
        .with_rank_count(1)
        .with_episodes_per_generation(2)
        .with_mini_batch_size(8)
        .with_learning_rate(0.1);
    config.experience_replay.start_size = 16;
    config.experience_replay.maximum_size = 128;
    config.experience_replay.off_policy.annealing_rate = 1e-3;
    config
}

// ---------------------------------------------------------------------------
// Optimizer mode
// ---------------------------------------------------------------------------

#[test]
fn optimizer_smoke_rosenbrock() {
    let initial_mean = vec![-1.5, 2.0];
    let config = EngineConfig::new()
        .with_rank_count(4)
        .with_population_size(8)
        .with_seed(0xC0FFEE)
        .with_termination(TerminationCriteria {
            max_generations: Some(1),
            ..Default::default()
        });

    let updater = EliteMeanSearch::new(initial_mean.clone(), 1.0, 0xC0FFEE);
    let outcome = run_optimization(config, Box::new(updater), |_| Rosenbrock, &mut NullLogger)
        .expect("run failed");

    assert_eq!(outcome.reason, TerminationReason::MaxGenerations);
    assert_eq!(outcome.generations, 1);
    assert_eq!(outcome.fitness_evaluations, 8);
    assert!(outcome.best_fitness.is_finite());
    // The elite recentering moved the mean away from its initialization,
    // which shows in a best candidate differing from the initial mean.
    assert!(
        (outcome.best_parameters[0] - initial_mean[0]).abs() > 1e-9
            || (outcome.best_parameters[1] - initial_mean[1]).abs() > 1e-9
    );
}

#[test]
fn fan_out_fairness_across_workers() {
    // Pool of 4 workers (coordinator excluded), wave of 16 samples of equal
    // cost: each worker completes 16/4 ± 1.
    let config = EngineConfig::new()
        .with_rank_count(5)
        .with_coordinator_evaluates(false)
        .with_population_size(16)
        .with_seed(1)
        .with_termination(TerminationCriteria {
            max_generations: Some(1),
            ..Default::default()
        });

    let counts = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let updater = EliteMeanSearch::new(vec![0.0, 0.0], 1.0, 1);

    // Observe the per-worker counts through the problem side: each rank's
    // instance counts its own evaluations.
    struct CountingProblem {
        inner: SlowSphere,
        rank: usize,
        counts: std::sync::Arc<std::sync::Mutex<Vec<(usize, usize)>>>,
        seen: std::cell::Cell<usize>,
    }

    impl Problem for CountingProblem {
        fn parameter_count(&self) -> usize {
            self.inner.parameter_count()
        }

        fn evaluate_fitness(&self, p: &[f64]) -> f64 {
            self.seen.set(self.seen.get() + 1);
            self.inner.evaluate_fitness(p)
        }
    }

    impl Drop for CountingProblem {
        fn drop(&mut self) {
            self.counts.lock().unwrap().push((self.rank, self.seen.get()));
        }
    }

    let outcome = run_optimization(
        config,
        Box::new(updater),
        |rank| CountingProblem {
            inner: SlowSphere {
                delay: Duration::from_millis(20),
            },
            rank,
            counts: counts.clone(),
            seen: std::cell::Cell::new(0),
        },
        &mut NullLogger,
    )
    .expect("run failed");
    assert_eq!(outcome.fitness_evaluations, 16);

    let counts = counts.lock().unwrap();
    for &(rank, count) in counts.iter() {
        if rank == 0 {
            assert_eq!(count, 0, "coordinator was excluded from the pool");
        } else {
            assert!(
                (count as i64 - 4).abs() <= 1,
                "worker {} completed {} samples, expected 4 ± 1",
                rank,
                count
            );
        }
    }
}

#[test]
fn clean_shutdown_on_max_generations() {
    let config = EngineConfig::new()
        .with_rank_count(3)
        .with_population_size(4)
        .with_seed(2)
        .with_termination(TerminationCriteria {
            max_generations: Some(2),
            ..Default::default()
        });

    let updater = EliteMeanSearch::new(vec![0.0, 0.0], 0.5, 2);
    // run_optimization joins every worker thread; returning at all proves the
    // finalize + barrier handshake released them.
    let outcome = run_optimization(config, Box::new(updater), |_| Rosenbrock, &mut NullLogger)
        .expect("run failed");
    assert_eq!(outcome.reason, TerminationReason::MaxGenerations);
    assert_eq!(outcome.generations, 2);
}

#[test]
fn non_finite_fitness_aborts_the_run() {
    struct PoisonedProblem;

    impl Problem for PoisonedProblem {
        fn parameter_count(&self) -> usize {
            1
        }

        fn evaluate_fitness(&self, _p: &[f64]) -> f64 {
            f64::INFINITY
        }
    }

    let config = EngineConfig::new()
        .with_rank_count(2)
        .with_population_size(2)
        .with_termination(TerminationCriteria {
            max_generations: Some(1),
            ..Default::default()
        });

    let updater = EliteMeanSearch::new(vec![0.0], 0.5, 3);
    let error = run_optimization(config, Box::new(updater), |_| PoisonedProblem, &mut NullLogger)
        .unwrap_err();
    assert!(matches!(error, wavepool::EngineError::Evaluation(_)));
}

// ---------------------------------------------------------------------------
// Agent mode
// ---------------------------------------------------------------------------

#[test]
fn training_fills_replay_and_updates_policy() {
    let config = training_config(7).with_termination(TerminationCriteria {
        max_generations: Some(5),
        ..Default::default()
    });

    let outcome = run_training(
        config,
        Box::new(ScalarPolicy::new()),
        |_| ChainEnv { length: 5 },
        &mut NullLogger,
    )
    .expect("run failed");

    assert_eq!(outcome.reason, TerminationReason::MaxGenerations);
    assert_eq!(outcome.generations, 5);
    assert_eq!(outcome.episodes, 10);
    assert_eq!(outcome.experiences, 50);
    // 50 experiences past a start size of 16 pay for updates at one
    // experience per update; the gate closes once the count overtakes the
    // surplus.
    assert_eq!(outcome.policy_updates, 35);
    assert!(outcome.average_reward.is_finite());
    assert!(outcome.testing_average_reward.is_none());
}

#[test]
fn training_over_worker_ranks() {
    let mut config = training_config(11).with_rank_count(3);
    config.concurrent_environments = 2;
    config.coordinator_evaluates = false;
    config.termination = TerminationCriteria {
        max_episodes: Some(6),
        ..Default::default()
    };

    let outcome = run_training(
        config,
        Box::new(ScalarPolicy::new()),
        |_| ChainEnv { length: 5 },
        &mut NullLogger,
    )
    .expect("run failed");

    assert_eq!(outcome.reason, TerminationReason::MaxEpisodes);
    assert!(outcome.episodes >= 6);
    assert_eq!(outcome.experiences, outcome.episodes * 5);
}

#[test]
fn start_size_beyond_capacity_never_updates() {
    let mut config = training_config(13);
    config.experience_replay.start_size = 500;
    config.experience_replay.maximum_size = 64;
    config.mini_batch_size = 8;
    config.termination = TerminationCriteria {
        max_experiences: Some(60),
        ..Default::default()
    };

    let outcome = run_training(
        config,
        Box::new(ScalarPolicy::new()),
        |_| ChainEnv { length: 5 },
        &mut NullLogger,
    )
    .expect("run failed");

    assert_eq!(outcome.reason, TerminationReason::MaxExperiences);
    assert_eq!(outcome.policy_updates, 0);
}

#[test]
fn testing_mode_reports_average_reward() {
    let mut config = training_config(17).with_mode(Mode::Testing);
    config.policy_testing_episodes = 4;

    let outcome = run_training(
        config,
        Box::new(ScalarPolicy::new()),
        |_| ChainEnv { length: 5 },
        &mut NullLogger,
    )
    .expect("run failed");

    assert_eq!(outcome.reason, TerminationReason::TestingComplete);
    // theta = 0: each step earns 1 - |0 - 0.5| = 0.5, five steps per episode.
    let average = outcome.testing_average_reward.expect("testing average");
    assert!((average - 2.5).abs() < 1e-9);
    assert_eq!(outcome.policy_updates, 0);
}

#[test]
fn checkpoint_resume_matches_uninterrupted_run() {
    let uninterrupted_dir = tempfile::tempdir().unwrap();
    let resumed_dir = tempfile::tempdir().unwrap();

    let with_output = |path: std::path::PathBuf, max_generations: usize| {
        let mut config = training_config(23);
        config.file_output = FileOutput {
            enabled: true,
            frequency: 1,
            path,
        };
        config.termination = TerminationCriteria {
            max_generations: Some(max_generations),
            ..Default::default()
        };
        config
    };

    // Six generations in one go.
    run_training(
        with_output(uninterrupted_dir.path().to_path_buf(), 6),
        Box::new(ScalarPolicy::new()),
        |_| ChainEnv { length: 5 },
        &mut NullLogger,
    )
    .expect("uninterrupted run failed");

    // Three generations, stop, resume for three more from the checkpoint.
    run_training(
        with_output(resumed_dir.path().to_path_buf(), 3),
        Box::new(ScalarPolicy::new()),
        |_| ChainEnv { length: 5 },
        &mut NullLogger,
    )
    .expect("first half failed");
    let resumed = run_training(
        with_output(resumed_dir.path().to_path_buf(), 6),
        Box::new(ScalarPolicy::new()),
        |_| ChainEnv { length: 5 },
        &mut NullLogger,
    )
    .expect("second half failed");

    assert_eq!(resumed.generations, 6);
    assert_eq!(resumed.episodes, 12);

    let full = wavepool::Checkpointer::load_latest(uninterrupted_dir.path())
        .unwrap()
        .expect("uninterrupted checkpoint");
    let halved = wavepool::Checkpointer::load_latest(resumed_dir.path())
        .unwrap()
        .expect("resumed checkpoint");

    assert_eq!(full.counters.generation, 6);
    assert_eq!(halved.counters.generation, 6);
    assert_eq!(full.counters.experience_count, halved.counters.experience_count);
    assert_eq!(
        full.counters.policy_update_count,
        halved.counters.policy_update_count
    );
    // Same seed, same schedule: the resumed policy is bit-identical.
    assert_eq!(full.hyperparameters, halved.hyperparameters);

    let full_replay = full.replay.expect("replay serialized");
    let halved_replay = halved.replay.expect("replay serialized");
    assert_eq!(full_replay.start_id, halved_replay.start_id);
    assert_eq!(full_replay.experiences.len(), halved_replay.experiences.len());
    for (a, b) in full_replay
        .experiences
        .iter()
        .zip(halved_replay.experiences.iter())
    {
        assert_eq!(a.state, b.state);
        assert_eq!(a.reward, b.reward);
        assert_eq!(a.retrace_value, b.retrace_value);
        assert_eq!(a.importance_weight, b.importance_weight);
        assert_eq!(a.episode_id, b.episode_id);
    }
}

#[test]
fn off_policy_accounting_follows_the_cutoff() {
    use wavepool::{Experience, MetadataRefresh, OffPolicyController, OffPolicySettings};

    // A learner whose importance weight is carried verbatim in the evaluated
    // policy, so stored weights can be seeded precisely.
    struct CarrierLearner;

    impl PolicyLearner for CarrierLearner {
        fn action(&mut self, _state: &[f64]) -> (Vec<f64>, PolicySnapshot) {
            (vec![0.0], PolicySnapshot::default())
        }

        fn run_policy(&self, states: &[&[f64]]) -> Result<Vec<PolicySnapshot>> {
            Ok(states.iter().map(|_| PolicySnapshot::default()).collect())
        }

        fn importance_weight(
            &self,
            _action: &[f64],
            current: &PolicySnapshot,
            _behavior: &PolicySnapshot,
        ) -> f64 {
            current.distribution_parameters[0]
        }

        fn step(
            &mut self,
            _buffer: &ReplayBuffer,
            _mini_batch: &[wavepool::ExperienceId],
            _learning_rate: f64,
        ) -> Result<()> {
            Ok(())
        }

        fn export_hyperparameters(&self) -> serde_json::Value {
            serde_json::Value::Null
        }

        fn import_hyperparameters(&mut self, _hyperparameters: serde_json::Value) -> Result<()> {
            Ok(())
        }
    }

    let mut buffer = ReplayBuffer::new(1024);
    let mut rng = Xoshiro256StarStar::seed_from_u64(99);
    let mut weights = Vec::with_capacity(1000);
    for episode in 0..1000u64 {
        buffer.append(Experience::new(
            vec![0.0],
            vec![0.0],
            1.0,
            TerminationKind::Terminal,
            episode,
            0,
            PolicySnapshot::default(),
            0,
        ));
        // Weights uniform in [1/3, 3].
        weights.push(1.0 / 3.0 + rng.gen::<f64>() * (3.0 - 1.0 / 3.0));
    }

    let ids: Vec<wavepool::ExperienceId> = (0..1000).collect();
    let policies: Vec<PolicySnapshot> = weights
        .iter()
        .map(|&w| PolicySnapshot {
            distribution_parameters: vec![w],
            ..Default::default()
        })
        .collect();

    let learner = CarrierLearner;
    let settings = OffPolicySettings {
        cutoff_scale: 4.0,
        target: 0.1,
        annealing_rate: 0.1,
        refer_beta: 0.3,
    };
    let mut controller = OffPolicyController::new(&settings, 1e-3);

    buffer
        .update_metadata(
            &ids,
            &policies,
            &MetadataRefresh {
                learner: &learner,
                discount: 0.99,
                truncation_level: 1.0,
                cutoff: controller.cutoff(),
            },
        )
        .unwrap();

    let outside = weights.iter().filter(|&&w| w < 0.25 || w > 4.0).count();
    assert_eq!(buffer.off_policy_count(), outside);
    assert_eq!(outside, 0, "weights in [1/3, 3] all sit inside [1/4, 4]");

    // Ratio 0 is below the 0.1 target: the band must widen.
    controller.tick(buffer.off_policy_count(), buffer.len());
    assert!(controller.cutoff() > 4.0);
    buffer.reclassify(controller.cutoff());
    assert_eq!(buffer.off_policy_count(), 0);

    // Tighten the band below part of the weights and feed the resulting
    // ratio back: above target, the band must now shrink.
    buffer.reclassify(1.5);
    let outside = weights
        .iter()
        .filter(|&&w| w < 1.0 / 1.5 || w > 1.5)
        .count();
    assert_eq!(buffer.off_policy_count(), outside);
    assert!(buffer.off_policy_ratio() > 0.1);

    let cutoff_before = controller.cutoff();
    controller.tick(buffer.off_policy_count(), buffer.len());
    assert!(controller.cutoff() < cutoff_before);
    assert!(controller.learning_rate() < 1e-3);
}

#[test]
fn target_average_reward_terminates_training() {
    let mut config = training_config(29);
    // theta = 0 earns 0.5 per step, 2.5 per episode, reached immediately.
    config.termination = TerminationCriteria {
        target_average_reward: Some(2.0),
        max_generations: Some(50),
        ..Default::default()
    };

    let outcome = run_training(
        config,
        Box::new(ScalarPolicy::new()),
        |_| ChainEnv { length: 5 },
        &mut NullLogger,
    )
    .expect("run failed");

    assert_eq!(outcome.reason, TerminationReason::TargetAverageReward);
    assert!(outcome.average_reward >= 2.0);
}
