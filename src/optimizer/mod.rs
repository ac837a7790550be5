//! Optimizer-mode generation logic.
//!
//! One generation asks the distribution updater for a wave of candidates,
//! fans the wave out through the sample dispatcher and feeds the fitness
//! vector back into the updater. The engine tracks the best candidate seen
//! so far; fitness is maximized.

use crate::config::EngineConfig;
use crate::dispatch::{SampleDispatcher, SampleMatrix};
use crate::driver::Counters;
use crate::error::Result;
use crate::interfaces::{DistributionUpdater, Problem};
use crate::transport::Transport;

/// Coordinator-side optimizer state machine.
pub struct OptimizerLoop {
    updater: Box<dyn DistributionUpdater>,
    dispatcher: SampleDispatcher,
    samples: SampleMatrix,
    best_fitness: f64,
    best_sample: Vec<f64>,
}

impl OptimizerLoop {
    /// Create the optimizer loop for candidates of `parameter_count`
    /// dimensions.
    pub fn new(
        config: &EngineConfig,
        updater: Box<dyn DistributionUpdater>,
        parameter_count: usize,
    ) -> Self {
        Self {
            updater,
            dispatcher: SampleDispatcher::new(
                config.population_size,
                config.rank_count,
                config.coordinator_evaluates,
            ),
            samples: SampleMatrix::new(config.population_size, parameter_count),
            best_fitness: f64::NEG_INFINITY,
            best_sample: vec![0.0; parameter_count],
        }
    }

    /// Prepare the updater before the first generation.
    pub fn initialize(&mut self) -> Result<()> {
        self.updater.initialize()
    }

    /// The wave dispatcher.
    pub fn dispatcher(&self) -> &SampleDispatcher {
        &self.dispatcher
    }

    /// Best fitness observed so far.
    pub fn best_fitness(&self) -> f64 {
        self.best_fitness
    }

    /// Candidate that achieved the best fitness.
    pub fn best_sample(&self) -> &[f64] {
        &self.best_sample
    }

    /// Updater-specific convergence predicate.
    pub fn check_termination(&self) -> bool {
        self.updater.check_termination()
    }

    /// Report final results.
    pub fn print_results(&self) {
        self.updater.print_results();
    }

    /// Run one generation: generate the wave, evaluate it, update the
    /// distribution.
    pub fn run_generation<T: Transport>(
        &mut self,
        transport: &T,
        problem: &dyn Problem,
        counters: &mut Counters,
    ) -> Result<()> {
        self.updater.generate_wave(self.samples.data_mut());

        let fitness = self.dispatcher.run_wave(transport, problem, &self.samples)?;

        let mut best_of_wave = 0;
        for (i, &f) in fitness.iter().enumerate() {
            if f > fitness[best_of_wave] {
                best_of_wave = i;
            }
        }
        if fitness[best_of_wave] > self.best_fitness {
            self.best_fitness = fitness[best_of_wave];
            self.best_sample.copy_from_slice(self.samples.row(best_of_wave));
        }

        let fitness = fitness.to_vec();
        self.updater.update_distribution(&fitness);

        counters.fitness_evaluation_count += self.samples.lambda();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalFabric;

    struct Sphere;

    impl Problem for Sphere {
        fn parameter_count(&self) -> usize {
            2
        }

        fn evaluate_fitness(&self, parameters: &[f64]) -> f64 {
            -parameters.iter().map(|x| x * x).sum::<f64>()
        }
    }

    /// Deterministic stub: emits a fixed wave, remembers the fitness it saw.
    struct FixedWave {
        values: Vec<f64>,
        seen: Option<Vec<f64>>,
    }

    impl DistributionUpdater for FixedWave {
        fn initialize(&mut self) -> Result<()> {
            Ok(())
        }

        fn generate_wave(&mut self, samples: &mut [f64]) {
            samples.copy_from_slice(&self.values);
        }

        fn update_distribution(&mut self, fitness: &[f64]) {
            self.seen = Some(fitness.to_vec());
        }
    }

    #[test]
    fn test_generation_tracks_best_and_counts() {
        let config = EngineConfig::new().with_population_size(3);
        let updater = FixedWave {
            // Candidates (2,0), (1,0), (3,0): best is (1,0).
            values: vec![2.0, 0.0, 1.0, 0.0, 3.0, 0.0],
            seen: None,
        };
        let mut optimizer = OptimizerLoop::new(&config, Box::new(updater), 2);
        optimizer.initialize().unwrap();

        let mut endpoints = LocalFabric::create(1);
        let coordinator = endpoints.pop().unwrap();
        let mut counters = Counters::default();

        optimizer
            .run_generation(&coordinator, &Sphere, &mut counters)
            .unwrap();

        assert_eq!(counters.fitness_evaluation_count, 3);
        assert!((optimizer.best_fitness() - -1.0).abs() < 1e-12);
        assert_eq!(optimizer.best_sample(), &[1.0, 0.0]);
    }
}
