//! State and reward normalization statistics.
//!
//! Uses Welford's online algorithm for numerically stable running moments.
//! Both statistics are computed once, after the initial collection phase has
//! filled the replay memory past its start size, and frozen for the rest of
//! the run so that stored and incoming experiences share one normalization.

use serde::{Deserialize, Serialize};

/// Per-dimension running mean and standard deviation of observed states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRescaling {
    mean: Vec<f64>,
    var_sum: Vec<f64>,
    count: f64,
    frozen: bool,
    epsilon: f64,
}

impl StateRescaling {
    /// Create a tracker for `dimension`-dimensional states.
    pub fn new(dimension: usize) -> Self {
        Self {
            mean: vec![0.0; dimension],
            var_sum: vec![0.0; dimension],
            count: 0.0,
            frozen: false,
            epsilon: 1e-9,
        }
    }

    /// Whether the statistics have been frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Number of observed states.
    pub fn count(&self) -> f64 {
        self.count
    }

    /// Per-dimension means.
    pub fn means(&self) -> &[f64] {
        &self.mean
    }

    /// Per-dimension standard deviations.
    pub fn sigmas(&self) -> Vec<f64> {
        self.mean
            .iter()
            .enumerate()
            .map(|(i, _)| self.sigma(i))
            .collect()
    }

    fn sigma(&self, i: usize) -> f64 {
        if self.count < 2.0 {
            1.0
        } else {
            (self.var_sum[i] / self.count).sqrt().max(self.epsilon)
        }
    }

    /// Fold one state into the statistics. No-op once frozen.
    pub fn observe(&mut self, state: &[f64]) {
        if self.frozen {
            return;
        }
        assert_eq!(state.len(), self.mean.len(), "state dimension mismatch");
        self.count += 1.0;
        for (i, &x) in state.iter().enumerate() {
            let delta = x - self.mean[i];
            self.mean[i] += delta / self.count;
            self.var_sum[i] += delta * (x - self.mean[i]);
        }
    }

    /// Freeze the statistics; subsequent observations are ignored.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Normalize a state to zero mean and unit variance in place.
    pub fn normalize(&self, state: &mut [f64]) {
        assert_eq!(state.len(), self.mean.len(), "state dimension mismatch");
        for (i, x) in state.iter_mut().enumerate() {
            *x = (*x - self.mean[i]) / self.sigma(i);
        }
    }
}

/// Per-environment reward scale, σ of the observed rewards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardRescaling {
    sum_squared: Vec<f64>,
    count: Vec<f64>,
    sigma: Vec<f64>,
    frozen: bool,
}

impl RewardRescaling {
    /// Create a tracker for `environment_count` environments.
    pub fn new(environment_count: usize) -> Self {
        Self {
            sum_squared: vec![0.0; environment_count],
            count: vec![0.0; environment_count],
            sigma: vec![1.0; environment_count],
            frozen: false,
        }
    }

    /// Whether the scales have been frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Current scale for an environment.
    pub fn sigma(&self, environment_id: usize) -> f64 {
        self.sigma[environment_id]
    }

    /// Fold one raw reward into the statistics. No-op once frozen.
    pub fn observe(&mut self, environment_id: usize, reward: f64) {
        if self.frozen {
            return;
        }
        self.sum_squared[environment_id] += reward * reward;
        self.count[environment_id] += 1.0;
    }

    /// Compute the per-environment scales from the accumulated sums and
    /// freeze them. Environments without observations keep scale 1.
    pub fn freeze(&mut self) {
        for i in 0..self.sigma.len() {
            if self.count[i] > 0.0 {
                let sigma = (self.sum_squared[i] / self.count[i]).sqrt();
                if sigma > 0.0 && sigma.is_finite() {
                    self.sigma[i] = sigma;
                }
            }
        }
        self.frozen = true;
    }

    /// Scale a reward by the environment's σ. Identity before freezing.
    pub fn scale(&self, environment_id: usize, reward: f64) -> f64 {
        reward / self.sigma[environment_id]
    }
}
