//! Retrace return estimation.
//!
//! Retrace is a truncated-importance-weighted n-step return estimator. For a
//! trajectory slice with rewards `r_t`, state values `V(s_t)` and truncated
//! importance weights `c_t = min(c_max, π_cur/π_old)`, the estimate satisfies
//! the backward recursion
//!
//! ```text
//! v_t = r_t + γ · ( V(s_{t+1}) + c_{t+1} · (v_{t+1} − V(s_{t+1})) )
//! ```
//!
//! bootstrapped with `V(s_T) = 0` at a true terminal and with the value of the
//! cut state at a truncation. This is equivalent to the forward form
//! `v_t = V(s_t) + Σ_{k≥t} γ^{k−t} (Π_{j=t+1..k} c_j) δ_k`.
//!
//! ## References
//!
//! - Munos et al., "Safe and efficient off-policy reinforcement learning"
//!   (2016)

/// Bootstrap value at the end of a trajectory slice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetraceBootstrap {
    /// True terminal: the value beyond the last step is zero.
    Terminal,
    /// Truncated episode: bootstrap with the value of the cut state.
    TruncatedState(f64),
}

impl RetraceBootstrap {
    fn value(self) -> f64 {
        match self {
            RetraceBootstrap::Terminal => 0.0,
            RetraceBootstrap::TruncatedState(v) => v,
        }
    }
}

/// Compute retrace values for a contiguous episode slice, newest step last.
///
/// # Arguments
///
/// * `rewards` - rewards `r_t` for each step of the slice
/// * `state_values` - `V(s_t)` under the current policy
/// * `truncated_importance_weights` - `c_t` per step
/// * `bootstrap` - closing value of the slice
/// * `discount` - discount factor γ
///
/// Returns one retrace value per step. Empty input yields an empty vector.
pub fn compute_retrace(
    rewards: &[f64],
    state_values: &[f64],
    truncated_importance_weights: &[f64],
    bootstrap: RetraceBootstrap,
    discount: f64,
) -> Vec<f64> {
    let n = rewards.len();
    if n == 0 {
        return Vec::new();
    }

    assert_eq!(state_values.len(), n);
    assert_eq!(truncated_importance_weights.len(), n);

    let mut values = vec![0.0; n];

    // At the closing step the correction term vanishes and the recursion
    // reduces to r_{T-1} + γ·bootstrap.
    let mut next_value = bootstrap.value();
    let mut next_retrace = bootstrap.value();
    let mut next_weight = 1.0;

    for t in (0..n).rev() {
        values[t] =
            rewards[t] + discount * (next_value + next_weight * (next_retrace - next_value));
        next_value = state_values[t];
        next_retrace = values[t];
        next_weight = truncated_importance_weights[t];
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retrace_three_step_terminal() {
        // Rewards [1, 2, 3], γ = 0.5, all weights 1, zero values, terminal.
        let values = compute_retrace(
            &[1.0, 2.0, 3.0],
            &[0.0, 0.0, 0.0],
            &[1.0, 1.0, 1.0],
            RetraceBootstrap::Terminal,
            0.5,
        );
        assert!((values[0] - 2.75).abs() < 1e-12);
        assert!((values[1] - 3.5).abs() < 1e-12);
        assert!((values[2] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_terminal_step_equals_reward() {
        // With γ·V(next) = 0 at a terminal, the last retrace value is the
        // last reward, whatever the value estimates are.
        let values = compute_retrace(
            &[0.4, -1.2, 5.0],
            &[0.9, -0.3, 2.2],
            &[0.7, 1.0, 0.2],
            RetraceBootstrap::Terminal,
            0.99,
        );
        assert!((values[2] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_truncated_bootstrap() {
        // Single step, truncated with V(cut state) = 2.0.
        let values = compute_retrace(
            &[1.0],
            &[0.5],
            &[1.0],
            RetraceBootstrap::TruncatedState(2.0),
            0.5,
        );
        assert!((values[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_weights_cut_the_trace() {
        // c_{t+1} = 0 removes the correction term: v_t = r_t + γ·V(s_{t+1}).
        let values = compute_retrace(
            &[1.0, 10.0],
            &[0.0, 3.0],
            &[1.0, 0.0],
            RetraceBootstrap::Terminal,
            0.5,
        );
        assert!((values[1] - 10.0).abs() < 1e-12);
        assert!((values[0] - (1.0 + 0.5 * 3.0)).abs() < 1e-12);
    }

    #[test]
    fn test_matches_forward_form() {
        // Cross-check the recursion against the forward sum on a slice with
        // non-trivial weights and values.
        let rewards = [1.0, -0.5, 2.0, 0.25];
        let values_v = [0.3, 0.1, -0.2, 0.4];
        let weights = [0.9, 0.8, 1.0, 0.6];
        let gamma = 0.9;
        let bootstrap = 0.0;

        let retrace = compute_retrace(
            &rewards,
            &values_v,
            &weights,
            RetraceBootstrap::Terminal,
            gamma,
        );

        let n = rewards.len();
        for t in 0..n {
            let mut expected = values_v[t];
            let mut trace = 1.0;
            let mut discount = 1.0;
            for k in t..n {
                if k > t {
                    trace *= weights[k];
                    discount *= gamma;
                }
                let next_v = if k + 1 < n { values_v[k + 1] } else { bootstrap };
                let delta = rewards[k] + gamma * next_v - values_v[k];
                expected += discount * trace * delta;
            }
            assert!(
                (retrace[t] - expected).abs() < 1e-10,
                "mismatch at t={}: {} vs {}",
                t,
                retrace[t],
                expected
            );
        }
    }

    #[test]
    fn test_empty_slice() {
        let values = compute_retrace(&[], &[], &[], RetraceBootstrap::Terminal, 0.99);
        assert!(values.is_empty());
    }
}
