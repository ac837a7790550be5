//! Wave dispatch: worker pool, sample fan-out and worker main loops.

pub mod dispatcher;
pub mod worker;
pub mod worker_pool;

pub use dispatcher::{optimizer_worker_main, SampleDispatcher};
pub use worker::agent_worker_main;
pub use worker_pool::WorkerPool;

/// The λ×P sample matrix of one wave, stored flat and reused across
/// generations.
#[derive(Debug, Clone)]
pub struct SampleMatrix {
    data: Vec<f64>,
    lambda: usize,
    dimension: usize,
}

impl SampleMatrix {
    /// Allocate a zeroed matrix for waves of `lambda` samples of `dimension`
    /// parameters each.
    pub fn new(lambda: usize, dimension: usize) -> Self {
        Self {
            data: vec![0.0; lambda * dimension],
            lambda,
            dimension,
        }
    }

    /// Wave size λ.
    pub fn lambda(&self) -> usize {
        self.lambda
    }

    /// Parameters per sample.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Flat row-major contents.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Mutable flat contents, for the updater to fill.
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Parameters of sample `i`.
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.dimension..(i + 1) * self.dimension]
    }

    /// Mutable parameters of sample `i`.
    pub fn row_mut(&mut self, i: usize) -> &mut [f64] {
        &mut self.data[i * self.dimension..(i + 1) * self.dimension]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_matrix_rows() {
        let mut m = SampleMatrix::new(3, 2);
        m.row_mut(1).copy_from_slice(&[1.0, 2.0]);
        assert_eq!(m.row(0), &[0.0, 0.0]);
        assert_eq!(m.row(1), &[1.0, 2.0]);
        assert_eq!(m.data().len(), 6);
    }
}
