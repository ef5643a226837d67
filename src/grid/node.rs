//! Node representation for the map grid.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// A node in the map grid.
///
/// Each node has a fixed position on the 2D lattice and a weight vector
/// of the instance's embedding dimension. Only the weights mutate during
/// training.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Column position on the grid.
    pub x: usize,
    /// Row position on the grid.
    pub y: usize,
    /// Weight vector in embedding space.
    pub weights: Vec<f64>,
}

impl Node {
    /// Creates a new node with random weights.
    ///
    /// Weights are initialized from a normal distribution with mean 0 and std 0.1.
    pub fn new_random<R: Rng>(x: usize, y: usize, weight_dim: usize, rng: &mut R) -> Self {
        let normal = Normal::new(0.0, 0.1).unwrap();
        let weights: Vec<f64> = (0..weight_dim).map(|_| normal.sample(rng)).collect();

        Self { x, y, weights }
    }

    /// Creates a new node with the given weights.
    pub fn new_with_weights(x: usize, y: usize, weights: Vec<f64>) -> Self {
        Self { x, y, weights }
    }

    /// Returns the 1D index for this node in a grid of the given width.
    #[inline]
    pub fn index(&self, width: usize) -> usize {
        self.y * width + self.x
    }

    /// Computes the Euclidean distance between this node's weights and an input vector.
    pub fn distance(&self, input: &[f64]) -> f64 {
        self.distance_squared(input).sqrt()
    }

    /// Computes the squared Euclidean distance (faster, avoids sqrt).
    #[inline]
    pub fn distance_squared(&self, input: &[f64]) -> f64 {
        debug_assert_eq!(
            self.weights.len(),
            input.len(),
            "Weight and input dimensions must match"
        );

        self.weights
            .iter()
            .zip(input.iter())
            .map(|(w, i)| (w - i).powi(2))
            .sum()
    }

    /// Distance between this node's weights and another node's weights.
    pub fn weight_distance(&self, other: &Node) -> f64 {
        self.distance(&other.weights)
    }

    /// Moves the node's weights towards an input vector.
    ///
    /// `learning_rate` is the current decayed learning rate and
    /// `neighborhood` the kernel influence in [0, 1].
    pub fn update_weights(&mut self, input: &[f64], learning_rate: f64, neighborhood: f64) {
        let influence = learning_rate * neighborhood;

        for (w, i) in self.weights.iter_mut().zip(input.iter()) {
            *w += influence * (i - *w);
        }
    }

    /// Returns true if every weight component is finite.
    #[inline]
    pub fn is_finite(&self) -> bool {
        self.weights.iter().all(|w| w.is_finite())
    }
}
