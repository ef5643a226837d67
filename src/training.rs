//! The competitive-learning training engine.
//!
//! A training run adapts grid weights toward the entity store's embeddings
//! over `epochs * ceil(n / batch_size)` iterations (capped by the config's
//! `max_iterations`). The run executes on a background thread against a
//! private copy of the grid; progress is published as immutable snapshots
//! so status readers never block on an in-flight iteration, and the shared
//! grid is only replaced once the run terminates cleanly.

use crate::config::MapConfig;
use crate::entity::EntityStore;
use crate::error::{MercatorError, Result};
use crate::grid::Grid;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Lifecycle of a single training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// The run is executing iterations.
    Running,
    /// The run reached its final iteration.
    Completed,
    /// A stop request was observed at an iteration boundary.
    Stopped,
    /// A numerical fault ended the run.
    Failed,
}

/// Immutable view of training progress.
///
/// Published by the engine after each iteration (or every
/// `snapshot_interval` iterations); readers clone the latest value and
/// never observe a partially written state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSnapshot {
    /// Iterations completed so far.
    pub current_iteration: usize,
    /// Total iterations this run will execute.
    pub total_iterations: usize,
    /// Running average of the quantization error (entity-to-BMU distance
    /// measured before each update).
    pub quantization_error: f64,
    /// Fraction of entities whose two closest nodes are not grid-adjacent.
    /// Computed once at run end; 0 while running.
    pub topographic_error: f64,
    /// Learning rate at the last completed iteration.
    pub learning_rate: f64,
    /// Neighborhood radius at the last completed iteration.
    pub neighborhood_radius: f64,
    /// Run lifecycle state.
    pub status: RunStatus,
    /// Wall-clock start of the run.
    pub started_at: DateTime<Utc>,
    /// Projected completion time, extrapolated from progress so far.
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// Caller-supplied shape of a training run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrainingParams {
    /// Full passes over the entity store.
    pub epochs: usize,
    /// Entities presented per iteration.
    pub batch_size: usize,
}

impl TrainingParams {
    /// Validates the run shape.
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(MercatorError::Configuration(
                "epochs must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(MercatorError::Configuration(
                "batch size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Total iterations for a store of `entity_count` records, honoring the
    /// config's `max_iterations` cap (0 disables the cap).
    pub fn total_iterations(&self, entity_count: usize, max_iterations: usize) -> usize {
        let batches_per_pass = entity_count.div_ceil(self.batch_size);
        let total = self.epochs * batches_per_pass;
        if max_iterations > 0 {
            total.min(max_iterations)
        } else {
            total
        }
    }
}

/// Exponential decay schedule shared by learning rate and radius.
///
/// `value(t) = initial * (final/initial)^(t/T)`.
#[derive(Debug, Clone)]
pub struct DecaySchedule {
    initial_learning_rate: f64,
    final_learning_rate: f64,
    initial_radius: f64,
    final_radius: f64,
    total: usize,
}

impl DecaySchedule {
    /// Builds the schedule for a run of `total` iterations.
    pub fn new(config: &MapConfig, total: usize) -> Self {
        Self {
            initial_learning_rate: config.initial_learning_rate,
            final_learning_rate: config.final_learning_rate,
            initial_radius: config.effective_initial_radius(),
            final_radius: config.final_radius,
            total: total.max(1),
        }
    }

    /// Learning rate at iteration `t`.
    #[inline]
    pub fn learning_rate(&self, t: usize) -> f64 {
        let progress = t as f64 / self.total as f64;
        self.initial_learning_rate
            * (self.final_learning_rate / self.initial_learning_rate).powf(progress)
    }

    /// Neighborhood radius at iteration `t`.
    #[inline]
    pub fn radius(&self, t: usize) -> f64 {
        let progress = t as f64 / self.total as f64;
        self.initial_radius * (self.final_radius / self.initial_radius).powf(progress)
    }
}

/// Shared state between a training run and its observers: the latest
/// snapshot plus the cooperative stop flag.
#[derive(Debug)]
pub struct RunControl {
    snapshot: Mutex<TrainingSnapshot>,
    stop: AtomicBool,
}

impl RunControl {
    /// Creates control state with an initial `Running` snapshot.
    pub fn new(total_iterations: usize, schedule: &DecaySchedule) -> Self {
        Self {
            snapshot: Mutex::new(TrainingSnapshot {
                current_iteration: 0,
                total_iterations,
                quantization_error: 0.0,
                topographic_error: 0.0,
                learning_rate: schedule.learning_rate(0),
                neighborhood_radius: schedule.radius(0),
                status: RunStatus::Running,
                started_at: Utc::now(),
                estimated_completion: None,
            }),
            stop: AtomicBool::new(false),
        }
    }

    /// Clones the latest snapshot.
    pub fn snapshot(&self) -> TrainingSnapshot {
        self.snapshot.lock().expect("snapshot lock poisoned").clone()
    }

    /// Requests cooperative cancellation; the run observes the flag at the
    /// next iteration boundary.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// True once a stop has been requested.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn publish(&self, snapshot: TrainingSnapshot) {
        *self.snapshot.lock().expect("snapshot lock poisoned") = snapshot;
    }

    /// Overwrites only the status of the latest snapshot, keeping its last
    /// valid metrics.
    fn publish_status(&self, status: RunStatus) {
        self.snapshot.lock().expect("snapshot lock poisoned").status = status;
    }
}

/// A prepared training run over one instance's store and grid copy.
pub(crate) struct TrainingRun {
    config: MapConfig,
    params: TrainingParams,
    store: Arc<EntityStore>,
    control: Arc<RunControl>,
}

impl TrainingRun {
    pub(crate) fn new(
        config: MapConfig,
        params: TrainingParams,
        store: Arc<EntityStore>,
        control: Arc<RunControl>,
    ) -> Self {
        Self {
            config,
            params,
            store,
            control,
        }
    }

    /// Executes the run to termination, consuming and returning the private
    /// grid copy.
    ///
    /// Returns the terminal status with the grid as of the last complete
    /// iteration, or a `Training` error on a numerical fault, in which
    /// case the caller must keep its previous grid.
    pub(crate) fn execute(self, mut grid: Grid) -> Result<(RunStatus, Grid)> {
        let n = self.store.len();
        let total = self
            .params
            .total_iterations(n, self.config.max_iterations);
        let schedule = DecaySchedule::new(&self.config, total);

        let mut rng = match self.config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        // Plane positions are fixed for the run; precompute them once.
        let positions: Vec<(f64, f64)> = (0..grid.total_nodes())
            .map(|i| {
                let (x, y) = grid.index_to_coords(i);
                grid.topology.plane_position(x, y)
            })
            .collect();

        info!(
            "training run: {} entities, {} nodes, {} iterations",
            n,
            grid.total_nodes(),
            total
        );

        let started = Instant::now();
        let started_at = self.control.snapshot().started_at;
        let records = self.store.records();

        let mut order: Vec<usize> = (0..n).collect();
        let mut cursor = n; // forces a shuffle before the first batch
        let mut error_sum = 0.0;
        let mut presentations = 0usize;

        for t in 0..total {
            if self.control.stop_requested() {
                info!("stop observed at iteration {t}/{total}");
                self.control.publish_status(RunStatus::Stopped);
                return Ok((RunStatus::Stopped, grid));
            }

            if cursor >= n {
                order.shuffle(&mut rng);
                cursor = 0;
            }

            let lr = schedule.learning_rate(t);
            let radius = schedule.radius(t);
            let batch_end = (cursor + self.params.batch_size).min(n);
            let batch = &order[cursor..batch_end];
            cursor = batch_end;

            for &entity_idx in batch {
                let embedding = &records[entity_idx].embedding;
                let (bmu, dist) = grid.find_bmu(embedding)?;
                error_sum += dist;
                presentations += 1;

                let (bx, by) = positions[bmu];
                let sigma_sq = radius * radius;
                for (node_idx, node) in grid.nodes.iter_mut().enumerate() {
                    let (nx, ny) = positions[node_idx];
                    let dx = nx - bx;
                    let dy = ny - by;
                    let grid_dist_sq = dx * dx + dy * dy;
                    // Hard cutoff at the radius; the Gaussian tail beyond
                    // it contributes nothing worth the writes.
                    if grid_dist_sq > sigma_sq {
                        continue;
                    }
                    let theta = (-grid_dist_sq / (2.0 * sigma_sq)).exp();
                    node.update_weights(embedding, lr, theta);
                }

                let touched = &grid.nodes[bmu];
                if !dist.is_finite() || !touched.is_finite() {
                    warn!("non-finite weights at iteration {t}, failing run");
                    self.control.publish_status(RunStatus::Failed);
                    return Err(MercatorError::Training(format!(
                        "numerical divergence at iteration {t}"
                    )));
                }
            }

            let running_error = error_sum / presentations.max(1) as f64;
            if (t + 1) % self.config.snapshot_interval == 0 || t + 1 == total {
                let elapsed = started.elapsed();
                let progress = (t + 1) as f64 / total as f64;
                let remaining_secs = elapsed.as_secs_f64() * (1.0 - progress) / progress;
                let estimated_completion = ChronoDuration::try_milliseconds(
                    (remaining_secs * 1000.0) as i64,
                )
                .map(|d| Utc::now() + d);

                self.control.publish(TrainingSnapshot {
                    current_iteration: t + 1,
                    total_iterations: total,
                    quantization_error: running_error,
                    topographic_error: 0.0,
                    learning_rate: lr,
                    neighborhood_radius: radius,
                    status: RunStatus::Running,
                    started_at,
                    estimated_completion,
                });
            }

            if t % 1000 == 0 {
                debug!(
                    "iteration {t}/{total}: lr={lr:.4}, radius={radius:.2}, qe={running_error:.4}"
                );
            }
        }

        let topographic = topographic_error(&grid, &self.store);
        let mut final_snapshot = self.control.snapshot();
        final_snapshot.current_iteration = total;
        final_snapshot.topographic_error = topographic;
        final_snapshot.status = RunStatus::Completed;
        final_snapshot.estimated_completion = None;
        self.control.publish(final_snapshot);

        info!(
            "training completed: qe={:.4}, te={:.4}",
            error_sum / presentations.max(1) as f64,
            topographic
        );
        Ok((RunStatus::Completed, grid))
    }
}

/// Fraction of entities whose best and second-best nodes are not adjacent
/// under the grid topology. A high value means the map folded.
pub fn topographic_error(grid: &Grid, store: &EntityStore) -> f64 {
    if store.is_empty() || grid.total_nodes() < 2 {
        return 0.0;
    }

    let folded = store
        .records()
        .iter()
        .filter(|record| {
            let mut best = (f64::MAX, 0usize);
            let mut second = (f64::MAX, 0usize);
            for (i, node) in grid.nodes.iter().enumerate() {
                let dist = node.distance_squared(&record.embedding);
                if dist < best.0 {
                    second = best;
                    best = (dist, i);
                } else if dist < second.0 {
                    second = (dist, i);
                }
            }
            let (x, y) = grid.index_to_coords(best.1);
            !grid
                .topology
                .neighbors(x, y, grid.width, grid.height)
                .contains(&second.1)
        })
        .count();

    folded as f64 / store.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{generate_sample, EntityRecord, EntityStore};

    fn test_config() -> MapConfig {
        MapConfig {
            grid_width: 6,
            grid_height: 6,
            embedding_dimension: 8,
            initial_learning_rate: 0.1,
            final_learning_rate: 0.01,
            initial_radius: Some(3.0),
            final_radius: 1.0,
            seed: Some(42),
            ..Default::default()
        }
    }

    fn test_store(config: &MapConfig, count: usize) -> Arc<EntityStore> {
        let records = generate_sample(count, config.embedding_dimension, config.seed);
        let (store, report) = EntityStore::build(records, config.embedding_dimension);
        assert!(report.rejected.is_empty());
        Arc::new(store)
    }

    fn run_to_end(config: &MapConfig, store: Arc<EntityStore>, params: TrainingParams) -> (RunStatus, Grid, Arc<RunControl>) {
        let total = params.total_iterations(store.len(), config.max_iterations);
        let schedule = DecaySchedule::new(config, total);
        let control = Arc::new(RunControl::new(total, &schedule));
        let run = TrainingRun::new(config.clone(), params, store, Arc::clone(&control));
        let grid = Grid::new(config);
        let (status, grid) = run.execute(grid).unwrap();
        (status, grid, control)
    }

    #[test]
    fn test_learning_rate_decay() {
        let config = test_config();
        let schedule = DecaySchedule::new(&config, 100);

        assert!((schedule.learning_rate(0) - 0.1).abs() < 1e-9);
        assert!((schedule.learning_rate(100) - 0.01).abs() < 1e-9);
        assert!(schedule.learning_rate(50) < schedule.learning_rate(10));
    }

    #[test]
    fn test_radius_decay() {
        let config = test_config();
        let schedule = DecaySchedule::new(&config, 100);

        assert!((schedule.radius(0) - 3.0).abs() < 1e-9);
        assert!((schedule.radius(100) - 1.0).abs() < 1e-9);
        assert!(schedule.radius(70) < schedule.radius(20));
    }

    #[test]
    fn test_default_initial_radius_is_half_larger_dimension() {
        let mut config = test_config();
        config.initial_radius = None;
        config.grid_width = 12;
        let schedule = DecaySchedule::new(&config, 10);
        assert!((schedule.radius(0) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_total_iterations() {
        let params = TrainingParams {
            epochs: 4,
            batch_size: 3,
        };
        assert_eq!(params.total_iterations(10, 0), 16); // ceil(10/3)=4 per pass
        assert_eq!(params.total_iterations(10, 9), 9); // capped
    }

    #[test]
    fn test_run_completes_and_counts_iterations() {
        let config = test_config();
        let store = test_store(&config, 12);
        let params = TrainingParams {
            epochs: 5,
            batch_size: 4,
        };
        let (status, _, control) = run_to_end(&config, store, params);

        assert_eq!(status, RunStatus::Completed);
        let snapshot = control.snapshot();
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.current_iteration, snapshot.total_iterations);
        assert_eq!(snapshot.total_iterations, 15);
        assert!(snapshot.quantization_error.is_finite());
    }

    #[test]
    fn test_error_decreases_on_separated_data() {
        let config = test_config();
        let store = test_store(&config, 30);

        // Short run vs long run over the same seeded data: the running
        // average late in training should not be worse than early.
        let early = {
            let (_, _, control) = run_to_end(
                &config,
                Arc::clone(&store),
                TrainingParams { epochs: 1, batch_size: 1 },
            );
            control.snapshot().quantization_error
        };
        let late = {
            let (_, _, control) = run_to_end(
                &config,
                store,
                TrainingParams { epochs: 30, batch_size: 1 },
            );
            control.snapshot().quantization_error
        };
        assert!(
            late <= early,
            "running error should improve: early={early}, late={late}"
        );
    }

    #[test]
    fn test_stop_before_first_iteration() {
        let config = test_config();
        let store = test_store(&config, 10);
        let params = TrainingParams {
            epochs: 10,
            batch_size: 1,
        };
        let total = params.total_iterations(store.len(), config.max_iterations);
        let schedule = DecaySchedule::new(&config, total);
        let control = Arc::new(RunControl::new(total, &schedule));
        control.request_stop();

        let run = TrainingRun::new(config.clone(), params, store, Arc::clone(&control));
        let (status, _) = run.execute(Grid::new(&config)).unwrap();
        assert_eq!(status, RunStatus::Stopped);
        assert_eq!(control.snapshot().status, RunStatus::Stopped);
        assert_eq!(control.snapshot().current_iteration, 0);
    }

    #[test]
    fn test_poisoned_grid_fails_run() {
        let config = test_config();
        let store = test_store(&config, 5);
        let params = TrainingParams {
            epochs: 1,
            batch_size: 1,
        };
        let total = params.total_iterations(store.len(), config.max_iterations);
        let schedule = DecaySchedule::new(&config, total);
        let control = Arc::new(RunControl::new(total, &schedule));

        let mut grid = Grid::new(&config);
        for node in &mut grid.nodes {
            node.weights[0] = f64::NAN;
        }

        let run = TrainingRun::new(config, params, store, Arc::clone(&control));
        let result = run.execute(grid);
        assert!(matches!(result, Err(MercatorError::Training(_))));
        assert_eq!(control.snapshot().status, RunStatus::Failed);
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let config = test_config();
        let store = test_store(&config, 10);
        let params = TrainingParams {
            epochs: 3,
            batch_size: 2,
        };

        let (_, grid_a, _) = run_to_end(&config, Arc::clone(&store), params);
        let (_, grid_b, _) = run_to_end(&config, store, params);
        for (a, b) in grid_a.nodes.iter().zip(&grid_b.nodes) {
            assert_eq!(a.weights, b.weights);
        }
    }

    #[test]
    fn test_topographic_error_zero_on_single_entity() {
        let config = test_config();
        let (store, _) = EntityStore::build(
            vec![EntityRecord::new("urn:a", "a", vec![0.5; 8])],
            8,
        );
        let mut grid = Grid::new(&config);
        // Make nodes 0 and 1 (adjacent) the two closest to the entity.
        grid.nodes[0].weights = vec![0.5; 8];
        grid.nodes[1].weights = vec![0.49; 8];
        assert_eq!(topographic_error(&grid, &store), 0.0);
    }
}
