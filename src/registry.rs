//! Instance lifecycle and the engine's boundary surface.
//!
//! The registry is an explicit owned arena: it holds the only map from
//! instance ids to instances, constructs and destroys them, and enforces
//! the lifecycle state machine. There is no ambient global state; callers
//! hold an [`InstanceRegistry`] and go through it for every operation.

use crate::cluster::{cluster_grid, ClusterAlgorithm, ClusterReport};
use crate::config::MapConfig;
use crate::entity::{generate_sample, EntityRecord, EntitySource, EntityStore, LoadReport};
use crate::error::{MercatorError, Result};
use crate::feature::{feature_map, FeatureMap, FeatureMapKind};
use crate::grid::Grid;
use crate::mapping::{resolve_mappings, NodeMapping, WinnerCounts};
use crate::training::{
    DecaySchedule, RunControl, TrainingParams, TrainingRun, TrainingSnapshot,
};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Opaque identifier of a map instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vsom-{}", self.0)
    }
}

/// Lifecycle state of a map instance.
///
/// Transitions run forward (`Created -> DataLoaded -> Training -> Trained`),
/// any state may move to `Failed`, and `Trained -> Training` re-enters the
/// loop for a re-training cycle. `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Instance exists; no entities loaded yet.
    Created,
    /// At least one entity batch has loaded.
    DataLoaded,
    /// A training run is active.
    Training,
    /// A training run finished; derived reads are valid.
    Trained,
    /// A training run diverged. Queryable, not retrainable.
    Failed,
}

/// Public snapshot of an instance's identity and state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// The instance id.
    pub id: InstanceId,
    /// Current lifecycle state.
    pub status: InstanceStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// The immutable configuration.
    pub config: MapConfig,
    /// Entities currently loaded.
    pub entity_count: usize,
}

/// One node as reported by [`InstanceRegistry::grid_state`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    /// Node index (`y * width + x`).
    pub index: usize,
    /// Column position.
    pub x: usize,
    /// Row position.
    pub y: usize,
    /// Weight vector, present when weights were requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<f64>>,
}

/// The trained grid with current entity mappings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridState {
    /// Grid width in nodes.
    pub width: usize,
    /// Grid height in nodes.
    pub height: usize,
    /// All nodes in index order.
    pub nodes: Vec<NodeView>,
    /// One mapping per loaded entity.
    pub mappings: Vec<NodeMapping>,
}

struct InstanceState {
    status: InstanceStatus,
    store: Option<Arc<EntityStore>>,
    grid: Grid,
    winners: WinnerCounts,
    run: Option<Arc<RunControl>>,
    trained_once: bool,
}

impl InstanceState {
    /// Derived reads (grid state, mappings, clustering, feature maps) are
    /// valid once some run has completed and no run is currently mutating.
    fn require_trained(&self, id: InstanceId) -> Result<()> {
        match self.status {
            InstanceStatus::Trained => Ok(()),
            InstanceStatus::Failed if self.trained_once => Ok(()),
            InstanceStatus::Training => Err(MercatorError::State(format!(
                "{id}: training is in progress"
            ))),
            _ => Err(MercatorError::State(format!(
                "{id}: grid has not been trained"
            ))),
        }
    }
}

struct Instance {
    id: InstanceId,
    config: MapConfig,
    created_at: DateTime<Utc>,
    state: Mutex<InstanceState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Instance {
    fn info(&self) -> InstanceInfo {
        let state = self.state.lock().expect("instance lock poisoned");
        InstanceInfo {
            id: self.id,
            status: state.status,
            created_at: self.created_at,
            config: self.config.clone(),
            entity_count: state.store.as_ref().map_or(0, |s| s.len()),
        }
    }
}

/// The owned arena of map instances.
///
/// All boundary operations go through here. Distinct instances share no
/// mutable state, so they load and train fully in parallel.
pub struct InstanceRegistry {
    instances: Mutex<HashMap<u64, Arc<Instance>>>,
    next_id: AtomicU64,
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Creates a new instance after validating the configuration.
    ///
    /// Validation runs before the grid is allocated; an invalid config
    /// allocates nothing.
    pub fn create(&self, config: MapConfig) -> Result<InstanceId> {
        config.validate()?;

        let id = InstanceId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let grid = Grid::new(&config);
        let instance = Arc::new(Instance {
            id,
            created_at: Utc::now(),
            state: Mutex::new(InstanceState {
                status: InstanceStatus::Created,
                store: None,
                grid,
                winners: WinnerCounts::default(),
                run: None,
                trained_once: false,
            }),
            handle: Mutex::new(None),
            config,
        });

        self.instances
            .lock()
            .expect("registry lock poisoned")
            .insert(id.0, instance);
        info!("{id}: created");
        Ok(id)
    }

    /// Looks up an instance's public state.
    pub fn get(&self, id: InstanceId) -> Result<InstanceInfo> {
        Ok(self.instance(id)?.info())
    }

    /// Lists all instances, ordered by id.
    pub fn list(&self) -> Vec<InstanceInfo> {
        let mut infos: Vec<InstanceInfo> = self
            .instances
            .lock()
            .expect("registry lock poisoned")
            .values()
            .map(|i| i.info())
            .collect();
        infos.sort_by_key(|info| info.id.0);
        infos
    }

    /// Deletes an instance, cancelling any in-flight training first.
    ///
    /// The stop flag is raised and the run joined before storage drops, so
    /// the training thread always observes the cancellation rather than
    /// writing into a released instance.
    pub fn delete(&self, id: InstanceId) -> Result<bool> {
        let instance = self
            .instances
            .lock()
            .expect("registry lock poisoned")
            .remove(&id.0)
            .ok_or(MercatorError::NotFound(id.0))?;

        if let Some(run) = instance
            .state
            .lock()
            .expect("instance lock poisoned")
            .run
            .clone()
        {
            run.request_stop();
        }
        Self::join_run(&instance);
        info!("{id}: deleted");
        Ok(true)
    }

    /// Loads a batch of entity records into an instance.
    ///
    /// Valid only in `Created` or `DataLoaded`; the store is rebuilt from
    /// the batch and swapped in whole, so a re-load fully replaces prior
    /// content and readers never see a mix. Per-record failures are
    /// reported in the result without aborting the batch; a batch that
    /// loads zero records leaves the previous store in place.
    pub fn load_entities(&self, id: InstanceId, records: Vec<EntityRecord>) -> Result<LoadReport> {
        let instance = self.instance(id)?;
        let mut state = instance.state.lock().expect("instance lock poisoned");

        match state.status {
            InstanceStatus::Created | InstanceStatus::DataLoaded => {}
            InstanceStatus::Training => {
                return Err(MercatorError::State(format!(
                    "{id}: cannot load entities while training is active"
                )))
            }
            status => {
                return Err(MercatorError::State(format!(
                    "{id}: cannot load entities in state {status:?}"
                )))
            }
        }

        let (store, report) = EntityStore::build(records, instance.config.embedding_dimension);
        if report.loaded > 0 {
            state.store = Some(Arc::new(store));
            state.status = InstanceStatus::DataLoaded;
        }
        info!(
            "{id}: loaded {} entities, rejected {}",
            report.loaded,
            report.rejected.len()
        );
        Ok(report)
    }

    /// Loads entities from an upstream source by query.
    pub fn load_from_source(
        &self,
        id: InstanceId,
        source: &dyn EntitySource,
        query: &str,
    ) -> Result<LoadReport> {
        let records = source.fetch(query)?;
        self.load_entities(id, records)
    }

    /// Generates and loads synthetic sample entities matching the
    /// instance's embedding dimension.
    pub fn generate_sample_data(&self, id: InstanceId, count: usize) -> Result<LoadReport> {
        let instance = self.instance(id)?;
        let records = generate_sample(
            count,
            instance.config.embedding_dimension,
            instance.config.seed,
        );
        self.load_entities(id, records)
    }

    /// Starts a background training run.
    ///
    /// Rejected when no data is loaded, when a run is already active, or
    /// when the instance has failed. On acceptance the instance moves to
    /// `Training`, winner counters reset, and the call returns while the
    /// run proceeds on its own thread against a private copy of the grid.
    /// The shared grid is replaced only when the run terminates cleanly.
    pub fn train(&self, id: InstanceId, params: TrainingParams) -> Result<()> {
        params.validate()?;
        let instance = self.instance(id)?;
        let mut state = instance.state.lock().expect("instance lock poisoned");

        match state.status {
            InstanceStatus::DataLoaded | InstanceStatus::Trained => {}
            InstanceStatus::Training => {
                return Err(MercatorError::State(format!(
                    "{id}: a training run is already active"
                )))
            }
            InstanceStatus::Created => {
                return Err(MercatorError::State(format!("{id}: no entities loaded")))
            }
            InstanceStatus::Failed => {
                return Err(MercatorError::State(format!(
                    "{id}: instance failed; recreate it to train again"
                )))
            }
        }

        let store = state
            .store
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MercatorError::State(format!("{id}: entity store is empty")))?;

        let total = params.total_iterations(store.len(), instance.config.max_iterations);
        let schedule = DecaySchedule::new(&instance.config, total);
        let control = Arc::new(RunControl::new(total, &schedule));

        state.winners.reset();
        state.run = Some(Arc::clone(&control));
        state.status = InstanceStatus::Training;
        let grid_copy = state.grid.clone();
        drop(state);

        let worker = Arc::clone(&instance);
        let run = TrainingRun::new(instance.config.clone(), params, store, control);
        let handle = std::thread::spawn(move || {
            let outcome = run.execute(grid_copy);
            let mut state = worker.state.lock().expect("instance lock poisoned");
            match outcome {
                Ok((status, trained_grid)) => {
                    state.grid = trained_grid;
                    state.status = InstanceStatus::Trained;
                    state.trained_once = true;
                    info!("{}: training ended ({status:?})", worker.id);
                }
                Err(err) => {
                    // The shared grid was never touched; the last good
                    // weights stay readable.
                    state.status = InstanceStatus::Failed;
                    warn!("{}: training failed: {err}", worker.id);
                }
            }
        });
        *instance.handle.lock().expect("handle lock poisoned") = Some(handle);

        info!("{id}: training accepted ({total} iterations)");
        Ok(())
    }

    /// Requests cooperative cancellation of the active run, if any.
    ///
    /// Returns immediately; the run observes the flag at its next
    /// iteration boundary. No-op when no run is active.
    pub fn stop(&self, id: InstanceId) -> Result<()> {
        let instance = self.instance(id)?;
        let state = instance.state.lock().expect("instance lock poisoned");
        if state.status == InstanceStatus::Training {
            if let Some(run) = &state.run {
                run.request_stop();
            }
        }
        Ok(())
    }

    /// Blocks until the current training run (if any) has terminated.
    pub fn wait(&self, id: InstanceId) -> Result<()> {
        let instance = self.instance(id)?;
        Self::join_run(&instance);
        Ok(())
    }

    /// Latest training snapshot for the instance.
    ///
    /// Reads a published immutable snapshot; never blocks on an in-flight
    /// iteration. `State` error before the first run starts.
    pub fn training_status(&self, id: InstanceId) -> Result<TrainingSnapshot> {
        let instance = self.instance(id)?;
        let state = instance.state.lock().expect("instance lock poisoned");
        state
            .run
            .as_ref()
            .map(|run| run.snapshot())
            .ok_or_else(|| MercatorError::State(format!("{id}: no training run has started")))
    }

    /// The trained grid with per-entity mappings.
    pub fn grid_state(&self, id: InstanceId, include_weights: bool) -> Result<GridState> {
        let instance = self.instance(id)?;
        let mut state = instance.state.lock().expect("instance lock poisoned");
        state.require_trained(id)?;

        let mappings = match state.store.clone() {
            Some(store) => {
                let mut winners = std::mem::take(&mut state.winners);
                let mappings = resolve_mappings(&state.grid, &store, &mut winners);
                state.winners = winners;
                mappings
            }
            None => Vec::new(),
        };

        let nodes = state
            .grid
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| NodeView {
                index,
                x: node.x,
                y: node.y,
                weights: include_weights.then(|| node.weights.clone()),
            })
            .collect();

        Ok(GridState {
            width: state.grid.width,
            height: state.grid.height,
            nodes,
            mappings,
        })
    }

    /// Recomputes the entity-to-node mappings against the trained grid.
    pub fn resolve_mappings(&self, id: InstanceId) -> Result<Vec<NodeMapping>> {
        let instance = self.instance(id)?;
        let mut state = instance.state.lock().expect("instance lock poisoned");
        state.require_trained(id)?;

        let store = state
            .store
            .clone()
            .ok_or_else(|| MercatorError::State(format!("{id}: no entities loaded")))?;
        let mut winners = std::mem::take(&mut state.winners);
        let mappings = resolve_mappings(&state.grid, &store, &mut winners);
        state.winners = winners;
        Ok(mappings)
    }

    /// Clusters the trained grid.
    ///
    /// `threshold` and `min_cluster_size` default to the instance config
    /// when not supplied; the result wholly replaces any prior clustering.
    pub fn cluster(
        &self,
        id: InstanceId,
        algorithm: ClusterAlgorithm,
        threshold: Option<f64>,
        min_cluster_size: Option<usize>,
    ) -> Result<ClusterReport> {
        let instance = self.instance(id)?;
        let state = instance.state.lock().expect("instance lock poisoned");
        state.require_trained(id)?;

        cluster_grid(
            &state.grid,
            algorithm,
            threshold.unwrap_or(instance.config.cluster_threshold),
            min_cluster_size.unwrap_or(instance.config.min_cluster_size),
            instance.config.seed,
        )
    }

    /// Derives a scalar feature map from the trained grid.
    pub fn feature_map(&self, id: InstanceId, kind: FeatureMapKind) -> Result<FeatureMap> {
        let instance = self.instance(id)?;
        let state = instance.state.lock().expect("instance lock poisoned");
        state.require_trained(id)?;
        feature_map(&state.grid, kind)
    }

    /// Snapshot of a trained instance for export.
    pub(crate) fn export_parts(&self, id: InstanceId) -> Result<(MapConfig, Grid)> {
        let instance = self.instance(id)?;
        let state = instance.state.lock().expect("instance lock poisoned");
        state.require_trained(id)?;
        Ok((instance.config.clone(), state.grid.clone()))
    }

    /// Registers an imported, already-trained grid as a new instance.
    pub(crate) fn import_parts(&self, config: MapConfig, grid: Grid) -> Result<InstanceId> {
        config.validate()?;
        if grid.width != config.grid_width
            || grid.height != config.grid_height
            || grid.weight_dim != config.embedding_dimension
            || grid.total_nodes() != config.total_nodes()
        {
            return Err(MercatorError::Data(
                "imported grid does not match its configuration".to_string(),
            ));
        }

        let id = InstanceId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let instance = Arc::new(Instance {
            id,
            created_at: Utc::now(),
            state: Mutex::new(InstanceState {
                status: InstanceStatus::Trained,
                store: None,
                grid,
                winners: WinnerCounts::default(),
                run: None,
                trained_once: true,
            }),
            handle: Mutex::new(None),
            config,
        });
        self.instances
            .lock()
            .expect("registry lock poisoned")
            .insert(id.0, instance);
        info!("{id}: imported");
        Ok(id)
    }

    fn instance(&self, id: InstanceId) -> Result<Arc<Instance>> {
        self.instances
            .lock()
            .expect("registry lock poisoned")
            .get(&id.0)
            .cloned()
            .ok_or(MercatorError::NotFound(id.0))
    }

    fn join_run(instance: &Instance) {
        let handle = instance
            .handle
            .lock()
            .expect("handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("{}: training thread panicked", instance.id);
                let mut state = instance.state.lock().expect("instance lock poisoned");
                state.status = InstanceStatus::Failed;
            }
        }
    }
}

impl Drop for InstanceRegistry {
    fn drop(&mut self) {
        // Signal every active run, then join, so no thread outlives the
        // storage it trains against.
        let instances: Vec<Arc<Instance>> = self
            .instances
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        for instance in &instances {
            if let Some(run) = instance
                .state
                .lock()
                .expect("instance lock poisoned")
                .run
                .clone()
            {
                run.request_stop();
            }
        }
        for instance in &instances {
            Self::join_run(instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::generate_sample;

    fn small_config() -> MapConfig {
        MapConfig {
            grid_width: 4,
            grid_height: 4,
            embedding_dimension: 3,
            seed: Some(42),
            ..Default::default()
        }
    }

    fn loaded_instance(registry: &InstanceRegistry) -> InstanceId {
        let id = registry.create(small_config()).unwrap();
        registry.generate_sample_data(id, 10).unwrap();
        id
    }

    #[test]
    fn test_create_validates_config() {
        let registry = InstanceRegistry::new();
        let mut config = small_config();
        config.grid_width = 1;
        assert!(matches!(
            registry.create(config),
            Err(MercatorError::Configuration(_))
        ));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_lifecycle_status_progression() {
        let registry = InstanceRegistry::new();
        let id = registry.create(small_config()).unwrap();
        assert_eq!(registry.get(id).unwrap().status, InstanceStatus::Created);

        registry.generate_sample_data(id, 8).unwrap();
        assert_eq!(registry.get(id).unwrap().status, InstanceStatus::DataLoaded);

        registry
            .train(
                id,
                TrainingParams {
                    epochs: 3,
                    batch_size: 2,
                },
            )
            .unwrap();
        registry.wait(id).unwrap();
        assert_eq!(registry.get(id).unwrap().status, InstanceStatus::Trained);
    }

    #[test]
    fn test_train_without_data_rejected() {
        let registry = InstanceRegistry::new();
        let id = registry.create(small_config()).unwrap();
        let err = registry
            .train(
                id,
                TrainingParams {
                    epochs: 1,
                    batch_size: 1,
                },
            )
            .unwrap_err();
        assert!(matches!(err, MercatorError::State(_)));
    }

    #[test]
    fn test_grid_state_before_training_rejected() {
        let registry = InstanceRegistry::new();
        let id = loaded_instance(&registry);
        assert!(matches!(
            registry.grid_state(id, false),
            Err(MercatorError::State(_))
        ));
        assert!(matches!(
            registry.cluster(id, ClusterAlgorithm::UMatrix, None, None),
            Err(MercatorError::State(_))
        ));
        assert!(matches!(
            registry.feature_map(id, FeatureMapKind::UMatrix),
            Err(MercatorError::State(_))
        ));
    }

    #[test]
    fn test_second_train_rejected_while_active() {
        let registry = InstanceRegistry::new();
        let mut config = small_config();
        config.max_iterations = 0; // uncapped so the run stays busy
        let id = registry.create(config).unwrap();
        registry.generate_sample_data(id, 50).unwrap();

        let params = TrainingParams {
            epochs: 2000,
            batch_size: 1,
        };
        registry.train(id, params).unwrap();
        let err = registry.train(id, params).unwrap_err();
        assert!(matches!(err, MercatorError::State(_)));

        registry.stop(id).unwrap();
        registry.wait(id).unwrap();
        assert_eq!(registry.get(id).unwrap().status, InstanceStatus::Trained);
    }

    #[test]
    fn test_load_rejected_while_training() {
        let registry = InstanceRegistry::new();
        let mut config = small_config();
        config.max_iterations = 0;
        let id = registry.create(config).unwrap();
        registry.generate_sample_data(id, 50).unwrap();
        registry
            .train(
                id,
                TrainingParams {
                    epochs: 2000,
                    batch_size: 1,
                },
            )
            .unwrap();

        let records = generate_sample(5, 3, Some(1));
        assert!(matches!(
            registry.load_entities(id, records),
            Err(MercatorError::State(_))
        ));

        registry.stop(id).unwrap();
        registry.wait(id).unwrap();
    }

    #[test]
    fn test_delete_cancels_training() {
        let registry = InstanceRegistry::new();
        let mut config = small_config();
        config.max_iterations = 0;
        let id = registry.create(config).unwrap();
        registry.generate_sample_data(id, 50).unwrap();
        registry
            .train(
                id,
                TrainingParams {
                    epochs: 5000,
                    batch_size: 1,
                },
            )
            .unwrap();

        assert!(registry.delete(id).unwrap());
        assert!(matches!(
            registry.get(id),
            Err(MercatorError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_unknown_instance() {
        let registry = InstanceRegistry::new();
        assert!(matches!(
            registry.delete(InstanceId(99)),
            Err(MercatorError::NotFound(99))
        ));
    }

    #[test]
    fn test_training_status_before_any_run() {
        let registry = InstanceRegistry::new();
        let id = loaded_instance(&registry);
        assert!(matches!(
            registry.training_status(id),
            Err(MercatorError::State(_))
        ));
    }

    #[test]
    fn test_reload_replaces_store() {
        let registry = InstanceRegistry::new();
        let id = registry.create(small_config()).unwrap();

        registry.generate_sample_data(id, 10).unwrap();
        assert_eq!(registry.get(id).unwrap().entity_count, 10);

        let report = registry
            .load_entities(id, generate_sample(4, 3, Some(8)))
            .unwrap();
        assert_eq!(report.loaded, 4);
        assert_eq!(registry.get(id).unwrap().entity_count, 4);
    }

    #[test]
    fn test_fully_rejected_batch_keeps_previous_store() {
        let registry = InstanceRegistry::new();
        let id = registry.create(small_config()).unwrap();
        registry.generate_sample_data(id, 10).unwrap();

        let bad = generate_sample(3, 7, Some(8)); // wrong dimension
        let report = registry.load_entities(id, bad).unwrap();
        assert_eq!(report.loaded, 0);
        assert_eq!(report.rejected.len(), 3);
        assert_eq!(registry.get(id).unwrap().entity_count, 10);
    }

    #[test]
    fn test_instances_are_independent() {
        let registry = InstanceRegistry::new();
        let a = loaded_instance(&registry);
        let b = loaded_instance(&registry);
        let params = TrainingParams {
            epochs: 3,
            batch_size: 2,
        };

        registry.train(a, params).unwrap();
        registry.train(b, params).unwrap();
        registry.wait(a).unwrap();
        registry.wait(b).unwrap();

        assert_eq!(registry.get(a).unwrap().status, InstanceStatus::Trained);
        assert_eq!(registry.get(b).unwrap().status, InstanceStatus::Trained);
    }
}
