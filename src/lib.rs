//! # Mercator - Semantic Map Engine
//!
//! Mercator trains self-organizing maps over high-dimensional entity
//! embeddings, projecting semantic similarity onto a low-dimensional grid
//! that preserves topology, then derives clusters and scalar feature maps
//! from the trained weight field.
//!
//! ## Overview
//!
//! An upstream pipeline (knowledge-graph decomposition plus an embedding
//! generator) supplies entity records of the form `{uri, name,
//! embedding[]}`. Mercator owns everything after that handoff: the grid
//! lifecycle, the competitive-learning training dynamics, and the derived
//! analyses. It never generates embeddings itself.
//!
//! ## Key Features
//!
//! - **Independent map instances** with their own configuration, entity
//!   store, and grid, managed through an owned registry
//! - **Background training** with immutable progress snapshots, cooperative
//!   cancellation, and deterministic seeded runs
//! - **Rectangular and hexagonal** grid topologies
//! - **Three clustering algorithms** (u-matrix flood fill, k-means,
//!   agglomerative) behind one interface
//! - **Scalar feature maps**: u-matrix, component planes, distance fields
//! - **Binary map export** for moving trained grids between processes
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mercator::{ClusterAlgorithm, InstanceRegistry, MapConfig, TrainingParams};
//!
//! let registry = InstanceRegistry::new();
//! let id = registry.create(MapConfig::default())?;
//!
//! // Load entities from the upstream pipeline
//! let report = registry.load_entities(id, records)?;
//! println!("loaded {}, rejected {}", report.loaded, report.rejected.len());
//!
//! // Train in the background, polling progress
//! registry.train(id, TrainingParams { epochs: 20, batch_size: 16 })?;
//! let status = registry.training_status(id)?;
//! registry.wait(id)?;
//!
//! // Derived analyses on the trained grid
//! let state = registry.grid_state(id, false)?;
//! let clusters = registry.cluster(id, ClusterAlgorithm::UMatrix, None, None)?;
//! ```
//!
//! ## Architecture
//!
//! - [`registry`] - Instance lifecycle and the boundary surface
//! - [`entity`] - Entity records, validation, and the working store
//! - [`grid`] - The node lattice and its topologies
//! - [`training`] - The competitive-learning engine
//! - [`mapping`] - Entity-to-node mapping resolution
//! - [`cluster`] - Grid clustering algorithms
//! - [`feature`] - Scalar feature map derivation
//! - [`storage`] - Binary export of trained maps

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod entity;
pub mod error;
pub mod feature;
pub mod grid;
pub mod mapping;
pub mod registry;
pub mod storage;
pub mod training;

// Re-export commonly used types
pub use cluster::{Cluster, ClusterAlgorithm, ClusterReport, ClusterStats};
pub use config::MapConfig;
pub use entity::{EntityRecord, EntitySource, EntityStore, LoadReport, StaticSource};
pub use error::{MercatorError, Result};
pub use feature::{FeatureMap, FeatureMapKind, FieldStats};
pub use grid::{Grid, Node, Topology};
pub use mapping::NodeMapping;
pub use registry::{GridState, InstanceId, InstanceInfo, InstanceRegistry, InstanceStatus, NodeView};
pub use storage::{export_map, import_map};
pub use training::{RunStatus, TrainingParams, TrainingSnapshot};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
