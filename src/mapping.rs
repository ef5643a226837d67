//! Entity-to-node mapping resolution.
//!
//! After training, every entity is assigned to its best matching node.
//! Mappings are derived data: recomputed on demand against the final grid
//! weights, never stored alongside them.

use crate::entity::EntityStore;
use crate::grid::Grid;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The assignment of one entity to its best matching node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMapping {
    /// The mapped entity's uri.
    pub entity_uri: String,
    /// Index of the best matching node.
    pub node_index: usize,
    /// Euclidean distance from the entity's embedding to the node's weights.
    pub distance: f64,
    /// How many resolve calls have assigned this entity to this node since
    /// the last training run started.
    pub winner_count: u64,
}

/// Per-instance winner counters, keyed by `(entity uri, node index)`.
///
/// Reset whenever a new training run starts.
#[derive(Debug, Clone, Default)]
pub struct WinnerCounts {
    counts: HashMap<(String, usize), u64>,
}

impl WinnerCounts {
    /// Drops all counters (new training run).
    pub fn reset(&mut self) {
        self.counts.clear();
    }

    fn increment(&mut self, uri: &str, node_index: usize) -> u64 {
        let count = self
            .counts
            .entry((uri.to_string(), node_index))
            .or_insert(0);
        *count += 1;
        *count
    }
}

/// Computes the mapping of every entity in the store to its BMU on the
/// trained grid, recording distances and bumping winner counters.
///
/// Read-only with respect to the grid; the BMU scan runs in parallel and
/// ties break to the lowest node index, so repeated calls over an
/// unchanged grid return identical assignments.
pub fn resolve_mappings(
    grid: &Grid,
    store: &EntityStore,
    winners: &mut WinnerCounts,
) -> Vec<NodeMapping> {
    let assignments: Vec<(usize, f64)> = store
        .records()
        .par_iter()
        .map(|record| {
            // Dimensions were validated at load; the scan cannot fail.
            let mut best_idx = 0;
            let mut best_dist = f64::MAX;
            for (i, node) in grid.nodes.iter().enumerate() {
                let dist = node.distance_squared(&record.embedding);
                if dist < best_dist {
                    best_dist = dist;
                    best_idx = i;
                }
            }
            (best_idx, best_dist.sqrt())
        })
        .collect();

    store
        .records()
        .iter()
        .zip(assignments)
        .map(|(record, (node_index, distance))| {
            let winner_count = winners.increment(&record.uri, node_index);
            NodeMapping {
                entity_uri: record.uri.clone(),
                node_index,
                distance,
                winner_count,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;
    use crate::entity::EntityRecord;

    fn setup() -> (Grid, EntityStore) {
        let config = MapConfig {
            grid_width: 4,
            grid_height: 4,
            embedding_dimension: 3,
            seed: Some(1),
            ..Default::default()
        };
        let mut grid = Grid::new(&config);
        grid.nodes[5].weights = vec![1.0, 0.0, 0.0];
        grid.nodes[10].weights = vec![0.0, 1.0, 0.0];

        let records = vec![
            EntityRecord::new("urn:a", "a", vec![1.0, 0.0, 0.0]),
            EntityRecord::new("urn:b", "b", vec![0.0, 1.0, 0.0]),
        ];
        let (store, _) = EntityStore::build(records, 3);
        (grid, store)
    }

    #[test]
    fn test_resolve_assigns_bmu() {
        let (grid, store) = setup();
        let mut winners = WinnerCounts::default();
        let mappings = resolve_mappings(&grid, &store, &mut winners);

        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].node_index, 5);
        assert_eq!(mappings[1].node_index, 10);
        assert!(mappings[0].distance < 1e-10);
    }

    #[test]
    fn test_mapping_is_exact_bmu() {
        let (grid, store) = setup();
        let mut winners = WinnerCounts::default();
        let mappings = resolve_mappings(&grid, &store, &mut winners);

        // Each entity's distance to its assigned node must not exceed its
        // distance to any other node.
        for (record, mapping) in store.records().iter().zip(&mappings) {
            for node in &grid.nodes {
                assert!(mapping.distance <= node.distance(&record.embedding) + 1e-12);
            }
        }
    }

    #[test]
    fn test_winner_counts_accumulate_and_reset() {
        let (grid, store) = setup();
        let mut winners = WinnerCounts::default();

        let first = resolve_mappings(&grid, &store, &mut winners);
        assert!(first.iter().all(|m| m.winner_count == 1));

        let second = resolve_mappings(&grid, &store, &mut winners);
        assert!(second.iter().all(|m| m.winner_count == 2));

        winners.reset();
        let third = resolve_mappings(&grid, &store, &mut winners);
        assert!(third.iter().all(|m| m.winner_count == 1));
    }
}
