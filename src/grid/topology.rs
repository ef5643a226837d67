//! Grid topologies and their distance/adjacency rules.

use serde::{Deserialize, Serialize};

/// Lattice topology of the map grid.
///
/// The topology determines how node coordinates project onto the plane,
/// which in turn drives neighborhood distances during training and
/// adjacency for u-matrix computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Topology {
    /// Square lattice; each interior node has 4 direct neighbors.
    #[default]
    Rectangular,
    /// Hexagonal lattice in odd-row offset layout; each interior node has
    /// 6 direct neighbors.
    Hexagonal,
}

/// Vertical spacing between hexagonal rows (sqrt(3)/2).
const HEX_ROW_SPACING: f64 = 0.866_025_403_784_438_6;

impl Topology {
    /// Projects grid coordinates onto the plane.
    ///
    /// Rectangular grids map directly; hexagonal grids shift odd rows by
    /// half a cell and compress row spacing, so plane distances between
    /// adjacent hex cells are uniformly 1.
    #[inline]
    pub fn plane_position(&self, x: usize, y: usize) -> (f64, f64) {
        match self {
            Topology::Rectangular => (x as f64, y as f64),
            Topology::Hexagonal => {
                let offset = if y % 2 == 1 { 0.5 } else { 0.0 };
                (x as f64 + offset, y as f64 * HEX_ROW_SPACING)
            }
        }
    }

    /// Euclidean distance between two grid positions in the plane.
    pub fn grid_distance(&self, a: (usize, usize), b: (usize, usize)) -> f64 {
        let (ax, ay) = self.plane_position(a.0, a.1);
        let (bx, by) = self.plane_position(b.0, b.1);
        let dx = ax - bx;
        let dy = ay - by;
        (dx * dx + dy * dy).sqrt()
    }

    /// Returns the indices of the nodes directly adjacent to `(x, y)`.
    ///
    /// Used for u-matrix fields and flood-fill clustering. Edge nodes have
    /// fewer neighbors; there is no wraparound.
    pub fn neighbors(&self, x: usize, y: usize, width: usize, height: usize) -> Vec<usize> {
        let offsets: &[(i64, i64)] = match self {
            Topology::Rectangular => &[(1, 0), (-1, 0), (0, 1), (0, -1)],
            // Odd-row offset layout: neighbor columns depend on row parity.
            Topology::Hexagonal => {
                if y % 2 == 1 {
                    &[(1, 0), (-1, 0), (0, -1), (1, -1), (0, 1), (1, 1)]
                } else {
                    &[(1, 0), (-1, 0), (-1, -1), (0, -1), (-1, 1), (0, 1)]
                }
            }
        };

        let mut result = Vec::with_capacity(offsets.len());
        for &(dx, dy) in offsets {
            let nx = x as i64 + dx;
            let ny = y as i64 + dy;
            if nx >= 0 && ny >= 0 && (nx as usize) < width && (ny as usize) < height {
                result.push(ny as usize * width + nx as usize);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rectangular_distance() {
        let t = Topology::Rectangular;
        let dist = t.grid_distance((0, 0), (3, 4));
        assert!((dist - 5.0).abs() < 1e-10); // 3-4-5 triangle
    }

    #[test]
    fn test_hexagonal_adjacent_distance_is_unit() {
        let t = Topology::Hexagonal;
        // All six neighbors of an interior cell sit at plane distance 1.
        for idx in t.neighbors(2, 2, 5, 5) {
            let (nx, ny) = (idx % 5, idx / 5);
            let dist = t.grid_distance((2, 2), (nx, ny));
            assert!((dist - 1.0).abs() < 1e-9, "neighbor ({nx},{ny}) at {dist}");
        }
    }

    #[test]
    fn test_rectangular_neighbor_count() {
        let t = Topology::Rectangular;
        assert_eq!(t.neighbors(0, 0, 4, 4).len(), 2); // corner
        assert_eq!(t.neighbors(1, 0, 4, 4).len(), 3); // edge
        assert_eq!(t.neighbors(1, 1, 4, 4).len(), 4); // interior
    }

    #[test]
    fn test_hexagonal_neighbor_count() {
        let t = Topology::Hexagonal;
        assert_eq!(t.neighbors(2, 2, 5, 5).len(), 6);
        assert!(t.neighbors(0, 0, 5, 5).len() < 6);
    }

    #[test]
    fn test_neighbors_within_bounds() {
        for t in [Topology::Rectangular, Topology::Hexagonal] {
            for y in 0..4 {
                for x in 0..4 {
                    for idx in t.neighbors(x, y, 4, 4) {
                        assert!(idx < 16);
                        assert_ne!(idx, y * 4 + x);
                    }
                }
            }
        }
    }
}
