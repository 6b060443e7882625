//! Hierarchical resource aggregation for dense-region queries.
//!
//! A [`ResourcePyramid`] summarises a square resource grid as a tree of
//! region totals. Descending from the root toward the child with the best
//! distance-discounted total finds a rich cluster in `O(log n)` instead of
//! scanning every cell. Extraction is destructive bookkeeping: the returned
//! leaf's total is subtracted from itself and every ancestor, so repeated
//! queries within one turn never offer the same cluster twice.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted while building a pyramid.
#[derive(Debug, Error)]
pub enum PyramidError {
    /// Indicates grid dimensions the pyramid cannot represent.
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(&'static str),
}

/// Arena index of a node. Nodes never move once built, so a plain index is
/// a stable handle for the pyramid's lifetime.
type NodeId = usize;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    /// Top-left cell of the region covered by this node.
    origin: (u32, u32),
    /// Region edge length in cells.
    size: u32,
    /// Summed resource of the region, reduced as leaves are drained.
    total: u64,
}

impl Node {
    /// Geometric center of the region in cell coordinates.
    fn center(&self) -> (f64, f64) {
        let half = f64::from(self.size - 1) / 2.0;
        (f64::from(self.origin.0) + half, f64::from(self.origin.1) + half)
    }
}

/// Quadtree-style aggregate over a square, toroidal resource grid.
///
/// Even-sized regions split into four quadrants; odd-sized regions larger
/// than one cell split directly into their individual cells. Nodes live in
/// a flat arena and reference their parent by index, so draining a leaf
/// updates every ancestor without cyclic ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePyramid {
    side: u32,
    nodes: Vec<Node>,
    root: NodeId,
}

impl ResourcePyramid {
    /// Build a pyramid over a `side x side` grid given row-major cell totals.
    pub fn from_cells(side: u32, cells: &[u32]) -> Result<Self, PyramidError> {
        if side == 0 {
            return Err(PyramidError::InvalidDimensions("side must be non-zero"));
        }
        let expected = (side as usize) * (side as usize);
        if cells.len() != expected {
            return Err(PyramidError::InvalidDimensions(
                "cell count must equal side * side",
            ));
        }
        let mut nodes = Vec::new();
        let root = Self::build_node(&mut nodes, None, (0, 0), side, side as usize, cells);
        Ok(Self { side, nodes, root })
    }

    fn build_node(
        nodes: &mut Vec<Node>,
        parent: Option<NodeId>,
        origin: (u32, u32),
        size: u32,
        side: usize,
        cells: &[u32],
    ) -> NodeId {
        let id = nodes.len();
        nodes.push(Node {
            parent,
            children: Vec::new(),
            origin,
            size,
            total: 0,
        });

        if size == 1 {
            let idx = origin.1 as usize * side + origin.0 as usize;
            nodes[id].total = u64::from(cells[idx]);
            return id;
        }

        let mut children = Vec::new();
        let mut total = 0u64;
        if size % 2 == 0 {
            let half = size / 2;
            for qy in 0..2u32 {
                for qx in 0..2u32 {
                    let child_origin = (origin.0 + qx * half, origin.1 + qy * half);
                    let child = Self::build_node(nodes, Some(id), child_origin, half, side, cells);
                    total += nodes[child].total;
                    children.push(child);
                }
            }
        } else {
            // Odd regions cannot quarter evenly; fall through to one leaf
            // per cell so every position stays addressable.
            for dy in 0..size {
                for dx in 0..size {
                    let child_origin = (origin.0 + dx, origin.1 + dy);
                    let child = Self::build_node(nodes, Some(id), child_origin, 1, side, cells);
                    total += nodes[child].total;
                    children.push(child);
                }
            }
        }
        nodes[id].children = children;
        nodes[id].total = total;
        id
    }

    /// Grid edge length the pyramid was built over.
    #[must_use]
    pub const fn side(&self) -> u32 {
        self.side
    }

    /// Remaining (undrained) resource across the whole grid.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.nodes[self.root].total
    }

    /// Whether every region has been drained.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.total() == 0
    }

    /// Wrap-around Manhattan distance from `from` to a node's center.
    fn center_distance(&self, from: (u32, u32), node: NodeId) -> f64 {
        let (cx, cy) = self.nodes[node].center();
        let extent = f64::from(self.side);
        let span = |a: f64, b: f64| {
            let direct = (a - b).abs();
            direct.min(extent - direct)
        };
        span(f64::from(from.0), cx) + span(f64::from(from.1), cy)
    }

    /// Descend toward the densest remaining region as seen from `from` and
    /// drain the leaf that is reached.
    ///
    /// At each level the child maximising `total * discount^distance` wins,
    /// with distance measured to the child's own center; equal scores keep
    /// the first child in quadrant order. Returns the leaf's cell position,
    /// or `None` once the pyramid is exhausted. The drained total is
    /// subtracted along the parent chain, so a later call in the same turn
    /// moves on to the next-best cluster.
    pub fn follow_max(&mut self, from: (u32, u32), discount: f64) -> Option<(u32, u32)> {
        if self.is_exhausted() {
            return None;
        }
        let mut current = self.root;
        while self.nodes[current].size > 1 {
            let mut best: Option<(NodeId, OrderedFloat<f64>)> = None;
            for &child in &self.nodes[current].children {
                let node = &self.nodes[child];
                let score =
                    OrderedFloat(node.total as f64 * discount.powf(self.center_distance(from, child)));
                match best {
                    Some((_, top)) if score <= top => {}
                    _ => best = Some((child, score)),
                }
            }
            current = best?.0;
        }

        let position = self.nodes[current].origin;
        let drained = self.nodes[current].total;
        self.drain(current, drained);
        Some(position)
    }

    /// Subtract `amount` from a node and all of its ancestors.
    fn drain(&mut self, node: NodeId, amount: u64) {
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            let entry = &mut self.nodes[id];
            entry.total = entry.total.saturating_sub(amount);
            cursor = entry.parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(side: u32, value: u32) -> Vec<u32> {
        vec![value; (side as usize) * (side as usize)]
    }

    #[test]
    fn rejects_bad_dimensions() {
        assert!(ResourcePyramid::from_cells(0, &[]).is_err());
        assert!(ResourcePyramid::from_cells(4, &flat(3, 1)).is_err());
    }

    #[test]
    fn even_grid_splits_into_quadrants() {
        let pyramid = ResourcePyramid::from_cells(4, &flat(4, 10)).expect("pyramid");
        assert_eq!(pyramid.total(), 160);
        assert_eq!(pyramid.nodes[pyramid.root].children.len(), 4);
        for &child in &pyramid.nodes[pyramid.root].children {
            assert_eq!(pyramid.nodes[child].total, 40);
            assert_eq!(pyramid.nodes[child].size, 2);
        }
    }

    #[test]
    fn odd_grid_splits_into_cells() {
        let mut cells = flat(3, 0);
        cells[4] = 7; // center of a 3x3
        let pyramid = ResourcePyramid::from_cells(3, &cells).expect("pyramid");
        assert_eq!(pyramid.nodes[pyramid.root].children.len(), 9);
        assert_eq!(pyramid.total(), 7);
    }

    #[test]
    fn follow_max_finds_the_rich_cell() {
        let mut cells = flat(4, 0);
        cells[2 * 4 + 3] = 500;
        let mut pyramid = ResourcePyramid::from_cells(4, &cells).expect("pyramid");
        assert_eq!(pyramid.follow_max((0, 0), 0.9), Some((3, 2)));
        assert!(pyramid.is_exhausted());
        assert_eq!(pyramid.follow_max((0, 0), 0.9), None);
    }

    #[test]
    fn follow_max_never_reoffers_a_drained_leaf() {
        let mut cells = flat(4, 0);
        cells[0] = 100;
        cells[5] = 90;
        cells[10] = 80;
        let mut pyramid = ResourcePyramid::from_cells(4, &cells).expect("pyramid");

        let mut seen = Vec::new();
        while let Some(pos) = pyramid.follow_max((1, 1), 0.9) {
            assert!(!seen.contains(&pos), "leaf {pos:?} offered twice");
            seen.push(pos);
        }
        assert_eq!(seen.len(), 3);
        assert!(pyramid.is_exhausted());
    }

    #[test]
    fn discount_prefers_the_nearby_cluster() {
        let side = 8u32;
        let mut cells = flat(side, 0);
        // A large but distant pile versus a slightly smaller one next door.
        cells[0] = 120;
        cells[(4 * side + 4) as usize] = 160;
        let mut pyramid = ResourcePyramid::from_cells(side, &cells).expect("pyramid");
        assert_eq!(pyramid.follow_max((0, 1), 0.5), Some((0, 0)));
    }

    #[test]
    fn distance_wraps_around_the_torus() {
        let side = 8u32;
        let pyramid = ResourcePyramid::from_cells(side, &flat(side, 1)).expect("pyramid");
        // The (4,0) quadrant's center sits at x = 5.5; from the left edge
        // the wrapped span (2.5) must beat the direct span (5.5).
        let near = pyramid.center_distance((0, 0), pyramid.nodes[pyramid.root].children[1]);
        assert!((near - 4.0).abs() < 1e-9, "wrapped distance was {near}");
    }
}
