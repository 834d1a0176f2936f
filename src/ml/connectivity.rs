//! Voxel adjacency graph over the in-mask grid

use crate::ml::features::masked_voxels;
use crate::structs::{DecodeError, Result};
use ndarray::Array3;

/// Undirected graph whose nodes are in-mask voxels
///
/// Node `i` is the `i`-th in-mask voxel in row-major grid order, the same
/// order as the design-matrix columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoxelGraph {
    /// Edges as `(lower, higher)` node ids
    pub edges: Vec<(usize, usize)>,
    adjacency: Vec<Vec<usize>>,
}

impl VoxelGraph {
    #[must_use]
    pub fn n_nodes(&self) -> usize {
        self.adjacency.len()
    }

    #[must_use]
    pub fn n_edges(&self) -> usize {
        self.edges.len()
    }

    /// Neighbours of `node`, ascending
    #[must_use]
    pub fn neighbors(&self, node: usize) -> &[usize] {
        self.adjacency.get(node).map_or(&[][..], Vec::as_slice)
    }
}

/// Connect in-mask voxels that are axis-adjacent in the grid
///
/// # Errors
/// Returns `Config` error if `mask` does not have shape `(nx, ny, nz)`
pub fn grid_to_graph(nx: usize, ny: usize, nz: usize, mask: &Array3<f64>) -> Result<VoxelGraph> {
    if mask.dim() != (nx, ny, nz) {
        return Err(DecodeError::Config(format!(
            "mask shape {:?} does not match grid {:?}",
            mask.dim(),
            (nx, ny, nz)
        )));
    }

    let voxels = masked_voxels(mask);
    let mut node_of = Array3::<Option<usize>>::from_elem((nx, ny, nz), None);
    for (node, &[x, y, z]) in voxels.iter().enumerate() {
        node_of[[x, y, z]] = Some(node);
    }

    let mut edges = Vec::new();
    let mut adjacency = vec![Vec::new(); voxels.len()];

    for (node, &[x, y, z]) in voxels.iter().enumerate() {
        let forward = [
            (x + 1 < nx).then(|| [x + 1, y, z]),
            (y + 1 < ny).then(|| [x, y + 1, z]),
            (z + 1 < nz).then(|| [x, y, z + 1]),
        ];
        for position in forward.into_iter().flatten() {
            if let Some(other) = node_of[position] {
                edges.push((node.min(other), node.max(other)));
                adjacency[node].push(other);
                adjacency[other].push(node);
            }
        }
    }

    for neighbors in &mut adjacency {
        neighbors.sort_unstable();
    }
    edges.sort_unstable();

    Ok(VoxelGraph { edges, adjacency })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_grid_edge_count() {
        let mask = Array3::<f64>::ones((3, 2, 2));
        let graph = grid_to_graph(3, 2, 2, &mask).expect("graph");

        // (nx-1)*ny*nz + nx*(ny-1)*nz + nx*ny*(nz-1)
        assert_eq!(graph.n_nodes(), 12);
        assert_eq!(graph.n_edges(), 8 + 6 + 6);
    }

    #[test]
    fn test_mask_breaks_adjacency() {
        let mut mask = Array3::<f64>::zeros((3, 1, 1));
        mask[[0, 0, 0]] = 1.0;
        mask[[2, 0, 0]] = 1.0;
        let graph = grid_to_graph(3, 1, 1, &mask).expect("graph");

        assert_eq!(graph.n_nodes(), 2);
        assert_eq!(graph.n_edges(), 0);
        assert!(graph.neighbors(0).is_empty());
    }

    #[test]
    fn test_neighbors_symmetric() {
        let mut mask = Array3::<f64>::ones((2, 2, 1));
        mask[[1, 1, 0]] = 0.0;
        let graph = grid_to_graph(2, 2, 1, &mask).expect("graph");

        // Nodes: 0=(0,0), 1=(0,1), 2=(1,0)
        assert_eq!(graph.edges, vec![(0, 1), (0, 2)]);
        assert_eq!(graph.neighbors(0), &[1, 2]);
        assert_eq!(graph.neighbors(1), &[0]);
        assert_eq!(graph.neighbors(2), &[0]);
    }

    #[test]
    fn test_shape_mismatch() {
        let mask = Array3::<f64>::ones((2, 2, 1));
        assert!(grid_to_graph(2, 2, 2, &mask).is_err());
    }
}
