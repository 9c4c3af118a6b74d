//! Sparse accumulator: folds per-edge dense blocks into block-sparse storage.
//!
//! Node indices are signed so that callers can shift them by a gauge offset
//! without filtering the edge arrays. Any index `< 0` or `>= n` is dropped.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SparseError {
    #[error("length mismatch: {blocks} blocks, {rows} row indices, {cols} column indices")]
    LengthMismatch {
        blocks: usize,
        rows: usize,
        cols: usize,
    },
    #[error("block {index} has shape {actual:?}, expected {expected:?}")]
    BlockShape {
        index: usize,
        expected: (usize, usize),
        actual: (usize, usize),
    },
}

/// Node-indexed block matrix. Only touched blocks are stored.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSparseMatrix {
    rows: usize,
    cols: usize,
    block_shape: (usize, usize),
    blocks: BTreeMap<(usize, usize), DMatrix<f64>>,
}

impl BlockSparseMatrix {
    /// Empty `rows × cols` node grid whose blocks are `block_shape` each.
    pub fn new(rows: usize, cols: usize, block_shape: (usize, usize)) -> Self {
        Self {
            rows,
            cols,
            block_shape,
            blocks: BTreeMap::new(),
        }
    }

    /// Node counts `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn block_shape(&self) -> (usize, usize) {
        self.block_shape
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&DMatrix<f64>> {
        self.blocks.get(&(row, col))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(usize, usize), &DMatrix<f64>)> {
        self.blocks.iter()
    }

    /// Zero every stored block, keeping the sparsity pattern and allocations.
    pub fn fill_zero(&mut self) {
        for block in self.blocks.values_mut() {
            block.fill(0.0);
        }
    }

    fn add_block(&mut self, row: usize, col: usize, block: &DMatrix<f64>) {
        let (br, bc) = self.block_shape;
        *self
            .blocks
            .entry((row, col))
            .or_insert_with(|| DMatrix::zeros(br, bc)) += block;
    }

    /// Dense `(rows·br) × (cols·bc)` matrix.
    pub fn to_dense(&self) -> DMatrix<f64> {
        let (br, bc) = self.block_shape;
        let mut dense = DMatrix::zeros(self.rows * br, self.cols * bc);
        for (&(r, c), block) in &self.blocks {
            dense.view_mut((r * br, c * bc), (br, bc)).copy_from(block);
        }
        dense
    }
}

/// Node-indexed block vector, dense over nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockVector {
    block_dim: usize,
    blocks: Vec<DVector<f64>>,
}

impl BlockVector {
    pub fn zeros(len: usize, block_dim: usize) -> Self {
        Self {
            block_dim,
            blocks: vec![DVector::zeros(block_dim); len],
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block_dim(&self) -> usize {
        self.block_dim
    }

    pub fn block(&self, index: usize) -> &DVector<f64> {
        &self.blocks[index]
    }

    pub fn block_mut(&mut self, index: usize) -> &mut DVector<f64> {
        &mut self.blocks[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &DVector<f64>> {
        self.blocks.iter()
    }

    pub fn fill_zero(&mut self) {
        for block in &mut self.blocks {
            block.fill(0.0);
        }
    }

    /// Concatenation of all blocks.
    pub fn to_dense(&self) -> DVector<f64> {
        let mut dense = DVector::zeros(self.blocks.len() * self.block_dim);
        for (k, block) in self.blocks.iter().enumerate() {
            dense.rows_mut(k * self.block_dim, self.block_dim).copy_from(block);
        }
        dense
    }

    /// Split a dense vector back into blocks of `block_dim`.
    pub fn from_dense(dense: &DVector<f64>, block_dim: usize) -> Self {
        let len = if block_dim == 0 { 0 } else { dense.len() / block_dim };
        let blocks = (0..len)
            .map(|k| dense.rows(k * block_dim, block_dim).into_owned())
            .collect();
        Self { block_dim, blocks }
    }
}

/// Pose-structure coupling `E`, stored column-wise per structure node.
///
/// Column `k` holds the blocks `(row offset, rows × block_dim)` of the pose
/// variables that node `k` couples to. Blocks may overlap; they are summed.
#[derive(Debug, Clone, PartialEq)]
pub struct StructureCoupling {
    rows: usize,
    block_dim: usize,
    columns: Vec<Vec<(usize, DMatrix<f64>)>>,
}

impl StructureCoupling {
    /// Empty coupling for `rows` pose variables and `num_nodes` structure nodes.
    pub fn new(rows: usize, num_nodes: usize, block_dim: usize) -> Self {
        Self {
            rows,
            block_dim,
            columns: vec![Vec::new(); num_nodes],
        }
    }

    /// Column view of a block matrix whose block columns are structure nodes.
    pub fn from_block_sparse(matrix: &BlockSparseMatrix) -> Self {
        let (nr, nc) = matrix.shape();
        let (br, bc) = matrix.block_shape();
        let mut coupling = Self::new(nr * br, nc, bc);
        for (&(r, c), block) in matrix.iter() {
            coupling.columns[c].push((r * br, block.clone()));
        }
        coupling
    }

    /// Number of scalar pose rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn num_nodes(&self) -> usize {
        self.columns.len()
    }

    pub fn block_dim(&self) -> usize {
        self.block_dim
    }

    /// Blocks of structure node `node`.
    pub fn column(&self, node: usize) -> &[(usize, DMatrix<f64>)] {
        &self.columns[node]
    }

    /// Add a `rows × block_dim` block at scalar row `offset` of node `node`.
    pub fn add(&mut self, offset: usize, node: usize, block: DMatrix<f64>) -> Result<(), SparseError> {
        if block.ncols() != self.block_dim || offset + block.nrows() > self.rows {
            return Err(SparseError::BlockShape {
                index: node,
                expected: (self.rows.saturating_sub(offset), self.block_dim),
                actual: block.shape(),
            });
        }
        let column = &mut self.columns[node];
        match column
            .iter()
            .position(|(o, b)| *o == offset && b.shape() == block.shape())
        {
            Some(pos) => column[pos].1 += block,
            None => column.push((offset, block)),
        }
        Ok(())
    }

    /// Stack `other` below `self`; both must share the structure nodes.
    pub fn vstack(mut self, other: StructureCoupling) -> Result<Self, SparseError> {
        if other.block_dim != self.block_dim || other.columns.len() != self.columns.len() {
            return Err(SparseError::BlockShape {
                index: 0,
                expected: (self.columns.len(), self.block_dim),
                actual: (other.columns.len(), other.block_dim),
            });
        }
        let shift = self.rows;
        self.rows += other.rows;
        for (column, extra) in self.columns.iter_mut().zip(other.columns) {
            column.extend(extra.into_iter().map(|(offset, block)| (offset + shift, block)));
        }
        Ok(self)
    }

    /// Dense `rows × (num_nodes·block_dim)` matrix.
    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.rows, self.columns.len() * self.block_dim);
        for (k, column) in self.columns.iter().enumerate() {
            for (offset, block) in column {
                let mut view = dense.view_mut((*offset, k * self.block_dim), block.shape());
                view += block;
            }
        }
        dense
    }
}

#[inline]
fn in_range(index: i64, n: usize) -> Option<usize> {
    usize::try_from(index).ok().filter(|&i| i < n)
}

/// Build an `n × m` block matrix by summing `blocks[e]` into `(ii[e], jj[e])`.
pub fn scatter_add_mat(
    blocks: &[DMatrix<f64>],
    ii: &[i64],
    jj: &[i64],
    n: usize,
    m: usize,
    block_shape: (usize, usize),
) -> Result<BlockSparseMatrix, SparseError> {
    let mut out = BlockSparseMatrix::new(n, m, block_shape);
    scatter_add_mat_into(&mut out, blocks, ii, jj)?;
    Ok(out)
}

/// In-place variant of [`scatter_add_mat`] accumulating into `dst`.
pub fn scatter_add_mat_into(
    dst: &mut BlockSparseMatrix,
    blocks: &[DMatrix<f64>],
    ii: &[i64],
    jj: &[i64],
) -> Result<(), SparseError> {
    if blocks.len() != ii.len() || blocks.len() != jj.len() {
        return Err(SparseError::LengthMismatch {
            blocks: blocks.len(),
            rows: ii.len(),
            cols: jj.len(),
        });
    }
    for (e, block) in blocks.iter().enumerate() {
        if block.shape() != dst.block_shape {
            return Err(SparseError::BlockShape {
                index: e,
                expected: dst.block_shape,
                actual: block.shape(),
            });
        }
    }

    let (n, m) = dst.shape();
    for ((block, &i), &j) in blocks.iter().zip(ii).zip(jj) {
        if let (Some(r), Some(c)) = (in_range(i, n), in_range(j, m)) {
            dst.add_block(r, c, block);
        }
    }
    Ok(())
}

/// Build an `n`-node block vector by summing `blocks[e]` into `ii[e]`.
pub fn scatter_add_vec(
    blocks: &[DVector<f64>],
    ii: &[i64],
    n: usize,
    block_dim: usize,
) -> Result<BlockVector, SparseError> {
    let mut out = BlockVector::zeros(n, block_dim);
    scatter_add_vec_into(&mut out, blocks, ii)?;
    Ok(out)
}

/// In-place variant of [`scatter_add_vec`] accumulating into `dst`.
pub fn scatter_add_vec_into(
    dst: &mut BlockVector,
    blocks: &[DVector<f64>],
    ii: &[i64],
) -> Result<(), SparseError> {
    if blocks.len() != ii.len() {
        return Err(SparseError::LengthMismatch {
            blocks: blocks.len(),
            rows: ii.len(),
            cols: ii.len(),
        });
    }
    for (e, block) in blocks.iter().enumerate() {
        if block.len() != dst.block_dim {
            return Err(SparseError::BlockShape {
                index: e,
                expected: (dst.block_dim, 1),
                actual: (block.len(), 1),
            });
        }
    }

    let n = dst.len();
    for (block, &i) in blocks.iter().zip(ii) {
        if let Some(r) = in_range(i, n) {
            dst.blocks[r] += block;
        }
    }
    Ok(())
}
