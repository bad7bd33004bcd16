use std::collections::BTreeMap;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, Result};
use crate::invariant::Invariant;

/// Eigen-decomposition of one symmetry subspace: eigenvalues ascending,
/// eigenvector columns in matching order, plus the truncation bookkeeping.
/// Invariant: 0 <= kept <= computed <= dim.
#[derive(Debug, Clone, PartialEq)]
pub struct EigenBlock {
    values: Vec<f64>,
    vectors: DMatrix<f64>,
    dim: usize,
    kept: usize,
}

impl EigenBlock {
    pub fn new(values: Vec<f64>, vectors: DMatrix<f64>, dim: usize) -> Result<Self> {
        if values.len() > dim {
            return Err(CascadeError::Structure(format!(
                "{} eigenvalues reported for a subspace of dimension {}",
                values.len(),
                dim
            )));
        }
        if vectors.ncols() != values.len() || vectors.nrows() != dim {
            return Err(CascadeError::Structure(format!(
                "eigenvector matrix is {}x{}, expected {}x{}",
                vectors.nrows(),
                vectors.ncols(),
                dim,
                values.len()
            )));
        }
        if values.windows(2).any(|w| w[0] > w[1]) {
            return Err(CascadeError::Structure(
                "eigenvalues must be ascending".into(),
            ));
        }
        Ok(Self {
            values,
            vectors,
            dim,
            kept: 0,
        })
    }

    /// Block whose states are their own basis (identity eigenvectors), fully
    /// kept. Used for the initial shell, where the input data is already an
    /// eigenbasis. Unsorted input is reordered together with its basis
    /// columns.
    pub fn diagonal(values: Vec<f64>) -> Self {
        let dim = values.len();
        let mut order: Vec<usize> = (0..dim).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        let sorted: Vec<f64> = order.iter().map(|&i| values[i]).collect();
        let mut vectors = DMatrix::zeros(dim, dim);
        for (col, &src) in order.iter().enumerate() {
            vectors[(src, col)] = 1.0;
        }
        Self {
            values: sorted,
            vectors,
            dim,
            kept: dim,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn computed(&self) -> usize {
        self.values.len()
    }

    pub fn kept(&self) -> usize {
        self.kept
    }

    pub fn discarded(&self) -> usize {
        self.computed() - self.kept
    }

    pub fn value(&self, i: usize) -> f64 {
        self.values[i]
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn vectors(&self) -> &DMatrix<f64> {
        &self.vectors
    }

    pub fn has_vectors(&self) -> bool {
        self.vectors.ncols() > 0
    }

    /// Mark the lowest `n` states as retained.
    pub fn truncate_keep(&mut self, n: usize) -> Result<()> {
        if n > self.computed() {
            return Err(CascadeError::Structure(format!(
                "cannot keep {} of {} computed states",
                n,
                self.computed()
            )));
        }
        self.kept = n;
        Ok(())
    }

    pub(crate) fn shift(&mut self, egs: f64) {
        for v in &mut self.values {
            *v -= egs;
        }
    }

    /// Drop eigenvector storage once no reader needs it. Values and counts
    /// stay intact.
    pub fn clear_vectors(&mut self) {
        self.vectors = DMatrix::zeros(self.dim, 0);
    }

    /// Pretend the subspace is larger than what was computed, to exercise
    /// partial-diagonalization paths without a solver.
    #[cfg(test)]
    pub(crate) fn widen_dim_for_tests(&mut self, dim: usize) {
        assert!(dim >= self.computed());
        self.dim = dim;
    }
}

/// The eigenbasis of one shell: every subspace's block, keyed by invariant.
/// Produced by diagonalization, shifted once, then mutated only through
/// truncation marks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiagInfo {
    blocks: BTreeMap<Invariant, EigenBlock>,
}

impl DiagInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial-shell basis from per-subspace diagonal data; everything kept.
    pub fn initial(blocks: impl IntoIterator<Item = (Invariant, Vec<f64>)>) -> Self {
        let blocks = blocks
            .into_iter()
            .map(|(inv, values)| (inv, EigenBlock::diagonal(values)))
            .collect();
        Self { blocks }
    }

    pub fn insert(&mut self, inv: Invariant, block: EigenBlock) {
        self.blocks.insert(inv, block);
    }

    pub fn get(&self, inv: &Invariant) -> Option<&EigenBlock> {
        self.blocks.get(inv)
    }

    pub fn get_mut(&mut self, inv: &Invariant) -> Option<&mut EigenBlock> {
        self.blocks.get_mut(inv)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Invariant, &EigenBlock)> {
        self.blocks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Invariant, &mut EigenBlock)> {
        self.blocks.iter_mut()
    }

    pub fn subspaces(&self) -> impl Iterator<Item = &Invariant> {
        self.blocks.keys()
    }

    /// Subtract the global ground-state energy from every block and return
    /// it. The pooled minimum is exactly 0 afterwards.
    pub fn subtract_ground_state(&mut self) -> f64 {
        let egs = self
            .blocks
            .values()
            .filter_map(|b| b.values().first().copied())
            .fold(f64::INFINITY, f64::min);
        if !egs.is_finite() {
            return 0.0;
        }
        for block in self.blocks.values_mut() {
            block.shift(egs);
        }
        egs
    }

    /// All eigenvalues of the shell pooled and sorted ascending.
    pub fn sorted_energies(&self) -> Vec<f64> {
        let mut pooled: Vec<f64> = self
            .blocks
            .values()
            .flat_map(|b| b.values().iter().copied())
            .collect();
        pooled.sort_unstable_by(f64::total_cmp);
        pooled
    }

    /// Retained size of a subspace; zero for labels this shell does not
    /// carry. This is the dimension the subspace contributes as an ancestor.
    pub fn kept_size(&self, inv: &Invariant) -> usize {
        self.blocks.get(inv).map_or(0, |b| b.kept())
    }

    pub fn total_dim(&self) -> usize {
        self.blocks.values().map(|b| b.dim()).sum()
    }

    pub fn total_computed(&self) -> usize {
        self.blocks.values().map(|b| b.computed()).sum()
    }

    pub fn total_kept(&self) -> usize {
        self.blocks.values().map(|b| b.kept()).sum()
    }

    pub fn clear_vectors(&mut self) {
        for block in self.blocks.values_mut() {
            block.clear_vectors();
        }
    }
}

/// Flattened serde mirror of an `EigenBlock`; eigenvectors row-major.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub invariant: Vec<i32>,
    pub values: Vec<f64>,
    pub vectors: Vec<f64>,
    pub vector_rows: usize,
    pub vector_cols: usize,
    pub dim: usize,
    pub kept: usize,
}

/// One shell's basis in storable form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellRecord {
    pub shell: usize,
    pub blocks: Vec<BlockRecord>,
}

impl ShellRecord {
    pub fn from_diag(shell: usize, diag: &DiagInfo) -> Self {
        let blocks = diag
            .iter()
            .map(|(inv, block)| {
                let m = block.vectors();
                let mut flat = Vec::with_capacity(m.nrows() * m.ncols());
                for i in 0..m.nrows() {
                    for j in 0..m.ncols() {
                        flat.push(m[(i, j)]);
                    }
                }
                BlockRecord {
                    invariant: inv.values().to_vec(),
                    values: block.values().to_vec(),
                    vectors: flat,
                    vector_rows: m.nrows(),
                    vector_cols: m.ncols(),
                    dim: block.dim(),
                    kept: block.kept(),
                }
            })
            .collect();
        Self { shell, blocks }
    }

    pub fn into_diag(self) -> Result<DiagInfo> {
        let mut diag = DiagInfo::new();
        for rec in self.blocks {
            if rec.vectors.len() != rec.vector_rows * rec.vector_cols {
                return Err(CascadeError::Structure(format!(
                    "shell {} record: {} vector entries for a {}x{} matrix",
                    self.shell,
                    rec.vectors.len(),
                    rec.vector_rows,
                    rec.vector_cols
                )));
            }
            let vectors =
                DMatrix::from_row_slice(rec.vector_rows, rec.vector_cols, &rec.vectors);
            let kept = rec.kept;
            let mut block = EigenBlock::new(rec.values, vectors, rec.dim)?;
            block.truncate_keep(kept)?;
            diag.insert(Invariant::new(rec.invariant), block);
        }
        Ok(diag)
    }
}
