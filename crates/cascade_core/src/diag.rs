use nalgebra::{DMatrix, SymmetricEigen};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::eigen::{DiagInfo, EigenBlock};
use crate::error::{CascadeError, Result};
use crate::hamiltonian::{assemble, max_asymmetry, CouplingTable};
use crate::invariant::Invariant;
use crate::params::BackendKind;
use crate::step::Step;
use crate::subspaces::{SubspaceStructure, TaskList};
use crate::symmetry::Symmetry;

mod worker;

/// Largest tolerated |H - H^T| entry before a block is flagged.
const ASYMMETRY_TOLERANCE: f64 = 1e-9;

/// Upper bound on tridiagonal QR sweeps. Small blocks converge in a handful
/// of sweeps; hitting this bound is reported as a solver failure.
const MAX_SWEEPS: usize = 10_000;

/// Everything a backend needs to diagonalize one shell.
#[derive(Clone, Copy)]
pub struct ShellContext<'a> {
    pub step: &'a Step,
    pub structure: &'a SubspaceStructure,
    pub prev: &'a DiagInfo,
    pub sym: &'a dyn Symmetry,
    pub coupling: &'a CouplingTable,
    /// Fraction of each block's spectrum to compute, in (0, 1].
    pub ratio: f64,
    pub dump_matrices: bool,
    pub strict_checks: bool,
}

/// Number of eigenpairs to compute for a block of dimension `dim`.
pub(crate) fn requested_states(ratio: f64, dim: usize) -> usize {
    ((ratio * dim as f64).ceil() as usize).clamp(1, dim)
}

fn solve_symmetric(target: &Invariant, h: DMatrix<f64>, requested: usize) -> Result<EigenBlock> {
    let dim = h.nrows();
    let eigen = SymmetricEigen::try_new(h, f64::EPSILON, MAX_SWEEPS).ok_or_else(|| {
        CascadeError::SolverFailure {
            subspace: target.clone(),
            dim,
        }
    })?;

    // nalgebra returns an unsorted spectrum
    let mut order: Vec<usize> = (0..dim).collect();
    order.sort_unstable_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
    order.truncate(requested.min(dim));

    let values: Vec<f64> = order.iter().map(|&k| eigen.eigenvalues[k]).collect();
    let mut vectors = DMatrix::zeros(dim, order.len());
    for (col, &k) in order.iter().enumerate() {
        vectors.set_column(col, &eigen.eigenvectors.column(k));
    }
    EigenBlock::new(values, vectors, dim)
}

/// Assemble and diagonalize a single invariant subspace.
pub(crate) fn solve_task(ctx: &ShellContext<'_>, target: &Invariant) -> Result<(Invariant, EigenBlock)> {
    let layout = ctx.structure.get(target).ok_or_else(|| {
        CascadeError::Structure(format!("no layout for subspace {} in this shell", target))
    })?;
    let h = assemble(
        ctx.step,
        target,
        layout,
        ctx.prev,
        ctx.sym,
        ctx.coupling,
        ctx.dump_matrices,
    )?;

    let asym = max_asymmetry(&h);
    if asym > ASYMMETRY_TOLERANCE {
        if ctx.strict_checks {
            return Err(CascadeError::Structure(format!(
                "Hamiltonian block {} deviates from symmetry by {:.3e}",
                target, asym
            )));
        }
        warn!(subspace = %target, asymmetry = asym, "asymmetric Hamiltonian block");
    }

    let requested = requested_states(ctx.ratio, layout.total());
    let block = solve_symmetric(target, h, requested)?;
    debug!(
        subspace = %target,
        dim = block.dim(),
        computed = block.computed(),
        "diagonalized block"
    );
    Ok((target.clone(), block))
}

/// Diagonalization backend. All three produce identical spectra; they differ
/// only in how the per-subspace tasks are scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagBackend {
    /// One task at a time on the calling thread.
    Sequential,
    /// Work-stealing pool of OS threads sharing the shell data.
    SharedMemory { threads: usize },
    /// Coordinator thread handing tasks to message-passing workers.
    Distributed { workers: usize },
}

impl DiagBackend {
    pub fn from_kind(kind: &BackendKind) -> Self {
        match *kind {
            BackendKind::Sequential => Self::Sequential,
            BackendKind::SharedMemory { threads } => Self::SharedMemory { threads },
            BackendKind::Distributed { workers } => Self::Distributed { workers },
        }
    }

    pub fn diagonalize(&self, ctx: &ShellContext<'_>, tasks: &TaskList) -> Result<DiagInfo> {
        match self {
            Self::Sequential => diagonalize_sequential(ctx, tasks),
            Self::SharedMemory { threads } => diagonalize_shared(ctx, tasks, *threads),
            Self::Distributed { workers } => worker::run_distributed(ctx, tasks, *workers),
        }
    }
}

fn diagonalize_sequential(ctx: &ShellContext<'_>, tasks: &TaskList) -> Result<DiagInfo> {
    let mut diag = DiagInfo::new();
    for target in tasks.iter() {
        let (inv, block) = solve_task(ctx, target)?;
        diag.insert(inv, block);
    }
    Ok(diag)
}

fn diagonalize_shared(ctx: &ShellContext<'_>, tasks: &TaskList, threads: usize) -> Result<DiagInfo> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("cascade-diag-{i}"))
        .build()
        .map_err(|e| CascadeError::Config(format!("cannot build thread pool: {e}")))?;

    let solved = pool.install(|| {
        tasks
            .as_slice()
            .par_iter()
            .map(|target| solve_task(ctx, target))
            .collect::<Result<Vec<_>>>()
    })?;

    let mut diag = DiagInfo::new();
    for (inv, block) in solved {
        diag.insert(inv, block);
    }
    Ok(diag)
}
