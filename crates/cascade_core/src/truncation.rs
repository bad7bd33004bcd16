use tracing::{info, warn};

use crate::eigen::DiagInfo;
use crate::error::{CascadeError, Result};
use crate::params::Params;
use crate::step::Step;
use crate::symmetry::Symmetry;

/// Outcome of truncating one shell.
#[derive(Debug, Clone, PartialEq)]
pub struct TruncateStats {
    /// Full dimension of the shell across all blocks.
    pub dim: usize,
    /// States actually computed by the solver.
    pub computed: usize,
    /// States retained after the cut.
    pub kept: usize,
    /// Full dimension weighted by subspace multiplicity.
    pub dim_weighted: usize,
    /// Kept states weighted by subspace multiplicity.
    pub kept_weighted: usize,
    /// Highest retained energy in shell-rescaled units.
    pub emax: f64,
}

/// Number of pooled states to retain; `pool[n - 1]` is the energy ceiling.
fn retained_count(step: &Step, pool: &[f64], params: &Params) -> usize {
    let total = pool.len();

    let mut nrkeep = if params.keep_all_last && step.is_last() {
        total
    } else if let Some(keep_energy) = params.keep_energy {
        // threshold arrives in band units
        let cutoff = keep_energy * step.unscale();
        let below = pool.iter().filter(|&&e| e <= cutoff).count();
        // one extra state past the strict threshold, for continuity with
        // runs that were cut by absolute count
        (1 + below).clamp(params.keepmin, params.keepmax).min(total)
    } else {
        params.keep.max(params.keepmin).min(total)
    };

    // Never cut through a near-degenerate cluster.
    if params.safeguard > 0.0 {
        let mut extra = 0usize;
        while nrkeep < total
            && pool[nrkeep] - pool[nrkeep - 1] <= params.safeguard
            && extra < params.safeguard_max
        {
            nrkeep += 1;
            extra += 1;
        }
        if extra > 0 {
            info!(extra, "truncation extended to protect a degenerate cluster");
        }
    }

    nrkeep.clamp(1, total)
}

/// Apply the global energy cut to a diagonalized shell.
///
/// Pools the computed eigenvalues of every block, picks the retained count
/// from the cutoff policy, then marks each block's kept states. Returns
/// `InsufficientStates` when a partially diagonalized block ends strictly
/// below the cut: states above the ceiling may exist in that block but were
/// never computed, so the cut cannot be trusted.
pub fn truncate(
    step: &Step,
    diag: &mut DiagInfo,
    sym: &dyn Symmetry,
    params: &Params,
) -> Result<TruncateStats> {
    let pool = diag.sorted_energies();
    if pool.is_empty() {
        return Err(CascadeError::Structure(
            "no eigenvalues to truncate in this shell".into(),
        ));
    }
    if pool[0] != 0.0 {
        if params.strict_checks {
            return Err(CascadeError::Structure(format!(
                "ground state not at zero before truncation: {:.6e}",
                pool[0]
            )));
        }
        warn!(egs = pool[0], "ground state not at zero before truncation");
    }

    let nrkeep = retained_count(step, &pool, params);
    let emax = pool[nrkeep - 1];

    // Every state at or below emax stays, so degeneracies across blocks may
    // push the kept total past nrkeep.
    for (_, block) in diag.iter_mut() {
        let kept = block.values().iter().filter(|&&e| e <= emax).count();
        block.truncate_keep(kept)?;
    }

    let mut stats = TruncateStats {
        dim: diag.total_dim(),
        computed: diag.total_computed(),
        kept: diag.total_kept(),
        dim_weighted: 0,
        kept_weighted: 0,
        emax,
    };
    for (target, block) in diag.iter() {
        let mult = sym.multiplicity(target);
        stats.dim_weighted += block.dim() * mult;
        stats.kept_weighted += block.kept() * mult;
    }
    info!(
        shell = step.ndx(),
        kept = stats.kept,
        kept_weighted = stats.kept_weighted,
        dim = stats.dim,
        dim_weighted = stats.dim_weighted,
        kept_ratio = stats.kept as f64 / stats.dim as f64,
        emax_band = emax * step.scale(),
        "shell truncated"
    );

    for (target, block) in diag.iter() {
        let computed = block.computed();
        if computed > 0
            && block.kept() == computed
            && block.value(computed - 1) != emax
            && computed < block.dim()
        {
            return Err(CascadeError::InsufficientStates {
                subspace: target.clone(),
            });
        }
    }
    Ok(stats)
}
