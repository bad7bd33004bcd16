use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, Result};

/// Which diagonalization strategy the driver dispatches shell tasks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    Sequential,
    SharedMemory { threads: usize },
    Distributed { workers: usize },
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Sequential
    }
}

/// Read-only configuration bundle for a run. Validated once at driver
/// construction; never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Params {
    /// Logarithmic discretization parameter, > 1.
    pub lambda: f64,
    /// Final shell index; shells run 1..=shells. Zero selects the
    /// zero-bandwidth path.
    pub shells: usize,
    /// Target number of retained states per shell.
    pub keep: usize,
    /// Lower bound on the retained-state count.
    pub keepmin: usize,
    /// Upper bound on the retained-state count (energy-threshold branch).
    pub keepmax: usize,
    /// Energy-based retention threshold in band units; overrides `keep` when
    /// set.
    pub keep_energy: Option<f64>,
    /// Retain every computed state on the final shell.
    pub keep_all_last: bool,
    /// Minimal eigenvalue gap the truncation boundary may sit in.
    pub safeguard: f64,
    /// Cap on how many extra states the safeguard may pull in.
    pub safeguard_max: usize,
    /// Initial fraction of each subspace spectrum requested from the solver.
    pub diag_ratio: f64,
    /// Redo a shell at a larger ratio when the spectrum proves too short.
    pub restart: bool,
    /// Geometric growth factor applied to the ratio on each retry.
    pub restart_factor: f64,
    pub backend: BackendKind,
    /// Load already-stored shells instead of recomputing them.
    pub resume: bool,
    /// Highest shell index eligible for resume loading; `None` means trust
    /// whatever the store holds.
    pub last_stored: Option<usize>,
    /// Run the second, density-matrix pass over the stored shells.
    pub dm_pass: bool,
    /// Effective inverse-temperature parameter, T_N = scale(N) / beta_bar.
    pub beta_bar: f64,
    /// Dump each assembled Hamiltonian at debug level.
    pub dump_matrices: bool,
    /// Escalate soft consistency warnings to hard errors.
    pub strict_checks: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            lambda: 2.0,
            shells: 1,
            keep: 100,
            keepmin: 1,
            keepmax: usize::MAX,
            keep_energy: None,
            keep_all_last: false,
            safeguard: 1e-5,
            safeguard_max: 200,
            diag_ratio: 1.0,
            restart: true,
            restart_factor: 2.0,
            backend: BackendKind::Sequential,
            resume: false,
            last_stored: None,
            dm_pass: false,
            beta_bar: 1.0,
            dump_matrices: false,
            strict_checks: false,
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<()> {
        if self.lambda <= 1.0 {
            return Err(CascadeError::Config(format!(
                "lambda must exceed 1, got {}",
                self.lambda
            )));
        }
        if self.keep == 0 {
            return Err(CascadeError::Config("keep must be at least 1".into()));
        }
        if self.keepmin == 0 || self.keepmin > self.keep || self.keepmin > self.keepmax {
            return Err(CascadeError::Config(format!(
                "keepmin must satisfy 1 <= keepmin <= keep and keepmin <= keepmax, got keepmin={} keep={} keepmax={}",
                self.keepmin, self.keep, self.keepmax
            )));
        }
        if let Some(ke) = self.keep_energy {
            if ke <= 0.0 {
                return Err(CascadeError::Config(format!(
                    "keep_energy must be positive when set, got {}",
                    ke
                )));
            }
        }
        if self.safeguard < 0.0 {
            return Err(CascadeError::Config(format!(
                "safeguard must be non-negative, got {}",
                self.safeguard
            )));
        }
        if !(self.diag_ratio > 0.0 && self.diag_ratio <= 1.0) {
            return Err(CascadeError::Config(format!(
                "diag_ratio must lie in (0, 1], got {}",
                self.diag_ratio
            )));
        }
        if self.restart && self.restart_factor <= 1.0 {
            return Err(CascadeError::Config(format!(
                "restart_factor must exceed 1 for the retry loop to terminate, got {}",
                self.restart_factor
            )));
        }
        if self.beta_bar <= 0.0 {
            return Err(CascadeError::Config(format!(
                "beta_bar must be positive, got {}",
                self.beta_bar
            )));
        }
        match self.backend {
            BackendKind::Sequential => {}
            BackendKind::SharedMemory { threads } => {
                if threads == 0 {
                    return Err(CascadeError::Config(
                        "shared-memory backend needs at least one thread".into(),
                    ));
                }
            }
            BackendKind::Distributed { workers } => {
                if workers == 0 {
                    return Err(CascadeError::Config(
                        "distributed backend needs at least one worker".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}
