use crate::invariant::Invariant;

/// Engine-level failure taxonomy. `InsufficientStates` is the only variant
/// with a defined recovery path (the driver's ratio-growth retry loop);
/// everything else aborts the current shell.
#[derive(Debug, thiserror::Error)]
pub enum CascadeError {
    #[error("subspace {subspace}: computed spectrum too short to place the truncation cutoff")]
    InsufficientStates { subspace: Invariant },

    #[error("eigensolver failed to converge on subspace {subspace} (dim {dim})")]
    SolverFailure { subspace: Invariant, dim: usize },

    #[error("structure violation: {0}")]
    Structure(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("store codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("shell consumer failed: {0}")]
    Consumer(#[from] anyhow::Error),
}

impl CascadeError {
    /// Whether the driver may redo the shell at a larger diagonalization
    /// ratio instead of aborting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CascadeError::InsufficientStates { .. })
    }
}

pub type Result<T> = std::result::Result<T, CascadeError>;
