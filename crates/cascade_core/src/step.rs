use serde::{Deserialize, Serialize};

/// Which of the two sweeps over the chain is running. Ratio-growth retry is
/// only legal on the `Energy` pass; the `DensityMatrix` pass replays stored
/// shells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPass {
    Energy,
    DensityMatrix,
}

/// Scalar iteration context for one shell. Immutable while the shell is being
/// processed; `advance` moves to the next shell.
///
/// Unit convention: eigenvalues inside a shell are kept in that shell's
/// rescaled units. `scale()` converts a shell-unit energy into band units,
/// `unscale()` converts a band-unit threshold into shell units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Step {
    ndx: usize,
    last_shell: usize,
    lambda: f64,
    pass: RunPass,
    zero_bandwidth: bool,
}

impl Step {
    pub fn new(ndx: usize, last_shell: usize, lambda: f64, pass: RunPass) -> Self {
        Self {
            ndx,
            last_shell,
            lambda,
            pass,
            zero_bandwidth: false,
        }
    }

    /// Degenerate single-shell context: no chain sites are ever attached, the
    /// initial basis goes straight into truncation.
    pub fn zero_bandwidth(lambda: f64, pass: RunPass) -> Self {
        Self {
            ndx: 0,
            last_shell: 0,
            lambda,
            pass,
            zero_bandwidth: true,
        }
    }

    pub fn ndx(&self) -> usize {
        self.ndx
    }

    pub fn pass(&self) -> RunPass {
        self.pass
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn is_last(&self) -> bool {
        self.ndx >= self.last_shell
    }

    pub fn is_zero_bandwidth(&self) -> bool {
        self.zero_bandwidth
    }

    /// Characteristic energy scale of this shell in band units,
    /// Lambda^(-(N-1)/2). A zero-bandwidth step never rescales, so its
    /// eigenvalues are in band units already.
    pub fn scale(&self) -> f64 {
        if self.zero_bandwidth {
            return 1.0;
        }
        self.lambda.powf(-((self.ndx as f64) - 1.0) / 2.0)
    }

    /// Diagonal rescaling factor of the recursion, sqrt(Lambda): the previous
    /// shell's spectrum is stretched by this factor when it becomes the
    /// diagonal of the next Hamiltonian.
    pub fn scale_factor(&self) -> f64 {
        self.lambda.sqrt()
    }

    /// Factor converting a band-unit energy threshold into this shell's
    /// eigenvalue units.
    pub fn unscale(&self) -> f64 {
        1.0 / self.scale()
    }

    /// Effective temperature probed by this shell.
    pub fn temperature(&self, beta_bar: f64) -> f64 {
        self.scale() / beta_bar
    }

    pub fn advance(&mut self) {
        self.ndx += 1;
    }
}
