pub mod qsz;

pub use qsz::QSz;

use nalgebra::DMatrix;

use crate::error::Result;
use crate::hamiltonian::CouplingTable;
use crate::invariant::{Invariant, InvariantStructure};
use crate::step::Step;
use crate::subspaces::SubspaceDimensions;

/// Capability set a symmetry policy supplies to the engine. One
/// implementation per symmetry group; no shared mutable state, so policies
/// can be consulted from worker threads.
pub trait Symmetry: Send + Sync {
    /// Quantum-number field registry owned by this policy.
    fn structure(&self) -> &InvariantStructure;

    /// Number of combination channels: the ways one attached site extends an
    /// existing subspace.
    fn combination_channels(&self) -> usize;

    /// Previous-shell subspace feeding each combination channel of `target`,
    /// in channel order.
    fn ancestors(&self, target: &Invariant) -> Vec<Invariant>;

    /// Candidate subspaces reachable from `inv` by attaching one site.
    fn new_subspaces(&self, inv: &Invariant) -> Vec<Invariant>;

    /// Whether a quantum-number combination is physically realizable at all.
    fn allowed(&self, _inv: &Invariant) -> bool {
        true
    }

    /// Coupling rule for one (target, ancestor, channel) triple. A target
    /// that passes `allowed` can still be decoupled from a particular
    /// ancestor, so builders consult this for every channel.
    fn triangle_inequality(&self, _target: &Invariant, _ancestor: &Invariant, _channel: usize) -> bool {
        true
    }

    /// Add the off-diagonal (and any channel-local diagonal) terms for one
    /// subspace Hamiltonian. The matrix arrives with the rescaled ancestor
    /// energies already on the diagonal; the result must stay symmetric.
    fn fill_offdiagonal(
        &self,
        h: &mut DMatrix<f64>,
        step: &Step,
        layout: &SubspaceDimensions,
        target: &Invariant,
        coupling: &CouplingTable,
    ) -> Result<()>;

    /// Degeneracy weight of a subspace, used by reporting.
    fn multiplicity(&self, _inv: &Invariant) -> usize {
        1
    }
}

// Whether the Clebsch-Gordan coefficient for three spin multiplicities can be
// nonzero. Arguments are 2S+1 values.
pub fn su2_triangle_inequality(ss1: i32, ss2: i32, ss3: i32) -> bool {
    (ss1 - ss2).abs() <= ss3 - 1 && (ss2 - ss3).abs() <= ss1 - 1 && (ss3 - ss1).abs() <= ss2 - 1
}

// The equality for U(1) symmetry.
pub fn u1_equality(q1: i32, q2: i32, q3: i32) -> bool {
    q1 == q2 + q3
}

pub fn z2_equality(p1: i32, p2: i32, p3: i32) -> bool {
    p1 == p2 * p3
}

// C_3 quantum number: equality modulo 3.
pub fn c3_equality(p1: i32, p2: i32, p3: i32) -> bool {
    p1 == (p2 + p3).rem_euclid(3)
}
