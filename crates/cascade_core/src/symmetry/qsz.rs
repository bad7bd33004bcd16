use nalgebra::DMatrix;

use crate::error::Result;
use crate::hamiltonian::CouplingTable;
use crate::invariant::{Invariant, InvariantStructure, QnField, QnKind};
use crate::step::Step;
use crate::subspaces::SubspaceDimensions;
use crate::symmetry::{u1_equality, Symmetry};

/// Per-channel quantum numbers (Q, SSZ) of the four attached-site states:
/// empty, spin-up, spin-down, doubly occupied. Charge is measured from half
/// filling, SSZ is twice the spin projection.
const SITE_QN: [(i32, i32); 4] = [(-1, 0), (0, 1), (0, -1), (1, 0)];

/// Electron count of each attached-site state.
const SITE_OCC: [f64; 4] = [0.0, 1.0, 1.0, 2.0];

/// Hopping connections between combination channels: (from, to, fermionic
/// sign). Spin-up hops link empty<->up and down<->double, spin-down hops link
/// empty<->down and up<->double; the last one picks up a minus sign from the
/// up/down ordering of the doubly occupied state.
const HOPS: [(usize, usize, f64); 4] = [(0, 1, 1.0), (2, 3, 1.0), (0, 2, 1.0), (1, 3, -1.0)];

/// U(1) charge x U(1) spin-projection policy for a single spinful channel.
/// The in-repo reference symmetry: fully abelian, four combination channels.
pub struct QSz {
    structure: InvariantStructure,
}

impl QSz {
    pub fn new() -> Result<Self> {
        let structure = InvariantStructure::new(vec![
            QnField::new("Q", QnKind::Additive),
            QnField::new("SSZ", QnKind::Additive),
        ])?;
        Ok(Self { structure })
    }

    fn site(ch: usize) -> Invariant {
        let (q, ssz) = SITE_QN[ch];
        Invariant::new(vec![q, ssz])
    }
}

impl Symmetry for QSz {
    fn structure(&self) -> &InvariantStructure {
        &self.structure
    }

    fn combination_channels(&self) -> usize {
        SITE_QN.len()
    }

    fn ancestors(&self, target: &Invariant) -> Vec<Invariant> {
        (0..self.combination_channels())
            .map(|ch| {
                self.structure
                    .combine(target, &self.structure.inverse(&Self::site(ch)))
            })
            .collect()
    }

    fn new_subspaces(&self, inv: &Invariant) -> Vec<Invariant> {
        (0..self.combination_channels())
            .map(|ch| self.structure.combine(inv, &Self::site(ch)))
            .collect()
    }

    fn triangle_inequality(&self, target: &Invariant, ancestor: &Invariant, channel: usize) -> bool {
        let (q, ssz) = SITE_QN[channel];
        u1_equality(target.get(0), ancestor.get(0), q)
            && u1_equality(target.get(1), ancestor.get(1), ssz)
    }

    /// Hopping elements connect like-indexed retained states of the two
    /// ancestors (attached-site matrix element times unit overlap); the
    /// finite-chain corrections to these elements live in the downstream
    /// operator-recalculation layer, not in the engine.
    fn fill_offdiagonal(
        &self,
        h: &mut DMatrix<f64>,
        step: &Step,
        layout: &SubspaceDimensions,
        _target: &Invariant,
        coupling: &CouplingTable,
    ) -> Result<()> {
        let xi = coupling.xi(0, step.ndx());
        let zeta = coupling.zeta(0, step.ndx());

        for &(ci, cj, sign) in &HOPS {
            let ri = layout.range(ci);
            let rj = layout.range(cj);
            let overlap = ri.len().min(rj.len());
            for r in 0..overlap {
                let (i, j) = (ri.start + r, rj.start + r);
                h[(i, j)] += sign * xi;
                h[(j, i)] += sign * xi;
            }
        }

        if zeta != 0.0 {
            for (ch, &occ) in SITE_OCC.iter().enumerate() {
                if occ == 0.0 {
                    continue;
                }
                for r in layout.range(ch) {
                    h[(r, r)] += occ * zeta;
                }
            }
        }
        Ok(())
    }
}
