use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::eigen::DiagInfo;
use crate::error::{CascadeError, Result};
use crate::invariant::Invariant;
use crate::step::Step;
use crate::subspaces::SubspaceDimensions;
use crate::symmetry::Symmetry;

/// Chain coefficients in shell units: hopping `xi` and on-site energy `zeta`
/// per physical channel, indexed by the 1-based shell that attaches the site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouplingTable {
    xi: Vec<Vec<f64>>,
    zeta: Vec<Vec<f64>>,
}

impl CouplingTable {
    pub fn from_parts(xi: Vec<Vec<f64>>, zeta: Vec<Vec<f64>>) -> Result<Self> {
        if xi.len() != zeta.len() {
            return Err(CascadeError::Config(format!(
                "coupling table has {} xi channels but {} zeta channels",
                xi.len(),
                zeta.len()
            )));
        }
        for (ch, (x, z)) in xi.iter().zip(&zeta).enumerate() {
            if x.len() != z.len() {
                return Err(CascadeError::Config(format!(
                    "coupling channel {}: {} xi entries vs {} zeta entries",
                    ch,
                    x.len(),
                    z.len()
                )));
            }
        }
        Ok(Self { xi, zeta })
    }

    /// Hopping coefficients of the flat-band chain in shell units,
    /// xi_n = (1+1/Lambda)/2 * (1-Lambda^-(n+1))
    ///        / sqrt((1-Lambda^-(2n+1)) (1-Lambda^-(2n+3))),
    /// approaching (1+1/Lambda)/2 from below. On-site energies vanish for
    /// the particle-hole symmetric band.
    pub fn flat_band(lambda: f64, channels: usize, shells: usize) -> Self {
        let prefactor = 0.5 * (1.0 + 1.0 / lambda);
        let row: Vec<f64> = (0..shells)
            .map(|n| {
                let nf = n as f64;
                let num = 1.0 - lambda.powf(-nf - 1.0);
                let den = ((1.0 - lambda.powf(-2.0 * nf - 1.0))
                    * (1.0 - lambda.powf(-2.0 * nf - 3.0)))
                .sqrt();
                prefactor * num / den
            })
            .collect();
        Self {
            xi: vec![row; channels],
            zeta: vec![vec![0.0; shells]; channels],
        }
    }

    pub fn channels(&self) -> usize {
        self.xi.len()
    }

    pub fn shells_available(&self) -> usize {
        self.xi.iter().map(|row| row.len()).min().unwrap_or(0)
    }

    pub fn ensure_shells(&self, shells: usize) -> Result<()> {
        if self.shells_available() < shells {
            return Err(CascadeError::Config(format!(
                "coupling table covers {} shells, run needs {}",
                self.shells_available(),
                shells
            )));
        }
        Ok(())
    }

    /// Hopping for the site attached at shell `ndx` (1-based).
    pub fn xi(&self, ch: usize, ndx: usize) -> f64 {
        self.xi[ch][ndx - 1]
    }

    /// On-site energy of the site attached at shell `ndx` (1-based).
    pub fn zeta(&self, ch: usize, ndx: usize) -> f64 {
        self.zeta[ch][ndx - 1]
    }
}

/// Assemble the dense Hamiltonian of one subspace: for every channel block
/// the rescaled retained spectrum of its ancestor goes on the diagonal, then
/// the policy adds its coupling terms.
pub fn assemble(
    step: &Step,
    target: &Invariant,
    layout: &SubspaceDimensions,
    prev: &DiagInfo,
    sym: &dyn Symmetry,
    coupling: &CouplingTable,
    dump: bool,
) -> Result<DMatrix<f64>> {
    let total = layout.total();
    let mut h = DMatrix::zeros(total, total);
    for ch in 0..layout.channel_count() {
        let dim = layout.dim(ch);
        if dim == 0 {
            continue;
        }
        let anc = layout.ancestor(ch);
        let block = prev.get(anc).ok_or_else(|| {
            CascadeError::Structure(format!(
                "subspace {} expects ancestor {} which the previous shell does not carry",
                target, anc
            ))
        })?;
        if block.kept() != dim {
            return Err(CascadeError::Structure(format!(
                "ancestor {} retains {} states but the layout of {} booked {}",
                anc,
                block.kept(),
                target,
                dim
            )));
        }
        for (n, r) in layout.range(ch).enumerate() {
            h[(r, r)] = step.scale_factor() * block.value(n);
        }
    }
    sym.fill_offdiagonal(&mut h, step, layout, target, coupling)?;
    if dump {
        dump_matrix(target, &h);
    }
    Ok(h)
}

/// Largest |h[i,j] - h[j,i]| of a square matrix.
pub fn max_asymmetry(h: &DMatrix<f64>) -> f64 {
    let mut max = 0.0_f64;
    for i in 0..h.nrows() {
        for j in (i + 1)..h.ncols() {
            max = max.max((h[(i, j)] - h[(j, i)]).abs());
        }
    }
    max
}

fn dump_matrix(target: &Invariant, h: &DMatrix<f64>) {
    debug!(subspace = %target, dim = h.nrows(), "assembled hamiltonian");
    for i in 0..h.nrows() {
        let row: Vec<String> = (0..h.ncols()).map(|j| format!("{:12.6}", h[(i, j)])).collect();
        debug!("  {}", row.join(" "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariant::{InvariantStructure, QnField, QnKind};
    use crate::step::RunPass;
    use crate::subspaces::SubspaceStructure;

    /// Two-channel test policy over a single additive label; the fill adds a
    /// constant hopping between the two channel blocks.
    struct Ladder {
        structure: InvariantStructure,
    }

    impl Ladder {
        fn new() -> Self {
            Self {
                structure: InvariantStructure::new(vec![QnField::new("N", QnKind::Additive)])
                    .expect("structure should validate"),
            }
        }
    }

    impl Symmetry for Ladder {
        fn structure(&self) -> &InvariantStructure {
            &self.structure
        }

        fn combination_channels(&self) -> usize {
            2
        }

        fn ancestors(&self, target: &Invariant) -> Vec<Invariant> {
            vec![
                Invariant::from_slice(&[target.get(0)]),
                Invariant::from_slice(&[target.get(0) - 1]),
            ]
        }

        fn new_subspaces(&self, inv: &Invariant) -> Vec<Invariant> {
            vec![
                Invariant::from_slice(&[inv.get(0)]),
                Invariant::from_slice(&[inv.get(0) + 1]),
            ]
        }

        fn fill_offdiagonal(
            &self,
            h: &mut DMatrix<f64>,
            step: &Step,
            layout: &SubspaceDimensions,
            _target: &Invariant,
            coupling: &CouplingTable,
        ) -> Result<()> {
            let xi = coupling.xi(0, step.ndx());
            let (r0, r1) = (layout.range(0), layout.range(1));
            for (a, i) in r0.enumerate() {
                for (b, j) in r1.clone().enumerate() {
                    if a == b {
                        h[(i, j)] += xi;
                        h[(j, i)] += xi;
                    }
                }
            }
            Ok(())
        }
    }

    fn coupling() -> CouplingTable {
        CouplingTable::from_parts(vec![vec![0.4, 0.6]], vec![vec![0.0, 0.0]])
            .expect("table should build")
    }

    #[test]
    fn from_parts_rejects_mismatched_channels() {
        assert!(CouplingTable::from_parts(vec![vec![1.0]], vec![]).is_err());
        assert!(CouplingTable::from_parts(vec![vec![1.0]], vec![vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn flat_band_coefficients_match_closed_form() {
        let table = CouplingTable::flat_band(2.0, 1, 40);
        let limit = 0.75;
        let first = table.xi(0, 1);
        assert!(first > 0.0 && first < limit);
        for n in 2..=40 {
            assert!(
                table.xi(0, n) > table.xi(0, n - 1),
                "flat-band hoppings grow toward the limit"
            );
        }
        assert!((table.xi(0, 40) - limit).abs() < 1e-3);
        assert_eq!(table.zeta(0, 7), 0.0);
        table.ensure_shells(40).expect("table covers 40 shells");
        assert!(table.ensure_shells(41).is_err());
    }

    #[test]
    fn assemble_places_diagonal_and_offdiagonal_terms() {
        let sym = Ladder::new();
        let prev = DiagInfo::initial(vec![
            (Invariant::from_slice(&[0]), vec![0.0, 1.0]),
            (Invariant::from_slice(&[1]), vec![0.5]),
        ]);
        let step = Step::new(1, 4, 4.0, RunPass::Energy);
        let target = Invariant::from_slice(&[1]);
        let structure = SubspaceStructure::build(&prev, &sym).expect("structure should build");
        let layout = structure.get(&target).expect("target exists");
        let h = assemble(&step, &target, layout, &prev, &sym, &coupling(), false)
            .expect("assembly should succeed");

        // channel 0 <- N=1 (1 state), channel 1 <- N=0 (2 states), sqrt(4)=2
        assert_eq!(h.nrows(), 3);
        assert_eq!(h[(0, 0)], 2.0 * 0.5);
        assert_eq!(h[(1, 1)], 0.0);
        assert_eq!(h[(2, 2)], 2.0 * 1.0);
        assert_eq!(h[(0, 1)], 0.4);
        assert_eq!(h[(1, 0)], 0.4);
        assert_eq!(h[(0, 2)], 0.0);
        assert_eq!(max_asymmetry(&h), 0.0);
    }

    #[test]
    fn assemble_rejects_stale_ancestor_layout() {
        let sym = Ladder::new();
        let mut prev = DiagInfo::initial(vec![
            (Invariant::from_slice(&[0]), vec![0.0, 1.0]),
            (Invariant::from_slice(&[1]), vec![0.5]),
        ]);
        let structure = SubspaceStructure::build(&prev, &sym).expect("structure should build");
        let target = Invariant::from_slice(&[1]);
        let layout = structure.get(&target).expect("target exists").clone();

        // shrink an ancestor after the layout was booked
        for (inv, block) in prev.iter_mut() {
            if inv == &Invariant::from_slice(&[0]) {
                block.truncate_keep(1).expect("keep one");
            }
        }
        let step = Step::new(1, 4, 4.0, RunPass::Energy);
        let result = assemble(&step, &target, &layout, &prev, &sym, &coupling(), false);
        assert!(result.is_err(), "layout/ancestor mismatch must be fatal");
    }

    #[test]
    fn max_asymmetry_detects_symmetry_breakage() {
        let mut h = DMatrix::zeros(2, 2);
        h[(0, 1)] = 1.0;
        h[(1, 0)] = 1.0 - 1e-9;
        assert!((max_asymmetry(&h) - 1e-9).abs() < 1e-15);
    }
}
