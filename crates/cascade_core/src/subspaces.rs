use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::eigen::DiagInfo;
use crate::error::{CascadeError, Result};
use crate::invariant::Invariant;
use crate::symmetry::Symmetry;

/// How one upcoming subspace decomposes into per-channel blocks contributed
/// by previous-shell ancestors. One entry per combination channel; an entry
/// is zero when the coupling rule forbids that channel's contribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubspaceDimensions {
    dims: Vec<usize>,
    ancestors: Vec<Invariant>,
}

impl SubspaceDimensions {
    pub fn new(target: &Invariant, sym: &dyn Symmetry, prev: &DiagInfo) -> Result<Self> {
        Self::build(target, sym, prev, false)
    }

    /// Rule-free variant for test harnesses. Production construction always
    /// applies the coupling rule.
    #[cfg(test)]
    pub(crate) fn ignoring_rule(
        target: &Invariant,
        sym: &dyn Symmetry,
        prev: &DiagInfo,
    ) -> Result<Self> {
        Self::build(target, sym, prev, true)
    }

    fn build(
        target: &Invariant,
        sym: &dyn Symmetry,
        prev: &DiagInfo,
        ignore_rule: bool,
    ) -> Result<Self> {
        let ancestors = sym.ancestors(target);
        if ancestors.len() != sym.combination_channels() {
            return Err(CascadeError::Structure(format!(
                "policy returned {} ancestors for {} but declares {} combination channels",
                ancestors.len(),
                target,
                sym.combination_channels()
            )));
        }
        // The rule check is required even though the target already passed
        // `allowed`: a candidate generated from the combinations can exist
        // yet be decoupled from one specific ancestor/channel.
        let dims = ancestors
            .iter()
            .enumerate()
            .map(|(ch, anc)| {
                let coupled = sym.triangle_inequality(target, anc, ch);
                if coupled || ignore_rule {
                    prev.kept_size(anc)
                } else {
                    0
                }
            })
            .collect();
        Ok(Self { dims, ancestors })
    }

    pub fn channel_count(&self) -> usize {
        self.dims.len()
    }

    pub fn total(&self) -> usize {
        self.dims.iter().sum()
    }

    pub fn dim(&self, ch: usize) -> usize {
        self.dims[ch]
    }

    /// Row offset of a channel's block in the assembled matrix.
    pub fn offset(&self, ch: usize) -> usize {
        self.dims[..ch].iter().sum()
    }

    /// Row range of a channel's block.
    pub fn range(&self, ch: usize) -> Range<usize> {
        let start = self.offset(ch);
        start..start + self.dims[ch]
    }

    pub fn ancestor(&self, ch: usize) -> &Invariant {
        &self.ancestors[ch]
    }

    pub fn ancestors(&self) -> &[Invariant] {
        &self.ancestors
    }
}

/// Subspace layout of the upcoming shell: every allowed candidate reachable
/// from the previous shell, zero-dimensional ones included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubspaceStructure {
    map: BTreeMap<Invariant, SubspaceDimensions>,
}

impl SubspaceStructure {
    pub fn build(prev: &DiagInfo, sym: &dyn Symmetry) -> Result<Self> {
        let mut candidates = BTreeSet::new();
        for inv in prev.subspaces() {
            for cand in sym.new_subspaces(inv) {
                if sym.allowed(&cand) {
                    sym.structure().validate(&cand)?;
                    candidates.insert(cand);
                }
            }
        }
        let mut map = BTreeMap::new();
        for cand in candidates {
            let dims = SubspaceDimensions::new(&cand, sym, prev)?;
            map.insert(cand, dims);
        }
        Ok(Self { map })
    }

    /// Placeholder exposed on the zero-bandwidth path, where no structure is
    /// ever built.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, inv: &Invariant) -> Option<&SubspaceDimensions> {
        self.map.get(inv)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Invariant, &SubspaceDimensions)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn total_dim(&self) -> usize {
        self.map.values().map(|d| d.total()).sum()
    }
}

/// The shell's work list: unique invariants with nonzero total dimension,
/// biggest subspaces first so parallel backends start on the expensive tasks;
/// ties break by invariant order to keep the list deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskList {
    tasks: Vec<Invariant>,
}

impl TaskList {
    pub fn from_structure(structure: &SubspaceStructure) -> Self {
        let mut tasks: Vec<Invariant> = structure
            .iter()
            .filter(|(_, dims)| dims.total() > 0)
            .map(|(inv, _)| inv.clone())
            .collect();
        tasks.sort_by(|a, b| {
            let da = structure.get(a).map_or(0, |d| d.total());
            let db = structure.get(b).map_or(0, |d| d.total());
            db.cmp(&da).then_with(|| a.cmp(b))
        });
        Self { tasks }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Invariant> {
        self.tasks.iter()
    }

    pub fn as_slice(&self) -> &[Invariant] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
