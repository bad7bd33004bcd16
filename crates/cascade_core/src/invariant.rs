use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, Result};

/// How a quantum number composes when two subspaces are coupled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QnKind {
    /// Composes by addition (charge, spin projection).
    Additive,
    /// Values are +1/-1 and compose by product (parity).
    Multiplicative,
    /// Values in [0, n) composing by addition mod n.
    Modular(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QnField {
    pub name: String,
    pub kind: QnKind,
}

impl QnField {
    pub fn new(name: impl Into<String>, kind: QnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Ordered registry of the quantum-number fields a symmetry policy tracks.
/// Owned by the policy and passed explicitly into every group operation;
/// there is no process-wide notion of "the active symmetry".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantStructure {
    fields: Vec<QnField>,
}

impl InvariantStructure {
    pub fn new(fields: Vec<QnField>) -> Result<Self> {
        for field in &fields {
            if let QnKind::Modular(n) = field.kind {
                if n < 2 {
                    return Err(CascadeError::Config(format!(
                        "modular quantum number '{}' needs modulus >= 2, got {}",
                        field.name, n
                    )));
                }
            }
        }
        Ok(Self { fields })
    }

    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[QnField] {
        &self.fields
    }

    /// Check that an invariant's values are representable under this
    /// structure. Violations indicate a policy bug.
    pub fn validate(&self, inv: &Invariant) -> Result<()> {
        if inv.len() != self.arity() {
            return Err(CascadeError::Structure(format!(
                "invariant {} has {} fields, structure expects {}",
                inv,
                inv.len(),
                self.arity()
            )));
        }
        for (field, &value) in self.fields.iter().zip(inv.values()) {
            match field.kind {
                QnKind::Additive => {}
                QnKind::Multiplicative => {
                    if value != 1 && value != -1 {
                        return Err(CascadeError::Structure(format!(
                            "multiplicative field '{}' must be +1 or -1, got {} in {}",
                            field.name, value, inv
                        )));
                    }
                }
                QnKind::Modular(n) => {
                    if value < 0 || value >= n as i32 {
                        return Err(CascadeError::Structure(format!(
                            "modular field '{}' must lie in [0, {}), got {} in {}",
                            field.name, n, value, inv
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Group operation applied field by field.
    pub fn combine(&self, a: &Invariant, b: &Invariant) -> Invariant {
        debug_assert_eq!(a.len(), self.arity());
        debug_assert_eq!(b.len(), self.arity());
        let values = self
            .fields
            .iter()
            .zip(a.values().iter().zip(b.values()))
            .map(|(field, (&x, &y))| match field.kind {
                QnKind::Additive => x + y,
                QnKind::Multiplicative => x * y,
                QnKind::Modular(n) => (x + y).rem_euclid(n as i32),
            })
            .collect();
        Invariant::new(values)
    }

    /// Field-wise group inverse. Multiplicative fields are involutions.
    pub fn inverse(&self, a: &Invariant) -> Invariant {
        debug_assert_eq!(a.len(), self.arity());
        let values = self
            .fields
            .iter()
            .zip(a.values())
            .map(|(field, &x)| match field.kind {
                QnKind::Additive => -x,
                QnKind::Multiplicative => x,
                QnKind::Modular(n) => (-x).rem_euclid(n as i32),
            })
            .collect();
        Invariant::new(values)
    }
}

/// Immutable quantum-number tuple labeling one symmetry subspace. Totally
/// ordered (lexicographic) so it can key ordered maps; never mutated after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Invariant {
    values: Vec<i32>,
}

impl Invariant {
    pub fn new(values: Vec<i32>) -> Self {
        Self { values }
    }

    pub fn from_slice(values: &[i32]) -> Self {
        Self {
            values: values.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> i32 {
        self.values[idx]
    }

    pub fn values(&self) -> &[i32] {
        &self.values
    }
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}
