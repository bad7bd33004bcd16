pub mod diag;
pub mod driver;
pub mod eigen;
pub mod error;
pub mod hamiltonian;
pub mod invariant;
pub mod params;
pub mod step;
pub mod store;
pub mod subspaces;
pub mod symmetry;
/// The `cascade_core` crate provides the shell-by-shell diagonalization engine
/// for iterative renormalization-group calculations on discretized conduction
/// chains.
///
/// Key components:
/// - **Invariants**: symmetry labels and their combination rules (`invariant`, `symmetry`).
/// - **Structure**: per-shell subspace layouts and task enumeration (`subspaces`).
/// - **Assembly**: block Hamiltonians from ancestor spectra and chain coefficients (`hamiltonian`).
/// - **Backends**: sequential, shared-memory and message-passing diagonalization (`diag`).
/// - **Truncation**: the global energy cut with its degeneracy safeguard (`truncation`).
/// - **Driver**: the iteration loop with retry, persistence and replay (`driver`).
pub mod truncation;
