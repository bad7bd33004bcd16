use tracing::{debug, info, warn};

use crate::diag::{DiagBackend, ShellContext};
use crate::eigen::DiagInfo;
use crate::error::{CascadeError, Result};
use crate::hamiltonian::CouplingTable;
use crate::params::Params;
use crate::step::{RunPass, Step};
use crate::store::Store;
use crate::subspaces::{SubspaceStructure, TaskList};
use crate::symmetry::Symmetry;
use crate::truncation::truncate;

/// Receives each shell right after truncation, before the eigenvectors are
/// dropped. Shells arrive in iteration order; a shell that failed is never
/// delivered.
pub trait ShellConsumer {
    fn on_shell(
        &mut self,
        step: &Step,
        diag: &DiagInfo,
        structure: &SubspaceStructure,
    ) -> anyhow::Result<()>;
}

/// Accumulated outcome of a run. One `ground_energies` entry per processed
/// shell, in pass order; replayed shells contribute zero because their stored
/// spectra are already shifted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub ground_energies: Vec<f64>,
    /// Sum of ground-state shifts converted to band units.
    pub total_energy: f64,
    pub shells_done: usize,
    pub retries: usize,
}

/// The iteration driver: owns the symmetry policy, the chain coefficients and
/// the backend, and walks the chain shell by shell.
pub struct Cascade {
    sym: Box<dyn Symmetry>,
    params: Params,
    coupling: CouplingTable,
    backend: DiagBackend,
    store: Option<Store>,
    consumers: Vec<Box<dyn ShellConsumer>>,
}

impl Cascade {
    pub fn new(sym: Box<dyn Symmetry>, params: Params, coupling: CouplingTable) -> Result<Self> {
        params.validate()?;
        if params.shells > 0 {
            coupling.ensure_shells(params.shells)?;
        }
        let backend = DiagBackend::from_kind(&params.backend);
        Ok(Self {
            sym,
            params,
            coupling,
            backend,
            store: None,
            consumers: Vec::new(),
        })
    }

    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub fn add_consumer(&mut self, consumer: Box<dyn ShellConsumer>) {
        self.consumers.push(consumer);
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Walk the chain starting from the initial basis. With `dm_pass` set, a
    /// second sweep replays every stored shell for density-matrix consumers.
    pub fn run(&mut self, initial: DiagInfo) -> Result<RunStats> {
        if initial.is_empty() {
            return Err(CascadeError::Config(
                "initial shell carries no subspaces".into(),
            ));
        }
        if (self.params.dm_pass || self.params.resume) && self.store.is_none() {
            return Err(CascadeError::Config(
                "replaying shells requires a store".into(),
            ));
        }
        if self.params.dm_pass && self.params.shells == 0 {
            return Err(CascadeError::Config(
                "density-matrix pass requires at least one shell".into(),
            ));
        }

        let mut stats = RunStats::default();
        if self.params.shells == 0 {
            self.run_zero_bandwidth(initial, &mut stats)?;
            return Ok(stats);
        }

        if self.params.dm_pass {
            self.run_pass(RunPass::Energy, initial.clone(), &mut stats)?;
            self.run_pass(RunPass::DensityMatrix, initial, &mut stats)?;
        } else {
            self.run_pass(RunPass::Energy, initial, &mut stats)?;
        }
        Ok(stats)
    }

    /// Single-shot path: no chain sites are attached, the initial basis is
    /// shifted and truncated as-is.
    fn run_zero_bandwidth(&mut self, mut diag: DiagInfo, stats: &mut RunStats) -> Result<()> {
        let step = Step::zero_bandwidth(self.params.lambda, RunPass::Energy);
        let egs = diag.subtract_ground_state();
        truncate(&step, &mut diag, self.sym.as_ref(), &self.params)?;
        stats.ground_energies.push(egs);
        stats.total_energy += egs * step.scale();
        stats.shells_done += 1;
        info!(egs, "zero-bandwidth run complete");

        let structure = SubspaceStructure::empty();
        for consumer in &mut self.consumers {
            consumer.on_shell(&step, &diag, &structure)?;
        }
        Ok(())
    }

    fn run_pass(&mut self, pass: RunPass, initial: DiagInfo, stats: &mut RunStats) -> Result<()> {
        let shells = self.params.shells;
        let loaded_through = match pass {
            RunPass::DensityMatrix => Some(shells),
            RunPass::Energy if self.params.resume => match (&self.store, self.params.last_stored) {
                (_, Some(n)) => Some(n.min(shells)),
                (Some(store), None) => store.last_shell(shells),
                (None, None) => None,
            },
            RunPass::Energy => None,
        };
        if let Some(n) = loaded_through {
            info!(?pass, through = n, "replaying stored shells");
        }

        let mut prev = initial;
        let mut step = Step::new(1, shells, self.params.lambda, pass);
        for ndx in 1..=shells {
            let structure = SubspaceStructure::build(&prev, self.sym.as_ref())?;
            let tasks = TaskList::from_structure(&structure);
            let load = loaded_through.map_or(false, |n| ndx <= n);
            debug!(
                shell = ndx,
                subspaces = structure.len(),
                dim = structure.total_dim(),
                tasks = tasks.len(),
                "shell structure built"
            );
            for ch in 0..self.coupling.channels() {
                debug!(
                    shell = ndx,
                    channel = ch,
                    xi = self.coupling.xi(ch, ndx),
                    xi_scaled = self.coupling.xi(ch, ndx) / step.scale(),
                    zeta = self.coupling.zeta(ch, ndx),
                    "chain coefficients"
                );
            }

            let mut ratio = self.params.diag_ratio;
            let (mut diag, egs) = loop {
                let mut diag = if load {
                    match &self.store {
                        Some(store) => store.load(ndx)?,
                        None => {
                            return Err(CascadeError::Config(
                                "stored shells requested without a store".into(),
                            ))
                        }
                    }
                } else {
                    let ctx = ShellContext {
                        step: &step,
                        structure: &structure,
                        prev: &prev,
                        sym: self.sym.as_ref(),
                        coupling: &self.coupling,
                        ratio,
                        dump_matrices: self.params.dump_matrices,
                        strict_checks: self.params.strict_checks,
                    };
                    self.backend.diagonalize(&ctx, &tasks)?
                };
                let egs = diag.subtract_ground_state();
                match truncate(&step, &mut diag, self.sym.as_ref(), &self.params) {
                    Ok(_) => break (diag, egs),
                    Err(err)
                        if err.is_retryable()
                            && !load
                            && pass == RunPass::Energy
                            && self.params.restart
                            && ratio < 1.0 =>
                    {
                        ratio = (ratio * self.params.restart_factor).min(1.0);
                        stats.retries += 1;
                        warn!(
                            shell = ndx,
                            ratio,
                            %err,
                            "not enough computed states, rediagonalizing the shell"
                        );
                    }
                    Err(err) => return Err(err),
                }
            };

            stats.ground_energies.push(egs);
            stats.total_energy += egs * step.scale();
            stats.shells_done += 1;
            info!(
                shell = ndx,
                ?pass,
                egs,
                kept = diag.total_kept(),
                subspaces = diag.len(),
                "shell complete"
            );

            if let Some(store) = &self.store {
                if !load {
                    store.save(ndx, &diag)?;
                }
            }
            for consumer in &mut self.consumers {
                consumer.on_shell(&step, &diag, &structure)?;
            }
            diag.clear_vectors();
            prev = diag;
            step.advance();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::invariant::Invariant;
    use crate::params::BackendKind;
    use crate::symmetry::QSz;

    fn impurity_shell() -> DiagInfo {
        DiagInfo::initial(vec![
            (Invariant::from_slice(&[-1, 0]), vec![0.0]),
            (Invariant::from_slice(&[0, 1]), vec![-0.3]),
            (Invariant::from_slice(&[0, -1]), vec![-0.3]),
            (Invariant::from_slice(&[1, 0]), vec![0.1]),
        ])
    }

    fn run_params(shells: usize) -> Params {
        Params {
            lambda: 2.5,
            shells,
            keep: 10,
            ..Params::default()
        }
    }

    fn cascade(params: Params) -> Cascade {
        let shells = params.shells.max(1);
        let coupling = CouplingTable::flat_band(params.lambda, 1, shells);
        let sym = QSz::new().expect("policy should build");
        Cascade::new(Box::new(sym), params, coupling).expect("driver should build")
    }

    type ShellTrace = Vec<(usize, RunPass, Vec<f64>, usize)>;

    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<ShellTrace>>,
    }

    impl Recorder {
        fn trace(&self) -> ShellTrace {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ShellConsumer for Recorder {
        fn on_shell(
            &mut self,
            step: &Step,
            diag: &DiagInfo,
            structure: &SubspaceStructure,
        ) -> anyhow::Result<()> {
            let mut kept: Vec<f64> = diag
                .iter()
                .flat_map(|(_, b)| b.values()[..b.kept()].iter().copied())
                .collect();
            kept.sort_unstable_by(f64::total_cmp);
            self.seen
                .lock()
                .unwrap()
                .push((step.ndx(), step.pass(), kept, structure.len()));
            Ok(())
        }
    }

    fn assert_traces_match(a: &ShellTrace, b: &ShellTrace, tol: f64) {
        assert_eq!(a.len(), b.len(), "same number of shells delivered");
        for ((ndx_a, _, kept_a, n_a), (ndx_b, _, kept_b, n_b)) in a.iter().zip(b.iter()) {
            assert_eq!(ndx_a, ndx_b);
            assert_eq!(n_a, n_b, "shell {} structure size differs", ndx_a);
            assert_eq!(kept_a.len(), kept_b.len(), "shell {} keeps differ", ndx_a);
            for (x, y) in kept_a.iter().zip(kept_b.iter()) {
                assert!((x - y).abs() <= tol, "shell {} spectra differ", ndx_a);
            }
        }
    }

    #[test]
    fn multi_shell_run_completes() {
        let mut driver = cascade(run_params(3));
        let rec = Recorder::default();
        driver.add_consumer(Box::new(rec.clone()));

        let stats = driver.run(impurity_shell()).expect("run should complete");
        assert_eq!(stats.shells_done, 3);
        assert_eq!(stats.ground_energies.len(), 3);
        assert_eq!(stats.retries, 0, "full diagonalization never retries");

        let trace = rec.trace();
        let shells: Vec<usize> = trace.iter().map(|t| t.0).collect();
        assert_eq!(shells, vec![1, 2, 3], "shells delivered in order");
        for (ndx, _, kept, subspaces) in &trace {
            assert!(!kept.is_empty());
            assert_eq!(kept[0], 0.0, "shell {} not shifted to its ground state", ndx);
            assert!(*subspaces > 0);
        }
    }

    #[test]
    fn untruncated_basis_quadruples_each_shell() {
        let mut params = run_params(2);
        params.keep = 100_000;
        let mut driver = cascade(params);
        let rec = Recorder::default();
        driver.add_consumer(Box::new(rec.clone()));

        driver.run(impurity_shell()).expect("run should complete");
        let trace = rec.trace();
        // each retained state combines with the four attached-site states
        assert_eq!(trace[0].2.len(), 16);
        assert_eq!(trace[1].2.len(), 64);
    }

    #[test]
    fn backends_agree_through_full_run() {
        let kinds = [
            BackendKind::Sequential,
            BackendKind::SharedMemory { threads: 2 },
            BackendKind::Distributed { workers: 2 },
        ];
        let traces: Vec<ShellTrace> = kinds
            .into_iter()
            .map(|backend| {
                let mut params = run_params(3);
                params.backend = backend;
                let mut driver = cascade(params);
                let rec = Recorder::default();
                driver.add_consumer(Box::new(rec.clone()));
                driver.run(impurity_shell()).expect("run should complete");
                rec.trace()
            })
            .collect();

        assert_traces_match(&traces[0], &traces[1], 1e-10);
        assert_traces_match(&traces[0], &traces[2], 1e-10);
    }

    #[test]
    fn partial_diagonalization_retries_until_complete() {
        let mut params = run_params(1);
        params.keep = 100;
        params.diag_ratio = 0.3;
        params.restart = true;
        params.restart_factor = 2.0;
        let mut driver = cascade(params);

        let stats = driver.run(impurity_shell()).expect("retry must recover");
        assert!(stats.retries >= 1, "undersized ratio must trigger a retry");
        assert_eq!(stats.shells_done, 1);
    }

    #[test]
    fn retry_ratio_growth_is_bounded() {
        let mut params = run_params(1);
        params.keep = 100;
        params.diag_ratio = 0.1;
        params.restart = true;
        params.restart_factor = 1.5;
        let mut driver = cascade(params);

        let stats = driver.run(impurity_shell()).expect("retry must recover");
        // 0.1 grows by 1.5 per attempt and caps at 1.0 on the sixth
        assert!(stats.retries >= 1);
        assert!(stats.retries <= 6, "ratio growth must terminate");
        assert_eq!(stats.shells_done, 1);
    }

    #[test]
    fn delivered_shells_satisfy_count_bookkeeping() {
        struct Checker;
        impl ShellConsumer for Checker {
            fn on_shell(
                &mut self,
                _step: &Step,
                diag: &DiagInfo,
                _structure: &SubspaceStructure,
            ) -> anyhow::Result<()> {
                for (inv, block) in diag.iter() {
                    anyhow::ensure!(
                        block.kept() + block.discarded() == block.computed(),
                        "count bookkeeping broken for {inv}"
                    );
                    anyhow::ensure!(block.computed() <= block.dim());
                }
                anyhow::ensure!(diag.total_kept() >= 1, "a shell must retain something");
                Ok(())
            }
        }

        let mut params = run_params(3);
        params.keep = 6;
        let mut driver = cascade(params);
        driver.add_consumer(Box::new(Checker));
        driver.run(impurity_shell()).expect("run should complete");
    }

    #[test]
    fn restart_disabled_propagates_failure() {
        let mut params = run_params(1);
        params.keep = 100;
        params.diag_ratio = 0.3;
        params.restart = false;
        let mut driver = cascade(params);
        let rec = Recorder::default();
        driver.add_consumer(Box::new(rec.clone()));

        let err = driver
            .run(impurity_shell())
            .expect_err("without restart the failure must surface");
        assert!(matches!(err, CascadeError::InsufficientStates { .. }));
        assert!(rec.trace().is_empty(), "failed shell must not be delivered");
    }

    #[test]
    fn resume_reuses_stored_shells() {
        let dir = tempfile::tempdir().expect("tempdir should create");

        let mut fresh = cascade(run_params(3))
            .with_store(Store::open(dir.path()).expect("store should open"));
        let rec_fresh = Recorder::default();
        fresh.add_consumer(Box::new(rec_fresh.clone()));
        fresh.run(impurity_shell()).expect("run should complete");

        let mut params = run_params(3);
        params.resume = true;
        let mut resumed =
            cascade(params).with_store(Store::open(dir.path()).expect("store should open"));
        let rec_resumed = Recorder::default();
        resumed.add_consumer(Box::new(rec_resumed.clone()));
        let stats = resumed.run(impurity_shell()).expect("resume should complete");

        assert_eq!(stats.shells_done, 3);
        assert_traces_match(&rec_fresh.trace(), &rec_resumed.trace(), 1e-12);

        // replay only part of the chain, recompute the rest
        let mut params = run_params(3);
        params.resume = true;
        params.last_stored = Some(2);
        let mut partial =
            cascade(params).with_store(Store::open(dir.path()).expect("store should open"));
        let rec_partial = Recorder::default();
        partial.add_consumer(Box::new(rec_partial.clone()));
        partial.run(impurity_shell()).expect("partial resume should complete");
        assert_traces_match(&rec_fresh.trace(), &rec_partial.trace(), 1e-10);
    }

    #[test]
    fn zero_bandwidth_run_solves_single_shell() {
        let mut params = run_params(0);
        params.keep = 2;
        let mut driver = cascade(params);
        let rec = Recorder::default();
        driver.add_consumer(Box::new(rec.clone()));

        let stats = driver.run(impurity_shell()).expect("run should complete");
        assert_eq!(stats.shells_done, 1);
        assert_eq!(stats.ground_energies, vec![-0.3]);

        let trace = rec.trace();
        assert_eq!(trace.len(), 1);
        let (ndx, _, kept, subspaces) = &trace[0];
        assert_eq!(*ndx, 0);
        assert_eq!(*subspaces, 0, "no combined structure without attached sites");
        assert_eq!(kept.as_slice(), &[0.0, 0.0], "degenerate doublet retained");
    }

    #[test]
    fn density_matrix_pass_replays_stored_spectra() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let mut params = run_params(2);
        params.dm_pass = true;
        let mut driver =
            cascade(params).with_store(Store::open(dir.path()).expect("store should open"));
        let rec = Recorder::default();
        driver.add_consumer(Box::new(rec.clone()));

        let stats = driver.run(impurity_shell()).expect("run should complete");
        assert_eq!(stats.shells_done, 4, "two shells, two passes");

        let trace = rec.trace();
        assert_eq!(trace.len(), 4);
        let (first, second) = trace.split_at(2);
        assert!(first.iter().all(|t| t.1 == RunPass::Energy));
        assert!(second.iter().all(|t| t.1 == RunPass::DensityMatrix));
        assert_traces_match(&first.to_vec(), &second.to_vec(), 1e-12);
    }

    #[test]
    fn density_matrix_pass_requires_store() {
        let mut params = run_params(2);
        params.dm_pass = true;
        let mut driver = cascade(params);
        let err = driver
            .run(impurity_shell())
            .expect_err("replay without a store must be rejected");
        assert!(matches!(err, CascadeError::Config(_)));
    }

    #[test]
    fn empty_initial_shell_rejected() {
        let mut driver = cascade(run_params(2));
        let err = driver
            .run(DiagInfo::new())
            .expect_err("empty start must be rejected");
        assert!(matches!(err, CascadeError::Config(_)));
    }

    #[test]
    fn consumer_error_aborts_run() {
        struct Failing;
        impl ShellConsumer for Failing {
            fn on_shell(
                &mut self,
                _step: &Step,
                _diag: &DiagInfo,
                _structure: &SubspaceStructure,
            ) -> anyhow::Result<()> {
                anyhow::bail!("downstream refused the shell")
            }
        }

        let mut driver = cascade(run_params(2));
        driver.add_consumer(Box::new(Failing));
        let err = driver
            .run(impurity_shell())
            .expect_err("consumer failure must abort the run");
        assert!(matches!(err, CascadeError::Consumer(_)));
    }
}
