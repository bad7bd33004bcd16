use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::diag::{solve_task, ShellContext};
use crate::eigen::{DiagInfo, EigenBlock};
use crate::error::{CascadeError, Result};
use crate::invariant::Invariant;
use crate::subspaces::TaskList;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

enum WorkerRequest {
    Solve(Invariant),
    Shutdown,
}

enum WorkerReply {
    Solved {
        worker: usize,
        target: Invariant,
        block: EigenBlock,
    },
    Failed {
        worker: usize,
        error: CascadeError,
    },
}

/// Coordinator loop: primes every worker with one task, then hands out the
/// next task to whichever worker reports back first. Results are merged in
/// completion order; the shell is deterministic because blocks are keyed by
/// invariant, not by arrival.
pub(super) fn run_distributed(
    ctx: &ShellContext<'_>,
    tasks: &TaskList,
    workers: usize,
) -> Result<DiagInfo> {
    if tasks.is_empty() {
        return Ok(DiagInfo::new());
    }
    let workers = workers.clamp(1, tasks.len());
    let (reply_tx, reply_rx) = mpsc::channel::<WorkerReply>();

    thread::scope(|scope| {
        let mut request_tx = Vec::with_capacity(workers);
        for id in 0..workers {
            let (tx, rx) = mpsc::channel::<WorkerRequest>();
            let replies = reply_tx.clone();
            thread::Builder::new()
                .name(format!("cascade-worker-{id}"))
                .spawn_scoped(scope, move || worker_loop(id, ctx, rx, replies))?;
            request_tx.push(tx);
        }
        drop(reply_tx);

        let mut queue = tasks.iter();
        let mut outstanding = 0usize;
        for tx in &request_tx {
            match queue.next() {
                Some(target) => {
                    let _ = tx.send(WorkerRequest::Solve(target.clone()));
                    outstanding += 1;
                }
                None => {
                    let _ = tx.send(WorkerRequest::Shutdown);
                }
            }
        }

        let mut diag = DiagInfo::new();
        let mut failure: Option<CascadeError> = None;
        while outstanding > 0 {
            let reply = match reply_rx.recv() {
                Ok(reply) => reply,
                // All workers are gone; the join below surfaces any panic.
                Err(_) => break,
            };
            outstanding -= 1;
            match reply {
                WorkerReply::Solved {
                    worker,
                    target,
                    block,
                } => {
                    diag.insert(target, block);
                    let next = if failure.is_none() { queue.next() } else { None };
                    match next {
                        Some(target) => {
                            let _ = request_tx[worker].send(WorkerRequest::Solve(target.clone()));
                            outstanding += 1;
                        }
                        None => {
                            let _ = request_tx[worker].send(WorkerRequest::Shutdown);
                        }
                    }
                }
                WorkerReply::Failed { worker, error } => {
                    warn!(worker, %error, "worker reported a failed block");
                    let _ = request_tx[worker].send(WorkerRequest::Shutdown);
                    if failure.is_none() {
                        failure = Some(error);
                    }
                }
            }
        }
        drop(request_tx);

        match failure {
            Some(error) => Err(error),
            None => Ok(diag),
        }
    })
}

fn worker_loop(
    id: usize,
    ctx: &ShellContext<'_>,
    requests: Receiver<WorkerRequest>,
    replies: Sender<WorkerReply>,
) {
    loop {
        match requests.recv_timeout(POLL_INTERVAL) {
            Ok(WorkerRequest::Solve(target)) => {
                let reply = match solve_task(ctx, &target) {
                    Ok((target, block)) => WorkerReply::Solved {
                        worker: id,
                        target,
                        block,
                    },
                    Err(error) => WorkerReply::Failed { worker: id, error },
                };
                if replies.send(reply).is_err() {
                    break;
                }
            }
            Ok(WorkerRequest::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => continue,
        }
    }
    debug!(worker = id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::DiagBackend;
    use crate::hamiltonian::CouplingTable;
    use crate::step::{RunPass, Step};
    use crate::subspaces::SubspaceStructure;
    use crate::symmetry::QSz;

    #[test]
    fn more_workers_than_tasks_is_fine() {
        let sym = QSz::new().expect("policy should build");
        let prev = DiagInfo::initial(vec![(Invariant::from_slice(&[0, 1]), vec![0.0])]);
        let structure = SubspaceStructure::build(&prev, &sym).expect("structure should build");
        let tasks = TaskList::from_structure(&structure);
        assert_eq!(tasks.len(), 4, "one task per site state");

        let step = Step::new(1, 2, 2.0, RunPass::Energy);
        let coupling = CouplingTable::flat_band(2.0, 1, 2);
        let ctx = ShellContext {
            step: &step,
            structure: &structure,
            prev: &prev,
            sym: &sym,
            coupling: &coupling,
            ratio: 1.0,
            dump_matrices: false,
            strict_checks: true,
        };
        let diag = DiagBackend::Distributed { workers: 16 }
            .diagonalize(&ctx, &tasks)
            .expect("idle workers must shut down cleanly");
        assert_eq!(diag.len(), 4);
        assert_eq!(diag.total_computed(), 4);
    }

    #[test]
    fn empty_task_list_returns_empty_shell() {
        let sym = QSz::new().expect("policy should build");
        let prev = DiagInfo::new();
        let structure = SubspaceStructure::build(&prev, &sym).expect("structure should build");
        let tasks = TaskList::from_structure(&structure);
        assert!(tasks.is_empty());

        let step = Step::new(1, 2, 2.0, RunPass::Energy);
        let coupling = CouplingTable::flat_band(2.0, 1, 2);
        let ctx = ShellContext {
            step: &step,
            structure: &structure,
            prev: &prev,
            sym: &sym,
            coupling: &coupling,
            ratio: 1.0,
            dump_matrices: false,
            strict_checks: true,
        };
        let diag = DiagBackend::Distributed { workers: 2 }
            .diagonalize(&ctx, &tasks)
            .expect("empty shell is not an error");
        assert!(diag.is_empty());
    }
}
