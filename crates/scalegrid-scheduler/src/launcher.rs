//! Bounded scheduler launcher.
//!
//! `SchedulerLauncher` hands out at most `max_parallel` running schedulers
//! at a time. Each [`SchedulerHandle`] owns a semaphore permit for as long
//! as its loop runs; stopping or dropping the handle gives the slot back.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{Instrument, debug, debug_span, warn};

use scalegrid_state::{ClientFacade, StateError, View};

use crate::algorithm::{CycleState, SchedulingAlgorithm};
use crate::cancel::CancelToken;
use crate::error::{SchedulerError, SchedulerResult};

/// What to schedule against.
#[derive(Debug, Clone)]
pub struct LaunchParams {
    pub name: String,
    pub view: Arc<View>,
    /// Upper bound between two cycles when nothing changes in the view.
    pub resync_interval: Duration,
}

pub struct SchedulerLauncher {
    semaphore: Arc<Semaphore>,
    algorithm: Arc<dyn SchedulingAlgorithm>,
    max_parallel: usize,
    running: Arc<AtomicUsize>,
}

impl SchedulerLauncher {
    /// `max_parallel` is clamped to at least one.
    pub fn new(max_parallel: usize, algorithm: Arc<dyn SchedulingAlgorithm>) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            algorithm,
            max_parallel,
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Slots not currently held by a running scheduler.
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Scheduler loop tasks that have not finished yet. Aborted tasks count
    /// until the runtime has dropped them.
    pub fn running_schedulers(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Start a scheduler against `params.view`.
    ///
    /// Waits for a free slot unless `cancel` fires first, then returns once
    /// the loop has subscribed to the view and taken its initial listing.
    pub async fn launch(
        &self,
        cancel: &CancelToken,
        params: LaunchParams,
    ) -> SchedulerResult<SchedulerHandle> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| SchedulerError::LaunchScheduler {
                    name: params.name.clone(),
                    reason: "launcher semaphore closed".to_string(),
                })?
            }
            cause = cancel.cancelled() => return Err(SchedulerError::Cancelled(cause)),
        };

        if params.view.is_closed() {
            return Err(SchedulerError::LaunchScheduler {
                name: params.name.clone(),
                reason: format!("view {} is closed", params.view.name()),
            });
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let span = debug_span!("scheduler", name = %params.name, algorithm = self.algorithm.name());
        let running = RunningGuard::enter(&self.running);
        let scheduler_loop = run_scheduler_loop(
            Arc::clone(&self.algorithm),
            params.view.client(),
            params.resync_interval,
            cancel.clone(),
            stop_rx,
            ready_tx,
        );
        let task = tokio::spawn(
            async move {
                let _running = running;
                scheduler_loop.await
            }
            .instrument(span)
            .with_current_subscriber(),
        );

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                task.abort();
                return Err(SchedulerError::LaunchScheduler {
                    name: params.name.clone(),
                    reason,
                });
            }
            Err(_) => {
                task.abort();
                return Err(SchedulerError::LaunchScheduler {
                    name: params.name.clone(),
                    reason: "scheduler loop exited before becoming ready".to_string(),
                });
            }
        }

        debug!(
            scheduler = %params.name,
            available = self.semaphore.available_permits(),
            "scheduler launched"
        );
        Ok(SchedulerHandle {
            params,
            stop_tx,
            task: Some(task),
            _permit: permit,
        })
    }
}

/// A running scheduler. Dropping it aborts the loop and frees the slot.
pub struct SchedulerHandle {
    params: LaunchParams,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<SchedulerResult<()>>>,
    _permit: OwnedSemaphorePermit,
}

impl SchedulerHandle {
    pub fn params(&self) -> &LaunchParams {
        &self.params
    }

    /// Signal the loop, wait for it to exit, then release the slot.
    pub async fn stop(mut self) -> SchedulerResult<()> {
        let _ = self.stop_tx.send(true);
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(SchedulerError::TaskFailed {
                name: self.params.name.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Counts a scheduler task as running until the task's future is dropped.
struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_scheduler_loop(
    algorithm: Arc<dyn SchedulingAlgorithm>,
    client: ClientFacade,
    resync_interval: Duration,
    cancel: CancelToken,
    mut stop: watch::Receiver<bool>,
    ready: oneshot::Sender<Result<(), String>>,
) -> SchedulerResult<()> {
    let mut changes = client.watch();
    if let Err(e) = client.list_nodes() {
        let _ = ready.send(Err(e.to_string()));
        return Err(e.into());
    }
    let _ = ready.send(Ok(()));

    let mut state = CycleState::default();
    loop {
        match algorithm.run_cycle(&client, &mut state) {
            Ok(_) => {}
            Err(SchedulerError::View(StateError::Closed(view))) => {
                debug!(%view, "view closed, scheduler exiting");
                break;
            }
            Err(e) => warn!(error = %e, "scheduling cycle failed"),
        }

        tokio::select! {
            _ = stop.changed() => break,
            cause = cancel.cancelled() => {
                debug!(%cause, "scheduler cancelled");
                break;
            }
            change = changes.recv() => match change {
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    // Coalesce a burst of changes into one cycle.
                    while changes.try_recv().is_ok() {}
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::time::sleep(resync_interval) => {}
        }
    }

    debug!(cycles = state.cycles, "scheduler loop finished");
    Ok(())
}
