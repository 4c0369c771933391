//! Periodic controller scheduling.
//!
//! Each controller runs on its own task: an initial delay, then one cycle per
//! interval tick. Ticks missed while a cycle is still running are dropped,
//! never queued. Cycles are additionally wrapped in a [`CycleGuard`], so a
//! cycle triggered from outside the ticker while one is in flight is skipped
//! rather than run concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::settings::Schedule;

/// A reconciliation loop driven by [`spawn`].
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Name used for the scheduled job in logs.
    fn job_name(&self) -> &str;

    /// Runs one cycle. Must not fail: errors are logged and the next tick
    /// is the retry.
    async fn run_cycle(&self);

    /// Best-effort release of whatever this controller holds. Called once
    /// at shutdown.
    async fn release(&self);
}

/// Skip-if-running flag for controller cycles.
#[derive(Debug, Default)]
pub struct CycleGuard {
    running: AtomicBool,
}

impl CycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the guarded section, or returns `None` if a cycle is already
    /// in flight. The section ends when the returned token drops.
    pub fn try_enter(&self) -> Option<CycleToken<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleToken {
                running: &self.running,
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Held while a guarded cycle runs.
#[derive(Debug)]
pub struct CycleToken<'a> {
    running: &'a AtomicBool,
}

impl Drop for CycleToken<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Running controller task. Dropping the handle detaches the task: it keeps
/// cycling until the runtime shuts down and never releases. Call
/// [`shutdown`](Self::shutdown) to stop it and release its lease.
#[must_use = "dropping the handle detaches the controller; call shutdown to release"]
pub struct ControllerHandle {
    controller: Arc<dyn Controller>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for ControllerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerHandle")
            .field("job", &self.controller.job_name())
            .finish_non_exhaustive()
    }
}

impl ControllerHandle {
    /// Unschedules the controller, waits up to `grace` for an in-flight
    /// cycle, then makes one release attempt bounded by the same grace.
    pub async fn shutdown(self, grace: Duration) {
        let job = self.controller.job_name().to_string();
        let _ = self.stop_tx.send(true);

        let abort = self.task.abort_handle();
        if tokio::time::timeout(grace, self.task).await.is_err() {
            warn!(job = %job, "controller cycle still running at shutdown, aborting it");
            abort.abort();
        }

        if tokio::time::timeout(grace, self.controller.release())
            .await
            .is_err()
        {
            debug!(job = %job, "lease release timed out, leaving it to expire");
        }
        info!(job = %job, "controller stopped");
    }
}

/// Resolves once stop has been requested. A dropped sender is not a stop
/// request, so a detached controller keeps running.
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Starts `controller` on its own task according to `schedule`.
pub fn spawn(controller: Arc<dyn Controller>, schedule: Schedule) -> ControllerHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let delay = schedule.initial_delay.resolve();
    let job = controller.job_name().to_string();
    info!(job = %job, ?delay, interval = ?schedule.interval, "scheduling controller");

    let task = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop_rx) => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let mut ticker = tokio::time::interval(schedule.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                // stop wins over a tick that came due during the last cycle
                tokio::select! {
                    biased;
                    _ = stop_requested(&mut stop_rx) => break,
                    _ = ticker.tick() => {}
                }
                controller.run_cycle().await;
            }
            debug!(job = %job, "controller loop exited");
        })
    };

    ControllerHandle {
        controller,
        stop_tx,
        task,
    }
}

/// Runs one cycle right away, then hands the controller to [`spawn`].
///
/// Used for the leader at startup so member leases exist before the first
/// member cycle, whatever initial delay the schedules draw.
pub async fn spawn_primed(
    controller: Arc<dyn Controller>,
    schedule: Schedule,
) -> ControllerHandle {
    controller.run_cycle().await;
    spawn(controller, schedule)
}
