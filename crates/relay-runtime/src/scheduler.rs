use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::panic_scope::contain_panics;

pub const REASON_TASK_FAILED: &str = "scheduled_task_failed";
pub const REASON_TASK_PANICKED: &str = "scheduled_task_panicked";
pub const REASON_TASK_OVERRAN: &str = "scheduled_task_overran";
pub const REASON_TASK_ABORTED: &str = "scheduled_task_aborted";

#[async_trait]
/// One unit of recurring maintenance work.
pub trait ScheduledTask: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
/// Public struct `TaskStats` used across Relay components.
pub struct TaskStats {
    pub period_ms: u64,
    pub runs: u64,
    pub failures: u64,
    pub panics: u64,
    pub overruns: u64,
}

#[derive(Debug, Default)]
struct TaskCounters {
    runs: AtomicU64,
    failures: AtomicU64,
    panics: AtomicU64,
    overruns: AtomicU64,
}

impl TaskCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, period: Duration) -> TaskStats {
        TaskStats {
            period_ms: u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            runs: self.runs.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }
}

struct RegisteredTask {
    task: Arc<dyn ScheduledTask>,
    period: Duration,
    counters: Arc<TaskCounters>,
}

/// Aborts the wrapped task if the owner is dropped before it completes.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Default)]
/// Collects recurring tasks before they are started.
pub struct Scheduler {
    tasks: Vec<RegisteredTask>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `task` to fire every `period`, first firing one period after start.
    pub fn register(&mut self, task: Arc<dyn ScheduledTask>, period: Duration) -> Result<()> {
        if period.is_zero() {
            bail!("scheduled task '{}' period must be greater than zero", task.name());
        }
        if self.tasks.iter().any(|existing| existing.task.name() == task.name()) {
            bail!("scheduled task '{}' is already registered", task.name());
        }
        self.tasks.push(RegisteredTask {
            task,
            period,
            counters: Arc::new(TaskCounters::default()),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawns one loop per task. Must be called inside a tokio runtime.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut stats = BTreeMap::new();
        let mut loops = Vec::with_capacity(self.tasks.len());
        for registered in self.tasks {
            let name = registered.task.name();
            stats.insert(name, (registered.period, Arc::clone(&registered.counters)));
            info!(task = name, period_ms = registered.period.as_millis() as u64, "scheduled task started");
            loops.push((
                name,
                tokio::spawn(run_task_loop(registered, shutdown_rx.clone())),
            ));
        }
        SchedulerHandle {
            shutdown_tx,
            loops,
            stats,
        }
    }
}

async fn run_task_loop(registered: RegisteredTask, mut shutdown_rx: watch::Receiver<bool>) {
    let RegisteredTask {
        task,
        period,
        counters,
    } = registered;
    let name = task.name();
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let started = Instant::now();
                let task = Arc::clone(&task);
                let mut run = AbortOnDrop(tokio::spawn(contain_panics(name, async move {
                    task.run().await
                })));
                match (&mut run.0).await {
                    Ok(Ok(())) => {
                        TaskCounters::bump(&counters.runs);
                        debug!(task = name, "scheduled task completed");
                    }
                    Ok(Err(error)) => {
                        TaskCounters::bump(&counters.runs);
                        TaskCounters::bump(&counters.failures);
                        warn!(reason_code = REASON_TASK_FAILED, task = name, error = %error, "scheduled task failed");
                    }
                    Err(join_error) if join_error.is_panic() => {
                        TaskCounters::bump(&counters.runs);
                        TaskCounters::bump(&counters.panics);
                        error!(reason_code = REASON_TASK_PANICKED, task = name, "scheduled task panicked");
                    }
                    Err(_) => {
                        warn!(reason_code = REASON_TASK_ABORTED, task = name, "scheduled task aborted");
                    }
                }
                let elapsed = started.elapsed();
                if elapsed > period {
                    TaskCounters::bump(&counters.overruns);
                    warn!(
                        reason_code = REASON_TASK_OVERRAN,
                        task = name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        period_ms = period.as_millis() as u64,
                        "scheduled task overran its period; missed firings skipped"
                    );
                }
            }
        }
    }
    debug!(task = name, "scheduled task loop stopped");
}

/// Owns the running task loops.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    loops: Vec<(&'static str, JoinHandle<()>)>,
    stats: BTreeMap<&'static str, (Duration, Arc<TaskCounters>)>,
}

impl SchedulerHandle {
    pub fn is_running(&self) -> bool {
        !self.loops.is_empty()
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.stats.keys().copied().collect()
    }

    pub fn stats(&self) -> BTreeMap<&'static str, TaskStats> {
        self.stats
            .iter()
            .map(|(name, (period, counters))| (*name, counters.snapshot(*period)))
            .collect()
    }

    /// Stops future firings, lets in-flight runs finish within `grace`, then aborts.
    pub async fn shutdown(&mut self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let deadline = Instant::now() + grace;
        for (name, mut task_loop) in self.loops.drain(..) {
            match tokio::time::timeout_at(deadline, &mut task_loop).await {
                Ok(_) => {}
                Err(_) => {
                    task_loop.abort();
                    warn!(reason_code = REASON_TASK_ABORTED, task = name, "scheduled task exceeded shutdown grace");
                }
            }
        }
    }

    /// Stops every loop without waiting for in-flight runs.
    pub fn abort(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for (_, task_loop) in self.loops.drain(..) {
            task_loop.abort();
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        for (_, task_loop) in &self.loops {
            task_loop.abort();
        }
    }
}
