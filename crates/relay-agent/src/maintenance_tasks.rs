use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use relay_contract::{
    ConnectionStats, MemoryProbe, PersistentStorage, UpdateChecker, UpdateStatus,
};
use relay_core::{format_uptime, write_text_atomic, Clock};
use relay_gate::{CommandCounters, RiskGate};
use relay_runtime::{AutoHealer, HealerSnapshot, ScheduledTask};
use relay_session::SessionStoreStats;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::control::{ControlSender, ControlSignal, REASON_MEMORY_PRESSURE};
use crate::dispatch::TransportSlot;
use crate::lifecycle_state::LifecycleState;

pub const UPDATE_CHECK_TASK: &str = "update_check";
pub const BACKUP_TASK: &str = "persistent_backup";
pub const HEALTH_CHECK_TASK: &str = "health_check";
pub const SESSION_SWEEP_TASK: &str = "session_sweep";

pub const HEALTH_SNAPSHOT_FILE: &str = "health.json";
const HEALTH_SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Public struct `UpdateCheckTask` used across Relay components.
pub struct UpdateCheckTask {
    updates: Arc<dyn UpdateChecker>,
}

impl UpdateCheckTask {
    pub fn new(updates: Arc<dyn UpdateChecker>) -> Self {
        Self { updates }
    }
}

/// Runs one update check and logs the result.
pub async fn check_for_updates_logged(updates: &dyn UpdateChecker) -> Result<UpdateStatus> {
    let status = updates
        .check_for_updates()
        .await
        .context("update check failed")?;
    match &status {
        UpdateStatus::Available { current, latest } => {
            info!(current = %current, latest = %latest, "update available")
        }
        UpdateStatus::UpToDate { current } => debug!(current = %current, "up to date"),
        UpdateStatus::Disabled => debug!("update check disabled"),
    }
    Ok(status)
}

#[async_trait]
impl ScheduledTask for UpdateCheckTask {
    fn name(&self) -> &'static str {
        UPDATE_CHECK_TASK
    }

    async fn run(&self) -> Result<()> {
        check_for_updates_logged(self.updates.as_ref()).await?;
        Ok(())
    }
}

/// Public struct `BackupTask` used across Relay components.
pub struct BackupTask {
    storage: Arc<dyn PersistentStorage>,
}

impl BackupTask {
    pub fn new(storage: Arc<dyn PersistentStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl ScheduledTask for BackupTask {
    fn name(&self) -> &'static str {
        BACKUP_TASK
    }

    async fn run(&self) -> Result<()> {
        self.storage
            .backup()
            .await
            .context("scheduled backup failed; next firing will retry")?;
        debug!("scheduled backup completed");
        Ok(())
    }
}

/// Public struct `SessionSweepTask` used across Relay components.
pub struct SessionSweepTask {
    gate: Arc<RiskGate>,
    max_idle: Duration,
    clock: Arc<dyn Clock>,
}

impl SessionSweepTask {
    pub fn new(gate: Arc<RiskGate>, max_idle: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            gate,
            max_idle,
            clock,
        }
    }
}

#[async_trait]
impl ScheduledTask for SessionSweepTask {
    fn name(&self) -> &'static str {
        SESSION_SWEEP_TASK
    }

    async fn run(&self) -> Result<()> {
        let removed = self
            .gate
            .sessions()
            .sweep_idle(self.max_idle, self.clock.now_unix_ms());
        if removed > 0 {
            info!(removed, "idle sessions swept");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
/// Point-in-time health report. Logged each health check and persisted when a
/// state directory is configured.
pub struct HealthSnapshot {
    pub schema_version: u32,
    pub updated_unix_ms: u64,
    pub lifecycle_state: LifecycleState,
    pub uptime_ms: u64,
    pub uptime: String,
    pub memory_used_bytes: Option<u64>,
    pub memory_ceiling_bytes: u64,
    pub memory_pressure_threshold_bytes: u64,
    pub memory_pressure: bool,
    pub command_invocations: u64,
    pub commands: BTreeMap<String, CommandCounters>,
    pub sessions: SessionStoreStats,
    pub connection: ConnectionStats,
    pub dropped_messages: u64,
    pub healer: HealerSnapshot,
}

#[derive(Clone)]
/// Everything the health check reads.
pub struct HealthMonitor {
    pub memory: Arc<dyn MemoryProbe>,
    pub memory_ceiling_bytes: u64,
    pub pressure_threshold_bytes: u64,
    pub cooldown: Duration,
    pub healer: Arc<AutoHealer>,
    pub gate: Arc<RiskGate>,
    pub transport: Arc<TransportSlot>,
    pub state: watch::Receiver<LifecycleState>,
    pub clock: Arc<dyn Clock>,
    pub started_at: Instant,
    pub snapshot_path: Option<PathBuf>,
    pub control: ControlSender,
}

impl HealthMonitor {
    pub fn snapshot_path_for(state_dir: Option<&std::path::Path>) -> Option<PathBuf> {
        state_dir.map(|dir| dir.join(HEALTH_SNAPSHOT_FILE))
    }

    pub fn collect(&self) -> HealthSnapshot {
        let uptime = self.started_at.elapsed();
        let memory_used_bytes = self.memory.used_bytes();
        let memory_pressure = memory_used_bytes
            .map(|used| used > self.pressure_threshold_bytes)
            .unwrap_or(false);
        let statistics = self.gate.statistics();
        HealthSnapshot {
            schema_version: HEALTH_SNAPSHOT_SCHEMA_VERSION,
            updated_unix_ms: self.clock.now_unix_ms(),
            lifecycle_state: *self.state.borrow(),
            uptime_ms: u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX),
            uptime: format_uptime(uptime),
            memory_used_bytes,
            memory_ceiling_bytes: self.memory_ceiling_bytes,
            memory_pressure_threshold_bytes: self.pressure_threshold_bytes,
            memory_pressure,
            command_invocations: statistics.total_invocations(),
            commands: statistics.snapshot(),
            sessions: self.gate.sessions().stats(),
            connection: self
                .transport
                .get()
                .map(|transport| transport.connection_stats())
                .unwrap_or_default(),
            dropped_messages: self.gate.dropped_messages(),
            healer: self.healer.snapshot(),
        }
    }

    fn signal(&self, signal: ControlSignal) {
        if self.control.try_send(signal).is_err() {
            debug!("controller not accepting health signals");
        }
    }

    /// Collects a snapshot, mitigates memory pressure, and tells the controller
    /// whether to degrade or restore the running state.
    pub async fn check(&self) -> Result<HealthSnapshot> {
        let snapshot = self.collect();
        debug!(
            state = snapshot.lifecycle_state.as_str(),
            uptime = %snapshot.uptime,
            memory_used_bytes = ?snapshot.memory_used_bytes,
            sessions = snapshot.sessions.sessions,
            command_invocations = snapshot.command_invocations,
            dropped_messages = snapshot.dropped_messages,
            connected = snapshot.connection.connected,
            "system health"
        );
        if snapshot.memory_pressure {
            warn!(
                reason_code = REASON_MEMORY_PRESSURE,
                memory_used_bytes = ?snapshot.memory_used_bytes,
                threshold_bytes = snapshot.memory_pressure_threshold_bytes,
                "high memory usage detected"
            );
            self.healer.optimize_memory(
                self.gate.sessions(),
                self.cooldown,
                self.clock.now_unix_ms(),
            );
            self.signal(ControlSignal::Degraded {
                reason_code: REASON_MEMORY_PRESSURE.to_string(),
            });
        } else {
            self.signal(ControlSignal::Healthy);
        }
        if let Some(path) = &self.snapshot_path {
            let payload = serde_json::to_string_pretty(&snapshot)
                .context("failed to serialize health snapshot")?;
            write_text_atomic(path, &payload).with_context(|| {
                format!("failed to persist health snapshot {}", path.display())
            })?;
        }
        Ok(snapshot)
    }
}

/// Public struct `HealthCheckTask` used across Relay components.
pub struct HealthCheckTask {
    monitor: HealthMonitor,
}

impl HealthCheckTask {
    pub fn new(monitor: HealthMonitor) -> Self {
        Self { monitor }
    }
}

#[async_trait]
impl ScheduledTask for HealthCheckTask {
    fn name(&self) -> &'static str {
        HEALTH_CHECK_TASK
    }

    async fn run(&self) -> Result<()> {
        self.monitor.check().await?;
        Ok(())
    }
}
