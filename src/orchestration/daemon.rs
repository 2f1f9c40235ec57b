//! # Daemon Controller
//!
//! Long-lived polling loops for the coordinator, monitor, scheduler and
//! sensor daemons. Each loop runs one iteration, records a heartbeat in the
//! run storage key-value store, then sleeps until the next interval or until
//! shutdown is signalled. Iteration errors are logged and recorded on the
//! heartbeat; they never end the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::coordinator::QueuedRunCoordinatorDaemon;
use super::monitor::RunMonitor;
use super::schedules::SchedulerDaemon;
use super::sensors::SensorDaemon;
use crate::constants::kvs;
use crate::error::Result;
use crate::storage::RunStorage;

#[async_trait]
pub trait Daemon: Send + Sync + 'static {
    fn daemon_type(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn run_once(&self) -> Result<()>;
}

#[async_trait]
impl Daemon for QueuedRunCoordinatorDaemon {
    fn daemon_type(&self) -> &'static str {
        "QUEUED_RUN_COORDINATOR"
    }

    fn interval(&self) -> Duration {
        self.dequeue_interval()
    }

    async fn run_once(&self) -> Result<()> {
        let result = self.run_iteration().await?;
        for (run_id, reason) in &result.errors {
            warn!(run_id = %run_id, reason = %reason, "Queued run failed to launch");
        }
        Ok(())
    }
}

#[async_trait]
impl Daemon for RunMonitor {
    fn daemon_type(&self) -> &'static str {
        "MONITORING"
    }

    fn interval(&self) -> Duration {
        self.poll_interval()
    }

    async fn run_once(&self) -> Result<()> {
        self.run_iteration(Utc::now()).await.map(|_| ())
    }
}

#[async_trait]
impl Daemon for SchedulerDaemon {
    fn daemon_type(&self) -> &'static str {
        "SCHEDULER"
    }

    fn interval(&self) -> Duration {
        self.poll_interval()
    }

    async fn run_once(&self) -> Result<()> {
        self.run_iteration(Utc::now()).await.map(|_| ())
    }
}

#[async_trait]
impl Daemon for SensorDaemon {
    fn daemon_type(&self) -> &'static str {
        "SENSOR"
    }

    fn interval(&self) -> Duration {
        self.poll_interval()
    }

    async fn run_once(&self) -> Result<()> {
        self.run_iteration(Utc::now()).await.map(|_| ())
    }
}

/// Liveness record written after every iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonHeartbeat {
    pub daemon_id: Uuid,
    pub daemon_type: String,
    pub timestamp: DateTime<Utc>,
    /// Error of the latest iteration, if it failed
    pub error: Option<String>,
}

impl DaemonHeartbeat {
    pub fn key(daemon_type: &str) -> String {
        format!("{}{}", kvs::DAEMON_HEARTBEAT_PREFIX, daemon_type)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, tolerance: Duration) -> bool {
        chrono::Duration::from_std(tolerance).map_or(false, |tolerance| now - self.timestamp <= tolerance)
    }
}

/// Latest heartbeat of a daemon type
pub async fn get_daemon_heartbeat(
    run_storage: &dyn RunStorage,
    daemon_type: &str,
) -> Result<Option<DaemonHeartbeat>> {
    let key = DaemonHeartbeat::key(daemon_type);
    let values = run_storage.kvs_get(std::slice::from_ref(&key)).await?;
    match values.get(&key) {
        Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
        None => Ok(None),
    }
}

/// Runs a set of daemons until [`DaemonController::stop`]
pub struct DaemonController {
    id: Uuid,
    run_storage: Arc<dyn RunStorage>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl std::fmt::Debug for DaemonController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonController")
            .field("id", &self.id)
            .field("daemons", &self.daemon_types())
            .finish()
    }
}

impl DaemonController {
    pub fn new(run_storage: Arc<dyn RunStorage>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            run_storage,
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn daemon_types(&self) -> Vec<&'static str> {
        self.handles.lock().iter().map(|(name, _)| *name).collect()
    }

    /// Start the polling loop of `daemon`
    pub fn spawn(&self, daemon: Arc<dyn Daemon>) {
        let daemon_type = daemon.daemon_type();
        let mut shutdown = self.shutdown.subscribe();
        let run_storage = self.run_storage.clone();
        let controller_id = self.id;
        info!(daemon = daemon_type, interval_ms = daemon.interval().as_millis() as u64, "🔄 DAEMON: Starting loop");

        let handle = tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let error = match daemon.run_once().await {
                    Ok(()) => None,
                    Err(err) => {
                        error!(daemon = daemon_type, error = %err, "Daemon iteration failed");
                        Some(err.to_string())
                    }
                };
                let heartbeat = DaemonHeartbeat {
                    daemon_id: controller_id,
                    daemon_type: daemon_type.to_string(),
                    timestamp: Utc::now(),
                    error,
                };
                if let Err(err) = write_heartbeat(run_storage.as_ref(), &heartbeat).await {
                    warn!(daemon = daemon_type, error = %err, "Failed to record heartbeat");
                }

                tokio::select! {
                    _ = tokio::time::sleep(daemon.interval()) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!(daemon = daemon_type, "Daemon loop shutting down");
        });
        self.handles.lock().push((daemon_type, handle));
    }

    /// Signal every loop to stop and wait up to `timeout` for each to exit
    #[instrument(skip(self), fields(controller_id = %self.id))]
    pub async fn stop(&self, timeout: Duration) {
        info!("🛑 DAEMON: Stopping daemon loops");
        let _ = self.shutdown.send(true);
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        join_all(handles.into_iter().map(|(daemon_type, handle)| async move {
            let abort = handle.abort_handle();
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!(daemon = daemon_type, "Daemon did not stop in time; aborting");
                abort.abort();
            }
        }))
        .await;
    }
}

async fn write_heartbeat(run_storage: &dyn RunStorage, heartbeat: &DaemonHeartbeat) -> Result<()> {
    let value = serde_json::to_string(heartbeat)?;
    run_storage
        .kvs_set(HashMap::from([(DaemonHeartbeat::key(&heartbeat.daemon_type), value)]))
        .await?;
    Ok(())
}
