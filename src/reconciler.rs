//! Periodic health pass over every container the runtime knows about.
//!
//! Paused containers are unpaused and stopped ones restarted. The registry is
//! never consulted or updated here; it catches up the next time a container
//! is driven through the lifecycle controller.

use std::{collections::HashMap, sync::Arc, time::Duration};

use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::config::HealthConfig;
use crate::runtime::{ContainerRuntime, RuntimeError, RuntimeStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub healthy: usize,
    pub unpaused: usize,
    pub restarted: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum Remedy {
    None,
    Unpause,
    Restart,
    Skip,
}

impl From<RuntimeStatus> for Remedy {
    fn from(status: RuntimeStatus) -> Self {
        match status {
            RuntimeStatus::Running => Self::None,
            RuntimeStatus::Paused => Self::Unpause,
            RuntimeStatus::Restarting | RuntimeStatus::Removing => Self::Skip,
            RuntimeStatus::Exited
            | RuntimeStatus::Dead
            | RuntimeStatus::Created
            | RuntimeStatus::Empty
            | RuntimeStatus::Unknown => Self::Restart,
        }
    }
}

pub struct HealthReconciler {
    runtime: Arc<dyn ContainerRuntime>,
    interval: Duration,
    failure_threshold: u32,
    /// Consecutive failed ticks per container id.
    failures: HashMap<String, u32>,
}

impl HealthReconciler {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &HealthConfig) -> Self {
        Self {
            runtime,
            interval: config.interval(),
            failure_threshold: config.failure_threshold.max(1),
            failures: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Health reconciler started, checking every {}s",
            self.interval.as_secs()
        );
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.reconcile_once().await;
                    info!("Health check finished: {report:?}");
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Health reconciler stopped");
    }

    pub async fn reconcile_once(&mut self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let containers = match self.runtime.list_containers(true).await {
            Ok(containers) => containers,
            Err(e) => {
                error!("Health check could not list containers: {e}");
                return report;
            }
        };

        self.failures
            .retain(|id, _| containers.iter().any(|c| &c.id == id));

        for container in containers {
            let id = container.id.as_str();
            match self.heal(id).await {
                Ok(Remedy::None) => report.healthy += 1,
                Ok(Remedy::Unpause) => report.unpaused += 1,
                Ok(Remedy::Restart) => report.restarted += 1,
                Ok(Remedy::Skip) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    self.record_failure(id, &e);
                    continue;
                }
            }
            self.failures.remove(id);
        }
        report
    }

    async fn heal(&self, id: &str) -> Result<Remedy, RuntimeError> {
        let status = self.runtime.inspect_status(id).await?;
        let remedy = Remedy::from(status);
        match remedy {
            Remedy::None => debug!("Container {id} is running"),
            Remedy::Skip => debug!("Container {id} is {status}, leaving it alone"),
            Remedy::Unpause => {
                info!("Container {id} is paused, unpausing");
                self.runtime.unpause_container(id).await?;
            }
            Remedy::Restart => {
                info!("Container {id} is {status}, restarting");
                self.runtime.restart_container(id).await?;
            }
        }
        Ok(remedy)
    }

    fn record_failure(&mut self, id: &str, e: &RuntimeError) {
        let count = self.failures.entry(id.to_string()).or_default();
        *count += 1;
        if *count >= self.failure_threshold {
            error!("Container {id} failed its health check {count} times in a row: {e}");
        } else {
            warn!("Health check failed for container {id}: {e}");
        }
    }
}
