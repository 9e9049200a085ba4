//! The single-writer provisioning loop.
//!
//! The engine is the only task that mutates the reservation store and the
//! dedup cache. It selects over three inputs: the reservation source, an
//! internal cleanup channel (fed by a midnight tick and by the replay
//! sentinel), and the shutdown signal. Provision and decommission bodies run
//! inline, one at a time, each under a deadline; their failures are logged
//! and never stop the loop. Only store corruption or a permanently drained
//! source ends it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveTime, Utc};
use plfm_gridtypes::{ResultState, Workload};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::dedup::{DedupCache, DEFAULT_TTL};
use crate::feedback::Feedback;
use crate::janitor::Cleanup;
use crate::provisioner::Provision;
use crate::source::{Source, SourceEvent};
use crate::storage::{FsStore, StorageError};

/// Deadline on each individual provision or decommission.
pub const OPERATION_DEADLINE: Duration = Duration::from_secs(3 * 60);

/// Tunables of the engine loop.
pub struct EngineOptions {
    /// How long a processed id suppresses replays.
    pub dedup_ttl: Duration,

    /// Deadline on each provision/decommission invocation.
    pub operation_deadline: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            dedup_ttl: DEFAULT_TTL,
            operation_deadline: OPERATION_DEADLINE,
        }
    }
}

/// The provisioning engine.
pub struct Engine {
    provisioner: Arc<dyn Provision>,
    storage: Arc<FsStore>,
    /// Cleans lingering host resources; without one, no cleanup runs.
    janitor: Option<Arc<dyn Cleanup>>,
    feedback: Arc<dyn Feedback>,
    dedup: DedupCache,
    options: EngineOptions,
    /// Latched once the source reports its historical replay drained.
    /// Cleanup never runs before that, or the janitor would eat resources
    /// whose reservations are still on their way back.
    all_workloads_processed: bool,
}

impl Engine {
    pub fn new(
        provisioner: Arc<dyn Provision>,
        storage: Arc<FsStore>,
        janitor: Option<Arc<dyn Cleanup>>,
        feedback: Arc<dyn Feedback>,
        options: EngineOptions,
    ) -> Self {
        let dedup = DedupCache::new(options.dedup_ttl);
        Self {
            provisioner,
            storage,
            janitor,
            feedback,
            dedup,
            options,
            all_workloads_processed: false,
        }
    }

    /// Consume `source` until it drains or `shutdown` flips.
    ///
    /// Events are handled strictly in arrival order; no two handler
    /// invocations overlap.
    pub async fn run(
        mut self,
        mut source: impl Source,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        // capacity 2 as a tick and a sentinel kick may be in flight at once
        let (cleanup_tx, mut cleanup_rx) = mpsc::channel::<()>(2);
        let cron = spawn_midnight_cron(cleanup_tx.clone());

        info!("provision engine started");

        loop {
            tokio::select! {
                // deterministic order: a pending cleanup kick runs before
                // the next event, and never after the source has drained
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("provision engine shutting down");
                        break;
                    }
                }

                Some(()) = cleanup_rx.recv() => {
                    self.run_cleanup().await;
                }

                event = source.next() => {
                    match event {
                        None => {
                            info!("reservation source drained, stopping engine");
                            break;
                        }
                        Some(SourceEvent::SyncDone) => {
                            self.all_workloads_processed = true;
                            debug!("historical replay drained, kicking cleanup");
                            let _ = cleanup_tx.try_send(());
                        }
                        Some(SourceEvent::Workload(workload)) => {
                            self.handle_workload(*workload).await;
                        }
                    }
                }
            }
        }

        cron.abort();
        Ok(())
    }

    async fn handle_workload(&mut self, workload: Workload) {
        let now = Utc::now();
        let expired = workload.expired(now);

        info!(
            id = %workload.id,
            kind = %workload.kind,
            duration_secs = workload.duration.as_secs(),
            tag = %workload.tag,
            to_delete = workload.to_delete,
            expired,
            "workload received"
        );

        if expired || workload.to_delete {
            info!(id = %workload.id, "start decommissioning workload");
            if let Err(e) = self.decommission(&workload).await {
                error!(id = %workload.id, error = %e, "failed to decommission workload");
            }
            return;
        }

        if self.dedup.contains(&workload.id) {
            debug!(id = %workload.id, "workload received twice, skipping");
            return;
        }
        self.dedup.mark(workload.id.clone());

        info!(id = %workload.id, "start provisioning workload");
        if let Err(e) = self.provision(&workload, now).await {
            error!(id = %workload.id, error = %e, "failed to provision workload");
        }
    }

    async fn provision(
        &self,
        workload: &Workload,
        now: chrono::DateTime<Utc>,
    ) -> anyhow::Result<()> {
        workload.validate(now)?;

        let mut result = match tokio::time::timeout(
            self.options.operation_deadline,
            self.provisioner.provision(workload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(id = %workload.id, "provision deadline elapsed");
                self.provisioner.error_result(
                    workload,
                    format!(
                        "provisioning unavailable: deadline of {}s elapsed",
                        self.options.operation_deadline.as_secs()
                    ),
                )
            }
        };

        // the source is told how the attempt went even when the commit to
        // the store fails; only afterwards does the error surface
        let mut store_failure = None;
        if result.state == ResultState::Ok {
            if let Err(e) = self.persist(workload) {
                warn!(id = %workload.id, error = %e, "provisioned but failed to store workload");
                result = self
                    .provisioner
                    .error_result(workload, format!("failed to store workload: {e}"));
                store_failure = Some(e);
            }
        }

        if let Err(e) = self.feedback.send(&result).await {
            warn!(id = %workload.id, error = %e, "failed to report workload result");
        }

        match store_failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn persist(&self, workload: &Workload) -> Result<(), StorageError> {
        match self.storage.add(workload) {
            Ok(()) => Ok(()),
            // a replay past the dedup TTL; refresh the stored record
            Err(StorageError::Exists(_)) => {
                debug!(id = %workload.id, "workload already stored, updating record");
                self.storage.set(workload)
            }
            Err(e) => Err(e),
        }
    }

    async fn decommission(&self, workload: &Workload) -> anyhow::Result<()> {
        tokio::time::timeout(
            self.options.operation_deadline,
            self.provisioner.decommission(workload),
        )
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "decommission unavailable: deadline of {}s elapsed",
                self.options.operation_deadline.as_secs()
            )
        })??;

        // the host resource is gone either way; the source hears about it
        // even when dropping the stored record fails
        let removal = self.storage.remove(&workload.id);
        let result = match &removal {
            Ok(()) => self.provisioner.deleted_result(workload),
            Err(e) => {
                warn!(id = %workload.id, error = %e, "decommissioned but failed to drop stored workload");
                self.provisioner
                    .error_result(workload, format!("failed to drop stored workload: {e}"))
            }
        };

        if let Err(e) = self.feedback.send(&result).await {
            warn!(id = %workload.id, error = %e, "failed to report workload deletion");
        }

        removal.map_err(Into::into)
    }

    async fn run_cleanup(&self) {
        if !self.all_workloads_processed {
            info!("workloads not fully replayed yet, delaying cleanup");
            return;
        }

        let Some(janitor) = &self.janitor else {
            info!("janitor not configured, skipping cleanup");
            return;
        };

        info!("start cleaning up resources");
        if let Err(e) = janitor.cleanup().await {
            error!(error = %e, "failed to clean up resources");
        }
    }
}

/// Fires the cleanup channel at every local midnight.
fn spawn_midnight_cron(tx: mpsc::Sender<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(until_next_midnight()).await;
            match tx.try_send(()) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
                Err(mpsc::error::TrySendError::Closed(())) => break,
            }
        }
    })
}

/// Time left until the next local midnight.
fn until_next_midnight() -> Duration {
    let now = Local::now();
    let tomorrow = now.date_naive() + chrono::Days::new(1);
    let midnight = tomorrow.and_time(NaiveTime::MIN);

    match midnight
        .and_local_timezone(Local)
        .earliest()
        .map(|next| next.signed_duration_since(now))
        .and_then(|d| d.to_std().ok())
    {
        Some(wait) => wait,
        // a tz transition swallowed midnight; just try again in a day
        None => Duration::from_secs(24 * 60 * 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_until_next_midnight_bounds() {
        let wait = until_next_midnight();
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_secs(25 * 60 * 60));
    }

    #[test]
    fn test_default_options() {
        let options = EngineOptions::default();
        assert_eq!(options.dedup_ttl, Duration::from_secs(30 * 60));
        assert_eq!(options.operation_deadline, Duration::from_secs(180));
    }
}
