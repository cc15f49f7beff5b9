// Refresh engine: periodic resolution of the catalog into trigger files

use crate::catalog::CatalogClient;
use crate::config::Settings;
use crate::errors::{PassError, PersistenceError, ResolutionFailure};
use crate::persistence::TriggerStore;
use crate::policy::SchedulePolicies;
use crate::reconciler::{ReconcileSummary, ScheduleReconciler};
use crate::resolver::ScheduleResolver;
use crate::telemetry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the refresh loop
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Delay after a completed pass, and after a configuration failure
    pub update_delay: Duration,
    /// Delay after a communication or persistence failure
    pub error_retry_delay: Duration,
    pub page_size: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            update_delay: Duration::from_secs(43200),
            error_retry_delay: Duration::from_secs(300),
            page_size: 100,
        }
    }
}

impl RefreshConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            update_delay: Duration::from_secs(settings.scheduler.update_delay_seconds),
            error_retry_delay: Duration::from_secs(settings.scheduler.error_retry_seconds),
            page_size: settings.catalog.page_size,
        }
    }

    /// How long to wait before the next pass
    pub fn delay_after(&self, outcome: &Result<ReconcileSummary, PassError>) -> Duration {
        match outcome {
            Ok(_) => self.update_delay,
            Err(e) if e.is_transient() => self.error_retry_delay,
            Err(_) => self.update_delay,
        }
    }
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Purge stale triggers, then refresh until stopped
    async fn start(&self) -> Result<(), PersistenceError>;

    /// Signal the loop to stop after the pass in progress
    async fn stop(&self);

    /// One full resolve-and-reconcile pass
    async fn run_pass(&self) -> Result<ReconcileSummary, PassError>;
}

pub struct RefreshEngine<S: TriggerStore> {
    config: RefreshConfig,
    client: Arc<dyn CatalogClient>,
    policies: Arc<SchedulePolicies>,
    reconciler: Mutex<ScheduleReconciler<S>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl<S: TriggerStore> RefreshEngine<S> {
    pub fn new(
        config: RefreshConfig,
        client: Arc<dyn CatalogClient>,
        policies: Arc<SchedulePolicies>,
        store: S,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

        Self {
            config,
            client,
            policies,
            reconciler: Mutex::new(ScheduleReconciler::new(store)),
            shutdown_tx,
        }
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Remove every trigger this scheduler owns.
    ///
    /// The reconciler starts from an empty snapshot, so anything left over
    /// from a previous run would otherwise never be cleaned up.
    #[instrument(skip(self))]
    pub async fn purge_stale(&self) -> Result<usize, PersistenceError> {
        let reconciler = self.reconciler.lock().await;
        reconciler.store().purge_all().await
    }
}

#[async_trait]
impl<S: TriggerStore + 'static> Scheduler for RefreshEngine<S> {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), PersistenceError> {
        let mut shutdown_rx = self.shutdown_receiver();

        let purged = self.purge_stale().await?;
        info!(
            purged,
            update_delay_seconds = self.config.update_delay.as_secs(),
            "Starting refresh engine"
        );

        loop {
            let outcome = self.run_pass().await;
            let delay = self.config.delay_after(&outcome);

            match &outcome {
                Ok(summary) => info!(
                    added = summary.added,
                    removed = summary.removed,
                    changed = summary.changed,
                    unchanged = summary.unchanged,
                    next_pass_seconds = delay.as_secs(),
                    "Refresh pass complete"
                ),
                Err(e) if e.is_transient() => {
                    telemetry::record_pass_failure("transient");
                    warn!(error = %e, retry_seconds = delay.as_secs(), "Refresh pass failed, retrying sooner");
                }
                Err(e) => {
                    telemetry::record_pass_failure("fatal");
                    error!(error = %e, retry_seconds = delay.as_secs(), "Refresh pass failed");
                }
            }

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping refresh engine");
                    break;
                }
            }
        }

        info!("Refresh engine stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) {
        info!("Stopping refresh engine");
        let _ = self.shutdown_tx.send(());
    }

    #[instrument(skip(self))]
    async fn run_pass(&self) -> Result<ReconcileSummary, PassError> {
        let started = Instant::now();
        let reporter = |_: &str, failure: &ResolutionFailure| {
            telemetry::record_resolution_skipped(failure);
        };

        let resolver =
            ScheduleResolver::new(self.client.as_ref(), &self.policies, self.config.page_size);
        let snapshot = resolver.resolve(&reporter).await?;
        telemetry::record_snapshot_size(snapshot.len(), snapshot.entry_count());
        debug!(
            projects = snapshot.len(),
            entries = snapshot.entry_count(),
            "Snapshot resolved"
        );

        let summary = self.reconciler.lock().await.reconcile(snapshot).await?;
        telemetry::record_reconcile(&summary);
        telemetry::record_pass_duration(started.elapsed().as_secs_f64());
        Ok(summary)
    }
}
