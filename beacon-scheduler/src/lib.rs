//! Long-running loops of the gateway.
//!
//! [`Scheduler::run`] spawns one task per periodic job (polling,
//! session upkeep, queue maintenance, publishing and status reports) and
//! keeps them running until shutdown. Every job is also available as a
//! single step for callers that drive the pipeline themselves.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use beacon_controller::{Controller, ControllerError, Method};
use beacon_queue::{Queue, QueueError};
use beacon_uplink::UplinkClient;

mod config;
mod status;
mod tasks;

pub use config::*;
pub use status::{ConnectionState, LogStatus, StatusSink};

use tasks::every;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Controller(#[from] ControllerError),
}

/// What a publish cycle did with the pending records
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Nothing was pending
    Idle,

    /// Records were delivered and removed from the queue
    Sent { records: usize, dropped: usize },

    /// Records were returned to the queue for a later cycle
    Deferred { records: usize },
}

/// Owns the controllers and the uplink and drives the pipeline between
/// them
#[derive(Clone)]
pub struct Scheduler {
    controllers: Vec<Arc<Controller>>,
    queue: Queue,
    uplink: Arc<UplinkClient>,
    status: Arc<dyn StatusSink>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        controllers: Vec<Arc<Controller>>,
        queue: Queue,
        uplink: Arc<UplinkClient>,
        status: Arc<dyn StatusSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            controllers,
            queue,
            uplink,
            status,
            config,
        }
    }

    pub fn controllers(&self) -> &[Arc<Controller>] {
        &self.controllers
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Reload the inventory of every controller
    pub async fn refresh_inventories(&self) {
        info!("refreshing controller inventories");
        self.for_each_controller(|c| async move { c.refresh_inventory().await.map(|_| ()) })
            .await;
    }

    pub async fn refresh_sessions(&self) {
        info!("refreshing session ids");
        self.for_each_controller(|c| async move { c.refresh_session().await.map(|_| ()) })
            .await;
    }

    pub async fn touch_sessions(&self) {
        debug!("touching controller sessions");
        self.for_each_controller(|c| async move { c.touch_session().await })
            .await;
    }

    /// Read every point group of a controller into the queue
    ///
    /// The inventory is loaded first if the controller has none yet.
    /// Returns the number of stored responses.
    #[instrument(skip_all, fields(controller = controller.name()), err)]
    pub async fn poll_points_once(&self, controller: &Controller) -> Result<usize, SchedulerError> {
        if controller.inventory().await.is_empty() {
            if let Err(e) = controller.refresh_inventory().await {
                warn!("cannot poll without inventory: {e}");
            }
        }

        let start = tokio::time::Instant::now();
        let inventory = controller.inventory().await;
        let mut stored = 0;
        for group in inventory.groups() {
            let responses = controller.fetch_point_values(group).await?;
            stored += self
                .queue
                .append(responses, controller.address(), Method::GetPointValues.as_str())
                .await?;
            tokio::time::sleep(controller.request_delay()).await;
        }

        info!(
            stored,
            "finished polling in {:.2}s",
            start.elapsed().as_secs_f64()
        );
        Ok(stored)
    }

    pub async fn poll_alarms_once(&self) -> Result<usize, SchedulerError> {
        self.store_from_each(Method::GetAlarms, |c| async move { c.fetch_alarms().await })
            .await
    }

    /// Store the raw inventory of every controller
    pub async fn snapshot_inventories_once(&self) -> Result<usize, SchedulerError> {
        self.store_from_each(Method::GetSystemInventory, |c| async move {
            c.fetch_inventory().await
        })
        .await
    }

    /// Trim the queue back under its limit, returning the removed count
    pub async fn maintain_once(&self) -> Result<usize, SchedulerError> {
        let removed = self
            .queue
            .trim(self.config.max_queued_records, self.config.trim_batch_size)
            .await?;
        Ok(removed)
    }

    /// Forward everything pending to the uplink
    ///
    /// Provisions first when disconnected. The records claimed by this
    /// cycle are deleted only after the uplink accepted all of them,
    /// otherwise they are released.
    #[instrument(skip_all, err)]
    pub async fn publish_once(&self) -> Result<PublishOutcome, SchedulerError> {
        if !self.uplink.is_connected() {
            if let Err(e) = self.uplink.provision().await {
                debug!("not able to connect to the uplink: {e}");
            }
        }

        let records = self.queue.claim_pending().await?;
        if records.is_empty() {
            debug!("no records to send");
            return Ok(PublishOutcome::Idle);
        }

        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        match self.uplink.send(&records).await {
            Ok(report) => {
                self.queue.delete_claimed(&ids).await?;
                info!(
                    records = report.records,
                    envelopes = report.envelopes,
                    "sent telemetry"
                );
                Ok(PublishOutcome::Sent {
                    records: report.records,
                    dropped: report.dropped.len(),
                })
            }
            Err(e) => {
                let records = self.queue.release_claimed(&ids).await?;
                debug!(records, "released records: {e}");
                Ok(PublishOutcome::Deferred { records })
            }
        }
    }

    pub async fn report_status_once(&self) {
        let state = ConnectionState::from(self.uplink.is_connected());
        let identity = self.uplink.identity().await;
        let hub = identity.as_ref().map(|id| id.hub.as_str());
        self.status.connection(state, hub, Utc::now()).await;
    }

    /// Report uplink state changes as they happen, between the periodic
    /// status reports
    async fn report_connection_changes(&self) {
        let mut state = self.uplink.subscribe();
        while state.changed().await.is_ok() {
            let connected = *state.borrow_and_update();
            debug!(connected, "uplink state changed");
            self.report_status_once().await;
        }
    }

    pub async fn report_controllers_once(&self) {
        let summaries = join_all(self.controllers.iter().map(|c| c.summary())).await;
        self.status.controllers(&summaries).await;
    }

    async fn for_each_controller<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<Controller>) -> Fut,
        Fut: Future<Output = Result<(), ControllerError>>,
    {
        let results = join_all(self.controllers.iter().cloned().map(|c| {
            let fut = f(c.clone());
            async move { (c, fut.await) }
        }))
        .await;

        for (controller, res) in results {
            if let Err(e) = res {
                warn!(controller = controller.name(), "{e}");
            }
        }
    }

    async fn store_from_each<F, Fut>(&self, method: Method, f: F) -> Result<usize, SchedulerError>
    where
        F: Fn(Arc<Controller>) -> Fut,
        Fut: Future<Output = Result<Vec<serde_json::Value>, ControllerError>>,
    {
        let mut stored = 0;
        for controller in &self.controllers {
            let responses = f(controller.clone()).await?;
            debug!(controller = controller.name(), "storing {method} data");
            stored += self
                .queue
                .append(responses, controller.address(), method.as_str())
                .await?;
        }
        Ok(stored)
    }

    /// Run every periodic task until `shutdown` resolves
    ///
    /// Failing iterations are logged and retried on the next tick. The
    /// uplink is disconnected before returning.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let mut tasks = JoinSet::new();

        let this = self.clone();
        tasks.spawn(every("inventory refresh", INVENTORY_REFRESH, move || {
            let this = this.clone();
            async move { this.refresh_inventories().await }
        }));

        let this = self.clone();
        tasks.spawn(every("session refresh", SESSION_REFRESH, move || {
            let this = this.clone();
            async move { this.refresh_sessions().await }
        }));

        let this = self.clone();
        tasks.spawn(every("session heartbeat", SESSION_HEARTBEAT, move || {
            let this = this.clone();
            async move { this.touch_sessions().await }
        }));

        for controller in &self.controllers {
            let this = self.clone();
            let controller = controller.clone();
            let period = Period {
                delay: std::time::Duration::ZERO,
                every: controller.poll_interval(),
            };
            tasks.spawn(every("point polling", period, move || {
                let this = this.clone();
                let controller = controller.clone();
                async move { log_failure(this.poll_points_once(&controller).await) }
            }));
        }

        let this = self.clone();
        tasks.spawn(every("alarm polling", ALARM_POLLING, move || {
            let this = this.clone();
            async move { log_failure(this.poll_alarms_once().await) }
        }));

        let this = self.clone();
        tasks.spawn(every("inventory snapshot", INVENTORY_SNAPSHOT, move || {
            let this = this.clone();
            async move { log_failure(this.snapshot_inventories_once().await) }
        }));

        let this = self.clone();
        tasks.spawn(every("queue maintenance", QUEUE_MAINTENANCE, move || {
            let this = this.clone();
            async move { log_failure(this.maintain_once().await) }
        }));

        let this = self.clone();
        let publish = Period {
            delay: std::time::Duration::ZERO,
            every: self.config.publish_interval,
        };
        tasks.spawn(every("publish", publish, move || {
            let this = this.clone();
            async move { log_failure(this.publish_once().await) }
        }));

        let this = self.clone();
        tasks.spawn(every("status report", STATUS_REPORT, move || {
            let this = this.clone();
            async move { this.report_status_once().await }
        }));

        let this = self.clone();
        tasks.spawn(async move { this.report_connection_changes().await });

        let this = self.clone();
        tasks.spawn(every("controller summary", CONTROLLER_SUMMARY, move || {
            let this = this.clone();
            async move { this.report_controllers_once().await }
        }));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(res) = tasks.join_next() => {
                    if let Err(e) = res {
                        error!("task stopped unexpectedly: {e}");
                    }
                }
            }
        }

        info!("shutting down");
        tasks.shutdown().await;
        self.uplink.disconnect().await;
    }
}

fn log_failure<T>(res: Result<T, SchedulerError>) {
    if let Err(e) = res {
        error!("{e}");
    }
}
