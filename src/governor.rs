//! Async governor service.
//!
//! Owns the [`QualityController`] behind a mutex so lifecycle calls, rate
//! reports and the periodic tasks are serialized onto one writer. Every
//! mutation republishes an [`EffectiveParams`] snapshot through a `watch`
//! channel; renderers read that snapshot and never take the lock.
//!
//! The tick and flush tasks run only while a workload is active and the
//! governor is in the foreground. `on_background` stops both and waits for
//! them to exit before flushing and persisting.

use crate::analytics::{AnalyticsSink, FlushReason};
use crate::config::{GovernorConfig, QualityMode};
use crate::controller::{DebugOverrides, EffectiveParams, QualityController};
use crate::metrics::{GovernorMetrics, MetricsSnapshot};
use crate::store::ProfileStore;
use crate::thermal::DeviceContext;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Full status reported over IPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorStatus {
    pub params: EffectiveParams,
    pub overrides: DebugOverrides,
    pub suspended: bool,
    pub tasks_running: bool,
    pub persistent: bool,
    pub metrics: MetricsSnapshot,
}

struct PeriodicTasks {
    shutdown: watch::Sender<bool>,
    tick: JoinHandle<()>,
    flush: JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
    tasks: Option<PeriodicTasks>,
    suspended: bool,
}

/// Shared, cloneable handle pieces used by the periodic tasks.
#[derive(Clone)]
struct Shared {
    controller: Arc<Mutex<QualityController>>,
    params: Arc<watch::Sender<EffectiveParams>>,
}

impl Shared {
    async fn with_controller<R>(&self, f: impl FnOnce(&mut QualityController) -> R) -> R {
        let mut controller = self.controller.lock().await;
        let result = f(&mut controller);
        self.params.send_replace(controller.effective_params());
        result
    }
}

/// Async front of the governor.
pub struct Governor {
    shared: Shared,
    params_rx: watch::Receiver<EffectiveParams>,
    metrics: Arc<GovernorMetrics>,
    lifecycle: Mutex<Lifecycle>,
    tick_interval: Duration,
    flush_interval: Duration,
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

impl Governor {
    pub fn new(
        config: GovernorConfig,
        context: Arc<dyn DeviceContext>,
        store: ProfileStore,
        analytics: Arc<dyn AnalyticsSink>,
        overrides: DebugOverrides,
    ) -> Self {
        let tick_interval = config.tick_interval();
        let flush_interval = config.flush_interval();
        let controller = QualityController::new(config, context, store, analytics, overrides);
        let metrics = controller.metrics();
        let (params_tx, params_rx) = watch::channel(controller.effective_params());

        Self {
            shared: Shared {
                controller: Arc::new(Mutex::new(controller)),
                params: Arc::new(params_tx),
            },
            params_rx,
            metrics,
            lifecycle: Mutex::new(Lifecycle::default()),
            tick_interval,
            flush_interval,
        }
    }

    /// Latest published parameters. Never waits on the writer.
    pub fn effective(&self) -> EffectiveParams {
        self.params_rx.borrow().clone()
    }

    /// Receiver that wakes on every publication.
    pub fn subscribe(&self) -> watch::Receiver<EffectiveParams> {
        self.params_rx.clone()
    }

    pub fn metrics(&self) -> Arc<GovernorMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Activate a workload and start the periodic tasks.
    pub async fn set_active_workload(&self, workload_id: &str) {
        let mut lifecycle = self.lifecycle.lock().await;
        self.shared
            .with_controller(|c| c.set_active_workload(workload_id, now()))
            .await;
        if lifecycle.suspended {
            debug!("Suspended, periodic tasks start on foreground");
        } else {
            self.ensure_tasks(&mut lifecycle);
        }
    }

    pub async fn on_foreground(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        lifecycle.suspended = false;
        let active = self
            .shared
            .with_controller(|c| {
                c.on_foreground(now());
                c.active_workload().is_some()
            })
            .await;
        if active {
            self.ensure_tasks(&mut lifecycle);
        }
    }

    /// Stop the periodic tasks, then flush and persist.
    ///
    /// Returns only after both tasks have exited, so no tick runs while
    /// suspended. A second call while already suspended does nothing.
    pub async fn on_background(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.suspended {
            debug!("Already suspended");
            return;
        }
        Self::stop_tasks(&mut lifecycle).await;
        lifecycle.suspended = true;
        self.shared.with_controller(|c| c.on_background(now())).await;
    }

    pub async fn report_measured_rate(&self, observed: f64) {
        self.shared
            .with_controller(|c| c.report_measured_rate(observed))
            .await;
    }

    pub async fn set_overrides(&self, overrides: DebugOverrides) {
        self.shared.with_controller(|c| c.set_overrides(overrides)).await;
    }

    pub async fn set_mode(&self, mode: QualityMode) {
        self.shared.with_controller(|c| c.set_mode(mode)).await;
    }

    /// Run one tick immediately, outside the schedule. Ignored while
    /// suspended.
    pub async fn tick_now(&self) {
        let lifecycle = self.lifecycle.lock().await;
        if lifecycle.suspended {
            debug!("Suspended, skipping tick");
            return;
        }
        self.shared.with_controller(|c| c.tick(now())).await;
    }

    pub async fn status(&self) -> GovernorStatus {
        let (suspended, tasks_running) = {
            let lifecycle = self.lifecycle.lock().await;
            (lifecycle.suspended, lifecycle.tasks.is_some())
        };
        let controller = self.shared.controller.lock().await;
        GovernorStatus {
            params: controller.effective_params(),
            overrides: controller.overrides(),
            suspended,
            tasks_running,
            persistent: controller.store().is_persistent(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Stop the tasks and persist; used on daemon exit.
    pub async fn shutdown(&self) {
        info!("Governor shutting down");
        self.on_background().await;
    }

    fn ensure_tasks(&self, lifecycle: &mut Lifecycle) {
        if lifecycle.tasks.is_some() {
            return;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let tick = tokio::spawn(run_periodic(
            "tick",
            self.tick_interval,
            self.shared.clone(),
            shutdown_rx.clone(),
            |c| c.tick(now()),
        ));
        let flush = tokio::spawn(run_periodic(
            "flush",
            self.flush_interval,
            self.shared.clone(),
            shutdown_rx,
            |c| c.flush_session(FlushReason::Periodic, now()),
        ));
        info!(
            tick_secs = self.tick_interval.as_secs(),
            flush_secs = self.flush_interval.as_secs(),
            "Periodic tasks started"
        );
        lifecycle.tasks = Some(PeriodicTasks {
            shutdown,
            tick,
            flush,
        });
    }

    async fn stop_tasks(lifecycle: &mut Lifecycle) {
        let Some(tasks) = lifecycle.tasks.take() else {
            return;
        };
        let _ = tasks.shutdown.send(true);
        let (tick, flush) = tokio::join!(tasks.tick, tasks.flush);
        for (name, result) in [("tick", tick), ("flush", flush)] {
            if let Err(e) = result {
                warn!("Periodic {} task ended abnormally: {}", name, e);
            }
        }
        info!("Periodic tasks stopped");
    }
}

/// Run `step` every `period` until shutdown is signalled.
///
/// The first run happens one full period after start. Shutdown is checked
/// before every step; a step that has started always completes.
async fn run_periodic(
    name: &'static str,
    period: Duration,
    shared: Shared,
    mut shutdown_rx: watch::Receiver<bool>,
    step: fn(&mut QualityController),
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Periodic {} task shutting down", name);
                    break;
                }
            }
            _ = ticker.tick() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                shared.with_controller(step).await;
            }
        }
    }
}
