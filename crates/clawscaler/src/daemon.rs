//! Daemon wiring.
//!
//! Builds the metric source and control plane from [`DaemonConfig`], starts
//! the autoscaler manager and the status listener, and reloads the policy
//! document on `SIGHUP`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use claw_autoscaler::{
    load_policies, AutoscalerManager, AutoscalerMetrics, ConflictReport, ControlPlane,
    InMemoryControlPlane, LoadReport, ManagerHandle, ReloadSummary,
};
use claw_metrics::{InMemorySource, MetricSource, PrometheusSource, Sampler};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ControlPlaneConfig, DaemonConfig, SourceConfig};
use crate::control_plane::HttpControlPlane;
use crate::error::{Result, ScalerError};
use crate::server::StatusServer;

/// In-memory replica store seeded from the config.
#[derive(Debug)]
struct DryRun {
    control_plane: Arc<InMemoryControlPlane>,
    initial: BTreeMap<String, u32>,
}

impl DryRun {
    /// Registers workloads the store does not know yet.
    fn seed(&self, report: &LoadReport) {
        for policy in &report.policies {
            if self.control_plane.current(&policy.workload).is_some() {
                continue;
            }
            let replicas = self
                .initial
                .get(policy.workload.as_str())
                .copied()
                .unwrap_or(policy.min_replicas);
            self.control_plane.insert(&policy.workload, replicas);
        }
    }
}

/// A configured, not yet started daemon.
pub struct Daemon {
    config: DaemonConfig,
    source: Arc<dyn MetricSource>,
    control_plane: Arc<dyn ControlPlane>,
    dry_run: Option<DryRun>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .field("source", &self.source.name())
            .field("control_plane", &self.control_plane.name())
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Builds the daemon's source and control plane.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or a client cannot be built.
    pub fn new(config: DaemonConfig) -> Result<Self> {
        config.validate()?;

        let source: Arc<dyn MetricSource> = match &config.source {
            SourceConfig::Prometheus(prometheus) => Arc::new(PrometheusSource::new(prometheus.clone())?),
            SourceConfig::InMemory => Arc::new(InMemorySource::new()),
        };

        let (control_plane, dry_run): (Arc<dyn ControlPlane>, _) = match &config.control_plane {
            ControlPlaneConfig::Http {
                base_url,
                bearer_token,
                timeout_secs,
            } => (
                Arc::new(HttpControlPlane::new(
                    base_url.clone(),
                    bearer_token.clone(),
                    std::time::Duration::from_secs(*timeout_secs),
                )?),
                None,
            ),
            ControlPlaneConfig::InMemory { replicas } => {
                let control_plane = Arc::new(InMemoryControlPlane::new());
                let dry_run = DryRun {
                    control_plane: Arc::clone(&control_plane),
                    initial: replicas.clone(),
                };
                (control_plane as Arc<dyn ControlPlane>, Some(dry_run))
            }
        };

        Ok(Self {
            config,
            source,
            control_plane,
            dry_run,
            shutdown: CancellationToken::new(),
        })
    }

    /// Replaces the metric source.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn MetricSource>) -> Self {
        self.source = source;
        self
    }

    /// Replaces the control plane with an in-memory store the caller owns.
    #[must_use]
    pub fn with_control_plane(mut self, control_plane: Arc<InMemoryControlPlane>) -> Self {
        self.dry_run = Some(DryRun {
            control_plane: Arc::clone(&control_plane),
            initial: BTreeMap::new(),
        });
        self.control_plane = control_plane;
        self
    }

    /// Token that stops the daemon when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Loads policies and starts every task.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy document cannot be loaded or the
    /// status listener cannot be bound.
    pub async fn start(self) -> Result<RunningDaemon> {
        let report = load_policies(&self.config.policies_path)?;
        info!(
            path = %self.config.policies_path.display(),
            policies = report.policies.len(),
            source = self.source.name(),
            control_plane = self.control_plane.name(),
            "starting clawscaler"
        );
        if let Some(dry_run) = &self.dry_run {
            dry_run.seed(&report);
        }

        let sampler = Sampler::new(self.source).with_timeout(self.config.query_timeout());
        let (manager, handle, conflicts) = AutoscalerManager::new(
            sampler,
            self.control_plane,
            self.config.reconciler_config(),
            AutoscalerMetrics::new(),
        );
        let manager = manager.with_shutdown(self.shutdown.child_token());
        let manager_task = tokio::spawn(manager.run());

        let summary = handle.reload(report).await?;
        log_summary(&summary);

        let conflict_task = tokio::spawn(log_conflicts(conflicts));

        let (server_tx, server_rx) = watch::channel(false);
        let mut status_addr = None;
        let mut server_task = None;
        if let Some(addr) = self.config.listen_addr {
            let server = match StatusServer::bind(addr, handle.clone(), self.config.stale_after()).await {
                Ok(server) => server,
                Err(e) => {
                    self.shutdown.cancel();
                    let _ = manager_task.await;
                    return Err(e);
                }
            };
            status_addr = Some(server.local_addr()?);
            server_task = Some(tokio::spawn(server.serve(server_rx)));
        }

        Ok(RunningDaemon {
            config: self.config,
            handle,
            dry_run: self.dry_run,
            shutdown: self.shutdown,
            status_addr,
            server_tx,
            server_task,
            manager_task,
            conflict_task,
        })
    }

    /// Starts the daemon and runs it until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if startup fails.
    pub async fn run(self) -> Result<()> {
        self.start().await?.wait().await
    }
}

/// A started daemon.
#[derive(Debug)]
pub struct RunningDaemon {
    config: DaemonConfig,
    handle: ManagerHandle,
    dry_run: Option<DryRun>,
    shutdown: CancellationToken,
    status_addr: Option<SocketAddr>,
    server_tx: watch::Sender<bool>,
    server_task: Option<JoinHandle<()>>,
    manager_task: JoinHandle<()>,
    conflict_task: JoinHandle<()>,
}

impl RunningDaemon {
    /// Handle to the autoscaler manager.
    #[must_use]
    pub const fn handle(&self) -> &ManagerHandle {
        &self.handle
    }

    /// Address of the status listener, if enabled.
    #[must_use]
    pub const fn status_addr(&self) -> Option<SocketAddr> {
        self.status_addr
    }

    /// Re-reads the policy document and applies it.
    ///
    /// A document that cannot be loaded leaves the running policies in place.
    ///
    /// # Errors
    ///
    /// Returns the load error, or `ManagerStopped`.
    pub async fn reload(&self) -> Result<ReloadSummary> {
        let report = match load_policies(&self.config.policies_path) {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "policy reload failed, keeping current policies");
                return Err(e.into());
            }
        };
        if let Some(dry_run) = &self.dry_run {
            dry_run.seed(&report);
        }
        let summary = match self.handle.reload(report).await {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "policy reload not applied");
                return Err(e.into());
            }
        };
        log_summary(&summary);
        Ok(summary)
    }

    /// Runs until the shutdown token is cancelled, reloading on `SIGHUP`.
    ///
    /// # Errors
    ///
    /// Returns `Server` if a task panicked.
    pub async fn wait(self) -> Result<()> {
        let mut hangup = Hangup::new();
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = self.manager_stopped() => {
                    warn!("autoscaler manager exited");
                    break;
                }
                () = hangup.recv() => {
                    info!("SIGHUP received, reloading policies");
                    if self.reload().await.is_err() {
                        warn!("SIGHUP reload failed, policies unchanged");
                    }
                }
            }
        }
        self.stop().await
    }

    async fn manager_stopped(&self) {
        self.handle.closed().await;
    }

    async fn stop(self) -> Result<()> {
        info!("shutting down clawscaler");
        self.shutdown.cancel();
        let _ = self.server_tx.send(true);

        let mut failed = Vec::new();
        if let Err(e) = self.manager_task.await {
            failed.push(format!("manager: {e}"));
        }
        if let Some(task) = self.server_task {
            if let Err(e) = task.await {
                failed.push(format!("status server: {e}"));
            }
        }
        // The conflict channel closes once the manager is gone.
        if let Err(e) = self.conflict_task.await {
            failed.push(format!("conflict log: {e}"));
        }

        if failed.is_empty() {
            info!("clawscaler stopped");
            Ok(())
        } else {
            Err(ScalerError::Server {
                reason: failed.join("; "),
            })
        }
    }
}

fn log_summary(summary: &ReloadSummary) {
    info!(
        added = summary.added.len(),
        updated = summary.updated.len(),
        removed = summary.removed.len(),
        rejected = summary.rejected.len(),
        "policies applied"
    );
    for rejected in &summary.rejected {
        warn!(workload = %rejected.workload, reason = %rejected.reason, "policy rejected");
    }
}

async fn log_conflicts(mut conflicts: mpsc::Receiver<ConflictReport>) {
    while let Some(report) = conflicts.recv().await {
        warn!(
            workload = %report.workload,
            expected = report.expected,
            found = report.found,
            decision = ?report.decision,
            "replica count changed outside the autoscaler"
        );
    }
}

/// `SIGHUP` listener; never fires where unsupported.
struct Hangup {
    #[cfg(unix)]
    signal: Option<tokio::signal::unix::Signal>,
}

impl Hangup {
    fn new() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let signal = match signal(SignalKind::hangup()) {
                Ok(signal) => Some(signal),
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGHUP, reload disabled");
                    None
                }
            };
            Self { signal }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            if let Some(signal) = self.signal.as_mut() {
                if signal.recv().await.is_some() {
                    return;
                }
                self.signal = None;
            }
        }
        std::future::pending::<()>().await;
    }
}

/// Resolves on Ctrl-C or, on unix, `SIGTERM`.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    if matches!(tokio::signal::ctrl_c().await, Ok(())) {
        info!("received SIGINT");
    }
}
