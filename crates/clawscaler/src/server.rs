//! Status and metrics HTTP listener.
//!
//! Routes:
//! - `GET /healthz` liveness
//! - `GET /metrics` Prometheus text exposition of the autoscaler telemetry
//! - `GET /status` JSON status of every workload
//! - `POST /workloads/{workload}/resume` resumes a suspended workload

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use claw_autoscaler::{AutoscalerError, AutoscalerMetrics, ManagerHandle, WorkloadId, WorkloadStatus};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{Result, ScalerError};

const JSON: &str = "application/json";
const TEXT: &str = "text/plain; charset=utf-8";

/// A workload status as served on `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    /// The reconciler status.
    #[serde(flatten)]
    pub status: WorkloadStatus,
    /// No successful tick within the staleness threshold.
    pub stale: bool,
}

#[derive(Debug, Clone)]
struct ServerState {
    handle: ManagerHandle,
    stale_after: Duration,
}

/// A bound status listener.
#[derive(Debug)]
pub struct StatusServer {
    listener: TcpListener,
    state: ServerState,
}

impl StatusServer {
    /// Binds the listener.
    ///
    /// # Errors
    ///
    /// Returns `Server` if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, handle: ManagerHandle, stale_after: Duration) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| ScalerError::Server {
            reason: format!("failed to bind {addr}: {e}"),
        })?;
        Ok(Self {
            listener,
            state: ServerState {
                handle,
                stale_after,
            },
        })
    }

    /// The bound address (useful when binding to port 0).
    ///
    /// # Errors
    ///
    /// Returns an IO error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves requests until `shutdown` turns true.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "status server listening");
        }

        loop {
            tokio::select! {
                accept = self.listener.accept() => {
                    match accept {
                        Ok((stream, peer)) => {
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let svc = service_fn(move |req| {
                                    let state = state.clone();
                                    async move { Ok::<_, hyper::Error>(route(req, &state).await) }
                                });

                                if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                                    if !e.is_incomplete_message() {
                                        warn!(peer = %peer, error = %e, "connection error");
                                    }
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("status server shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn error_body(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

async fn route(req: Request<Incoming>, state: &ServerState) -> Response<Full<Bytes>> {
    let path = req.uri().path().trim_end_matches('/');
    debug!(method = %req.method(), path, "status request");

    match (req.method(), path) {
        (&Method::GET, "/healthz") => respond(StatusCode::OK, TEXT, "ok\n"),
        (&Method::GET, "/metrics") => respond(
            StatusCode::OK,
            AutoscalerMetrics::content_type(),
            state.handle.metrics().encode(),
        ),
        (&Method::GET, "/status") => status(state).await,
        (&Method::POST, p) => match resume_target(p) {
            Some(workload) => resume(state, workload).await,
            None => not_found(p),
        },
        (_, p) => not_found(p),
    }
}

fn not_found(path: &str) -> Response<Full<Bytes>> {
    respond(StatusCode::NOT_FOUND, JSON, error_body(&format!("no route for {path}")))
}

fn resume_target(path: &str) -> Option<WorkloadId> {
    let workload = path.strip_prefix("/workloads/")?.strip_suffix("/resume")?;
    (!workload.is_empty() && !workload.contains('/')).then(|| WorkloadId::new(workload))
}

async fn status(state: &ServerState) -> Response<Full<Bytes>> {
    let statuses = match state.handle.statuses().await {
        Ok(statuses) => statuses,
        Err(e) => return respond(StatusCode::SERVICE_UNAVAILABLE, JSON, error_body(&e.to_string())),
    };

    let now = Utc::now();
    let entries: Vec<StatusEntry> = statuses
        .into_iter()
        .map(|status| {
            let stale = status.is_stale(now, state.stale_after);
            StatusEntry { status, stale }
        })
        .collect();

    match serde_json::to_string(&entries) {
        Ok(body) => respond(StatusCode::OK, JSON, body),
        Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, JSON, error_body(&e.to_string())),
    }
}

async fn resume(state: &ServerState, workload: WorkloadId) -> Response<Full<Bytes>> {
    match state.handle.resume(workload.clone()).await {
        Ok(()) => {
            info!(workload = %workload, "resume requested");
            respond(StatusCode::ACCEPTED, JSON, serde_json::json!({ "resumed": workload.as_str() }).to_string())
        }
        Err(e @ AutoscalerError::WorkloadNotFound { .. }) => {
            respond(StatusCode::NOT_FOUND, JSON, error_body(&e.to_string()))
        }
        Err(e) => respond(StatusCode::SERVICE_UNAVAILABLE, JSON, error_body(&e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use claw_autoscaler::{
        AutoscalerManager, ControlPlane, InMemoryControlPlane, LoadReport, MetricTarget,
        ReconcilerConfig, ScalingPolicy,
    };
    use claw_metrics::{InMemorySource, MetricSource, Sampler, Selector};

    fn policy(workload: &str) -> ScalingPolicy {
        let selector = Selector::parse(&format!("cpu_usage{{app=\"{workload}\"}}")).unwrap();
        ScalingPolicy::builder(workload)
            .min_replicas(1)
            .max_replicas(4)
            .target(MetricTarget::new("cpu", selector, 50.0))
            .build()
            .unwrap()
    }

    async fn start() -> (SocketAddr, ManagerHandle, watch::Sender<bool>) {
        let source = Arc::new(InMemorySource::new());
        let control_plane = Arc::new(InMemoryControlPlane::new());
        control_plane.insert(&WorkloadId::new("web"), 2);
        let (manager, handle, _conflicts) = AutoscalerManager::new(
            Sampler::new(source as Arc<dyn MetricSource>),
            control_plane as Arc<dyn ControlPlane>,
            ReconcilerConfig::default(),
            AutoscalerMetrics::new(),
        );
        tokio::spawn(manager.run());
        handle
            .reload(LoadReport {
                version: 1,
                policies: vec![policy("web")],
                rejected: Vec::new(),
            })
            .await
            .unwrap();

        let server = StatusServer::bind(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            handle.clone(),
            Duration::from_secs(45),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(server.serve(shutdown_rx));
        (addr, handle, shutdown_tx)
    }

    mod routing {
        use super::*;

        #[test]
        fn resume_target_parses_workload() {
            assert_eq!(
                resume_target("/workloads/web/resume"),
                Some(WorkloadId::new("web"))
            );
            assert_eq!(resume_target("/workloads//resume"), None);
            assert_eq!(resume_target("/workloads/a/b/resume"), None);
            assert_eq!(resume_target("/status"), None);
        }

        #[test]
        fn respond_sets_content_type() {
            let response = respond(StatusCode::OK, JSON, "{}");
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[CONTENT_TYPE], JSON);
        }
    }

    mod http {
        use super::*;

        #[tokio::test]
        async fn serves_health_metrics_and_status() {
            let (addr, handle, shutdown) = start().await;
            let client = reqwest::Client::new();

            let health = client.get(format!("http://{addr}/healthz")).send().await.unwrap();
            assert_eq!(health.status(), reqwest::StatusCode::OK);

            let metrics = client.get(format!("http://{addr}/metrics")).send().await.unwrap();
            assert_eq!(metrics.status(), reqwest::StatusCode::OK);
            assert!(metrics.text().await.unwrap().contains("clawscaler_"));

            let status = client.get(format!("http://{addr}/status")).send().await.unwrap();
            assert_eq!(status.status(), reqwest::StatusCode::OK);
            let body: serde_json::Value = status.json().await.unwrap();
            let entries = body.as_array().unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0]["workload"], "web");
            assert!(entries[0]["stale"].is_boolean());

            shutdown.send(true).unwrap();
            handle.shutdown().await;
        }

        #[tokio::test]
        async fn unknown_route_is_404() {
            let (addr, handle, shutdown) = start().await;
            let client = reqwest::Client::new();

            let response = client.get(format!("http://{addr}/nope")).send().await.unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

            let response = client
                .post(format!("http://{addr}/workloads/missing/resume"))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

            let response = client
                .post(format!("http://{addr}/workloads/web/resume"))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

            shutdown.send(true).unwrap();
            handle.shutdown().await;
        }

        #[tokio::test]
        async fn stopped_manager_is_503() {
            let (addr, handle, shutdown) = start().await;
            handle.shutdown().await;
            tokio::time::sleep(Duration::from_millis(50)).await;

            let response = reqwest::get(format!("http://{addr}/status")).await.unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
            shutdown.send(true).unwrap();
        }
    }
}
