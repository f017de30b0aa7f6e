//! HTTP workload control plane.
//!
//! Talks to a replica API of the form
//!
//! ```text
//! GET {base}/workloads/{workload}/replicas  -> {"replicas": 3, "generation": 7}
//! PUT {base}/workloads/{workload}/replicas  <- {"expected": 3, "replicas": 4}
//! ```
//!
//! A `PUT` whose `expected` no longer matches is answered with `409 Conflict`
//! and the current replica status.

use std::time::Duration;

use claw_autoscaler::{AutoscalerError, ControlPlane, ReplicaStatus, Result, WorkloadId};
use claw_metrics::BoxFuture;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Body of a replica update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaUpdate {
    /// Replica count the writer believes is current.
    pub expected: u32,
    /// New replica count.
    pub replicas: u32,
}

/// [`ControlPlane`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

fn control_plane_error(reason: impl Into<String>) -> AutoscalerError {
    AutoscalerError::ControlPlane {
        reason: reason.into(),
    }
}

impl HttpControlPlane {
    /// Creates a client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `ControlPlane` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| control_plane_error(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token,
        })
    }

    fn endpoint(&self, workload: &WorkloadId) -> String {
        format!("{}/workloads/{}/replicas", self.base_url, workload)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read(&self, workload: &WorkloadId) -> Result<ReplicaStatus> {
        let response = self
            .authorize(self.client.get(self.endpoint(workload)))
            .send()
            .await
            .map_err(|e| control_plane_error(format!("request failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(AutoscalerError::WorkloadNotFound {
                workload: workload.to_string(),
            }),
            status if status.is_success() => response
                .json::<ReplicaStatus>()
                .await
                .map_err(|e| control_plane_error(format!("invalid replica status: {e}"))),
            status => Err(control_plane_error(format!("unexpected status {status}"))),
        }
    }

    async fn write(&self, workload: &WorkloadId, expected: u32, desired: u32) -> Result<()> {
        let body = ReplicaUpdate {
            expected,
            replicas: desired,
        };
        let response = self
            .authorize(self.client.put(self.endpoint(workload)).json(&body))
            .send()
            .await
            .map_err(|e| control_plane_error(format!("request failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(AutoscalerError::WorkloadNotFound {
                workload: workload.to_string(),
            }),
            StatusCode::CONFLICT => {
                let current = response
                    .json::<ReplicaStatus>()
                    .await
                    .map_err(|e| control_plane_error(format!("invalid conflict body: {e}")))?;
                Err(AutoscalerError::Conflict {
                    workload: workload.to_string(),
                    expected,
                    found: current.replicas,
                })
            }
            status if status.is_success() => {
                debug!(workload = %workload, expected, desired, "replicas updated");
                Ok(())
            }
            status => Err(control_plane_error(format!("unexpected status {status}"))),
        }
    }
}

impl ControlPlane for HttpControlPlane {
    fn name(&self) -> &str {
        "http"
    }

    fn replicas<'a>(&'a self, workload: &'a WorkloadId) -> BoxFuture<'a, Result<ReplicaStatus>> {
        Box::pin(self.read(workload))
    }

    fn set_replicas<'a>(
        &'a self,
        workload: &'a WorkloadId,
        expected: u32,
        desired: u32,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.write(workload, expected, desired))
    }
}
