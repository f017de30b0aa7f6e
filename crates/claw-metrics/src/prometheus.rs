//! Prometheus HTTP API source.
//!
//! Queries `GET /api/v1/query_range` with a rendered selector and converts the
//! matrix result into [`RawSeries`]. Rates and averages are computed locally
//! by [`crate::aggregate`], so only plain selectors are sent.
//!
//! # Example
//!
//! ```rust,no_run
//! use claw_metrics::prometheus::{PrometheusConfig, PrometheusSource};
//!
//! let source = PrometheusSource::new(PrometheusConfig::new("http://prometheus:9090")).unwrap();
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MetricsError, Result};
use crate::selector::Selector;
use crate::source::{BoxFuture, MetricSource, RawSeries};
use crate::types::{LabelSet, Observation, TimeRange};

/// Connection settings for a Prometheus server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Base URL, e.g. `http://prometheus-server.prometheus:80`.
    pub url: String,
    /// Resolution step for range queries in seconds.
    #[serde(default = "default_step_secs")]
    pub step_secs: u64,
    /// Optional bearer token.
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

const fn default_step_secs() -> u64 {
    15
}

const fn default_request_timeout_secs() -> u64 {
    10
}

impl PrometheusConfig {
    /// Creates a config with default step and timeout.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            step_secs: default_step_secs(),
            bearer_token: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// [`MetricSource`] talking to the Prometheus HTTP API.
#[derive(Debug, Clone)]
pub struct PrometheusSource {
    client: reqwest::Client,
    config: PrometheusConfig,
}

impl PrometheusSource {
    /// Creates a source.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::MetricSource` if the URL is empty or the HTTP
    /// client cannot be built.
    pub fn new(config: PrometheusConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(MetricsError::MetricSource {
                reason: "prometheus url cannot be empty".into(),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| MetricsError::MetricSource {
                reason: format!("failed to build http client: {e}"),
            })?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/v1/query_range", self.config.url.trim_end_matches('/'))
    }

    async fn fetch(&self, selector: &Selector, range: TimeRange) -> Result<Vec<RawSeries>> {
        let query = selector.to_string();
        let params = [
            ("query", query.clone()),
            ("start", millis_to_secs_string(range.start)),
            ("end", millis_to_secs_string(range.end)),
            ("step", format!("{}s", self.config.step_secs.max(1))),
        ];

        let mut request = self.client.get(self.endpoint()).query(&params);
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| MetricsError::MetricSource {
            reason: format!("request failed: {e}"),
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(MetricsError::MetricSource {
                reason: format!("authentication rejected ({status})"),
            });
        }

        let body = response.text().await.map_err(|e| MetricsError::MetricSource {
            reason: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() && status != StatusCode::BAD_REQUEST {
            return Err(MetricsError::MetricSource {
                reason: format!("unexpected status {status}"),
            });
        }

        let series = parse_query_range_response(&body)?;
        debug!(query = %query, series = series.len(), "prometheus range query");
        Ok(series)
    }
}

impl MetricSource for PrometheusSource {
    fn name(&self) -> &str {
        "prometheus"
    }

    fn query_range<'a>(
        &'a self,
        selector: &'a Selector,
        range: TimeRange,
    ) -> BoxFuture<'a, Result<Vec<RawSeries>>> {
        Box::pin(self.fetch(selector, range))
    }
}

#[allow(clippy::cast_precision_loss)]
fn millis_to_secs_string(millis: i64) -> String {
    format!("{:.3}", millis as f64 / 1000.0)
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<MatrixData>,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MatrixData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<MatrixSeries>,
}

#[derive(Debug, Deserialize)]
struct MatrixSeries {
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

/// Parses a `query_range` response body.
///
/// Non-finite sample values are skipped and the `__name__` label is dropped.
///
/// # Errors
///
/// Returns `MetricsError::MetricSource` for undecodable bodies, API errors and
/// non-matrix results.
#[allow(clippy::cast_possible_truncation)]
pub fn parse_query_range_response(body: &str) -> Result<Vec<RawSeries>> {
    let response: ApiResponse =
        serde_json::from_str(body).map_err(|e| MetricsError::MetricSource {
            reason: format!("invalid response body: {e}"),
        })?;

    if response.status != "success" {
        return Err(MetricsError::MetricSource {
            reason: format!(
                "query failed ({}): {}",
                response.error_type.unwrap_or_else(|| "unknown".into()),
                response.error.unwrap_or_default()
            ),
        });
    }

    let data = response.data.ok_or_else(|| MetricsError::MetricSource {
        reason: "response has no data".into(),
    })?;

    if data.result_type != "matrix" {
        return Err(MetricsError::MetricSource {
            reason: format!("expected matrix result, got {}", data.result_type),
        });
    }

    let mut series = Vec::with_capacity(data.result.len());
    for s in data.result {
        let labels: LabelSet = s
            .metric
            .into_iter()
            .filter(|(k, _)| k != "__name__")
            .collect();

        let mut observations = Vec::with_capacity(s.values.len());
        for (ts, raw) in s.values {
            match raw.parse::<f64>() {
                Ok(v) if v.is_finite() => {
                    observations.push(Observation::new((ts * 1000.0).round() as i64, v));
                }
                Ok(_) => {}
                Err(_) => warn!(labels = %labels, value = %raw, "skipping unparsable sample"),
            }
        }

        if !observations.is_empty() {
            series.push(RawSeries {
                labels,
                observations,
            });
        }
    }

    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_matrix_response() {
        let body = r#"{
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [
                    {
                        "metric": {"__name__": "http_requests_total", "app": "go-otel-sample-app", "kubernetes_pod_name": "go-1"},
                        "values": [[1700000000, "10"], [1700000015.5, "25"], [1700000030, "NaN"]]
                    },
                    {
                        "metric": {"app": "go-otel-sample-app", "kubernetes_pod_name": "go-2"},
                        "values": []
                    }
                ]
            }
        }"#;

        let series = parse_query_range_response(body).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].labels.get("__name__"), None);
        assert_eq!(series[0].labels.get("kubernetes_pod_name"), Some("go-1"));
        assert_eq!(
            series[0].observations,
            vec![
                Observation::new(1_700_000_000_000, 10.0),
                Observation::new(1_700_000_015_500, 25.0),
            ]
        );
    }

    #[test]
    fn api_error_is_source_error() {
        let body = r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#;
        let err = parse_query_range_response(body).unwrap_err();
        assert!(err.is_source_failure());
        assert!(err.to_string().contains("bad_data"));
    }

    #[test]
    fn vector_result_rejected() {
        let body = r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        assert!(parse_query_range_response(body).is_err());
    }

    #[test]
    fn garbage_body_rejected() {
        assert!(parse_query_range_response("<html>bad gateway</html>").is_err());
    }

    #[test]
    fn empty_url_rejected() {
        assert!(PrometheusSource::new(PrometheusConfig::new("  ")).is_err());
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        let source = PrometheusSource::new(PrometheusConfig::new("http://prom:9090/")).unwrap();
        assert_eq!(source.endpoint(), "http://prom:9090/api/v1/query_range");
    }

    #[tokio::test]
    async fn unreachable_server_is_source_error() {
        let mut config = PrometheusConfig::new("http://127.0.0.1:9");
        config.request_timeout_secs = 1;
        let source = PrometheusSource::new(config).unwrap();
        let selector = Selector::parse("up").unwrap();
        let err = source
            .query_range(&selector, TimeRange::new(0, 1_000).unwrap())
            .await
            .unwrap_err();
        assert!(err.is_source_failure());
    }
}
