//! Series selectors of the form `metric{label="value",...}`.
//!
//! Only equality matchers are supported. Target labels for a workload are
//! merged into the selector before it is sent to a source.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, Result};
use crate::types::{LabelSet, MetricName};

/// Regex for the selector head: a metric name with an optional label block.
static SELECTOR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z_:][A-Za-z0-9_:]*)\s*(?:\{(.*)\})?\s*$")
        .unwrap_or_else(|_| unreachable!())
});

/// Regex for a single `key="value"` equality matcher.
static MATCHER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z_][A-Za-z0-9_]*)\s*=\s*"([^"]*)""#).unwrap_or_else(|_| unreachable!())
});

/// A parsed series selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Selector {
    /// Metric name.
    pub name: MetricName,
    /// Equality matchers.
    pub matchers: LabelSet,
}

impl Selector {
    /// Creates a selector matching every series of `name`.
    #[must_use]
    pub fn new(name: MetricName) -> Self {
        Self {
            name,
            matchers: LabelSet::new(),
        }
    }

    /// Parses a selector string.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::InvalidSelector` for anything other than a metric
    /// name followed by an optional block of `key="value"` matchers.
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |reason: &str| MetricsError::InvalidSelector {
            selector: text.to_string(),
            reason: reason.to_string(),
        };

        let caps = SELECTOR_REGEX
            .captures(text)
            .ok_or_else(|| invalid("expected metric{label=\"value\",...}"))?;

        let name = MetricName::new(&caps[1]).map_err(|e| invalid(&e.to_string()))?;
        let mut matchers = LabelSet::new();

        if let Some(body) = caps.get(2) {
            let body = body.as_str();
            for m in MATCHER_REGEX.captures_iter(body) {
                if matchers.get(&m[1]).is_some() {
                    return Err(invalid(&format!("duplicate matcher for label '{}'", &m[1])));
                }
                matchers.insert(&m[1], &m[2]);
            }

            let leftover = MATCHER_REGEX.replace_all(body, "");
            if leftover.chars().any(|c| !c.is_whitespace() && c != ',') {
                return Err(invalid("only equality matchers are supported"));
            }
        }

        Ok(Self { name, matchers })
    }

    /// Returns a copy with `labels` merged in. Labels in `labels` take precedence.
    #[must_use]
    pub fn with_labels(&self, labels: &LabelSet) -> Self {
        let mut merged = self.clone();
        for (k, v) in labels.iter() {
            merged.matchers.insert(k, v);
        }
        merged
    }

    /// Returns true if a series with this name and labels matches.
    #[must_use]
    pub fn matches(&self, name: &MetricName, labels: &LabelSet) -> bool {
        &self.name == name && self.matchers.is_subset_of(labels)
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.matchers.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}{}", self.name, self.matchers)
        }
    }
}

impl TryFrom<String> for Selector {
    type Error = MetricsError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Selector> for String {
    fn from(selector: Selector) -> Self {
        selector.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn parse_bare_name() {
        let sel = Selector::parse("pod_cpu_utilization").unwrap();
        assert_eq!(sel.name.as_str(), "pod_cpu_utilization");
        assert!(sel.matchers.is_empty());
    }

    #[test]
    fn parse_with_matchers() {
        let sel =
            Selector::parse(r#"http_requests_total{app="go-otel-sample-app", method="GET"}"#)
                .unwrap();
        assert_eq!(sel.name.as_str(), "http_requests_total");
        assert_eq!(sel.matchers.get("app"), Some("go-otel-sample-app"));
        assert_eq!(sel.matchers.get("method"), Some("GET"));
    }

    #[test_case("" ; "empty")]
    #[test_case("rate(x[1m])" ; "function call")]
    #[test_case(r#"x{app!="web"}"# ; "negative matcher")]
    #[test_case(r#"x{app=~"web.*"}"# ; "regex matcher")]
    #[test_case(r#"x{app="a",app="b"}"# ; "duplicate label")]
    #[test_case("x{app=web}" ; "unquoted value")]
    fn rejects_unsupported(text: &str) {
        assert!(matches!(
            Selector::parse(text),
            Err(MetricsError::InvalidSelector { .. })
        ));
    }

    #[test]
    fn merge_target_labels_and_render() {
        let sel = Selector::parse(r#"sample_app_requests_total{app="sample-metrics-app"}"#).unwrap();
        let target = LabelSet::new().with("kubernetes_namespace", "default");
        let merged = sel.with_labels(&target);

        assert_eq!(
            merged.to_string(),
            r#"sample_app_requests_total{app="sample-metrics-app",kubernetes_namespace="default"}"#
        );
        // The original is untouched.
        assert_eq!(sel.matchers.len(), 1);
    }

    #[test]
    fn matches_requires_name_and_labels() {
        let sel = Selector::parse(r#"cpu{app="web"}"#).unwrap();
        let name = MetricName::new("cpu").unwrap();
        let other = MetricName::new("mem").unwrap();
        let labels = LabelSet::new().with("app", "web").with("pod", "web-0");

        assert!(sel.matches(&name, &labels));
        assert!(!sel.matches(&other, &labels));
        assert!(!sel.matches(&name, &LabelSet::new().with("app", "api")));
    }

    #[test]
    fn serde_uses_text_form() {
        let sel: Selector = serde_json::from_str(r#""cpu{app=\"web\"}""#).unwrap();
        assert_eq!(sel.matchers.get("app"), Some("web"));
        assert_eq!(serde_json::to_string(&sel).unwrap(), r#""cpu{app=\"web\"}""#);
    }
}
