//! Metrics scraping and flattening.
//!
//! Tests look values up by exact key, so the key format below is a contract:
//!
//! - counter or gauge: `name|label:value|...`
//! - histogram bucket: `name_bucket|label:value|...|le:<bound>` where the
//!   bound is truncated to an unsigned integer (`+Inf` saturates)
//! - histogram totals: `name_count|...` and `name_sum|...`
//!
//! Labels keep the order in which they appear in the exposition.

pub mod parser;

use std::collections::HashMap;

use crate::error::{HarnessError, Result};
use parser::{MetricFamily, MetricValue};

/// Flattened view of one scrape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    values: HashMap<String, f64>,
}

impl MetricsSnapshot {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn into_inner(self) -> HashMap<String, f64> {
        self.values
    }
}

/// Flatten decoded families into a snapshot. Summary and untyped families
/// are skipped.
pub fn normalize(families: &[MetricFamily]) -> MetricsSnapshot {
    let mut values = HashMap::new();

    for family in families {
        for metric in &family.metrics {
            let labels: String = metric
                .labels
                .iter()
                .map(|(name, value)| format!("|{}:{}", name, value))
                .collect();

            match &metric.value {
                MetricValue::Counter(v) | MetricValue::Gauge(v) => {
                    values.insert(format!("{}{}", family.name, labels), *v);
                }
                MetricValue::Histogram(h) => {
                    for bucket in &h.buckets {
                        // `as` saturates: +Inf becomes u64::MAX, negatives 0.
                        let key = format!(
                            "{}_bucket{}|le:{}",
                            family.name, labels, bucket.upper_bound as u64
                        );
                        values.insert(key, bucket.cumulative_count as f64);
                    }
                    values.insert(
                        format!("{}_count{}", family.name, labels),
                        h.sample_count as f64,
                    );
                    values.insert(format!("{}_sum{}", family.name, labels), h.sample_sum);
                }
                MetricValue::Summary(_) | MetricValue::Untyped(_) => {}
            }
        }
    }

    MetricsSnapshot { values }
}

/// Parse an exposition body and flatten it.
pub fn parse_snapshot(text: &str) -> Result<MetricsSnapshot> {
    Ok(normalize(&parser::parse(text)?))
}

/// GET `http://<metrics_addr>/metrics` and flatten the response.
pub async fn scrape(client: &reqwest::Client, metrics_addr: &str) -> Result<MetricsSnapshot> {
    let url = format!("http://{}/metrics", metrics_addr);
    let resp = client.get(&url).send().await?;

    let status = resp.status();
    if status != reqwest::StatusCode::OK {
        return Err(HarnessError::UnexpectedStatus {
            url,
            status: status.as_u16(),
        });
    }

    let body = resp.text().await?;
    let snapshot = parse_snapshot(&body)?;
    tracing::debug!(url = %url, series = snapshot.len(), "Scraped metrics");
    Ok(snapshot)
}
