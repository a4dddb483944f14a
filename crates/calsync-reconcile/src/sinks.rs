//! Metrics and operator-notification sinks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use calsync_storage::{HttpFetcher, RequestOptions};
use reqwest::Method;
use serde::Serialize;
use tracing::warn;

pub const ALERT_DIVERGENCE_HIGH: &str = "reconciliation.divergence_high";
pub const ALERT_RECONCILIATION_FAILED: &str = "reconciliation.failed";

pub trait MetricsSink: Send + Sync {
    fn increment_runs(&self);
    fn increment_discrepancies(&self, n: u64);
    fn increment_fixes(&self, n: u64);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub reconciliation_runs: u64,
    pub reconciliation_discrepancies: u64,
    pub reconciliation_fixes: u64,
}

#[derive(Debug, Default)]
pub struct CounterMetrics {
    runs: AtomicU64,
    discrepancies: AtomicU64,
    fixes: AtomicU64,
}

impl CounterMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reconciliation_runs: self.runs.load(Ordering::Relaxed),
            reconciliation_discrepancies: self.discrepancies.load(Ordering::Relaxed),
            reconciliation_fixes: self.fixes.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for CounterMetrics {
    fn increment_runs(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
    }

    fn increment_discrepancies(&self, n: u64) {
        self.discrepancies.fetch_add(n, Ordering::Relaxed);
    }

    fn increment_fixes(&self, n: u64) {
        self.fixes.fetch_add(n, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatorAlert {
    pub alert_key: String,
    pub title: String,
    pub message: String,
    pub link: String,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_operators(&self, alert: &OperatorAlert) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify_operators(&self, alert: &OperatorAlert) -> anyhow::Result<()> {
        warn!(
            alert_key = %alert.alert_key,
            link = %alert.link,
            "{}: {}",
            alert.title,
            alert.message
        );
        Ok(())
    }
}

/// POSTs alerts as JSON to an operator webhook.
pub struct WebhookNotifier {
    url: String,
    http: Arc<HttpFetcher>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            url: url.into(),
            http,
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify_operators(&self, alert: &OperatorAlert) -> anyhow::Result<()> {
        self.http
            .send_json(
                "operator-webhook",
                Method::POST,
                &self.url,
                alert,
                &RequestOptions::default(),
            )
            .await?;
        Ok(())
    }
}
