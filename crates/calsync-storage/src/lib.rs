//! Persistence ports, in-memory/Postgres stores and the channel HTTP client.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use calsync_core::{CalendarDay, CalendarDayStatus, ChannelMapping, ReconciliationRun};
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub mod pg;

pub const CRATE_NAME: &str = "calsync-storage";

#[async_trait]
pub trait CalendarStore: Send + Sync {
    /// PMS rows for `[from, to)`. Dates without a row are simply absent.
    async fn find_by_property_and_date_range(
        &self,
        property_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        organization_id: Uuid,
    ) -> anyhow::Result<Vec<CalendarDay>>;
}

#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Active mappings across all organizations.
    async fn find_all_active(&self) -> anyhow::Result<Vec<ChannelMapping>>;

    async fn find_active_by_property(&self, property_id: Uuid) -> anyhow::Result<Vec<ChannelMapping>> {
        Ok(self
            .find_all_active()
            .await?
            .into_iter()
            .filter(|m| m.internal_property_id == property_id)
            .collect())
    }
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or overwrite the run with the same id.
    async fn save(&self, run: &ReconciliationRun) -> anyhow::Result<ReconciliationRun>;

    /// Newest runs first.
    async fn recent(&self, limit: usize) -> anyhow::Result<Vec<ReconciliationRun>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub message: String,
    pub source: String,
    pub organization_id: Option<Uuid>,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_action(&self, entry: AuditEntry) -> anyhow::Result<()>;
}

/// Writes audit entries as `tracing` events on the `audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_action(&self, entry: AuditEntry) -> anyhow::Result<()> {
        tracing::info!(
            target: "audit",
            action = %entry.action,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            new_value = entry.new_value.as_deref().unwrap_or_default(),
            source = %entry.source,
            "{}",
            entry.message
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditLog {
    async fn log_action(&self, entry: AuditEntry) -> anyhow::Result<()> {
        self.entries.lock().await.push(entry);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCalendarStore {
    days: Mutex<HashMap<(Uuid, Uuid), BTreeMap<NaiveDate, CalendarDayStatus>>>,
    queries: AtomicUsize,
}

impl InMemoryCalendarStore {
    pub async fn set_day(
        &self,
        property_id: Uuid,
        organization_id: Uuid,
        date: NaiveDate,
        status: CalendarDayStatus,
    ) {
        self.days
            .lock()
            .await
            .entry((property_id, organization_id))
            .or_default()
            .insert(date, status);
    }

    /// Number of range queries served so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CalendarStore for InMemoryCalendarStore {
    async fn find_by_property_and_date_range(
        &self,
        property_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        organization_id: Uuid,
    ) -> anyhow::Result<Vec<CalendarDay>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let days = self.days.lock().await;
        let Some(property_days) = days.get(&(property_id, organization_id)) else {
            return Ok(Vec::new());
        };
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(property_days
            .range(from..to)
            .map(|(date, status)| CalendarDay {
                date: *date,
                status: *status,
            })
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMappingStore {
    mappings: Mutex<Vec<(ChannelMapping, bool)>>,
}

impl InMemoryMappingStore {
    pub fn with_mappings(mappings: impl IntoIterator<Item = ChannelMapping>) -> Self {
        Self {
            mappings: Mutex::new(mappings.into_iter().map(|m| (m, true)).collect()),
        }
    }

    pub async fn insert(&self, mapping: ChannelMapping) {
        self.mappings.lock().await.push((mapping, true));
    }

    pub async fn deactivate(&self, mapping_id: Uuid) {
        for (mapping, active) in self.mappings.lock().await.iter_mut() {
            if mapping.id == mapping_id {
                *active = false;
            }
        }
    }
}

#[async_trait]
impl MappingStore for InMemoryMappingStore {
    async fn find_all_active(&self) -> anyhow::Result<Vec<ChannelMapping>> {
        Ok(self
            .mappings
            .lock()
            .await
            .iter()
            .filter(|(_, active)| *active)
            .map(|(m, _)| m.clone())
            .collect())
    }
}

/// Keeps every save so callers can observe the in-flight and final writes.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    saves: Mutex<Vec<ReconciliationRun>>,
}

impl InMemoryRunStore {
    pub async fn saves(&self) -> Vec<ReconciliationRun> {
        self.saves.lock().await.clone()
    }

    pub async fn get(&self, run_id: Uuid) -> Option<ReconciliationRun> {
        self.saves
            .lock()
            .await
            .iter()
            .rev()
            .find(|r| r.id == run_id)
            .cloned()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save(&self, run: &ReconciliationRun) -> anyhow::Result<ReconciliationRun> {
        self.saves.lock().await.push(run.clone());
        Ok(run.clone())
    }

    async fn recent(&self, limit: usize) -> anyhow::Result<Vec<ReconciliationRun>> {
        let saves = self.saves.lock().await;
        let mut latest: Vec<ReconciliationRun> = Vec::new();
        for run in saves.iter().rev() {
            if !latest.iter().any(|r| r.id == run.id) {
                latest.push(run.clone());
            }
        }
        latest.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        latest.truncate(limit);
        Ok(latest)
    }
}

/// 5xx and 429 from a channel are worth another attempt; other statuses are final.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Delay schedule between attempts of one channel call. Pushes carry an
/// idempotency key, so replaying them is safe.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub first_delay: Duration,
    pub delay_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_millis(250),
            delay_cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Sleep before retry number `retry` (0-based), or `None` once the
    /// retries are spent.
    pub fn next_delay(&self, retry: u32) -> Option<Duration> {
        if retry >= self.retries {
            return None;
        }
        let doubled = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        Some(self.first_delay.saturating_mul(doubled).min(self.delay_cap))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_channel_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_channel_concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http client is shutting down")]
    Closed,
}

/// Optional request decorations shared by every attempt of one call.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub bearer_token: Option<String>,
    pub idempotency_key: Option<String>,
}

/// Shared client for channel APIs: global and per-channel concurrency caps
/// plus doubling, capped delays between retries of transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_channel_limit: usize,
    per_channel: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_channel_limit: config.per_channel_concurrency.max(1),
            per_channel: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    async fn per_channel_semaphore(&self, channel: &str) -> Arc<Semaphore> {
        let mut map = self.per_channel.lock().await;
        map.entry(channel.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_channel_limit)))
            .clone()
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        channel: &str,
        url: &str,
        options: &RequestOptions,
    ) -> Result<T, FetchError> {
        let resp = self
            .send::<()>(channel, Method::GET, url, None, options)
            .await?;
        serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
            url: resp.final_url,
            source,
        })
    }

    pub async fn send_json<B: Serialize + Sync>(
        &self,
        channel: &str,
        method: Method,
        url: &str,
        body: &B,
        options: &RequestOptions,
    ) -> Result<FetchedResponse, FetchError> {
        self.send(channel, method, url, Some(body), options).await
    }

    async fn send<B: Serialize + Sync>(
        &self,
        channel: &str,
        method: Method,
        url: &str,
        body: Option<&B>,
        options: &RequestOptions,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_channel = self.per_channel_semaphore(channel).await;
        let _channel = per_channel.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("channel_http", channel, method = %method, url);
        self.send_with_retry(method, url, body, options)
            .instrument(span)
            .await
    }

    async fn send_with_retry<B: Serialize + Sync>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
        options: &RequestOptions,
    ) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0u32;
        loop {
            let mut request = self.client.request(method.clone(), url);
            if let Some(token) = &options.bearer_token {
                request = request.bearer_auth(token);
            }
            if let Some(key) = &options.idempotency_key {
                request = request.header("Idempotency-Key", key);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if is_transient_status(status) {
                        if let Some(delay) = self.retry.next_delay(retry) {
                            warn!(status = status.as_u16(), retry, "transient channel response; retrying");
                            tokio::time::sleep(delay).await;
                            retry += 1;
                            continue;
                        }
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if is_transient_error(&err) {
                        if let Some(delay) = self.retry.next_delay(retry) {
                            warn!(error = %err, retry, "channel request failed; retrying");
                            tokio::time::sleep(delay).await;
                            retry += 1;
                            continue;
                        }
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_core::RunStatus;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 11, d).unwrap()
    }

    #[test]
    fn push_retries_double_until_cap_then_stop() {
        let policy = RetryPolicy {
            retries: 4,
            first_delay: Duration::from_millis(300),
            delay_cap: Duration::from_secs(1),
        };

        let schedule: Vec<_> = (0..6).map(|retry| policy.next_delay(retry)).collect();
        assert_eq!(
            schedule,
            vec![
                Some(Duration::from_millis(300)),
                Some(Duration::from_millis(600)),
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(1)),
                None,
                None,
            ]
        );
        assert_eq!(RetryPolicy { retries: 0, ..policy }.next_delay(0), None);
    }

    #[test]
    fn channel_throttling_and_outages_are_transient() {
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::CONFLICT));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn calendar_store_returns_half_open_range() {
        let store = InMemoryCalendarStore::default();
        let property = Uuid::new_v4();
        let org = Uuid::new_v4();
        for d in 1..=5 {
            store
                .set_day(property, org, date(d), CalendarDayStatus::Booked)
                .await;
        }

        let days = store
            .find_by_property_and_date_range(property, date(2), date(4), org)
            .await
            .unwrap();
        assert_eq!(days.iter().map(|d| d.date).collect::<Vec<_>>(), vec![date(2), date(3)]);

        let other_org = store
            .find_by_property_and_date_range(property, date(1), date(5), Uuid::new_v4())
            .await
            .unwrap();
        assert!(other_org.is_empty());
        assert_eq!(store.query_count(), 2);
    }

    #[tokio::test]
    async fn mapping_store_filters_inactive_and_by_property() {
        let property = Uuid::new_v4();
        let mk = |property_id| ChannelMapping {
            id: Uuid::new_v4(),
            channel_name: "staybook".into(),
            internal_property_id: property_id,
            external_id: "L-1".into(),
            organization_id: Uuid::new_v4(),
        };
        let kept = mk(property);
        let dropped = mk(property);
        let store = InMemoryMappingStore::with_mappings([kept.clone(), dropped.clone(), mk(Uuid::new_v4())]);
        store.deactivate(dropped.id).await;

        assert_eq!(store.find_all_active().await.unwrap().len(), 2);
        assert_eq!(store.find_active_by_property(property).await.unwrap(), vec![kept]);
    }

    #[tokio::test]
    async fn run_store_keeps_every_save_but_lists_latest_version() {
        let mapping = ChannelMapping {
            id: Uuid::new_v4(),
            channel_name: "staybook".into(),
            internal_property_id: Uuid::new_v4(),
            external_id: "L-1".into(),
            organization_id: Uuid::new_v4(),
        };
        let store = InMemoryRunStore::default();
        let mut run = ReconciliationRun::start(&mapping, date(1), date(11));
        store.save(&run).await.unwrap();
        run.status = RunStatus::Success;
        store.save(&run).await.unwrap();

        assert_eq!(store.saves().await.len(), 2);
        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, RunStatus::Success);
    }
}
