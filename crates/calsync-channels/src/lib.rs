//! Channel connector contracts, the status normalizer and the built-in connectors.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use calsync_core::{CalendarDayStatus, ChannelDay, ChannelMapping, SyncResult};
use calsync_storage::{CalendarStore, FetchError, HttpFetcher, MappingStore, RequestOptions};
use chrono::NaiveDate;
use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "calsync-channels";

/// Maps channel vocabulary onto the canonical status. Unknown, empty or
/// missing values are AVAILABLE: an unrecognized token must never read as a
/// block.
pub fn normalize_status(raw: Option<&str>) -> CalendarDayStatus {
    let Some(raw) = raw else {
        return CalendarDayStatus::Available;
    };
    match raw.trim().to_ascii_uppercase().as_str() {
        "AVAILABLE" | "FREE" | "OPEN" => CalendarDayStatus::Available,
        "BOOKED" | "RESERVED" | "OCCUPIED" => CalendarDayStatus::Booked,
        "BLOCKED" | "CLOSED" | "UNAVAILABLE" => CalendarDayStatus::Blocked,
        "MAINTENANCE" => CalendarDayStatus::Maintenance,
        _ => CalendarDayStatus::Available,
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("{0}")]
    Message(String),
    #[error("no active {channel} mapping for property {property_id}")]
    MappingNotFound { channel: String, property_id: Uuid },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Uniform contract every booking channel implements.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    fn channel_name(&self) -> &str;

    /// Channel calendar for `[from, to)`.
    async fn get_channel_calendar(
        &self,
        mapping: &ChannelMapping,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ChannelDay>, ChannelError>;

    /// Push the PMS calendar for `[from, to)` of the property to the channel.
    async fn push_calendar_update(
        &self,
        property_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        organization_id: Uuid,
    ) -> Result<SyncResult, ChannelError>;
}

#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn ChannelConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector: Arc<dyn ChannelConnector>) {
        self.connectors
            .insert(connector.channel_name().to_string(), connector);
    }

    pub fn with(mut self, connector: Arc<dyn ChannelConnector>) -> Self {
        self.register(connector);
        self
    }

    pub fn get(&self, channel_name: &str) -> Option<Arc<dyn ChannelConnector>> {
        self.connectors.get(channel_name).cloned()
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.connectors.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Http,
    Fixture,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsFile {
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: ChannelKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub fixture_path: Option<String>,
    #[serde(default)]
    pub divergence_threshold_pct: Option<f64>,
}

pub fn load_channels_file(path: impl AsRef<Path>) -> Result<ChannelsFile> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: ChannelsFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    for channel in &file.channels {
        match channel.kind {
            ChannelKind::Http if channel.base_url.is_none() => {
                anyhow::bail!("channel {} is kind http but has no base_url", channel.name)
            }
            ChannelKind::Fixture if channel.fixture_path.is_none() => {
                anyhow::bail!("channel {} is kind fixture but has no fixture_path", channel.name)
            }
            _ => {}
        }
    }
    Ok(file)
}

/// Dependencies shared by the connectors built from `channels.yaml`.
#[derive(Clone)]
pub struct ConnectorDeps {
    pub http: Arc<HttpFetcher>,
    pub calendars: Arc<dyn CalendarStore>,
    pub mappings: Arc<dyn MappingStore>,
    pub workspace_root: PathBuf,
}

pub fn connector_for_channel(
    config: &ChannelConfig,
    deps: &ConnectorDeps,
) -> Result<Arc<dyn ChannelConnector>> {
    match config.kind {
        ChannelKind::Http => {
            let base_url = config
                .base_url
                .clone()
                .with_context(|| format!("channel {} has no base_url", config.name))?;
            let api_key = match &config.api_key_env {
                Some(var) => Some(
                    std::env::var(var)
                        .with_context(|| format!("reading {var} for channel {}", config.name))?,
                ),
                None => None,
            };
            Ok(Arc::new(HttpChannelConnector {
                name: config.name.clone(),
                base_url,
                api_key,
                http: Arc::clone(&deps.http),
                calendars: Arc::clone(&deps.calendars),
                mappings: Arc::clone(&deps.mappings),
            }))
        }
        ChannelKind::Fixture => {
            let rel = config
                .fixture_path
                .as_deref()
                .with_context(|| format!("channel {} has no fixture_path", config.name))?;
            let connector =
                FixtureConnector::from_json_file(&config.name, deps.workspace_root.join(rel))?;
            Ok(Arc::new(connector))
        }
    }
}

/// Registers every enabled channel that can be built. Mappings on disabled or
/// misconfigured channels later fail with "Connector not found"; the other
/// channels keep reconciling.
pub fn build_registry(file: &ChannelsFile, deps: &ConnectorDeps) -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    for channel in file.channels.iter().filter(|c| c.enabled) {
        match connector_for_channel(channel, deps) {
            Ok(connector) => {
                info!(channel = %channel.name, display_name = %channel.display_name, kind = ?channel.kind, "registered channel connector");
                registry.register(connector);
            }
            Err(err) => {
                warn!(channel = %channel.name, error = %format!("{err:#}"), "channel left unregistered");
            }
        }
    }
    registry
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireDay {
    date: NaiveDate,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    price: Option<f64>,
}

impl From<WireDay> for ChannelDay {
    fn from(day: WireDay) -> Self {
        ChannelDay {
            date: day.date,
            raw_status: day.status,
            price: day.price,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct WireCalendar {
    #[serde(default)]
    days: Vec<WireDay>,
}

#[derive(Debug, Clone, Serialize)]
struct PushDay {
    date: NaiveDate,
    status: CalendarDayStatus,
}

#[derive(Debug, Clone, Serialize)]
struct PushBody {
    days: Vec<PushDay>,
}

/// Stable key for one push payload so a retried PUT is applied once.
pub fn idempotency_key(external_id: &str, from: NaiveDate, to: NaiveDate, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(external_id.as_bytes());
    hasher.update(b"|");
    hasher.update(from.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(to.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// PMS statuses for every date of `[from, to)`; dates without a PMS row are AVAILABLE.
pub async fn pms_statuses_for_range(
    calendars: &dyn CalendarStore,
    property_id: Uuid,
    from: NaiveDate,
    to: NaiveDate,
    organization_id: Uuid,
) -> anyhow::Result<Vec<(NaiveDate, CalendarDayStatus)>> {
    let rows = calendars
        .find_by_property_and_date_range(property_id, from, to, organization_id)
        .await?;
    let by_date: BTreeMap<_, _> = rows.into_iter().map(|d| (d.date, d.status)).collect();
    Ok(from
        .iter_days()
        .take_while(|d| *d < to)
        .map(|d| (d, by_date.get(&d).copied().unwrap_or_default()))
        .collect())
}

/// Generic JSON channel API:
/// `GET/PUT {base_url}/listings/{external_id}/calendar`.
pub struct HttpChannelConnector {
    name: String,
    base_url: String,
    api_key: Option<String>,
    http: Arc<HttpFetcher>,
    calendars: Arc<dyn CalendarStore>,
    mappings: Arc<dyn MappingStore>,
}

impl HttpChannelConnector {
    fn calendar_url(&self, external_id: &str) -> String {
        format!(
            "{}/listings/{}/calendar",
            self.base_url.trim_end_matches('/'),
            external_id
        )
    }

    async fn mapping_for(&self, property_id: Uuid, organization_id: Uuid) -> Result<ChannelMapping, ChannelError> {
        self.mappings
            .find_active_by_property(property_id)
            .await?
            .into_iter()
            .find(|m| m.channel_name == self.name && m.organization_id == organization_id)
            .ok_or_else(|| ChannelError::MappingNotFound {
                channel: self.name.clone(),
                property_id,
            })
    }
}

#[async_trait]
impl ChannelConnector for HttpChannelConnector {
    fn channel_name(&self) -> &str {
        &self.name
    }

    async fn get_channel_calendar(
        &self,
        mapping: &ChannelMapping,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ChannelDay>, ChannelError> {
        let url = format!(
            "{}?start={}&end={}",
            self.calendar_url(&mapping.external_id),
            from,
            to
        );
        let options = RequestOptions {
            bearer_token: self.api_key.clone(),
            idempotency_key: None,
        };
        let calendar: WireCalendar = self.http.get_json(&self.name, &url, &options).await?;
        debug!(channel = %self.name, external_id = %mapping.external_id, days = calendar.days.len(), "fetched channel calendar");
        Ok(calendar.days.into_iter().map(ChannelDay::from).collect())
    }

    async fn push_calendar_update(
        &self,
        property_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        organization_id: Uuid,
    ) -> Result<SyncResult, ChannelError> {
        let started = Instant::now();
        let mapping = self.mapping_for(property_id, organization_id).await?;
        let days = pms_statuses_for_range(self.calendars.as_ref(), property_id, from, to, organization_id)
            .await?;
        let body = PushBody {
            days: days
                .into_iter()
                .map(|(date, status)| PushDay { date, status })
                .collect(),
        };
        let payload = serde_json::to_vec(&body).context("serializing push payload")?;
        let options = RequestOptions {
            bearer_token: self.api_key.clone(),
            idempotency_key: Some(idempotency_key(&mapping.external_id, from, to, &payload)),
        };

        let url = self.calendar_url(&mapping.external_id);
        match self
            .http
            .send_json(&self.name, Method::PUT, &url, &body, &options)
            .await
        {
            Ok(_) => Ok(SyncResult::ok(
                body.days.len(),
                started.elapsed().as_millis() as u64,
            )),
            Err(FetchError::HttpStatus { status, url }) => {
                warn!(channel = %self.name, status, %url, "channel rejected calendar push");
                Ok(SyncResult::failed(started.elapsed().as_millis() as u64))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureFile {
    listings: HashMap<String, Vec<WireDay>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPush {
    pub property_id: Uuid,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub organization_id: Uuid,
}

/// File-backed channel for local runs and demos. Pushes are recorded and
/// acknowledged but do not rewrite the fixture.
pub struct FixtureConnector {
    name: String,
    listings: HashMap<String, Vec<ChannelDay>>,
    pushes: Mutex<Vec<RecordedPush>>,
}

impl FixtureConnector {
    pub fn new(name: impl Into<String>, listings: HashMap<String, Vec<ChannelDay>>) -> Self {
        Self {
            name: name.into(),
            listings,
            pushes: Mutex::new(Vec::new()),
        }
    }

    pub fn from_json_file(name: &str, path: impl AsRef<Path>) -> Result<Self> {
        let file: FixtureFile = read_json_file(path)?;
        let listings = file
            .listings
            .into_iter()
            .map(|(id, days)| (id, days.into_iter().map(ChannelDay::from).collect()))
            .collect();
        Ok(Self::new(name, listings))
    }

    pub async fn pushes(&self) -> Vec<RecordedPush> {
        self.pushes.lock().await.clone()
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl ChannelConnector for FixtureConnector {
    fn channel_name(&self) -> &str {
        &self.name
    }

    async fn get_channel_calendar(
        &self,
        mapping: &ChannelMapping,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ChannelDay>, ChannelError> {
        let days = self.listings.get(&mapping.external_id).ok_or_else(|| {
            ChannelError::Message(format!(
                "listing {} not present in {} fixture",
                mapping.external_id, self.name
            ))
        })?;
        Ok(days
            .iter()
            .filter(|d| d.date >= from && d.date < to)
            .cloned()
            .collect())
    }

    async fn push_calendar_update(
        &self,
        property_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        organization_id: Uuid,
    ) -> Result<SyncResult, ChannelError> {
        self.pushes.lock().await.push(RecordedPush {
            property_id,
            from,
            to,
            organization_id,
        });
        let count = from.iter_days().take_while(|d| *d < to).count();
        Ok(SyncResult::ok(count, 0))
    }
}
