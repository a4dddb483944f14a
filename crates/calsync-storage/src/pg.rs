//! Postgres-backed stores (`sqlx`, runtime-checked queries).

use anyhow::Context;
use async_trait::async_trait;
use calsync_core::{CalendarDay, ChannelMapping, ReconciliationRun};
use chrono::NaiveDate;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{AuditEntry, AuditSink, CalendarStore, MappingStore, RunStore};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPool::connect(database_url)
        .await
        .with_context(|| format!("connecting to {}", redact_url(database_url)))
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    MIGRATOR.run(pool).await.context("running migrations")
}

fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct PgCalendarStore {
    pool: PgPool,
}

impl PgCalendarStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CalendarStore for PgCalendarStore {
    async fn find_by_property_and_date_range(
        &self,
        property_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
        organization_id: Uuid,
    ) -> anyhow::Result<Vec<CalendarDay>> {
        let rows = sqlx::query(
            r#"
            SELECT day, status
              FROM calendar_days
             WHERE property_id = $1
               AND organization_id = $2
               AND day >= $3
               AND day < $4
             ORDER BY day
            "#,
        )
        .bind(property_id)
        .bind(organization_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading PMS calendar for property {property_id}"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            out.push(CalendarDay {
                date: row.try_get("day")?,
                status: status
                    .parse()
                    .with_context(|| format!("calendar row for property {property_id}"))?,
            });
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct PgMappingStore {
    pool: PgPool,
}

impl PgMappingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn mapping_from_row(row: &PgRow) -> anyhow::Result<ChannelMapping> {
    Ok(ChannelMapping {
        id: row.try_get("id")?,
        channel_name: row.try_get("channel_name")?,
        internal_property_id: row.try_get("internal_property_id")?,
        external_id: row.try_get("external_id")?,
        organization_id: row.try_get("organization_id")?,
    })
}

#[async_trait]
impl MappingStore for PgMappingStore {
    async fn find_all_active(&self) -> anyhow::Result<Vec<ChannelMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT id, channel_name, internal_property_id, external_id, organization_id
              FROM channel_mappings
             WHERE active
             ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("loading active channel mappings")?;
        rows.iter().map(mapping_from_row).collect()
    }

    async fn find_active_by_property(&self, property_id: Uuid) -> anyhow::Result<Vec<ChannelMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT id, channel_name, internal_property_id, external_id, organization_id
              FROM channel_mappings
             WHERE active
               AND internal_property_id = $1
             ORDER BY created_at, id
            "#,
        )
        .bind(property_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading channel mappings for property {property_id}"))?;
        rows.iter().map(mapping_from_row).collect()
    }
}

#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn save(&self, run: &ReconciliationRun) -> anyhow::Result<ReconciliationRun> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_runs (
                id, mapping_id, organization_id, property_id, channel_name,
                window_start, window_end, status,
                channel_days_checked, pms_days_checked,
                discrepancies_found, discrepancies_fixed, divergence_pct,
                details_json, error_message, started_at, finished_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                channel_days_checked = EXCLUDED.channel_days_checked,
                pms_days_checked = EXCLUDED.pms_days_checked,
                discrepancies_found = EXCLUDED.discrepancies_found,
                discrepancies_fixed = EXCLUDED.discrepancies_fixed,
                divergence_pct = EXCLUDED.divergence_pct,
                details_json = EXCLUDED.details_json,
                error_message = EXCLUDED.error_message,
                finished_at = EXCLUDED.finished_at
            "#,
        )
        .bind(run.id)
        .bind(run.mapping_id)
        .bind(run.organization_id)
        .bind(run.property_id)
        .bind(&run.channel_name)
        .bind(run.window_start)
        .bind(run.window_end)
        .bind(run.status.as_str())
        .bind(run.channel_days_checked as i64)
        .bind(run.pms_days_checked as i64)
        .bind(run.discrepancies_found as i64)
        .bind(run.discrepancies_fixed as i64)
        .bind(run.divergence_pct)
        .bind(run.details_json.as_deref())
        .bind(run.error_message.as_deref())
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving reconciliation run {}", run.id))?;
        Ok(run.clone())
    }

    async fn recent(&self, limit: usize) -> anyhow::Result<Vec<ReconciliationRun>> {
        let rows = sqlx::query(
            r#"
            SELECT id, mapping_id, organization_id, property_id, channel_name,
                   window_start, window_end, status,
                   channel_days_checked, pms_days_checked,
                   discrepancies_found, discrepancies_fixed, divergence_pct,
                   details_json, error_message, started_at, finished_at
              FROM reconciliation_runs
             ORDER BY started_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("loading recent reconciliation runs")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            out.push(ReconciliationRun {
                id: row.try_get("id")?,
                mapping_id: row.try_get("mapping_id")?,
                organization_id: row.try_get("organization_id")?,
                property_id: row.try_get("property_id")?,
                channel_name: row.try_get("channel_name")?,
                window_start: row.try_get("window_start")?,
                window_end: row.try_get("window_end")?,
                status: status.parse()?,
                channel_days_checked: row.try_get::<i64, _>("channel_days_checked")? as usize,
                pms_days_checked: row.try_get::<i64, _>("pms_days_checked")? as usize,
                discrepancies_found: row.try_get::<i64, _>("discrepancies_found")? as usize,
                discrepancies_fixed: row.try_get::<i64, _>("discrepancies_fixed")? as usize,
                divergence_pct: row.try_get("divergence_pct")?,
                details_json: row.try_get("details_json")?,
                error_message: row.try_get("error_message")?,
                started_at: row.try_get("started_at")?,
                finished_at: row.try_get("finished_at")?,
            });
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditLog {
    async fn log_action(&self, entry: AuditEntry) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, organization_id, action, entity_type, entity_id,
                old_value, new_value, message, source, recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.organization_id)
        .bind(&entry.action)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(entry.old_value.as_deref())
        .bind(entry.new_value.as_deref())
        .bind(&entry.message)
        .bind(&entry.source)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("writing audit entry {} {}", entry.action, entry.entity_id))?;
        Ok(())
    }
}
