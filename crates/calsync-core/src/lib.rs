//! Core domain model for PMS/channel calendar reconciliation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "calsync-core";

/// Divergence above this percentage classifies a run as `DIVERGENCE`.
pub const DEFAULT_DIVERGENCE_THRESHOLD_PCT: f64 = 5.0;

/// Link between one PMS property and one channel listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMapping {
    pub id: Uuid,
    pub channel_name: String,
    pub internal_property_id: Uuid,
    pub external_id: String,
    pub organization_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalendarDayStatus {
    #[default]
    Available,
    Booked,
    Blocked,
    Maintenance,
}

impl CalendarDayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Booked => "BOOKED",
            Self::Blocked => "BLOCKED",
            Self::Maintenance => "MAINTENANCE",
        }
    }
}

impl fmt::Display for CalendarDayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status {:?}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

/// Strict parse of the PMS vocabulary. Channel vocabulary goes through the
/// lenient normalizer in `calsync-channels` instead.
impl FromStr for CalendarDayStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(Self::Available),
            "BOOKED" => Ok(Self::Booked),
            "BLOCKED" => Ok(Self::Blocked),
            "MAINTENANCE" => Ok(Self::Maintenance),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// PMS-side calendar row. The PMS is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub status: CalendarDayStatus,
}

/// Channel-side calendar row in the channel's own vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDay {
    pub date: NaiveDate,
    pub raw_status: Option<String>,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub date: NaiveDate,
    pub pms_status: CalendarDayStatus,
    pub channel_status: CalendarDayStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Only carried by the first (in-flight) save of a run.
    Running,
    Success,
    Divergence,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Divergence => "DIVERGENCE",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "DIVERGENCE" => Ok(Self::Divergence),
            "FAILED" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Execution record of reconciling one mapping over `[window_start, window_end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub id: Uuid,
    pub mapping_id: Uuid,
    pub organization_id: Uuid,
    pub property_id: Uuid,
    pub channel_name: String,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub status: RunStatus,
    pub channel_days_checked: usize,
    pub pms_days_checked: usize,
    pub discrepancies_found: usize,
    pub discrepancies_fixed: usize,
    pub divergence_pct: f64,
    pub details_json: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ReconciliationRun {
    /// In-flight record written before any calendar I/O happens.
    pub fn start(mapping: &ChannelMapping, window_start: NaiveDate, window_end: NaiveDate) -> Self {
        Self {
            id: Uuid::new_v4(),
            mapping_id: mapping.id,
            organization_id: mapping.organization_id,
            property_id: mapping.internal_property_id,
            channel_name: mapping.channel_name.clone(),
            window_start,
            window_end,
            status: RunStatus::Running,
            channel_days_checked: 0,
            pms_days_checked: 0,
            discrepancies_found: 0,
            discrepancies_fixed: 0,
            divergence_pct: 0.0,
            details_json: None,
            error_message: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Outcome reported by a channel push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub count: usize,
    pub duration_ms: u64,
}

impl SyncResult {
    pub fn ok(count: usize, duration_ms: u64) -> Self {
        Self {
            success: true,
            count,
            duration_ms,
        }
    }

    pub fn failed(duration_ms: u64) -> Self {
        Self {
            success: false,
            count: 0,
            duration_ms,
        }
    }
}

/// Share of checked channel days that disagree with the PMS, in percent.
pub fn divergence_pct(discrepancies_found: usize, channel_days_checked: usize) -> f64 {
    discrepancies_found as f64 / channel_days_checked.max(1) as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divergence_uses_at_least_one_checked_day() {
        assert_eq!(divergence_pct(0, 0), 0.0);
        assert_eq!(divergence_pct(1, 10), 10.0);
        assert!((divergence_pct(1, 30) - 3.333).abs() < 0.01);
    }

    #[test]
    fn statuses_serialize_in_upper_case() {
        let json = serde_json::to_string(&CalendarDayStatus::Maintenance).unwrap();
        assert_eq!(json, "\"MAINTENANCE\"");
        let status: RunStatus = serde_json::from_str("\"DIVERGENCE\"").unwrap();
        assert_eq!(status, RunStatus::Divergence);
    }

    #[test]
    fn pms_status_parse_is_strict() {
        assert_eq!("BOOKED".parse::<CalendarDayStatus>(), Ok(CalendarDayStatus::Booked));
        assert!("booked".parse::<CalendarDayStatus>().is_err());
        assert!(!RunStatus::Running.is_final());
        assert!(RunStatus::Failed.is_final());
    }
}
