use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Persisted event row. Column names are a storage schema contract
/// (`start_at`, `end_at`, `tz`, `rrule`, `exdates`, `start_at_utc`,
/// `end_at_utc`) and must be preserved exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: String,
    pub household_id: String,
    pub title: String,
    /// Wall-clock anchor in epoch ms, interpreted in the effective timezone.
    pub start_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<i64>,
    /// IANA zone name; absent means floating/all-day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
    /// Cached absolute instant of the first occurrence. A cache, not a
    /// source of truth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at_utc: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at_utc: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rrule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exdates: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminder: Option<i64>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
}

/// Household row; only the fields the engine reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Household {
    pub id: String,
    pub name: String,
    /// Fallback zone for events that carry none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
}

/// One concrete, dated instance of a (possibly recurring) event. Recurring
/// events appear once per occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub event_id: String,
    pub occurrence_start_utc: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurrence_end_utc: Option<i64>,
}

/// Result page for a household + window query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsListRangeResponse {
    pub items: Vec<Occurrence>,
    /// Set when a limit (page size, per-series cap, or total cap) cut the
    /// result short; the caller should re-query with an advanced cursor.
    pub truncated: bool,
}
