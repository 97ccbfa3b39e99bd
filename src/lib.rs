//! Recurring-event timezone and occurrence-expansion engine.
//!
//! Event rows store a wall-clock anchor (`start_at`, epoch ms) plus an
//! optional IANA zone, recurrence rule, and exclusion list; `start_at_utc` /
//! `end_at_utc` are derived caches. The modules here parse and validate
//! those fields, expand series into concrete UTC occurrences for a query
//! window, normalize legacy rows in place, and detect cache drift after
//! timezone-data updates.

pub mod backfill;
pub mod drift;
pub mod error;
pub mod exdate;
pub mod expand;
pub mod logging;
pub mod migrate;
pub mod model;
pub mod query;
pub mod rule;
pub mod time;
pub mod time_errors;
pub mod tz;
pub mod validate;

pub use error::{AppError, AppResult};
