use std::collections::BTreeSet;

use chrono_tz::Tz;
use tracing::warn;

use crate::exdate::{parse_exdates, SeriesBoundsUtc};
use crate::expand::{first_occurrence_utc_ms, occurrences_up_to_bound};
use crate::rule::{parse_rule, RecurrenceRule};
use crate::time;
use crate::time_errors::TimeErrorCode;
use crate::tz::{local_ms_to_utc_ms, TzDb};
use crate::AppResult;

/// Cap on occurrences materialized when checking that exclusions actually
/// match generated occurrences.
const MATCH_CHECK_CAP: usize = 10_000;

/// Outcome of write-time validation: the parsed pieces plus the UTC caches
/// the row should be persisted with.
#[derive(Debug, Clone)]
pub struct ValidatedEventTimes {
    pub tz: Tz,
    pub rule: Option<RecurrenceRule>,
    pub exdates: BTreeSet<i64>,
    pub start_at_utc: i64,
    pub end_at_utc: Option<i64>,
}

/// Validate an event's temporal fields before persistence.
///
/// Checks, in order: `start_at <= end_at` (`E_RANGE_INVALID`), strict zone
/// resolution over the event→household→UTC chain (`E_TZ_UNKNOWN`), strict
/// rule parse (`E_RRULE_UNSUPPORTED_FIELD`), strict EXDATE parse against the
/// series bounds (`E_EXDATE_INVALID_FORMAT` / `E_EXDATE_OUT_OF_RANGE`). Any
/// error blocks the write. An in-range exclusion that matches no generated
/// occurrence is accepted with a warning; it is a no-op at expansion time.
pub fn validate_event_times(
    tzdb: &TzDb,
    event_id: &str,
    start_at: i64,
    end_at: Option<i64>,
    event_tz: Option<&str>,
    household_tz: Option<&str>,
    rrule: Option<&str>,
    exdates: Option<&str>,
) -> AppResult<ValidatedEventTimes> {
    if let Some(end) = end_at {
        if end < start_at {
            return Err(TimeErrorCode::RangeInvalid
                .into_error()
                .with_context("start_at", start_at.to_string())
                .with_context("end_at", end.to_string()));
        }
    }

    let tz = tzdb.effective_tz(event_tz, household_tz)?;
    let rule = match rrule.map(str::trim).filter(|r| !r.is_empty()) {
        Some(raw) => Some(parse_rule(raw)?),
        None => None,
    };

    let anchor_local = time::naive_from_ms(start_at)?;
    let start_at_utc = match &rule {
        Some(rule) => first_occurrence_utc_ms(rule, anchor_local, tz)
            .unwrap_or(local_ms_to_utc_ms(tz, start_at)?),
        None => local_ms_to_utc_ms(tz, start_at)?,
    };
    let end_at_utc = match end_at {
        Some(end) => Some(local_ms_to_utc_ms(tz, end)?),
        None => None,
    };

    let exdate_set = match exdates.map(str::trim).filter(|e| !e.is_empty()) {
        Some(raw) => match &rule {
            Some(rule) => {
                let bounds = SeriesBoundsUtc::from_rule(rule, anchor_local, tz);
                let set = parse_exdates(raw, &bounds)?;
                warn_on_unmatched(event_id, rule, anchor_local, tz, &set);
                set
            }
            None => {
                // Exclusions on a non-recurring event exclude nothing.
                warn!(
                    target: "kinloch",
                    event = "exdates_without_rrule",
                    event_id = %event_id
                );
                parse_exdates(raw, &SeriesBoundsUtc::default())?
            }
        },
        None => BTreeSet::new(),
    };

    Ok(ValidatedEventTimes {
        tz,
        rule,
        exdates: exdate_set,
        start_at_utc,
        end_at_utc,
    })
}

fn warn_on_unmatched(
    event_id: &str,
    rule: &RecurrenceRule,
    anchor_local: chrono::NaiveDateTime,
    tz: Tz,
    exdates: &BTreeSet<i64>,
) {
    // Only checkable when the whole series fits under the cap; an unbounded
    // or very long series may legitimately match an exclusion far out.
    if rule.count.is_none() && rule.until.is_none() {
        return;
    }
    let occurrences = occurrences_up_to_bound(rule, anchor_local, tz, MATCH_CHECK_CAP);
    if occurrences.len() >= MATCH_CHECK_CAP {
        return;
    }
    let generated: BTreeSet<i64> = occurrences.into_iter().collect();
    for ms in exdates {
        if !generated.contains(ms) {
            warn!(
                target: "kinloch",
                event = "exdate_matches_no_occurrence",
                event_id = %event_id,
                instant_ms = ms
            );
        }
    }
}
