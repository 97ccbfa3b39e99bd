use sqlx::SqlitePool;
use tracing::warn;

use crate::exdate::parse_exdates_lenient;
use crate::expand::{expand, WindowUtc};
use crate::model::{Event, EventsListRangeResponse, Occurrence};
use crate::rule::parse_rule;
use crate::time;
use crate::time_errors::TimeErrorCode;
use crate::tz::TzDb;
use crate::{AppError, AppResult};

const PER_SERIES_LIMIT: usize = 500;
const TOTAL_LIMIT: usize = 10_000;

/// Pagination input: page size plus an exclusive resume point taken from the
/// last item of the previous page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub limit: Option<usize>,
    pub cursor: Option<Cursor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub start_utc: i64,
    pub event_id: String,
}

/// List every concrete occurrence for `household_id` intersecting
/// `[window.from, window.to)`, ordered by start ascending with the event id
/// as tie-break. Recurring rows are expanded per occurrence; rows whose
/// stored rule or zone no longer parses are logged and skipped, since the
/// write path owns rejection. Read-only.
pub async fn events_list_range(
    pool: &SqlitePool,
    tzdb: &TzDb,
    household_id: &str,
    window: WindowUtc,
    page: &Page,
) -> AppResult<EventsListRangeResponse> {
    if window.from >= window.to {
        return Err(TimeErrorCode::RangeInvalid
            .into_error()
            .with_context("operation", "events_list_range")
            .with_context("from", window.from.to_string())
            .with_context("to", window.to.to_string()));
    }
    time::utc_from_ms(window.from)?;
    time::utc_from_ms(window.to)?;

    let household_tz: Option<String> =
        sqlx::query_scalar("SELECT tz FROM household WHERE id = ?")
            .bind(household_id)
            .fetch_optional(pool)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "events_list_range")
                    .with_context("household_id", household_id.to_string())
            })?
            .flatten();

    // Non-recurring rows are clipped by their cached UTC range in SQL;
    // recurring rows are admitted when their first-occurrence cache starts
    // before the window's end and clipped precisely by the expander.
    let rows = sqlx::query_as::<_, Event>(
        r#"
        SELECT id, household_id, title, start_at, end_at, tz, start_at_utc, end_at_utc,
               rrule, exdates, reminder, created_at, updated_at, deleted_at
        FROM events
        WHERE household_id = ? AND deleted_at IS NULL
          AND (
            (rrule IS NULL AND COALESCE(end_at_utc, end_at, start_at) >= ? AND COALESCE(start_at_utc, start_at) < ?)
            OR (rrule IS NOT NULL AND COALESCE(start_at_utc, start_at) < ?)
          )
        ORDER BY COALESCE(start_at_utc, start_at), id
        "#,
    )
    .bind(household_id)
    .bind(window.from)
    .bind(window.to)
    .bind(window.to)
    .fetch_all(pool)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "events_list_range")
            .with_context("household_id", household_id.to_string())
            .with_context("from", window.from.to_string())
            .with_context("to", window.to.to_string())
    })?;

    let mut out: Vec<Occurrence> = Vec::new();
    let mut truncated = false;

    'rows: for row in rows {
        if let Some(rrule_str) = row.rrule.as_deref() {
            let rule = match parse_rule(rrule_str) {
                Ok(rule) => rule,
                Err(err) => {
                    warn!(
                        target: "kinloch",
                        event = "stored_rrule_invalid",
                        event_id = %row.id,
                        rule = %rrule_str.chars().take(80).collect::<String>(),
                        code = %err.code()
                    );
                    continue;
                }
            };
            let tz = match tzdb.effective_tz(row.tz.as_deref(), household_tz.as_deref()) {
                Ok(tz) => tz,
                Err(err) => {
                    warn!(
                        target: "kinloch",
                        event = "stored_tz_invalid",
                        event_id = %row.id,
                        code = %err.code()
                    );
                    continue;
                }
            };
            let anchor_local = time::naive_from_ms(row.start_at).map_err(|err| {
                err.with_context("operation", "events_list_range")
                    .with_context("event_id", row.id.clone())
            })?;
            let exdates = match row.exdates.as_deref() {
                Some(raw) => parse_exdates_lenient(&row.id, raw),
                None => Default::default(),
            };
            let duration = row
                .end_at
                .map(|end| end.saturating_sub(row.start_at));

            let mut series_len = 0usize;
            for start_utc in expand(&rule, anchor_local, tz, window, &exdates) {
                if series_len >= PER_SERIES_LIMIT {
                    truncated = true;
                    break;
                }
                if out.len() >= TOTAL_LIMIT {
                    truncated = true;
                    break 'rows;
                }
                series_len += 1;
                out.push(Occurrence {
                    event_id: row.id.clone(),
                    occurrence_start_utc: start_utc,
                    occurrence_end_utc: duration.map(|d| start_utc + d),
                });
            }
        } else {
            let start_utc = row.start_at_utc.unwrap_or(row.start_at);
            let end_utc = row.end_at_utc.or(row.end_at);
            if end_utc.unwrap_or(start_utc) >= window.from && start_utc < window.to {
                if out.len() >= TOTAL_LIMIT {
                    truncated = true;
                    break;
                }
                out.push(Occurrence {
                    event_id: row.id.clone(),
                    occurrence_start_utc: start_utc,
                    occurrence_end_utc: end_utc,
                });
            }
        }
    }

    out.sort_by(|a, b| {
        a.occurrence_start_utc
            .cmp(&b.occurrence_start_utc)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });

    let (items, page_truncated) = apply_page(out, page);
    Ok(EventsListRangeResponse {
        items,
        truncated: truncated || page_truncated,
    })
}

/// Drop everything at or before the cursor, then cap at the page limit.
/// Returns the page and whether the limit cut items off.
fn apply_page(items: Vec<Occurrence>, page: &Page) -> (Vec<Occurrence>, bool) {
    let mut items = match &page.cursor {
        Some(cursor) => items
            .into_iter()
            .filter(|occ| {
                (occ.occurrence_start_utc, occ.event_id.as_str())
                    > (cursor.start_utc, cursor.event_id.as_str())
            })
            .collect(),
        None => items,
    };
    match page.limit {
        Some(limit) if items.len() > limit => {
            items.truncate(limit);
            (items, true)
        }
        _ => (items, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occ(id: &str, start: i64) -> Occurrence {
        Occurrence {
            event_id: id.to_string(),
            occurrence_start_utc: start,
            occurrence_end_utc: None,
        }
    }

    #[test]
    fn page_without_limit_or_cursor_passes_through() {
        let items = vec![occ("a", 1), occ("b", 2)];
        let (got, truncated) = apply_page(items.clone(), &Page::default());
        assert_eq!(got, items);
        assert!(!truncated);
    }

    #[test]
    fn limit_truncates_and_flags() {
        let items = vec![occ("a", 1), occ("b", 2), occ("c", 3)];
        let (got, truncated) = apply_page(
            items,
            &Page {
                limit: Some(2),
                cursor: None,
            },
        );
        assert_eq!(got.len(), 2);
        assert!(truncated);
    }

    #[test]
    fn cursor_resumes_strictly_after_including_ties() {
        // Two occurrences share an instant; the cursor id decides the split.
        let items = vec![occ("a", 5), occ("b", 5), occ("c", 6)];
        let (got, _) = apply_page(
            items,
            &Page {
                limit: None,
                cursor: Some(Cursor {
                    start_utc: 5,
                    event_id: "a".to_string(),
                }),
            },
        );
        assert_eq!(got, vec![occ("b", 5), occ("c", 6)]);
    }

    #[test]
    fn exact_page_boundary_is_not_truncated() {
        let items = vec![occ("a", 1), occ("b", 2)];
        let (got, truncated) = apply_page(
            items,
            &Page {
                limit: Some(2),
                cursor: None,
            },
        );
        assert_eq!(got.len(), 2);
        assert!(!truncated);
    }
}
