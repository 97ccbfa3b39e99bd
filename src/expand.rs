use std::collections::BTreeSet;

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

use crate::rule::{Freq, RecurrenceRule};
use crate::tz::resolve_local;

/// Query window `[from, to)` in absolute UTC epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUtc {
    pub from: i64,
    pub to: i64,
}

impl WindowUtc {
    /// Window covering every representable instant, for whole-series walks.
    pub fn unbounded() -> Self {
        WindowUtc {
            from: i64::MIN,
            to: i64::MAX,
        }
    }
}

/// Lazy, restartable walk over a series' UTC occurrence instants.
///
/// Candidates are generated by stepping the anchor's *wall-clock* time
/// forward (same local time, next date), then resolving each candidate
/// through the timezone independently. That per-candidate resolution, not
/// arithmetic on the anchor instant, is what keeps the walk DST-correct.
///
/// EXDATE hits are skipped but still consume one unit of the `COUNT` bound;
/// occurrences before the window likewise consume `COUNT` without being
/// yielded. The iterator is deterministic and fused.
pub struct OccurrenceIter {
    freq: Freq,
    interval: u32,
    count: Option<u32>,
    until_ms: Option<i64>,
    tz: Tz,
    window: WindowUtc,
    exdates: BTreeSet<i64>,
    anchor_local: NaiveDateTime,
    time_of_day: NaiveTime,
    // Daily cursor.
    next_date: Option<NaiveDate>,
    // Weekly cursor: the Monday of the current interval-week plus the
    // position in the ascending weekday list.
    week_start: Option<NaiveDate>,
    byday: Vec<Weekday>,
    day_idx: usize,
    produced: u32,
    done: bool,
}

/// Expand `rule` from its local wall-clock anchor in `tz`, restricted to
/// `window` and excluding instants in `exdates`. Re-invoking with the same
/// inputs yields the same sequence.
pub fn expand(
    rule: &RecurrenceRule,
    anchor_local: NaiveDateTime,
    tz: Tz,
    window: WindowUtc,
    exdates: &BTreeSet<i64>,
) -> OccurrenceIter {
    let anchor_date = anchor_local.date();
    let byday = match rule.freq {
        Freq::Daily => Vec::new(),
        Freq::Weekly => rule.effective_byday(anchor_date.weekday()),
    };
    let week_start = match rule.freq {
        Freq::Daily => None,
        Freq::Weekly => anchor_date.checked_sub_days(Days::new(u64::from(
            anchor_date.weekday().num_days_from_monday(),
        ))),
    };
    OccurrenceIter {
        freq: rule.freq,
        interval: rule.interval,
        count: rule.count,
        until_ms: rule.until.map(|u| u.timestamp_millis()),
        tz,
        window,
        exdates: exdates.clone(),
        anchor_local,
        time_of_day: anchor_local.time(),
        next_date: match rule.freq {
            Freq::Daily => Some(anchor_date),
            Freq::Weekly => None,
        },
        week_start,
        byday,
        day_idx: 0,
        produced: 0,
        done: false,
    }
}

/// UTC instant of the series' first occurrence, or `None` for a rule whose
/// bound excludes even the anchor (e.g. `UNTIL` before it).
pub fn first_occurrence_utc_ms(
    rule: &RecurrenceRule,
    anchor_local: NaiveDateTime,
    tz: Tz,
) -> Option<i64> {
    expand(
        rule,
        anchor_local,
        tz,
        WindowUtc::unbounded(),
        &BTreeSet::new(),
    )
    .next()
}

/// Materialize the series' occurrence instants up to its `COUNT`/`UNTIL`
/// bound, capped at `cap` for unbounded or very long series. Used by
/// write-time EXDATE validation.
pub fn occurrences_up_to_bound(
    rule: &RecurrenceRule,
    anchor_local: NaiveDateTime,
    tz: Tz,
    cap: usize,
) -> Vec<i64> {
    expand(
        rule,
        anchor_local,
        tz,
        WindowUtc::unbounded(),
        &BTreeSet::new(),
    )
    .take(cap)
    .collect()
}

impl OccurrenceIter {
    /// Next candidate local wall-clock datetime, advancing the cursor.
    /// Weekly candidates earlier than the anchor (same week, earlier
    /// weekday) are not occurrences and are passed over here.
    fn next_local(&mut self) -> Option<NaiveDateTime> {
        match self.freq {
            Freq::Daily => {
                let date = self.next_date?;
                self.next_date = date.checked_add_days(Days::new(u64::from(self.interval)));
                Some(date.and_time(self.time_of_day))
            }
            Freq::Weekly => loop {
                let week = self.week_start?;
                if self.day_idx >= self.byday.len() {
                    self.week_start =
                        week.checked_add_days(Days::new(7 * u64::from(self.interval)));
                    self.day_idx = 0;
                    continue;
                }
                let day = self.byday[self.day_idx];
                self.day_idx += 1;
                let date = week.checked_add_days(Days::new(u64::from(
                    day.num_days_from_monday(),
                )))?;
                let candidate = date.and_time(self.time_of_day);
                if candidate < self.anchor_local {
                    continue;
                }
                return Some(candidate);
            },
        }
    }
}

impl Iterator for OccurrenceIter {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        if self.done {
            return None;
        }
        loop {
            if let Some(count) = self.count {
                if self.produced >= count {
                    self.done = true;
                    return None;
                }
            }
            let Some(local) = self.next_local() else {
                self.done = true;
                return None;
            };
            let utc_ms = resolve_local(self.tz, local)
                .with_timezone(&Utc)
                .timestamp_millis();
            if let Some(until) = self.until_ms {
                if utc_ms > until {
                    self.done = true;
                    return None;
                }
            }
            // A real occurrence: consumes the COUNT bound even when excluded
            // or outside the window.
            self.produced += 1;
            if utc_ms >= self.window.to {
                self.done = true;
                return None;
            }
            if self.exdates.contains(&utc_ms) {
                continue;
            }
            if utc_ms < self.window.from {
                continue;
            }
            return Some(utc_ms);
        }
    }
}

impl std::iter::FusedIterator for OccurrenceIter {}
