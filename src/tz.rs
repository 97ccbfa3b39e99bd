use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::{time, time_errors::TimeErrorCode, AppResult};

/// Handle over the IANA timezone data the engine resolves against.
///
/// Passed explicitly into every component that converts wall-clock times so
/// that drift checking can name the data version a cached instant was
/// computed under. Never a process-wide singleton.
#[derive(Debug, Clone)]
pub struct TzDb {
    version: String,
}

impl TzDb {
    /// The timezone data compiled into the binary.
    pub fn bundled() -> Self {
        TzDb {
            version: chrono_tz::IANA_TZDB_VERSION.to_string(),
        }
    }

    /// IANA release label of the underlying data (e.g. `2024a`).
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Resolve an IANA zone name. Unknown names fail with `E_TZ_UNKNOWN`.
    pub fn resolve(&self, name: &str) -> AppResult<Tz> {
        name.trim().parse::<Tz>().map_err(|_| {
            TimeErrorCode::TimezoneUnknown
                .into_error()
                .with_context("timezone", name.to_string())
                .with_context("tzdb", self.version.clone())
        })
    }

    /// Effective zone for an event: event `tz` if present, else the household
    /// fallback, else UTC. A present-but-unknown name is an error at either
    /// step; blank strings are treated as absent.
    pub fn effective_tz(
        &self,
        event_tz: Option<&str>,
        household_tz: Option<&str>,
    ) -> AppResult<Tz> {
        if let Some(name) = non_blank(event_tz) {
            return self.resolve(name);
        }
        if let Some(name) = non_blank(household_tz) {
            return self.resolve(name);
        }
        Ok(chrono_tz::UTC)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// Resolve a local wall-clock datetime against `tz` using the zone's actual
/// offset at that wall-clock date.
///
/// DST policy: a time inside a spring-forward gap shifts forward to the first
/// valid instant after the gap; an ambiguous fall-back time takes the earlier
/// of the two instants.
pub fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earlier, _later) => earlier,
        LocalResult::None => {
            // Inside a gap. Applying the pre-transition offset shifts the
            // wall-clock value forward by exactly the width of the gap.
            // Sampling a day earlier keeps the lookup on the pre-gap side
            // regardless of the zone's offset sign.
            let offset = tz
                .offset_from_utc_datetime(&(naive - Duration::days(1)))
                .fix();
            (naive - offset).and_utc().with_timezone(&tz)
        }
    }
}

/// Interpret `local_ms` as wall-clock milliseconds in `tz` and return the
/// corresponding absolute UTC instant. Each call evaluates the offset at
/// that specific wall-clock date, so callers may use it per occurrence.
pub fn local_ms_to_utc_ms(tz: Tz, local_ms: i64) -> AppResult<i64> {
    let naive = time::naive_from_ms(local_ms)?;
    Ok(resolve_local(tz, naive)
        .with_timezone(&Utc)
        .timestamp_millis())
}

/// Inverse projection: absolute UTC instant back to wall-clock milliseconds
/// in `tz`. Used for round-trip verification of computed caches.
pub fn utc_ms_to_local_ms(tz: Tz, utc_ms: i64) -> AppResult<i64> {
    let utc = time::utc_from_ms(utc_ms)?;
    Ok(utc
        .with_timezone(&tz)
        .naive_local()
        .and_utc()
        .timestamp_millis())
}
