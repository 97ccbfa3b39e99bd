use chrono::{DateTime, NaiveDateTime, Utc, Weekday};

use crate::{time_errors::TimeErrorCode, AppError, AppResult};

/// Supported recurrence frequencies. The grammar is deliberately restricted;
/// anything else is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freq {
    Daily,
    Weekly,
}

/// A validated recurrence rule.
///
/// `byday` is kept sorted by days-from-Monday and deduplicated; an empty set
/// means "the anchor's weekday" (resolved by the expander, which knows the
/// anchor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRule {
    pub freq: Freq,
    pub interval: u32,
    pub count: Option<u32>,
    pub until: Option<DateTime<Utc>>,
    pub byday: Vec<Weekday>,
}

impl RecurrenceRule {
    /// Weekdays the series fires on, given the anchor's weekday.
    pub fn effective_byday(&self, anchor: Weekday) -> Vec<Weekday> {
        if self.byday.is_empty() {
            vec![anchor]
        } else {
            self.byday.clone()
        }
    }
}

fn unsupported(key: &str) -> AppError {
    TimeErrorCode::RruleUnsupportedField
        .into_error()
        .with_context("key", key.to_string())
}

fn weekday_from_code(code: &str) -> Option<Weekday> {
    match code {
        "MO" => Some(Weekday::Mon),
        "TU" => Some(Weekday::Tue),
        "WE" => Some(Weekday::Wed),
        "TH" => Some(Weekday::Thu),
        "FR" => Some(Weekday::Fri),
        "SA" => Some(Weekday::Sat),
        "SU" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Parse an UNTIL value in the RFC 5545 basic format (`YYYYMMDDTHHMMSSZ`).
fn parse_until(value: &str) -> Option<DateTime<Utc>> {
    if !value.ends_with('Z') {
        return None;
    }
    NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%SZ")
        .ok()
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

/// Parse and validate a recurrence rule string.
///
/// Recognized keys: `FREQ` (`DAILY`|`WEEKLY`), `INTERVAL`, `COUNT`, `UNTIL`,
/// `BYDAY` (weekly only). Any other key, a duplicated key, or a recognized
/// key with an out-of-grammar value fails with `E_RRULE_UNSUPPORTED_FIELD`
/// naming the offending key. Pure and total over well-formed input; a
/// malformed rule is never partially applied.
pub fn parse_rule(raw: &str) -> AppResult<RecurrenceRule> {
    let mut freq: Option<Freq> = None;
    let mut interval: Option<u32> = None;
    let mut count: Option<u32> = None;
    let mut until: Option<DateTime<Utc>> = None;
    let mut byday: Option<Vec<Weekday>> = None;

    for part in raw.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((key, value)) = part.split_once('=') else {
            return Err(unsupported(part));
        };
        let key = key.trim().to_ascii_uppercase();
        let value = value.trim();

        match key.as_str() {
            "FREQ" => {
                if freq.is_some() {
                    return Err(unsupported("FREQ"));
                }
                freq = Some(match value.to_ascii_uppercase().as_str() {
                    "DAILY" => Freq::Daily,
                    "WEEKLY" => Freq::Weekly,
                    _ => return Err(unsupported("FREQ")),
                });
            }
            "INTERVAL" => {
                if interval.is_some() {
                    return Err(unsupported("INTERVAL"));
                }
                let parsed: u32 = value.parse().map_err(|_| unsupported("INTERVAL"))?;
                if parsed == 0 {
                    return Err(unsupported("INTERVAL"));
                }
                interval = Some(parsed);
            }
            "COUNT" => {
                if count.is_some() {
                    return Err(unsupported("COUNT"));
                }
                let parsed: u32 = value.parse().map_err(|_| unsupported("COUNT"))?;
                if parsed == 0 {
                    return Err(unsupported("COUNT"));
                }
                count = Some(parsed);
            }
            "UNTIL" => {
                if until.is_some() {
                    return Err(unsupported("UNTIL"));
                }
                until = Some(parse_until(value).ok_or_else(|| unsupported("UNTIL"))?);
            }
            "BYDAY" => {
                if byday.is_some() {
                    return Err(unsupported("BYDAY"));
                }
                let mut days = Vec::new();
                for code in value.split(',') {
                    let code = code.trim().to_ascii_uppercase();
                    let day = weekday_from_code(&code).ok_or_else(|| unsupported("BYDAY"))?;
                    if !days.contains(&day) {
                        days.push(day);
                    }
                }
                if days.is_empty() {
                    return Err(unsupported("BYDAY"));
                }
                days.sort_by_key(|d| d.num_days_from_monday());
                byday = Some(days);
            }
            other => return Err(unsupported(other)),
        }
    }

    let Some(freq) = freq else {
        return Err(unsupported("FREQ"));
    };
    if byday.is_some() && freq != Freq::Weekly {
        return Err(unsupported("BYDAY"));
    }

    Ok(RecurrenceRule {
        freq,
        interval: interval.unwrap_or(1),
        count,
        until,
        byday: byday.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_daily_with_count() {
        let rule = parse_rule("FREQ=DAILY;INTERVAL=1;COUNT=5").unwrap();
        assert_eq!(rule.freq, Freq::Daily);
        assert_eq!(rule.interval, 1);
        assert_eq!(rule.count, Some(5));
        assert!(rule.until.is_none());
        assert!(rule.byday.is_empty());
    }

    #[test]
    fn parses_weekly_with_byday_sorted() {
        let rule = parse_rule("FREQ=WEEKLY;BYDAY=FR,MO,WE;COUNT=6").unwrap();
        assert_eq!(rule.freq, Freq::Weekly);
        assert_eq!(rule.byday, vec![Weekday::Mon, Weekday::Wed, Weekday::Fri]);
    }

    #[test]
    fn parses_until_basic_format() {
        let rule = parse_rule("FREQ=DAILY;UNTIL=20250101T000000Z").unwrap();
        assert_eq!(
            rule.until,
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn interval_defaults_to_one() {
        let rule = parse_rule("FREQ=WEEKLY").unwrap();
        assert_eq!(rule.interval, 1);
    }

    #[test]
    fn rejects_unknown_key_naming_it() {
        let err = parse_rule("FREQ=DAILY;BYMONTH=2").unwrap_err();
        assert_eq!(err.code(), "E_RRULE_UNSUPPORTED_FIELD");
        assert_eq!(err.context().get("key"), Some(&"BYMONTH".to_string()));
    }

    #[test]
    fn rejects_unsupported_freq_value() {
        let err = parse_rule("FREQ=MONTHLY").unwrap_err();
        assert_eq!(err.code(), "E_RRULE_UNSUPPORTED_FIELD");
        assert_eq!(err.context().get("key"), Some(&"FREQ".to_string()));
    }

    #[test]
    fn rejects_byday_on_daily() {
        let err = parse_rule("FREQ=DAILY;BYDAY=MO").unwrap_err();
        assert_eq!(err.context().get("key"), Some(&"BYDAY".to_string()));
    }

    #[test]
    fn rejects_zero_interval_and_count() {
        assert!(parse_rule("FREQ=DAILY;INTERVAL=0").is_err());
        assert!(parse_rule("FREQ=DAILY;COUNT=0").is_err());
    }

    #[test]
    fn rejects_missing_freq() {
        let err = parse_rule("INTERVAL=2").unwrap_err();
        assert_eq!(err.context().get("key"), Some(&"FREQ".to_string()));
    }

    #[test]
    fn rejects_duplicate_keys() {
        let err = parse_rule("FREQ=DAILY;FREQ=WEEKLY").unwrap_err();
        assert_eq!(err.context().get("key"), Some(&"FREQ".to_string()));
    }

    #[test]
    fn rejects_non_utc_until() {
        assert!(parse_rule("FREQ=DAILY;UNTIL=20250101T000000").is_err());
    }

    #[test]
    fn byday_defaults_to_anchor_weekday() {
        let rule = parse_rule("FREQ=WEEKLY;COUNT=3").unwrap();
        assert_eq!(rule.effective_byday(Weekday::Thu), vec![Weekday::Thu]);
    }
}
