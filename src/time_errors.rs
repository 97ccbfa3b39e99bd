use crate::AppError;

/// Stable taxonomy of timekeeping error codes.
///
/// The string forms are matched by the presentation layer and must never
/// change once shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeErrorCode {
    /// EXDATE input failed to parse as ISO-8601 UTC.
    ExdateInvalidFormat,
    /// EXDATE instant falls outside the recurrence window.
    ExdateOutOfRange,
    /// RRULE contains keys or values outside the supported grammar.
    RruleUnsupportedField,
    /// Event timezone string could not be resolved against the IANA database.
    TimezoneUnknown,
    /// A cached UTC instant no longer matches recomputation under current
    /// timezone data.
    TimezoneDriftDetected,
    /// Requested range window has an invalid ordering.
    RangeInvalid,
}

impl TimeErrorCode {
    /// Returns the stable machine-readable code string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TimeErrorCode::ExdateInvalidFormat => "E_EXDATE_INVALID_FORMAT",
            TimeErrorCode::ExdateOutOfRange => "E_EXDATE_OUT_OF_RANGE",
            TimeErrorCode::RruleUnsupportedField => "E_RRULE_UNSUPPORTED_FIELD",
            TimeErrorCode::TimezoneUnknown => "E_TZ_UNKNOWN",
            TimeErrorCode::TimezoneDriftDetected => "E_TZ_DRIFT_DETECTED",
            TimeErrorCode::RangeInvalid => "E_RANGE_INVALID",
        }
    }

    /// Returns the canonical developer-facing message associated with the code.
    #[must_use]
    pub fn developer_message(self) -> &'static str {
        match self {
            TimeErrorCode::ExdateInvalidFormat => {
                "Excluded dates must use ISO-8601 UTC format (YYYY-MM-DDTHH:MM:SSZ)."
            }
            TimeErrorCode::ExdateOutOfRange => {
                "Excluded dates must fall within the recurrence window."
            }
            TimeErrorCode::RruleUnsupportedField => {
                "Recurrence rule contains fields that are not supported."
            }
            TimeErrorCode::TimezoneUnknown => {
                "Timezone identifier could not be resolved to a known location."
            }
            TimeErrorCode::TimezoneDriftDetected => {
                "Stored event timestamps drifted away from their timezone offsets."
            }
            TimeErrorCode::RangeInvalid => {
                "The requested time range is invalid. Start must be before end."
            }
        }
    }

    /// Convenience helper to create an [`AppError`] with this taxonomy entry.
    #[must_use]
    pub fn into_error(self) -> AppError {
        AppError::new(self.as_str(), self.developer_message())
    }
}

/// User-facing copy for each taxonomy entry, as shown by the presentation
/// layer.
#[must_use]
pub fn all_time_error_specs() -> &'static [(TimeErrorCode, &'static str)] {
    &[
        (
            TimeErrorCode::ExdateInvalidFormat,
            "One or more excluded dates are invalid. Please check the format.",
        ),
        (
            TimeErrorCode::ExdateOutOfRange,
            "Excluded dates must fall within the recurrence window.",
        ),
        (
            TimeErrorCode::RruleUnsupportedField,
            "This repeat pattern is not yet supported.",
        ),
        (
            TimeErrorCode::TimezoneUnknown,
            "This event has an unrecognised timezone. Please edit and select a valid timezone.",
        ),
        (
            TimeErrorCode::TimezoneDriftDetected,
            "Event timestamps no longer align with their expected timezone offsets. \
             Review the affected items before continuing.",
        ),
        (
            TimeErrorCode::RangeInvalid,
            "Calendar queries need the start to come before the end.",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_strings() {
        assert_eq!(
            TimeErrorCode::ExdateInvalidFormat.as_str(),
            "E_EXDATE_INVALID_FORMAT"
        );
        assert_eq!(
            TimeErrorCode::ExdateOutOfRange.as_str(),
            "E_EXDATE_OUT_OF_RANGE"
        );
        assert_eq!(
            TimeErrorCode::RruleUnsupportedField.as_str(),
            "E_RRULE_UNSUPPORTED_FIELD"
        );
        assert_eq!(TimeErrorCode::TimezoneUnknown.as_str(), "E_TZ_UNKNOWN");
        assert_eq!(
            TimeErrorCode::TimezoneDriftDetected.as_str(),
            "E_TZ_DRIFT_DETECTED"
        );
    }

    #[test]
    fn into_error_carries_code_and_message() {
        let err = TimeErrorCode::TimezoneUnknown.into_error();
        assert_eq!(err.code(), "E_TZ_UNKNOWN");
        assert!(!err.message().is_empty());
    }

    #[test]
    fn every_code_has_user_copy() {
        let specs = all_time_error_specs();
        assert_eq!(specs.len(), 6);
        assert!(specs
            .iter()
            .any(|(code, copy)| *code == TimeErrorCode::TimezoneDriftDetected
                && copy.contains("Review the affected items before continuing")));
    }
}
