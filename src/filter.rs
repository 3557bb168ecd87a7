//! Turns caller-supplied query parameters into typed filters.
//!
//! Every parameter arrives as an optional string. Validation happens once,
//! here, and the resulting [`ListFilter`] / [`StatsFilter`] can only describe
//! legal combinations: an exact day or an inclusive range, never both.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use crate::models::{AttendanceRecord, AttendanceStatus, NewAttendance};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid '{param}' value '{value}': expected a date formatted YYYY-MM-DD")]
    InvalidDate { param: &'static str, value: String },
    #[error("'dateFrom' ({from}) must not be after 'dateTo' ({to})")]
    InvertedRange { from: NaiveDate, to: NaiveDate },
    #[error("'dateFrom' and 'dateTo' must be supplied together")]
    IncompleteRange,
    #[error("'date' cannot be combined with 'dateFrom'/'dateTo'")]
    ConflictingDateFilters,
    #[error("missing required filter: supply 'date', 'dateFrom' and 'dateTo', or 'studentName'")]
    MissingFilter,
    #[error("{0}")]
    InvalidStatus(String),
    #[error("missing required fields (date, studentName, status)")]
    MissingFields,
}

/// Restrictions on record fields shared by listing and statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldFilter {
    pub student_name: Option<String>,
    pub subject: Option<String>,
    pub section: Option<String>,
    pub status: Option<AttendanceStatus>,
}

impl FieldFilter {
    pub fn matches(&self, record: &AttendanceRecord) -> bool {
        self.student_name
            .as_deref()
            .map_or(true, |name| record.student_name == name)
            && self
                .subject
                .as_deref()
                .map_or(true, |subject| record.subject.as_deref() == Some(subject))
            && self
                .section
                .as_deref()
                .map_or(true, |section| record.section.as_deref() == Some(section))
            && self.status.map_or(true, |status| record.status == status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateScope {
    Exact(NaiveDate),
    Range { from: NaiveDate, to: NaiveDate },
}

impl DateScope {
    pub fn contains(&self, date: NaiveDate) -> bool {
        match *self {
            Self::Exact(day) => date == day,
            Self::Range { from, to } => from <= date && date <= to,
        }
    }
}

/// Filter for the record listing. At least one of `scope` or
/// `fields.student_name` is always set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListFilter {
    pub scope: Option<DateScope>,
    pub fields: FieldFilter,
}

impl ListFilter {
    pub fn matches(&self, record: &AttendanceRecord) -> bool {
        self.scope.map_or(true, |scope| scope.contains(record.date)) && self.fields.matches(record)
    }
}

/// Bound on the records a statistics computation reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordWindow {
    RecordedSince(DateTime<Utc>),
    Dates { from: NaiveDate, to: NaiveDate },
}

impl RecordWindow {
    pub fn contains(&self, record: &AttendanceRecord) -> bool {
        match *self {
            Self::RecordedSince(since) => record.recorded_at >= since,
            Self::Dates { from, to } => from <= record.date && record.date <= to,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsWindow {
    /// Each computation uses its own rolling window ending today.
    Rolling,
    /// Inclusive range over the record `date`.
    Range { from: NaiveDate, to: NaiveDate },
    /// Everything recorded since the configured history epoch.
    FullHistory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsFilter {
    pub window: StatsWindow,
    pub fields: FieldFilter,
}

impl StatsFilter {
    pub fn status(&self) -> AttendanceStatus {
        self.fields.status.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceQuery {
    pub date: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub student_name: Option<String>,
    pub subject: Option<String>,
    pub section: Option<String>,
    #[serde(alias = "estado")]
    pub status: Option<String>,
    pub full_history: Option<String>,
}

impl AttendanceQuery {
    pub fn into_list_filter(self) -> Result<ListFilter, FilterError> {
        let date = parse_optional_date("date", self.date.as_deref())?;
        let range = parse_range(self.date_from.as_deref(), self.date_to.as_deref())?;

        let scope = match (date, range) {
            (Some(_), Some(_)) => return Err(FilterError::ConflictingDateFilters),
            (Some(day), None) => Some(DateScope::Exact(day)),
            (None, Some((from, to))) => Some(DateScope::Range { from, to }),
            (None, None) => None,
        };

        let fields = FieldFilter {
            student_name: non_empty(self.student_name),
            subject: non_empty(self.subject),
            section: non_empty(self.section),
            status: parse_optional_status(self.status.as_deref())?,
        };

        if scope.is_none() && fields.student_name.is_none() {
            return Err(FilterError::MissingFilter);
        }

        Ok(ListFilter { scope, fields })
    }

    pub fn into_stats_filter(self) -> Result<StatsFilter, FilterError> {
        let from = parse_optional_date("dateFrom", self.date_from.as_deref())?;
        let to = parse_optional_date("dateTo", self.date_to.as_deref())?;
        let full_history = self
            .full_history
            .as_deref()
            .is_some_and(|flag| flag.trim().eq_ignore_ascii_case("true"));

        let window = if full_history {
            StatsWindow::FullHistory
        } else {
            match (from, to) {
                (Some(from), Some(to)) if from > to => {
                    return Err(FilterError::InvertedRange { from, to })
                }
                (Some(from), Some(to)) => StatsWindow::Range { from, to },
                _ => StatsWindow::Rolling,
            }
        };

        let status = parse_optional_status(self.status.as_deref())?.unwrap_or_default();

        Ok(StatsFilter {
            window,
            fields: FieldFilter {
                student_name: non_empty(self.student_name),
                subject: non_empty(self.subject),
                section: non_empty(self.section),
                status: Some(status),
            },
        })
    }
}

/// Raw body of a record-attendance request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSubmission {
    pub date: Option<String>,
    pub student_name: Option<String>,
    pub status: Option<String>,
    pub subject: Option<String>,
    pub section: Option<String>,
}

impl AttendanceSubmission {
    pub fn validate(self) -> Result<NewAttendance, FilterError> {
        let (Some(date), Some(student_name), Some(status)) = (
            non_empty(self.date),
            non_empty(self.student_name),
            non_empty(self.status),
        ) else {
            return Err(FilterError::MissingFields);
        };

        Ok(NewAttendance {
            date: parse_date("date", &date)?,
            student_name,
            status: status.parse().map_err(FilterError::InvalidStatus)?,
            subject: non_empty(self.subject),
            section: non_empty(self.section),
        })
    }
}

/// Parses a strict `YYYY-MM-DD` date. Shapes like `2024-4-1` are rejected
/// even though chrono would accept them.
pub fn parse_date(param: &'static str, value: &str) -> Result<NaiveDate, FilterError> {
    let invalid = || FilterError::InvalidDate {
        param,
        value: value.to_string(),
    };

    let bytes = value.as_bytes();
    let shaped = bytes.len() == 10
        && bytes.iter().enumerate().all(|(index, byte)| match index {
            4 | 7 => *byte == b'-',
            _ => byte.is_ascii_digit(),
        });
    if !shaped {
        return Err(invalid());
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| invalid())
}

fn parse_optional_date(
    param: &'static str,
    value: Option<&str>,
) -> Result<Option<NaiveDate>, FilterError> {
    value
        .filter(|raw| !raw.is_empty())
        .map(|raw| parse_date(param, raw))
        .transpose()
}

fn parse_range(
    from: Option<&str>,
    to: Option<&str>,
) -> Result<Option<(NaiveDate, NaiveDate)>, FilterError> {
    let from = parse_optional_date("dateFrom", from)?;
    let to = parse_optional_date("dateTo", to)?;
    match (from, to) {
        (None, None) => Ok(None),
        (Some(from), Some(to)) if from > to => Err(FilterError::InvertedRange { from, to }),
        (Some(from), Some(to)) => Ok(Some((from, to))),
        _ => Err(FilterError::IncompleteRange),
    }
}

fn parse_optional_status(value: Option<&str>) -> Result<Option<AttendanceStatus>, FilterError> {
    value
        .filter(|raw| !raw.trim().is_empty())
        .map(|raw| raw.parse().map_err(FilterError::InvalidStatus))
        .transpose()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|trimmed| !trimmed.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn strict_date_format_is_enforced() {
        assert_eq!(parse_date("date", "2024-04-01"), Ok(day(2024, 4, 1)));
        for raw in ["2024-4-01", "24-04-01", "2024/04/01", "2024-04-01T00:00", "2024-02-30"] {
            assert_eq!(
                parse_date("date", raw),
                Err(FilterError::InvalidDate {
                    param: "date",
                    value: raw.to_string()
                })
            );
        }
    }

    #[test]
    fn listing_requires_a_filter() {
        let err = AttendanceQuery::default().into_list_filter().unwrap_err();
        assert_eq!(err, FilterError::MissingFilter);

        let only_subject = AttendanceQuery {
            subject: Some("Math".to_string()),
            ..Default::default()
        };
        assert_eq!(only_subject.into_list_filter().unwrap_err(), FilterError::MissingFilter);
    }

    #[test]
    fn listing_by_student_alone_is_allowed() {
        let filter = AttendanceQuery {
            student_name: Some("Ana".to_string()),
            ..Default::default()
        }
        .into_list_filter()
        .unwrap();
        assert_eq!(filter.scope, None);
        assert_eq!(filter.fields.student_name.as_deref(), Some("Ana"));
        assert_eq!(filter.fields.status, None);
    }

    #[test]
    fn exact_and_range_are_mutually_exclusive() {
        let query = AttendanceQuery {
            date: Some("2024-04-01".to_string()),
            date_from: Some("2024-04-01".to_string()),
            date_to: Some("2024-04-05".to_string()),
            ..Default::default()
        };
        assert_eq!(
            query.into_list_filter().unwrap_err(),
            FilterError::ConflictingDateFilters
        );
    }

    #[test]
    fn half_open_range_is_rejected_for_listing() {
        let query = AttendanceQuery {
            date_from: Some("2024-04-01".to_string()),
            ..Default::default()
        };
        assert_eq!(query.into_list_filter().unwrap_err(), FilterError::IncompleteRange);
    }

    #[test]
    fn invalid_date_names_the_parameter() {
        let query = AttendanceQuery {
            date_from: Some("2024-04-01".to_string()),
            date_to: Some("april".to_string()),
            ..Default::default()
        };
        let err = query.into_stats_filter().unwrap_err();
        assert!(err.to_string().contains("'dateTo'"));
    }

    #[test]
    fn stats_window_resolution_order() {
        let full = AttendanceQuery {
            date_from: Some("2024-04-01".to_string()),
            date_to: Some("2024-04-30".to_string()),
            full_history: Some("true".to_string()),
            ..Default::default()
        }
        .into_stats_filter()
        .unwrap();
        assert_eq!(full.window, StatsWindow::FullHistory);

        let ranged = AttendanceQuery {
            date_from: Some("2024-04-01".to_string()),
            date_to: Some("2024-04-30".to_string()),
            ..Default::default()
        }
        .into_stats_filter()
        .unwrap();
        assert_eq!(
            ranged.window,
            StatsWindow::Range {
                from: day(2024, 4, 1),
                to: day(2024, 4, 30)
            }
        );

        let half = AttendanceQuery {
            date_from: Some("2024-04-01".to_string()),
            ..Default::default()
        }
        .into_stats_filter()
        .unwrap();
        assert_eq!(half.window, StatsWindow::Rolling);
        assert_eq!(half.status(), AttendanceStatus::Present);
    }

    #[test]
    fn stats_status_accepts_spanish_alias() {
        let query: AttendanceQuery = serde_json::from_value(serde_json::json!({
            "estado": "Ausente"
        }))
        .unwrap();
        let filter = query.into_stats_filter().unwrap();
        assert_eq!(filter.status(), AttendanceStatus::Absent);
    }

    #[test]
    fn unknown_status_is_rejected() {
        let query = AttendanceQuery {
            status: Some("Late".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            query.into_stats_filter(),
            Err(FilterError::InvalidStatus(_))
        ));
    }

    #[test]
    fn submission_requires_core_fields() {
        let submission = AttendanceSubmission {
            date: Some("2024-04-01".to_string()),
            student_name: Some("   ".to_string()),
            status: Some("Present".to_string()),
            ..Default::default()
        };
        assert_eq!(submission.validate().unwrap_err(), FilterError::MissingFields);
    }

    #[test]
    fn submission_trims_and_parses() {
        let attendance = AttendanceSubmission {
            date: Some("2024-04-01".to_string()),
            student_name: Some(" Ana ".to_string()),
            status: Some("Presente".to_string()),
            subject: Some(String::new()),
            section: Some("B".to_string()),
        }
        .validate()
        .unwrap();
        assert_eq!(attendance.student_name, "Ana");
        assert_eq!(attendance.status, AttendanceStatus::Present);
        assert_eq!(attendance.subject, None);
        assert_eq!(attendance.section.as_deref(), Some("B"));
    }

    #[test]
    fn single_day_range_matches_exact_scope() {
        let exact = DateScope::Exact(day(2024, 4, 1));
        let range = DateScope::Range {
            from: day(2024, 4, 1),
            to: day(2024, 4, 1),
        };
        for candidate in [day(2024, 3, 31), day(2024, 4, 1), day(2024, 4, 2)] {
            assert_eq!(exact.contains(candidate), range.contains(candidate));
        }
    }
}
