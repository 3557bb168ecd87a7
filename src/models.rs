use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AttendanceStatus {
    #[default]
    #[serde(alias = "Presente")]
    Present,
    #[serde(alias = "Ausente")]
    Absent,
    #[serde(alias = "Justificado")]
    Justified,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "Present",
            Self::Absent => "Absent",
            Self::Justified => "Justified",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "Present" | "Presente" => Ok(Self::Present),
            "Absent" | "Ausente" => Ok(Self::Absent),
            "Justified" | "Justificado" => Ok(Self::Justified),
            other => Err(format!(
                "unknown attendance status '{other}' (expected Present, Absent or Justified)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub date: NaiveDate,
    pub student_name: String,
    pub status: AttendanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// A validated attendance submission, not yet stamped or stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttendance {
    pub date: NaiveDate,
    pub student_name: String,
    pub status: AttendanceStatus,
    pub subject: Option<String>,
    pub section: Option<String>,
}

impl NewAttendance {
    pub fn into_record(self, recorded_at: DateTime<Utc>) -> AttendanceRecord {
        AttendanceRecord {
            id: Uuid::new_v4(),
            date: self.date,
            student_name: self.student_name,
            status: self.status,
            subject: self.subject,
            section: self.section,
            recorded_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyStat {
    pub date: NaiveDate,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekStat {
    pub week_start_date: NaiveDate,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthStat {
    /// `YYYY-MM`
    pub month: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentStat {
    pub student_name: String,
    pub attendance_count: i64,
    pub total_attendance_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendSummary {
    pub direction: TrendDirection,
    pub percentage: f64,
}

impl TrendSummary {
    pub fn stable() -> Self {
        Self {
            direction: TrendDirection::Stable,
            percentage: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsReport {
    pub daily_stats: Vec<DailyStat>,
    pub weekly_stats: Vec<WeekStat>,
    pub monthly_stats: Vec<MonthStat>,
    pub student_stats: Vec<StudentStat>,
    pub total_classes_held: i64,
    pub total_unique_students: usize,
    pub average_attendance_per_class: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_attendance_day: Option<DailyStat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worst_attendance_day: Option<DailyStat>,
    pub attendance_trend: TrendSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_accepts_spanish_labels() {
        assert_eq!("Presente".parse::<AttendanceStatus>(), Ok(AttendanceStatus::Present));
        assert_eq!("Ausente".parse::<AttendanceStatus>(), Ok(AttendanceStatus::Absent));
        assert_eq!(
            "Justificado".parse::<AttendanceStatus>(),
            Ok(AttendanceStatus::Justified)
        );
        assert!("Late".parse::<AttendanceStatus>().is_err());
    }

    #[test]
    fn record_serializes_camel_case_and_skips_empty_fields() {
        let record = NewAttendance {
            date: NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
            student_name: "Ana".to_string(),
            status: AttendanceStatus::Present,
            subject: None,
            section: Some("B".to_string()),
        }
        .into_record(Utc::now());

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["studentName"], "Ana");
        assert_eq!(value["date"], "2024-04-01");
        assert_eq!(value["status"], "Present");
        assert_eq!(value["section"], "B");
        assert!(value.get("subject").is_none());
        assert!(value.get("recordedAt").is_some());
    }

    #[test]
    fn trend_direction_serializes_lowercase() {
        let value = serde_json::to_value(TrendSummary::stable()).unwrap();
        assert_eq!(value["direction"], "stable");
        assert_eq!(value["percentage"], 0.0);
    }
}
