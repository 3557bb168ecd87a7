use std::io::{Read, Write};

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::DuplicatePolicy;
use crate::filter::AttendanceSubmission;
use crate::models::AttendanceRecord;
use crate::store::{AttendanceStore, StoreError};

#[derive(Debug, Deserialize)]
struct ImportRow {
    date: String,
    student_name: String,
    status: String,
    subject: Option<String>,
    section: Option<String>,
}

#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    id: String,
    date: String,
    student_name: &'a str,
    status: &'static str,
    subject: &'a str,
    section: &'a str,
    recorded_at: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub inserted: usize,
    pub skipped_duplicates: usize,
}

/// Reads `date,student_name,status,subject,section` rows and stores each one.
/// Rows are validated like HTTP submissions; the first invalid row aborts the
/// import with its line number.
pub async fn import_csv<R: Read>(
    store: &dyn AttendanceStore,
    reader: R,
    policy: DuplicatePolicy,
) -> anyhow::Result<ImportSummary> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut summary = ImportSummary::default();

    for (index, result) in reader.deserialize::<ImportRow>().enumerate() {
        // Header is line 1.
        let line = index + 2;
        let row = result.with_context(|| format!("malformed CSV row on line {line}"))?;
        let attendance = AttendanceSubmission {
            date: Some(row.date),
            student_name: Some(row.student_name),
            status: Some(row.status),
            subject: row.subject,
            section: row.section,
        }
        .validate()
        .with_context(|| format!("invalid attendance on line {line}"))?;

        let record = attendance.into_record(Utc::now());
        match store.insert_record(&record, policy).await {
            Ok(()) => summary.inserted += 1,
            Err(StoreError::Duplicate { student_name, date }) => {
                warn!(line, %student_name, %date, "skipping duplicate attendance");
                summary.skipped_duplicates += 1;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to store line {line}"));
            }
        }
    }

    info!(
        inserted = summary.inserted,
        skipped = summary.skipped_duplicates,
        "CSV import finished"
    );
    Ok(summary)
}

pub fn export_csv<W: Write>(records: &[AttendanceRecord], writer: W) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    for record in records {
        writer.serialize(ExportRow {
            id: record.id.to_string(),
            date: record.date.format("%Y-%m-%d").to_string(),
            student_name: &record.student_name,
            status: record.status.as_str(),
            subject: record.subject.as_deref().unwrap_or_default(),
            section: record.section.as_deref().unwrap_or_default(),
            recorded_at: record.recorded_at.to_rfc3339(),
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};

    use super::*;
    use crate::filter::{DateScope, FieldFilter, ListFilter};
    use crate::models::{AttendanceStatus, NewAttendance};
    use crate::store::MemoryStore;

    const CSV: &str = "\
date,student_name,status,subject,section
2024-04-01,Ana,Present,Math,A
2024-04-01,Ben,Ausente,,
2024-04-01,Ana,Present,Math,A
";

    #[tokio::test]
    async fn imports_rows_and_honours_duplicate_policy() {
        let store = MemoryStore::new();
        let summary = import_csv(&store, CSV.as_bytes(), DuplicatePolicy::OnePerDay)
            .await
            .unwrap();
        assert_eq!(
            summary,
            ImportSummary {
                inserted: 2,
                skipped_duplicates: 1
            }
        );

        let filter = ListFilter {
            scope: Some(DateScope::Exact(NaiveDate::from_ymd_opt(2024, 4, 1).unwrap())),
            fields: FieldFilter::default(),
        };
        let records = store.list_records(&filter).await.unwrap();
        assert_eq!(records.len(), 2);
        let ben = records.iter().find(|r| r.student_name == "Ben").unwrap();
        assert_eq!(ben.status, AttendanceStatus::Absent);
        assert_eq!(ben.subject, None);
    }

    #[tokio::test]
    async fn invalid_row_reports_its_line() {
        let store = MemoryStore::new();
        let csv = "\
date,student_name,status,subject,section
2024-04-01,Ana,Present,,
04/02/2024,Ben,Present,,
";
        let err = import_csv(&store, csv.as_bytes(), DuplicatePolicy::Allow)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn export_writes_header_and_rows() {
        let record = NewAttendance {
            date: NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
            student_name: "Ana".to_string(),
            status: AttendanceStatus::Justified,
            subject: None,
            section: Some("A".to_string()),
        }
        .into_record(Utc.with_ymd_and_hms(2024, 4, 1, 9, 30, 0).unwrap());

        let mut out = Vec::new();
        export_csv(std::slice::from_ref(&record), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("id,date,student_name,status,subject,section,recorded_at")
        );
        assert_eq!(
            lines.next(),
            Some(
                format!("{},2024-04-01,Ana,Justified,,A,2024-04-01T09:30:00+00:00", record.id)
                    .as_str()
            )
        );
        assert_eq!(lines.next(), None);
    }
}
