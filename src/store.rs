use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Mutex;

use crate::config::DuplicatePolicy;
use crate::filter::{FieldFilter, ListFilter, RecordWindow};
use crate::models::AttendanceRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("DATABASE_URL is not configured")]
    NotConfigured,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{student_name} already has an attendance record for {date}")]
    Duplicate {
        student_name: String,
        date: NaiveDate,
    },
    #[error("class counter cannot grow past {}", i64::MAX)]
    CounterOverflow,
}

/// Persistence for attendance records and the class-session counter.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    /// Insert a record. Under [`DuplicatePolicy::OnePerDay`] a second record
    /// for the same student and date fails with [`StoreError::Duplicate`].
    async fn insert_record(
        &self,
        record: &AttendanceRecord,
        policy: DuplicatePolicy,
    ) -> Result<(), StoreError>;

    /// Records matching the filter, oldest `recorded_at` first.
    async fn list_records(&self, filter: &ListFilter) -> Result<Vec<AttendanceRecord>, StoreError>;

    /// Records matching the field filter inside `window`.
    async fn records_in(
        &self,
        fields: &FieldFilter,
        window: RecordWindow,
    ) -> Result<Vec<AttendanceRecord>, StoreError>;

    /// All-time record count per student name, restricted by the field filter.
    async fn student_totals(
        &self,
        fields: &FieldFilter,
    ) -> Result<HashMap<String, i64>, StoreError>;

    /// Current counter value, 0 when the counter has never been written.
    async fn class_count(&self) -> Result<i64, StoreError>;

    /// Like [`Self::class_count`], but creates the counter at 0 if missing.
    async fn class_count_or_init(&self) -> Result<i64, StoreError>;

    /// Atomically add `by` (>= 1) to the counter, creating it if needed.
    /// Fails with [`StoreError::CounterOverflow`] and leaves the counter
    /// unchanged when the sum does not fit in an `i64`.
    async fn increment_class_count(&self, by: i64) -> Result<i64, StoreError>;
}

/// Store kept entirely in memory. Backs `serve --in-memory` and the tests.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<AttendanceRecord>>,
    class_count: Mutex<Option<i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttendanceStore for MemoryStore {
    async fn insert_record(
        &self,
        record: &AttendanceRecord,
        policy: DuplicatePolicy,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if policy == DuplicatePolicy::OnePerDay
            && records.iter().any(|existing| {
                existing.student_name == record.student_name && existing.date == record.date
            })
        {
            return Err(StoreError::Duplicate {
                student_name: record.student_name.clone(),
                date: record.date,
            });
        }
        records.push(record.clone());
        Ok(())
    }

    async fn list_records(&self, filter: &ListFilter) -> Result<Vec<AttendanceRecord>, StoreError> {
        let records = self.records.lock().await;
        let mut matching: Vec<AttendanceRecord> = records
            .iter()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        matching.sort_by_key(|record| record.recorded_at);
        Ok(matching)
    }

    async fn records_in(
        &self,
        fields: &FieldFilter,
        window: RecordWindow,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|record| window.contains(record) && fields.matches(record))
            .cloned()
            .collect())
    }

    async fn student_totals(
        &self,
        fields: &FieldFilter,
    ) -> Result<HashMap<String, i64>, StoreError> {
        let records = self.records.lock().await;
        let mut totals = HashMap::new();
        for record in records.iter().filter(|record| fields.matches(record)) {
            *totals.entry(record.student_name.clone()).or_insert(0) += 1;
        }
        Ok(totals)
    }

    async fn class_count(&self) -> Result<i64, StoreError> {
        Ok(self.class_count.lock().await.unwrap_or(0))
    }

    async fn class_count_or_init(&self) -> Result<i64, StoreError> {
        Ok(*self.class_count.lock().await.get_or_insert(0))
    }

    async fn increment_class_count(&self, by: i64) -> Result<i64, StoreError> {
        let mut count = self.class_count.lock().await;
        let next = count
            .unwrap_or(0)
            .checked_add(by)
            .ok_or(StoreError::CounterOverflow)?;
        *count = Some(next);
        Ok(next)
    }
}
