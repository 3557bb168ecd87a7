use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DuplicatePolicy;
use crate::filter::{DateScope, FieldFilter, ListFilter, RecordWindow};
use crate::models::{AttendanceRecord, AttendanceStatus};
use crate::store::{AttendanceStore, StoreError};

pub const CLASS_COUNTER_KEY: &str = "classSettings";

const RECORD_COLUMNS: &str =
    "id, date, student_name, status, subject, section, recorded_at FROM attendance.records";

/// Connection pool created on first use and shared by every request.
///
/// A query failing with a connection-level error drops the pool it ran on so
/// the next request reconnects. A missing connection string is reported per
/// request as [`StoreError::NotConfigured`].
pub struct LazyPool {
    database_url: Option<String>,
    max_connections: u32,
    cached: Mutex<CachedPool>,
}

#[derive(Default)]
struct CachedPool {
    generation: u64,
    pool: Option<PgPool>,
}

impl CachedPool {
    fn install(&mut self, pool: PgPool) -> PoolLease {
        self.generation += 1;
        self.pool = Some(pool.clone());
        PoolLease {
            pool,
            generation: self.generation,
        }
    }
}

/// A pool checked out of [`LazyPool`], tagged with the connection it belongs to.
struct PoolLease {
    pool: PgPool,
    generation: u64,
}

impl LazyPool {
    pub fn new(database_url: Option<String>, max_connections: u32) -> Self {
        Self {
            database_url,
            max_connections,
            cached: Mutex::new(CachedPool::default()),
        }
    }

    pub async fn get(&self) -> Result<PgPool, StoreError> {
        Ok(self.lease().await?.pool)
    }

    async fn lease(&self) -> Result<PoolLease, StoreError> {
        let database_url = self
            .database_url
            .as_deref()
            .ok_or(StoreError::NotConfigured)?;

        let mut cached = self.cached.lock().await;
        if let Some(pool) = cached.pool.as_ref().filter(|pool| !pool.is_closed()) {
            return Ok(PoolLease {
                pool: pool.clone(),
                generation: cached.generation,
            });
        }

        info!(max_connections = self.max_connections, "connecting to Postgres");
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(database_url)
            .await?;
        Ok(cached.install(pool))
    }

    /// Passes `result` through. A connection failure drops the leased pool,
    /// unless it has already been replaced.
    async fn observe<T>(
        &self,
        lease: &PoolLease,
        result: Result<T, sqlx::Error>,
    ) -> Result<T, StoreError> {
        if let Err(err) = &result {
            if is_connection_error(err) {
                let stale = {
                    let mut cached = self.cached.lock().await;
                    if cached.generation == lease.generation {
                        cached.pool.take()
                    } else {
                        None
                    }
                };
                if let Some(pool) = stale {
                    warn!(error = %err, "dropping Postgres pool after connection failure");
                    pool.close().await;
                }
            }
        }
        result.map_err(StoreError::from)
    }
}

fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// SQLSTATE 22003, `numeric_value_out_of_range`.
fn is_numeric_overflow(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("22003"),
        _ => false,
    }
}

pub struct PgStore {
    pool: LazyPool,
}

impl PgStore {
    pub fn new(pool: LazyPool) -> Self {
        Self { pool }
    }

    pub async fn pool(&self) -> Result<PgPool, StoreError> {
        self.pool.get().await
    }
}

fn record_from_row(row: &PgRow) -> Result<AttendanceRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(AttendanceRecord {
        id: row.try_get("id")?,
        date: row.try_get("date")?,
        student_name: row.try_get("student_name")?,
        status: status
            .parse::<AttendanceStatus>()
            .map_err(|err| sqlx::Error::Decode(err.into()))?,
        subject: row.try_get("subject")?,
        section: row.try_get("section")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn push_record_window(query: &mut QueryBuilder<'_, Postgres>, window: RecordWindow) {
    match window {
        RecordWindow::RecordedSince(since) => {
            query.push(" AND recorded_at >= ").push_bind(since);
        }
        RecordWindow::Dates { from, to } => {
            query
                .push(" AND date BETWEEN ")
                .push_bind(from)
                .push(" AND ")
                .push_bind(to);
        }
    }
}

fn push_field_filter(query: &mut QueryBuilder<'_, Postgres>, fields: &FieldFilter) {
    if let Some(name) = &fields.student_name {
        query.push(" AND student_name = ").push_bind(name.clone());
    }
    if let Some(subject) = &fields.subject {
        query.push(" AND subject = ").push_bind(subject.clone());
    }
    if let Some(section) = &fields.section {
        query.push(" AND section = ").push_bind(section.clone());
    }
    if let Some(status) = fields.status {
        query.push(" AND status = ").push_bind(status.as_str());
    }
}

#[async_trait]
impl AttendanceStore for PgStore {
    async fn insert_record(
        &self,
        record: &AttendanceRecord,
        policy: DuplicatePolicy,
    ) -> Result<(), StoreError> {
        let lease = self.pool.lease().await?;
        let sql = match policy {
            DuplicatePolicy::Allow => {
                r#"
                INSERT INTO attendance.records
                (id, date, student_name, status, subject, section, recorded_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#
            }
            DuplicatePolicy::OnePerDay => {
                r#"
                INSERT INTO attendance.records
                (id, date, student_name, status, subject, section, recorded_at)
                SELECT $1, $2, $3, $4, $5, $6, $7
                WHERE NOT EXISTS (
                    SELECT 1 FROM attendance.records WHERE student_name = $3 AND date = $2
                )
                "#
            }
        };

        let result = sqlx::query(sql)
            .bind(record.id)
            .bind(record.date)
            .bind(&record.student_name)
            .bind(record.status.as_str())
            .bind(&record.subject)
            .bind(&record.section)
            .bind(record.recorded_at)
            .execute(&lease.pool)
            .await;
        let result = self.pool.observe(&lease, result).await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate {
                student_name: record.student_name.clone(),
                date: record.date,
            });
        }
        Ok(())
    }

    async fn list_records(&self, filter: &ListFilter) -> Result<Vec<AttendanceRecord>, StoreError> {
        let lease = self.pool.lease().await?;
        let mut query = QueryBuilder::<Postgres>::new("SELECT ");
        query.push(RECORD_COLUMNS).push(" WHERE TRUE");
        match filter.scope {
            Some(DateScope::Exact(day)) => {
                query.push(" AND date = ").push_bind(day);
            }
            Some(DateScope::Range { from, to }) => {
                query
                    .push(" AND date BETWEEN ")
                    .push_bind(from)
                    .push(" AND ")
                    .push_bind(to);
            }
            None => {}
        }
        push_field_filter(&mut query, &filter.fields);
        query.push(" ORDER BY recorded_at ASC");

        let rows = query.build().fetch_all(&lease.pool).await;
        let rows = self.pool.observe(&lease, rows).await?;
        rows.iter()
            .map(record_from_row)
            .collect::<Result<_, _>>()
            .map_err(StoreError::from)
    }

    async fn records_in(
        &self,
        fields: &FieldFilter,
        window: RecordWindow,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let lease = self.pool.lease().await?;
        let mut query = QueryBuilder::<Postgres>::new("SELECT ");
        query.push(RECORD_COLUMNS).push(" WHERE TRUE");
        push_record_window(&mut query, window);
        push_field_filter(&mut query, fields);
        query.push(" ORDER BY recorded_at ASC");

        let rows = query.build().fetch_all(&lease.pool).await;
        let rows = self.pool.observe(&lease, rows).await?;
        rows.iter()
            .map(record_from_row)
            .collect::<Result<_, _>>()
            .map_err(StoreError::from)
    }

    async fn student_totals(
        &self,
        fields: &FieldFilter,
    ) -> Result<HashMap<String, i64>, StoreError> {
        let lease = self.pool.lease().await?;
        let mut query = QueryBuilder::<Postgres>::new(
            "SELECT student_name, COUNT(*) FROM attendance.records WHERE TRUE",
        );
        push_field_filter(&mut query, fields);
        query.push(" GROUP BY student_name");

        let rows = query
            .build_query_as::<(String, i64)>()
            .fetch_all(&lease.pool)
            .await;
        Ok(self.pool.observe(&lease, rows).await?.into_iter().collect())
    }

    async fn class_count(&self) -> Result<i64, StoreError> {
        let lease = self.pool.lease().await?;
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT total_classes_held FROM attendance.class_counter WHERE config_key = $1",
        )
        .bind(CLASS_COUNTER_KEY)
        .fetch_optional(&lease.pool)
        .await;
        Ok(self.pool.observe(&lease, count).await?.unwrap_or(0))
    }

    async fn class_count_or_init(&self) -> Result<i64, StoreError> {
        let lease = self.pool.lease().await?;
        let created = sqlx::query(
            r#"
            INSERT INTO attendance.class_counter (config_key, total_classes_held, updated_at)
            VALUES ($1, 0, now())
            ON CONFLICT (config_key) DO NOTHING
            "#,
        )
        .bind(CLASS_COUNTER_KEY)
        .execute(&lease.pool)
        .await;
        if self.pool.observe(&lease, created).await?.rows_affected() > 0 {
            info!("class counter created");
        }
        self.class_count().await
    }

    async fn increment_class_count(&self, by: i64) -> Result<i64, StoreError> {
        let lease = self.pool.lease().await?;
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO attendance.class_counter (config_key, total_classes_held, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (config_key) DO UPDATE
            SET total_classes_held = attendance.class_counter.total_classes_held
                    + EXCLUDED.total_classes_held,
                updated_at = now()
            RETURNING total_classes_held
            "#,
        )
        .bind(CLASS_COUNTER_KEY)
        .bind(by)
        .fetch_one(&lease.pool)
        .await;
        if matches!(&count, Err(err) if is_numeric_overflow(err)) {
            return Err(StoreError::CounterOverflow);
        }
        Ok(self.pool.observe(&lease, count).await?)
    }
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Inserts a small, fixed set of records dated relative to today.
/// Re-running is harmless: seed ids are stable.
pub async fn seed(pool: &PgPool) -> anyhow::Result<u64> {
    let today = Utc::now().date_naive();
    let records = vec![
        ("6b1f3c52-8f44-4e0b-9d0e-6f0b7d1a2c01", "Ana Gómez", 0, "Present", "Matemática", "A"),
        ("6b1f3c52-8f44-4e0b-9d0e-6f0b7d1a2c02", "Bruno Díaz", 0, "Absent", "Matemática", "A"),
        ("6b1f3c52-8f44-4e0b-9d0e-6f0b7d1a2c03", "Carla Ruiz", 0, "Present", "Matemática", "A"),
        ("6b1f3c52-8f44-4e0b-9d0e-6f0b7d1a2c04", "Ana Gómez", 7, "Present", "Matemática", "A"),
        ("6b1f3c52-8f44-4e0b-9d0e-6f0b7d1a2c05", "Bruno Díaz", 7, "Justified", "Matemática", "A"),
        ("6b1f3c52-8f44-4e0b-9d0e-6f0b7d1a2c06", "Carla Ruiz", 14, "Present", "Física", "B"),
        ("6b1f3c52-8f44-4e0b-9d0e-6f0b7d1a2c07", "Bruno Díaz", 21, "Present", "Física", "B"),
    ];

    let mut inserted = 0u64;
    for (id, student_name, days_ago, status, subject, section) in records {
        let date: NaiveDate = today - Duration::days(days_ago);
        let recorded_at = Utc::now() - Duration::days(days_ago);
        let result = sqlx::query(
            r#"
            INSERT INTO attendance.records
            (id, date, student_name, status, subject, section, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(Uuid::parse_str(id).context("invalid seed id")?)
        .bind(date)
        .bind(student_name)
        .bind(status)
        .bind(subject)
        .bind(section)
        .bind(recorded_at)
        .execute(pool)
        .await?;
        inserted += result.rows_affected();
    }

    Ok(inserted)
}
