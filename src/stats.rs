use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Utc};
use tracing::debug;

use crate::filter::{RecordWindow, StatsFilter, StatsWindow};
use crate::models::{
    AttendanceRecord, DailyStat, MonthStat, StatisticsReport, StudentStat, TrendDirection,
    TrendSummary, WeekStat,
};
use crate::store::{AttendanceStore, StoreError};

const DAILY_WINDOW_DAYS: i64 = 6;
const WEEKLY_WINDOW_DAYS: i64 = 28;
const MONTHLY_WINDOW_MONTHS: u32 = 3;
const STUDENT_WINDOW_DAYS: i64 = 30;
const TREND_THRESHOLD_PERCENT: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Windows {
    pub daily: RecordWindow,
    pub weekly: RecordWindow,
    pub monthly: RecordWindow,
    pub students: RecordWindow,
    /// Smallest window containing the four above; bounds the store read.
    pub fetch: RecordWindow,
}

impl Windows {
    pub fn resolve(window: StatsWindow, today: NaiveDate, history_epoch: NaiveDate) -> Self {
        match window {
            StatsWindow::FullHistory => {
                Self::uniform(RecordWindow::RecordedSince(midnight(history_epoch)))
            }
            StatsWindow::Range { from, to } => Self::uniform(RecordWindow::Dates { from, to }),
            StatsWindow::Rolling => {
                let first_of_month = today.with_day(1).unwrap_or(today);
                let monthly_start = first_of_month
                    .checked_sub_months(Months::new(MONTHLY_WINDOW_MONTHS))
                    .unwrap_or(NaiveDate::MIN);
                let daily = today - Duration::days(DAILY_WINDOW_DAYS);
                let weekly = week_start(today - Duration::days(WEEKLY_WINDOW_DAYS));
                let students = today - Duration::days(STUDENT_WINDOW_DAYS);
                let earliest = daily.min(weekly).min(monthly_start).min(students);
                Self {
                    daily: RecordWindow::RecordedSince(midnight(daily)),
                    weekly: RecordWindow::RecordedSince(midnight(weekly)),
                    monthly: RecordWindow::RecordedSince(midnight(monthly_start)),
                    students: RecordWindow::RecordedSince(midnight(students)),
                    fetch: RecordWindow::RecordedSince(midnight(earliest)),
                }
            }
        }
    }

    fn uniform(window: RecordWindow) -> Self {
        Self {
            daily: window,
            weekly: window,
            monthly: window,
            students: window,
            fetch: window,
        }
    }
}

/// Monday of the week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    let dow = date.weekday().num_days_from_sunday();
    let back = if dow == 0 { 6 } else { dow - 1 };
    date - Duration::days(i64::from(back))
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn count_by<'a, K: Ord>(
    records: impl Iterator<Item = &'a AttendanceRecord>,
    key: impl Fn(&AttendanceRecord) -> K,
) -> BTreeMap<K, i64> {
    let mut buckets = BTreeMap::new();
    for record in records {
        *buckets.entry(key(record)).or_insert(0) += 1;
    }
    buckets
}

pub fn daily_stats(records: &[AttendanceRecord], window: RecordWindow) -> Vec<DailyStat> {
    count_by(records.iter().filter(|r| window.contains(r)), |r| r.date)
        .into_iter()
        .map(|(date, count)| DailyStat { date, count })
        .collect()
}

pub fn weekly_stats(records: &[AttendanceRecord], window: RecordWindow) -> Vec<WeekStat> {
    count_by(records.iter().filter(|r| window.contains(r)), |r| {
        week_start(r.recorded_at.date_naive())
    })
    .into_iter()
    .map(|(week_start_date, count)| WeekStat {
        week_start_date,
        count,
    })
    .collect()
}

pub fn monthly_stats(records: &[AttendanceRecord], window: RecordWindow) -> Vec<MonthStat> {
    count_by(records.iter().filter(|r| window.contains(r)), |r| {
        r.recorded_at.format("%Y-%m").to_string()
    })
    .into_iter()
    .map(|(month, count)| MonthStat { month, count })
    .collect()
}

/// Windowed counts per student, least attendance first, each carrying the
/// student's all-time count.
pub fn student_stats(
    records: &[AttendanceRecord],
    window: RecordWindow,
    totals: &HashMap<String, i64>,
) -> Vec<StudentStat> {
    let mut stats: Vec<StudentStat> = count_by(
        records.iter().filter(|r| window.contains(r)),
        |r| r.student_name.clone(),
    )
    .into_iter()
    .map(|(student_name, attendance_count)| StudentStat {
        total_attendance_count: totals.get(&student_name).copied().unwrap_or(0),
        student_name,
        attendance_count,
    })
    .collect();

    // The BTreeMap already yields names in order, and the sort is stable.
    stats.sort_by_key(|stat| stat.attendance_count);
    stats
}

pub fn average_per_class(daily: &[DailyStat]) -> f64 {
    if daily.is_empty() {
        return 0.0;
    }
    let total: i64 = daily.iter().map(|stat| stat.count).sum();
    round_one_decimal(total as f64 / daily.len() as f64)
}

/// Best and worst days: head and tail of a stable descending sort, so the
/// earliest maximum and the latest minimum win ties.
pub fn best_and_worst(daily: &[DailyStat]) -> (Option<DailyStat>, Option<DailyStat>) {
    let mut sorted = daily.to_vec();
    sorted.sort_by(|a, b| b.count.cmp(&a.count));
    (sorted.first().cloned(), sorted.last().cloned())
}

/// Compares the mean of the last two weeks with the mean of the two before.
pub fn attendance_trend(weekly: &[WeekStat]) -> TrendSummary {
    let n = weekly.len();
    if n < 4 {
        return TrendSummary::stable();
    }

    let older = (weekly[n - 4].count + weekly[n - 3].count) as f64 / 2.0;
    let recent = (weekly[n - 2].count + weekly[n - 1].count) as f64 / 2.0;
    if older == 0.0 {
        return TrendSummary::stable();
    }

    let change = (recent - older) / older * 100.0;
    let direction = if change > TREND_THRESHOLD_PERCENT {
        TrendDirection::Up
    } else if change < -TREND_THRESHOLD_PERCENT {
        TrendDirection::Down
    } else {
        TrendDirection::Stable
    };

    TrendSummary {
        direction,
        percentage: round_one_decimal(change.abs()),
    }
}

/// Builds the report from records that already satisfy the field filter and
/// lie inside `windows.fetch`. `totals` holds each student's all-time count.
pub fn build_statistics(
    records: &[AttendanceRecord],
    totals: &HashMap<String, i64>,
    windows: &Windows,
    total_classes_held: i64,
) -> StatisticsReport {
    let daily = daily_stats(records, windows.daily);
    let weekly = weekly_stats(records, windows.weekly);
    let monthly = monthly_stats(records, windows.monthly);
    let students = student_stats(records, windows.students, totals);
    let (best, worst) = best_and_worst(&daily);

    StatisticsReport {
        average_attendance_per_class: average_per_class(&daily),
        attendance_trend: attendance_trend(&weekly),
        total_unique_students: totals.len(),
        daily_stats: daily,
        weekly_stats: weekly,
        monthly_stats: monthly,
        student_stats: students,
        total_classes_held,
        best_attendance_day: best,
        worst_attendance_day: worst,
    }
}

pub async fn compute_statistics(
    store: &dyn AttendanceStore,
    filter: &StatsFilter,
    today: NaiveDate,
    history_epoch: NaiveDate,
) -> Result<StatisticsReport, StoreError> {
    let windows = Windows::resolve(filter.window, today, history_epoch);
    debug!(status = %filter.status(), fetch = ?windows.fetch, %today, "computing statistics");
    let records = store.records_in(&filter.fields, windows.fetch).await?;
    let totals = store.student_totals(&filter.fields).await?;
    let total_classes_held = store.class_count().await?;
    Ok(build_statistics(&records, &totals, &windows, total_classes_held))
}
