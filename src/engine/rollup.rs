//! Week and month rollups of daily records.
//!
//! Weeks follow ISO-8601 (Monday start, week 1 contains the first Thursday), so the
//! first days of January can belong to the previous year's last week. Only periods
//! with at least one record produce an aggregate.

use chrono::{Datelike, Duration, Months, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::db::DailyConsumptionRecord;

/// Days per month used for projections
const DAYS_PER_MONTH: f64 = 30.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeeklyAggregate {
    /// `YYYY-Wnn`
    pub key: String,
    pub iso_year: i32,
    pub week: u32,
    /// Monday
    pub start: NaiveDate,
    /// Sunday
    pub end: NaiveDate,
    pub total_consumption: f64,
    pub record_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyAggregate {
    /// `YYYY-MM`
    pub key: String,
    pub year: i32,
    pub month: u32,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub total_consumption: f64,
    pub record_count: usize,
}

pub fn group_by_week(records: &[DailyConsumptionRecord]) -> Vec<WeeklyAggregate> {
    let mut buckets: BTreeMap<(i32, u32), WeeklyAggregate> = BTreeMap::new();

    for record in records {
        let iso = record.date.iso_week();
        let bucket = buckets.entry((iso.year(), iso.week())).or_insert_with(|| {
            let start =
                record.date - Duration::days(record.date.weekday().num_days_from_monday() as i64);
            WeeklyAggregate {
                key: format!("{}-W{:02}", iso.year(), iso.week()),
                iso_year: iso.year(),
                week: iso.week(),
                start,
                end: start + Duration::days(6),
                total_consumption: 0.0,
                record_count: 0,
            }
        });
        bucket.total_consumption += record.total_consumption;
        bucket.record_count += 1;
    }

    buckets.into_values().collect()
}

pub fn group_by_month(records: &[DailyConsumptionRecord]) -> Vec<MonthlyAggregate> {
    let mut buckets: BTreeMap<String, MonthlyAggregate> = BTreeMap::new();

    for record in records {
        let key = record.date.format("%Y-%m").to_string();
        let bucket = buckets.entry(key.clone()).or_insert_with(|| {
            let start = record.date.with_day(1).unwrap_or(record.date);
            let end = start
                .checked_add_months(Months::new(1))
                .and_then(|next| next.pred_opt())
                .unwrap_or(record.date);
            MonthlyAggregate {
                key,
                year: record.date.year(),
                month: record.date.month(),
                start,
                end,
                total_consumption: 0.0,
                record_count: 0,
            }
        });
        bucket.total_consumption += record.total_consumption;
        bucket.record_count += 1;
    }

    buckets.into_values().collect()
}

/// Report granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Granularity {
    #[default]
    Day,
    Week,
    Month,
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "day" | "daily" => Ok(Granularity::Day),
            "week" | "weekly" => Ok(Granularity::Week),
            "month" | "monthly" => Ok(Granularity::Month),
            _ => Err(format!("Unknown granularity: {} (expected day, week or month)", s)),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        };
        f.write_str(s)
    }
}

/// Totals over a set of daily records
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumptionSummary {
    pub total: f64,
    /// Records that contributed
    pub days_in_period: usize,
    pub daily_average: f64,
    /// Daily average extended to a 30-day month
    pub projected_monthly: f64,
}

pub fn summarize(records: &[DailyConsumptionRecord]) -> ConsumptionSummary {
    let total: f64 = records.iter().map(|r| r.total_consumption).sum();
    let days_in_period = records.len();
    let daily_average = if days_in_period > 0 {
        total / days_in_period as f64
    } else {
        0.0
    };

    ConsumptionSummary {
        total,
        days_in_period,
        daily_average,
        projected_monthly: daily_average * DAYS_PER_MONTH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(date: NaiveDate, total: f64) -> DailyConsumptionRecord {
        let mut record = DailyConsumptionRecord::new(date);
        record.total_consumption = total;
        record
    }

    #[test]
    fn test_one_full_iso_week() {
        // 2024-06-03 is a Monday
        let records: Vec<_> = (0..7)
            .map(|i| record(date(2024, 6, 3) + Duration::days(i), 2.0))
            .collect();

        let weeks = group_by_week(&records);
        assert_eq!(weeks.len(), 1);
        assert_eq!(weeks[0].key, "2024-W23");
        assert_eq!(weeks[0].start, date(2024, 6, 3));
        assert_eq!(weeks[0].end, date(2024, 6, 9));
        assert_eq!(weeks[0].record_count, 7);
        assert!((weeks[0].total_consumption - 14.0).abs() < 1e-9);
    }

    #[test]
    fn test_week_across_year_boundary() {
        // 2021-01-01 (Friday) belongs to 2020-W53
        let records = vec![
            record(date(2020, 12, 28), 1.0),
            record(date(2021, 1, 1), 1.0),
            record(date(2021, 1, 4), 1.0),
        ];
        let weeks = group_by_week(&records);
        let keys: Vec<_> = weeks.iter().map(|w| w.key.as_str()).collect();
        assert_eq!(keys, vec!["2020-W53", "2021-W01"]);
        assert_eq!(weeks[0].record_count, 2);
        assert_eq!(weeks[0].start, date(2020, 12, 28));
        assert_eq!(weeks[0].end, date(2021, 1, 3));
    }

    #[test]
    fn test_weeks_sorted_by_iso_year_then_week() {
        let records = vec![
            record(date(2024, 1, 10), 1.0),
            record(date(2023, 12, 20), 1.0),
            record(date(2023, 3, 1), 1.0),
        ];
        let keys: Vec<_> = group_by_week(&records).into_iter().map(|w| w.key).collect();
        assert_eq!(keys, vec!["2023-W09", "2023-W51", "2024-W02"]);
    }

    #[test]
    fn test_months_and_gaps() {
        let records = vec![
            record(date(2024, 3, 15), 4.0),
            record(date(2024, 1, 31), 1.0),
            record(date(2024, 1, 1), 2.0),
            record(date(2024, 2, 29), 3.0),
        ];
        let months = group_by_month(&records);
        let keys: Vec<_> = months.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["2024-01", "2024-02", "2024-03"]);
        assert_eq!(months[0].record_count, 2);
        assert!((months[0].total_consumption - 3.0).abs() < 1e-9);
        assert_eq!(months[1].start, date(2024, 2, 1));
        assert_eq!(months[1].end, date(2024, 2, 29));
        assert_eq!(months[2].end, date(2024, 3, 31));

        let sparse = group_by_month(&[record(date(2024, 1, 5), 1.0), record(date(2024, 4, 5), 1.0)]);
        assert_eq!(sparse.len(), 2);
    }

    #[test]
    fn test_period_sums_equal_daily_sum() {
        let records: Vec<_> = (0..75)
            .map(|i| record(date(2024, 1, 20) + Duration::days(i), 0.5 + (i % 7) as f64))
            .collect();
        let daily: f64 = records.iter().map(|r| r.total_consumption).sum();
        let weekly: f64 = group_by_week(&records).iter().map(|w| w.total_consumption).sum();
        let monthly: f64 = group_by_month(&records).iter().map(|m| m.total_consumption).sum();

        assert!((daily - weekly).abs() < 1e-9);
        assert!((daily - monthly).abs() < 1e-9);
    }

    #[test]
    fn test_empty_input() {
        assert!(group_by_week(&[]).is_empty());
        assert!(group_by_month(&[]).is_empty());
        let summary = summarize(&[]);
        assert_eq!(summary.days_in_period, 0);
        assert_eq!(summary.daily_average, 0.0);
    }

    #[test]
    fn test_summary_projection() {
        let records = vec![record(date(2024, 6, 1), 8.0), record(date(2024, 6, 2), 4.0)];
        let summary = summarize(&records);
        assert!((summary.total - 12.0).abs() < 1e-9);
        assert!((summary.daily_average - 6.0).abs() < 1e-9);
        assert!((summary.projected_monthly - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_granularity_parse() {
        assert_eq!("week".parse::<Granularity>(), Ok(Granularity::Week));
        assert_eq!("Monthly".parse::<Granularity>(), Ok(Granularity::Month));
        assert!("year".parse::<Granularity>().is_err());
    }
}
