//! Per-user daily consumption records.
//!
//! Writes are expressed as field-path merges so the totals written on a device mutation
//! and the hourly samples written by the sampler never clobber each other: a totals
//! merge replaces `total_consumption` and the whole `devices_consumption` map, an hour
//! merge touches only `hourly_consumption.<hour>`.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::db::{
    consumption_history, DailyConsumptionRecord, Device, DeviceConsumption, DocKey,
    DocumentStore, Direction, FilterOp, Precondition, Query, StoreError, WriteOp, USERS,
};

use super::synthesizer::HourOfDay;

/// Full-day totals derived from a device set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailyTotals {
    /// kWh, Σ power × hours
    pub total: f64,
    pub devices: BTreeMap<String, DeviceConsumption>,
}

impl DailyTotals {
    pub fn from_devices(devices: &[Device]) -> Self {
        let mut totals = DailyTotals::default();
        for device in devices {
            let daily = device.daily_consumption();
            totals.total += daily;
            totals.devices.insert(
                device.id.clone(),
                DeviceConsumption {
                    manufacturer: device.manufacturer.clone(),
                    model: device.model.clone(),
                    daily_consumption: daily,
                },
            );
        }
        totals
    }
}

const DEVICES_VERSION: &str = "devices_version";

/// Revision of a user's device set, kept at `users/{user_id}`.
///
/// Read it before loading the devices, and commit [`DeviceSetVersion::bump`] in the same
/// batch as anything derived from them: a batch built from a device set that another
/// writer has since changed then fails its precondition instead of landing stale totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSetVersion(Option<u64>);

impl DeviceSetVersion {
    pub fn key(user_id: &str) -> DocKey {
        DocKey::new(USERS, user_id)
    }

    pub async fn read(store: &dyn DocumentStore, user_id: &str) -> Result<Self, StoreError> {
        let key = Self::key(user_id);
        match store.get(&key).await? {
            None => Ok(Self(None)),
            Some(doc) => doc
                .get(DEVICES_VERSION)
                .and_then(Value::as_u64)
                .map(|version| Self(Some(version)))
                .ok_or_else(|| StoreError::InvalidField(format!("{}.{}", key, DEVICES_VERSION))),
        }
    }

    /// 0 before the first device set write
    pub fn get(self) -> u64 {
        self.0.unwrap_or(0)
    }

    /// Write advancing the version by one, guarded on it still being `self`
    pub fn bump(self, user_id: &str, now: DateTime<Utc>) -> Result<(WriteOp, Precondition), StoreError> {
        let precondition = match self.0 {
            Some(version) => Precondition::field_equals(DEVICES_VERSION, version),
            None => Precondition::Missing,
        };
        let op = WriteOp::Merge {
            key: Self::key(user_id),
            fields: vec![
                (DEVICES_VERSION.to_string(), Value::from(self.get() + 1)),
                ("last_updated".to_string(), serde_json::to_value(now)?),
            ],
        };
        Ok((op, precondition))
    }
}

pub fn record_key(user_id: &str, date: NaiveDate) -> DocKey {
    DocKey::new(consumption_history(user_id), DailyConsumptionRecord::doc_id(date))
}

/// Upsert of a day's totals and per-device breakdown. Hourly samples are left alone.
pub fn totals_write(
    user_id: &str,
    date: NaiveDate,
    totals: &DailyTotals,
    now: DateTime<Utc>,
) -> Result<WriteOp, StoreError> {
    Ok(WriteOp::Merge {
        key: record_key(user_id, date),
        fields: vec![
            ("date".to_string(), date_value(date)),
            ("total_consumption".to_string(), Value::from(totals.total)),
            (
                "devices_consumption".to_string(),
                serde_json::to_value(&totals.devices)?,
            ),
            ("last_updated".to_string(), serde_json::to_value(now)?),
        ],
    })
}

/// Upsert of one hourly sample, overwriting any previous sample for that hour
pub fn hour_sample_write(
    user_id: &str,
    date: NaiveDate,
    hour: HourOfDay,
    value: f64,
    now: DateTime<Utc>,
) -> Result<WriteOp, StoreError> {
    Ok(WriteOp::Merge {
        key: record_key(user_id, date),
        fields: vec![
            ("date".to_string(), date_value(date)),
            (format!("hourly_consumption.{}", hour.get()), Value::from(value)),
            ("last_updated".to_string(), serde_json::to_value(now)?),
        ],
    })
}

fn date_value(date: NaiveDate) -> Value {
    Value::String(DailyConsumptionRecord::doc_id(date))
}

/// Records with `start <= date <= end`, ordered by date. Days without a record are absent.
pub async fn fetch_range(
    store: &dyn DocumentStore,
    user_id: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<DailyConsumptionRecord>, StoreError> {
    if start > end {
        return Ok(Vec::new());
    }

    let query = Query::new(consumption_history(user_id))
        .filter("date", FilterOp::Ge, date_value(start))
        .filter("date", FilterOp::Le, date_value(end))
        .order_by("date", Direction::Asc);

    store
        .query(&query)
        .await?
        .into_iter()
        .map(|doc| DailyConsumptionRecord::from_document(doc.data))
        .collect()
}

/// Ids of records dated strictly before `cutoff`
pub async fn ids_before(
    store: &dyn DocumentStore,
    user_id: &str,
    cutoff: NaiveDate,
) -> Result<Vec<String>, StoreError> {
    let query = Query::new(consumption_history(user_id))
        .filter("date", FilterOp::Lt, date_value(cutoff))
        .order_by("date", Direction::Asc);

    Ok(store.query(&query).await?.into_iter().map(|doc| doc.id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DeviceCategory, MemoryStore, WriteBatch};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn apply(store: &MemoryStore, op: WriteOp) {
        let mut batch = WriteBatch::new();
        batch.push(op, None);
        store.commit(batch).await.unwrap();
    }

    #[test]
    fn test_totals_from_devices() {
        let devices = vec![
            Device::template("a", DeviceCategory::Heating, "Acme", "A", 1.5, 4.0),
            Device::template("b", DeviceCategory::Refrigeration, "Acme", "B", 0.1, 24.0),
        ];
        let totals = DailyTotals::from_devices(&devices);
        assert!((totals.total - 8.4).abs() < 1e-9);
        assert!((totals.devices["a"].daily_consumption - 6.0).abs() < 1e-9);
        assert_eq!(totals.devices["b"].model, "B");
    }

    #[tokio::test]
    async fn test_totals_and_samples_do_not_clobber_each_other() {
        let store = MemoryStore::new();
        let day = date(2024, 6, 1);
        let now = Utc::now();
        let hour = HourOfDay::new(14).unwrap();

        apply(&store, hour_sample_write("u1", day, hour, 0.7, now).unwrap()).await;

        let devices = vec![Device::template("a", DeviceCategory::Other, "Acme", "A", 1.0, 2.0)];
        let totals = DailyTotals::from_devices(&devices);
        apply(&store, totals_write("u1", day, &totals, now).unwrap()).await;

        // A later recompute with fewer devices drops the old breakdown entry
        apply(&store, totals_write("u1", day, &DailyTotals::default(), now).unwrap()).await;

        let records = fetch_range(&store, "u1", day, day).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].total_consumption, 0.0);
        assert!(records[0].devices_consumption.is_empty());
        assert_eq!(records[0].hourly_consumption.get(&14), Some(&0.7));
        assert!(records[0].last_updated.is_some());
    }

    #[tokio::test]
    async fn test_range_is_inclusive_and_ordered() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for d in [5, 1, 3, 2, 4] {
            let totals = DailyTotals {
                total: d as f64,
                ..Default::default()
            };
            apply(&store, totals_write("u1", date(2024, 6, d), &totals, now).unwrap()).await;
        }

        let records = fetch_range(&store, "u1", date(2024, 6, 2), date(2024, 6, 4))
            .await
            .unwrap();
        let days: Vec<_> = records.iter().map(|r| r.date).collect();
        assert_eq!(days, vec![date(2024, 6, 2), date(2024, 6, 3), date(2024, 6, 4)]);

        let other_user = fetch_range(&store, "u2", date(2024, 6, 1), date(2024, 6, 5))
            .await
            .unwrap();
        assert!(other_user.is_empty());

        let inverted = fetch_range(&store, "u1", date(2024, 6, 4), date(2024, 6, 2))
            .await
            .unwrap();
        assert!(inverted.is_empty());

        let old = ids_before(&store, "u1", date(2024, 6, 3)).await.unwrap();
        assert_eq!(old, vec!["2024-06-01".to_string(), "2024-06-02".to_string()]);
    }

    #[tokio::test]
    async fn test_device_set_version_rejects_stale_bumps() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let initial = DeviceSetVersion::read(&store, "u1").await.unwrap();
        assert_eq!(initial.get(), 0);

        let commit = |version: DeviceSetVersion| {
            let mut batch = WriteBatch::new();
            let (op, precondition) = version.bump("u1", now).unwrap();
            batch.push(op, Some(precondition));
            batch
        };

        store.commit(commit(initial)).await.unwrap();
        let current = DeviceSetVersion::read(&store, "u1").await.unwrap();
        assert_eq!(current.get(), 1);

        // A writer still holding the first read loses
        assert!(matches!(
            store.commit(commit(initial)).await,
            Err(StoreError::PreconditionFailed(key)) if key == DeviceSetVersion::key("u1")
        ));

        store.commit(commit(current)).await.unwrap();
        assert_eq!(DeviceSetVersion::read(&store, "u1").await.unwrap().get(), 2);
        // Other users are versioned independently
        assert_eq!(DeviceSetVersion::read(&store, "u2").await.unwrap().get(), 0);
    }
}
