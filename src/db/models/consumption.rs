//! Per-user daily consumption records stored at
//! `users/{user_id}/consumption_history/{date}`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::db::{Document, StoreError};

/// Date format used for record ids and the `date` field
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// One device's share of a day's consumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConsumption {
    pub manufacturer: String,
    pub model: String,
    /// kWh per day
    pub daily_consumption: f64,
}

/// Consumption for one user on one calendar day.
///
/// `total_consumption` is the device-derived full-day projection and is authoritative.
/// `hourly_consumption` holds synthetic samples for the hours observed so far and is a
/// display breakdown only; the two are not reconciled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyConsumptionRecord {
    pub date: NaiveDate,
    #[serde(default)]
    pub total_consumption: f64,
    #[serde(default)]
    pub hourly_consumption: BTreeMap<u8, f64>,
    #[serde(default)]
    pub devices_consumption: BTreeMap<String, DeviceConsumption>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl DailyConsumptionRecord {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            total_consumption: 0.0,
            hourly_consumption: BTreeMap::new(),
            devices_consumption: BTreeMap::new(),
            last_updated: None,
        }
    }

    /// Record id for a date
    pub fn doc_id(date: NaiveDate) -> String {
        date.format(DATE_FORMAT).to_string()
    }

    pub fn from_document(doc: Document) -> Result<Self, StoreError> {
        Ok(serde_json::from_value(Value::Object(doc))?)
    }

    /// Sum of the hourly samples observed so far
    pub fn hourly_sum(&self) -> f64 {
        self.hourly_consumption.values().sum()
    }

    /// Whether every hour of the day has a sample
    pub fn is_complete(&self) -> bool {
        self.hourly_consumption.len() == 24
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parses_sparse_hourly_map() {
        let doc = match json!({
            "date": "2024-06-01",
            "total_consumption": 8.4,
            "hourly_consumption": {"7": 0.5, "18": 1.25},
            "devices_consumption": {
                "d1": {"manufacturer": "Acme", "model": "X1", "daily_consumption": 6.0}
            },
            "last_updated": "2024-06-01T18:00:00Z"
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };

        let record = DailyConsumptionRecord::from_document(doc).unwrap();
        assert_eq!(record.date, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert_eq!(record.hourly_consumption.get(&18), Some(&1.25));
        assert!((record.hourly_sum() - 1.75).abs() < 1e-9);
        assert!(!record.is_complete());
        assert_eq!(record.devices_consumption["d1"].model, "X1");
    }

    #[test]
    fn test_missing_fields_default() {
        let doc = match json!({"date": "2024-06-02"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let record = DailyConsumptionRecord::from_document(doc).unwrap();
        assert_eq!(record, DailyConsumptionRecord::new(record.date));
        assert_eq!(DailyConsumptionRecord::doc_id(record.date), "2024-06-02");
    }
}
