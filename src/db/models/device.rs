//! Appliance models: preset templates and user-owned devices.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DeviceCategory;
use crate::db::{Document, StoreError};

/// Whether a device is a shared catalog template or bound to one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerFlag {
    Template,
    User,
}

impl OwnerFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::User => "user",
        }
    }
}

/// Appliance stored at `devices/{id}`.
///
/// A template never carries a `user_id`; a user-owned device always does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub category_id: DeviceCategory,
    pub manufacturer: String,
    pub model: String,
    /// Rated power draw in kW
    pub power_consumption: f64,
    /// Typical hours of use per day, 0–24
    pub usage_hours_per_day: f64,
    pub owner_flag: OwnerFlag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Device {
    pub fn template(
        id: impl Into<String>,
        category_id: DeviceCategory,
        manufacturer: impl Into<String>,
        model: impl Into<String>,
        power_consumption: f64,
        usage_hours_per_day: f64,
    ) -> Self {
        Self {
            id: id.into(),
            category_id,
            manufacturer: manufacturer.into(),
            model: model.into(),
            power_consumption,
            usage_hours_per_day,
            owner_flag: OwnerFlag::Template,
            user_id: None,
        }
    }

    pub fn owned(id: impl Into<String>, user_id: impl Into<String>, spec: &DeviceSpec) -> Self {
        Self {
            id: id.into(),
            category_id: spec.category_id,
            manufacturer: spec.manufacturer.clone(),
            model: spec.model.clone(),
            power_consumption: spec.power_kw,
            usage_hours_per_day: spec.usage_hours,
            owner_flag: OwnerFlag::User,
            user_id: Some(user_id.into()),
        }
    }

    pub fn is_template(&self) -> bool {
        self.owner_flag == OwnerFlag::Template
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_flag == OwnerFlag::User && self.user_id.as_deref() == Some(user_id)
    }

    /// Full-day energy use in kWh
    pub fn daily_consumption(&self) -> f64 {
        self.power_consumption * self.usage_hours_per_day
    }

    pub fn from_document(id: &str, mut doc: Document) -> Result<Self, StoreError> {
        doc.insert("id".to_string(), Value::String(id.to_string()));
        Ok(serde_json::from_value(Value::Object(doc))?)
    }

    /// Document body; the id lives in the key, not the body
    pub fn to_document(&self) -> Result<Document, StoreError> {
        match serde_json::to_value(self)? {
            Value::Object(mut doc) => {
                doc.remove("id");
                Ok(doc)
            }
            _ => Ok(Document::new()),
        }
    }
}

/// User-supplied device attributes for create and claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub category_id: DeviceCategory,
    pub manufacturer: String,
    pub model: String,
    pub power_kw: f64,
    pub usage_hours: f64,
}

/// Partial edit of an owned device; `None` keeps the current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub category_id: Option<DeviceCategory>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub power_kw: Option<f64>,
    pub usage_hours: Option<f64>,
}

impl DeviceUpdate {
    pub fn is_empty(&self) -> bool {
        self.category_id.is_none()
            && self.manufacturer.is_none()
            && self.model.is_none()
            && self.power_kw.is_none()
            && self.usage_hours.is_none()
    }

    pub fn apply_to(&self, device: &Device) -> Device {
        let mut updated = device.clone();
        if let Some(category_id) = self.category_id {
            updated.category_id = category_id;
        }
        if let Some(manufacturer) = &self.manufacturer {
            updated.manufacturer = manufacturer.clone();
        }
        if let Some(model) = &self.model {
            updated.model = model.clone();
        }
        if let Some(power_kw) = self.power_kw {
            updated.power_consumption = power_kw;
        }
        if let Some(usage_hours) = self.usage_hours {
            updated.usage_hours_per_day = usage_hours;
        }
        updated
    }
}
