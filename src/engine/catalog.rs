//! Device catalog reads and input validation.
//!
//! Templates and user-owned devices share the `devices` collection and are told apart
//! by `owner_flag`. These are raw backend reads; caching and error degradation happen
//! in [`crate::engine::ConsumptionEngine`].

use std::collections::BTreeSet;

use crate::db::{
    Category, Device, DeviceCategory, DeviceSpec, DeviceUpdate, DocKey, OwnerFlag, Query, Store,
    StoreError, CATEGORIES, DEVICES,
};
use crate::error::{EngineError, ErrorContext};

/// Tolerance when matching a requested power rating against a template's
const POWER_EPSILON: f64 = 1e-9;

#[derive(Clone)]
pub struct DeviceCatalog {
    store: Store,
}

impl DeviceCatalog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn load_categories(&self) -> Result<Vec<Category>, StoreError> {
        let docs = self.store.query(&Query::new(CATEGORIES)).await?;
        let mut categories = Vec::with_capacity(docs.len());
        for doc in docs {
            match Category::from_document(&doc.id, doc.data) {
                Ok(category) => categories.push(category),
                Err(e) => {
                    tracing::warn!(category_id = %doc.id, error = %e, "Skipping unrecognised category document");
                }
            }
        }
        categories.sort_by_key(|c| c.id);
        Ok(categories)
    }

    pub async fn load_presets(
        &self,
        category: Option<DeviceCategory>,
    ) -> Result<Vec<Device>, StoreError> {
        let mut query = Query::new(DEVICES).eq("owner_flag", OwnerFlag::Template.as_str());
        if let Some(category) = category {
            query = query.eq("category_id", category.as_str());
        }
        self.fetch_devices(&query).await
    }

    pub async fn load_user_devices(&self, user_id: &str) -> Result<Vec<Device>, StoreError> {
        let query = Query::new(DEVICES)
            .eq("owner_flag", OwnerFlag::User.as_str())
            .eq("user_id", user_id);
        self.fetch_devices(&query).await
    }

    /// Templates matching manufacturer, model and power rating, in stable id order
    pub async fn claimable_templates(&self, spec: &DeviceSpec) -> Result<Vec<Device>, StoreError> {
        let query = Query::new(DEVICES)
            .eq("owner_flag", OwnerFlag::Template.as_str())
            .eq("manufacturer", spec.manufacturer.as_str())
            .eq("model", spec.model.as_str());

        let mut templates: Vec<Device> = self
            .fetch_devices(&query)
            .await?
            .into_iter()
            .filter(|device| (device.power_consumption - spec.power_kw).abs() < POWER_EPSILON)
            .collect();
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(templates)
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        let key = DocKey::new(DEVICES, device_id);
        match self.store.get(&key).await? {
            Some(doc) => Ok(Some(Device::from_document(device_id, doc)?)),
            None => Ok(None),
        }
    }

    /// Distinct ids of users owning at least one device, sorted
    pub async fn users_with_devices(&self) -> Result<Vec<String>, StoreError> {
        let query = Query::new(DEVICES).eq("owner_flag", OwnerFlag::User.as_str());
        let users: BTreeSet<String> = self
            .fetch_devices(&query)
            .await?
            .into_iter()
            .filter_map(|device| device.user_id)
            .collect();
        Ok(users.into_iter().collect())
    }

    async fn fetch_devices(&self, query: &Query) -> Result<Vec<Device>, StoreError> {
        let docs = self.store.query(query).await?;
        let mut devices = Vec::with_capacity(docs.len());
        for doc in docs {
            match Device::from_document(&doc.id, doc.data) {
                Ok(device) => devices.push(device),
                Err(e) => {
                    tracing::warn!(device_id = %doc.id, error = %e, "Skipping malformed device document");
                }
            }
        }
        Ok(devices)
    }
}

fn check_power(power_kw: f64, context: &ErrorContext) -> Result<(), EngineError> {
    if !power_kw.is_finite() || power_kw <= 0.0 {
        return Err(EngineError::validation(
            format!("power_kw must be greater than 0, got {}", power_kw),
            context.clone(),
        ));
    }
    Ok(())
}

fn check_usage(usage_hours: f64, context: &ErrorContext) -> Result<(), EngineError> {
    if !(0.0..=24.0).contains(&usage_hours) {
        return Err(EngineError::validation(
            format!("usage_hours must be within 0-24, got {}", usage_hours),
            context.clone(),
        ));
    }
    Ok(())
}

fn check_label(field: &str, value: &str, context: &ErrorContext) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::validation(
            format!("{} must not be empty", field),
            context.clone(),
        ));
    }
    Ok(())
}

pub fn validate_spec(spec: &DeviceSpec, context: &ErrorContext) -> Result<(), EngineError> {
    check_label("manufacturer", &spec.manufacturer, context)?;
    check_label("model", &spec.model, context)?;
    check_power(spec.power_kw, context)?;
    check_usage(spec.usage_hours, context)
}

pub fn validate_update(update: &DeviceUpdate, context: &ErrorContext) -> Result<(), EngineError> {
    if update.is_empty() {
        return Err(EngineError::validation("update has no fields", context.clone()));
    }
    if let Some(manufacturer) = &update.manufacturer {
        check_label("manufacturer", manufacturer, context)?;
    }
    if let Some(model) = &update.model {
        check_label("model", model, context)?;
    }
    if let Some(power_kw) = update.power_kw {
        check_power(power_kw, context)?;
    }
    if let Some(usage_hours) = update.usage_hours {
        check_usage(usage_hours, context)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{seed_catalog, DocumentStore, MemoryStore};
    use std::sync::Arc;

    fn spec(manufacturer: &str, model: &str, power_kw: f64, usage_hours: f64) -> DeviceSpec {
        DeviceSpec {
            category_id: DeviceCategory::Cooling,
            manufacturer: manufacturer.to_string(),
            model: model.to_string(),
            power_kw,
            usage_hours,
        }
    }

    async fn put(store: &MemoryStore, device: &Device) {
        store
            .set(&DocKey::new(DEVICES, &device.id), device.to_document().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unrecognised_categories_are_skipped() {
        let memory = Arc::new(MemoryStore::new());
        seed_catalog(memory.as_ref()).await.unwrap();
        for id in ["jetpack", "hovercraft"] {
            let mut doc = crate::db::Document::new();
            doc.insert("name".to_string(), id.into());
            memory.set(&DocKey::new(CATEGORIES, id), doc).await.unwrap();
        }

        let categories = DeviceCatalog::new(memory).load_categories().await.unwrap();
        assert_eq!(categories.len(), DeviceCategory::COUNT);
        let others = categories
            .iter()
            .filter(|c| c.id == DeviceCategory::Other)
            .count();
        assert_eq!(others, 1);
    }

    #[tokio::test]
    async fn test_seeded_catalog_reads() {
        let memory = Arc::new(MemoryStore::new());
        seed_catalog(memory.as_ref()).await.unwrap();
        let catalog = DeviceCatalog::new(memory.clone());

        let categories = catalog.load_categories().await.unwrap();
        assert_eq!(categories.len(), DeviceCategory::COUNT);
        assert_eq!(categories[0].id, DeviceCategory::Lighting);

        let all = catalog.load_presets(None).await.unwrap();
        assert!(all.iter().all(Device::is_template));
        let lighting = catalog.load_presets(Some(DeviceCategory::Lighting)).await.unwrap();
        assert!(!lighting.is_empty());
        assert!(lighting.len() < all.len());
        assert!(lighting.iter().all(|d| d.category_id == DeviceCategory::Lighting));
    }

    #[tokio::test]
    async fn test_claimable_templates_match_power_exactly() {
        let memory = Arc::new(MemoryStore::new());
        put(&memory, &Device::template("t2", DeviceCategory::Cooling, "Acme", "X1", 0.8, 6.0)).await;
        put(&memory, &Device::template("t1", DeviceCategory::Cooling, "Acme", "X1", 0.8, 6.0)).await;
        put(&memory, &Device::template("t3", DeviceCategory::Cooling, "Acme", "X1", 0.9, 6.0)).await;
        let owned = Device::owned("d1", "u1", &spec("Acme", "X1", 0.8, 6.0));
        put(&memory, &owned).await;

        let catalog = DeviceCatalog::new(memory.clone());
        let matches = catalog
            .claimable_templates(&spec("Acme", "X1", 0.8, 2.0))
            .await
            .unwrap();
        let ids: Vec<_> = matches.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);

        assert_eq!(catalog.load_user_devices("u1").await.unwrap(), vec![owned]);
        assert!(catalog.load_user_devices("u2").await.unwrap().is_empty());
        assert_eq!(catalog.users_with_devices().await.unwrap(), vec!["u1".to_string()]);
    }

    #[test]
    fn test_validation() {
        let ctx = ErrorContext::new("claim_or_create_device").user("u1");
        assert!(validate_spec(&spec("Acme", "X1", 0.8, 6.0), &ctx).is_ok());
        assert!(validate_spec(&spec("Acme", "X1", 0.8, 0.0), &ctx).is_ok());
        assert!(validate_spec(&spec("Acme", "X1", 0.8, 24.0), &ctx).is_ok());

        for bad in [
            spec("Acme", "X1", 0.0, 6.0),
            spec("Acme", "X1", -1.0, 6.0),
            spec("Acme", "X1", f64::NAN, 6.0),
            spec("Acme", "X1", 0.8, 24.5),
            spec("Acme", "X1", 0.8, -0.1),
            spec("  ", "X1", 0.8, 6.0),
        ] {
            let err = validate_spec(&bad, &ctx).unwrap_err();
            assert_eq!(err.kind(), "validation");
        }

        assert!(validate_update(&DeviceUpdate::default(), &ctx).is_err());
        let update = DeviceUpdate {
            power_kw: Some(0.0),
            ..Default::default()
        };
        assert!(validate_update(&update, &ctx).is_err());
    }
}
