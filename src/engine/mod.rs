//! Consumption aggregation engine.
//!
//! [`ConsumptionEngine`] ties the device catalog, the synthesizer, the daily record
//! store, retention and the caches together. Every device mutation commits the device
//! write, the recomputed totals for today and the current hour's sample as one atomic
//! batch, then invalidates the user's cached device list and schedules a retention
//! purge. Mutations for one user are serialized in-process by a per-user lock, and
//! across processes by a versioned per-user document every such batch must advance, so
//! the totals always reflect the device set they were committed with.

mod aggregation;
mod catalog;
mod retention;
mod rollup;
mod sampler;
mod synthesizer;

pub use aggregation::*;
pub use catalog::*;
pub use retention::*;
pub use rollup::*;
pub use sampler::*;
pub use synthesizer::*;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Timelike, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cache::{CacheKind, CacheLayer};
use crate::config::Config;
use crate::db::{
    Category, DailyConsumptionRecord, Device, DeviceCategory, DeviceSpec, DeviceUpdate, DocKey,
    OwnerFlag, Precondition, Store, StoreError, WriteBatch, WriteOp, DEFAULT_BATCH_LIMIT,
    DEVICES,
};
use crate::error::{EngineError, ErrorContext, Result};
use crate::metrics::{record_device_mutation, record_engine_error, record_hour_sample};

/// Source of the current instant
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays
pub struct FixedClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Engine tuning derived from configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub batch_limit: usize,
    pub retention_enabled: bool,
    pub retention_days: u32,
    /// Offset that decides which calendar day and hour "now" falls in
    pub utc_offset: FixedOffset,
    pub profile: UsageProfile,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            batch_limit: DEFAULT_BATCH_LIMIT,
            retention_enabled: true,
            retention_days: 90,
            utc_offset: Utc.fix(),
            profile: UsageProfile::household(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_limit: config.storage.batch_limit,
            retention_enabled: config.retention.enabled,
            retention_days: config.retention.days,
            utc_offset: config.engine.utc_offset(),
            profile: UsageProfile::household(),
        }
    }
}

/// Records for a date range at the requested granularity
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ReportPeriods {
    Day(Vec<DailyConsumptionRecord>),
    Week(Vec<WeeklyAggregate>),
    Month(Vec<MonthlyAggregate>),
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumptionReport {
    pub user_id: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub granularity: String,
    pub periods: ReportPeriods,
    pub summary: ConsumptionSummary,
}

pub struct ConsumptionEngine {
    store: Store,
    catalog: DeviceCatalog,
    cache: CacheLayer,
    retention: RetentionManager,
    settings: EngineSettings,
    user_locks: DashMap<String, Arc<Mutex<()>>>,
    clock: Arc<dyn Clock>,
}

impl ConsumptionEngine {
    pub fn new(store: Store, settings: EngineSettings) -> Self {
        Self::with_clock(store, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Store, settings: EngineSettings, clock: Arc<dyn Clock>) -> Self {
        let retention =
            RetentionManager::new(store.clone(), settings.batch_limit, settings.retention_days);
        Self {
            catalog: DeviceCatalog::new(store.clone()),
            store,
            cache: CacheLayer::new(),
            retention,
            settings,
            user_locks: DashMap::new(),
            clock,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    /// Calendar day "now" falls in, at the configured offset
    pub fn today(&self) -> NaiveDate {
        self.clock
            .now()
            .with_timezone(&self.settings.utc_offset)
            .date_naive()
    }

    pub fn current_hour(&self) -> HourOfDay {
        let hour = self.clock.now().with_timezone(&self.settings.utc_offset).hour();
        HourOfDay::wrapping(hour)
    }

    // ==================== Catalog reads ====================

    /// Load and cache the category list
    pub async fn warm_up(&self) -> Result<usize> {
        let ctx = ErrorContext::new("warm_up");
        let categories = self
            .cache
            .categories(|| async { self.catalog.load_categories().await.map(Arc::new) })
            .await
            .map_err(|e| fail(EngineError::from_store(e, ctx)))?;
        Ok(categories.len())
    }

    /// Cached for the process lifetime once loaded
    pub async fn list_categories(&self) -> Vec<Category> {
        match self
            .cache
            .categories(|| async { self.catalog.load_categories().await.map(Arc::new) })
            .await
        {
            Ok(categories) => categories.as_ref().clone(),
            Err(e) => {
                degraded_read("list_categories", &e);
                Vec::new()
            }
        }
    }

    /// Always read from the backend
    pub async fn list_preset_devices(&self, category: Option<DeviceCategory>) -> Vec<Device> {
        match self.catalog.load_presets(category).await {
            Ok(devices) => devices,
            Err(e) => {
                degraded_read("list_preset_devices", &e);
                Vec::new()
            }
        }
    }

    pub async fn list_user_devices(&self, user_id: &str) -> Vec<Device> {
        match self.try_list_user_devices(user_id).await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "Failed to list user devices, returning empty list"
                );
                Vec::new()
            }
        }
    }

    /// Like [`Self::list_user_devices`] but surfaces backend failures
    pub async fn try_list_user_devices(&self, user_id: &str) -> Result<Vec<Device>> {
        let ctx = ErrorContext::new("list_user_devices").user(user_id);
        let devices = self
            .cache
            .user_devices(user_id, || async {
                self.catalog.load_user_devices(user_id).await.map(Arc::new)
            })
            .await
            .map_err(|e| fail(EngineError::from_store(e, ctx)))?;
        Ok(devices.as_ref().clone())
    }

    pub async fn list_users_with_devices(&self) -> Result<Vec<String>> {
        self.catalog
            .users_with_devices()
            .await
            .map_err(|e| fail(EngineError::from_store(e, ErrorContext::new("list_users_with_devices"))))
    }

    // ==================== Device mutations ====================

    /// Claim a matching template for `user_id`, or create a new device when none is
    /// left. Returns the id of the user's device.
    pub async fn claim_or_create_device(&self, user_id: &str, spec: DeviceSpec) -> Result<String> {
        let ctx = ErrorContext::new("claim_or_create_device").user(user_id);
        validate_spec(&spec, &ctx).map_err(fail)?;

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let (device_id, today) = self.claim_or_create_locked(user_id, &spec).await?;
        self.after_device_mutation(user_id, today);
        Ok(device_id)
    }

    /// Body of [`Self::claim_or_create_device`] once the user's lock is held. A device
    /// set changed by another writer since it was read fails the whole batch as a
    /// conflict.
    async fn claim_or_create_locked(
        &self,
        user_id: &str,
        spec: &DeviceSpec,
    ) -> Result<(String, NaiveDate)> {
        let today = self.today();
        let ctx = ErrorContext::new("claim_or_create_device").user(user_id).date(today);
        let version = self.device_set_version(user_id, &ctx).await?;
        let owned = self.owned_devices(user_id, &ctx).await?;
        let candidates = self
            .catalog
            .claimable_templates(spec)
            .await
            .map_err(|e| fail(EngineError::from_store(e, ctx.clone())))?;

        for template in candidates {
            let claimed = Device {
                owner_flag: OwnerFlag::User,
                user_id: Some(user_id.to_string()),
                usage_hours_per_day: spec.usage_hours,
                ..template
            };
            let device_key = DocKey::new(DEVICES, &claimed.id);

            let mut batch = WriteBatch::new();
            batch.push(
                WriteOp::Merge {
                    key: device_key.clone(),
                    fields: vec![
                        ("owner_flag".to_string(), Value::from(OwnerFlag::User.as_str())),
                        ("user_id".to_string(), Value::from(user_id)),
                        (
                            "usage_hours_per_day".to_string(),
                            Value::from(spec.usage_hours),
                        ),
                    ],
                },
                Some(Precondition::field_equals(
                    "owner_flag",
                    OwnerFlag::Template.as_str(),
                )),
            );
            let devices = with_device(&owned, &claimed);
            self.push_recompute(&mut batch, user_id, today, version, &devices)
                .map_err(|e| fail(EngineError::from_store(e, ctx.clone())))?;

            match self.store.commit(batch).await {
                Ok(()) => {
                    tracing::debug!(
                        user_id = %user_id,
                        device_id = %claimed.id,
                        "Claimed template device"
                    );
                    record_device_mutation("claim");
                    return Ok((claimed.id, today));
                }
                Err(StoreError::PreconditionFailed(key)) if key == device_key => {
                    tracing::debug!(
                        user_id = %user_id,
                        device_id = %claimed.id,
                        "Template claimed concurrently, trying next candidate"
                    );
                }
                Err(e) => return Err(fail(EngineError::from_store(e, ctx))),
            }
        }

        let device = Device::owned(uuid::Uuid::new_v4().to_string(), user_id, spec);
        let mut batch = WriteBatch::new();
        batch.push(
            WriteOp::Set {
                key: DocKey::new(DEVICES, &device.id),
                data: device
                    .to_document()
                    .map_err(|e| fail(EngineError::from_store(e, ctx.clone())))?,
            },
            Some(Precondition::Missing),
        );
        let devices = with_device(&owned, &device);
        self.push_recompute(&mut batch, user_id, today, version, &devices)
            .map_err(|e| fail(EngineError::from_store(e, ctx.clone())))?;
        self.store
            .commit(batch)
            .await
            .map_err(|e| fail(EngineError::from_store(e, ctx)))?;

        tracing::debug!(user_id = %user_id, device_id = %device.id, "Created device");
        record_device_mutation("create");
        Ok((device.id, today))
    }

    pub async fn update_device(
        &self,
        user_id: &str,
        device_id: &str,
        update: DeviceUpdate,
    ) -> Result<Device> {
        let ctx = ErrorContext::new("update_device").user(user_id);
        validate_update(&update, &ctx).map_err(fail)?;

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let (updated, today) = self.update_locked(user_id, device_id, &update).await?;
        self.after_device_mutation(user_id, today);
        Ok(updated)
    }

    async fn update_locked(
        &self,
        user_id: &str,
        device_id: &str,
        update: &DeviceUpdate,
    ) -> Result<(Device, NaiveDate)> {
        let today = self.today();
        let ctx = ErrorContext::new("update_device").user(user_id).date(today);
        let version = self.device_set_version(user_id, &ctx).await?;
        let current = self.owned_device(user_id, device_id, &ctx).await?;
        let updated = update.apply_to(&current);

        let owned = self.owned_devices(user_id, &ctx).await?;
        let devices = with_device(&owned, &updated);

        let mut batch = WriteBatch::new();
        batch.push(
            WriteOp::Set {
                key: DocKey::new(DEVICES, device_id),
                data: updated
                    .to_document()
                    .map_err(|e| fail(EngineError::from_store(e, ctx.clone())))?,
            },
            Some(Precondition::field_equals("user_id", user_id)),
        );
        self.push_recompute(&mut batch, user_id, today, version, &devices)
            .map_err(|e| fail(EngineError::from_store(e, ctx.clone())))?;
        self.store
            .commit(batch)
            .await
            .map_err(|e| fail(EngineError::from_store(e, ctx)))?;

        tracing::debug!(user_id = %user_id, device_id = %device_id, "Updated device");
        record_device_mutation("update");
        Ok((updated, today))
    }

    pub async fn delete_device(&self, user_id: &str, device_id: &str) -> Result<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let today = self.delete_locked(user_id, device_id).await?;
        self.after_device_mutation(user_id, today);
        Ok(())
    }

    async fn delete_locked(&self, user_id: &str, device_id: &str) -> Result<NaiveDate> {
        let today = self.today();
        let ctx = ErrorContext::new("delete_device").user(user_id).date(today);
        let version = self.device_set_version(user_id, &ctx).await?;
        self.owned_device(user_id, device_id, &ctx).await?;

        let remaining: Vec<Device> = self
            .owned_devices(user_id, &ctx)
            .await?
            .into_iter()
            .filter(|device| device.id != device_id)
            .collect();

        let mut batch = WriteBatch::new();
        batch.push(
            WriteOp::Delete {
                key: DocKey::new(DEVICES, device_id),
            },
            Some(Precondition::field_equals("user_id", user_id)),
        );
        self.push_recompute(&mut batch, user_id, today, version, &remaining)
            .map_err(|e| fail(EngineError::from_store(e, ctx.clone())))?;
        self.store
            .commit(batch)
            .await
            .map_err(|e| fail(EngineError::from_store(e, ctx)))?;

        tracing::debug!(user_id = %user_id, device_id = %device_id, "Deleted device");
        record_device_mutation("delete");
        Ok(today)
    }

    // ==================== Aggregation ====================

    /// Rewrite today's total and per-device breakdown from the user's current devices.
    /// Returns the new total in kWh.
    pub async fn recompute_totals(&self, user_id: &str) -> Result<f64> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let (total, today) = self.recompute_locked(user_id).await?;
        self.schedule_purge(user_id, today);
        Ok(total)
    }

    async fn recompute_locked(&self, user_id: &str) -> Result<(f64, NaiveDate)> {
        let today = self.today();
        let ctx = ErrorContext::new("recompute_totals").user(user_id).date(today);
        let version = self.device_set_version(user_id, &ctx).await?;
        let devices = self.owned_devices(user_id, &ctx).await?;
        let totals = DailyTotals::from_devices(&devices);

        let mut batch = WriteBatch::new();
        let op = totals_write(user_id, today, &totals, self.clock.now())
            .map_err(|e| fail(EngineError::from_store(e, ctx.clone())))?;
        batch.push(op, None);
        self.push_version_bump(&mut batch, user_id, version)
            .map_err(|e| fail(EngineError::from_store(e, ctx.clone())))?;
        self.store
            .commit(batch)
            .await
            .map_err(|e| fail(EngineError::from_store(e, ctx)))?;

        tracing::debug!(user_id = %user_id, total_kwh = totals.total, "Recomputed daily totals");
        Ok((totals.total, today))
    }

    /// Write the synthetic sample for `hour` of today, replacing any earlier sample for
    /// that hour. Returns the sampled kWh.
    pub async fn record_hour_sample(&self, user_id: &str, hour: u8) -> Result<f64> {
        let ctx = ErrorContext::new("record_hour_sample").user(user_id);
        let hour = HourOfDay::new(hour).ok_or_else(|| {
            fail(EngineError::validation(
                format!("hour must be within 0-23, got {}", hour),
                ctx.clone(),
            ))
        })?;

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let (value, today) = self.record_hour_sample_locked(user_id, hour).await?;
        record_hour_sample();
        self.schedule_purge(user_id, today);
        Ok(value)
    }

    async fn record_hour_sample_locked(
        &self,
        user_id: &str,
        hour: HourOfDay,
    ) -> Result<(f64, NaiveDate)> {
        let today = self.today();
        let ctx = ErrorContext::new("record_hour_sample").user(user_id).date(today);
        let version = self.device_set_version(user_id, &ctx).await?;
        let devices = self.owned_devices(user_id, &ctx).await?;
        let value = hourly_consumption(&devices, hour, &self.settings.profile);

        let mut batch = WriteBatch::new();
        let op = hour_sample_write(user_id, today, hour, value, self.clock.now())
            .map_err(|e| fail(EngineError::from_store(e, ctx.clone())))?;
        batch.push(op, None);
        self.push_version_bump(&mut batch, user_id, version)
            .map_err(|e| fail(EngineError::from_store(e, ctx.clone())))?;
        self.store
            .commit(batch)
            .await
            .map_err(|e| fail(EngineError::from_store(e, ctx)))?;

        tracing::trace!(user_id = %user_id, hour = hour.get(), kwh = value, "Recorded hourly sample");
        Ok((value, today))
    }

    /// Inclusive, ordered by date. Backend failures degrade to an empty list.
    pub async fn get_range(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<DailyConsumptionRecord> {
        match self.try_get_range(user_id, start, end).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    start = %start,
                    end = %end,
                    error = %e,
                    "Failed to fetch consumption range, returning empty list"
                );
                Vec::new()
            }
        }
    }

    pub async fn try_get_range(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyConsumptionRecord>> {
        fetch_range(self.store.as_ref(), user_id, start, end)
            .await
            .map_err(|e| {
                let ctx = ErrorContext::new("get_range").user(user_id).date(start);
                fail(EngineError::from_store(e, ctx))
            })
    }

    pub async fn report(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        granularity: Granularity,
    ) -> ConsumptionReport {
        let records = self.get_range(user_id, start, end).await;
        let summary = summarize(&records);
        let periods = match granularity {
            Granularity::Day => ReportPeriods::Day(records),
            Granularity::Week => ReportPeriods::Week(group_by_week(&records)),
            Granularity::Month => ReportPeriods::Month(group_by_month(&records)),
        };

        ConsumptionReport {
            user_id: user_id.to_string(),
            start,
            end,
            granularity: granularity.to_string(),
            periods,
            summary,
        }
    }

    // ==================== Retention ====================

    /// Delete the user's records dated before `cutoff` and wait for the result
    pub async fn purge_older_than(&self, user_id: &str, cutoff: NaiveDate) -> Result<PurgeStats> {
        self.retention
            .purge_older_than(user_id, cutoff)
            .await
            .map_err(|e| {
                let ctx = ErrorContext::new("purge_older_than").user(user_id).date(cutoff);
                fail(EngineError::from_store(e, ctx))
            })
    }

    /// First date inside the retention window
    pub fn retention_cutoff(&self) -> NaiveDate {
        self.retention.cutoff_for(self.today())
    }

    // ==================== Internals ====================

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    async fn device_set_version(&self, user_id: &str, ctx: &ErrorContext) -> Result<DeviceSetVersion> {
        DeviceSetVersion::read(self.store.as_ref(), user_id)
            .await
            .map_err(|e| fail(EngineError::from_store(e, ctx.clone())))
    }

    /// Fresh read of the user's devices, bypassing the cache
    async fn owned_devices(&self, user_id: &str, ctx: &ErrorContext) -> Result<Vec<Device>> {
        self.catalog
            .load_user_devices(user_id)
            .await
            .map_err(|e| fail(EngineError::from_store(e, ctx.clone())))
    }

    /// The device, if it exists and belongs to `user_id`. Other users' devices and
    /// templates are reported as missing.
    async fn owned_device(&self, user_id: &str, device_id: &str, ctx: &ErrorContext) -> Result<Device> {
        let device = self
            .catalog
            .get_device(device_id)
            .await
            .map_err(|e| fail(EngineError::from_store(e, ctx.clone())))?;

        match device {
            Some(device) if device.is_owned_by(user_id) => Ok(device),
            _ => Err(fail(EngineError::not_found("device", device_id, ctx.clone()))),
        }
    }

    /// Append today's totals and the current hour's sample for `devices`, plus the
    /// guarded bump of the device set `version` they were derived under
    fn push_recompute(
        &self,
        batch: &mut WriteBatch,
        user_id: &str,
        today: NaiveDate,
        version: DeviceSetVersion,
        devices: &[Device],
    ) -> std::result::Result<(), StoreError> {
        let now = self.clock.now();
        let hour = self.current_hour();
        let totals = DailyTotals::from_devices(devices);
        let sample = hourly_consumption(devices, hour, &self.settings.profile);

        batch.push(totals_write(user_id, today, &totals, now)?, None);
        batch.push(hour_sample_write(user_id, today, hour, sample, now)?, None);
        self.push_version_bump(batch, user_id, version)
    }

    fn push_version_bump(
        &self,
        batch: &mut WriteBatch,
        user_id: &str,
        version: DeviceSetVersion,
    ) -> std::result::Result<(), StoreError> {
        let (op, precondition) = version.bump(user_id, self.clock.now())?;
        batch.push(op, Some(precondition));
        Ok(())
    }

    fn after_device_mutation(&self, user_id: &str, today: NaiveDate) {
        self.cache.invalidate(CacheKind::UserDevices, user_id);
        self.schedule_purge(user_id, today);
    }

    fn schedule_purge(&self, user_id: &str, today: NaiveDate) {
        if self.settings.retention_enabled {
            self.retention
                .spawn_purge(user_id, self.retention.cutoff_for(today));
        }
    }
}

/// `devices` with `device` inserted, replacing any entry with the same id
fn with_device(devices: &[Device], device: &Device) -> Vec<Device> {
    let mut result: Vec<Device> = devices
        .iter()
        .filter(|d| d.id != device.id)
        .cloned()
        .collect();
    result.push(device.clone());
    result
}

fn fail(err: EngineError) -> EngineError {
    record_engine_error(err.context().operation, err.kind());
    err
}

fn degraded_read(operation: &'static str, err: &StoreError) {
    tracing::warn!(
        operation = operation,
        error = %err,
        "Backend read failed, returning empty list"
    );
}
