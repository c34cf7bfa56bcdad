//! Hourly consumption sampler
//!
//! Periodically writes the current hour's synthetic sample for every user that owns
//! at least one device. Users are sampled concurrently up to a configured limit.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, Duration};

use super::ConsumptionEngine;
use crate::config::SamplerConfig;
use crate::metrics::record_sampler_duration;

/// Result of one sampling pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SampleRunResult {
    /// Number of users with devices
    pub users_checked: usize,
    /// Number of samples written
    pub successful: usize,
    /// Number of users whose sample failed
    pub failed: usize,
}

pub struct HourlySampler {
    engine: Arc<ConsumptionEngine>,
    interval_secs: u64,
    max_concurrency: usize,
}

impl HourlySampler {
    pub fn new(engine: Arc<ConsumptionEngine>, config: &SamplerConfig) -> Self {
        Self {
            engine,
            interval_secs: config.interval_seconds.max(1),
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    /// Sample the engine's current hour for every user with devices
    pub async fn sample_all(&self) -> SampleRunResult {
        let hour = self.engine.current_hour().get();
        self.sample_hour(hour).await
    }

    pub async fn sample_hour(&self, hour: u8) -> SampleRunResult {
        let mut result = SampleRunResult::default();
        let started = Instant::now();

        let users = match self.engine.list_users_with_devices().await {
            Ok(users) => users,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list users for hourly sampling");
                return result;
            }
        };
        result.users_checked = users.len();

        let engine = &self.engine;
        let outcomes: Vec<bool> = stream::iter(users)
            .map(|user_id| async move {
                match engine.record_hour_sample(&user_id, hour).await {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::debug!(
                            user_id = %user_id,
                            hour = hour,
                            error = %e,
                            "Failed to record hourly sample"
                        );
                        false
                    }
                }
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        result.successful = outcomes.iter().filter(|ok| **ok).count();
        result.failed = outcomes.len() - result.successful;
        record_sampler_duration(started.elapsed().as_secs_f64());

        result
    }
}

/// Spawn the background sampling task
pub fn spawn_sampler_task(
    engine: Arc<ConsumptionEngine>,
    config: &SamplerConfig,
) -> tokio::task::JoinHandle<()> {
    let sampler = HourlySampler::new(engine, config);

    tracing::info!(
        interval_secs = sampler.interval_secs,
        max_concurrency = sampler.max_concurrency,
        "Starting hourly consumption sampler"
    );

    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(sampler.interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;

            let result = sampler.sample_all().await;

            if result.users_checked > 0 {
                tracing::info!(
                    users = result.users_checked,
                    successful = result.successful,
                    failed = result.failed,
                    "Hourly sampling pass completed"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DeviceCategory, DeviceSpec, MemoryStore};
    use crate::engine::{EngineSettings, FixedClock};
    use chrono::{TimeZone, Utc};

    fn spec(power_kw: f64) -> DeviceSpec {
        DeviceSpec {
            category_id: DeviceCategory::Lighting,
            manufacturer: "Lumen".to_string(),
            model: "L9".to_string(),
            power_kw,
            usage_hours: 5.0,
        }
    }

    fn engine(memory: Arc<MemoryStore>) -> Arc<ConsumptionEngine> {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 5, 7, 0, 0).unwrap()));
        Arc::new(ConsumptionEngine::with_clock(
            memory,
            EngineSettings::default(),
            clock,
        ))
    }

    #[test]
    fn test_sample_run_result_default() {
        let result = SampleRunResult::default();
        assert_eq!(result.users_checked, 0);
        assert_eq!(result.successful, 0);
        assert_eq!(result.failed, 0);
    }

    #[tokio::test]
    async fn test_samples_every_user_with_devices() {
        let memory = Arc::new(MemoryStore::new());
        let engine = engine(memory);
        for (i, user) in ["u1", "u2", "u3"].iter().enumerate() {
            engine
                .claim_or_create_device(user, spec(0.01 * (i + 1) as f64))
                .await
                .unwrap();
        }

        let config = SamplerConfig {
            max_concurrency: 2,
            ..Default::default()
        };
        let sampler = HourlySampler::new(engine.clone(), &config);
        let result = sampler.sample_hour(20).await;
        assert_eq!(
            result,
            SampleRunResult {
                users_checked: 3,
                successful: 3,
                failed: 0,
            }
        );

        let today = engine.today();
        for user in ["u1", "u2", "u3"] {
            let record = engine.get_range(user, today, today).await.remove(0);
            assert!(record.hourly_consumption.contains_key(&20));
        }
    }

    #[tokio::test]
    async fn test_backend_outage_yields_empty_run() {
        let memory = Arc::new(MemoryStore::new());
        let engine = engine(memory.clone());
        engine.claim_or_create_device("u1", spec(0.01)).await.unwrap();
        memory.set_offline(true);

        let sampler = HourlySampler::new(engine, &SamplerConfig::default());
        assert_eq!(sampler.sample_all().await, SampleRunResult::default());
    }

    #[test]
    fn test_sampler_clamps_settings() {
        let config = SamplerConfig {
            enabled: true,
            interval_seconds: 0,
            max_concurrency: 0,
        };
        let sampler = HourlySampler::new(engine(Arc::new(MemoryStore::new())), &config);
        assert_eq!(sampler.interval_secs, 1);
        assert_eq!(sampler.max_concurrency, 1);
    }
}
