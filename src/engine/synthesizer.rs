//! Synthetic intra-day usage curve.
//!
//! Static appliance attributes only give a full-day figure. The synthesizer spreads
//! that figure over the day with a per-hour multiplier, optionally overridden per
//! category, so hourly samples look like a plausible household curve. The result is
//! deterministic for a given device set and hour.

use serde::Serialize;

use crate::db::{Device, DeviceCategory};

/// Hour of the day, 0–23
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct HourOfDay(u8);

impl HourOfDay {
    pub fn new(hour: u8) -> Option<Self> {
        (hour < 24).then_some(Self(hour))
    }

    /// Hour from a clock reading, reduced modulo 24
    pub fn wrapping(hour: u32) -> Self {
        Self((hour % 24) as u8)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

/// Macro-periods of a household day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DayPeriod {
    MorningPeak,
    Midday,
    EveningPeak,
    Night,
}

impl DayPeriod {
    pub fn for_hour(hour: HourOfDay) -> Self {
        match hour.get() {
            7..=9 => DayPeriod::MorningPeak,
            10..=16 => DayPeriod::Midday,
            17..=22 => DayPeriod::EveningPeak,
            _ => DayPeriod::Night,
        }
    }

    fn default_multiplier(self) -> f64 {
        match self {
            DayPeriod::Night => 0.4,
            DayPeriod::MorningPeak => 1.3,
            DayPeriod::Midday => 0.9,
            DayPeriod::EveningPeak => 1.6,
        }
    }

    /// Category-specific multiplier for this period, if the category deviates from
    /// the household default
    fn category_multiplier(self, category: DeviceCategory) -> Option<f64> {
        use DayPeriod::*;
        use DeviceCategory::*;

        match (category, self) {
            // Showers and lights cluster around waking up and coming home
            (WaterHeating, MorningPeak) => Some(2.2),
            (WaterHeating, Midday) => Some(0.5),
            (WaterHeating, EveningPeak) => Some(1.8),
            (WaterHeating, Night) => Some(0.2),
            (Lighting, MorningPeak) => Some(1.5),
            (Lighting, Midday) => Some(0.3),
            (Lighting, EveningPeak) => Some(2.2),
            (Lighting, Night) => Some(0.5),
            // Compressor cycling barely follows occupancy
            (Refrigeration, MorningPeak) => Some(1.02),
            (Refrigeration, Midday) => Some(1.05),
            (Refrigeration, EveningPeak) => Some(1.03),
            (Refrigeration, Night) => Some(0.95),
            (Computing | Entertainment, Night) => Some(0.3),
            (Computing | Entertainment, _) => Some(1.2),
            (Cooking, MorningPeak) => Some(1.4),
            (Cooking, Midday) => Some(1.0),
            (Cooking, EveningPeak) => Some(2.0),
            (Cooking, Night) => Some(0.1),
            (Cooling, Midday) => Some(1.5),
            (Cooling, EveningPeak) => Some(1.3),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HourProfile {
    default: f64,
    overrides: [Option<f64>; DeviceCategory::COUNT],
}

/// Per-hour multiplier table: a default plus optional per-category overrides
#[derive(Debug, Clone)]
pub struct UsageProfile {
    hours: [HourProfile; 24],
}

impl Default for UsageProfile {
    fn default() -> Self {
        Self::household()
    }
}

impl UsageProfile {
    /// Built-in household curve
    pub fn household() -> Self {
        let mut hours = [HourProfile {
            default: 1.0,
            overrides: [None; DeviceCategory::COUNT],
        }; 24];

        for (hour, profile) in hours.iter_mut().enumerate() {
            let period = DayPeriod::for_hour(HourOfDay(hour as u8));
            profile.default = period.default_multiplier();
            for category in DeviceCategory::ALL {
                profile.overrides[category.index()] = period.category_multiplier(category);
            }
        }

        Self { hours }
    }

    /// Replace the multiplier for one category at one hour
    pub fn with_override(mut self, hour: HourOfDay, category: DeviceCategory, multiplier: f64) -> Self {
        self.hours[hour.get() as usize].overrides[category.index()] = Some(multiplier);
        self
    }

    /// Multiplier for `category` at `hour`, falling back to the hour's default
    pub fn multiplier(&self, hour: HourOfDay, category: DeviceCategory) -> f64 {
        let profile = &self.hours[hour.get() as usize];
        profile.overrides[category.index()].unwrap_or(profile.default)
    }
}

/// kWh one device uses during `hour`: its flat hourly share of the daily figure,
/// shaped by the profile
pub fn device_hourly_rate(device: &Device, hour: HourOfDay, profile: &UsageProfile) -> f64 {
    let base = device.power_consumption * device.usage_hours_per_day / 24.0;
    base * profile.multiplier(hour, device.category_id)
}

/// Synthetic household consumption for one hour. Devices with no usage are skipped.
pub fn hourly_consumption(devices: &[Device], hour: HourOfDay, profile: &UsageProfile) -> f64 {
    devices
        .iter()
        .filter(|device| device.usage_hours_per_day > 0.0)
        .map(|device| device_hourly_rate(device, hour, profile))
        .sum()
}
