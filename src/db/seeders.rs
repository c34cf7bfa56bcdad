//! Database seeders for built-in data
//!
//! Seeds the category reference data and a starter catalog of preset appliance
//! templates. Categories are upserted on every run. Templates are only created when
//! absent, because a claimed template is converted in place into a user-owned device
//! and must not be reset.

use tracing::{debug, info};

use super::{
    Category, DocKey, Device, DeviceCategory, DocumentStore, Precondition, StoreError,
    WriteBatch, WriteOp, CATEGORIES, DEVICES,
};

/// Outcome of a seeding run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedStats {
    pub categories_written: usize,
    pub templates_created: usize,
    pub templates_skipped: usize,
}

/// Built-in preset templates.
/// Format: (id, category, manufacturer, model, power kW, usage hours/day)
const PRESET_TEMPLATES: &[(&str, DeviceCategory, &str, &str, f64, f64)] = &[
    // ==================== LIGHTING ====================
    ("tpl-philips-hue-a19", DeviceCategory::Lighting, "Philips", "Hue White A19", 0.009, 5.0),
    ("tpl-ikea-tradfri-e27", DeviceCategory::Lighting, "IKEA", "Tradfri E27", 0.0085, 5.0),
    // ==================== WATER HEATING ====================
    ("tpl-ariston-velis-80", DeviceCategory::WaterHeating, "Ariston", "Velis Evo 80", 1.5, 3.0),
    ("tpl-stiebel-dhb-e", DeviceCategory::WaterHeating, "Stiebel Eltron", "DHB-E 18", 18.0, 0.5),
    // ==================== REFRIGERATION ====================
    ("tpl-bosch-kgn39", DeviceCategory::Refrigeration, "Bosch", "KGN39VLEB", 0.12, 24.0),
    ("tpl-samsung-rb38", DeviceCategory::Refrigeration, "Samsung", "RB38T600ESA", 0.1, 24.0),
    // ==================== HEATING / COOLING ====================
    ("tpl-dimplex-oil-2kw", DeviceCategory::Heating, "Dimplex", "OFC2000", 2.0, 4.0),
    ("tpl-daikin-ftxm35", DeviceCategory::Cooling, "Daikin", "FTXM35R", 0.9, 6.0),
    // ==================== COOKING ====================
    ("tpl-bosch-hbf134", DeviceCategory::Cooking, "Bosch", "HBF134ES0", 3.4, 1.0),
    ("tpl-panasonic-nn-e28", DeviceCategory::Cooking, "Panasonic", "NN-E28JMM", 0.8, 0.3),
    // ==================== LAUNDRY ====================
    ("tpl-miele-wwd120", DeviceCategory::Laundry, "Miele", "WWD120", 2.0, 1.0),
    ("tpl-lg-rc80v9", DeviceCategory::Laundry, "LG", "RC80V9AV3Q", 0.9, 1.5),
    // ==================== COMPUTING ====================
    ("tpl-dell-optiplex-7010", DeviceCategory::Computing, "Dell", "OptiPlex 7010", 0.065, 8.0),
    ("tpl-apple-macbook-air", DeviceCategory::Computing, "Apple", "MacBook Air M2", 0.03, 6.0),
    // ==================== ENTERTAINMENT ====================
    ("tpl-lg-oled55-c3", DeviceCategory::Entertainment, "LG", "OLED55C3", 0.1, 4.0),
    ("tpl-sony-ps5", DeviceCategory::Entertainment, "Sony", "PlayStation 5", 0.2, 2.0),
];

/// All built-in preset templates
pub fn preset_templates() -> Vec<Device> {
    PRESET_TEMPLATES
        .iter()
        .map(|&(id, category, manufacturer, model, power, hours)| {
            Device::template(id, category, manufacturer, model, power, hours)
        })
        .collect()
}

/// Seed categories and preset templates (safe to run on every startup)
pub async fn seed_catalog(store: &dyn DocumentStore) -> Result<SeedStats, StoreError> {
    info!("Seeding built-in device catalog...");
    let mut stats = SeedStats::default();

    let mut categories = WriteBatch::new();
    for category in DeviceCategory::ALL {
        categories.set(
            DocKey::new(CATEGORIES, category.as_str()),
            Category::builtin(category).to_document(),
        );
    }
    stats.categories_written = categories.len();
    store.commit(categories).await?;

    for template in preset_templates() {
        let mut batch = WriteBatch::new();
        batch.push(
            WriteOp::Set {
                key: DocKey::new(DEVICES, template.id.as_str()),
                data: template.to_document()?,
            },
            Some(Precondition::Missing),
        );

        match store.commit(batch).await {
            Ok(()) => stats.templates_created += 1,
            Err(StoreError::PreconditionFailed(_)) => {
                debug!(template = %template.id, "Template already present, skipping");
                stats.templates_skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        categories = stats.categories_written,
        created = stats.templates_created,
        skipped = stats.templates_skipped,
        "Device catalog seeded"
    );
    Ok(stats)
}
