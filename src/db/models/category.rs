//! Appliance categories.

use serde::{Deserialize, Serialize};

use crate::db::{DocKey, Document, StoreError, CATEGORIES};

/// Closed set of appliance categories. Unknown values inside a device document map to
/// [`DeviceCategory::Other`]; unknown category documents are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    Lighting,
    WaterHeating,
    Refrigeration,
    Heating,
    Cooling,
    Cooking,
    Laundry,
    Computing,
    Entertainment,
    #[serde(other)]
    Other,
}

impl DeviceCategory {
    pub const ALL: [DeviceCategory; 10] = [
        DeviceCategory::Lighting,
        DeviceCategory::WaterHeating,
        DeviceCategory::Refrigeration,
        DeviceCategory::Heating,
        DeviceCategory::Cooling,
        DeviceCategory::Cooking,
        DeviceCategory::Laundry,
        DeviceCategory::Computing,
        DeviceCategory::Entertainment,
        DeviceCategory::Other,
    ];

    pub const COUNT: usize = Self::ALL.len();

    /// Stable position in [`DeviceCategory::ALL`], used to index lookup tables
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lighting => "lighting",
            Self::WaterHeating => "water_heating",
            Self::Refrigeration => "refrigeration",
            Self::Heating => "heating",
            Self::Cooling => "cooling",
            Self::Cooking => "cooking",
            Self::Laundry => "laundry",
            Self::Computing => "computing",
            Self::Entertainment => "entertainment",
            Self::Other => "other",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Lighting => "Lighting",
            Self::WaterHeating => "Water heating",
            Self::Refrigeration => "Refrigeration",
            Self::Heating => "Heating",
            Self::Cooling => "Cooling",
            Self::Cooking => "Cooking",
            Self::Laundry => "Laundry",
            Self::Computing => "Computing",
            Self::Entertainment => "Entertainment",
            Self::Other => "Other",
        }
    }
}

impl std::fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeviceCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == normalized)
            .ok_or_else(|| format!("Unknown device category: {}", s))
    }
}

/// Category reference data, stored at `categories/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: DeviceCategory,
    pub name: String,
}

impl Category {
    pub fn builtin(id: DeviceCategory) -> Self {
        Self {
            id,
            name: id.display_name().to_string(),
        }
    }

    /// Fails with [`StoreError::UnknownId`] when `id` is not a known category
    pub fn from_document(id: &str, doc: Document) -> Result<Self, StoreError> {
        let name = doc
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let id: DeviceCategory = id
            .parse()
            .map_err(|_| StoreError::UnknownId(DocKey::new(CATEGORIES, id)))?;
        Ok(Self {
            name: name.unwrap_or_else(|| id.display_name().to_string()),
            id,
        })
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("name".to_string(), self.name.clone().into());
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_matches_position_in_all() {
        for (position, category) in DeviceCategory::ALL.iter().enumerate() {
            assert_eq!(category.index(), position);
        }
    }

    #[test]
    fn test_parse_category() {
        assert_eq!(
            "water-heating".parse::<DeviceCategory>().unwrap(),
            DeviceCategory::WaterHeating
        );
        assert_eq!(
            "Lighting".parse::<DeviceCategory>().unwrap(),
            DeviceCategory::Lighting
        );
        assert!("jetpack".parse::<DeviceCategory>().is_err());
    }

    #[test]
    fn test_category_document_requires_known_id() {
        let mut doc = Document::new();
        doc.insert("name".to_string(), "Boilers".into());
        let category = Category::from_document("water_heating", doc.clone()).unwrap();
        assert_eq!(category.id, DeviceCategory::WaterHeating);
        assert_eq!(category.name, "Boilers");

        assert!(matches!(
            Category::from_document("jetpack", doc),
            Err(StoreError::UnknownId(key)) if key.id == "jetpack"
        ));
    }

    #[test]
    fn test_unknown_serialized_category_falls_back_to_other() {
        let parsed: DeviceCategory = serde_json::from_str("\"jetpack\"").unwrap();
        assert_eq!(parsed, DeviceCategory::Other);
        assert_eq!(
            serde_json::to_string(&DeviceCategory::WaterHeating).unwrap(),
            "\"water_heating\""
        );
    }
}
