//! Document models split into domain-specific modules.

pub mod category;
pub mod consumption;
pub mod device;

pub use category::*;
pub use consumption::*;
pub use device::*;

/// Category reference data
pub const CATEGORIES: &str = "categories";

/// Templates and user-owned devices share one collection
pub const DEVICES: &str = "devices";

/// Per-user bookkeeping documents, keyed by user id
pub const USERS: &str = "users";

/// Per-user daily consumption history collection
pub fn consumption_history(user_id: &str) -> String {
    format!("users/{}/consumption_history", user_id)
}
