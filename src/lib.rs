pub mod cache;
pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod metrics;

pub use db::Store;
pub use engine::ConsumptionEngine;
pub use error::{EngineError, ErrorContext};
