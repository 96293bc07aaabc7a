//! Ownership tree (spec §3 "Hierarchy (ownership tree)") and the structural
//! validator that fails fast at startup (spec §7 "Structural"). Grounded on
//! `solarhub/hierarchy/*.py`.

mod devices;
mod entities;
pub mod validator;

pub use devices::{AdapterInstance, Attachment};
pub use entities::{
    Battery, BatteryArray, BatteryCell, BatteryPack, Hierarchy, Inverter, InverterArray, Meter, System,
};
pub use validator::validate;

use crate::error::ConfigError;

/// Loads the ownership tree from a JSON file shaped exactly like
/// `Hierarchy`'s `Serialize` output. Loading mechanics are out of scope
/// for what spec §3 specifies (only the in-memory shape is named there),
/// but the orchestrator needs a concrete tree to run against, so this
/// mirrors `Config::load`'s plain `serde_json::from_str` pattern rather
/// than inventing a bespoke format.
pub fn load(path: &str) -> Result<Hierarchy, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_string(), source })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse { path: path.to_string(), source })
}
