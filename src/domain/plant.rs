//! Plant identity, transport mode, and physical plant model.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The two plants on site: lithium-ion and vanadium-redox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlantId {
    Lib,
    Vrfb,
}

impl PlantId {
    /// Fixed set, deterministic iteration order.
    pub const ALL: [PlantId; 2] = [PlantId::Lib, PlantId::Vrfb];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlantId::Lib => "lib",
            PlantId::Vrfb => "vrfb",
        }
    }
}

impl fmt::Display for PlantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `local` = in-process emulator on loopback; `remote` = physical controller.
/// Selected per-process; switching requires a safe-stop of both plants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Local,
    Remote,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Local => "local",
            TransportMode::Remote => "remote",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static physical characteristics of a plant, independent of transport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlantModel {
    pub capacity_kwh: f64,
    pub p_max_kw: f64,
    pub p_min_kw: f64,
    pub q_max_kvar: f64,
    pub q_min_kvar: f64,
    pub poi_voltage_kv: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plant_ids_iterate_in_fixed_order() {
        assert_eq!(PlantId::ALL, [PlantId::Lib, PlantId::Vrfb]);
    }

    #[test]
    fn display_matches_config_naming() {
        assert_eq!(PlantId::Lib.to_string(), "lib");
        assert_eq!(TransportMode::Remote.to_string(), "remote");
    }
}
