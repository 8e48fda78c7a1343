//! The two command-queue drainers: Control Engine (§4.6) and Settings
//! Engine (§4.7).

pub mod control_engine;
pub mod settings_engine;
