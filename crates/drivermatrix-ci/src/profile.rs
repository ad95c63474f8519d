//! Per-variant execution profile.
//!
//! Everything a build or test step needs to know about its variant is
//! carried here and threaded explicitly through each call. The orchestrator
//! never reads these settings from its own process environment; it only
//! exports them to the child processes it spawns.

use crate::error::ConfigurationError;
use crate::matrix::BuildVariant;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// `1` when the pure fallback must be used.
pub const ENV_NO_EXTENSIONS: &str = "DRIVER_NO_EXTENSIONS";
/// Concurrency backend selector.
pub const ENV_EVENT_LOOP: &str = "EVENT_LOOP_MANAGER";
/// `1` when tests must assert which code path was loaded.
pub const ENV_VERIFY_ACCELERATION: &str = "VERIFY_ACCELERATION";
/// `1` when only upgrade tests should run.
pub const ENV_UPGRADE_ONLY: &str = "UPGRADE_ONLY";
/// Path to the protocol simulator binary.
pub const ENV_SIMULATOR_BIN: &str = "SIMULATOR_BIN";
pub const ENV_SERVER_VERSION: &str = "DRIVER_SERVER_VERSION";
pub const ENV_RUNTIME_VERSION: &str = "DRIVER_RUNTIME_VERSION";

/// Whether the native extension is built and exercised.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccelMode {
    On,
    Off,
}

impl AccelMode {
    pub fn parse(value: &str) -> Result<Self, ConfigurationError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "accelerated" | "native" => Ok(AccelMode::On),
            "off" | "false" | "pure" | "none" => Ok(AccelMode::Off),
            _ => Err(ConfigurationError::InvalidAccelMode(value.to_string())),
        }
    }

    pub fn is_on(&self) -> bool {
        matches!(self, AccelMode::On)
    }

    pub fn name(&self) -> &'static str {
        match self {
            AccelMode::On => "accelerated",
            AccelMode::Off => "fallback",
        }
    }
}

/// Which axis names carry the well-known roles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AxisRoles {
    pub runtime: String,
    pub server: String,
    pub backend: String,
    pub accel: String,
}

impl Default for AxisRoles {
    fn default() -> Self {
        Self {
            runtime: "runtime".to_string(),
            server: "server".to_string(),
            backend: "backend".to_string(),
            accel: "accel".to_string(),
        }
    }
}

/// Explicit per-variant settings for build and test steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariantProfile {
    pub runtime: String,
    pub server: String,
    pub backend: String,
    pub accel: AccelMode,
    pub verify_acceleration: bool,
    pub upgrade_only: bool,
    pub simulator_binary: Option<PathBuf>,
}

/// Run-wide switches that feed every profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileSwitches {
    pub verify_acceleration: bool,
    pub upgrade_only: bool,
    pub simulator_binary: Option<PathBuf>,
}

impl VariantProfile {
    /// Derive a profile from a variant. Missing role axes fall back to
    /// empty strings (and `Off` for acceleration).
    pub fn from_variant(
        variant: &BuildVariant,
        roles: &AxisRoles,
        switches: &ProfileSwitches,
    ) -> Result<Self, ConfigurationError> {
        let accel = match variant.get(&roles.accel) {
            Some(value) => AccelMode::parse(value)?,
            None => AccelMode::Off,
        };
        let value = |axis: &str| variant.get(axis).unwrap_or_default().to_string();

        Ok(Self {
            runtime: value(&roles.runtime),
            server: value(&roles.server),
            backend: value(&roles.backend),
            accel,
            verify_acceleration: switches.verify_acceleration,
            upgrade_only: switches.upgrade_only,
            simulator_binary: switches.simulator_binary.clone(),
        })
    }

    /// Environment variables exported to build and test processes.
    pub fn process_env(&self) -> BTreeMap<String, String> {
        let flag = |on: bool| if on { "1" } else { "0" }.to_string();
        let mut env = BTreeMap::new();
        env.insert(ENV_NO_EXTENSIONS.to_string(), flag(!self.accel.is_on()));
        env.insert(ENV_VERIFY_ACCELERATION.to_string(), flag(self.verify_acceleration));
        env.insert(ENV_UPGRADE_ONLY.to_string(), flag(self.upgrade_only));
        if !self.backend.is_empty() {
            env.insert(ENV_EVENT_LOOP.to_string(), self.backend.clone());
        }
        if !self.server.is_empty() {
            env.insert(ENV_SERVER_VERSION.to_string(), self.server.clone());
        }
        if !self.runtime.is_empty() {
            env.insert(ENV_RUNTIME_VERSION.to_string(), self.runtime.clone());
        }
        if let Some(bin) = &self.simulator_binary {
            env.insert(ENV_SIMULATOR_BIN.to_string(), bin.display().to_string());
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{resolve, Axis};

    fn variant(accel: &str) -> BuildVariant {
        let axes = vec![
            Axis::new("runtime", ["3.11"]),
            Axis::new("server", ["4.0"]),
            Axis::new("backend", ["asyncio"]),
            Axis::new("accel", [accel]),
        ];
        resolve(&axes, &[]).unwrap().remove(0)
    }

    #[test]
    fn test_accel_mode_parse() {
        assert_eq!(AccelMode::parse("on").unwrap(), AccelMode::On);
        assert_eq!(AccelMode::parse("Native").unwrap(), AccelMode::On);
        assert_eq!(AccelMode::parse("pure").unwrap(), AccelMode::Off);
        assert!(AccelMode::parse("maybe").is_err());
    }

    #[test]
    fn test_profile_from_variant() {
        let switches = ProfileSwitches {
            verify_acceleration: true,
            ..Default::default()
        };
        let profile = VariantProfile::from_variant(&variant("off"), &AxisRoles::default(), &switches).unwrap();
        assert_eq!(profile.runtime, "3.11");
        assert_eq!(profile.backend, "asyncio");
        assert_eq!(profile.accel, AccelMode::Off);
        assert!(profile.verify_acceleration);
    }

    #[test]
    fn test_process_env_signals() {
        let switches = ProfileSwitches {
            simulator_binary: Some(PathBuf::from("/opt/sim/simulator")),
            ..Default::default()
        };
        let profile = VariantProfile::from_variant(&variant("off"), &AxisRoles::default(), &switches).unwrap();
        let env = profile.process_env();
        assert_eq!(env[ENV_NO_EXTENSIONS], "1");
        assert_eq!(env[ENV_EVENT_LOOP], "asyncio");
        assert_eq!(env[ENV_VERIFY_ACCELERATION], "0");
        assert_eq!(env[ENV_SIMULATOR_BIN], "/opt/sim/simulator");

        let profile = VariantProfile::from_variant(&variant("on"), &AxisRoles::default(), &switches).unwrap();
        assert_eq!(profile.process_env()[ENV_NO_EXTENSIONS], "0");
    }

    #[test]
    fn test_invalid_accel_value_is_configuration_error() {
        let err = VariantProfile::from_variant(
            &variant("sometimes"),
            &AxisRoles::default(),
            &ProfileSwitches::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidAccelMode(_)));
    }
}
