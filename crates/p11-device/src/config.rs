//! Device configuration.
//!
//! A small TOML-friendly description of which module to load and how to
//! prepare its slots: per-slot PIN for the retained login session and
//! the attribute cache switch.

use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use crate::device::Device;
use crate::error::P11Error;
use crate::slot::Slot;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Path of the PKCS#11 module to load.
    pub module: Utf8PathBuf,
    #[serde(default)]
    pub slots: Vec<SlotConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotConfig {
    /// Selects the slot by token label.
    pub label: Option<String>,
    /// Selects the slot by id; `label` wins when both are given.
    pub id: Option<u64>,
    /// User PIN to log in with at open time.
    pub pin: Option<String>,
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
}

fn default_use_cache() -> bool {
    true
}

impl DeviceConfig {
    pub fn from_file(path: &Utf8Path) -> Result<Self, P11Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| P11Error::Config(format!("cannot read {path}: {err}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, P11Error> {
        toml::from_str(content).map_err(|err| P11Error::Config(err.to_string()))
    }
}

impl Device {
    /// Opens the configured module and prepares its slots: cache switch
    /// first, then login when a PIN is configured.
    pub fn open_configured(config: &DeviceConfig) -> Result<Arc<Device>, P11Error> {
        let device = Device::open(&config.module)?;
        device.apply_config(config)?;
        Ok(device)
    }

    pub(crate) fn apply_config(&self, config: &DeviceConfig) -> Result<(), P11Error> {
        for slot_config in &config.slots {
            let slot = match self.select_slot(slot_config) {
                Some(slot) => slot,
                None => {
                    warn!(
                        label = ?slot_config.label,
                        id = ?slot_config.id,
                        "configured slot not present, skipping"
                    );
                    continue;
                }
            };
            slot.set_use_cache(slot_config.use_cache);
            if let Some(pin) = &slot_config.pin {
                slot.login(pin)?;
            }
        }
        Ok(())
    }

    fn select_slot(&self, config: &SlotConfig) -> Option<&Arc<Slot>> {
        if let Some(label) = &config.label {
            return self.slot_by_label(label);
        }
        config.id.and_then(|id| self.slot_by_id(id))
    }
}
