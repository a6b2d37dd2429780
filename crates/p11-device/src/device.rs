//! Top-level device façade.
//!
//! One [`Device`] per loaded PKCS#11 module. The Cryptoki library may
//! only be initialised once per process, so devices are held in a
//! process-wide registry keyed by module path; re-opening a path hands
//! back the existing device and an "already initialized" answer from the
//! module is treated as success.

use camino::Utf8Path;
use camino::Utf8PathBuf;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use tracing::debug;
use tracing::warn;

use crate::error::P11Error;
use crate::pkcs11::Cryptoki;
use crate::pkcs11::CryptokiModule;
use crate::pkcs11::SlotId;
use crate::slot::Slot;

static DEVICES: Lazy<Mutex<HashMap<Utf8PathBuf, Arc<Device>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// A PKCS#11 module with its slots enumerated.
///
/// Slots are indexed three ways: by slot id, by 0-based arrival index and
/// by token label. The topology is static; slots are enumerated once at
/// construction.
pub struct Device {
    slots: Vec<Arc<Slot>>,
    by_id: HashMap<SlotId, usize>,
    by_label: HashMap<String, usize>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl Device {
    /// Opens the module at `path`, or returns the device already opened
    /// for it.
    pub fn open(path: &Utf8Path) -> Result<Arc<Device>, P11Error> {
        let mut devices = DEVICES.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(device) = devices.get(path) {
            debug!(%path, "reusing already opened device");
            return Ok(Arc::clone(device));
        }
        let api: Arc<dyn Cryptoki> = Arc::new(CryptokiModule::load(path)?);
        let device = Arc::new(Device::with_api(api)?);
        devices.insert(path.to_path_buf(), Arc::clone(&device));
        Ok(device)
    }

    pub(crate) fn with_api(api: Arc<dyn Cryptoki>) -> Result<Device, P11Error> {
        api.initialize()?;

        let ids = api.slot_ids(true)?;
        let mut slots = Vec::with_capacity(ids.len());
        let mut by_id = HashMap::new();
        let mut by_label = HashMap::new();

        for (index, id) in ids.into_iter().enumerate() {
            let info = api.token_info(id)?;
            let label = match token_label(&info.label) {
                Ok(label) => Some(label),
                Err(err) => {
                    warn!(
                        slot = id,
                        error = %err,
                        "token label is not valid UTF-8, slot only reachable by id and index"
                    );
                    None
                }
            };
            if let Some(label) = &label {
                if by_label.contains_key(label) {
                    warn!(slot = id, label, "duplicate token label, first slot wins");
                } else {
                    by_label.insert(label.clone(), index);
                }
            }
            by_id.insert(id, index);
            slots.push(Arc::new(Slot::new(Arc::clone(&api), id, label)));
        }
        debug!(slots = slots.len(), "device initialized");

        Ok(Device {
            slots,
            by_id,
            by_label,
        })
    }

    /// All slots with a present token, in arrival order.
    pub fn slots(&self) -> &[Arc<Slot>] {
        &self.slots
    }

    pub fn slot_by_id(&self, id: SlotId) -> Option<&Arc<Slot>> {
        self.by_id.get(&id).map(|index| &self.slots[*index])
    }

    pub fn slot_by_index(&self, index: usize) -> Option<&Arc<Slot>> {
        self.slots.get(index)
    }

    pub fn slot_by_label(&self, label: &str) -> Option<&Arc<Slot>> {
        self.by_label.get(label).map(|index| &self.slots[*index])
    }
}

/// Decodes a space-padded token label as strict UTF-8.
fn token_label(raw: &[u8; 32]) -> Result<String, std::str::Utf8Error> {
    let end = raw
        .iter()
        .rposition(|byte| *byte != b' ' && *byte != 0)
        .map_or(0, |last| last + 1);
    std::str::from_utf8(&raw[..end]).map(str::to_owned)
}
