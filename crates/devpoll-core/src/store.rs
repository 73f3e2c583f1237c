//! Durable device configuration.

use crate::point::{DeviceSettings, PointId};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Hierarchical attribute store for devices and their points, keyed by the
/// device's node name.
pub trait ConfigurationStore: Send + Sync {
    /// All persisted devices.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn list_devices(&self) -> Result<Vec<DeviceSettings>, StoreError>;

    /// Settings of one device.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn load_device(&self, name: &str) -> Result<Option<DeviceSettings>, StoreError>;

    /// Insert or overwrite the device named `settings.name`.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn save_device(&self, settings: &DeviceSettings) -> Result<(), StoreError>;

    /// Persist the enable flag only.
    ///
    /// # Errors
    ///
    /// Returns error if the device does not exist or the backend fails.
    fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError>;

    /// Rename a device node, keeping its points.
    ///
    /// # Errors
    ///
    /// Returns error if `old` does not exist or `new` already does.
    fn rename_device(&self, old: &str, new: &str) -> Result<(), StoreError>;

    /// Delete a device and all its points.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn remove_device(&self, name: &str) -> Result<(), StoreError>;

    /// Points managed under a device.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn points(&self, device: &str) -> Result<Vec<PointId>, StoreError>;

    /// Register a point under a device. No-op if already present.
    ///
    /// # Errors
    ///
    /// Returns error if the device does not exist or the backend fails.
    fn add_point(&self, device: &str, point: PointId) -> Result<(), StoreError>;

    /// Remove a point from a device.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn remove_point(&self, device: &str, point: PointId) -> Result<(), StoreError>;

    /// Stamp a point with a "disconnected since" marker.
    ///
    /// # Errors
    ///
    /// Returns error if the point does not exist or the backend fails.
    fn set_disconnected(&self, device: &str, point: PointId, since: &str)
        -> Result<(), StoreError>;

    /// Clear a point's "disconnected since" marker.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn clear_disconnected(&self, device: &str, point: PointId) -> Result<(), StoreError>;

    /// Current marker of a point, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    fn disconnected_since(&self, device: &str, point: PointId)
        -> Result<Option<String>, StoreError>;

    /// Copy a device's persisted configuration and points under a new name.
    /// Markers are not copied.
    ///
    /// # Errors
    ///
    /// Returns error if `source` does not exist or `name` already does.
    fn duplicate_device(&self, source: &str, name: &str) -> Result<DeviceSettings, StoreError> {
        if self.load_device(name)?.is_some() {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        let mut settings = self
            .load_device(source)?
            .ok_or_else(|| StoreError::NotFound(source.to_string()))?;
        settings.name = name.to_string();
        self.save_device(&settings)?;
        for point in self.points(source)? {
            self.add_point(name, point)?;
        }
        Ok(settings)
    }
}

/// Errors from the configuration store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Device (or point) does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// Target name is taken
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone)]
struct DeviceEntry {
    settings: DeviceSettings,
    /// Point -> disconnected marker
    points: BTreeMap<PointId, Option<String>>,
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: Mutex<BTreeMap<String, DeviceEntry>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigurationStore for MemoryStore {
    fn list_devices(&self) -> Result<Vec<DeviceSettings>, StoreError> {
        Ok(self
            .devices
            .lock()
            .values()
            .map(|e| e.settings.clone())
            .collect())
    }

    fn load_device(&self, name: &str) -> Result<Option<DeviceSettings>, StoreError> {
        Ok(self.devices.lock().get(name).map(|e| e.settings.clone()))
    }

    fn save_device(&self, settings: &DeviceSettings) -> Result<(), StoreError> {
        let mut devices = self.devices.lock();
        match devices.get_mut(&settings.name) {
            Some(entry) => entry.settings = settings.clone(),
            None => {
                devices.insert(
                    settings.name.clone(),
                    DeviceEntry {
                        settings: settings.clone(),
                        points: BTreeMap::new(),
                    },
                );
            }
        }
        Ok(())
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        let mut devices = self.devices.lock();
        let entry = devices
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        entry.settings.enabled = enabled;
        Ok(())
    }

    fn rename_device(&self, old: &str, new: &str) -> Result<(), StoreError> {
        let mut devices = self.devices.lock();
        if devices.contains_key(new) {
            return Err(StoreError::AlreadyExists(new.to_string()));
        }
        let mut entry = devices
            .remove(old)
            .ok_or_else(|| StoreError::NotFound(old.to_string()))?;
        entry.settings.name = new.to_string();
        devices.insert(new.to_string(), entry);
        Ok(())
    }

    fn remove_device(&self, name: &str) -> Result<(), StoreError> {
        self.devices.lock().remove(name);
        Ok(())
    }

    fn points(&self, device: &str) -> Result<Vec<PointId>, StoreError> {
        Ok(self
            .devices
            .lock()
            .get(device)
            .map(|e| e.points.keys().copied().collect())
            .unwrap_or_default())
    }

    fn add_point(&self, device: &str, point: PointId) -> Result<(), StoreError> {
        let mut devices = self.devices.lock();
        let entry = devices
            .get_mut(device)
            .ok_or_else(|| StoreError::NotFound(device.to_string()))?;
        entry.points.entry(point).or_insert(None);
        Ok(())
    }

    fn remove_point(&self, device: &str, point: PointId) -> Result<(), StoreError> {
        if let Some(entry) = self.devices.lock().get_mut(device) {
            entry.points.remove(&point);
        }
        Ok(())
    }

    fn set_disconnected(
        &self,
        device: &str,
        point: PointId,
        since: &str,
    ) -> Result<(), StoreError> {
        let mut devices = self.devices.lock();
        let marker = devices
            .get_mut(device)
            .and_then(|e| e.points.get_mut(&point))
            .ok_or_else(|| StoreError::NotFound(format!("{device}/{point}")))?;
        *marker = Some(since.to_string());
        Ok(())
    }

    fn clear_disconnected(&self, device: &str, point: PointId) -> Result<(), StoreError> {
        if let Some(marker) = self
            .devices
            .lock()
            .get_mut(device)
            .and_then(|e| e.points.get_mut(&point))
        {
            *marker = None;
        }
        Ok(())
    }

    fn disconnected_since(
        &self,
        device: &str,
        point: PointId,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .devices
            .lock()
            .get(device)
            .and_then(|e| e.points.get(&point).cloned())
            .flatten())
    }
}
