//! Devices of one connection and the administrative surface over them.

use crate::controller::{Collaborators, ControllerError, DeviceController, DeviceStatus};
use crate::edit::EditForm;
use crate::point::{DeviceSettings, PointId};
use crate::store::StoreError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// An operator or consumer request against one device.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AdminCommand {
    /// Invoke whichever of enable/disable is currently offered
    Toggle,
    /// Enable
    Enable,
    /// Disable
    Disable,
    /// Apply an edit form
    Edit {
        /// Submitted form
        form: EditForm,
    },
    /// Clone persisted configuration under a new name
    Duplicate {
        /// Name of the copy
        name: String,
    },
    /// Delete the device
    Remove,
    /// Register a point
    AddPoint {
        /// Point
        point: PointId,
    },
    /// Forget a point
    RemovePoint {
        /// Point
        point: PointId,
    },
    /// Start live updates for a point
    Subscribe {
        /// Point
        point: PointId,
    },
    /// Stop live updates for a point
    Unsubscribe {
        /// Point
        point: PointId,
    },
}

/// All devices sharing one set of collaborators (one connection).
pub struct DeviceRegistry {
    deps: Collaborators,
    devices: RwLock<BTreeMap<String, Arc<DeviceController>>>,
}

impl DeviceRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new(deps: Collaborators) -> Self {
        Self {
            deps,
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    /// Bring up every persisted device. Returns how many were restored.
    ///
    /// A device whose persisted settings are unusable is skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be listed.
    pub async fn restore_all(&self) -> Result<usize, RegistryError> {
        let mut restored = 0;
        for settings in self.deps.store.list_devices()? {
            let name = settings.name.clone();
            match self.restore(settings).await {
                Ok(_) => restored += 1,
                Err(err) => {
                    tracing::warn!(device = %name, error = %err, "Skipping unrestorable device");
                }
            }
        }
        Ok(restored)
    }

    /// Persist and bring up a new device.
    ///
    /// # Errors
    ///
    /// Returns error if the settings are invalid, a device of that name
    /// exists, or persisting fails.
    pub async fn add_device(
        &self,
        settings: DeviceSettings,
    ) -> Result<Arc<DeviceController>, RegistryError> {
        settings.validate()?;
        if self.deps.store.load_device(&settings.name)?.is_some() {
            return Err(StoreError::AlreadyExists(settings.name).into());
        }
        self.deps.store.save_device(&settings)?;
        self.restore(settings).await
    }

    /// Create a controller for persisted settings. A device persisted as
    /// enabled is enabled (and resolved) right away; if it cannot be
    /// resolved it comes up disabled.
    async fn restore(
        &self,
        settings: DeviceSettings,
    ) -> Result<Arc<DeviceController>, RegistryError> {
        let name = settings.name.clone();
        let enable = settings.enabled;
        let controller = Arc::new(DeviceController::new(settings, None, self.deps.clone())?);

        if enable {
            if let Err(err) = controller.enable().await {
                tracing::warn!(device = %name, error = %err, "Device restored disabled");
            }
        }

        self.devices
            .write()
            .await
            .insert(name, Arc::clone(&controller));
        Ok(controller)
    }

    /// Controller of a device.
    pub async fn get(&self, name: &str) -> Option<Arc<DeviceController>> {
        self.devices.read().await.get(name).cloned()
    }

    /// Names of all devices.
    pub async fn names(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    /// Status of every device.
    pub async fn statuses(&self) -> Vec<DeviceStatus> {
        let controllers: Vec<_> = self.devices.read().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(controllers.len());
        for controller in controllers {
            statuses.push(controller.status().await);
        }
        statuses
    }

    /// Duplicate a device's persisted configuration. The copy starts with
    /// no subscriptions and its timer stopped.
    ///
    /// # Errors
    ///
    /// Returns error if `source` is unknown or `name` is taken.
    pub async fn duplicate(
        &self,
        source: &str,
        name: &str,
    ) -> Result<Arc<DeviceController>, RegistryError> {
        if self.get(source).await.is_none() {
            return Err(RegistryError::UnknownDevice(source.to_string()));
        }
        let settings = self.deps.store.duplicate_device(source, name)?;
        tracing::info!(source, device = name, "Device duplicated");
        self.restore(settings).await
    }

    /// Remove a device: its timer is released and its configuration deleted.
    ///
    /// # Errors
    ///
    /// Returns error if the device is unknown or deletion fails.
    pub async fn remove(&self, name: &str) -> Result<(), RegistryError> {
        let mut devices = self.devices.write().await;
        let controller = devices
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownDevice(name.to_string()))?;
        controller.remove().await?;
        devices.remove(name);
        Ok(())
    }

    /// Execute an administrative command against a device.
    ///
    /// # Errors
    ///
    /// Returns error if the device is unknown or the operation fails.
    pub async fn execute(&self, device: &str, command: AdminCommand) -> Result<(), RegistryError> {
        let controller = self
            .get(device)
            .await
            .ok_or_else(|| RegistryError::UnknownDevice(device.to_string()))?;

        match command {
            AdminCommand::Toggle => controller.toggle().await?,
            AdminCommand::Enable => controller.enable().await?,
            AdminCommand::Disable => controller.disable().await?,
            AdminCommand::Edit { form } => {
                controller.apply_form(form).await?;
                let renamed = controller.name().await;
                if renamed != device {
                    let mut devices = self.devices.write().await;
                    devices.remove(device);
                    devices.insert(renamed, controller);
                }
            }
            AdminCommand::Duplicate { name } => {
                self.duplicate(device, &name).await?;
            }
            AdminCommand::Remove => self.remove(device).await?,
            AdminCommand::AddPoint { point } => controller.register_point(point).await?,
            AdminCommand::RemovePoint { point } => controller.unregister_point(point).await?,
            AdminCommand::Subscribe { point } => controller.add_subscription(point).await?,
            AdminCommand::Unsubscribe { point } => controller.remove_subscription(point).await,
        }
        Ok(())
    }

    /// Stop every device's polling without touching persisted state.
    pub async fn shutdown(&self) {
        let controllers: Vec<_> = self.devices.read().await.values().cloned().collect();
        for controller in controllers {
            controller.shutdown().await;
        }
    }
}

/// Errors from registry operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// No device of that name
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    /// Device operation failed
    #[error(transparent)]
    Controller(#[from] ControllerError),
    /// Store failure
    #[error("configuration store error: {0}")]
    Store(#[from] StoreError),
}
