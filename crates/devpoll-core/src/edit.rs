//! Administrative edit form.

use crate::controller::ControllerError;
use crate::point::{CovMode, DeviceSettings, NetworkIdentity};
use serde::{Deserialize, Serialize};

/// The operator-facing edit form. Interval is in seconds here and in
/// milliseconds everywhere else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditForm {
    /// Display name
    pub name: String,
    /// MAC address
    pub mac: String,
    /// Device instance number
    pub instance_number: u32,
    /// Polling interval in seconds
    pub polling_interval_secs: f64,
    /// COV usage; unrecognised values mean `NONE`
    pub cov_mode: String,
    /// COV lease in minutes
    pub cov_lease_minutes: u32,
}

impl EditForm {
    /// Form pre-filled with persisted settings.
    #[must_use]
    pub fn from_settings(settings: &DeviceSettings) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let secs = settings.poll_interval_ms as f64 / 1000.0;
        Self {
            name: settings.name.clone(),
            mac: settings.identity.mac.clone(),
            instance_number: settings.identity.instance_number,
            polling_interval_secs: secs,
            cov_mode: settings.cov_mode.to_string(),
            cov_lease_minutes: settings.cov_lease_minutes,
        }
    }

    /// Validate and convert to an edit.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InvalidInterval`] if the interval is not a
    /// positive number of milliseconds.
    pub fn into_edit(self) -> Result<DeviceEdit, ControllerError> {
        let millis = (self.polling_interval_secs * 1000.0).round();
        if !millis.is_finite() || millis < 1.0 || millis > 9.0e15 {
            return Err(ControllerError::InvalidInterval(
                self.polling_interval_secs.to_string(),
            ));
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let poll_interval_ms = millis as u64;

        Ok(DeviceEdit {
            name: self.name,
            identity: NetworkIdentity::new(self.mac, self.instance_number),
            poll_interval_ms,
            cov_mode: CovMode::parse_lenient(&self.cov_mode),
            cov_lease_minutes: self.cov_lease_minutes,
        })
    }
}

/// A validated reconfiguration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEdit {
    /// New display name
    pub name: String,
    /// New network identity
    pub identity: NetworkIdentity,
    /// New polling interval in milliseconds, must be non-zero
    pub poll_interval_ms: u64,
    /// New COV usage
    pub cov_mode: CovMode,
    /// New COV lease
    pub cov_lease_minutes: u32,
}

impl DeviceEdit {
    /// Edit that leaves every field as it is.
    #[must_use]
    pub fn unchanged(settings: &DeviceSettings) -> Self {
        Self {
            name: settings.name.clone(),
            identity: settings.identity.clone(),
            poll_interval_ms: settings.poll_interval_ms,
            cov_mode: settings.cov_mode,
            cov_lease_minutes: settings.cov_lease_minutes,
        }
    }
}
