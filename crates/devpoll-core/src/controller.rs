//! Per-device lifecycle: enable state, subscriptions and the poll timer.
//!
//! The poll timer exists exactly when the device is enabled and at least one
//! point is subscribed. Every mutating operation takes the per-device lock and
//! ends by reconciling the timer against that rule, so the invariant holds
//! whenever no operation is in flight.

use crate::edit::{DeviceEdit, EditForm};
use crate::gateway::{
    ConnectionSession, DeviceResolver, FetchError, PointUpdate, PropertyFetchGateway,
    ResolveError, ResolveRequest,
};
use crate::point::{DeviceSettings, PointId, RemoteDevice};
use crate::store::{ConfigurationStore, StoreError};
use crate::subscription::SubscriptionSet;
use crate::timer::{PollScheduler, PollTimer, TickFn, TickFuture};
use chrono::{DateTime, Local, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// `strftime` pattern of the "disconnected since" marker (`yyyyMMdd_HHmmss`).
pub const MARKER_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Render a "disconnected since" marker.
#[must_use]
pub fn disconnected_marker<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format(MARKER_FORMAT).to_string()
}

/// Everything a controller talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Runs poll ticks
    pub scheduler: Arc<dyn PollScheduler>,
    /// Reads point values
    pub gateway: Arc<dyn PropertyFetchGateway>,
    /// Locates devices
    pub resolver: Arc<dyn DeviceResolver>,
    /// Persists settings and markers
    pub store: Arc<dyn ConfigurationStore>,
    /// Connection the device is polled over
    pub session: Arc<dyn ConnectionSession>,
    /// Downstream consumer of fetched values
    pub updates: mpsc::Sender<PointUpdate>,
}

/// The administrative action currently offered for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminAction {
    /// Device is disabled; operator may enable it
    Enable,
    /// Device is enabled; operator may disable it
    Disable,
}

/// Whether the poll timer is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerState {
    /// No registration
    Stopped,
    /// One live registration
    Running,
}

/// Observable state of one device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    /// Device name
    pub name: String,
    /// Enable flag
    pub enabled: bool,
    /// Offered action
    pub action: AdminAction,
    /// Timer state
    pub timer: TimerState,
    /// Period of the running timer, if any
    pub timer_period_ms: Option<u64>,
    /// Configured polling interval
    pub poll_interval_ms: u64,
    /// Number of subscribed points
    pub subscriptions: usize,
    /// Resolved device, if any
    pub device: Option<RemoteDevice>,
}

struct ControllerState {
    settings: DeviceSettings,
    device: Option<RemoteDevice>,
    timer: Option<PollTimer>,
    action: AdminAction,
    removed: bool,
}

/// Lifecycle controller of one device.
pub struct DeviceController {
    deps: Collaborators,
    subscriptions: Arc<SubscriptionSet>,
    /// Bumped on every timer stop; ticks of an older epoch drop their results.
    epoch: Arc<AtomicU64>,
    state: Mutex<ControllerState>,
}

impl DeviceController {
    /// Create a controller with its timer stopped and no subscriptions.
    ///
    /// The device starts enabled only if the settings say so and a resolved
    /// device is supplied. Nothing is persisted.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InvalidInterval`] for a zero interval.
    pub fn new(
        mut settings: DeviceSettings,
        device: Option<RemoteDevice>,
        deps: Collaborators,
    ) -> Result<Self, ControllerError> {
        settings.validate()?;
        settings.enabled = settings.enabled && device.is_some();
        let action = if settings.enabled {
            AdminAction::Disable
        } else {
            AdminAction::Enable
        };

        Ok(Self {
            deps,
            subscriptions: Arc::new(SubscriptionSet::new()),
            epoch: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(ControllerState {
                settings,
                device,
                timer: None,
                action,
                removed: false,
            }),
        })
    }

    /// Enable the device, resolving it first if it never was.
    ///
    /// Markers are cleared even when already enabled.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Resolve`] if the device cannot be located;
    /// the device is then disabled.
    pub async fn enable(&self) -> Result<(), ControllerError> {
        let mut state = self.state.lock().await;
        ensure_present(&state)?;
        self.enable_locked(&mut state).await
    }

    async fn enable_locked(&self, state: &mut ControllerState) -> Result<(), ControllerError> {
        self.clear_markers(&state.settings.name);
        state.settings.enabled = true;

        if state.device.is_none() {
            let request = resolve_request(&state.settings);
            match self.deps.resolver.resolve(&request).await {
                Ok(device) => {
                    tracing::debug!(device = %state.settings.name, identity = %device.identity, "Resolved device");
                    state.device = Some(device);
                }
                Err(err) => {
                    tracing::warn!(device = %state.settings.name, error = %err, "Device resolution failed, disabling");
                    self.disable_locked(state);
                    return Err(ControllerError::Resolve(err));
                }
            }
        }

        self.persist_enabled(&state.settings.name, true);
        state.action = AdminAction::Disable;
        self.reconcile(state);

        tracing::info!(device = %state.settings.name, "Device enabled");
        Ok(())
    }

    /// Disable the device: stop polling and stamp every managed point with a
    /// "disconnected since" marker. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Removed`] if the device was removed.
    pub async fn disable(&self) -> Result<(), ControllerError> {
        let mut state = self.state.lock().await;
        ensure_present(&state)?;
        self.disable_locked(&mut state);
        tracing::info!(device = %state.settings.name, "Device disabled");
        Ok(())
    }

    /// Flip between enabled and disabled, whichever the current action is.
    ///
    /// # Errors
    ///
    /// See [`DeviceController::enable`] and [`DeviceController::disable`].
    pub async fn toggle(&self) -> Result<(), ControllerError> {
        let mut state = self.state.lock().await;
        ensure_present(&state)?;
        match state.action {
            AdminAction::Enable => self.enable_locked(&mut state).await,
            AdminAction::Disable => {
                self.disable_locked(&mut state);
                tracing::info!(device = %state.settings.name, "Device disabled");
                Ok(())
            }
        }
    }

    /// Subscribe a point. No-op if already subscribed.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Removed`] if the device was removed.
    pub async fn add_subscription(&self, point: PointId) -> Result<(), ControllerError> {
        if !self.subscriptions.insert(point) {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        if state.removed {
            self.subscriptions.remove(&point);
            return Err(ControllerError::Removed(state.settings.name.clone()));
        }
        tracing::debug!(device = %state.settings.name, %point, "Point subscribed");
        self.reconcile(&mut state);
        Ok(())
    }

    /// Unsubscribe a point; polling stops once the last one is gone.
    pub async fn remove_subscription(&self, point: PointId) {
        let removed = self.subscriptions.remove(&point);
        let mut state = self.state.lock().await;
        if removed {
            tracing::debug!(device = %state.settings.name, %point, "Point unsubscribed");
        }
        self.reconcile(&mut state);
    }

    /// Apply an administrative edit and restart polling under the new
    /// settings.
    ///
    /// All or nothing with respect to resolution: if the identity changed and
    /// the new device cannot be resolved, nothing is applied and the running
    /// timer is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InvalidInterval`] for a zero interval,
    /// [`ControllerError::Resolve`] if the new identity cannot be resolved,
    /// or [`ControllerError::Store`] if persisting fails.
    pub async fn reconfigure(&self, edit: DeviceEdit) -> Result<(), ControllerError> {
        if edit.poll_interval_ms == 0 {
            return Err(ControllerError::InvalidInterval("0 ms".to_string()));
        }

        let mut state = self.state.lock().await;
        ensure_present(&state)?;

        let resolved = if edit.identity == state.settings.identity {
            None
        } else {
            let request = ResolveRequest {
                identity: edit.identity.clone(),
                poll_interval: Duration::from_millis(edit.poll_interval_ms),
                cov_mode: edit.cov_mode,
                cov_lease_minutes: edit.cov_lease_minutes,
            };
            let device = self.deps.resolver.resolve(&request).await.map_err(|err| {
                tracing::warn!(device = %state.settings.name, identity = %edit.identity, error = %err, "Resolution of new identity failed");
                ControllerError::Resolve(err)
            })?;
            Some(device)
        };

        let old_name = state.settings.name.clone();
        let renamed = edit.name != old_name;
        if renamed {
            self.deps.store.rename_device(&old_name, &edit.name)?;
        }

        let settings = DeviceSettings {
            name: edit.name,
            identity: edit.identity,
            poll_interval_ms: edit.poll_interval_ms,
            cov_mode: edit.cov_mode,
            cov_lease_minutes: edit.cov_lease_minutes,
            enabled: state.settings.enabled,
        };
        if let Err(err) = self.deps.store.save_device(&settings) {
            if renamed {
                if let Err(undo) = self.deps.store.rename_device(&settings.name, &old_name) {
                    tracing::error!(device = %old_name, error = %undo, "Failed to undo rename");
                }
            }
            return Err(err.into());
        }

        state.settings = settings;
        if let Some(device) = resolved {
            state.device = Some(device);
        }

        self.stop_timer(&mut state);
        self.reconcile(&mut state);

        tracing::info!(
            device = %state.settings.name,
            previous_name = %old_name,
            poll_interval_ms = state.settings.poll_interval_ms,
            cov_mode = %state.settings.cov_mode,
            "Device reconfigured"
        );
        Ok(())
    }

    /// Apply an operator edit form.
    ///
    /// # Errors
    ///
    /// See [`EditForm::into_edit`] and [`DeviceController::reconfigure`].
    pub async fn apply_form(&self, form: EditForm) -> Result<(), ControllerError> {
        self.reconfigure(form.into_edit()?).await
    }

    /// Edit form pre-filled from the persisted settings.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Store`] if the store cannot be read.
    pub async fn edit_form(&self) -> Result<EditForm, ControllerError> {
        let state = self.state.lock().await;
        let persisted = self.deps.store.load_device(&state.settings.name)?;
        Ok(EditForm::from_settings(
            persisted.as_ref().unwrap_or(&state.settings),
        ))
    }

    /// Register a point under this device. Registered points are the ones
    /// stamped on disable.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Store`] if persisting fails.
    pub async fn register_point(&self, point: PointId) -> Result<(), ControllerError> {
        let state = self.state.lock().await;
        ensure_present(&state)?;
        self.deps.store.add_point(&state.settings.name, point)?;
        Ok(())
    }

    /// Unsubscribe and forget a point.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Store`] if persisting fails.
    pub async fn unregister_point(&self, point: PointId) -> Result<(), ControllerError> {
        self.remove_subscription(point).await;
        let state = self.state.lock().await;
        self.deps.store.remove_point(&state.settings.name, point)?;
        Ok(())
    }

    /// Stop polling for good and delete the persisted configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Store`] if the configuration cannot be
    /// deleted; the device is then left as it was.
    pub async fn remove(&self) -> Result<(), ControllerError> {
        let mut state = self.state.lock().await;
        if state.removed {
            return Ok(());
        }
        self.deps.store.remove_device(&state.settings.name)?;
        state.removed = true;
        state.settings.enabled = false;
        self.stop_timer(&mut state);
        tracing::info!(device = %state.settings.name, "Device removed");
        Ok(())
    }

    /// Stop polling without touching persisted state.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        self.stop_timer(&mut state);
    }

    /// Current device name.
    pub async fn name(&self) -> String {
        self.state.lock().await.settings.name.clone()
    }

    /// The action currently offered to operators.
    pub async fn current_action(&self) -> AdminAction {
        self.state.lock().await.action
    }

    /// Timer state.
    pub async fn timer_state(&self) -> TimerState {
        if self.state.lock().await.timer.is_some() {
            TimerState::Running
        } else {
            TimerState::Stopped
        }
    }

    /// Full status snapshot.
    pub async fn status(&self) -> DeviceStatus {
        let state = self.state.lock().await;
        let timer_period_ms = state
            .timer
            .as_ref()
            .map(|t| u64::try_from(t.period().as_millis()).unwrap_or(u64::MAX));
        DeviceStatus {
            name: state.settings.name.clone(),
            enabled: state.settings.enabled,
            action: state.action,
            timer: if state.timer.is_some() {
                TimerState::Running
            } else {
                TimerState::Stopped
            },
            timer_period_ms,
            poll_interval_ms: state.settings.poll_interval_ms,
            subscriptions: self.subscriptions.len(),
            device: state.device.clone(),
        }
    }

    /// Currently subscribed points.
    #[must_use]
    pub fn subscribed_points(&self) -> Vec<PointId> {
        self.subscriptions.snapshot()
    }

    fn disable_locked(&self, state: &mut ControllerState) {
        state.settings.enabled = false;
        self.stop_timer(state);
        self.persist_enabled(&state.settings.name, false);
        state.action = AdminAction::Enable;
        self.stamp_markers(&state.settings.name);
    }

    /// Start or stop the timer so that it runs iff enabled with subscribers.
    fn reconcile(&self, state: &mut ControllerState) {
        let wanted =
            state.settings.enabled && state.device.is_some() && !self.subscriptions.is_empty();
        match (wanted, state.timer.is_some()) {
            (true, false) => self.start_timer(state),
            (false, true) => self.stop_timer(state),
            _ => {}
        }
    }

    fn start_timer(&self, state: &mut ControllerState) {
        let Some(device) = state.device.clone() else {
            return;
        };

        let context = Arc::new(TickContext {
            device_name: state.settings.name.clone(),
            device,
            gateway: Arc::clone(&self.deps.gateway),
            session: Arc::clone(&self.deps.session),
            subscriptions: Arc::clone(&self.subscriptions),
            updates: self.deps.updates.clone(),
            epoch: Arc::clone(&self.epoch),
            started_epoch: self.epoch.load(Ordering::SeqCst),
        });
        let tick: TickFn = Arc::new(move || -> TickFuture {
            let context = Arc::clone(&context);
            Box::pin(async move { context.run().await })
        });

        let period = state.settings.poll_interval();
        tracing::debug!(device = %state.settings.name, ?period, "Starting polling");
        state.timer = Some(PollTimer::start(
            self.deps.scheduler.as_ref(),
            period,
            tick,
        ));
    }

    fn stop_timer(&self, state: &mut ControllerState) {
        if let Some(timer) = state.timer.take() {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(device = %state.settings.name, "Stopping polling");
            timer.cancel();
        }
    }

    fn persist_enabled(&self, name: &str, enabled: bool) {
        if let Err(err) = self.deps.store.set_enabled(name, enabled) {
            tracing::warn!(device = %name, enabled, error = %err, "Failed to persist device status");
        }
    }

    fn stamp_markers(&self, name: &str) {
        let since = disconnected_marker(&Local::now());
        for point in self.managed_points(name) {
            if let Err(err) = self.deps.store.set_disconnected(name, point, &since) {
                tracing::warn!(device = %name, %point, error = %err, "Failed to stamp disconnected marker");
            }
        }
    }

    fn clear_markers(&self, name: &str) {
        for point in self.managed_points(name) {
            if let Err(err) = self.deps.store.clear_disconnected(name, point) {
                tracing::warn!(device = %name, %point, error = %err, "Failed to clear disconnected marker");
            }
        }
    }

    fn managed_points(&self, name: &str) -> Vec<PointId> {
        self.deps.store.points(name).unwrap_or_else(|err| {
            tracing::warn!(device = %name, error = %err, "Failed to list points");
            Vec::new()
        })
    }
}

impl DeviceSettings {
    /// Check the settings can drive a poll timer.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InvalidInterval`] for a zero interval.
    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.poll_interval_ms == 0 {
            return Err(ControllerError::InvalidInterval("0 ms".to_string()));
        }
        Ok(())
    }
}

fn ensure_present(state: &ControllerState) -> Result<(), ControllerError> {
    if state.removed {
        Err(ControllerError::Removed(state.settings.name.clone()))
    } else {
        Ok(())
    }
}

fn resolve_request(settings: &DeviceSettings) -> ResolveRequest {
    ResolveRequest {
        identity: settings.identity.clone(),
        poll_interval: settings.poll_interval(),
        cov_mode: settings.cov_mode,
        cov_lease_minutes: settings.cov_lease_minutes,
    }
}

/// What one timer registration needs to run a tick.
struct TickContext {
    device_name: String,
    device: RemoteDevice,
    gateway: Arc<dyn PropertyFetchGateway>,
    session: Arc<dyn ConnectionSession>,
    subscriptions: Arc<SubscriptionSet>,
    updates: mpsc::Sender<PointUpdate>,
    epoch: Arc<AtomicU64>,
    started_epoch: u64,
}

impl TickContext {
    async fn run(&self) {
        if !self.session.is_open() {
            tracing::error!(device = %self.device_name, "Connection is gone, shutting it down");
            self.session.shutdown();
            return;
        }

        let points = self.subscriptions.snapshot();
        if points.is_empty() {
            return;
        }

        tracing::debug!(device = %self.device_name, points = points.len(), "Polling device");

        let mut results = match self.gateway.fetch(&self.device, &points).await {
            Ok(results) => results,
            Err(err) => {
                tracing::warn!(device = %self.device_name, error = %err, "Poll request failed");
                return;
            }
        };

        if self.epoch.load(Ordering::SeqCst) != self.started_epoch {
            tracing::debug!(device = %self.device_name, "Timer stopped during fetch, discarding results");
            return;
        }

        let at = Utc::now();
        for point in points {
            let result = results.remove(&point).unwrap_or(Err(FetchError::Missing));
            if let Err(err) = &result {
                tracing::debug!(device = %self.device_name, %point, error = %err, "Point read failed");
            }
            let update = PointUpdate {
                device: self.device_name.clone(),
                point,
                result,
                at,
            };
            if self.updates.send(update).await.is_err() {
                tracing::warn!(device = %self.device_name, "Update receiver dropped");
                return;
            }
        }
    }
}

/// Errors from device lifecycle operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControllerError {
    /// Polling interval is not positive
    #[error("invalid polling interval: {0}")]
    InvalidInterval(String),
    /// Device could not be resolved
    #[error("device resolution failed: {0}")]
    Resolve(#[from] ResolveError),
    /// Configuration store failure
    #[error("configuration store error: {0}")]
    Store(#[from] StoreError),
    /// Operation on a removed device
    #[error("device {0} has been removed")]
    Removed(String),
}
