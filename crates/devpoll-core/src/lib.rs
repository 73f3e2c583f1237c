//! # devpoll core
//!
//! Subscription-driven polling for BACnet devices.
//!
//! This crate provides:
//! - The device and point data model
//! - A concurrent subscription set with point-in-time snapshots
//! - An injectable recurring-task scheduler and the per-device poll timer
//! - The device lifecycle controller (enable, disable, subscribe, reconfigure)
//! - Boundaries to the transport and the configuration store
//! - A registry of devices with the administrative command surface

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod controller;
pub mod edit;
pub mod gateway;
pub mod point;
pub mod registry;
pub mod store;
pub mod subscription;
pub mod timer;

pub use controller::{
    disconnected_marker, AdminAction, Collaborators, ControllerError, DeviceController,
    DeviceStatus, TimerState, MARKER_FORMAT,
};
pub use edit::{DeviceEdit, EditForm};
pub use gateway::{
    ConnectionSession, DeviceResolver, FetchError, FetchResults, GatewayError, PointUpdate,
    PropertyFetchGateway, ResolveError, ResolveRequest,
};
pub use point::{
    CovMode, DeviceSettings, NetworkIdentity, ObjectType, PointId, PointIdError, RemoteDevice,
};
pub use registry::{AdminCommand, DeviceRegistry, RegistryError};
pub use store::{ConfigurationStore, MemoryStore, StoreError};
pub use subscription::SubscriptionSet;
pub use timer::{ManualScheduler, PollScheduler, PollTimer, Registration, TokioScheduler};
