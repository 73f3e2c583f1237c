//! Boundaries to the device-communication transport.

use crate::point::{CovMode, NetworkIdentity, PointId, RemoteDevice};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Per-point results of one batched fetch.
pub type FetchResults = HashMap<PointId, Result<Value, FetchError>>;

/// Reads present values of many points on one device in a single request.
#[async_trait]
pub trait PropertyFetchGateway: Send + Sync {
    /// Fetch all `points` of `device`.
    ///
    /// A point missing from the returned map is treated as failed.
    ///
    /// # Errors
    ///
    /// Returns error only when the whole request failed; individual point
    /// failures are reported inside the map.
    async fn fetch(
        &self,
        device: &RemoteDevice,
        points: &[PointId],
    ) -> Result<FetchResults, GatewayError>;
}

/// Parameters for locating a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveRequest {
    /// Where to look
    pub identity: NetworkIdentity,
    /// Polling interval the device will be polled at
    pub poll_interval: Duration,
    /// COV usage
    pub cov_mode: CovMode,
    /// COV lease
    pub cov_lease_minutes: u32,
}

/// Locates a device on the network and reads its identifying properties.
#[async_trait]
pub trait DeviceResolver: Send + Sync {
    /// Resolve a device.
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be located or contacted.
    async fn resolve(&self, request: &ResolveRequest) -> Result<RemoteDevice, ResolveError>;
}

/// The connection a device's polling runs over.
pub trait ConnectionSession: Send + Sync {
    /// Whether the local side of the connection is still up.
    fn is_open(&self) -> bool;

    /// Tear down the whole connection.
    fn shutdown(&self);
}

/// A fetched value (or failure) for one point, delivered downstream.
#[derive(Debug, Clone)]
pub struct PointUpdate {
    /// Device name
    pub device: String,
    /// Point
    pub point: PointId,
    /// Value or per-point failure
    pub result: Result<Value, FetchError>,
    /// When the tick completed
    pub at: DateTime<Utc>,
}

/// Failure reading a single point.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Device reported an error for the property
    #[error("device error: {0}")]
    Device(String),
    /// Point absent from the response
    #[error("no value returned")]
    Missing,
}

/// Failure of a whole batched request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(String),
    /// Response could not be interpreted
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Failure locating a device.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    /// Nothing answered at that identity
    #[error("device {0} not found")]
    NotFound(NetworkIdentity),
    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(String),
}
