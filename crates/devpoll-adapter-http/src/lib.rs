//! # devpoll HTTP adapter
//!
//! Talks to a BACnet/IP gateway service over HTTP(S) and implements the
//! transport boundaries of `devpoll-core`:
//!
//! - [`devpoll_core::PropertyFetchGateway`]: one read-multiple request per
//!   poll tick, per-point values or errors in the response
//! - [`devpoll_core::DeviceResolver`]: locate a device by MAC and instance
//!
//! ## Path encoding
//!
//! MAC addresses are percent-encoded into a single path segment; point
//! identifiers travel in request bodies in their `type:instance` text form.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod encoding;

pub use client::{ClientError, GatewayClient, GatewayClientConfig};
pub use encoding::{decode_mac_segment, decode_read_response, encode_mac_segment};
