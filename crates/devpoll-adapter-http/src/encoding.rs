//! Request path encoding and response decoding for the gateway API.
//!
//! MAC addresses travel as a single path segment. BACnet/IP MACs are
//! `ip:port`, MS/TP MACs a decimal byte; both are percent-encoded so that
//! `:` and any stray `/` cannot split the segment.

use devpoll_core::{FetchError, FetchResults, GatewayError, PointId};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Characters escaped in a MAC path segment.
const MAC_SEGMENT_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b':')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Percent-encode a MAC address for use as a path segment.
///
/// # Examples
///
/// ```
/// use devpoll_adapter_http::encode_mac_segment;
///
/// assert_eq!(encode_mac_segment("10.0.1.50:47808"), "10.0.1.50%3A47808");
/// assert_eq!(encode_mac_segment("42"), "42");
/// ```
#[must_use]
pub fn encode_mac_segment(mac: &str) -> String {
    utf8_percent_encode(mac, MAC_SEGMENT_ESCAPE).to_string()
}

/// Decode a percent-encoded MAC path segment.
///
/// # Errors
///
/// Returns error if the decoded bytes are not UTF-8.
pub fn decode_mac_segment(encoded: &str) -> Result<String, EncodingError> {
    percent_decode_str(encoded)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| EncodingError::Utf8Decode(e.to_string()))
}

/// Body of a read-multiple request.
#[derive(Debug, Serialize)]
pub struct ReadRequest<'a> {
    /// Points to read, in their text form
    pub points: &'a [PointId],
}

/// Per-point entry of a read-multiple response.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReadEntry {
    Value { value: Value },
    Error { error: String },
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    values: HashMap<String, ReadEntry>,
}

/// Decode a read-multiple response into per-point results.
///
/// Points that were requested but are absent from the response map to
/// [`FetchError::Missing`]; entries for points that were not requested are
/// ignored.
///
/// # Errors
///
/// Returns error if the body does not have the expected shape.
pub fn decode_read_response(
    body: Value,
    requested: &[PointId],
) -> Result<FetchResults, GatewayError> {
    let response: ReadResponse =
        serde_json::from_value(body).map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

    let mut by_point = HashMap::with_capacity(response.values.len());
    for (key, entry) in response.values {
        match key.parse::<PointId>() {
            Ok(point) => {
                by_point.insert(point, entry);
            }
            Err(err) => {
                tracing::debug!(key, error = %err, "Ignoring unparseable point in response");
            }
        }
    }

    Ok(requested
        .iter()
        .map(|point| {
            let result = match by_point.remove(point) {
                Some(ReadEntry::Value { value }) => Ok(value),
                Some(ReadEntry::Error { error }) => Err(FetchError::Device(error)),
                None => Err(FetchError::Missing),
            };
            (*point, result)
        })
        .collect())
}

/// Errors that can occur during encoding/decoding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EncodingError {
    /// UTF-8 decoding failed
    #[error("UTF-8 decode error: {0}")]
    Utf8Decode(String),
}
