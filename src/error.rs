use thiserror::Error;

pub use crate::util::uri::UriError;

/// Errors surfaced by the client.
///
/// Transient conditions are deliberately not represented here: a data call
/// that never sees an HTTP 200 within its retry budget resolves to `Ok(None)`
/// rather than an error, and a failed authentication leaves the session
/// disconnected without raising. What does surface as `Error` is either
/// environment-shaped (transport, undecodable bodies) or caller-shaped
/// (unknown identifiers).
#[derive(Debug, Error)]
pub enum Error {
    /// Network-level failure talking to the service.
    #[error("http transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// A 200 response carried a body that is not valid JSON.
    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    /// A structurally valid response is missing a field the protocol requires.
    #[error("response is missing required field `{0}`")]
    MissingField(&'static str),

    /// The given device id does not exist in the account data.
    #[error("no device with id {0}")]
    UnknownDevice(String),

    /// A call whose result is required stayed empty after its retry budget.
    #[error("no data obtained from {0}")]
    NoData(String),

    #[error("invalid endpoint URI: {0}")]
    Uri(#[from] UriError),
}
