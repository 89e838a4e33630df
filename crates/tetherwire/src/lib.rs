//! # Tetherwire
//!
//! The envelope wire format for the tether call bridge.
//!
//! ## Architecture
//!
//! This library defines what actually crosses the runtime boundary: a
//! [CallEnvelope] going one way and a [ResultEnvelope] coming back, both as
//! JSON text. It knows nothing about endpoints, services, or transports.
//! Individual argument and result payloads are opaque [serde_json::Value]s;
//! how a typed value becomes one of those is the caller's concern.

pub mod envelope;
pub mod surrogate;


pub use envelope::CallEnvelope;
pub use envelope::ResultEnvelope;
pub use surrogate::ThrowableSurrogate;

/// Failures while encoding or decoding envelope text.
#[derive(Debug, Clone)]
pub enum Error {
    /// The text was not a well-formed envelope.
    Malformed(String),
    /// Serialization of an envelope failed.
    Serialize(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "Malformed envelope: {}", msg),
            Self::Serialize(msg) => write!(f, "Envelope serialization failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
