//! # Error Taxonomy
//!
//! Four kinds of failure, with very different handling:
//!
//! - [BridgeError::ApiMismatch]: the receiver doesn't know the service or
//!   function. Recoverable; expected during rolling version skew.
//! - [BridgeError::Remote]: the remote implementation failed. Reconstructed
//!   from a surrogate; unrecognized kinds stay wrapped here.
//! - [BridgeError::InvariantViolation]: the bridge's own bookkeeping was
//!   misused (double-bind, use-after-close). Aborts the operation, never
//!   silently ignored.
//! - [BridgeError::Cancelled] / [BridgeError::Disconnected]: the call was
//!   cancelled cooperatively, or the other side went away entirely.

use tetherwire::ThrowableSurrogate;
use tetherwire::surrogate::TYPE_API_MISMATCH;
use tetherwire::surrogate::TYPE_CANCELLED;

#[derive(Debug, Clone)]
pub enum BridgeError {
    /// Unknown service or function at the receiver. The message lists what
    /// is available there.
    ApiMismatch(String),
    /// The remote implementation returned or raised an error.
    Remote {
        /// Remote type names, best match first. May be empty.
        types: Vec<String>,
        /// Message and trace text from the remote side.
        detail: String,
    },
    /// The call was cancelled before a result was delivered.
    Cancelled,
    /// A programming error in bridge usage: double-bind, double-unbind,
    /// use-after-close, name collision.
    InvariantViolation(String),
    /// A payload or envelope failed to encode or decode.
    Codec(String),
    /// The channel or the opposite endpoint is gone.
    Disconnected(String),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiMismatch(msg) => write!(f, "API mismatch: {}", msg),
            Self::Remote { types, detail } => match types.first() {
                Some(name) => write!(f, "Remote failure ({}): {}", name, detail),
                None => write!(f, "Remote failure: {}", detail),
            },
            Self::Cancelled => write!(f, "Call cancelled"),
            Self::InvariantViolation(msg) => write!(f, "Invariant violation: {}", msg),
            Self::Codec(msg) => write!(f, "Codec error: {}", msg),
            Self::Disconnected(msg) => write!(f, "Disconnected: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<tetherwire::Error> for BridgeError {
    fn from(e: tetherwire::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Shorthand for an application-level remote error with one type name.
    pub fn remote(type_name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Remote {
            types: vec![type_name.into()],
            detail: detail.into(),
        }
    }

    /// Encodes this error as a surrogate for delivery to the other side.
    pub fn to_surrogate(&self) -> ThrowableSurrogate {
        match self {
            Self::ApiMismatch(msg) => {
                ThrowableSurrogate::new(vec![TYPE_API_MISMATCH.to_string()], msg.clone())
            }
            Self::Cancelled => {
                ThrowableSurrogate::new(vec![TYPE_CANCELLED.to_string()], "call cancelled")
            }
            Self::Remote { types, detail } => {
                ThrowableSurrogate::new(types.clone(), detail.clone())
            }
            other => ThrowableSurrogate::opaque(other.to_string()),
        }
    }

    /// Reconstructs an error from a received surrogate.
    ///
    /// Only an allowlist of kinds becomes a concrete local variant; anything
    /// else stays a generic [BridgeError::Remote] so the receiver never needs
    /// the sender's error types.
    pub fn from_surrogate(surrogate: ThrowableSurrogate) -> Self {
        let known = surrogate
            .first_known(&[TYPE_API_MISMATCH, TYPE_CANCELLED])
            .map(str::to_string);
        match known.as_deref() {
            Some(TYPE_API_MISMATCH) => Self::ApiMismatch(surrogate.detail),
            Some(TYPE_CANCELLED) => Self::Cancelled,
            _ => Self::Remote {
                types: surrogate.types,
                detail: surrogate.detail,
            },
        }
    }
}
