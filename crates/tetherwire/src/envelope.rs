//! # Call and Result Envelopes
//!
//! One call crossing the boundary is a [CallEnvelope]; its answer is a
//! [ResultEnvelope]. Both serialize to JSON text because the boundary
//! primitive is "pass a string, maybe get one back".
//!
//! ## Invariants
//!
//! - `callback` is present exactly when the called function is suspending.
//!   The synchronous reply to such a call is not the result; the result
//!   arrives later as a separate call to the callback service.
//! - Arguments are positional. Names, versioning, and defaults are the
//!   payload codec's problem, not the envelope's.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::Error;
use crate::Result;
use crate::surrogate::ThrowableSurrogate;

/// A single invocation of a function on a named remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    /// The bound name of the receiving service.
    pub service: String,
    /// The signature of the function to invoke, e.g. `"fun greet(String): String"`.
    pub function: String,
    /// For suspending calls, the transient service the result is delivered to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    /// Positional, codec-encoded arguments.
    pub args: Vec<Value>,
}

impl CallEnvelope {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialize(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Malformed(e.to_string()))
    }
}

/// The terminal outcome of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultEnvelope {
    /// The call completed and produced a value (null for unit results).
    Success { value: Value },
    /// The call failed; the error travels as a portable surrogate.
    Failure { error: ThrowableSurrogate },
}

impl ResultEnvelope {
    pub fn success(value: Value) -> Self {
        Self::Success { value }
    }

    pub fn failure(error: ThrowableSurrogate) -> Self {
        Self::Failure { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialize(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Malformed(e.to_string()))
    }
}
