//! # Throwable Surrogates
//!
//! Errors cannot be assumed to exist as types on both sides of the
//! boundary, so they travel as a surrogate: an ordered list of type names
//! (best match first) plus the combined message and trace text. The
//! receiver walks the list and reconstructs the first kind it recognizes,
//! falling back to a generic remote error otherwise.

use serde::Deserialize;
use serde::Serialize;

/// Reserved type name for API version-skew failures.
pub const TYPE_API_MISMATCH: &str = "ApiMismatch";

/// Reserved type name for cooperative cancellation.
pub const TYPE_CANCELLED: &str = "Cancelled";

/// The portable stand-in for an error crossing the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrowableSurrogate {
    /// Type names in preference order. Unrecognized names are skipped, so
    /// new kinds can be introduced without breaking old receivers.
    pub types: Vec<String>,
    /// Message and trace, combined into one displayable string.
    pub detail: String,
}

impl ThrowableSurrogate {
    pub fn new(types: Vec<String>, detail: impl Into<String>) -> Self {
        Self {
            types,
            detail: detail.into(),
        }
    }

    /// A surrogate with no recognizable type, carrying only its detail text.
    pub fn opaque(detail: impl Into<String>) -> Self {
        Self::new(Vec::new(), detail)
    }

    /// Returns the first type name the caller recognizes, if any.
    pub fn first_known<'a>(&'a self, known: &[&str]) -> Option<&'a str> {
        self.types
            .iter()
            .map(String::as_str)
            .find(|name| known.contains(name))
    }
}

impl std::fmt::Display for ThrowableSurrogate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.types.first() {
            Some(name) => write!(f, "{}: {}", name, self.detail),
            None => write!(f, "{}", self.detail),
        }
    }
}
