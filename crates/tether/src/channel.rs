//! # Call Channel Abstraction
//!
//! The primitive connecting two runtimes: a plain function call that passes
//! envelope text across the boundary and returns the reply text.
//!
//! ## Philosophy
//!
//! - **Text-Oriented**: The channel moves opaque strings. It never inspects
//!   envelope structure.
//! - **Synchronous by nature**: The underlying boundary (e.g. a call into an
//!   embedded script engine) is a plain function call. Suspension is built
//!   on top of this primitive by the bridge, not inside the channel.

use std::fmt;

/// Errors that occur at the channel layer.
#[derive(Debug, Clone)]
pub enum ChannelError {
    /// The other runtime is unreachable or was torn down.
    Disconnected(String),
    /// Generic channel failure.
    Io(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected(msg) => write!(f, "Channel disconnected: {}", msg),
            Self::Io(msg) => write!(f, "Channel I/O error: {}", msg),
        }
    }
}

impl std::error::Error for ChannelError {}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// One side's handle to the boundary.
///
/// Designed to be object-safe (`Arc<dyn CallChannel>`).
pub trait CallChannel: Send + Sync + 'static {
    /// Sends a call envelope and blocks the calling execution context until
    /// the result envelope text comes back.
    fn call(&self, envelope: &str) -> Result<String>;

    /// Sends a suspending call envelope. Returns immediately with the name
    /// of the cancel callback the remote side bound for this call; the
    /// result is delivered later via a call back to `callback_name`.
    fn call_suspending(&self, envelope: &str, callback_name: &str) -> Result<String>;

    /// Names currently bound on the opposite endpoint. Used to enrich
    /// unknown-service diagnostics; may be empty if unsupported.
    fn list_bound_names(&self) -> Vec<String>;

    /// Asks the opposite endpoint to drop its binding for `name`.
    /// Best-effort; returns whether the name was bound.
    fn disconnect(&self, name: &str) -> bool;
}
