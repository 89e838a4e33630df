//! # Bridge Telemetry
//!
//! One listener per endpoint observes the lifecycle of names and calls.
//! The dual start/end hook lets a listener correlate a call with its result
//! by threading an opaque token through, without the bridge keeping any
//! per-call state of its own.

use std::any::Any;

/// An opaque token returned from [EventListener::on_call_start] and handed
/// back at [EventListener::on_call_end].
pub type StartToken = Option<Box<dyn Any + Send>>;

/// A call as observed by telemetry.
#[derive(Debug)]
pub struct Call {
    /// Name of the called service.
    pub service: String,
    /// Signature of the called function.
    pub function: String,
    /// The envelope text as sent or received.
    pub encoded: String,
    /// Names of services passed by reference in the arguments.
    pub service_names: Vec<String>,
}

/// A call result as observed by telemetry.
#[derive(Debug)]
pub struct CallResult {
    pub success: bool,
    /// The result envelope text.
    pub encoded: String,
    /// Names of services passed by reference in the result.
    pub service_names: Vec<String>,
}

/// Observes one endpoint. All hooks default to no-ops; implement only what
/// you need. Protocol-internal callback services never surface here.
pub trait EventListener: Send + Sync + 'static {
    /// A service was bound into the reference table.
    fn on_bind(&self, name: &str, type_name: &str) {
        let _ = (name, type_name);
    }

    /// A proxy was taken for a remote name.
    fn on_take(&self, name: &str, type_name: &str) {
        let _ = (name, type_name);
    }

    /// A proxy was dropped without being closed. Reported at most once per
    /// proxy, on a best-effort sweep.
    fn on_service_leaked(&self, name: &str) {
        let _ = name;
    }

    /// A call is about to cross the boundary (outbound) or be invoked
    /// (inbound). The returned token is passed to [Self::on_call_end].
    fn on_call_start(&self, call: &Call) -> StartToken {
        let _ = call;
        None
    }

    /// The call finished, successfully or not.
    fn on_call_end(&self, call: &Call, result: &CallResult, start: StartToken) {
        let _ = (call, result, start);
    }
}

/// The default listener: observes nothing.
pub struct NullEventListener;

impl EventListener for NullEventListener {}
