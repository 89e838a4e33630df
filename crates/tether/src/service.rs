//! # Bridgeable Services and their Adapters
//!
//! A bridgeable interface is an ordinary Rust trait with [BridgeService] as
//! a supertrait. The per-type [ServiceAdapter] is the contract the bridge
//! consumes from a code generator (or a patient human): it enumerates the
//! type's function descriptors and builds proxies.
//!
//! ## Philosophy
//!
//! - **One adapter per interface type, not per object.** Adapters are
//!   stateless beyond their static tables and are safe to share.
//! - **Dispatch by signature string.** The [ServiceType] table maps each
//!   function signature to its descriptor once; no reflection at call time.

use std::collections::HashMap;
use std::sync::Arc;

use crate::descriptor::FunctionDescriptor;
use crate::outbound::OutboundCallHandler;

/// The single capability every bridgeable service implements.
///
/// Closing releases the cross-boundary reference that carried the service.
/// A `close` on a proxy travels through the normal call path and removes
/// the binding on the owning side.
pub trait BridgeService: Send + Sync + 'static {
    fn close(&self) {}
}

/// Per-interface-type blueprint consumed by [crate::Endpoint].
///
/// Implementations are usually generated; hand-written ones are a few dozen
/// lines (see the crate tests for examples).
pub trait ServiceAdapter: Send + Sync + 'static {
    /// The interface this adapter bridges, typically `dyn SomeTrait`.
    type Service: BridgeService + ?Sized;

    /// Stable name identifying the interface type across the boundary.
    fn serial_name(&self) -> &'static str;

    /// The interface's function descriptors, in declaration order.
    /// Must include the close descriptor.
    fn functions(&self) -> Vec<Arc<FunctionDescriptor<Self::Service>>>;

    /// Builds a proxy that forwards every call through `handler`.
    fn new_proxy(&self, handler: OutboundCallHandler<Self::Service>) -> Arc<Self::Service>;

    /// Protocol-internal adapters (suspend and cancel callbacks) skip call
    /// telemetry and leak tracking; application adapters never override this.
    fn is_protocol(&self) -> bool {
        false
    }
}

/// The signature table for one interface type, built once per endpoint and
/// shared by every dispatcher and proxy of that type.
pub struct ServiceType<S: ?Sized> {
    name: String,
    functions: Vec<Arc<FunctionDescriptor<S>>>,
    by_signature: HashMap<String, usize>,
    close_index: Option<usize>,
}

impl<S: ?Sized> ServiceType<S> {
    pub fn new(name: impl Into<String>, functions: Vec<Arc<FunctionDescriptor<S>>>) -> Self {
        let mut by_signature = HashMap::with_capacity(functions.len());
        let mut close_index = None;
        for (index, function) in functions.iter().enumerate() {
            by_signature.insert(function.signature().to_string(), index);
            if function.is_close() {
                close_index = Some(index);
            }
        }
        Self {
            name: name.into(),
            functions,
            by_signature,
            close_index,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function(&self, index: usize) -> &Arc<FunctionDescriptor<S>> {
        &self.functions[index]
    }

    pub fn get(&self, signature: &str) -> Option<&Arc<FunctionDescriptor<S>>> {
        self.by_signature
            .get(signature)
            .map(|&index| &self.functions[index])
    }

    pub fn close_index(&self) -> Option<usize> {
        self.close_index
    }

    /// All known signatures, sorted for stable diagnostics.
    pub fn signatures(&self) -> Vec<String> {
        let mut signatures: Vec<String> = self
            .functions
            .iter()
            .map(|f| f.signature().to_string())
            .collect();
        signatures.sort();
        signatures
    }
}
