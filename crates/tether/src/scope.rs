//! # Proxy Scopes
//!
//! A scope collects proxies so a whole group can be released with one call.
//! Closing is idempotent; each member is closed once, and members that were
//! already closed individually stay closed.

use std::sync::Arc;
use std::sync::Mutex;

use crate::endpoint::lock_unpoisoned;
use crate::error::BridgeError;
use crate::error::Result;

/// Type-erased view of one proxy, enough to close it.
pub trait ProxyHandle: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn is_closed(&self) -> bool;
    fn close(&self);
}

#[derive(Default)]
pub struct ProxyScope {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    closed: bool,
    members: Vec<Arc<dyn ProxyHandle>>,
}

impl ProxyScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        lock_unpoisoned(&self.inner).closed
    }

    /// Registers a proxy for closing when this scope closes. Fails once the
    /// scope is closed.
    pub fn add(&self, handle: Arc<dyn ProxyHandle>) -> Result<()> {
        let mut inner = lock_unpoisoned(&self.inner);
        if inner.closed {
            return Err(BridgeError::InvariantViolation(
                "scope is closed".to_string(),
            ));
        }
        if !inner.members.iter().any(|m| Arc::ptr_eq(m, &handle)) {
            inner.members.push(handle);
        }
        Ok(())
    }

    /// Closes every member exactly once. Later calls are no-ops.
    ///
    /// Members are drained before any close runs, so a member whose close
    /// re-enters the scope never deadlocks.
    pub fn close(&self) {
        let members = {
            let mut inner = lock_unpoisoned(&self.inner);
            if inner.closed {
                return;
            }
            inner.closed = true;
            std::mem::take(&mut inner.members)
        };
        for member in members {
            member.close();
        }
    }

    /// Members registered and not yet closed; diagnostic only.
    pub fn open_members(&self) -> Vec<String> {
        lock_unpoisoned(&self.inner)
            .members
            .iter()
            .filter(|m| !m.is_closed())
            .map(|m| m.name().to_string())
            .collect()
    }
}
