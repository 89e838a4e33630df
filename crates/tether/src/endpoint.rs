//! # Endpoint
//!
//! One side's owner of all bridge state for one connection: the reference
//! table of bound inbound services, the channel to the other side, the
//! telemetry listener, and the task scope that suspending dispatches run on.
//!
//! ## Invariants
//!
//! - Binding an already-bound name and unbinding an absent one are invariant
//!   violations, never silent.
//! - Dispatch never holds a table lock while invoking a service, so services
//!   may bind, unbind, and call back into the endpoint re-entrantly.
//! - The synchronous dispatch entry point always returns an encoded result
//!   envelope; parse and lookup failures become failure envelopes.
//!
//! ## Architecture
//!
//! Two endpoints face each other across a [CallChannel]. Each is both a
//! client (outbound proxies) and a server (inbound dispatch); the roles are
//! symmetric and a single endpoint plays both at once.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tetherwire::CallEnvelope;
use tetherwire::ResultEnvelope;
use tokio::task::AbortHandle;

use crate::channel::CallChannel;
use crate::error::BridgeError;
use crate::error::Result;
use crate::event::EventListener;
use crate::event::NullEventListener;
use crate::inbound::InboundDispatch;
use crate::inbound::InboundService;
use crate::inbound::deliver_failure;
use crate::outbound::OutboundCallHandler;
use crate::outbound::ProxyState;
use crate::scope::ProxyScope;
use crate::service::ServiceAdapter;
use crate::service::ServiceType;

/// Prefix of names generated for pass-by-reference services and suspend
/// callbacks. Application bind names must not start with this.
pub const GENERATED_NAME_PREFIX: &str = "tether/";

const FAILURE_FALLBACK: &str =
    r#"{"Failure":{"error":{"types":[],"detail":"result envelope serialization failed"}}}"#;

pub struct Endpoint {
    // Backs the owned handles (proxy states, codec contexts) this endpoint
    // hands out; always upgradable while any caller holds `&self`.
    self_ref: Weak<Endpoint>,
    channel: Arc<dyn CallChannel>,
    listener: Arc<dyn EventListener>,
    inbound: DashMap<String, Arc<dyn InboundDispatch>>,
    types: DashMap<&'static str, Arc<dyn Any + Send + Sync>>,
    next_name: AtomicU64,
    tasks: TaskScope,
    leaked: Mutex<Vec<String>>,
}

impl Endpoint {
    pub fn new(channel: Arc<dyn CallChannel>) -> Arc<Self> {
        Self::with_listener(channel, Arc::new(NullEventListener))
    }

    pub fn with_listener(
        channel: Arc<dyn CallChannel>,
        listener: Arc<dyn EventListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            channel,
            listener,
            inbound: DashMap::new(),
            types: DashMap::new(),
            next_name: AtomicU64::new(0),
            tasks: TaskScope::new(),
            leaked: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn shared(&self) -> Arc<Endpoint> {
        self.self_ref
            .upgrade()
            .expect("endpoint outlived its own allocation")
    }

    /// Publishes `service` under `name` so the other side can call it.
    pub fn bind<A: ServiceAdapter>(
        &self,
        name: &str,
        service: Arc<A::Service>,
        adapter: &A,
    ) -> Result<()> {
        let ty = self.service_type(adapter);
        let dispatcher: Arc<dyn InboundDispatch> =
            Arc::new(InboundService::new(service, ty, adapter.is_protocol()));
        match self.inbound.entry(name.to_string()) {
            Entry::Occupied(_) => {
                return Err(BridgeError::InvariantViolation(format!(
                    "name is already bound: {name}"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(dispatcher);
            }
        }
        if !adapter.is_protocol() {
            tracing::debug!(name, type_name = adapter.serial_name(), "bind");
            self.listener.on_bind(name, adapter.serial_name());
        }
        Ok(())
    }

    /// Removes the binding for `name`. Absence is an invariant violation;
    /// use [Self::disconnect] for best-effort removal.
    pub fn unbind(&self, name: &str) -> Result<Arc<dyn InboundDispatch>> {
        self.inbound
            .remove(name)
            .map(|(_, dispatcher)| dispatcher)
            .ok_or_else(|| {
                BridgeError::InvariantViolation(format!("name is not bound: {name}"))
            })
    }

    /// Best-effort removal; used by close dispatch and channel disconnects,
    /// which may race with an explicit unbind.
    pub fn disconnect(&self, name: &str) -> bool {
        self.inbound.remove(name).is_some()
    }

    /// Builds a proxy for the service the other side bound under `name`.
    ///
    /// Purely local: no envelope crosses the boundary until the proxy is
    /// called. Taking a name nobody bound yields a proxy whose calls fail
    /// with an API mismatch.
    pub fn take<A: ServiceAdapter>(&self, name: &str, adapter: &A) -> Arc<A::Service> {
        let (proxy, _handle) = self.take_inner(name, adapter);
        proxy
    }

    /// Like [Self::take], but registers the proxy in `scope` so it is closed
    /// when the scope closes.
    pub fn take_in<A: ServiceAdapter>(
        &self,
        name: &str,
        scope: &ProxyScope,
        adapter: &A,
    ) -> Result<Arc<A::Service>> {
        if scope.is_closed() {
            return Err(BridgeError::InvariantViolation(
                "scope is closed".to_string(),
            ));
        }
        let (proxy, handle) = self.take_inner(name, adapter);
        if scope.add(handle.clone()).is_err() {
            // Lost a race with a concurrent scope close; honor its outcome.
            handle.close();
            return Err(BridgeError::InvariantViolation(
                "scope is closed".to_string(),
            ));
        }
        Ok(proxy)
    }

    fn take_inner<A: ServiceAdapter>(
        &self,
        name: &str,
        adapter: &A,
    ) -> (Arc<A::Service>, Arc<dyn crate::scope::ProxyHandle>) {
        if !adapter.is_protocol() {
            self.detect_leaks();
        }
        let ty = self.service_type(adapter);
        let state = Arc::new(ProxyState::new(
            name.to_string(),
            self.shared(),
            !adapter.is_protocol(),
        ));
        let handler = OutboundCallHandler::new(ty, state, adapter.is_protocol());
        let handle = handler.handle();
        if !adapter.is_protocol() {
            tracing::debug!(name, type_name = adapter.serial_name(), "take");
            self.listener.on_take(name, adapter.serial_name());
        }
        (adapter.new_proxy(handler), handle)
    }

    /// A fresh name for a pass-by-reference service or suspend callback.
    pub fn generate_name(&self) -> String {
        let n = self.next_name.fetch_add(1, Ordering::Relaxed);
        format!("{GENERATED_NAME_PREFIX}{n}")
    }

    /// Names currently bound on this endpoint, sorted.
    pub fn bound_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inbound.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Entry point for synchronous calls arriving from the channel.
    ///
    /// Always returns encoded result envelope text, even for malformed input.
    pub fn dispatch_incoming(&self, envelope: &str) -> String {
        let result = self.dispatch_sync(envelope);
        result
            .to_json()
            .unwrap_or_else(|_| FAILURE_FALLBACK.to_string())
    }

    fn dispatch_sync(&self, envelope: &str) -> ResultEnvelope {
        let call = match CallEnvelope::from_json(envelope) {
            Ok(call) => call,
            Err(e) => return ResultEnvelope::failure(BridgeError::from(e).to_surrogate()),
        };
        if call.callback.is_some() {
            let error = BridgeError::InvariantViolation(
                "suspending envelope on the synchronous entry point".to_string(),
            );
            return ResultEnvelope::failure(error.to_surrogate());
        }
        let Some(dispatcher) = self.dispatcher(&call.service) else {
            return ResultEnvelope::failure(self.unknown_service_error(&call.service).to_surrogate());
        };
        dispatcher.dispatch(&self.shared(), call, envelope)
    }

    /// Entry point for suspending calls arriving from the channel.
    ///
    /// Returns promptly with the name of the cancel callback bound for this
    /// call; the result is delivered later through the caller's callback.
    pub fn dispatch_incoming_suspending(&self, envelope: &str) -> Result<String> {
        let call = CallEnvelope::from_json(envelope)?;
        let Some(callback_name) = call.callback.clone() else {
            return Err(BridgeError::InvariantViolation(
                "suspending envelope is missing its callback name".to_string(),
            ));
        };
        match self.dispatcher(&call.service) {
            Some(dispatcher) => dispatcher.dispatch_suspending(&self.shared(), call, envelope),
            None => {
                let error = self.unknown_service_error(&call.service);
                deliver_failure(&self.shared(), &callback_name, error)
            }
        }
    }

    // Clones the dispatcher out of the table so no shard lock is held while
    // the service runs.
    fn dispatcher(&self, name: &str) -> Option<Arc<dyn InboundDispatch>> {
        self.inbound.get(name).map(|entry| entry.value().clone())
    }

    pub(crate) fn unknown_service_error(&self, name: &str) -> BridgeError {
        let mut message = format!(
            "no such service (service closed?)\n\tcalled service:\n\t\t{name}\n\tavailable services:"
        );
        let names = self.bound_names();
        if names.is_empty() {
            message.push_str("\n\t\t(none)");
        } else {
            for name in &names {
                message.push_str("\n\t\t");
                message.push_str(name);
            }
        }
        BridgeError::ApiMismatch(message)
    }

    /// Reports proxies that were dropped without close, then releases their
    /// remote bindings. Runs on every application-level take; diagnostic
    /// only, never required for correctness.
    pub fn detect_leaks(&self) {
        let leaked: Vec<String> = {
            let mut queue = lock_unpoisoned(&self.leaked);
            std::mem::take(&mut *queue)
        };
        for name in leaked {
            tracing::warn!(name, "service proxy was dropped without close()");
            self.listener.on_service_leaked(&name);
            self.channel.disconnect(&name);
        }
    }

    pub(crate) fn record_leak(&self, name: String) {
        lock_unpoisoned(&self.leaked).push(name);
    }

    /// Stops in-flight suspending dispatches and refuses new ones.
    pub fn close(&self) {
        self.tasks.close();
    }

    pub(crate) fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        self.tasks.spawn(task);
    }

    pub(crate) fn channel(&self) -> &Arc<dyn CallChannel> {
        &self.channel
    }

    pub(crate) fn listener(&self) -> &Arc<dyn EventListener> {
        &self.listener
    }

    // The signature table for one adapter's type, built once per endpoint.
    pub(crate) fn service_type<A: ServiceAdapter>(
        &self,
        adapter: &A,
    ) -> Arc<ServiceType<A::Service>> {
        if let Some(existing) = self.types.get(adapter.serial_name()) {
            let erased: Arc<dyn Any + Send + Sync> = existing.value().clone();
            if let Ok(ty) = erased.downcast::<ServiceType<A::Service>>() {
                return ty;
            }
        }
        let ty = Arc::new(ServiceType::new(adapter.serial_name(), adapter.functions()));
        self.types
            .insert(adapter.serial_name(), ty.clone() as Arc<dyn Any + Send + Sync>);
        ty
    }
}

/// Owns the abort handles of suspending dispatches so endpoint close can
/// tear them down.
struct TaskScope {
    closed: AtomicBool,
    handles: Mutex<Vec<AbortHandle>>,
}

impl TaskScope {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        }
    }

    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let handle = tokio::spawn(task);
        let mut handles = lock_unpoisoned(&self.handles);
        handles.retain(|h| !h.is_finished());
        handles.push(handle.abort_handle());
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handles = std::mem::take(&mut *lock_unpoisoned(&self.handles));
        for handle in handles {
            handle.abort();
        }
    }
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
