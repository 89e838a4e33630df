//! # Outbound Calls
//!
//! The sending half of a call: a proxy method encodes its arguments into an
//! envelope, pushes it through the channel, and decodes the reply. One
//! [OutboundCallHandler] backs every proxy; adapters generate thin trait
//! impls that delegate each method to it by function index.
//!
//! ## Invariants
//!
//! - A closed proxy fails every later call except close, which is
//!   idempotent.
//! - A suspending call's result callback is one-shot: the first delivery
//!   removes its binding and resumes the caller; duplicates are no-ops.
//! - Dropping a suspending call's future before its result arrives sends a
//!   cooperative cancel to the other side, at most once.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tetherwire::CallEnvelope;
use tetherwire::ResultEnvelope;
use tokio::sync::oneshot;

use crate::callbacks::CancelCallback;
use crate::callbacks::CancelCallbackAdapter;
use crate::callbacks::SuspendCallback;
use crate::callbacks::SuspendCallbackAdapter;
use crate::codec::decode_outcome;
use crate::codec::encode_args;
use crate::descriptor::BoxedValue;
use crate::endpoint::Endpoint;
use crate::endpoint::lock_unpoisoned;
use crate::error::BridgeError;
use crate::error::Result;
use crate::event::Call;
use crate::event::CallResult;
use crate::scope::ProxyHandle;
use crate::service::BridgeService;
use crate::service::ServiceType;

/// Shared mutable state of one proxy: its remote name and close flag.
pub struct ProxyState {
    name: String,
    endpoint: Arc<Endpoint>,
    closed: AtomicBool,
    tracked: bool,
}

impl ProxyState {
    pub(crate) fn new(name: String, endpoint: Arc<Endpoint>, tracked: bool) -> Self {
        Self {
            name,
            endpoint,
            closed: AtomicBool::new(false),
            tracked,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    // Returns whether the proxy was already closed.
    fn mark_closed(&self) -> bool {
        self.closed.swap(true, Ordering::SeqCst)
    }
}

impl Drop for ProxyState {
    fn drop(&mut self) {
        if self.tracked && !self.closed.load(Ordering::SeqCst) {
            self.endpoint.record_leak(self.name.clone());
        }
    }
}

/// Turns proxy method calls into envelopes. Adapters hold one per proxy and
/// route each trait method through [Self::call] or [Self::call_suspending]
/// with the method's index in the function table.
pub struct OutboundCallHandler<S: ?Sized> {
    ty: Arc<ServiceType<S>>,
    state: Arc<ProxyState>,
    protocol: bool,
}

impl<S: ?Sized> Clone for OutboundCallHandler<S> {
    fn clone(&self) -> Self {
        Self {
            ty: self.ty.clone(),
            state: self.state.clone(),
            protocol: self.protocol,
        }
    }
}

impl<S: ?Sized + 'static> OutboundCallHandler<S> {
    pub(crate) fn new(ty: Arc<ServiceType<S>>, state: Arc<ProxyState>, protocol: bool) -> Self {
        Self {
            ty,
            state,
            protocol,
        }
    }

    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    /// Runs function `index` synchronously across the boundary.
    pub fn call(&self, index: usize, args: Vec<BoxedValue>) -> Result<BoxedValue> {
        let function = self.ty.function(index).clone();
        if function.is_close() {
            if self.state.mark_closed() {
                // close is idempotent; later closes do not cross the boundary
                return Ok(Box::new(()));
            }
        } else if self.state.is_closed() {
            return Err(BridgeError::InvariantViolation(format!(
                "{} is closed, failed to call {}",
                self.state.name(),
                function.signature()
            )));
        }
        let endpoint = self.state.endpoint().clone();
        let (values, arg_names) = encode_args(&endpoint, function.arg_codecs(), args)?;
        let envelope = CallEnvelope {
            service: self.state.name().to_string(),
            function: function.signature().to_string(),
            callback: None,
            args: values,
        };
        let encoded = envelope.to_json()?;
        let record = Call {
            service: envelope.service,
            function: envelope.function,
            encoded: encoded.clone(),
            service_names: arg_names,
        };
        let start = if self.protocol {
            None
        } else {
            endpoint.listener().on_call_start(&record)
        };
        let reply = match endpoint.channel().call(&encoded) {
            Ok(reply) => reply,
            Err(e) => {
                let error = BridgeError::Disconnected(e.to_string());
                if !self.protocol {
                    let result = CallResult {
                        success: false,
                        encoded: String::new(),
                        service_names: Vec::new(),
                    };
                    endpoint.listener().on_call_end(&record, &result, start);
                }
                return Err(error);
            }
        };
        let result_envelope = ResultEnvelope::from_json(&reply)?;
        let success = result_envelope.is_success();
        let (outcome, result_names) =
            decode_outcome(&endpoint, function.result_codec(), result_envelope);
        if !self.protocol {
            let result = CallResult {
                success,
                encoded: reply,
                service_names: result_names,
            };
            endpoint.listener().on_call_end(&record, &result, start);
        }
        outcome.map_err(|e| enrich_api_mismatch(&endpoint, e))
    }

    /// Runs function `index` as a suspending call: bind a one-shot result
    /// callback, send the envelope, await delivery. Dropping the returned
    /// future before delivery cancels the remote call cooperatively.
    pub async fn call_suspending(&self, index: usize, args: Vec<BoxedValue>) -> Result<BoxedValue> {
        let function = self.ty.function(index).clone();
        if self.state.is_closed() {
            return Err(BridgeError::InvariantViolation(format!(
                "{} is closed, failed to call {}",
                self.state.name(),
                function.signature()
            )));
        }
        if !function.is_suspending() {
            return Err(BridgeError::InvariantViolation(format!(
                "not a suspending function: {}",
                function.signature()
            )));
        }
        let endpoint = self.state.endpoint().clone();
        let (values, arg_names) = encode_args(&endpoint, function.arg_codecs(), args)?;

        let callback_name = endpoint.generate_name();
        let completed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel::<ResultEnvelope>();
        let slot: Arc<dyn SuspendCallback> = Arc::new(ResultSlot {
            tx: Mutex::new(Some(tx)),
            completed: completed.clone(),
            endpoint: endpoint.clone(),
            name: callback_name.clone(),
        });
        endpoint.bind(&callback_name, slot, &SuspendCallbackAdapter)?;

        let envelope = CallEnvelope {
            service: self.state.name().to_string(),
            function: function.signature().to_string(),
            callback: Some(callback_name.clone()),
            args: values,
        };
        let encoded = match envelope.to_json() {
            Ok(encoded) => encoded,
            Err(e) => {
                endpoint.disconnect(&callback_name);
                return Err(e.into());
            }
        };
        let record = Call {
            service: envelope.service,
            function: envelope.function,
            encoded: encoded.clone(),
            service_names: arg_names,
        };
        let start = if self.protocol {
            None
        } else {
            endpoint.listener().on_call_start(&record)
        };

        let cancel_name = match endpoint.channel().call_suspending(&encoded, &callback_name) {
            Ok(cancel_name) => cancel_name,
            Err(e) => {
                endpoint.disconnect(&callback_name);
                let error = BridgeError::Disconnected(e.to_string());
                if !self.protocol {
                    let result = CallResult {
                        success: false,
                        encoded: String::new(),
                        service_names: Vec::new(),
                    };
                    endpoint.listener().on_call_end(&record, &result, start);
                }
                return Err(error);
            }
        };

        let mut guard = CancelGuard {
            endpoint: endpoint.clone(),
            cancel_name,
            callback_name,
            completed,
            armed: true,
        };
        let result_envelope = match rx.await {
            Ok(envelope) => envelope,
            // The guard stays armed: the other side may still be running.
            Err(_) => {
                return Err(BridgeError::Disconnected(
                    "endpoint was torn down before the result arrived".to_string(),
                ));
            }
        };
        guard.disarm();

        let success = result_envelope.is_success();
        let encoded_result = result_envelope.to_json().unwrap_or_default();
        let (outcome, result_names) =
            decode_outcome(&endpoint, function.result_codec(), result_envelope);
        if !self.protocol {
            let result = CallResult {
                success,
                encoded: encoded_result,
                service_names: result_names,
            };
            endpoint.listener().on_call_end(&record, &result, start);
        }
        outcome.map_err(|e| enrich_api_mismatch(&endpoint, e))
    }

    /// Closes the proxy through the normal call path.
    pub fn close(&self) {
        match self.ty.close_index() {
            Some(index) => {
                if let Err(e) = self.call(index, Vec::new()) {
                    tracing::debug!(name = self.state.name(), error = %e, "close call failed");
                }
            }
            None => {
                self.state.mark_closed();
            }
        }
    }

    pub(crate) fn handle(&self) -> Arc<dyn ProxyHandle> {
        Arc::new(ErasedHandle(self.clone()))
    }
}

// A type-erased view of one proxy, held by scopes.
struct ErasedHandle<S: ?Sized>(OutboundCallHandler<S>);

impl<S: ?Sized + 'static> ProxyHandle for ErasedHandle<S> {
    fn name(&self) -> &str {
        self.0.state.name()
    }

    fn is_closed(&self) -> bool {
        self.0.state.is_closed()
    }

    fn close(&self) {
        self.0.close();
    }
}

// The local half of a suspending call's result callback.
struct ResultSlot {
    tx: Mutex<Option<oneshot::Sender<ResultEnvelope>>>,
    completed: Arc<AtomicBool>,
    endpoint: Arc<Endpoint>,
    name: String,
}

impl BridgeService for ResultSlot {}

impl SuspendCallback for ResultSlot {
    fn deliver(&self, result: ResultEnvelope) -> Result<()> {
        let Some(tx) = lock_unpoisoned(&self.tx).take() else {
            // duplicate delivery is a no-op
            return Ok(());
        };
        self.completed.store(true, Ordering::SeqCst);
        self.endpoint.disconnect(&self.name);
        // The receiver may have cancelled and gone away.
        let _ = tx.send(result);
        Ok(())
    }
}

/// Sends a cancel when the awaiting future is dropped before delivery, and
/// releases the callback binding either way.
struct CancelGuard {
    endpoint: Arc<Endpoint>,
    cancel_name: String,
    callback_name: String,
    completed: Arc<AtomicBool>,
    armed: bool,
}

impl CancelGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let endpoint = self.endpoint.clone();
        let cancel_name = std::mem::take(&mut self.cancel_name);
        let callback_name = std::mem::take(&mut self.callback_name);
        let completed = self.completed.clone();
        self.endpoint.spawn(async move {
            if !completed.load(Ordering::SeqCst) {
                let cancel = endpoint.take(&cancel_name, &CancelCallbackAdapter);
                if let Err(e) = cancel.cancel() {
                    tracing::debug!(error = %e, "cancel request failed");
                }
            }
            endpoint.disconnect(&callback_name);
        });
    }
}

// The remote's unknown-service message lists its own names; add ours from
// the channel when the message carries no list at all.
fn enrich_api_mismatch(endpoint: &Endpoint, error: BridgeError) -> BridgeError {
    let BridgeError::ApiMismatch(mut message) = error else {
        return error;
    };
    if !message.contains("available") {
        message.push_str("\n\tknown remote services:");
        let names = endpoint.channel().list_bound_names();
        if names.is_empty() {
            message.push_str("\n\t\t(none)");
        } else {
            for name in &names {
                message.push_str("\n\t\t");
                message.push_str(name);
            }
        }
    }
    BridgeError::ApiMismatch(message)
}
