//! # Inbound Dispatch
//!
//! The receiving half of a call: look the function up in the signature
//! table, decode arguments, invoke the bound service, and encode the
//! outcome. Suspending calls additionally bind a cancel callback before any
//! work starts and deliver their result through the caller's one-shot
//! callback service.
//!
//! ## Invariants
//!
//! - Close dispatch removes the binding before the body runs, so re-entrant
//!   calls during close already see the service gone.
//! - The cancel callback for a suspending call is bound before dispatch
//!   returns and unbound exactly once, on every completion path.
//! - A panicking service body fails one call, never the endpoint.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;

use futures::FutureExt;
use tetherwire::CallEnvelope;
use tetherwire::ResultEnvelope;
use tokio::sync::oneshot;

use crate::callbacks::CancelCallback;
use crate::callbacks::CancelCallbackAdapter;
use crate::callbacks::CancelSignal;
use crate::callbacks::SuspendCallback;
use crate::callbacks::SuspendCallbackAdapter;
use crate::codec::decode_args;
use crate::codec::encode_outcome;
use crate::descriptor::BoxedValue;
use crate::descriptor::FunctionBody;
use crate::descriptor::FunctionDescriptor;
use crate::endpoint::Endpoint;
use crate::error::BridgeError;
use crate::error::Result;
use crate::event::Call;
use crate::event::CallResult;
use crate::service::BridgeService;
use crate::service::ServiceType;

/// Object-safe face of one bound service, stored in the reference table.
pub trait InboundDispatch: Send + Sync {
    /// Runs a synchronous call to completion and returns its result
    /// envelope. Never returns an error; failures become failure envelopes.
    fn dispatch(
        &self,
        endpoint: &Arc<Endpoint>,
        call: CallEnvelope,
        encoded_call: &str,
    ) -> ResultEnvelope;

    /// Starts a suspending call and returns the name of the cancel callback
    /// bound for it. The result is delivered later through `call.callback`.
    fn dispatch_suspending(
        &self,
        endpoint: &Arc<Endpoint>,
        call: CallEnvelope,
        encoded_call: &str,
    ) -> Result<String>;
}

impl std::fmt::Debug for dyn InboundDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn InboundDispatch")
    }
}

/// Pairs a bound service instance with its type's signature table.
pub struct InboundService<S: ?Sized + BridgeService> {
    service: Arc<S>,
    ty: Arc<ServiceType<S>>,
    protocol: bool,
}

impl<S: ?Sized + BridgeService> InboundService<S> {
    pub fn new(service: Arc<S>, ty: Arc<ServiceType<S>>, protocol: bool) -> Self {
        Self {
            service,
            ty,
            protocol,
        }
    }

    fn unknown_function_error(&self, function: &str) -> BridgeError {
        let mut message = format!(
            "no such function (incompatible API versions?)\n\tcalled function:\n\t\t{function}\n\tavailable functions:"
        );
        for signature in self.ty.signatures() {
            message.push_str("\n\t\t");
            message.push_str(&signature);
        }
        BridgeError::ApiMismatch(message)
    }
}

impl<S: ?Sized + BridgeService> InboundDispatch for InboundService<S> {
    fn dispatch(
        &self,
        endpoint: &Arc<Endpoint>,
        call: CallEnvelope,
        encoded_call: &str,
    ) -> ResultEnvelope {
        let CallEnvelope {
            service: service_name,
            function: function_name,
            args,
            ..
        } = call;
        let Some(function) = self.ty.get(&function_name).cloned() else {
            return failure(self.unknown_function_error(&function_name));
        };
        if function.is_suspending() {
            return failure(BridgeError::ApiMismatch(format!(
                "suspending function called synchronously: {function_name}"
            )));
        }
        if function.is_close() {
            // Removed before the body runs; re-entrant calls see it gone.
            endpoint.disconnect(&service_name);
        }
        let (args, arg_names) = match decode_args(endpoint, function.arg_codecs(), args) {
            Ok(decoded) => decoded,
            Err(e) => return failure(e),
        };
        let record = Call {
            service: service_name,
            function: function_name,
            encoded: encoded_call.to_string(),
            service_names: arg_names,
        };
        let start = if self.protocol {
            None
        } else {
            endpoint.listener().on_call_start(&record)
        };
        let outcome = match function.body() {
            FunctionBody::Sync(body) => {
                match catch_unwind(AssertUnwindSafe(|| body(&*self.service, args))) {
                    Ok(outcome) => outcome,
                    Err(payload) => Err(panic_error(payload)),
                }
            }
            FunctionBody::Suspending(_) => Err(BridgeError::InvariantViolation(format!(
                "suspending body behind a synchronous signature: {}",
                function.signature()
            ))),
        };
        let (envelope, result_names) = encode_outcome(endpoint, function.result_codec(), outcome);
        if !self.protocol {
            let result = CallResult {
                success: envelope.is_success(),
                encoded: envelope.to_json().unwrap_or_default(),
                service_names: result_names,
            };
            endpoint.listener().on_call_end(&record, &result, start);
        }
        envelope
    }

    fn dispatch_suspending(
        &self,
        endpoint: &Arc<Endpoint>,
        call: CallEnvelope,
        encoded_call: &str,
    ) -> Result<String> {
        let CallEnvelope {
            service: service_name,
            function: function_name,
            callback,
            args,
        } = call;
        let Some(callback_name) = callback else {
            return Err(BridgeError::InvariantViolation(
                "suspending envelope is missing its callback name".to_string(),
            ));
        };

        let cancel_name = format!("{callback_name}/cancel");
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let signal: Arc<dyn CancelCallback> = Arc::new(CancelSignal::new(cancel_tx));
        endpoint.bind(&cancel_name, signal, &CancelCallbackAdapter)?;

        // Function lookup and argument decoding happen before the task is
        // spawned; their failures are delivered through the callback rather
        // than returned to the channel.
        type Prepared<S> = (Arc<FunctionDescriptor<S>>, Vec<BoxedValue>, Vec<String>);
        let prepared: Result<Prepared<S>> = (|| {
            let function = self
                .ty
                .get(&function_name)
                .cloned()
                .ok_or_else(|| self.unknown_function_error(&function_name))?;
            if !function.is_suspending() {
                return Err(BridgeError::ApiMismatch(format!(
                    "not a suspending function: {function_name}"
                )));
            }
            let (args, names) = decode_args(endpoint, function.arg_codecs(), args)?;
            Ok((function, args, names))
        })();

        let service = self.service.clone();
        let protocol = self.protocol;
        let encoded_call = encoded_call.to_string();
        let cancel_name_in_task = cancel_name.clone();
        let ep = endpoint.clone();
        endpoint.spawn(async move {
            let envelope = match prepared {
                Err(e) => ResultEnvelope::failure(e.to_surrogate()),
                Ok((function, args, arg_names)) => {
                    let record = Call {
                        service: service_name,
                        function: function_name,
                        encoded: encoded_call,
                        service_names: arg_names,
                    };
                    let start = if protocol {
                        None
                    } else {
                        ep.listener().on_call_start(&record)
                    };
                    let outcome = match function.body() {
                        FunctionBody::Suspending(body) => {
                            let invocation = body(service, args);
                            tokio::select! {
                                _ = cancel_rx => Err(BridgeError::Cancelled),
                                result = AssertUnwindSafe(invocation).catch_unwind() => {
                                    match result {
                                        Ok(outcome) => outcome,
                                        Err(payload) => Err(panic_error(payload)),
                                    }
                                }
                            }
                        }
                        FunctionBody::Sync(_) => Err(BridgeError::InvariantViolation(format!(
                            "synchronous body behind a suspending signature: {}",
                            function.signature()
                        ))),
                    };
                    let (envelope, result_names) =
                        encode_outcome(&ep, function.result_codec(), outcome);
                    if !protocol {
                        let result = CallResult {
                            success: envelope.is_success(),
                            encoded: envelope.to_json().unwrap_or_default(),
                            service_names: result_names,
                        };
                        ep.listener().on_call_end(&record, &result, start);
                    }
                    envelope
                }
            };
            ep.disconnect(&cancel_name_in_task);
            let callback = ep.take(&callback_name, &SuspendCallbackAdapter);
            if let Err(e) = callback.deliver(envelope) {
                tracing::debug!(error = %e, "suspend result was undeliverable");
            }
        });
        Ok(cancel_name)
    }
}

/// Delivers a failure for a suspending call whose target service does not
/// exist, honoring the protocol: a cancel callback is still bound and a
/// result still arrives through the caller's callback.
pub(crate) fn deliver_failure(
    endpoint: &Arc<Endpoint>,
    callback_name: &str,
    error: BridgeError,
) -> Result<String> {
    let cancel_name = format!("{callback_name}/cancel");
    let (cancel_tx, _cancel_rx) = oneshot::channel::<()>();
    let signal: Arc<dyn CancelCallback> = Arc::new(CancelSignal::new(cancel_tx));
    endpoint.bind(&cancel_name, signal, &CancelCallbackAdapter)?;

    let callback_name = callback_name.to_string();
    let cancel_name_in_task = cancel_name.clone();
    let ep = endpoint.clone();
    endpoint.spawn(async move {
        ep.disconnect(&cancel_name_in_task);
        let callback = ep.take(&callback_name, &SuspendCallbackAdapter);
        let envelope = ResultEnvelope::failure(error.to_surrogate());
        if let Err(e) = callback.deliver(envelope) {
            tracing::debug!(error = %e, "suspend result was undeliverable");
        }
    });
    Ok(cancel_name)
}

fn panic_error(payload: Box<dyn Any + Send>) -> BridgeError {
    let detail = if let Some(message) = payload.downcast_ref::<&str>() {
        format!("implementation panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("implementation panicked: {message}")
    } else {
        "implementation panicked".to_string()
    };
    BridgeError::Remote {
        types: Vec::new(),
        detail,
    }
}

fn failure(error: BridgeError) -> ResultEnvelope {
    ResultEnvelope::failure(error.to_surrogate())
}
