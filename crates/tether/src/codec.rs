//! # Value Codecs
//!
//! Codecs translate between boxed in-memory values and the JSON values that
//! ride inside envelopes. Two families exist:
//!
//! - [JsonCodec]: ordinary data, serialized with serde.
//! - [ServiceCodec]: service-typed values, which never serialize their data.
//!   Encoding binds the instance in the sender's reference table under a
//!   generated name and emits only that name; decoding produces a proxy.
//!
//! Every encode/decode happens inside a context that records which service
//! names were carried, so telemetry can report references without parsing
//! payloads twice.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tetherwire::ResultEnvelope;

use crate::descriptor::BoxedValue;
use crate::endpoint::Endpoint;
use crate::error::BridgeError;
use crate::error::Result;
use crate::service::ServiceAdapter;

pub struct EncodeContext {
    endpoint: Arc<Endpoint>,
    service_names: Vec<String>,
}

impl EncodeContext {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self {
            endpoint,
            service_names: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Records that a service reference was written into the payload.
    pub fn record_service(&mut self, name: String) {
        self.service_names.push(name);
    }

    pub fn into_names(self) -> Vec<String> {
        self.service_names
    }
}

pub struct DecodeContext {
    endpoint: Arc<Endpoint>,
    service_names: Vec<String>,
}

impl DecodeContext {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self {
            endpoint,
            service_names: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn record_service(&mut self, name: String) {
        self.service_names.push(name);
    }

    pub fn into_names(self) -> Vec<String> {
        self.service_names
    }
}

/// Object-safe codec for one argument or result position.
pub trait ValueCodec: Send + Sync + 'static {
    fn encode(&self, cx: &mut EncodeContext, value: BoxedValue) -> Result<Value>;
    fn decode(&self, cx: &mut DecodeContext, value: Value) -> Result<BoxedValue>;
}

/// Serde passthrough for plain data types.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

pub fn json_codec<T>() -> Arc<dyn ValueCodec>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    Arc::new(JsonCodec::<T> {
        _marker: PhantomData,
    })
}

impl<T> ValueCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn encode(&self, _cx: &mut EncodeContext, value: BoxedValue) -> Result<Value> {
        let value = value
            .downcast::<T>()
            .map_err(|_| BridgeError::Codec("value type mismatch during encode".to_string()))?;
        serde_json::to_value(&*value).map_err(|e| BridgeError::Codec(e.to_string()))
    }

    fn decode(&self, _cx: &mut DecodeContext, value: Value) -> Result<BoxedValue> {
        let value: T =
            serde_json::from_value(value).map_err(|e| BridgeError::Codec(e.to_string()))?;
        Ok(Box::new(value))
    }
}

/// Pass-by-reference codec for service-typed positions.
///
/// Carries `Arc<A::Service>` in both directions. On encode the instance is
/// bound under a fresh generated name; on decode a proxy is taken for the
/// received name. No round trip happens in either direction.
pub struct ServiceCodec<A> {
    adapter: A,
}

impl<A> ServiceCodec<A> {
    pub fn new(adapter: A) -> Self {
        Self { adapter }
    }
}

pub fn service_codec<A>(adapter: A) -> Arc<dyn ValueCodec>
where
    A: ServiceAdapter + Clone,
{
    Arc::new(ServiceCodec::new(adapter))
}

impl<A> ValueCodec for ServiceCodec<A>
where
    A: ServiceAdapter + Clone,
{
    fn encode(&self, cx: &mut EncodeContext, value: BoxedValue) -> Result<Value> {
        let service = value
            .downcast::<Arc<A::Service>>()
            .map_err(|_| BridgeError::Codec("service type mismatch during encode".to_string()))?;
        let name = cx.endpoint().generate_name();
        cx.endpoint().bind(&name, *service, &self.adapter)?;
        cx.record_service(name.clone());
        Ok(Value::String(name))
    }

    fn decode(&self, cx: &mut DecodeContext, value: Value) -> Result<BoxedValue> {
        let Value::String(name) = value else {
            return Err(BridgeError::Codec(
                "service reference must be a name string".to_string(),
            ));
        };
        cx.record_service(name.clone());
        let proxy = cx.endpoint().take(&name, &self.adapter);
        Ok(Box::new(proxy))
    }
}

/// Encodes outbound arguments, collecting referenced service names.
pub(crate) fn encode_args(
    endpoint: &Arc<Endpoint>,
    codecs: &[Arc<dyn ValueCodec>],
    args: Vec<BoxedValue>,
) -> Result<(Vec<Value>, Vec<String>)> {
    if args.len() != codecs.len() {
        return Err(BridgeError::InvariantViolation(format!(
            "expected {} arguments, got {}",
            codecs.len(),
            args.len()
        )));
    }
    let mut cx = EncodeContext::new(endpoint.clone());
    let mut values = Vec::with_capacity(args.len());
    for (codec, arg) in codecs.iter().zip(args) {
        values.push(codec.encode(&mut cx, arg)?);
    }
    Ok((values, cx.into_names()))
}

/// Decodes inbound arguments. A count mismatch is version skew, not a local
/// programming error.
pub(crate) fn decode_args(
    endpoint: &Arc<Endpoint>,
    codecs: &[Arc<dyn ValueCodec>],
    values: Vec<Value>,
) -> Result<(Vec<BoxedValue>, Vec<String>)> {
    if values.len() != codecs.len() {
        return Err(BridgeError::ApiMismatch(format!(
            "expected {} arguments, got {}",
            codecs.len(),
            values.len()
        )));
    }
    let mut cx = DecodeContext::new(endpoint.clone());
    let mut args = Vec::with_capacity(values.len());
    for (codec, value) in codecs.iter().zip(values) {
        args.push(codec.decode(&mut cx, value)?);
    }
    Ok((args, cx.into_names()))
}

/// Turns a finished invocation into a result envelope. An encode failure on
/// the success path degrades to a failure envelope rather than losing the
/// reply entirely.
pub(crate) fn encode_outcome(
    endpoint: &Arc<Endpoint>,
    codec: &Arc<dyn ValueCodec>,
    outcome: Result<BoxedValue>,
) -> (ResultEnvelope, Vec<String>) {
    match outcome {
        Ok(value) => {
            let mut cx = EncodeContext::new(endpoint.clone());
            match codec.encode(&mut cx, value) {
                Ok(encoded) => (ResultEnvelope::success(encoded), cx.into_names()),
                Err(e) => (ResultEnvelope::failure(e.to_surrogate()), Vec::new()),
            }
        }
        Err(e) => (ResultEnvelope::failure(e.to_surrogate()), Vec::new()),
    }
}

/// Turns a received result envelope back into an invocation outcome.
pub(crate) fn decode_outcome(
    endpoint: &Arc<Endpoint>,
    codec: &Arc<dyn ValueCodec>,
    envelope: ResultEnvelope,
) -> (Result<BoxedValue>, Vec<String>) {
    match envelope {
        ResultEnvelope::Success { value } => {
            let mut cx = DecodeContext::new(endpoint.clone());
            match codec.decode(&mut cx, value) {
                Ok(decoded) => (Ok(decoded), cx.into_names()),
                Err(e) => (Err(e), Vec::new()),
            }
        }
        ResultEnvelope::Failure { error } => (Err(BridgeError::from_surrogate(error)), Vec::new()),
    }
}
