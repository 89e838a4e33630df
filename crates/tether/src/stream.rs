//! # Stream Bridge
//!
//! Streams cross the boundary by reference, like any other service. Sending
//! a [BridgeStream] binds an internal source service; the receiver gets a
//! cold handle and no items flow until it subscribes. Subscription passes a
//! collector service back by reference, and the producer pushes items
//! through it one suspending `emit` at a time, so consumer backpressure
//! reaches the producer naturally.
//!
//! [StateStream] is the hot variant: it replays the current value to each
//! new subscriber and exposes it synchronously through `value()`.
//!
//! ## Invariants
//!
//! - A [BridgeStream] can be collected once; a second subscription fails.
//! - The producer closes the collector reference on every completion path,
//!   normal or failed, so the consumer's binding never lingers.
//! - Dropping the subscription receiver unwinds the producer loop on its
//!   next emit.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::FutureExt;
use futures::Stream;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::codec::DecodeContext;
use crate::codec::EncodeContext;
use crate::codec::ValueCodec;
use crate::codec::json_codec;
use crate::codec::service_codec;
use crate::descriptor::BoxedValue;
use crate::descriptor::FunctionDescriptor;
use crate::descriptor::downcast_value;
use crate::descriptor::take_arg;
use crate::endpoint::Endpoint;
use crate::endpoint::lock_unpoisoned;
use crate::error::BridgeError;
use crate::error::Result;
use crate::outbound::OutboundCallHandler;
use crate::service::BridgeService;
use crate::service::ServiceAdapter;

const EMIT_SIGNATURE: &str = "fun emit(Value): Unit";
const COLLECT_SIGNATURE: &str = "fun collect(StreamCollector): Unit";
const VALUE_SIGNATURE: &str = "fun value(): Value";

const EMIT_INDEX: usize = 0;
const STREAM_COLLECT_INDEX: usize = 0;
const STATE_VALUE_INDEX: usize = 0;
const STATE_COLLECT_INDEX: usize = 1;

/// A cold stream of `T` values that can cross the boundary by reference.
pub struct BridgeStream<T> {
    inner: StreamInner<T>,
}

enum StreamInner<T> {
    Local(Arc<StreamSourceImpl<T>>),
    Remote {
        source: Arc<dyn StreamSource>,
        endpoint: Arc<Endpoint>,
        _marker: PhantomData<fn() -> T>,
    },
}

impl<T> BridgeStream<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(stream: impl Stream<Item = T> + Send + 'static) -> Self {
        Self {
            inner: StreamInner::Local(Arc::new(StreamSourceImpl {
                stream: Mutex::new(Some(stream.boxed())),
            })),
        }
    }

    /// Starts the flow of items. Must run inside a tokio runtime.
    ///
    /// Dropping the receiver stops the producer on its next emit. For a
    /// remote stream the source reference is closed when collection ends.
    pub fn subscribe(self, buffer: usize) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(buffer);
        let collector: Arc<dyn StreamCollector> = Arc::new(ChannelCollector {
            tx,
            _marker: PhantomData::<fn() -> T>,
        });
        match self.inner {
            StreamInner::Local(source) => {
                tokio::spawn(async move {
                    if let Err(e) = source.collect(collector).await {
                        tracing::debug!(error = %e, "local stream collection failed");
                    }
                });
            }
            StreamInner::Remote {
                source, endpoint, ..
            } => {
                endpoint.spawn(async move {
                    if let Err(e) = source.collect(collector).await {
                        tracing::debug!(error = %e, "remote stream collection failed");
                    }
                    source.close();
                });
            }
        }
        rx
    }
}

/// Pass-by-reference codec for a [BridgeStream] argument or result position.
pub fn stream_codec<T>() -> Arc<dyn ValueCodec>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    Arc::new(StreamCodec::<T> {
        _marker: PhantomData,
    })
}

struct StreamCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> ValueCodec for StreamCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn encode(&self, cx: &mut EncodeContext, value: BoxedValue) -> Result<Value> {
        let stream = value
            .downcast::<BridgeStream<T>>()
            .map_err(|_| BridgeError::Codec("stream type mismatch during encode".to_string()))?;
        let source: Arc<dyn StreamSource> = match stream.inner {
            StreamInner::Local(source) => source,
            StreamInner::Remote { source, .. } => source,
        };
        let name = cx.endpoint().generate_name();
        cx.endpoint().bind(&name, source, &StreamSourceAdapter)?;
        cx.record_service(name.clone());
        Ok(Value::String(name))
    }

    fn decode(&self, cx: &mut DecodeContext, value: Value) -> Result<BoxedValue> {
        let Value::String(name) = value else {
            return Err(BridgeError::Codec(
                "stream reference must be a name string".to_string(),
            ));
        };
        cx.record_service(name.clone());
        let source = cx.endpoint().take(&name, &StreamSourceAdapter);
        Ok(Box::new(BridgeStream::<T> {
            inner: StreamInner::Remote {
                source,
                endpoint: cx.endpoint().clone(),
                _marker: PhantomData,
            },
        }))
    }
}

/// A hot stream of `T` values: each subscriber first receives the current
/// value, and `value()` reads it without subscribing.
pub struct StateStream<T> {
    inner: StateInner<T>,
}

enum StateInner<T> {
    Local(Arc<StateSourceImpl<T>>),
    Remote {
        source: Arc<dyn StateSource>,
        endpoint: Arc<Endpoint>,
        _marker: PhantomData<fn() -> T>,
    },
}

impl<T> StateStream<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(rx: watch::Receiver<T>) -> Self {
        Self {
            inner: StateInner::Local(Arc::new(StateSourceImpl { rx })),
        }
    }

    /// The current value. For a remote stream this is one synchronous call.
    pub fn value(&self) -> Result<T> {
        match &self.inner {
            StateInner::Local(source) => Ok(source.rx.borrow().clone()),
            StateInner::Remote { source, .. } => {
                let value = source.value()?;
                serde_json::from_value(value).map_err(|e| BridgeError::Codec(e.to_string()))
            }
        }
    }

    /// Starts the flow of values, beginning with the current one. Must run
    /// inside a tokio runtime. The stream ends when the producer side drops
    /// its sender.
    pub fn subscribe(self, buffer: usize) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(buffer);
        let collector: Arc<dyn StreamCollector> = Arc::new(ChannelCollector {
            tx,
            _marker: PhantomData::<fn() -> T>,
        });
        match self.inner {
            StateInner::Local(source) => {
                tokio::spawn(async move {
                    if let Err(e) = source.collect(collector).await {
                        tracing::debug!(error = %e, "local state collection failed");
                    }
                });
            }
            StateInner::Remote {
                source, endpoint, ..
            } => {
                endpoint.spawn(async move {
                    if let Err(e) = source.collect(collector).await {
                        tracing::debug!(error = %e, "remote state collection failed");
                    }
                    source.close();
                });
            }
        }
        rx
    }
}

/// Pass-by-reference codec for a [StateStream] argument or result position.
pub fn state_codec<T>() -> Arc<dyn ValueCodec>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    Arc::new(StateCodec::<T> {
        _marker: PhantomData,
    })
}

struct StateCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> ValueCodec for StateCodec<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn encode(&self, cx: &mut EncodeContext, value: BoxedValue) -> Result<Value> {
        let stream = value
            .downcast::<StateStream<T>>()
            .map_err(|_| BridgeError::Codec("state type mismatch during encode".to_string()))?;
        let source: Arc<dyn StateSource> = match stream.inner {
            StateInner::Local(source) => source,
            StateInner::Remote { source, .. } => source,
        };
        let name = cx.endpoint().generate_name();
        cx.endpoint().bind(&name, source, &StateSourceAdapter)?;
        cx.record_service(name.clone());
        Ok(Value::String(name))
    }

    fn decode(&self, cx: &mut DecodeContext, value: Value) -> Result<BoxedValue> {
        let Value::String(name) = value else {
            return Err(BridgeError::Codec(
                "state reference must be a name string".to_string(),
            ));
        };
        cx.record_service(name.clone());
        let source = cx.endpoint().take(&name, &StateSourceAdapter);
        Ok(Box::new(StateStream::<T> {
            inner: StateInner::Remote {
                source,
                endpoint: cx.endpoint().clone(),
                _marker: PhantomData,
            },
        }))
    }
}

#[async_trait]
trait StreamCollector: BridgeService {
    async fn emit(&self, value: Value) -> Result<()>;
}

#[async_trait]
trait StreamSource: BridgeService {
    async fn collect(&self, collector: Arc<dyn StreamCollector>) -> Result<()>;
}

#[async_trait]
trait StateSource: BridgeService {
    fn value(&self) -> Result<Value>;
    async fn collect(&self, collector: Arc<dyn StreamCollector>) -> Result<()>;
}

struct StreamSourceImpl<T> {
    stream: Mutex<Option<BoxStream<'static, T>>>,
}

impl<T: Send + 'static> BridgeService for StreamSourceImpl<T> {}

#[async_trait]
impl<T> StreamSource for StreamSourceImpl<T>
where
    T: Serialize + Send + 'static,
{
    async fn collect(&self, collector: Arc<dyn StreamCollector>) -> Result<()> {
        let stream = lock_unpoisoned(&self.stream).take();
        let result = match stream {
            None => Err(BridgeError::InvariantViolation(
                "stream was already collected".to_string(),
            )),
            Some(mut stream) => {
                let mut outcome = Ok(());
                while let Some(item) = stream.next().await {
                    let value = match serde_json::to_value(&item) {
                        Ok(value) => value,
                        Err(e) => {
                            outcome = Err(BridgeError::Codec(e.to_string()));
                            break;
                        }
                    };
                    if let Err(e) = collector.emit(value).await {
                        outcome = Err(e);
                        break;
                    }
                }
                outcome
            }
        };
        collector.close();
        result
    }
}

struct StateSourceImpl<T> {
    rx: watch::Receiver<T>,
}

impl<T: Send + Sync + 'static> BridgeService for StateSourceImpl<T> {}

#[async_trait]
impl<T> StateSource for StateSourceImpl<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn value(&self) -> Result<Value> {
        serde_json::to_value(&*self.rx.borrow()).map_err(|e| BridgeError::Codec(e.to_string()))
    }

    async fn collect(&self, collector: Arc<dyn StreamCollector>) -> Result<()> {
        let mut rx = self.rx.clone();
        let result = loop {
            let value = match serde_json::to_value(&*rx.borrow_and_update()) {
                Ok(value) => value,
                Err(e) => break Err(BridgeError::Codec(e.to_string())),
            };
            if let Err(e) = collector.emit(value).await {
                break Err(e);
            }
            if rx.changed().await.is_err() {
                // the producer dropped its sender: the state stream is done
                break Ok(());
            }
        };
        collector.close();
        result
    }
}

// The consumer's end of a subscription: deserialize and hand to the channel.
struct ChannelCollector<T> {
    tx: mpsc::Sender<T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> BridgeService for ChannelCollector<T> {}

#[async_trait]
impl<T> StreamCollector for ChannelCollector<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn emit(&self, value: Value) -> Result<()> {
        let item: T =
            serde_json::from_value(value).map_err(|e| BridgeError::Codec(e.to_string()))?;
        self.tx
            .send(item)
            .await
            .map_err(|_| BridgeError::Disconnected("stream consumer was dropped".to_string()))
    }
}

#[derive(Clone)]
struct StreamCollectorAdapter;

impl ServiceAdapter for StreamCollectorAdapter {
    type Service = dyn StreamCollector;

    fn serial_name(&self) -> &'static str {
        "tether.StreamCollector"
    }

    fn functions(&self) -> Vec<Arc<FunctionDescriptor<dyn StreamCollector>>> {
        vec![
            FunctionDescriptor::suspending(
                EMIT_SIGNATURE,
                vec![json_codec::<Value>()],
                json_codec::<()>(),
                |service: Arc<dyn StreamCollector>, mut args| {
                    async move {
                        let value = take_arg::<Value>(&mut args, EMIT_SIGNATURE)?;
                        service.emit(value).await?;
                        Ok(Box::new(()) as BoxedValue)
                    }
                    .boxed()
                },
            ),
            FunctionDescriptor::close(),
        ]
    }

    fn new_proxy(
        &self,
        handler: OutboundCallHandler<dyn StreamCollector>,
    ) -> Arc<dyn StreamCollector> {
        Arc::new(StreamCollectorProxy { handler })
    }
}

struct StreamCollectorProxy {
    handler: OutboundCallHandler<dyn StreamCollector>,
}

impl BridgeService for StreamCollectorProxy {
    fn close(&self) {
        self.handler.close();
    }
}

#[async_trait]
impl StreamCollector for StreamCollectorProxy {
    async fn emit(&self, value: Value) -> Result<()> {
        self.handler
            .call_suspending(EMIT_INDEX, vec![Box::new(value)])
            .await
            .map(|_| ())
    }
}

#[derive(Clone)]
struct StreamSourceAdapter;

impl ServiceAdapter for StreamSourceAdapter {
    type Service = dyn StreamSource;

    fn serial_name(&self) -> &'static str {
        "tether.StreamSource"
    }

    fn functions(&self) -> Vec<Arc<FunctionDescriptor<dyn StreamSource>>> {
        vec![
            FunctionDescriptor::suspending(
                COLLECT_SIGNATURE,
                vec![service_codec(StreamCollectorAdapter)],
                json_codec::<()>(),
                |service: Arc<dyn StreamSource>, mut args| {
                    async move {
                        let collector =
                            take_arg::<Arc<dyn StreamCollector>>(&mut args, COLLECT_SIGNATURE)?;
                        service.collect(collector).await?;
                        Ok(Box::new(()) as BoxedValue)
                    }
                    .boxed()
                },
            ),
            FunctionDescriptor::close(),
        ]
    }

    fn new_proxy(&self, handler: OutboundCallHandler<dyn StreamSource>) -> Arc<dyn StreamSource> {
        Arc::new(StreamSourceProxy { handler })
    }
}

struct StreamSourceProxy {
    handler: OutboundCallHandler<dyn StreamSource>,
}

impl BridgeService for StreamSourceProxy {
    fn close(&self) {
        self.handler.close();
    }
}

#[async_trait]
impl StreamSource for StreamSourceProxy {
    async fn collect(&self, collector: Arc<dyn StreamCollector>) -> Result<()> {
        self.handler
            .call_suspending(STREAM_COLLECT_INDEX, vec![Box::new(collector)])
            .await
            .map(|_| ())
    }
}

#[derive(Clone)]
struct StateSourceAdapter;

impl ServiceAdapter for StateSourceAdapter {
    type Service = dyn StateSource;

    fn serial_name(&self) -> &'static str {
        "tether.StateSource"
    }

    fn functions(&self) -> Vec<Arc<FunctionDescriptor<dyn StateSource>>> {
        vec![
            FunctionDescriptor::returning(
                VALUE_SIGNATURE,
                vec![],
                json_codec::<Value>(),
                |service: &dyn StateSource, _args| {
                    let value = service.value()?;
                    Ok(Box::new(value))
                },
            ),
            FunctionDescriptor::suspending(
                COLLECT_SIGNATURE,
                vec![service_codec(StreamCollectorAdapter)],
                json_codec::<()>(),
                |service: Arc<dyn StateSource>, mut args| {
                    async move {
                        let collector =
                            take_arg::<Arc<dyn StreamCollector>>(&mut args, COLLECT_SIGNATURE)?;
                        service.collect(collector).await?;
                        Ok(Box::new(()) as BoxedValue)
                    }
                    .boxed()
                },
            ),
            FunctionDescriptor::close(),
        ]
    }

    fn new_proxy(&self, handler: OutboundCallHandler<dyn StateSource>) -> Arc<dyn StateSource> {
        Arc::new(StateSourceProxy { handler })
    }
}

struct StateSourceProxy {
    handler: OutboundCallHandler<dyn StateSource>,
}

impl BridgeService for StateSourceProxy {
    fn close(&self) {
        self.handler.close();
    }
}

#[async_trait]
impl StateSource for StateSourceProxy {
    fn value(&self) -> Result<Value> {
        let value = self.handler.call(STATE_VALUE_INDEX, Vec::new())?;
        downcast_value::<Value>(value, VALUE_SIGNATURE)
    }

    async fn collect(&self, collector: Arc<dyn StreamCollector>) -> Result<()> {
        self.handler
            .call_suspending(STATE_COLLECT_INDEX, vec![Box::new(collector)])
            .await
            .map(|_| ())
    }
}
