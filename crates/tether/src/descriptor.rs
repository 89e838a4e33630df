//! # Function Descriptors
//!
//! One descriptor per bridged function: its signature string, the codecs for
//! its arguments and result, and the erased body that invokes the concrete
//! service. Descriptors are the unit the signature table dispatches on.
//!
//! ## Invariants
//!
//! - A descriptor's id is a stable hash of its signature; two endpoints that
//!   agree on the signature agree on the id.
//! - Sync bodies never block on the bridge; suspending bodies return a boxed
//!   future and run on the endpoint's task scope.

use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::codec::ValueCodec;
use crate::error::BridgeError;
use crate::error::Result;
use crate::service::BridgeService;

/// A decoded argument or result in transit between codec and body.
pub type BoxedValue = Box<dyn Any + Send>;

/// The canonical signature of the close function every service carries.
pub const CLOSE_SIGNATURE: &str = "fun close(): Unit";

type SyncBody<S> = Box<dyn Fn(&S, Vec<BoxedValue>) -> Result<BoxedValue> + Send + Sync>;
type SuspendingBody<S> =
    Box<dyn Fn(Arc<S>, Vec<BoxedValue>) -> BoxFuture<'static, Result<BoxedValue>> + Send + Sync>;

pub enum FunctionBody<S: ?Sized> {
    Sync(SyncBody<S>),
    Suspending(SuspendingBody<S>),
}

pub struct FunctionDescriptor<S: ?Sized> {
    id: u64,
    signature: String,
    is_close: bool,
    arg_codecs: Vec<Arc<dyn ValueCodec>>,
    result_codec: Arc<dyn ValueCodec>,
    body: FunctionBody<S>,
}

impl<S: ?Sized> FunctionDescriptor<S> {
    /// A function whose body completes before returning.
    pub fn returning(
        signature: impl Into<String>,
        arg_codecs: Vec<Arc<dyn ValueCodec>>,
        result_codec: Arc<dyn ValueCodec>,
        body: impl Fn(&S, Vec<BoxedValue>) -> Result<BoxedValue> + Send + Sync + 'static,
    ) -> Arc<Self> {
        let signature = signature.into();
        Arc::new(Self {
            id: fnv1a(&signature),
            is_close: signature == CLOSE_SIGNATURE,
            signature,
            arg_codecs,
            result_codec,
            body: FunctionBody::Sync(Box::new(body)),
        })
    }

    /// A function whose body may suspend; its result travels back through a
    /// one-shot callback service.
    pub fn suspending(
        signature: impl Into<String>,
        arg_codecs: Vec<Arc<dyn ValueCodec>>,
        result_codec: Arc<dyn ValueCodec>,
        body: impl Fn(Arc<S>, Vec<BoxedValue>) -> BoxFuture<'static, Result<BoxedValue>>
        + Send
        + Sync
        + 'static,
    ) -> Arc<Self> {
        let signature = signature.into();
        Arc::new(Self {
            id: fnv1a(&signature),
            is_close: false,
            signature,
            arg_codecs,
            result_codec,
            body: FunctionBody::Suspending(Box::new(body)),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn is_close(&self) -> bool {
        self.is_close
    }

    pub fn is_suspending(&self) -> bool {
        matches!(self.body, FunctionBody::Suspending(_))
    }

    pub fn arg_codecs(&self) -> &[Arc<dyn ValueCodec>] {
        &self.arg_codecs
    }

    pub fn result_codec(&self) -> &Arc<dyn ValueCodec> {
        &self.result_codec
    }

    pub(crate) fn body(&self) -> &FunctionBody<S> {
        &self.body
    }
}

impl<S: ?Sized + BridgeService> FunctionDescriptor<S> {
    /// The close descriptor every adapter includes.
    pub fn close() -> Arc<Self> {
        Self::returning(
            CLOSE_SIGNATURE,
            vec![],
            crate::codec::json_codec::<()>(),
            |service, _args| {
                service.close();
                Ok(Box::new(()))
            },
        )
    }
}

/// Pops the next argument and downcasts it to the type the body expects.
pub fn take_arg<T: 'static>(args: &mut Vec<BoxedValue>, signature: &str) -> Result<T> {
    if args.is_empty() {
        return Err(BridgeError::Codec(format!(
            "missing argument for {signature}"
        )));
    }
    args.remove(0)
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| BridgeError::Codec(format!("argument type mismatch in {signature}")))
}

/// Downcasts a decoded result to the type the proxy returns.
pub fn downcast_value<T: 'static>(value: BoxedValue, signature: &str) -> Result<T> {
    value
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| BridgeError::Codec(format!("result type mismatch in {signature}")))
}

fn fnv1a(signature: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in signature.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
