//! # Suspend Protocol Callbacks
//!
//! Two tiny internal service types carry the suspend/cancel protocol over
//! the same reference table as application services:
//!
//! - [SuspendCallback]: bound by the caller before a suspending call; the
//!   receiver delivers the result envelope through it, exactly once.
//! - [CancelCallback]: bound by the receiver under `<callback>/cancel`
//!   before the call body starts; the caller invokes it to request
//!   cooperative cancellation.
//!
//! Both adapters are protocol-internal, so they never surface in telemetry
//! or leak tracking.

use std::sync::Arc;
use std::sync::Mutex;

use tetherwire::ResultEnvelope;
use tokio::sync::oneshot;

use crate::codec::json_codec;
use crate::descriptor::FunctionDescriptor;
use crate::descriptor::take_arg;
use crate::endpoint::lock_unpoisoned;
use crate::error::Result;
use crate::outbound::OutboundCallHandler;
use crate::service::BridgeService;
use crate::service::ServiceAdapter;

const DELIVER_SIGNATURE: &str = "fun deliver(ResultEnvelope): Unit";
const CANCEL_SIGNATURE: &str = "fun cancel(): Unit";

const DELIVER_INDEX: usize = 0;
const CANCEL_INDEX: usize = 0;

pub(crate) trait SuspendCallback: BridgeService {
    /// Delivers the result of a suspending call. At most the first delivery
    /// resumes the caller; duplicates are no-ops.
    fn deliver(&self, result: ResultEnvelope) -> Result<()>;
}

pub(crate) trait CancelCallback: BridgeService {
    /// Requests cooperative cancellation. A no-op once the call completed.
    fn cancel(&self) -> Result<()>;
}

#[derive(Clone)]
pub(crate) struct SuspendCallbackAdapter;

impl ServiceAdapter for SuspendCallbackAdapter {
    type Service = dyn SuspendCallback;

    fn serial_name(&self) -> &'static str {
        "tether.SuspendCallback"
    }

    fn functions(&self) -> Vec<Arc<FunctionDescriptor<dyn SuspendCallback>>> {
        vec![
            FunctionDescriptor::returning(
                DELIVER_SIGNATURE,
                vec![json_codec::<ResultEnvelope>()],
                json_codec::<()>(),
                |service: &dyn SuspendCallback, mut args| {
                    let result = take_arg::<ResultEnvelope>(&mut args, DELIVER_SIGNATURE)?;
                    service.deliver(result)?;
                    Ok(Box::new(()))
                },
            ),
            FunctionDescriptor::close(),
        ]
    }

    fn new_proxy(
        &self,
        handler: OutboundCallHandler<dyn SuspendCallback>,
    ) -> Arc<dyn SuspendCallback> {
        Arc::new(SuspendCallbackProxy { handler })
    }

    fn is_protocol(&self) -> bool {
        true
    }
}

struct SuspendCallbackProxy {
    handler: OutboundCallHandler<dyn SuspendCallback>,
}

impl BridgeService for SuspendCallbackProxy {
    fn close(&self) {
        self.handler.close();
    }
}

impl SuspendCallback for SuspendCallbackProxy {
    fn deliver(&self, result: ResultEnvelope) -> Result<()> {
        self.handler
            .call(DELIVER_INDEX, vec![Box::new(result)])
            .map(|_| ())
    }
}

#[derive(Clone)]
pub(crate) struct CancelCallbackAdapter;

impl ServiceAdapter for CancelCallbackAdapter {
    type Service = dyn CancelCallback;

    fn serial_name(&self) -> &'static str {
        "tether.CancelCallback"
    }

    fn functions(&self) -> Vec<Arc<FunctionDescriptor<dyn CancelCallback>>> {
        vec![
            FunctionDescriptor::returning(
                CANCEL_SIGNATURE,
                vec![],
                json_codec::<()>(),
                |service: &dyn CancelCallback, _args| {
                    service.cancel()?;
                    Ok(Box::new(()))
                },
            ),
            FunctionDescriptor::close(),
        ]
    }

    fn new_proxy(
        &self,
        handler: OutboundCallHandler<dyn CancelCallback>,
    ) -> Arc<dyn CancelCallback> {
        Arc::new(CancelCallbackProxy { handler })
    }

    fn is_protocol(&self) -> bool {
        true
    }
}

struct CancelCallbackProxy {
    handler: OutboundCallHandler<dyn CancelCallback>,
}

impl BridgeService for CancelCallbackProxy {
    fn close(&self) {
        self.handler.close();
    }
}

impl CancelCallback for CancelCallbackProxy {
    fn cancel(&self) -> Result<()> {
        self.handler.call(CANCEL_INDEX, Vec::new()).map(|_| ())
    }
}

/// The receiving side's cancel hook: fires a oneshot that races the call
/// body in the dispatch task.
pub(crate) struct CancelSignal {
    tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl CancelSignal {
    pub(crate) fn new(tx: oneshot::Sender<()>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }
}

impl BridgeService for CancelSignal {}

impl CancelCallback for CancelSignal {
    fn cancel(&self) -> Result<()> {
        // cancel after completion is a no-op
        if let Some(tx) = lock_unpoisoned(&self.tx).take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}
