//! # In-Process Channel
//!
//! Connects two endpoints in the same process by dispatching each call
//! directly into the peer. Used by the crate's own tests and handy for
//! exercising bridged services without a real boundary.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;

use crate::channel::CallChannel;
use crate::channel::ChannelError;
use crate::channel::Result;
use crate::endpoint::Endpoint;
use crate::event::EventListener;
use crate::event::NullEventListener;

/// One direction of an in-process boundary. Holds its peer weakly so two
/// facing endpoints do not keep each other alive.
pub struct MockChannel {
    peer: OnceLock<Weak<Endpoint>>,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peer: OnceLock::new(),
        })
    }

    /// Wires this channel to the endpoint that will receive its calls.
    /// Later calls are ignored.
    pub fn connect(&self, peer: &Arc<Endpoint>) {
        let _ = self.peer.set(Arc::downgrade(peer));
    }

    fn peer(&self) -> Result<Arc<Endpoint>> {
        self.peer
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ChannelError::Disconnected("peer endpoint is gone".to_string()))
    }
}

impl CallChannel for MockChannel {
    fn call(&self, envelope: &str) -> Result<String> {
        Ok(self.peer()?.dispatch_incoming(envelope))
    }

    fn call_suspending(&self, envelope: &str, _callback_name: &str) -> Result<String> {
        self.peer()?
            .dispatch_incoming_suspending(envelope)
            .map_err(|e| ChannelError::Io(e.to_string()))
    }

    fn list_bound_names(&self) -> Vec<String> {
        self.peer().map(|peer| peer.bound_names()).unwrap_or_default()
    }

    fn disconnect(&self, name: &str) -> bool {
        self.peer()
            .map(|peer| peer.disconnect(name))
            .unwrap_or(false)
    }
}

/// Two endpoints facing each other over in-process channels.
pub fn endpoint_pair() -> (Arc<Endpoint>, Arc<Endpoint>) {
    endpoint_pair_with(Arc::new(NullEventListener), Arc::new(NullEventListener))
}

/// Like [endpoint_pair], with a telemetry listener per side.
pub fn endpoint_pair_with(
    listener_a: Arc<dyn EventListener>,
    listener_b: Arc<dyn EventListener>,
) -> (Arc<Endpoint>, Arc<Endpoint>) {
    let channel_a = MockChannel::new();
    let channel_b = MockChannel::new();
    let endpoint_a = Endpoint::with_listener(channel_a.clone(), listener_a);
    let endpoint_b = Endpoint::with_listener(channel_b.clone(), listener_b);
    channel_a.connect(&endpoint_b);
    channel_b.connect(&endpoint_a);
    (endpoint_a, endpoint_b)
}
