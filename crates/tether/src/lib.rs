//! # Tether
//!
//! A call bridge between two independent runtimes connected by nothing more
//! than a synchronous "pass a string, maybe get one back" channel.
//!
//! ## Architecture
//!
//! - **Endpoint**: one side's owner of the bridge state for one connection.
//!   It holds the reference table of bound inbound services and the channel
//!   to the other side.
//! - **Inbound / Outbound**: inbound dispatch routes decoded envelopes to
//!   locally-bound services; outbound call handlers turn local proxy calls
//!   into envelopes.
//! - **Pass-by-reference**: service-typed values never serialize their data.
//!   Encoding binds the instance under a generated name; decoding produces
//!   a proxy bound to that name.
//! - **Suspend/cancel**: suspending calls correlate their eventual result
//!   through a one-shot callback service; cancellation is a cooperative
//!   message, never preemption.

mod callbacks;

pub mod channel;
pub mod codec;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod inbound;
pub mod mock_channel;
pub mod outbound;
pub mod scope;
pub mod service;
pub mod stream;

#[cfg(test)]
mod tests;

pub use channel::CallChannel;
pub use codec::ValueCodec;
pub use codec::json_codec;
pub use codec::service_codec;
pub use descriptor::BoxedValue;
pub use descriptor::FunctionDescriptor;
pub use endpoint::Endpoint;
pub use error::BridgeError;
pub use error::Result;
pub use event::EventListener;
pub use mock_channel::MockChannel;
pub use mock_channel::endpoint_pair;
pub use outbound::OutboundCallHandler;
pub use scope::ProxyScope;
pub use service::BridgeService;
pub use service::ServiceAdapter;
pub use stream::BridgeStream;
pub use stream::StateStream;
