#![forbid(unsafe_code)]

//! `weir`: a flow-based-programming messaging substrate.
//!
//! Three cooperating pieces:
//! - buffered many-producer / many-consumer [`channel`]s with restorable
//!   reader/writer endpoints and FBP close semantics,
//! - a [`ports::PortConnector`] that wires a component's named ports to
//!   remote endpoints from a declarative description,
//! - a [`gateway`] that exposes internal capabilities at the perimeter under
//!   heartbeat-kept registrations.

pub mod channel;
pub mod config;
pub mod error;
pub mod gateway;
pub mod msg;
pub mod ports;
pub mod restorer;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the capability surface at the crate root for convenience.
pub use crate::channel::{
    ChannelClient, ChannelError, ChannelService, CloseSemantics, Reader, ServiceHandle, Writer,
};
pub use crate::gateway::{GatewayClient, GatewayError, GatewayService, Heartbeat, Registered};
pub use crate::msg::{ChannelId, EndpointId, Info, Msg};
pub use crate::ports::{ConnectionManager, PortConnector, PortId, PortInfos};
pub use crate::restorer::{Cap, MemRestorer, Restorer, Saved, SturdyRef, UnsaveHandle};
