//! Buffered many-producer / many-consumer channels with FBP close semantics.
//!
//! A [`service::ChannelService`] runs one loop thread owning every channel's
//! [`state::ChannelState`]. Clients hold [`endpoint::Reader`] /
//! [`endpoint::Writer`] handles that serialize their operations onto the loop
//! and block on a one-shot reply channel; operations that cannot complete park
//! the reply sender inside the channel state until a counterpart arrives.

pub mod endpoint;
pub mod service;
pub(crate) mod state;

use thiserror::Error;

use crate::msg::ChannelId;
use crate::restorer::RestoreError;

pub use endpoint::{ChannelClient, Reader, Writer};
pub use service::{ChannelService, ServiceCloser, ServiceHandle, StartupInfo};
pub use state::CloseSemantics;

/// Channel operation errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Operation on an endpoint that was closed or deregistered.
    #[error("endpoint already closed")]
    AlreadyClosed,

    /// The channel has terminated; the endpoint is dead.
    #[error("channel closed")]
    ChannelClosed,

    #[error("unknown channel: {0}")]
    UnknownChannel(ChannelId),

    /// The service loop is gone; no further operations can complete.
    #[error("channel service stopped")]
    ServiceStopped,

    #[error("save failed")]
    Save(#[from] RestoreError),
}
