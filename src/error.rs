use thiserror::Error;

use crate::channel::ChannelError;
use crate::config::ConfigError;
use crate::gateway::GatewayError;
use crate::ports::ConnectError;
use crate::restorer::RestoreError;

/// Crate-level convenience error.
///
/// A thin wrapper over the per-subsystem errors; match on the inner error
/// when the distinction matters.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
