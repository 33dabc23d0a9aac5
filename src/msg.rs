//! Identity atoms and the message type carried by channels.
//!
//! A message is either an opaque value or the `Done` marker that ends a
//! writer's stream. Payloads are untyped bytes; channels never look inside.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reader/writer endpoint identifier, unique within a service.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(Uuid);

impl EndpointId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointId({})", self.0)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message travelling through a channel.
///
/// `Done` is the FBP end-of-stream marker: it detaches the sending writer
/// and is never buffered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Msg {
    Value(Bytes),
    Done,
}

impl Msg {
    /// Convenience constructor for tests and in-process producers.
    pub fn value(payload: impl Into<Bytes>) -> Self {
        Msg::Value(payload.into())
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Msg::Done)
    }
}

/// Identifying metadata shared by channels, endpoints, and the gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_render_as_bare_uuids() {
        let id = ChannelId::new(Uuid::from_u128(7));
        assert_eq!(id.to_string(), Uuid::from_u128(7).to_string());
        assert!(format!("{id:?}").starts_with("ChannelId("));
    }

    #[test]
    fn done_is_done() {
        assert!(Msg::Done.is_done());
        assert!(!Msg::value("x").is_done());
    }
}
