//! Sturdy references and the restorer contract.
//!
//! A sturdy ref is an opaque token, rendered as a `weir://<vat>/<token>` URL,
//! that the restorer can turn back into a live capability. Saving a
//! capability also yields an unsave handle, a one-shot capability that
//! permanently revokes the token. The real persistence layer lives outside
//! this crate; [`MemRestorer`] is the in-process stand-in that the services
//! and tests wire against.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use uuid::Uuid;

use crate::channel::{ChannelClient, Reader, Writer};
use crate::gateway::GatewayClient;

/// Restorable token in URL form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SturdyRef(String);

impl SturdyRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The bare token: the last path segment of the URL, or the whole string
    /// when it is not a URL.
    pub fn token(&self) -> &str {
        match self.0.rsplit_once('/') {
            Some((_, token)) => token,
            None => &self.0,
        }
    }
}

impl fmt::Display for SturdyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The capability sum restorable through this crate.
#[derive(Clone)]
pub enum Cap {
    Channel(ChannelClient),
    Reader(Reader),
    Writer(Writer),
    Gateway(GatewayClient),
}

impl Cap {
    pub fn kind(&self) -> &'static str {
        match self {
            Cap::Channel(_) => "channel",
            Cap::Reader(_) => "reader",
            Cap::Writer(_) => "writer",
            Cap::Gateway(_) => "gateway",
        }
    }

    pub fn into_channel(self) -> Option<ChannelClient> {
        match self {
            Cap::Channel(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_reader(self) -> Option<Reader> {
        match self {
            Cap::Reader(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_writer(self) -> Option<Writer> {
        match self {
            Cap::Writer(w) => Some(w),
            _ => None,
        }
    }

    pub fn into_gateway(self) -> Option<GatewayClient> {
        match self {
            Cap::Gateway(g) => Some(g),
            _ => None,
        }
    }
}

impl fmt::Debug for Cap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cap({})", self.kind())
    }
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("unknown sturdy ref token: {0}")]
    UnknownToken(String),

    #[error("sturdy ref already revoked: {0}")]
    Revoked(String),

    #[error("restorer unavailable")]
    Unavailable,
}

/// One-shot revocation capability obtained from a save.
pub struct UnsaveHandle {
    token: String,
    release: Box<dyn Fn() -> Result<bool, RestoreError> + Send + Sync>,
}

impl UnsaveHandle {
    pub fn new(
        token: impl Into<String>,
        release: impl Fn() -> Result<bool, RestoreError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            token: token.into(),
            release: Box::new(release),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Revoke the sturdy ref. `Ok(false)` when it was already gone.
    pub fn release(&self) -> Result<bool, RestoreError> {
        (self.release)()
    }
}

impl fmt::Debug for UnsaveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnsaveHandle({})", self.token)
    }
}

/// Result of saving a capability.
#[derive(Debug)]
pub struct Saved {
    pub sturdy_ref: SturdyRef,
    pub unsave: UnsaveHandle,
}

/// External persistence contract.
pub trait Restorer: Send + Sync {
    /// Persist a capability under `token` (minted when absent) and return
    /// the sturdy ref plus its revocation handle.
    fn save(&self, cap: Cap, token: Option<&str>) -> Result<Saved, RestoreError>;

    /// Resolve a token (or sturdy-ref URL) back into a live capability.
    fn restore(&self, token: &str) -> Result<Cap, RestoreError>;

    /// Render a token as a sturdy-ref URL.
    fn sturdy_ref_str(&self, token: &str) -> SturdyRef;
}

/// In-process restorer: a token table shared with the unsave handles it
/// hands out.
pub struct MemRestorer {
    vat_id: String,
    table: Arc<Mutex<HashMap<String, Cap>>>,
}

impl MemRestorer {
    pub fn new(vat_id: impl Into<String>) -> Self {
        Self {
            vat_id: vat_id.into(),
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn strip_url(token: &str) -> &str {
        match token.rsplit_once('/') {
            Some((_, bare)) => bare,
            None => token,
        }
    }
}

impl Restorer for MemRestorer {
    fn save(&self, cap: Cap, token: Option<&str>) -> Result<Saved, RestoreError> {
        let token = match token {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        {
            let mut table = self.table.lock().map_err(|_| RestoreError::Unavailable)?;
            table.insert(token.clone(), cap);
        }
        tracing::debug!(token = %token, "saved capability");

        let release_table = Arc::clone(&self.table);
        let release_token = token.clone();
        let unsave = UnsaveHandle::new(token.clone(), move || {
            let mut table = release_table
                .lock()
                .map_err(|_| RestoreError::Unavailable)?;
            let removed = table.remove(&release_token).is_some();
            tracing::debug!(token = %release_token, removed, "released sturdy ref");
            Ok(removed)
        });

        Ok(Saved {
            sturdy_ref: self.sturdy_ref_str(&token),
            unsave,
        })
    }

    fn restore(&self, token: &str) -> Result<Cap, RestoreError> {
        let bare = Self::strip_url(token);
        let table = self.table.lock().map_err(|_| RestoreError::Unavailable)?;
        table
            .get(bare)
            .cloned()
            .ok_or_else(|| RestoreError::UnknownToken(bare.to_string()))
    }

    fn sturdy_ref_str(&self, token: &str) -> SturdyRef {
        SturdyRef::new(format!("weir://{}/{}", self.vat_id, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use crate::channel::ChannelService;

    fn restorer_with_channel() -> (Arc<MemRestorer>, Saved, crate::channel::ServiceHandle) {
        let restorer = Arc::new(MemRestorer::new("test-vat"));
        let service = ChannelService::spawn(restorer.clone(), Duration::from_secs(1));
        let channel = service.create_channel("c", "", 1).unwrap();
        let saved = channel.save_as(Some("tok-1")).unwrap();
        (restorer, saved, service)
    }

    #[test]
    fn sturdy_ref_token_is_last_segment() {
        let sr = SturdyRef::new("weir://vat/abc-123");
        assert_eq!(sr.token(), "abc-123");
        let bare = SturdyRef::new("abc-123");
        assert_eq!(bare.token(), "abc-123");
    }

    #[test]
    fn save_restore_roundtrip() {
        let (restorer, saved, _service) = restorer_with_channel();
        assert_eq!(saved.sturdy_ref.as_str(), "weir://test-vat/tok-1");

        let cap = restorer.restore("tok-1").unwrap();
        assert!(cap.into_channel().is_some());

        // Restoring by full URL works too.
        let cap = restorer.restore(saved.sturdy_ref.as_str()).unwrap();
        assert!(cap.into_channel().is_some());
    }

    #[test]
    fn release_revokes_the_token() {
        let (restorer, saved, _service) = restorer_with_channel();
        assert!(saved.unsave.release().unwrap());
        assert!(matches!(
            restorer.restore("tok-1"),
            Err(RestoreError::UnknownToken(_))
        ));
        // A second release reports the token already gone.
        assert!(!saved.unsave.release().unwrap());
    }
}
