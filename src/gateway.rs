//! Gateway: exposes internal capabilities at the perimeter under stable
//! sturdy refs, kept alive by client heartbeats.
//!
//! Registrations live in a TTL table swept every three heartbeat intervals:
//! a sweep decrements each entry's keep-alive count and evicts the ones that
//! were already at zero, releasing their unsave capabilities. A `beat()`
//! resets the count, so an entry survives for as long as its client keeps
//! beating.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use thiserror::Error;
use uuid::Uuid;

use crate::msg::Info;
use crate::restorer::{Cap, RestoreError, Restorer, SturdyRef, UnsaveHandle};

pub const DEFAULT_SECS_KEEP_ALIVE_TIMEOUT: u64 = 600;

/// Registered capability identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapId(Uuid);

impl CapId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id from a secret seed: a PRNG seeded from the full
    /// seed byte sequence supplies the id bits, so the same seed lands on
    /// the same id across restarts and extending the seed changes it.
    pub fn from_seed(seed: &[u8]) -> Self {
        // Absorb every seed byte into the generator key, seed_seq style;
        // folding in the length keeps appended zero bytes from colliding
        // with their prefix.
        let mut key = [0u8; 32];
        for (i, &byte) in seed.iter().enumerate() {
            let slot = i % 32;
            key[slot] = key[slot].wrapping_mul(31).wrapping_add(byte);
        }
        for (slot, &len_byte) in (seed.len() as u64).to_le_bytes().iter().enumerate() {
            key[24 + slot] ^= len_byte;
        }

        let mut rng = StdRng::from_seed(key);
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        // Stamps RFC 4122 version-4 and variant bits.
        Self(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Debug for CapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapId({})", self.0)
    }
}

impl fmt::Display for CapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The restorer refused the registration; nothing was inserted.
    #[error("save failed during registration")]
    SaveFailed(#[source] RestoreError),

    #[error("restore failed")]
    Restore(#[source] RestoreError),

    #[error("gateway service stopped")]
    ServiceStopped,
}

struct Registration {
    /// Remaining GC ticks before eviction; a beat resets it to 1.
    keep_alive: u8,
    unsave: UnsaveHandle,
}

/// Gateway registry state, owned by the service loop.
pub(crate) struct GatewayState {
    id: Uuid,
    name: String,
    description: String,
    secs_keep_alive_timeout: u64,
    registrations: HashMap<CapId, Registration>,
    restorer: Arc<dyn Restorer>,
}

impl GatewayState {
    pub(crate) fn new(
        restorer: Arc<dyn Restorer>,
        name: &str,
        description: &str,
        secs_keep_alive_timeout: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.to_string(),
            secs_keep_alive_timeout,
            registrations: HashMap::new(),
            restorer,
        }
    }

    fn info(&self) -> Info {
        Info {
            id: self.id.to_string(),
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }

    fn register(
        &mut self,
        cap: Cap,
        secret_seed: Option<&str>,
    ) -> Result<(CapId, SturdyRef), GatewayError> {
        let cap_id = match secret_seed {
            Some(seed) if !seed.is_empty() => CapId::from_seed(seed.as_bytes()),
            _ => CapId::generate(),
        };

        // A re-registration under the same id revokes the previous sturdy
        // ref before the new save.
        if let Some(existing) = self.registrations.remove(&cap_id) {
            tracing::info!(cap_id = %cap_id, "releasing previous registration");
            if let Err(err) = existing.unsave.release() {
                tracing::error!(cap_id = %cap_id, %err, "release of previous registration failed");
            }
        }

        let saved = self
            .restorer
            .save(cap, Some(&cap_id.to_string()))
            .map_err(GatewayError::SaveFailed)?;
        self.registrations.insert(
            cap_id,
            Registration {
                keep_alive: 1,
                unsave: saved.unsave,
            },
        );
        tracing::info!(cap_id = %cap_id, sturdy_ref = %saved.sturdy_ref, "registered capability");
        Ok((cap_id, saved.sturdy_ref))
    }

    fn keep_alive(&mut self, cap_id: CapId) {
        if let Some(registration) = self.registrations.get_mut(&cap_id) {
            registration.keep_alive = 1;
        }
    }

    /// One GC tick: evict entries whose count reached zero, decrement the
    /// rest. Release failures are logged; the entry is evicted regardless.
    fn collect_garbage(&mut self) -> Vec<CapId> {
        let mut evict = Vec::new();
        for (cap_id, registration) in &mut self.registrations {
            if registration.keep_alive == 0 {
                evict.push(*cap_id);
            } else {
                registration.keep_alive -= 1;
            }
        }

        for cap_id in &evict {
            if let Some(registration) = self.registrations.remove(cap_id) {
                tracing::info!(cap_id = %cap_id, "heartbeat lapsed, evicting registration");
                if let Err(err) = registration.unsave.release() {
                    tracing::error!(cap_id = %cap_id, %err, "unsave failed during garbage collection");
                }
            }
        }
        evict
    }
}

enum GatewayRequest {
    Register {
        cap: Cap,
        secret_seed: Option<String>,
        respond: Sender<Result<(CapId, SturdyRef), GatewayError>>,
    },
    Restore {
        token: String,
        respond: Sender<Result<Cap, RestoreError>>,
    },
    Info {
        respond: Sender<Info>,
    },
    Beat {
        cap_id: CapId,
    },
    Shutdown,
}

/// Successful registration: the perimeter sturdy ref and the heartbeat
/// capability that keeps it alive.
pub struct Registered {
    pub sturdy_ref: SturdyRef,
    pub heartbeat: Heartbeat,
    pub secs_heartbeat_interval: u64,
}

/// Keep-alive capability bound to one registration.
#[derive(Clone)]
pub struct Heartbeat {
    cap_id: CapId,
    tx: Sender<GatewayRequest>,
}

impl Heartbeat {
    pub fn cap_id(&self) -> CapId {
        self.cap_id
    }

    pub fn beat(&self) -> Result<(), GatewayError> {
        self.tx
            .send(GatewayRequest::Beat {
                cap_id: self.cap_id,
            })
            .map_err(|_| GatewayError::ServiceStopped)
    }
}

/// Client handle to a running gateway.
#[derive(Clone)]
pub struct GatewayClient {
    tx: Sender<GatewayRequest>,
    secs_heartbeat_interval: u64,
}

impl GatewayClient {
    pub fn info(&self) -> Result<Info, GatewayError> {
        let (respond, rx) = bounded(1);
        self.tx
            .send(GatewayRequest::Info { respond })
            .map_err(|_| GatewayError::ServiceStopped)?;
        rx.recv().map_err(|_| GatewayError::ServiceStopped)
    }

    /// Register a capability at the perimeter. A non-empty `secret_seed`
    /// yields the same capability id on every call.
    pub fn register(
        &self,
        cap: Cap,
        secret_seed: Option<&str>,
    ) -> Result<Registered, GatewayError> {
        let (respond, rx) = bounded(1);
        self.tx
            .send(GatewayRequest::Register {
                cap,
                secret_seed: secret_seed.map(str::to_string),
                respond,
            })
            .map_err(|_| GatewayError::ServiceStopped)?;
        let (cap_id, sturdy_ref) = rx.recv().map_err(|_| GatewayError::ServiceStopped)??;
        Ok(Registered {
            sturdy_ref,
            heartbeat: Heartbeat {
                cap_id,
                tx: self.tx.clone(),
            },
            secs_heartbeat_interval: self.secs_heartbeat_interval,
        })
    }

    /// Resolve a sturdy ref through the gateway's restorer.
    pub fn restore(&self, token: &str) -> Result<Cap, GatewayError> {
        let (respond, rx) = bounded(1);
        self.tx
            .send(GatewayRequest::Restore {
                token: token.to_string(),
                respond,
            })
            .map_err(|_| GatewayError::ServiceStopped)?;
        rx.recv()
            .map_err(|_| GatewayError::ServiceStopped)?
            .map_err(GatewayError::Restore)
    }
}

/// Factory for the gateway loop thread.
pub struct GatewayService;

impl GatewayService {
    pub fn spawn(
        restorer: Arc<dyn Restorer>,
        name: &str,
        description: &str,
        secs_keep_alive_timeout: u64,
    ) -> GatewayHandle {
        let (tx, rx) = unbounded();
        let state = GatewayState::new(restorer, name, description, secs_keep_alive_timeout);
        let thread = std::thread::spawn(move || run_loop(state, rx));
        GatewayHandle {
            tx,
            thread,
            secs_keep_alive_timeout,
        }
    }
}

pub struct GatewayHandle {
    tx: Sender<GatewayRequest>,
    thread: JoinHandle<()>,
    secs_keep_alive_timeout: u64,
}

impl GatewayHandle {
    pub fn client(&self) -> GatewayClient {
        GatewayClient {
            tx: self.tx.clone(),
            secs_heartbeat_interval: self.secs_keep_alive_timeout,
        }
    }

    pub fn shutdown(self) {
        let _ = self.tx.send(GatewayRequest::Shutdown);
        let _ = self.thread.join();
    }
}

fn run_loop(mut state: GatewayState, rx: Receiver<GatewayRequest>) {
    // One sweep every three heartbeat intervals; a zero timeout still ticks.
    let gc_period = Duration::from_secs((state.secs_keep_alive_timeout * 3).max(1));
    let gc = crossbeam::channel::tick(gc_period);

    loop {
        crossbeam::select! {
            recv(rx) -> msg => match msg {
                Ok(GatewayRequest::Register { cap, secret_seed, respond }) => {
                    let _ = respond.send(state.register(cap, secret_seed.as_deref()));
                }
                Ok(GatewayRequest::Restore { token, respond }) => {
                    let _ = respond.send(state.restorer.restore(&token));
                }
                Ok(GatewayRequest::Info { respond }) => {
                    let _ = respond.send(state.info());
                }
                Ok(GatewayRequest::Beat { cap_id }) => {
                    tracing::debug!(cap_id = %cap_id, "heartbeat");
                    state.keep_alive(cap_id);
                }
                Ok(GatewayRequest::Shutdown) | Err(_) => {
                    tracing::info!("gateway service exiting");
                    break;
                }
            },
            recv(gc) -> _ => {
                let evicted = state.collect_garbage();
                if !evicted.is_empty() {
                    tracing::info!(count = evicted.len(), "garbage collected registrations");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::channel::ChannelService;
    use crate::restorer::MemRestorer;

    fn state_with_channel() -> (GatewayState, Cap, Arc<MemRestorer>, crate::channel::ServiceHandle)
    {
        let restorer = Arc::new(MemRestorer::new("gw-vat"));
        let service = ChannelService::spawn(restorer.clone(), Duration::from_secs(1));
        let channel = service.create_channel("c", "", 1).unwrap();
        let cap = Cap::Channel(channel);
        let state = GatewayState::new(restorer.clone(), "Gateway", "", 2);
        (state, cap, restorer, service)
    }

    #[test]
    fn seeded_ids_are_stable_and_seed_sensitive() {
        let a = CapId::from_seed(b"abc");
        let b = CapId::from_seed(b"abc");
        assert_eq!(a, b);
        assert_eq!(a.as_uuid().get_version_num(), 4);

        // Any extension of the seed changes the result, including a zero
        // byte and growth past the generator key width.
        assert_ne!(a, CapId::from_seed(b"abcd"));
        assert_ne!(a, CapId::from_seed(b"abc\0"));
        let long = [7u8; 40];
        assert_ne!(CapId::from_seed(&long), CapId::from_seed(&long[..33]));
    }

    #[test]
    fn register_with_same_seed_reuses_the_id_and_releases_the_old_ref() {
        let (mut state, cap, restorer, _service) = state_with_channel();

        let (id1, sr1) = state.register(cap.clone(), Some("abc")).unwrap();
        assert!(restorer.restore(sr1.token()).is_ok());

        // Second registration with the same seed: same id, old ref replaced.
        let (id2, sr2) = state.register(cap, Some("abc")).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(sr1.token(), sr2.token());
        assert!(restorer.restore(sr2.token()).is_ok());
        assert_eq!(state.registrations.len(), 1);
    }

    #[test]
    fn empty_seed_registers_random_ids() {
        let (mut state, cap, _restorer, _service) = state_with_channel();
        let (id1, _) = state.register(cap.clone(), Some("")).unwrap();
        let (id2, _) = state.register(cap, None).unwrap();
        assert_ne!(id1, id2);
        assert_eq!(state.registrations.len(), 2);
    }

    #[test]
    fn gc_evicts_exactly_the_unbeaten_entries() {
        let (mut state, cap, restorer, _service) = state_with_channel();

        let (beaten, sr_beaten) = state.register(cap.clone(), Some("kept")).unwrap();
        let (lapsed, sr_lapsed) = state.register(cap, Some("lost")).unwrap();

        // First sweep decrements both to zero; nothing evicted yet.
        assert!(state.collect_garbage().is_empty());

        // Only one client beats before the next sweep.
        state.keep_alive(beaten);
        let evicted = state.collect_garbage();
        assert_eq!(evicted, vec![lapsed]);
        assert!(restorer.restore(sr_beaten.token()).is_ok());
        assert!(restorer.restore(sr_lapsed.token()).is_err());

        // Without further beats the survivor goes on the following sweep.
        let evicted = state.collect_garbage();
        assert_eq!(evicted, vec![beaten]);
        assert!(state.registrations.is_empty());
    }

    #[test]
    fn gc_survives_release_failures() {
        let (mut state, _cap, _restorer, _service) = state_with_channel();
        let cap_id = CapId::from_seed(b"broken");
        state.registrations.insert(
            cap_id,
            Registration {
                keep_alive: 0,
                unsave: UnsaveHandle::new(cap_id.to_string(), || Err(RestoreError::Unavailable)),
            },
        );

        let evicted = state.collect_garbage();
        assert_eq!(evicted, vec![cap_id]);
        assert!(state.registrations.is_empty());
    }

    #[test]
    fn beat_on_evicted_entry_is_a_no_op() {
        let (mut state, cap, _restorer, _service) = state_with_channel();
        let (cap_id, _) = state.register(cap, Some("x")).unwrap();
        state.collect_garbage();
        state.collect_garbage();
        assert!(state.registrations.is_empty());
        state.keep_alive(cap_id);
        assert!(state.registrations.is_empty());
    }
}
