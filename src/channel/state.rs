//! Channel core: buffer, endpoint registry, waiter queues, close semantics.
//!
//! All state lives on the service loop thread; nothing here locks. Suspended
//! reads and writes park the caller's reply sender in a deque, the exact
//! rendezvous the loop uses for every other waiter. Both deques are pushed at
//! the front and popped at the back, so wake-up order is FIFO over arrival
//! and broadcasts walk oldest-first.

use std::collections::{HashSet, VecDeque};

use bytes::Bytes;
use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};

use crate::msg::{ChannelId, EndpointId, Info, Msg};

/// What happens when the last writer detaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseSemantics {
    /// Flow-based-programming convention: the last writer's departure sends
    /// `Done` to every remaining reader, pending and future.
    Fbp,
    /// Readers see `Done` only when the channel owner closes the channel.
    Manual,
}

/// Channel shutdown lifecycle.
///
/// Replaces the should-close/can-close boolean pair; these three states are
/// the pair's only legal combinations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Shutdown {
    Open,
    /// Close requested; readers drain the buffer first.
    Draining,
    /// Terminated. The owner may release the channel.
    Closed,
}

/// Reply to a read, delivered immediately or through a parked fulfiller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ReadReply {
    Value(Bytes),
    Done,
    /// `read_if_msg` only: nothing buffered and the channel is still open.
    NoMsg,
    /// The channel has fully shut down.
    Closed,
    /// The endpoint is no longer registered.
    AlreadyClosed,
}

/// Reply to a write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum WriteReply {
    /// Accepted: buffered, handed off, dropped during shutdown, or `Done`.
    Written,
    /// `write_if_space` only: buffer full and no reader waiting.
    NoSpace,
    AlreadyClosed,
}

struct ReadWaiter {
    endpoint: EndpointId,
    respond: Sender<ReadReply>,
}

struct WriteWaiter {
    endpoint: EndpointId,
    payload: Bytes,
    respond: Sender<WriteReply>,
}

/// A single channel's state, owned by the service loop.
pub(crate) struct ChannelState {
    id: ChannelId,
    name: String,
    description: String,
    buffer: VecDeque<Bytes>,
    buffer_size: usize,
    readers: HashSet<EndpointId>,
    writers: HashSet<EndpointId>,
    read_waiters: VecDeque<ReadWaiter>,
    write_waiters: VecDeque<WriteWaiter>,
    close_semantics: CloseSemantics,
    /// Monotonic while the channel is alive: once set, readers that find the
    /// buffer empty are told `Done`.
    send_done_on_empty: bool,
    shutdown: Shutdown,
}

impl ChannelState {
    pub(crate) fn new(name: &str, description: &str, buffer_size: usize) -> Self {
        Self {
            id: ChannelId::generate(),
            name: name.to_string(),
            description: description.to_string(),
            buffer: VecDeque::new(),
            buffer_size: buffer_size.max(1),
            readers: HashSet::new(),
            writers: HashSet::new(),
            read_waiters: VecDeque::new(),
            write_waiters: VecDeque::new(),
            close_semantics: CloseSemantics::Fbp,
            send_done_on_empty: false,
            shutdown: Shutdown::Open,
        }
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn info(&self) -> Info {
        Info {
            id: self.id.to_string(),
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }

    /// Name if set, otherwise the id; used to label endpoints.
    pub(crate) fn name_or_id(&self) -> String {
        if self.name.is_empty() {
            self.id.to_string()
        } else {
            self.name.clone()
        }
    }

    pub(crate) fn endpoint_info(&self, endpoint: EndpointId) -> Info {
        Info {
            id: endpoint.to_string(),
            name: format!("{}::{}", self.name_or_id(), endpoint),
            description: format!(
                "Port (ID: {}) @ Channel '{}' (ID: {})",
                endpoint, self.name, self.id
            ),
        }
    }

    pub(crate) fn can_be_closed(&self) -> bool {
        self.shutdown == Shutdown::Closed
    }

    /// Mint and register a reader endpoint. Always succeeds; an endpoint
    /// minted after shutdown fails cleanly on first use.
    pub(crate) fn mint_reader(&mut self) -> EndpointId {
        let endpoint = EndpointId::generate();
        self.readers.insert(endpoint);
        endpoint
    }

    pub(crate) fn mint_writer(&mut self) -> EndpointId {
        let endpoint = EndpointId::generate();
        self.writers.insert(endpoint);
        endpoint
    }

    pub(crate) fn is_reader(&self, endpoint: EndpointId) -> bool {
        self.readers.contains(&endpoint)
    }

    pub(crate) fn is_writer(&self, endpoint: EndpointId) -> bool {
        self.writers.contains(&endpoint)
    }

    pub(crate) fn set_buffer_size(&mut self, size: usize) {
        // Shrinking never evicts; the buffer drains below the new bound.
        self.buffer_size = size.max(1);
    }

    pub(crate) fn set_close_semantics(&mut self, cs: CloseSemantics) {
        self.close_semantics = cs;
    }

    /// Owner-driven close. Without `wait_for_empty_buffer` (or with nothing
    /// buffered) the channel terminates at once; otherwise it drains first
    /// and readers are told `Done` when the buffer runs dry.
    pub(crate) fn close(&mut self, wait_for_empty_buffer: bool) {
        if !wait_for_empty_buffer || self.buffer.is_empty() {
            self.enter_closed();
        } else {
            self.shutdown = Shutdown::Draining;
            self.send_done_on_empty = true;
            // Parked writes would never wake during a drain; their messages
            // are dropped like any other write after the close request.
            self.flush_write_waiters();
        }
    }

    pub(crate) fn read(&mut self, endpoint: EndpointId, respond: Sender<ReadReply>) {
        self.read_inner(endpoint, respond, true);
    }

    pub(crate) fn read_if_msg(&mut self, endpoint: EndpointId, respond: Sender<ReadReply>) {
        self.read_inner(endpoint, respond, false);
    }

    fn read_inner(&mut self, endpoint: EndpointId, respond: Sender<ReadReply>, may_park: bool) {
        if !self.readers.contains(&endpoint) {
            Self::reply_read(&respond, ReadReply::AlreadyClosed);
            return;
        }

        if let Some(payload) = self.buffer.pop_back() {
            Self::reply_read(&respond, ReadReply::Value(payload));

            // One slot opened up: wake exactly one writer, oldest first,
            // unless the channel is winding down.
            if !self.send_done_on_empty {
                if let Some(waiter) = self.write_waiters.pop_back() {
                    tracing::debug!(channel = %self.id, "read freed a slot, waking writer");
                    self.buffer.push_front(waiter.payload);
                    Self::reply_write(&waiter.respond, WriteReply::Written);
                }
            }

            if self.buffer.is_empty() && self.shutdown == Shutdown::Draining {
                tracing::info!(channel = %self.id, "buffer drained, channel can be closed");
                self.enter_closed();
            }
            return;
        }

        if self.shutdown == Shutdown::Closed {
            Self::reply_read(&respond, ReadReply::Closed);
            return;
        }

        if self.send_done_on_empty {
            tracing::debug!(channel = %self.id, reader = %endpoint, "empty buffer at close-down, sending done");
            Self::reply_read(&respond, ReadReply::Done);
            self.detach_reader(endpoint);
            self.fulfil_parked_readers_with_done();
            return;
        }

        if may_park {
            self.read_waiters.push_front(ReadWaiter { endpoint, respond });
        } else {
            Self::reply_read(&respond, ReadReply::NoMsg);
        }
    }

    pub(crate) fn write(
        &mut self,
        endpoint: EndpointId,
        msg: Msg,
        respond: Sender<WriteReply>,
    ) {
        self.write_inner(endpoint, msg, respond, true);
    }

    pub(crate) fn write_if_space(
        &mut self,
        endpoint: EndpointId,
        msg: Msg,
        respond: Sender<WriteReply>,
    ) {
        self.write_inner(endpoint, msg, respond, false);
    }

    fn write_inner(
        &mut self,
        endpoint: EndpointId,
        msg: Msg,
        respond: Sender<WriteReply>,
        may_park: bool,
    ) {
        if !self.writers.contains(&endpoint) {
            Self::reply_write(&respond, WriteReply::AlreadyClosed);
            return;
        }

        // The channel owner has requested a close; drop the write silently.
        if self.shutdown != Shutdown::Open {
            Self::reply_write(&respond, WriteReply::Written);
            return;
        }

        let payload = match msg {
            Msg::Done => {
                // `Done` always succeeds, even on a full buffer.
                self.detach_writer(endpoint);
                Self::reply_write(&respond, WriteReply::Written);
                return;
            }
            Msg::Value(payload) => payload,
        };

        // Direct hand-off preempts the buffer: deliver to the oldest parked
        // reader. A reader whose client vanished is detached and skipped.
        let mut payload = payload;
        while let Some(waiter) = self.read_waiters.pop_back() {
            match waiter.respond.send(ReadReply::Value(payload)) {
                Ok(()) => {
                    Self::reply_write(&respond, WriteReply::Written);
                    return;
                }
                Err(send_err) => {
                    tracing::error!(
                        channel = %self.id,
                        reader = %waiter.endpoint,
                        "parked reader disconnected before hand-off"
                    );
                    self.detach_reader(waiter.endpoint);
                    payload = match send_err.into_inner() {
                        ReadReply::Value(p) => p,
                        _ => unreachable!("hand-off sends a value"),
                    };
                }
            }
        }

        if self.buffer.len() < self.buffer_size {
            self.buffer.push_front(payload);
            Self::reply_write(&respond, WriteReply::Written);
        } else if may_park {
            self.write_waiters.push_front(WriteWaiter {
                endpoint,
                payload,
                respond,
            });
        } else {
            Self::reply_write(&respond, WriteReply::NoSpace);
        }
    }

    /// Detach a reader endpoint, dropping any suspended read it owns.
    pub(crate) fn close_reader(&mut self, endpoint: EndpointId) {
        self.read_waiters.retain(|w| w.endpoint != endpoint);
        self.detach_reader(endpoint);
        tracing::info!(
            channel = %self.id,
            readers_left = self.readers.len(),
            "reader closed"
        );
    }

    /// Detach a writer endpoint, dropping any suspended write it owns.
    /// Equivalent to the writer sending `Done`.
    pub(crate) fn close_writer(&mut self, endpoint: EndpointId) {
        self.write_waiters.retain(|w| w.endpoint != endpoint);
        self.detach_writer(endpoint);
        tracing::info!(
            channel = %self.id,
            writers_left = self.writers.len(),
            "writer closed"
        );
    }

    fn detach_reader(&mut self, endpoint: EndpointId) {
        self.readers.remove(&endpoint);
    }

    fn detach_writer(&mut self, endpoint: EndpointId) {
        if !self.writers.remove(&endpoint) {
            return;
        }
        if self.close_semantics == CloseSemantics::Fbp && self.writers.is_empty() {
            tracing::info!(channel = %self.id, "last writer gone under FBP semantics, closing readers");
            self.send_done_on_empty = true;
            self.fulfil_parked_readers_with_done();
        }
    }

    /// Broadcast `Done` to every parked reader, oldest first, and detach each.
    fn fulfil_parked_readers_with_done(&mut self) {
        while let Some(waiter) = self.read_waiters.pop_back() {
            if waiter.respond.send(ReadReply::Done).is_err() {
                tracing::error!(
                    channel = %self.id,
                    reader = %waiter.endpoint,
                    "parked reader disconnected before done broadcast"
                );
            }
            self.detach_reader(waiter.endpoint);
        }
    }

    fn flush_write_waiters(&mut self) {
        while let Some(waiter) = self.write_waiters.pop_back() {
            Self::reply_write(&waiter.respond, WriteReply::Written);
        }
    }

    /// Terminate. Queues must end empty once the channel can be closed, so
    /// parked readers learn the channel is gone and parked writes are dropped.
    fn enter_closed(&mut self) {
        self.shutdown = Shutdown::Closed;
        while let Some(waiter) = self.read_waiters.pop_back() {
            let _ = waiter.respond.send(ReadReply::Closed);
        }
        self.flush_write_waiters();
    }

    fn reply_read(respond: &Sender<ReadReply>, reply: ReadReply) {
        if respond.send(reply).is_err() {
            tracing::error!("read fulfiller disconnected, discarding reply");
        }
    }

    fn reply_write(respond: &Sender<WriteReply>, reply: WriteReply) {
        if respond.send(reply).is_err() {
            tracing::error!("write fulfiller disconnected, discarding reply");
        }
    }
}
