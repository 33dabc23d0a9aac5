//! Client handles for channels and their endpoints.
//!
//! Handles are cheap clones around the service loop's request sender. Every
//! operation is a round trip: send the request with a one-shot reply channel,
//! then block on the reply. Suspendable operations (read, write) simply block
//! longer while their reply sender sits in the channel's waiter queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{bounded, Sender};

use super::service::{EndpointKind, Request};
use super::state::{CloseSemantics, ReadReply, WriteReply};
use super::ChannelError;
use crate::msg::{ChannelId, EndpointId, Info, Msg};
use crate::restorer::Saved;

fn roundtrip<T>(
    tx: &Sender<Request>,
    make: impl FnOnce(Sender<T>) -> Request,
) -> Result<T, ChannelError> {
    let (respond, rx) = bounded(1);
    tx.send(make(respond))
        .map_err(|_| ChannelError::ServiceStopped)?;
    rx.recv().map_err(|_| ChannelError::ServiceStopped)
}

/// Handle to a channel as a whole: endpoint factory and owner surface.
#[derive(Clone)]
pub struct ChannelClient {
    id: ChannelId,
    tx: Sender<Request>,
}

impl ChannelClient {
    pub(crate) fn new(id: ChannelId, tx: Sender<Request>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn info(&self) -> Result<Info, ChannelError> {
        roundtrip(&self.tx, |respond| Request::ChannelInfo {
            channel: self.id,
            respond,
        })?
    }

    pub fn save(&self) -> Result<Saved, ChannelError> {
        self.save_as(None)
    }

    pub fn save_as(&self, token: Option<&str>) -> Result<Saved, ChannelError> {
        let token = token.map(str::to_string);
        roundtrip(&self.tx, |respond| Request::SaveChannel {
            channel: self.id,
            token,
            respond,
        })?
    }

    /// Mint a new reader endpoint. Always succeeds while the service runs;
    /// an endpoint minted after shutdown fails cleanly on first use.
    pub fn reader(&self) -> Result<Reader, ChannelError> {
        let endpoint = roundtrip(&self.tx, |respond| Request::MintEndpoint {
            channel: self.id,
            kind: EndpointKind::Reader,
            respond,
        })??;
        Ok(Reader::new(self.id, endpoint, self.tx.clone()))
    }

    pub fn writer(&self) -> Result<Writer, ChannelError> {
        let endpoint = roundtrip(&self.tx, |respond| Request::MintEndpoint {
            channel: self.id,
            kind: EndpointKind::Writer,
            respond,
        })??;
        Ok(Writer::new(self.id, endpoint, self.tx.clone()))
    }

    pub fn endpoints(&self) -> Result<(Reader, Writer), ChannelError> {
        Ok((self.reader()?, self.writer()?))
    }

    pub fn set_buffer_size(&self, size: usize) -> Result<(), ChannelError> {
        roundtrip(&self.tx, |respond| Request::SetBufferSize {
            channel: self.id,
            size,
            respond,
        })?
    }

    pub fn set_close_semantics(&self, cs: CloseSemantics) -> Result<(), ChannelError> {
        roundtrip(&self.tx, |respond| Request::SetCloseSemantics {
            channel: self.id,
            cs,
            respond,
        })?
    }

    pub fn close(&self, wait_for_empty_buffer: bool) -> Result<(), ChannelError> {
        roundtrip(&self.tx, |respond| Request::CloseChannel {
            channel: self.id,
            wait_for_empty_buffer,
            respond,
        })?
    }
}

/// Consumer endpoint of a channel.
#[derive(Clone)]
pub struct Reader {
    channel: ChannelId,
    endpoint: EndpointId,
    tx: Sender<Request>,
    closed: Arc<AtomicBool>,
}

impl Reader {
    pub(crate) fn new(channel: ChannelId, endpoint: EndpointId, tx: Sender<Request>) -> Self {
        Self::attach(channel, endpoint, tx, Arc::new(AtomicBool::new(false)))
    }

    /// Handle sharing an existing closed flag, e.g. the restorer table's
    /// reference to an already-minted endpoint.
    pub(crate) fn attach(
        channel: ChannelId,
        endpoint: EndpointId,
        tx: Sender<Request>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            channel,
            endpoint,
            tx,
            closed,
        }
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint
    }

    pub fn info(&self) -> Result<Info, ChannelError> {
        roundtrip(&self.tx, |respond| Request::EndpointInfo {
            channel: self.channel,
            endpoint: self.endpoint,
            respond,
        })?
    }

    pub fn save(&self) -> Result<Saved, ChannelError> {
        self.save_as(None)
    }

    pub fn save_as(&self, token: Option<&str>) -> Result<Saved, ChannelError> {
        let token = token.map(str::to_string);
        let closed = self.closed.clone();
        roundtrip(&self.tx, |respond| Request::SaveEndpoint {
            channel: self.channel,
            endpoint: self.endpoint,
            kind: EndpointKind::Reader,
            token,
            closed,
            respond,
        })?
    }

    /// Blocking read: next buffered value, a direct hand-off, or `Done` once
    /// the channel winds down. Suspends while the channel is empty and open.
    pub fn read(&self) -> Result<Msg, ChannelError> {
        self.ensure_open()?;
        let reply = roundtrip(&self.tx, |respond| Request::Read {
            channel: self.channel,
            endpoint: self.endpoint,
            respond,
        })?;
        match reply {
            ReadReply::Value(payload) => Ok(Msg::Value(payload)),
            ReadReply::Done => {
                // Done detaches the endpoint server-side; mirror it locally.
                self.closed.store(true, Ordering::Relaxed);
                Ok(Msg::Done)
            }
            // `read` never yields NoMsg; a slipped reply means the loop is
            // not the one we spoke to.
            ReadReply::NoMsg => Err(ChannelError::ServiceStopped),
            ReadReply::Closed => Err(ChannelError::ChannelClosed),
            ReadReply::AlreadyClosed => Err(ChannelError::AlreadyClosed),
        }
    }

    /// Non-suspending read: `Ok(None)` when nothing is buffered and the
    /// channel is still open.
    pub fn read_if_msg(&self) -> Result<Option<Msg>, ChannelError> {
        self.ensure_open()?;
        let reply = roundtrip(&self.tx, |respond| Request::ReadIfMsg {
            channel: self.channel,
            endpoint: self.endpoint,
            respond,
        })?;
        match reply {
            ReadReply::Value(payload) => Ok(Some(Msg::Value(payload))),
            ReadReply::Done => {
                self.closed.store(true, Ordering::Relaxed);
                Ok(Some(Msg::Done))
            }
            ReadReply::NoMsg => Ok(None),
            ReadReply::Closed => Err(ChannelError::ChannelClosed),
            ReadReply::AlreadyClosed => Err(ChannelError::AlreadyClosed),
        }
    }

    pub fn close(&self) -> Result<(), ChannelError> {
        self.closed.store(true, Ordering::Relaxed);
        self.tx
            .send(Request::CloseReader {
                channel: self.channel,
                endpoint: self.endpoint,
            })
            .map_err(|_| ChannelError::ServiceStopped)
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Relaxed) {
            Err(ChannelError::AlreadyClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Reader {
    /// The last handle going away detaches the endpoint, like a client
    /// dropping its RPC reference. Best effort: two clones racing their
    /// drops may both skip the close.
    fn drop(&mut self) {
        if Arc::strong_count(&self.closed) == 1 && !self.closed.load(Ordering::Relaxed) {
            let _ = self.tx.send(Request::CloseReader {
                channel: self.channel,
                endpoint: self.endpoint,
            });
        }
    }
}

/// Producer endpoint of a channel.
#[derive(Clone)]
pub struct Writer {
    channel: ChannelId,
    endpoint: EndpointId,
    tx: Sender<Request>,
    closed: Arc<AtomicBool>,
}

impl Writer {
    pub(crate) fn new(channel: ChannelId, endpoint: EndpointId, tx: Sender<Request>) -> Self {
        Self::attach(channel, endpoint, tx, Arc::new(AtomicBool::new(false)))
    }

    /// See `Reader::attach`.
    pub(crate) fn attach(
        channel: ChannelId,
        endpoint: EndpointId,
        tx: Sender<Request>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            channel,
            endpoint,
            tx,
            closed,
        }
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint
    }

    pub fn info(&self) -> Result<Info, ChannelError> {
        roundtrip(&self.tx, |respond| Request::EndpointInfo {
            channel: self.channel,
            endpoint: self.endpoint,
            respond,
        })?
    }

    pub fn save(&self) -> Result<Saved, ChannelError> {
        self.save_as(None)
    }

    pub fn save_as(&self, token: Option<&str>) -> Result<Saved, ChannelError> {
        let token = token.map(str::to_string);
        let closed = self.closed.clone();
        roundtrip(&self.tx, |respond| Request::SaveEndpoint {
            channel: self.channel,
            endpoint: self.endpoint,
            kind: EndpointKind::Writer,
            token,
            closed,
            respond,
        })?
    }

    /// Blocking write. Hands the value to a waiting reader, buffers it, or
    /// suspends until a slot opens. `Msg::Done` detaches this writer.
    /// Writes into a closing channel are dropped silently.
    pub fn write(&self, msg: Msg) -> Result<(), ChannelError> {
        self.ensure_open()?;
        let reply = roundtrip(&self.tx, |respond| Request::Write {
            channel: self.channel,
            endpoint: self.endpoint,
            msg,
            respond,
        })?;
        match reply {
            WriteReply::Written => Ok(()),
            // `write` never yields NoSpace; see Reader::read.
            WriteReply::NoSpace => Err(ChannelError::ServiceStopped),
            WriteReply::AlreadyClosed => Err(ChannelError::AlreadyClosed),
        }
    }

    /// Non-suspending write: `Ok(false)` when the buffer is full and no
    /// reader is waiting. `Msg::Done` always succeeds.
    pub fn write_if_space(&self, msg: Msg) -> Result<bool, ChannelError> {
        self.ensure_open()?;
        let reply = roundtrip(&self.tx, |respond| Request::WriteIfSpace {
            channel: self.channel,
            endpoint: self.endpoint,
            msg,
            respond,
        })?;
        match reply {
            WriteReply::Written => Ok(true),
            WriteReply::NoSpace => Ok(false),
            WriteReply::AlreadyClosed => Err(ChannelError::AlreadyClosed),
        }
    }

    pub fn close(&self) -> Result<(), ChannelError> {
        self.closed.store(true, Ordering::Relaxed);
        self.tx
            .send(Request::CloseWriter {
                channel: self.channel,
                endpoint: self.endpoint,
            })
            .map_err(|_| ChannelError::ServiceStopped)
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Relaxed) {
            Err(ChannelError::AlreadyClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Writer {
    /// See `Reader::drop`: the last handle detaches the endpoint, which
    /// under FBP semantics may close the channel's readers.
    fn drop(&mut self) {
        if Arc::strong_count(&self.closed) == 1 && !self.closed.load(Ordering::Relaxed) {
            let _ = self.tx.send(Request::CloseWriter {
                channel: self.channel,
                endpoint: self.endpoint,
            });
        }
    }
}
