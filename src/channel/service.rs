//! Channel service loop.
//!
//! The loop thread is the serialization point: every channel mutation runs
//! here, requests arrive over a crossbeam channel, and a periodic sweep
//! releases channels that reported `can_be_closed`. The service exits one
//! sweep after the last channel is released (the exit timeout).

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use super::endpoint::{ChannelClient, Reader, Writer};
use super::state::{ChannelState, CloseSemantics, ReadReply, WriteReply};
use super::ChannelError;
use crate::msg::{ChannelId, EndpointId, Info, Msg};
use crate::restorer::{Cap, Restorer, Saved};

/// Which side of a channel an endpoint belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EndpointKind {
    Reader,
    Writer,
}

/// Requests handled by the service loop. Each variant carries its own reply
/// sender; suspendable operations hand theirs to the channel state, which may
/// park it.
pub(crate) enum Request {
    CreateChannel {
        name: String,
        description: String,
        buffer_size: usize,
        respond: Sender<ChannelId>,
    },
    ChannelInfo {
        channel: ChannelId,
        respond: Sender<Result<Info, ChannelError>>,
    },
    SaveChannel {
        channel: ChannelId,
        token: Option<String>,
        respond: Sender<Result<Saved, ChannelError>>,
    },
    MintEndpoint {
        channel: ChannelId,
        kind: EndpointKind,
        respond: Sender<Result<EndpointId, ChannelError>>,
    },
    SetBufferSize {
        channel: ChannelId,
        size: usize,
        respond: Sender<Result<(), ChannelError>>,
    },
    SetCloseSemantics {
        channel: ChannelId,
        cs: CloseSemantics,
        respond: Sender<Result<(), ChannelError>>,
    },
    CloseChannel {
        channel: ChannelId,
        wait_for_empty_buffer: bool,
        respond: Sender<Result<(), ChannelError>>,
    },
    CloseAllChannels,
    EndpointInfo {
        channel: ChannelId,
        endpoint: EndpointId,
        respond: Sender<Result<Info, ChannelError>>,
    },
    SaveEndpoint {
        channel: ChannelId,
        endpoint: EndpointId,
        kind: EndpointKind,
        token: Option<String>,
        /// The requesting handle's closed flag; the saved capability shares
        /// it so the table reference keeps the endpoint alive.
        closed: Arc<AtomicBool>,
        respond: Sender<Result<Saved, ChannelError>>,
    },
    Read {
        channel: ChannelId,
        endpoint: EndpointId,
        respond: Sender<ReadReply>,
    },
    ReadIfMsg {
        channel: ChannelId,
        endpoint: EndpointId,
        respond: Sender<ReadReply>,
    },
    Write {
        channel: ChannelId,
        endpoint: EndpointId,
        msg: Msg,
        respond: Sender<WriteReply>,
    },
    WriteIfSpace {
        channel: ChannelId,
        endpoint: EndpointId,
        msg: Msg,
        respond: Sender<WriteReply>,
    },
    CloseReader {
        channel: ChannelId,
        endpoint: EndpointId,
    },
    CloseWriter {
        channel: ChannelId,
        endpoint: EndpointId,
    },
}

/// Startup summary a channel service can stream to an interested peer,
/// typically consumed to build port wirings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartupInfo {
    pub buffer_size: usize,
    pub channel_sr: String,
    #[serde(default)]
    pub reader_srs: Vec<String>,
    #[serde(default)]
    pub writer_srs: Vec<String>,
}

/// Factory for the service loop thread.
pub struct ChannelService;

impl ChannelService {
    /// Spawn the loop. `exit_timeout` is the sweep period; the loop exits one
    /// sweep after its channel set becomes empty.
    pub fn spawn(restorer: Arc<dyn Restorer>, exit_timeout: Duration) -> ServiceHandle {
        let exit_timeout = exit_timeout.max(Duration::from_secs(1));
        let (tx, rx) = unbounded();
        let loop_tx = tx.clone();
        let thread = std::thread::spawn(move || run_loop(rx, loop_tx, restorer, exit_timeout));
        ServiceHandle { tx, thread }
    }
}

/// Owner-side handle to a running channel service.
pub struct ServiceHandle {
    tx: Sender<Request>,
    thread: JoinHandle<()>,
}

impl ServiceHandle {
    pub fn create_channel(
        &self,
        name: &str,
        description: &str,
        buffer_size: usize,
    ) -> Result<ChannelClient, ChannelError> {
        let (respond, rx) = bounded(1);
        self.tx
            .send(Request::CreateChannel {
                name: name.to_string(),
                description: description.to_string(),
                buffer_size,
                respond,
            })
            .map_err(|_| ChannelError::ServiceStopped)?;
        let id = rx.recv().map_err(|_| ChannelError::ServiceStopped)?;
        Ok(ChannelClient::new(id, self.tx.clone()))
    }

    /// Close every channel immediately; the loop exits after its next sweep.
    pub fn close_all(&self) -> Result<(), ChannelError> {
        self.tx
            .send(Request::CloseAllChannels)
            .map_err(|_| ChannelError::ServiceStopped)
    }

    /// Detached close handle, e.g. for a signal watcher.
    pub fn closer(&self) -> ServiceCloser {
        ServiceCloser {
            tx: self.tx.clone(),
        }
    }

    /// Block until the loop exits (all channels closed and swept).
    pub fn join(self) {
        drop(self.tx);
        let _ = self.thread.join();
    }
}

/// Cloneable handle that can only request a full close.
#[derive(Clone)]
pub struct ServiceCloser {
    tx: Sender<Request>,
}

impl ServiceCloser {
    pub fn close_all(&self) -> Result<(), ChannelError> {
        self.tx
            .send(Request::CloseAllChannels)
            .map_err(|_| ChannelError::ServiceStopped)
    }
}

fn run_loop(
    rx: Receiver<Request>,
    self_tx: Sender<Request>,
    restorer: Arc<dyn Restorer>,
    exit_timeout: Duration,
) {
    let mut channels: HashMap<ChannelId, ChannelState> = HashMap::new();
    let mut served_any = false;
    let sweeper = crossbeam::channel::tick(exit_timeout);

    loop {
        crossbeam::select! {
            recv(rx) -> msg => match msg {
                Ok(request) => {
                    served_any = served_any || matches!(request, Request::CreateChannel { .. });
                    handle_request(&mut channels, request, &self_tx, restorer.as_ref());
                }
                Err(_) => break,
            },
            recv(sweeper) -> _ => {
                if served_any && channels.is_empty() {
                    tracing::info!("no channels left, channel service exiting");
                    break;
                }
                channels.retain(|id, ch| {
                    if ch.can_be_closed() {
                        tracing::info!(channel = %id, "releasing closed channel");
                        false
                    } else {
                        true
                    }
                });
            }
        }
    }
}

fn handle_request(
    channels: &mut HashMap<ChannelId, ChannelState>,
    request: Request,
    self_tx: &Sender<Request>,
    restorer: &dyn Restorer,
) {
    match request {
        Request::CreateChannel {
            name,
            description,
            buffer_size,
            respond,
        } => {
            let state = ChannelState::new(&name, &description, buffer_size);
            let id = state.id();
            tracing::info!(channel = %id, name = %name, buffer_size, "created channel");
            channels.insert(id, state);
            let _ = respond.send(id);
        }
        Request::ChannelInfo { channel, respond } => {
            let reply = channels
                .get(&channel)
                .map(|ch| ch.info())
                .ok_or(ChannelError::UnknownChannel(channel));
            let _ = respond.send(reply);
        }
        Request::SaveChannel {
            channel,
            token,
            respond,
        } => {
            let reply = if channels.contains_key(&channel) {
                let cap = Cap::Channel(ChannelClient::new(channel, self_tx.clone()));
                restorer
                    .save(cap, token.as_deref())
                    .map_err(ChannelError::from)
            } else {
                Err(ChannelError::UnknownChannel(channel))
            };
            let _ = respond.send(reply);
        }
        Request::MintEndpoint {
            channel,
            kind,
            respond,
        } => {
            let reply = match channels.get_mut(&channel) {
                Some(ch) => Ok(match kind {
                    EndpointKind::Reader => ch.mint_reader(),
                    EndpointKind::Writer => ch.mint_writer(),
                }),
                None => Err(ChannelError::UnknownChannel(channel)),
            };
            let _ = respond.send(reply);
        }
        Request::SetBufferSize {
            channel,
            size,
            respond,
        } => {
            let reply = match channels.get_mut(&channel) {
                Some(ch) => {
                    ch.set_buffer_size(size);
                    Ok(())
                }
                None => Err(ChannelError::UnknownChannel(channel)),
            };
            let _ = respond.send(reply);
        }
        Request::SetCloseSemantics {
            channel,
            cs,
            respond,
        } => {
            let reply = match channels.get_mut(&channel) {
                Some(ch) => {
                    ch.set_close_semantics(cs);
                    Ok(())
                }
                None => Err(ChannelError::UnknownChannel(channel)),
            };
            let _ = respond.send(reply);
        }
        Request::CloseChannel {
            channel,
            wait_for_empty_buffer,
            respond,
        } => {
            let reply = match channels.get_mut(&channel) {
                Some(ch) => {
                    ch.close(wait_for_empty_buffer);
                    Ok(())
                }
                None => Err(ChannelError::UnknownChannel(channel)),
            };
            let _ = respond.send(reply);
        }
        Request::CloseAllChannels => {
            for ch in channels.values_mut() {
                ch.close(false);
            }
        }
        Request::EndpointInfo {
            channel,
            endpoint,
            respond,
        } => {
            let reply = match channels.get(&channel) {
                Some(ch) if ch.is_reader(endpoint) || ch.is_writer(endpoint) => {
                    Ok(ch.endpoint_info(endpoint))
                }
                Some(_) => Err(ChannelError::AlreadyClosed),
                None => Err(ChannelError::UnknownChannel(channel)),
            };
            let _ = respond.send(reply);
        }
        Request::SaveEndpoint {
            channel,
            endpoint,
            kind,
            token,
            closed,
            respond,
        } => {
            let registered = match (channels.get(&channel), kind) {
                (Some(ch), EndpointKind::Reader) => ch.is_reader(endpoint),
                (Some(ch), EndpointKind::Writer) => ch.is_writer(endpoint),
                (None, _) => false,
            };
            let reply = if registered {
                let cap = match kind {
                    EndpointKind::Reader => {
                        Cap::Reader(Reader::attach(channel, endpoint, self_tx.clone(), closed))
                    }
                    EndpointKind::Writer => {
                        Cap::Writer(Writer::attach(channel, endpoint, self_tx.clone(), closed))
                    }
                };
                restorer
                    .save(cap, token.as_deref())
                    .map_err(ChannelError::from)
            } else {
                Err(ChannelError::AlreadyClosed)
            };
            let _ = respond.send(reply);
        }
        Request::Read {
            channel,
            endpoint,
            respond,
        } => match channels.get_mut(&channel) {
            Some(ch) => ch.read(endpoint, respond),
            None => {
                let _ = respond.send(ReadReply::Closed);
            }
        },
        Request::ReadIfMsg {
            channel,
            endpoint,
            respond,
        } => match channels.get_mut(&channel) {
            Some(ch) => ch.read_if_msg(endpoint, respond),
            None => {
                let _ = respond.send(ReadReply::Closed);
            }
        },
        Request::Write {
            channel,
            endpoint,
            msg,
            respond,
        } => match channels.get_mut(&channel) {
            Some(ch) => ch.write(endpoint, msg, respond),
            None => {
                // A released channel swallows writes like any closing channel.
                let _ = respond.send(WriteReply::Written);
            }
        },
        Request::WriteIfSpace {
            channel,
            endpoint,
            msg,
            respond,
        } => match channels.get_mut(&channel) {
            Some(ch) => ch.write_if_space(endpoint, msg, respond),
            None => {
                let _ = respond.send(WriteReply::Written);
            }
        },
        Request::CloseReader { channel, endpoint } => {
            if let Some(ch) = channels.get_mut(&channel) {
                ch.close_reader(endpoint);
            }
        }
        Request::CloseWriter { channel, endpoint } => {
            if let Some(ch) = channels.get_mut(&channel) {
                ch.close_writer(endpoint);
            }
        }
    }
}
