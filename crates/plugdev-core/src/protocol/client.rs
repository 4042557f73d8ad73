//! Remote-control protocol client.
//!
//! One background task owns the socket. Callers talk to it over a command
//! channel and get replies back on per-request oneshot channels, so there is
//! no lock around the stream and no shared request table.
//!
//! Requests are multiplexed by actor: each actor has a FIFO queue and at most
//! one request in flight. The next queued request for an actor is only written
//! once the reply to the previous one (matched by the reply's `from` field)
//! has arrived. Requests to different actors proceed independently.
//!
//! Replies carry no request id, so a request that times out while on the wire
//! leaves its actor with no way to tell a late reply from the next one. The
//! connection is closed in that case and later requests fail at once.
//!
//! # Lifecycle
//!
//! `Disconnected -> Connecting -> Connected -> Closed`. `connect` only returns
//! once the root actor's greeting has arrived. `Closed` is terminal: a closed
//! client cannot reconnect, create a new one instead.

use crate::config::{ConnectConfig, RemoteConfig};
use crate::error::{HarnessError, Result};
use crate::protocol::frame::{try_read_frame, write_frame, FrameError};
use crate::protocol::packet::{Packet, RequestSpec, ROOT_ACTOR};
use bytes::BytesMut;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Out-of-band notifications from a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Broadcast notification from the target, not a reply to anything.
    Message(Packet),
    /// Protocol-level problem: undecodable payload, packet without `from`,
    /// reply nobody was waiting for, or a socket error.
    Error(String),
    /// The target closed the socket.
    End,
    /// No traffic for the configured idle timeout. The connection stays open.
    Timeout,
}

/// Client tuning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientOptions {
    /// Fail a request with a request error when its reply takes longer.
    /// If the request was already written, the connection is closed too.
    pub request_timeout: Option<Duration>,
    /// Emit [`ClientEvent::Timeout`] after this much inactivity.
    pub idle_timeout: Option<Duration>,
}

impl From<&ConnectConfig> for ClientOptions {
    fn from(config: &ConnectConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

type Reply = oneshot::Sender<Result<Packet>>;

enum Command {
    Request {
        actor: String,
        packet: Packet,
        reply: Reply,
    },
    /// The caller of a request to `actor` stopped waiting.
    Abandon { actor: String },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

/// Client for the actor-addressed remote-control protocol.
pub struct ProtocolClient {
    options: ClientOptions,
    state: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<ClientEvent>,
    commands: mpsc::Sender<Command>,
    /// Receiving end of `commands`, handed to the connection task by `connect`.
    inbox: Mutex<Option<mpsc::Receiver<Command>>>,
}

impl ProtocolClient {
    pub fn new(options: ClientOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(RemoteConfig::EVENT_CHANNEL_CAPACITY);
        let (commands, inbox) = mpsc::channel(RemoteConfig::COMMAND_CHANNEL_CAPACITY);
        Self {
            options,
            state: Arc::new(state),
            events,
            commands,
            inbox: Mutex::new(Some(inbox)),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Connect to the target's control port on the local host.
    ///
    /// Returns the root actor's greeting. Any socket error before the greeting
    /// arrives is a connection error and leaves the client `Closed`.
    pub async fn connect(&self, port: u16) -> Result<Packet> {
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| HarnessError::InvalidState {
                expected: ConnectionState::Disconnected.to_string(),
                found: self.state().to_string(),
            })?;

        self.state.send_replace(ConnectionState::Connecting);
        debug!("Connecting to remote-control port {}", port);

        let stream = match tokio::time::timeout(
            RemoteConfig::CONNECT_TIMEOUT,
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state.send_replace(ConnectionState::Closed);
                return Err(HarnessError::connection(format!(
                    "cannot connect to 127.0.0.1:{}: {}",
                    port, e
                )));
            }
            Err(_) => {
                self.state.send_replace(ConnectionState::Closed);
                return Err(HarnessError::connection(format!(
                    "timed out connecting to 127.0.0.1:{}",
                    port
                )));
            }
        };

        // The root actor speaks first; its greeting is the reply to an
        // implicit request.
        let (greeting_tx, greeting_rx) = oneshot::channel();
        let mut dispatcher = Dispatcher::default();
        dispatcher.in_flight.insert(ROOT_ACTOR.to_string(), greeting_tx);

        let connection = Connection {
            stream,
            commands: inbox,
            dispatcher,
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            idle_timeout: self.options.idle_timeout,
        };
        tokio::spawn(connection.run());

        let greeting = match tokio::time::timeout(RemoteConfig::CONNECT_TIMEOUT, greeting_rx).await
        {
            Ok(Ok(Ok(greeting))) => greeting,
            Ok(Ok(Err(e))) => return Err(as_connection_error(e)),
            Ok(Err(_)) => return Err(HarnessError::connection_closed()),
            Err(_) => {
                self.disconnect().await;
                return Err(HarnessError::connection(format!(
                    "no greeting from 127.0.0.1:{}",
                    port
                )));
            }
        };

        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        debug!("Connected to remote-control port {}", port);
        Ok(greeting)
    }

    /// Send a request and wait for the reply from its target actor.
    ///
    /// A spec without a resolvable `to` field fails immediately without
    /// touching the connection.
    pub async fn request(&self, spec: impl Into<RequestSpec>) -> Result<Packet> {
        let (actor, packet) = spec.into().resolve()?;

        match self.state() {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            ConnectionState::Disconnected => {
                return Err(HarnessError::connection("not connected"));
            }
            ConnectionState::Closed => return Err(HarnessError::connection_closed()),
        }

        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                actor: actor.clone(),
                packet,
                reply,
            })
            .await
            .map_err(|_| HarnessError::connection_closed())?;

        // A dropped sender means the connection task went away with the
        // request still queued.
        let wait = async {
            reply_rx
                .await
                .unwrap_or_else(|_| Err(HarnessError::connection_closed()))
        };

        let Some(limit) = self.options.request_timeout else {
            return wait.await;
        };
        match tokio::time::timeout(limit, wait).await {
            Ok(result) => result,
            Err(_) => {
                // The receiver is gone by now; the task checks for that.
                let _ = self
                    .commands
                    .send(Command::Abandon {
                        actor: actor.clone(),
                    })
                    .await;
                Err(HarnessError::Request {
                    actor,
                    message: format!("no reply within {}ms", limit.as_millis()),
                    error: None,
                })
            }
        }
    }

    /// Close the connection.
    ///
    /// Every queued and in-flight request is rejected with a connection-closed
    /// error. Safe to call any number of times, in any state.
    pub async fn disconnect(&self) {
        // Never connected: dropping the inbox discards anything buffered.
        let never_connected = self
            .inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some();

        if !never_connected {
            let (done, done_rx) = oneshot::channel();
            if self.commands.send(Command::Disconnect { done }).await.is_ok() {
                let _ = done_rx.await;
            }
        }

        self.state.send_replace(ConnectionState::Closed);
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.state.send_replace(ConnectionState::Closed);
    }
}

fn as_connection_error(err: HarnessError) -> HarnessError {
    match err {
        HarnessError::Connection { .. } => err,
        other => HarnessError::connection(other.to_string()),
    }
}

/// Per-actor queues and the single in-flight request of each actor.
#[derive(Default)]
struct Dispatcher {
    pending: HashMap<String, VecDeque<(Packet, Reply)>>,
    in_flight: HashMap<String, Reply>,
}

/// What happened to an inbound packet.
#[derive(Debug)]
enum Inbound {
    Resolved,
    Unsolicited(Packet),
    MissingFrom(Packet),
    Unexpected(Packet),
}

impl Dispatcher {
    fn enqueue(&mut self, actor: String, packet: Packet, reply: Reply) {
        self.pending
            .entry(actor)
            .or_default()
            .push_back((packet, reply));
    }

    /// Move the head of every idle actor's queue to in-flight and return the
    /// packets to write.
    fn flush(&mut self) -> Vec<Packet> {
        let mut outgoing = Vec::new();
        for (actor, queue) in self.pending.iter_mut() {
            if self.in_flight.contains_key(actor) {
                continue;
            }
            while let Some((packet, reply)) = queue.pop_front() {
                // Caller gave up (timeout) before the request hit the wire.
                if reply.is_closed() {
                    continue;
                }
                self.in_flight.insert(actor.clone(), reply);
                outgoing.push(packet);
                break;
            }
        }
        self.pending.retain(|_, queue| !queue.is_empty());
        outgoing
    }

    /// Whether the request on the wire for `actor` has lost its caller.
    fn is_abandoned(&self, actor: &str) -> bool {
        self.in_flight
            .get(actor)
            .is_some_and(oneshot::Sender::is_closed)
    }

    fn dispatch(&mut self, packet: Packet) -> Inbound {
        if packet.is_unsolicited() {
            return Inbound::Unsolicited(packet);
        }

        let reply = match packet.sender() {
            None => return Inbound::MissingFrom(packet),
            Some(actor) => match self.in_flight.remove(actor) {
                Some(reply) => reply,
                None => return Inbound::Unexpected(packet),
            },
        };

        let result = match packet.error() {
            Some(error) => Err(HarnessError::Request {
                actor: packet.sender().unwrap_or_default().to_string(),
                message: packet.message().unwrap_or(error).to_string(),
                error: Some(error.to_string()),
            }),
            None => Ok(packet),
        };
        // The caller may have timed out already.
        let _ = reply.send(result);
        Inbound::Resolved
    }

    /// Reject all in-flight and queued requests.
    fn reject_all(&mut self, reason: &str) -> usize {
        let mut rejected = 0;
        for (_, reply) in self.in_flight.drain() {
            let _ = reply.send(Err(HarnessError::connection(reason)));
            rejected += 1;
        }
        for (_, queue) in self.pending.drain() {
            for (_, reply) in queue {
                let _ = reply.send(Err(HarnessError::connection(reason)));
                rejected += 1;
            }
        }
        rejected
    }
}

/// The task that owns the socket.
struct Connection {
    stream: TcpStream,
    commands: mpsc::Receiver<Command>,
    dispatcher: Dispatcher,
    state: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<ClientEvent>,
    idle_timeout: Option<Duration>,
}

impl Connection {
    async fn run(mut self) {
        let mut buf = BytesMut::with_capacity(RemoteConfig::READ_BUFFER_SIZE);
        let mut done: Option<oneshot::Sender<()>> = None;

        let reason = loop {
            if let Err(e) = self.write_pending().await {
                self.emit(ClientEvent::Error(e.to_string()));
                break "connection closed: write failed".to_string();
            }

            let idle = self.idle_timeout;
            let idle_sleep = async move {
                match idle {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Request { actor, packet, reply }) => {
                        self.dispatcher.enqueue(actor, packet, reply);
                    }
                    Some(Command::Abandon { actor }) => {
                        // A request that never left its queue is dropped by `flush`.
                        if self.dispatcher.is_abandoned(&actor) {
                            let message = format!(
                                "no reply from {} before the request timed out",
                                actor
                            );
                            warn!("Closing remote-control connection: {}", message);
                            self.emit(ClientEvent::Error(message.clone()));
                            break format!("connection closed: {}", message);
                        }
                    }
                    Some(Command::Disconnect { done: ack }) => {
                        done = Some(ack);
                        break HarnessError::connection_closed().to_string();
                    }
                    // Client dropped.
                    None => break HarnessError::connection_closed().to_string(),
                },
                read = self.stream.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        debug!("Remote-control connection ended by peer");
                        self.emit(ClientEvent::End);
                        break HarnessError::connection_closed().to_string();
                    }
                    Ok(n) => {
                        trace!("Read {} bytes from remote-control socket", n);
                        if let Err(e) = self.drain_frames(&mut buf) {
                            warn!("Closing remote-control connection: {}", e);
                            self.emit(ClientEvent::Error(e.to_string()));
                            break format!("connection closed: {}", e);
                        }
                    }
                    Err(e) => {
                        warn!("Remote-control socket error: {}", e);
                        self.emit(ClientEvent::Error(e.to_string()));
                        break format!("connection closed: {}", e);
                    }
                },
                _ = idle_sleep => {
                    debug!("Remote-control connection idle");
                    self.emit(ClientEvent::Timeout);
                }
            }
        };

        self.close(&reason).await;
        if let Some(ack) = done {
            let _ = ack.send(());
        }
    }

    async fn write_pending(&mut self) -> Result<()> {
        for packet in self.dispatcher.flush() {
            trace!(to = packet.target().unwrap_or_default(), "Sending {:?}", packet.kind());
            write_frame(&mut self.stream, &packet).await?;
        }
        Ok(())
    }

    /// Decode every complete frame in `buf`. Only a fatal frame error is
    /// returned; everything else is reported as an event.
    fn drain_frames(&mut self, buf: &mut BytesMut) -> std::result::Result<(), FrameError> {
        loop {
            match try_read_frame(buf) {
                Ok(Some(packet)) => self.handle_packet(packet),
                Ok(None) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Dropping remote-control frame: {}", e);
                    self.emit(ClientEvent::Error(e.to_string()));
                }
            }
        }
    }

    fn handle_packet(&mut self, packet: Packet) {
        match self.dispatcher.dispatch(packet) {
            Inbound::Resolved => {}
            Inbound::Unsolicited(packet) => {
                trace!("Notification {:?} from {:?}", packet.kind(), packet.sender());
                self.emit(ClientEvent::Message(packet));
            }
            Inbound::MissingFrom(packet) => {
                self.emit(ClientEvent::Error(format!(
                    "packet without `from`: {}",
                    serde_json::Value::Object(packet.into_map())
                )));
            }
            Inbound::Unexpected(packet) => {
                let from = packet.sender().unwrap_or_default().to_string();
                warn!("Unexpected packet from {} with no request in flight", from);
                self.emit(ClientEvent::Error(format!(
                    "unexpected message from {}: {}",
                    from,
                    serde_json::Value::Object(packet.into_map())
                )));
            }
        }
    }

    async fn close(&mut self, reason: &str) {
        self.state.send_replace(ConnectionState::Closed);
        let _ = self.stream.shutdown().await;
        self.commands.close();

        let mut rejected = self.dispatcher.reject_all(reason);
        // Requests that raced with the close.
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Request { reply, .. } => {
                    let _ = reply.send(Err(HarnessError::connection(reason)));
                    rejected += 1;
                }
                Command::Disconnect { done } => {
                    let _ = done.send(());
                }
                Command::Abandon { .. } => {}
            }
        }
        debug!("Remote-control connection closed, {} requests rejected", rejected);
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
