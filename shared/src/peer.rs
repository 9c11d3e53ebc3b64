//! One connection to one remote endpoint.
//!
//! A [`PeerConnection`] owns the connection's state machine and a background receive
//! loop. The loop takes datagrams routed to it by the [`Host`], runs the handshake,
//! acknowledges and reorders reliable frames, resends what the peer has not confirmed,
//! and pushes every application frame into the shared [`PacketQueue`]. Payloads larger
//! than one datagram are sent as fragments and reassembled before they are queued.
//!
//! ```text
//! Disconnected -> Connecting -> Established -> Disconnecting -> Disconnected
//! ```
//!
//! Loss of the peer (silence, exhausted retransmits, a remote hang-up) is reported as a
//! [`NetEvent::Disconnected`] item in the queue. Nothing is ever thrown across the task
//! boundary.

use crate::config::NetConfig;
use crate::fragment::{self, Reassembler, MAX_PAYLOAD};
use crate::host::{ConnectRequest, Host, Route, RouteTable};
use crate::queue::{NetEvent, PacketQueue, QueueItem};
use crate::reliable::{ReliableChannel, RetransmitExhausted};
use crate::transport::{DatagramSink, Fragment, Frame, Reliability};
use bytes::Bytes;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Established,
    Disconnecting,
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("connection attempt timed out")]
    Timeout,
    #[error("connection refused by the server")]
    Refused,
    #[error("transport failure: {0}")]
    TransportFailure(#[from] io::Error),
    #[error("not connected")]
    NotConnected,
    #[error("unknown peer {0}")]
    UnknownPeer(u32),
    #[error("payload of {0} bytes exceeds the largest sendable payload")]
    PayloadTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

enum Flow {
    Continue,
    Stop,
}

/// State shared between the connection handle and its receive loop.
struct Link {
    peer_id: u32,
    remote: SocketAddr,
    token: u64,
    role: Role,
    sink: Arc<dyn DatagramSink>,
    queue: Arc<PacketQueue>,
    config: NetConfig,
    state: watch::Sender<ConnectionState>,
    reliable: Mutex<ReliableChannel>,
    refused: AtomicBool,
    last_sent: Mutex<Instant>,
    next_group: AtomicU32,
    reliable_parts: Mutex<Reassembler>,
    unreliable_parts: Mutex<Reassembler>,
}

impl Link {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Moves from `from` to `to`; does nothing if the state has changed meanwhile.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn send_frame(&self, frame: &Frame) -> io::Result<()> {
        self.sink.send_datagram(&frame.encode(), self.remote)?;
        *self.last_sent.lock() = Instant::now();
        Ok(())
    }

    fn send_or_log(&self, frame: &Frame) {
        if let Err(e) = self.send_frame(frame) {
            debug!("Failed to send {:?} to {}: {}", frame, self.remote, e);
        }
    }

    fn push(&self, event: NetEvent) {
        if !self.queue.push(QueueItem::new(self.peer_id, self.remote, event)) {
            debug!("Queue closed, dropping event from {}", self.remote);
        }
    }

    /// Whether losing the connection from `previous` is news to the consumer.
    fn reports_loss(&self, previous: ConnectionState) -> bool {
        match previous {
            ConnectionState::Established => true,
            ConnectionState::Connecting => self.role == Role::Server,
            _ => false,
        }
    }

    fn lose(&self, reason: &str) {
        let previous = self.state.send_replace(ConnectionState::Disconnected);
        if previous == ConnectionState::Disconnected {
            return;
        }
        warn!("Lost connection to {}: {}", self.remote, reason);
        if self.reports_loss(previous) {
            self.push(NetEvent::Disconnected);
        }
    }

    fn promote(&self) {
        if self.transition(ConnectionState::Connecting, ConnectionState::Established) {
            info!("Connection to {} established", self.remote);
        }
    }

    fn deliver(&self, payload: Bytes) {
        if self.state() == ConnectionState::Established {
            self.push(NetEvent::Received(payload));
        }
    }

    fn deliver_piece(&self, parts: &Mutex<Reassembler>, fragment: Option<Fragment>, payload: Bytes) {
        match fragment {
            None => self.deliver(payload),
            Some(fragment) => {
                let whole = parts.lock().insert(fragment, payload, Instant::now());
                if let Some(whole) = whole {
                    self.deliver(whole);
                }
            }
        }
    }

    fn handle_datagram(&self, datagram: Bytes) -> Flow {
        let frame = match Frame::decode(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Dropping malformed frame from {}: {}", self.remote, e);
                return Flow::Continue;
            }
        };

        match frame {
            Frame::Connect { token } => {
                // our accept got lost
                if self.role == Role::Server && token == self.token {
                    self.send_or_log(&Frame::Accept { token });
                }
            }
            Frame::Accept { token } => {
                if self.role == Role::Client && token == self.token {
                    self.promote();
                    self.send_or_log(&Frame::Verify);
                }
            }
            Frame::Refuse { token } => {
                if self.role == Role::Client
                    && token == self.token
                    && self.state() == ConnectionState::Connecting
                {
                    self.refused.store(true, Ordering::Release);
                    self.state.send_replace(ConnectionState::Disconnected);
                    return Flow::Stop;
                }
            }
            // the client pings and acks once it is established, so these stand in
            // for a lost Verify
            Frame::Verify | Frame::Ping => self.promote(),
            Frame::Reliable {
                seq,
                fragment,
                payload,
            } => {
                self.promote();
                let released = self.reliable.lock().receive(seq, (fragment, payload));
                if let Some(pieces) = released {
                    self.send_or_log(&Frame::Ack { seq });
                    for (fragment, payload) in pieces {
                        self.deliver_piece(&self.reliable_parts, fragment, payload);
                    }
                }
            }
            Frame::Unreliable { fragment, payload } => {
                self.promote();
                self.deliver_piece(&self.unreliable_parts, fragment, payload);
            }
            Frame::Ack { seq } => {
                self.promote();
                self.reliable.lock().acknowledge(seq);
            }
            Frame::Disconnect => {
                self.send_or_log(&Frame::DisconnectAck);
                let previous = self.state.send_replace(ConnectionState::Disconnected);
                info!("{} disconnected", self.remote);
                if self.reports_loss(previous) {
                    self.push(NetEvent::Disconnected);
                }
                return Flow::Stop;
            }
            Frame::DisconnectAck => {
                if self.transition(ConnectionState::Disconnecting, ConnectionState::Disconnected) {
                    return Flow::Stop;
                }
            }
        }

        Flow::Continue
    }

    /// Timers: idle timeout, handshake resends, retransmits and keep-alive.
    fn service(&self, last_heard: Instant, last_control: &mut Instant) -> Flow {
        let now = Instant::now();
        let config = &self.config;

        if now.duration_since(last_heard) >= config.peer_timeout {
            self.lose("timed out");
            return Flow::Stop;
        }

        if now.duration_since(*last_control) >= config.resend_interval {
            match self.state() {
                ConnectionState::Connecting if self.role == Role::Client => {
                    self.send_or_log(&Frame::Connect { token: self.token });
                    *last_control = now;
                }
                ConnectionState::Disconnecting => {
                    self.send_or_log(&Frame::Disconnect);
                    *last_control = now;
                }
                _ => {}
            }
        }

        let due = self.reliable.lock().due_for_resend(
            now,
            config.resend_interval,
            config.max_retransmits,
        );
        match due {
            Ok(frames) => {
                for frame in &frames {
                    self.send_or_log(frame);
                }
            }
            Err(RetransmitExhausted { seq }) => {
                self.lose(&format!("reliable frame {} never acknowledged", seq));
                return Flow::Stop;
            }
        }

        self.unreliable_parts
            .lock()
            .expire(now, config.fragment_timeout);

        let idle = now.duration_since(*self.last_sent.lock());
        if self.state() == ConnectionState::Established && idle >= config.keepalive_interval {
            self.send_or_log(&Frame::Ping);
        }

        Flow::Continue
    }
}

async fn receive_loop(
    link: Arc<Link>,
    mut inbound: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_heard = Instant::now();
    let mut last_control = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = timeout(link.config.service_timeout, inbound.recv()) => match received {
                Ok(Some(datagram)) => {
                    last_heard = Instant::now();
                    if let Flow::Stop = link.handle_datagram(datagram) {
                        break;
                    }
                }
                Ok(None) => {
                    link.lose("socket closed");
                    break;
                }
                Err(_) => {}
            },
        }

        if let Flow::Stop = link.service(last_heard, &mut last_control) {
            break;
        }
    }

    debug!("Receive loop for {} stopped", link.remote);
}

struct Running {
    link: Arc<Link>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    // unregisters the remote address on drop
    _route: Route,
}

pub struct PeerConnection {
    routes: RouteTable,
    sink: Arc<dyn DatagramSink>,
    queue: Arc<PacketQueue>,
    config: NetConfig,
    peer_id: u32,
    running: Option<Running>,
}

impl PeerConnection {
    /// A disconnected connection on `host` that reports into `queue`.
    pub fn new(host: &Host, queue: Arc<PacketQueue>, config: NetConfig) -> Self {
        Self {
            routes: host.routes().clone(),
            sink: host.sink(),
            queue,
            config,
            peer_id: 0,
            running: None,
        }
    }

    /// Sends through `sink` instead of the host's socket.
    pub fn with_sink(mut self, sink: Arc<dyn DatagramSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Connects to a server, waiting at most `connect_timeout` for its answer.
    ///
    /// An active connection is closed first. On failure the connection is left
    /// `Disconnected` and can be used for another attempt.
    pub async fn connect(&mut self, addr: SocketAddr) -> Result<(), ConnError> {
        if self.running.is_some() {
            self.disconnect().await;
        }

        let token = rand::random::<u64>();
        info!("Connecting to {}...", addr);
        let link = self.start(addr, token, Role::Client);
        let mut state = link.state.subscribe();

        match link.send_frame(&Frame::Connect { token }) {
            Ok(()) => {}
            // the receive loop resends Connect every resend_interval
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("Socket busy, first connect to {} deferred", addr);
            }
            Err(e) => {
                self.stop().await;
                return Err(e.into());
            }
        }

        let outcome = timeout(
            self.config.connect_timeout,
            state.wait_for(|state| *state != ConnectionState::Connecting),
        )
        .await
        .map(|changed| changed.map(|state| *state));

        match outcome {
            Ok(Ok(ConnectionState::Established)) => Ok(()),
            Ok(_) if link.refused.load(Ordering::Acquire) => {
                warn!("{} refused the connection", addr);
                self.stop().await;
                Err(ConnError::Refused)
            }
            _ => {
                warn!("No answer from {} within {:?}", addr, self.config.connect_timeout);
                self.stop().await;
                Err(ConnError::Timeout)
            }
        }
    }

    /// Takes over a connection request surfaced by the host and answers it.
    ///
    /// The connection starts out `Connecting` and becomes `Established` once the
    /// client confirms. Payloads can be sent right away.
    pub fn accept(&mut self, request: ConnectRequest, peer_id: u32) {
        self.reset();
        self.peer_id = peer_id;

        let link = self.start(request.addr, request.token, Role::Server);
        link.send_or_log(&Frame::Accept {
            token: request.token,
        });
    }

    fn start(&mut self, addr: SocketAddr, token: u64, role: Role) -> Arc<Link> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let link = Arc::new(Link {
            peer_id: self.peer_id,
            remote: addr,
            token,
            role,
            sink: Arc::clone(&self.sink),
            queue: Arc::clone(&self.queue),
            config: self.config.clone(),
            state,
            reliable: Mutex::new(ReliableChannel::new()),
            refused: AtomicBool::new(false),
            last_sent: Mutex::new(Instant::now()),
            next_group: AtomicU32::new(0),
            reliable_parts: Mutex::new(Reassembler::new()),
            unreliable_parts: Mutex::new(Reassembler::new()),
        });

        let (route, inbound) = self.routes.register(addr, token);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(receive_loop(Arc::clone(&link), inbound, shutdown_rx));

        self.running = Some(Running {
            link: Arc::clone(&link),
            shutdown,
            task,
            _route: route,
        });
        link
    }

    /// Sends one application frame, split into fragments if it does not fit in a
    /// datagram.
    pub fn send(&self, payload: Bytes, reliability: Reliability) -> Result<(), ConnError> {
        let link = match &self.running {
            Some(running) => &running.link,
            None => return Err(ConnError::NotConnected),
        };
        match link.state() {
            ConnectionState::Connecting | ConnectionState::Established => {}
            _ => return Err(ConnError::NotConnected),
        }

        if payload.len() > MAX_PAYLOAD {
            return Err(ConnError::PayloadTooLarge(payload.len()));
        }

        let group = link.next_group.fetch_add(1, Ordering::Relaxed);
        let pieces = fragment::split(payload, group);
        let frames: Vec<Frame> = match reliability {
            Reliability::Reliable => {
                let mut channel = link.reliable.lock();
                let now = Instant::now();
                pieces
                    .into_iter()
                    .map(|piece| channel.prepare(piece, now))
                    .collect()
            }
            Reliability::Unreliable => pieces
                .into_iter()
                .map(|(fragment, payload)| Frame::Unreliable { fragment, payload })
                .collect(),
        };

        for frame in &frames {
            match link.send_frame(frame) {
                Ok(()) => {}
                // reliable frames are retried by the loop, unreliable ones may be dropped
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    debug!("Socket busy, {:?} send to {} deferred", reliability, link.remote);
                    if reliability == Reliability::Unreliable {
                        return Ok(());
                    }
                }
                Err(e) => return Err(ConnError::TransportFailure(e)),
            }
        }
        Ok(())
    }

    pub fn send_reliable(&self, payload: Bytes) -> Result<(), ConnError> {
        self.send(payload, Reliability::Reliable)
    }

    pub fn send_unreliable(&self, payload: Bytes) -> Result<(), ConnError> {
        self.send(payload, Reliability::Unreliable)
    }

    /// Gracefully closes the connection.
    ///
    /// Sends a disconnect and waits up to `disconnect_timeout` for the peer to confirm,
    /// then stops the receive loop and waits for it to exit. If the peer never answers
    /// the connection is reset anyway.
    pub async fn disconnect(&mut self) {
        let link = match &self.running {
            Some(running) => Arc::clone(&running.link),
            None => return,
        };

        let closing = link.transition(ConnectionState::Established, ConnectionState::Disconnecting)
            || link.transition(ConnectionState::Connecting, ConnectionState::Disconnecting);

        if closing {
            debug!("Disconnecting from {}", link.remote);
            link.send_or_log(&Frame::Disconnect);

            let mut state = link.state.subscribe();
            let confirmed = timeout(
                self.config.disconnect_timeout,
                state.wait_for(|state| *state == ConnectionState::Disconnected),
            )
            .await
            .map(|changed| changed.is_ok())
            .unwrap_or(false);

            if confirmed {
                info!("Disconnected from {}", link.remote);
            } else {
                warn!("{} did not confirm the disconnect, resetting", link.remote);
            }
        }

        self.stop().await;
    }

    /// Stops the receive loop and waits for it.
    async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown.send_replace(true);
            if let Err(e) = running.task.await {
                error!("Receive loop for {} failed: {}", running.link.remote, e);
            }
            running.link.state.send_replace(ConnectionState::Disconnected);
        }
    }

    /// Drops the connection without telling the peer.
    pub fn reset(&mut self) {
        if let Some(running) = self.running.take() {
            running.task.abort();
            running.link.state.send_replace(ConnectionState::Disconnected);
        }
    }

    /// Next item from this connection's queue, without waiting.
    pub fn poll(&self) -> Option<QueueItem> {
        self.queue.try_pop()
    }

    pub fn state(&self) -> ConnectionState {
        match &self.running {
            Some(running) => running.link.state(),
            None => ConnectionState::Disconnected,
        }
    }

    /// The id stamped on queue items; 0 on the client side.
    pub fn peer_id(&self) -> u32 {
        self.peer_id
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.link.remote)
    }

    pub fn token(&self) -> Option<u64> {
        self.running.as_ref().map(|running| running.link.token)
    }

    /// Whether a receive loop task is still alive.
    pub fn is_receiving(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    pub fn queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.reset();
    }
}
