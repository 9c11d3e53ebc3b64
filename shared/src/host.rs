//! UDP socket ownership and datagram routing.
//!
//! A [`Host`] binds one socket and runs a reader task that hands each datagram to the
//! connection registered for its source address. Datagrams from unknown addresses are
//! dropped, except `Connect` frames, which a listening host surfaces as
//! [`ConnectRequest`]s for the server to accept or refuse.

use crate::transport::{DatagramSink, Frame};
use bytes::Bytes;
use log::{debug, error, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

/// A `Connect` frame from an address with no live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub addr: SocketAddr,
    pub token: u64,
}

struct RouteEntry {
    id: u64,
    token: u64,
    sender: mpsc::UnboundedSender<Bytes>,
}

#[derive(Clone, Default)]
pub(crate) struct RouteTable {
    entries: Arc<Mutex<HashMap<SocketAddr, RouteEntry>>>,
    next_id: Arc<AtomicU64>,
}

impl RouteTable {
    /// Routes datagrams from `addr` to the returned receiver until the [`Route`] drops.
    pub(crate) fn register(
        &self,
        addr: SocketAddr,
        token: u64,
    ) -> (Route, mpsc::UnboundedReceiver<Bytes>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(addr, RouteEntry { id, token, sender });

        let route = Route {
            table: self.clone(),
            addr,
            id,
        };
        (route, receiver)
    }
}

/// Registration of one remote address; unregisters itself on drop.
pub(crate) struct Route {
    table: RouteTable,
    addr: SocketAddr,
    id: u64,
}

impl Drop for Route {
    fn drop(&mut self) {
        let mut entries = self.table.entries.lock();
        // a newer connection may have taken over the address
        if entries.get(&self.addr).is_some_and(|entry| entry.id == self.id) {
            entries.remove(&self.addr);
        }
    }
}

pub struct Host {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    routes: RouteTable,
    requests: Option<mpsc::UnboundedReceiver<ConnectRequest>>,
    shutdown: watch::Sender<bool>,
    reader: Option<JoinHandle<()>>,
}

impl Host {
    /// Binds a host that only talks to addresses it connects to itself.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Self::bind_inner(addr, false).await
    }

    /// Binds a host that also surfaces connection requests from unknown addresses.
    pub async fn listen(addr: SocketAddr) -> io::Result<Self> {
        Self::bind_inner(addr, true).await
    }

    async fn bind_inner(addr: SocketAddr, listening: bool) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        // sends use try_send_to, which fails until the reactor has seen the socket
        socket.writable().await?;
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr()?;
        let routes = RouteTable::default();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let (request_tx, requests) = if listening {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let reader = tokio::spawn(run_reader(
            Arc::clone(&socket),
            routes.clone(),
            request_tx,
            shutdown_rx,
        ));

        if listening {
            info!("Listening on {}", local_addr);
        } else {
            debug!("Bound client socket on {}", local_addr);
        }

        Ok(Self {
            socket,
            local_addr,
            routes,
            requests,
            shutdown,
            reader: Some(reader),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The socket as a datagram sink, for connections created on this host.
    pub fn sink(&self) -> Arc<dyn DatagramSink> {
        self.socket.clone()
    }

    pub(crate) fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Next pending connection request, if any. Never waits.
    pub fn poll_request(&mut self) -> Option<ConnectRequest> {
        self.requests.as_mut()?.try_recv().ok()
    }

    /// Stops the reader task and waits for it to finish.
    pub async fn close(mut self) {
        self.shutdown.send_replace(true);
        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.await {
                error!("Socket reader for {} failed: {}", self.local_addr, e);
            }
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn run_reader(
    socket: Arc<UdpSocket>,
    routes: RouteTable,
    requests: Option<mpsc::UnboundedSender<ConnectRequest>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = socket.recv_from(&mut buffer) => match result {
                Ok((len, addr)) => {
                    let datagram = Bytes::copy_from_slice(&buffer[..len]);
                    route_datagram(&socket, &routes, requests.as_ref(), datagram, addr);
                }
                Err(e) => {
                    // ICMP port-unreachable surfaces here on some platforms
                    debug!("Error receiving datagram: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
        }
    }

    debug!("Socket reader stopped");
}

fn route_datagram(
    socket: &UdpSocket,
    routes: &RouteTable,
    requests: Option<&mpsc::UnboundedSender<ConnectRequest>>,
    datagram: Bytes,
    addr: SocketAddr,
) {
    let connect_token = Frame::peek_connect(&datagram);

    let datagram = {
        let entries = routes.entries.lock();
        match entries.get(&addr) {
            Some(entry) => {
                // a connect with a new token is a fresh session from a reused address
                let fresh_session = connect_token.is_some_and(|token| token != entry.token);
                if fresh_session && requests.is_some() {
                    datagram
                } else {
                    match entry.sender.send(datagram) {
                        Ok(()) => return,
                        // the receive loop already stopped
                        Err(mpsc::error::SendError(datagram)) => datagram,
                    }
                }
            }
            None => datagram,
        }
    };

    match (connect_token, requests) {
        (Some(token), Some(requests)) => {
            if requests.send(ConnectRequest { addr, token }).is_err() {
                debug!("Dropping connection request from {}", addr);
            }
        }
        _ => {
            // let a peer whose connection already ended finish its disconnect
            if Frame::decode(datagram) == Ok(Frame::Disconnect) {
                if let Err(e) = socket.send_datagram(&Frame::DisconnectAck.encode(), addr) {
                    debug!("Failed to confirm disconnect of {}: {}", addr, e);
                }
            } else {
                debug!("Ignoring datagram from inactive address {}", addr);
            }
        }
    }
}
