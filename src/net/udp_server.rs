use std::collections::HashMap;
use std::io;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use log::{trace, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::buf::{DataChunk, SharedBuf};
use crate::error::{Error, StatusCode};
use crate::event_loop::{DeadlineKind, EventLoop};
use crate::handle::{Handle, HandleId, HandleKind};
use crate::net::udp_peer::{self, UdpPeer, UdpPeerState};
use crate::net::Endpoint;
use crate::sys;
use crate::token::Token;

/// UDP server handle.
///
/// Incoming datagrams are attributed to [`UdpPeer`]s. With an inactivity
/// timeout configured, peers are cached by source endpoint: datagrams
/// arriving within the window reach the same peer instance, and silence
/// beyond it fires the timeout callback and evicts the peer. Without a
/// timeout every datagram synthesizes a transient peer.
///
/// # Examples
///
/// ```no_run
/// use evio::{EventLoop, UdpServer, Endpoint};
///
/// let mut lp = EventLoop::new().unwrap();
/// let server = UdpServer::new(&mut lp);
/// server
///     .start_receive(&mut lp, Endpoint::new("0.0.0.0", 31541), |lp, peer, chunk, _error| {
///         peer.send_data(lp, chunk.as_slice());
///     })
///     .unwrap();
/// lp.run().unwrap();
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UdpServer {
    id: HandleId,
}

type DataReceivedCallback = Box<dyn FnMut(&mut EventLoop, UdpPeer, &DataChunk, &Error)>;
type NewPeerCallback = Box<dyn FnMut(&mut EventLoop, UdpPeer, &Error)>;
type PeerTimeoutCallback = Box<dyn FnMut(&mut EventLoop, UdpPeer, &Error)>;
type CloseServerCallback = Box<dyn FnOnce(&mut EventLoop, UdpServer, &Error)>;
type SendCompletion = Box<dyn FnOnce(&mut EventLoop, &Error)>;

pub(crate) struct UdpServerState {
    socket: Option<Socket>,
    endpoint: Endpoint,
    data_callback: Option<DataReceivedCallback>,
    new_peer_callback: Option<NewPeerCallback>,
    timeout_callback: Option<PeerTimeoutCallback>,
    timeout_ms: u64,
    peers: HashMap<Endpoint, Token>,
    // Closed peers whose datagrams are dropped until the stored deadline.
    graveyard: HashMap<Endpoint, Instant>,
}

impl UdpServerState {
    fn new() -> UdpServerState {
        UdpServerState {
            socket: None,
            endpoint: Endpoint::Undefined,
            data_callback: None,
            new_peer_callback: None,
            timeout_callback: None,
            timeout_ms: 0,
            peers: HashMap::new(),
            graveyard: HashMap::new(),
        }
    }

    fn tracking(&self) -> bool {
        self.timeout_ms > 0
    }

    pub(crate) fn is_active(&self) -> bool {
        self.socket.is_some()
    }
}

fn state_mut(lp: &mut EventLoop, token: Token) -> Option<&mut UdpServerState> {
    match lp.entry_mut(token) {
        Some(entry) => match &mut entry.kind {
            HandleKind::UdpServer(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

fn state_ref(lp: &EventLoop, id: HandleId) -> Option<&UdpServerState> {
    match lp.resolve_ref(id) {
        Some(entry) => match &entry.kind {
            HandleKind::UdpServer(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

pub(crate) fn server_at(lp: &EventLoop, token: Token) -> Option<UdpServer> {
    lp.gen_of(token).map(|gen| UdpServer {
        id: HandleId { token, gen },
    })
}

impl UdpServer {
    pub fn new(lp: &mut EventLoop) -> UdpServer {
        let id = lp.allocate_handle(HandleKind::UdpServer(UdpServerState::new()));
        UdpServer { id }
    }

    /// Binds `endpoint` and starts receiving. Every datagram synthesizes
    /// a transient peer; no identity is kept across datagrams.
    pub fn start_receive<D>(
        &self,
        lp: &mut EventLoop,
        endpoint: Endpoint,
        receive_callback: D,
    ) -> Result<(), Error>
    where
        D: FnMut(&mut EventLoop, UdpPeer, &DataChunk, &Error) + 'static,
    {
        start_receive_impl(lp, self.id, endpoint, None, Box::new(receive_callback), 0, None)
    }

    /// Binds `endpoint` and starts receiving with peer tracking: peers are
    /// cached by source endpoint and evicted after `timeout_ms` of
    /// silence, firing `timeout_callback`.
    pub fn start_receive_with_timeout<D, T>(
        &self,
        lp: &mut EventLoop,
        endpoint: Endpoint,
        receive_callback: D,
        timeout_ms: u64,
        timeout_callback: T,
    ) -> Result<(), Error>
    where
        D: FnMut(&mut EventLoop, UdpPeer, &DataChunk, &Error) + 'static,
        T: FnMut(&mut EventLoop, UdpPeer, &Error) + 'static,
    {
        start_receive_impl(
            lp,
            self.id,
            endpoint,
            None,
            Box::new(receive_callback),
            timeout_ms,
            Some(Box::new(timeout_callback)),
        )
    }

    /// Like [`start_receive_with_timeout`], additionally firing
    /// `new_peer_callback` when a datagram arrives from an unknown source.
    ///
    /// [`start_receive_with_timeout`]: UdpServer::start_receive_with_timeout
    pub fn start_receive_with_new_peer<N, D, T>(
        &self,
        lp: &mut EventLoop,
        endpoint: Endpoint,
        new_peer_callback: N,
        receive_callback: D,
        timeout_ms: u64,
        timeout_callback: T,
    ) -> Result<(), Error>
    where
        N: FnMut(&mut EventLoop, UdpPeer, &Error) + 'static,
        D: FnMut(&mut EventLoop, UdpPeer, &DataChunk, &Error) + 'static,
        T: FnMut(&mut EventLoop, UdpPeer, &Error) + 'static,
    {
        start_receive_impl(
            lp,
            self.id,
            endpoint,
            Some(Box::new(new_peer_callback)),
            Box::new(receive_callback),
            timeout_ms,
            Some(Box::new(timeout_callback)),
        )
    }

    /// Stops receiving, evicts every peer and reports to `callback`.
    pub fn close<F>(&self, lp: &mut EventLoop, callback: F)
    where
        F: FnOnce(&mut EventLoop, UdpServer, &Error) + 'static,
    {
        close_impl(lp, self.id, Some(Box::new(callback)));
    }

    /// Endpoint the server is bound to; useful after binding port 0.
    pub fn endpoint(&self, lp: &EventLoop) -> Endpoint {
        state_ref(lp, self.id).map_or(Endpoint::Undefined, |s| s.endpoint)
    }

    pub fn receive_buffer_size(&self, lp: &EventLoop) -> Result<usize, Error> {
        let state = state_ref(lp, self.id).ok_or(Error::new(StatusCode::NotConnected))?;
        match &state.socket {
            Some(socket) => socket.recv_buffer_size().map_err(|e| Error::from(&e)),
            None => Err(Error::new(StatusCode::NotConnected)),
        }
    }

    pub fn send_buffer_size(&self, lp: &EventLoop) -> Result<usize, Error> {
        let state = state_ref(lp, self.id).ok_or(Error::new(StatusCode::NotConnected))?;
        match &state.socket {
            Some(socket) => socket.send_buffer_size().map_err(|e| Error::from(&e)),
            None => Err(Error::new(StatusCode::NotConnected)),
        }
    }

    pub fn set_receive_buffer_size(&self, lp: &mut EventLoop, size: usize) -> Result<(), Error> {
        if size == 0 {
            return Err(Error::new(StatusCode::InvalidArgument));
        }
        let state = state_ref(lp, self.id).ok_or(Error::new(StatusCode::NotConnected))?;
        match &state.socket {
            Some(socket) => socket.set_recv_buffer_size(size).map_err(|e| Error::from(&e)),
            None => Err(Error::new(StatusCode::NotConnected)),
        }
    }

    pub fn set_send_buffer_size(&self, lp: &mut EventLoop, size: usize) -> Result<(), Error> {
        if size == 0 {
            return Err(Error::new(StatusCode::InvalidArgument));
        }
        let state = state_ref(lp, self.id).ok_or(Error::new(StatusCode::NotConnected))?;
        match &state.socket {
            Some(socket) => socket.set_send_buffer_size(size).map_err(|e| Error::from(&e)),
            None => Err(Error::new(StatusCode::NotConnected)),
        }
    }
}

impl Handle for UdpServer {
    fn handle_id(&self) -> HandleId {
        self.id
    }
}

#[allow(clippy::too_many_arguments)]
fn start_receive_impl(
    lp: &mut EventLoop,
    id: HandleId,
    endpoint: Endpoint,
    new_peer_callback: Option<NewPeerCallback>,
    receive_callback: DataReceivedCallback,
    timeout_ms: u64,
    timeout_callback: Option<PeerTimeoutCallback>,
) -> Result<(), Error> {
    let token = id.token;
    if lp.resolve_ref(id).is_none() {
        return Err(Error::new(StatusCode::OperationOnClosedSocket));
    }
    if state_ref(lp, id).is_some_and(|s| s.socket.is_some()) {
        return Err(Error::new(StatusCode::OperationAlreadyInProgress));
    }
    if timeout_callback.is_some() && timeout_ms == 0 {
        return Err(Error::new(StatusCode::InvalidArgument));
    }

    let Some(addr) = endpoint.to_socket_addr() else {
        return Err(Error::with_context(
            StatusCode::InvalidArgument,
            endpoint.address_string(),
        ));
    };

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::from(&e))?;
    socket.set_nonblocking(true).map_err(|e| Error::from(&e))?;
    socket.bind(&addr.into()).map_err(|e| Error::from(&e))?;

    let bound = socket
        .local_addr()
        .ok()
        .and_then(|a| a.as_socket())
        .map_or(endpoint, Endpoint::from);

    lp.register_io(socket.as_raw_fd(), token, sys::Interest::READABLE)
        .map_err(|e| Error::from(&e))?;

    trace!("udp server receiving; token={:?}; endpoint={}", token, bound);

    let Some(state) = state_mut(lp, token) else {
        return Err(Error::new(StatusCode::OperationOnClosedSocket));
    };
    state.socket = Some(socket);
    state.endpoint = bound;
    state.data_callback = Some(receive_callback);
    state.new_peer_callback = new_peer_callback;
    state.timeout_callback = timeout_callback;
    state.timeout_ms = timeout_ms;
    Ok(())
}

fn close_impl(lp: &mut EventLoop, id: HandleId, callback: Option<CloseServerCallback>) {
    let token = id.token;
    let Some(server) = server_at(lp, token) else {
        return;
    };

    let receiving = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        match state.socket.take() {
            Some(socket) => {
                if let Err(e) = lp.deregister_io(socket.as_raw_fd()) {
                    trace!("deregister udp socket failed; token={:?}: {}", token, e);
                }
                true
            }
            None => false,
        }
    };

    if !receiving {
        if let Some(callback) = callback {
            lp.schedule_callback(move |lp| {
                callback(lp, server, &Error::new(StatusCode::NotConnected));
            });
        }
        return;
    }

    let peers: Vec<Token> = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        state.graveyard.clear();
        state.peers.drain().map(|(_, peer)| peer).collect()
    };
    for peer in peers {
        if let Some(peer_state) = udp_peer::state_mut(lp, peer) {
            peer_state.closed = true;
        }
        if let Some(gen) = lp.gen_of(peer) {
            lp.unref_handle_id(HandleId { token: peer, gen });
        }
    }

    trace!("udp server closed; token={:?}", token);
    if let Some(callback) = callback {
        lp.schedule_callback(move |lp| callback(lp, server, &Error::ok()));
    }
}

pub(crate) fn on_event(lp: &mut EventLoop, token: Token, event: sys::Event) {
    if !event.is_readable() {
        return;
    }

    loop {
        let fd = match state_mut(lp, token) {
            Some(state) => match &state.socket {
                Some(socket) => socket.as_raw_fd(),
                None => return,
            },
            None => return,
        };

        let (n, src) = match sys::unix::recv_from(fd, &mut lp.scratch) {
            Ok(received) => received,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("udp recv failed; token={:?}: {}", token, e);
                return;
            }
        };

        let source = Endpoint::from(src);
        let chunk = DataChunk::new(SharedBuf::from(&lp.scratch[..n]), 0);
        dispatch_datagram(lp, token, source, chunk);
    }
}

/// Attributes one received datagram to a peer and runs the callbacks.
fn dispatch_datagram(lp: &mut EventLoop, token: Token, source: Endpoint, chunk: DataChunk) {
    let now = Instant::now();

    // Closed peers keep their endpoint silenced for the graveyard window.
    let buried = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        match state.graveyard.get(&source) {
            Some(until) if *until > now => true,
            Some(_) => {
                state.graveyard.remove(&source);
                false
            }
            None => false,
        }
    };
    if buried {
        trace!("datagram from buried peer dropped; source={}", source);
        return;
    }

    let (tracking, existing) = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        (state.tracking(), state.peers.get(&source).copied())
    };

    if !tracking {
        // Transient peer: lives for this callback only.
        let peer_id = lp.allocate_handle(HandleKind::UdpPeer(UdpPeerState::new(token, source)));
        let Some(peer) = udp_peer::peer_at(lp, peer_id.token) else {
            return;
        };
        run_data_callback(lp, token, peer, &chunk);
        // Drop the creator reference; the peer survives only if the
        // callback took one.
        lp.unref_handle_id(peer_id);
        return;
    }

    match existing {
        Some(peer_token) => {
            if let Some(peer_state) = udp_peer::state_mut(lp, peer_token) {
                peer_state.last_packet_at = now;
            }
            if let Some(peer) = udp_peer::peer_at(lp, peer_token) {
                run_data_callback(lp, token, peer, &chunk);
            }
        }
        None => {
            let timeout_ms = match state_mut(lp, token) {
                Some(state) => state.timeout_ms,
                None => return,
            };
            let peer_id = lp.allocate_handle(HandleKind::UdpPeer(UdpPeerState::new(token, source)));
            if let Some(state) = state_mut(lp, token) {
                state.peers.insert(source, peer_id.token);
            }
            let seq = lp.arm_deadline(
                now + Duration::from_millis(timeout_ms),
                peer_id.token,
                DeadlineKind::UdpPeerTimeout,
            );
            if let Some(peer_state) = udp_peer::state_mut(lp, peer_id.token) {
                peer_state.deadline_seq = seq;
            }
            trace!("new udp peer; server={:?}; source={}", token, source);

            let Some(peer) = udp_peer::peer_at(lp, peer_id.token) else {
                return;
            };
            run_new_peer_callback(lp, token, peer);
            run_data_callback(lp, token, peer, &chunk);
        }
    }
}

fn run_data_callback(lp: &mut EventLoop, server: Token, peer: UdpPeer, chunk: &DataChunk) {
    let callback = state_mut(lp, server).and_then(|s| s.data_callback.take());
    if let Some(mut callback) = callback {
        callback(lp, peer, chunk, &Error::ok());
        if let Some(state) = state_mut(lp, server) {
            if state.data_callback.is_none() {
                state.data_callback = Some(callback);
            }
        }
    }
}

fn run_new_peer_callback(lp: &mut EventLoop, server: Token, peer: UdpPeer) {
    let callback = state_mut(lp, server).and_then(|s| s.new_peer_callback.take());
    if let Some(mut callback) = callback {
        callback(lp, peer, &Error::ok());
        if let Some(state) = state_mut(lp, server) {
            if state.new_peer_callback.is_none() {
                state.new_peer_callback = Some(callback);
            }
        }
    }
}

/// A peer's inactivity deadline matured: evict it, or re-arm if a
/// datagram refreshed it in the meantime.
pub(crate) fn on_peer_deadline(lp: &mut EventLoop, peer_token: Token, seq: u64) {
    let (server, endpoint, last_packet_at) = {
        let Some(peer_state) = udp_peer::state_mut(lp, peer_token) else {
            return;
        };
        if peer_state.closed || peer_state.deadline_seq != seq {
            return;
        }
        (
            peer_state.server,
            peer_state.endpoint,
            peer_state.last_packet_at,
        )
    };

    let timeout = match state_mut(lp, server) {
        Some(state) if state.socket.is_some() => Duration::from_millis(state.timeout_ms),
        _ => return,
    };

    let elapsed = last_packet_at.elapsed();
    if elapsed < timeout {
        // Refreshed by traffic; push the deadline out to the remainder.
        let seq = lp.arm_deadline(
            last_packet_at + timeout,
            peer_token,
            DeadlineKind::UdpPeerTimeout,
        );
        if let Some(peer_state) = udp_peer::state_mut(lp, peer_token) {
            peer_state.deadline_seq = seq;
        }
        return;
    }

    trace!(
        "udp peer timed out; server={:?}; endpoint={}",
        server,
        endpoint
    );

    if let Some(state) = state_mut(lp, server) {
        state.peers.remove(&endpoint);
    }
    if let Some(peer_state) = udp_peer::state_mut(lp, peer_token) {
        peer_state.closed = true;
    }

    let Some(peer) = udp_peer::peer_at(lp, peer_token) else {
        return;
    };
    let callback = state_mut(lp, server).and_then(|s| s.timeout_callback.take());
    if let Some(mut callback) = callback {
        callback(lp, peer, &Error::ok());
        if let Some(state) = state_mut(lp, server) {
            if state.timeout_callback.is_none() {
                state.timeout_callback = Some(callback);
            }
        }
    }

    if let Some(gen) = lp.gen_of(peer_token) {
        lp.unref_handle_id(HandleId {
            token: peer_token,
            gen,
        });
    }
}

/// Moves a closed peer's endpoint into the graveyard for `window_ms`.
pub(crate) fn bury_peer(
    lp: &mut EventLoop,
    server: Token,
    endpoint: Endpoint,
    window_ms: u64,
) {
    let until = Instant::now() + Duration::from_millis(window_ms);
    let Some(state) = state_mut(lp, server) else {
        return;
    };
    state.peers.remove(&endpoint);
    state.graveyard.insert(endpoint, until);
    lp.arm_deadline(until, server, DeadlineKind::UdpGraveyard(endpoint));
}

/// Purges an expired graveyard entry.
pub(crate) fn on_graveyard_deadline(lp: &mut EventLoop, server: Token, endpoint: Endpoint) {
    let now = Instant::now();
    if let Some(state) = state_mut(lp, server) {
        if state.graveyard.get(&endpoint).is_some_and(|until| *until <= now) {
            state.graveyard.remove(&endpoint);
        }
    }
}

/// Sends one datagram through the server's socket, retrying on a full
/// kernel buffer.
pub(crate) fn send_datagram(
    lp: &mut EventLoop,
    server: Token,
    target: Endpoint,
    buf: SharedBuf,
    completion: SendCompletion,
) {
    let Some(addr) = target.to_socket_addr() else {
        lp.schedule_callback(move |lp| {
            completion(lp, &Error::new(StatusCode::InvalidArgument));
        });
        return;
    };

    let result = {
        let Some(state) = state_mut(lp, server) else {
            lp.schedule_callback(move |lp| {
                completion(lp, &Error::new(StatusCode::NotConnected));
            });
            return;
        };
        match &state.socket {
            Some(socket) => socket.send_to(&buf, &addr.into()),
            None => {
                lp.schedule_callback(move |lp| {
                    completion(lp, &Error::new(StatusCode::NotConnected));
                });
                return;
            }
        }
    };

    match result {
        Ok(_) => {
            lp.schedule_callback(move |lp| completion(lp, &Error::ok()));
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
            // Kernel send buffer is full; retry next cycle.
            lp.schedule_callback(move |lp| send_datagram(lp, server, target, buf, completion));
        }
        Err(e) => {
            let error = Error::from(&e);
            lp.schedule_callback(move |lp| completion(lp, &error));
        }
    }
}

pub(crate) fn teardown(lp: &mut EventLoop, token: Token) {
    let Some(server) = server_at(lp, token) else {
        return;
    };
    close_impl(lp, server.id, None);
}
