use std::os::fd::AsRawFd;

use log::{trace, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::buf::DataChunk;
use crate::error::{Error, StatusCode};
use crate::event_loop::EventLoop;
use crate::handle::{Handle, HandleId, HandleKind};
use crate::net::tcp_conn::{self, TcpConnectedClient};
use crate::net::Endpoint;
use crate::sys;
use crate::token::Token;

pub(crate) const DEFAULT_BACKLOG: i32 = 128;

/// Listening TCP server.
///
/// One `listen` is permitted per server between closes. Each accepted
/// connection is surfaced as a [`TcpConnectedClient`]; its reads start
/// automatically and deliver to the server-wide data callback.
///
/// # Examples
///
/// ```no_run
/// use evio::{EventLoop, TcpServer, Endpoint};
///
/// let mut lp = EventLoop::new().unwrap();
/// let server = TcpServer::new(&mut lp);
/// server
///     .listen(
///         &mut lp,
///         Endpoint::new("127.0.0.1", 31540),
///         |_lp, _client, error| assert!(error.is_ok()),
///         |lp, client, chunk, _error| {
///             // Echo.
///             client.send_data(lp, chunk.as_slice());
///         },
///         |_lp, _client, _error| {},
///     )
///     .unwrap();
/// lp.run().unwrap();
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TcpServer {
    id: HandleId,
}

pub(crate) type NewConnectionCallback =
    Box<dyn FnMut(&mut EventLoop, TcpConnectedClient, &Error)>;
pub(crate) type ConnDataCallback =
    Box<dyn FnMut(&mut EventLoop, TcpConnectedClient, &DataChunk, &Error)>;
pub(crate) type CloseConnectionCallback =
    Box<dyn FnMut(&mut EventLoop, TcpConnectedClient, &Error)>;
type CloseServerCallback = Box<dyn FnOnce(&mut EventLoop, TcpServer, &Error)>;

pub(crate) struct TcpServerState {
    socket: Option<Socket>,
    endpoint: Endpoint,
    pub(crate) new_connection_callback: Option<NewConnectionCallback>,
    pub(crate) data_callback: Option<ConnDataCallback>,
    pub(crate) close_connection_callback: Option<CloseConnectionCallback>,
    pub(crate) clients: Vec<Token>,
    pub(crate) shutting_down: bool,
    shutdown_callback: Option<CloseServerCallback>,
}

impl TcpServerState {
    fn new() -> TcpServerState {
        TcpServerState {
            socket: None,
            endpoint: Endpoint::Undefined,
            new_connection_callback: None,
            data_callback: None,
            close_connection_callback: None,
            clients: Vec::new(),
            shutting_down: false,
            shutdown_callback: None,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.socket.is_some() || !self.clients.is_empty()
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.socket.is_none() && self.clients.is_empty()
    }
}

pub(crate) fn state_mut(lp: &mut EventLoop, token: Token) -> Option<&mut TcpServerState> {
    match lp.entry_mut(token) {
        Some(entry) => match &mut entry.kind {
            HandleKind::TcpServer(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

fn state_ref(lp: &EventLoop, id: HandleId) -> Option<&TcpServerState> {
    match lp.resolve_ref(id) {
        Some(entry) => match &entry.kind {
            HandleKind::TcpServer(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

fn server_at(lp: &EventLoop, token: Token) -> Option<TcpServer> {
    lp.gen_of(token).map(|gen| TcpServer {
        id: HandleId { token, gen },
    })
}

impl TcpServer {
    pub(crate) fn from_id(id: HandleId) -> TcpServer {
        TcpServer { id }
    }

    pub fn new(lp: &mut EventLoop) -> TcpServer {
        let id = lp.allocate_handle(HandleKind::TcpServer(TcpServerState::new()));
        TcpServer { id }
    }

    /// Binds `endpoint` and starts accepting with the default backlog.
    pub fn listen<N, D, C>(
        &self,
        lp: &mut EventLoop,
        endpoint: Endpoint,
        new_connection_callback: N,
        data_callback: D,
        close_connection_callback: C,
    ) -> Result<(), Error>
    where
        N: FnMut(&mut EventLoop, TcpConnectedClient, &Error) + 'static,
        D: FnMut(&mut EventLoop, TcpConnectedClient, &DataChunk, &Error) + 'static,
        C: FnMut(&mut EventLoop, TcpConnectedClient, &Error) + 'static,
    {
        self.listen_with_backlog(
            lp,
            endpoint,
            new_connection_callback,
            data_callback,
            close_connection_callback,
            DEFAULT_BACKLOG,
        )
    }

    pub fn listen_with_backlog<N, D, C>(
        &self,
        lp: &mut EventLoop,
        endpoint: Endpoint,
        new_connection_callback: N,
        data_callback: D,
        close_connection_callback: C,
        backlog: i32,
    ) -> Result<(), Error>
    where
        N: FnMut(&mut EventLoop, TcpConnectedClient, &Error) + 'static,
        D: FnMut(&mut EventLoop, TcpConnectedClient, &DataChunk, &Error) + 'static,
        C: FnMut(&mut EventLoop, TcpConnectedClient, &Error) + 'static,
    {
        let token = self.id.token;
        if lp.resolve_ref(self.id).is_none() {
            return Err(Error::new(StatusCode::OperationOnClosedSocket));
        }
        if state_ref(lp, self.id).is_some_and(|s| s.socket.is_some()) {
            return Err(Error::new(StatusCode::ConnectionAlreadyInProgress));
        }

        let Some(addr) = endpoint.to_socket_addr() else {
            return Err(Error::with_context(
                StatusCode::InvalidArgument,
                endpoint.address_string(),
            ));
        };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::from(&e))?;
        socket.set_nonblocking(true).map_err(|e| Error::from(&e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| Error::from(&e))?;
        socket.bind(&addr.into()).map_err(|e| Error::from(&e))?;
        socket.listen(backlog).map_err(|e| Error::from(&e))?;

        // Re-read in case the caller bound port 0.
        let bound = socket
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .map_or(endpoint, Endpoint::from);

        lp.register_io(socket.as_raw_fd(), token, sys::Interest::READABLE)
            .map_err(|e| Error::from(&e))?;

        trace!("tcp server listening; token={:?}; endpoint={}", token, bound);

        let Some(state) = state_mut(lp, token) else {
            return Err(Error::new(StatusCode::OperationOnClosedSocket));
        };
        state.socket = Some(socket);
        state.endpoint = bound;
        state.new_connection_callback = Some(Box::new(new_connection_callback));
        state.data_callback = Some(Box::new(data_callback));
        state.close_connection_callback = Some(Box::new(close_connection_callback));
        state.shutting_down = false;
        Ok(())
    }

    /// Stops accepting, closes every connected client (each delivering its
    /// close callback), then reports to `callback`. On a server that is
    /// not listening the callback receives `NotConnected`.
    pub fn close<F>(&self, lp: &mut EventLoop, callback: F)
    where
        F: FnOnce(&mut EventLoop, TcpServer, &Error) + 'static,
    {
        close_impl(lp, self.id, Some(Box::new(callback)), false);
    }

    /// Like [`close`], but lets in-flight sends drain before closing each
    /// client.
    ///
    /// [`close`]: TcpServer::close
    pub fn shutdown<F>(&self, lp: &mut EventLoop, callback: F)
    where
        F: FnOnce(&mut EventLoop, TcpServer, &Error) + 'static,
    {
        close_impl(lp, self.id, Some(Box::new(callback)), true);
    }

    pub fn connected_clients_count(&self, lp: &EventLoop) -> usize {
        state_ref(lp, self.id).map_or(0, |s| s.clients.len())
    }

    /// Endpoint the server is bound to; useful after binding port 0.
    pub fn endpoint(&self, lp: &EventLoop) -> Endpoint {
        state_ref(lp, self.id).map_or(Endpoint::Undefined, |s| s.endpoint)
    }
}

impl Handle for TcpServer {
    fn handle_id(&self) -> HandleId {
        self.id
    }
}

fn close_impl(
    lp: &mut EventLoop,
    id: HandleId,
    callback: Option<CloseServerCallback>,
    graceful: bool,
) {
    let token = id.token;
    let Some(server) = server_at(lp, token) else {
        return;
    };

    let listening = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        match state.socket.take() {
            Some(socket) => {
                if let Err(e) = lp.deregister_io(socket.as_raw_fd()) {
                    trace!("deregister listener failed; token={:?}: {}", token, e);
                }
                true
            }
            None => false,
        }
    };

    if !listening {
        if let Some(callback) = callback {
            lp.schedule_callback(move |lp| {
                callback(lp, server, &Error::new(StatusCode::NotConnected));
            });
        }
        return;
    }

    trace!("tcp server closing; token={:?}; graceful={}", token, graceful);

    let clients = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        state.shutting_down = true;
        state.shutdown_callback = callback;
        state.clients.clone()
    };

    if graceful {
        for client in clients {
            tcp_conn::begin_drain(lp, client);
        }
    } else {
        for client in clients {
            tcp_conn::close_from_server(lp, client, Error::ok());
        }
    }

    maybe_finish_close(lp, token);
}

/// Fires the pending close/shutdown callback once the last client is gone.
pub(crate) fn maybe_finish_close(lp: &mut EventLoop, token: Token) {
    let Some(server) = server_at(lp, token) else {
        return;
    };
    let callback = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        if state.socket.is_some() || !state.shutting_down || !state.clients.is_empty() {
            return;
        }
        state.shutting_down = false;
        state.shutdown_callback.take()
    };
    if let Some(callback) = callback {
        lp.schedule_callback(move |lp| callback(lp, server, &Error::ok()));
    }
}

pub(crate) fn on_event(lp: &mut EventLoop, token: Token, event: sys::Event) {
    if !event.is_readable() {
        return;
    }

    loop {
        let accepted = {
            let Some(state) = state_mut(lp, token) else {
                return;
            };
            let Some(socket) = &state.socket else {
                return;
            };
            match socket.accept() {
                Ok((sock, addr)) => Some((sock, addr)),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed; token={:?}: {}", token, e);
                    None
                }
            }
        };

        let Some((sock, addr)) = accepted else {
            return;
        };
        if let Err(e) = sock.set_nonblocking(true) {
            warn!("failed to make accepted socket non-blocking: {}", e);
            continue;
        }
        let Some(peer) = addr.as_socket().map(Endpoint::from) else {
            continue;
        };

        let Some(conn) = tcp_conn::create(lp, token, sock, peer) else {
            continue;
        };
        if let Some(state) = state_mut(lp, token) {
            state.clients.push(conn.handle_id().token);
        }

        trace!("connection accepted; server={:?}; peer={}", token, peer);

        let callback = state_mut(lp, token).and_then(|s| s.new_connection_callback.take());
        if let Some(mut callback) = callback {
            callback(lp, conn, &Error::ok());
            if let Some(state) = state_mut(lp, token) {
                if state.new_connection_callback.is_none() {
                    state.new_connection_callback = Some(callback);
                }
            }
        }
    }
}

pub(crate) fn teardown(lp: &mut EventLoop, token: Token) {
    let Some(state) = state_mut(lp, token) else {
        return;
    };
    if let Some(socket) = state.socket.take() {
        if let Err(e) = lp.deregister_io(socket.as_raw_fd()) {
            trace!("deregister listener failed; token={:?}: {}", token, e);
        }
    }
    let clients = match state_mut(lp, token) {
        Some(state) => state.clients.clone(),
        None => return,
    };
    for client in clients {
        tcp_conn::close_from_server(lp, client, Error::ok());
    }
}
