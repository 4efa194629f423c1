use std::collections::VecDeque;
use std::io;
use std::os::fd::AsRawFd;

use log::{trace, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::buf::{DataChunk, SharedBuf};
use crate::error::{Error, StatusCode};
use crate::event_loop::EventLoop;
use crate::handle::{Handle, HandleId, HandleKind};
use crate::net::stream::{self, FlushOutcome, SendRequest};
use crate::net::Endpoint;
use crate::sys;
use crate::token::Token;

/// Client side of a TCP connection.
///
/// The handle is reusable: after a close (local or remote) `connect` may
/// be called again. Callbacks follow the event order of the wire: the
/// connect callback first, data chunks in arrival order, the close
/// callback last. If the connect callback reports an error the close
/// callback never fires.
///
/// # Examples
///
/// ```no_run
/// use evio::{EventLoop, TcpClient, Endpoint};
///
/// let mut lp = EventLoop::new().unwrap();
/// let client = TcpClient::new(&mut lp);
/// client.connect_with_callbacks(
///     &mut lp,
///     Endpoint::new("127.0.0.1", 31540),
///     |lp, client, error| {
///         if error.is_ok() {
///             client.send_data(lp, "Hello world!");
///         }
///     },
///     |_lp, _client, chunk, _error| {
///         println!("received {} bytes", chunk.len());
///     },
///     |_lp, _client, error| {
///         println!("closed: {}", error);
///     },
/// );
/// lp.run().unwrap();
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TcpClient {
    id: HandleId,
}

type ConnectCallback = Box<dyn FnOnce(&mut EventLoop, TcpClient, &Error)>;
type DataCallback = Box<dyn FnMut(&mut EventLoop, TcpClient, &DataChunk, &Error)>;
type CloseCallback = Box<dyn FnOnce(&mut EventLoop, TcpClient, &Error)>;
type EndSendCallback = Box<dyn FnOnce(&mut EventLoop, TcpClient, &Error)>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ConnState {
    Idle,
    Connecting,
    Open,
    ShutdownSent,
    Closed,
}

pub(crate) struct TcpClientState {
    socket: Option<Socket>,
    state: ConnState,
    peer: Endpoint,
    connect_callback: Option<ConnectCallback>,
    data_callback: Option<DataCallback>,
    close_callback: Option<CloseCallback>,
    send_queue: VecDeque<SendRequest<EndSendCallback>>,
    // Nagle; enabled by default.
    delay_send: bool,
}

impl TcpClientState {
    fn new() -> TcpClientState {
        TcpClientState {
            socket: None,
            state: ConnState::Idle,
            peer: Endpoint::Undefined,
            connect_callback: None,
            data_callback: None,
            close_callback: None,
            send_queue: VecDeque::new(),
            delay_send: true,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.socket.is_some()
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.socket.is_none() && self.send_queue.is_empty()
    }
}

fn state_mut(lp: &mut EventLoop, token: Token) -> Option<&mut TcpClientState> {
    match lp.entry_mut(token) {
        Some(entry) => match &mut entry.kind {
            HandleKind::TcpClient(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

fn state_ref(lp: &EventLoop, id: HandleId) -> Option<&TcpClientState> {
    match lp.resolve_ref(id) {
        Some(entry) => match &entry.kind {
            HandleKind::TcpClient(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

fn client_at(lp: &EventLoop, token: Token) -> Option<TcpClient> {
    lp.gen_of(token).map(|gen| TcpClient {
        id: HandleId { token, gen },
    })
}

impl TcpClient {
    pub fn new(lp: &mut EventLoop) -> TcpClient {
        let id = lp.allocate_handle(HandleKind::TcpClient(TcpClientState::new()));
        TcpClient { id }
    }

    /// Starts a connection attempt; only the connect callback is wired.
    pub fn connect<C>(&self, lp: &mut EventLoop, endpoint: Endpoint, connect_callback: C)
    where
        C: FnOnce(&mut EventLoop, TcpClient, &Error) + 'static,
    {
        connect_impl(lp, self.id, endpoint, Box::new(connect_callback), None, None);
    }

    /// Starts a connection attempt with receive and close callbacks.
    /// Reads begin automatically once the connection is open.
    pub fn connect_with_callbacks<C, D, K>(
        &self,
        lp: &mut EventLoop,
        endpoint: Endpoint,
        connect_callback: C,
        receive_callback: D,
        close_callback: K,
    ) where
        C: FnOnce(&mut EventLoop, TcpClient, &Error) + 'static,
        D: FnMut(&mut EventLoop, TcpClient, &DataChunk, &Error) + 'static,
        K: FnOnce(&mut EventLoop, TcpClient, &Error) + 'static,
    {
        connect_impl(
            lp,
            self.id,
            endpoint,
            Box::new(connect_callback),
            Some(Box::new(receive_callback)),
            Some(Box::new(close_callback)),
        );
    }

    /// Queues `data` for sending. The completion callback fires when the
    /// kernel accepted the bytes, not when the peer received them.
    pub fn send_data<B>(&self, lp: &mut EventLoop, data: B)
    where
        B: Into<SharedBuf>,
    {
        send_impl(lp, self.id, data.into(), None);
    }

    pub fn send_data_with_callback<B, F>(&self, lp: &mut EventLoop, data: B, callback: F)
    where
        B: Into<SharedBuf>,
        F: FnOnce(&mut EventLoop, TcpClient, &Error) + 'static,
    {
        send_impl(lp, self.id, data.into(), Some(Box::new(callback)));
    }

    /// Number of sends queued but not yet acknowledged by the kernel.
    pub fn pending_send_requests(&self, lp: &EventLoop) -> usize {
        state_ref(lp, self.id).map_or(0, |s| s.send_queue.len())
    }

    /// Closes the connection. Queued sends fail with `OperationCanceled`;
    /// the close callback fires with OK.
    pub fn close(&self, lp: &mut EventLoop) {
        if lp.resolve_mut(self.id).is_some() {
            do_close(lp, self.id.token, Error::ok(), false);
        }
    }

    /// Terminates the connection immediately; the peer observes
    /// `ConnectionResetByPeer`.
    pub fn close_with_reset(&self, lp: &mut EventLoop) {
        if lp.resolve_mut(self.id).is_some() {
            do_close(lp, self.id.token, Error::ok(), true);
        }
    }

    /// Half-closes the write side; subsequent sends fail.
    pub fn shutdown(&self, lp: &mut EventLoop) {
        let Some(state) = state_mut(lp, self.id.token) else {
            return;
        };
        if state.state != ConnState::Open {
            return;
        }
        if let Some(socket) = &state.socket {
            if let Err(e) = socket.shutdown(std::net::Shutdown::Write) {
                warn!("tcp shutdown failed: {}", e);
            }
        }
        state.state = ConnState::ShutdownSent;
    }

    /// Toggles the Nagle algorithm; enabled by default.
    pub fn delay_send(&self, lp: &mut EventLoop, enabled: bool) {
        let Some(state) = state_mut(lp, self.id.token) else {
            return;
        };
        state.delay_send = enabled;
        if let Some(socket) = &state.socket {
            if let Err(e) = socket.set_nodelay(!enabled) {
                warn!("failed to toggle TCP_NODELAY: {}", e);
            }
        }
    }

    pub fn is_delay_send(&self, lp: &EventLoop) -> bool {
        state_ref(lp, self.id).map_or(true, |s| s.delay_send)
    }

    /// Remote endpoint of the current (or last attempted) connection.
    pub fn endpoint(&self, lp: &EventLoop) -> Endpoint {
        state_ref(lp, self.id).map_or(Endpoint::Undefined, |s| s.peer)
    }

    pub fn is_open(&self, lp: &EventLoop) -> bool {
        state_ref(lp, self.id).is_some_and(|s| s.state == ConnState::Open)
    }
}

impl Handle for TcpClient {
    fn handle_id(&self) -> HandleId {
        self.id
    }
}

fn connect_impl(
    lp: &mut EventLoop,
    id: HandleId,
    endpoint: Endpoint,
    connect_callback: ConnectCallback,
    data_callback: Option<DataCallback>,
    close_callback: Option<CloseCallback>,
) {
    let token = id.token;
    let Some(client) = client_at(lp, token) else {
        return;
    };

    let in_progress = state_ref(lp, id).is_some_and(|s| {
        matches!(s.state, ConnState::Connecting | ConnState::Open | ConnState::ShutdownSent)
    });
    if in_progress {
        lp.schedule_callback(move |lp| {
            connect_callback(
                lp,
                client,
                &Error::new(StatusCode::ConnectionAlreadyInProgress),
            );
        });
        return;
    }

    let Some(addr) = endpoint.to_socket_addr() else {
        lp.schedule_callback(move |lp| {
            connect_callback(lp, client, &Error::new(StatusCode::InvalidArgument));
        });
        return;
    };

    let delay_send = state_ref(lp, id).map_or(true, |s| s.delay_send);
    let socket = match open_stream_socket(&addr, delay_send) {
        Ok(socket) => socket,
        Err(e) => {
            let error = Error::from(&e);
            lp.schedule_callback(move |lp| connect_callback(lp, client, &error));
            return;
        }
    };

    // A non-blocking connect reports completion through writability.
    let pending = match socket.connect(&addr.into()) {
        Ok(()) => false,
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => true,
        Err(e) => {
            let error = Error::from(&e);
            lp.schedule_callback(move |lp| connect_callback(lp, client, &error));
            return;
        }
    };

    if let Err(e) = lp.register_io(socket.as_raw_fd(), token, sys::Interest::WRITABLE) {
        let error = Error::from(&e);
        lp.schedule_callback(move |lp| connect_callback(lp, client, &error));
        return;
    }

    trace!(
        "tcp connect started; token={:?}; endpoint={}; pending={}",
        token,
        endpoint,
        pending
    );

    let Some(state) = state_mut(lp, token) else {
        return;
    };
    state.socket = Some(socket);
    state.state = ConnState::Connecting;
    state.peer = endpoint;
    state.connect_callback = Some(connect_callback);
    state.data_callback = data_callback;
    state.close_callback = close_callback;
}

fn open_stream_socket(addr: &std::net::SocketAddr, delay_send: bool) -> io::Result<Socket> {
    let domain = Domain::for_address(*addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if !delay_send {
        socket.set_nodelay(true)?;
    }
    Ok(socket)
}

fn send_impl(lp: &mut EventLoop, id: HandleId, buf: SharedBuf, callback: Option<EndSendCallback>) {
    let token = id.token;
    let Some(client) = client_at(lp, token) else {
        return;
    };

    if buf.is_empty() {
        if let Some(callback) = callback {
            lp.schedule_callback(move |lp| {
                callback(lp, client, &Error::new(StatusCode::InvalidArgument));
            });
        }
        return;
    }

    let connected = state_ref(lp, id).is_some_and(|s| s.state == ConnState::Open);
    if !connected {
        if let Some(callback) = callback {
            lp.schedule_callback(move |lp| {
                callback(lp, client, &Error::new(StatusCode::NotConnected));
            });
        }
        return;
    }

    if let Some(state) = state_mut(lp, token) {
        state.send_queue.push_back(SendRequest::new(buf, callback));
    }
    flush_sends(lp, token);
}

/// Pushes queued sends into the kernel and fires completions in order.
fn flush_sends(lp: &mut EventLoop, token: Token) {
    let Some(client) = client_at(lp, token) else {
        return;
    };

    let outcome = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        let Some(socket) = &state.socket else {
            return;
        };
        stream::flush_queue(socket, &mut state.send_queue)
    };

    match outcome {
        FlushOutcome::Drained(completed) | FlushOutcome::WouldBlock(completed) => {
            for callback in completed {
                callback(lp, client, &Error::ok());
            }
            sync_interest(lp, token);
        }
        FlushOutcome::Failed(e, completed) => {
            for callback in completed {
                callback(lp, client, &Error::ok());
            }
            do_close(lp, token, Error::from(&e), false);
        }
    }
}

/// Re-registers the socket with the interest the current state needs.
fn sync_interest(lp: &mut EventLoop, token: Token) {
    let (fd, interest) = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        let Some(socket) = &state.socket else {
            return;
        };
        let interest = match state.state {
            ConnState::Connecting => sys::Interest::WRITABLE,
            _ if !state.send_queue.is_empty() => sys::Interest::READABLE | sys::Interest::WRITABLE,
            _ => sys::Interest::READABLE,
        };
        (socket.as_raw_fd(), interest)
    };
    if let Err(e) = lp.reregister_io(fd, token, interest) {
        warn!("failed to update interest; token={:?}: {}", token, e);
    }
}

pub(crate) fn on_event(lp: &mut EventLoop, token: Token, event: sys::Event) {
    let state = match state_mut(lp, token) {
        Some(state) => state.state,
        None => return,
    };
    match state {
        ConnState::Connecting => finish_connect(lp, token, event),
        ConnState::Open | ConnState::ShutdownSent => {
            if event.is_writable() {
                flush_sends(lp, token);
            }
            if event.is_readable() || event.is_read_closed() {
                handle_readable(lp, token);
            }
        }
        _ => trace!("event on inactive tcp client; token={:?}", token),
    }
}

fn finish_connect(lp: &mut EventLoop, token: Token, event: sys::Event) {
    let Some(client) = client_at(lp, token) else {
        return;
    };

    let connect_error = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        let Some(socket) = &state.socket else {
            return;
        };
        match socket.take_error() {
            Ok(Some(e)) => Some(Error::from(&e)),
            Ok(None) if event.is_error() => Some(Error::new(StatusCode::Undefined)),
            Ok(None) => None,
            Err(e) => Some(Error::from(&e)),
        }
    };

    match connect_error {
        None => {
            if let Some(state) = state_mut(lp, token) {
                state.state = ConnState::Open;
            }
            sync_interest(lp, token);
            let callback = state_mut(lp, token).and_then(|s| s.connect_callback.take());
            trace!("tcp connected; token={:?}", token);
            if let Some(callback) = callback {
                callback(lp, client, &Error::ok());
            }
        }
        Some(error) => {
            // A failed connect reports through the connect callback only;
            // the close callback must not fire.
            let callback = {
                let Some(state) = state_mut(lp, token) else {
                    return;
                };
                if let Some(socket) = state.socket.take() {
                    let _ = lp_deregister(lp, &socket);
                }
                let Some(state) = state_mut(lp, token) else {
                    return;
                };
                state.state = ConnState::Closed;
                state.close_callback = None;
                state.data_callback = None;
                state.connect_callback.take()
            };
            trace!("tcp connect failed; token={:?}; error={}", token, error);
            if let Some(callback) = callback {
                callback(lp, client, &error);
            }
        }
    }
}

fn lp_deregister(lp: &EventLoop, socket: &Socket) -> io::Result<()> {
    lp.deregister_io(socket.as_raw_fd())
}

fn handle_readable(lp: &mut EventLoop, token: Token) {
    let Some(client) = client_at(lp, token) else {
        return;
    };

    loop {
        let fd = match state_mut(lp, token) {
            Some(state) => match &state.socket {
                Some(socket) if state.state != ConnState::Closed => socket.as_raw_fd(),
                _ => return,
            },
            None => return,
        };

        match sys::unix::read(fd, &mut lp.scratch) {
            Ok(0) => {
                // Orderly shutdown by the peer.
                do_close(lp, token, Error::ok(), false);
                return;
            }
            Ok(n) => {
                let chunk = DataChunk::new(SharedBuf::from(&lp.scratch[..n]), 0);
                let callback = state_mut(lp, token).and_then(|s| s.data_callback.take());
                if let Some(mut callback) = callback {
                    callback(lp, client, &chunk, &Error::ok());
                    if let Some(state) = state_mut(lp, token) {
                        if state.data_callback.is_none() {
                            state.data_callback = Some(callback);
                        }
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                do_close(lp, token, Error::from(&e), false);
                return;
            }
        }
    }
}

/// Tears the connection down and reports `error` to the close callback.
/// Pending sends fail with `OperationCanceled`.
fn do_close(lp: &mut EventLoop, token: Token, error: Error, reset: bool) {
    let Some(client) = client_at(lp, token) else {
        return;
    };

    let (close_callback, canceled) = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        let Some(socket) = state.socket.take() else {
            return;
        };
        if reset {
            if let Err(e) = socket.set_linger(Some(std::time::Duration::ZERO)) {
                warn!("failed to arm linger for reset: {}", e);
            }
        }
        if let Err(e) = lp_deregister(lp, &socket) {
            trace!("deregister on close failed; token={:?}: {}", token, e);
        }
        drop(socket);
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        state.state = ConnState::Closed;
        state.connect_callback = None;
        state.data_callback = None;
        (
            state.close_callback.take(),
            stream::drain_callbacks(&mut state.send_queue),
        )
    };

    trace!("tcp client closed; token={:?}; error={}", token, error);

    for callback in canceled {
        callback(lp, client, &Error::new(StatusCode::OperationCanceled));
    }
    if let Some(callback) = close_callback {
        lp.schedule_callback(move |lp| callback(lp, client, &error));
    }
}

pub(crate) fn teardown(lp: &mut EventLoop, token: Token) {
    do_close(lp, token, Error::ok(), false);
}
