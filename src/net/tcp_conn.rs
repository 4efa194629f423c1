use std::collections::VecDeque;
use std::io;
use std::os::fd::AsRawFd;

use log::{trace, warn};
use socket2::Socket;

use crate::buf::{DataChunk, SharedBuf};
use crate::error::{Error, StatusCode};
use crate::event_loop::EventLoop;
use crate::handle::{Handle, HandleId, HandleKind};
use crate::net::stream::{self, FlushOutcome, SendRequest};
use crate::net::tcp_server::{self, TcpServer};
use crate::net::Endpoint;
use crate::sys;
use crate::token::Token;

/// Server-side representation of an accepted TCP connection.
///
/// Created by [`TcpServer`] on accept; data and close events dispatch to
/// the server-wide callbacks. The handle itself supports the same send,
/// close and Nagle controls as a [`TcpClient`].
///
/// [`TcpClient`]: crate::net::TcpClient
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TcpConnectedClient {
    id: HandleId,
}

type EndSendCallback = Box<dyn FnOnce(&mut EventLoop, TcpConnectedClient, &Error)>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ConnState {
    Open,
    ShutdownSent,
    Closed,
}

pub(crate) struct TcpConnState {
    socket: Option<Socket>,
    server: Token,
    peer: Endpoint,
    state: ConnState,
    send_queue: VecDeque<SendRequest<EndSendCallback>>,
    delay_send: bool,
    // Close once the send queue drains (server graceful shutdown).
    draining: bool,
}

impl TcpConnState {
    pub(crate) fn is_active(&self) -> bool {
        self.socket.is_some()
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.socket.is_none() && self.send_queue.is_empty()
    }
}

fn state_mut(lp: &mut EventLoop, token: Token) -> Option<&mut TcpConnState> {
    match lp.entry_mut(token) {
        Some(entry) => match &mut entry.kind {
            HandleKind::TcpConn(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

fn state_ref(lp: &EventLoop, id: HandleId) -> Option<&TcpConnState> {
    match lp.resolve_ref(id) {
        Some(entry) => match &entry.kind {
            HandleKind::TcpConn(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

fn conn_at(lp: &EventLoop, token: Token) -> Option<TcpConnectedClient> {
    lp.gen_of(token).map(|gen| TcpConnectedClient {
        id: HandleId { token, gen },
    })
}

/// Allocates and registers a handle for a freshly accepted socket.
pub(crate) fn create(
    lp: &mut EventLoop,
    server: Token,
    socket: Socket,
    peer: Endpoint,
) -> Option<TcpConnectedClient> {
    let fd = socket.as_raw_fd();
    let id = lp.allocate_handle(HandleKind::TcpConn(TcpConnState {
        socket: Some(socket),
        server,
        peer,
        state: ConnState::Open,
        send_queue: VecDeque::new(),
        delay_send: true,
        draining: false,
    }));

    if let Err(e) = lp.register_io(fd, id.token, sys::Interest::READABLE) {
        warn!("failed to register accepted connection: {}", e);
        if let Some(state) = state_mut(lp, id.token) {
            state.socket = None;
            state.state = ConnState::Closed;
        }
        lp.schedule_removal_id(id);
        return None;
    }

    Some(TcpConnectedClient { id })
}

impl TcpConnectedClient {
    /// Queues `data` for sending to the connected peer.
    pub fn send_data<B>(&self, lp: &mut EventLoop, data: B)
    where
        B: Into<SharedBuf>,
    {
        send_impl(lp, self.id, data.into(), None);
    }

    pub fn send_data_with_callback<B, F>(&self, lp: &mut EventLoop, data: B, callback: F)
    where
        B: Into<SharedBuf>,
        F: FnOnce(&mut EventLoop, TcpConnectedClient, &Error) + 'static,
    {
        send_impl(lp, self.id, data.into(), Some(Box::new(callback)));
    }

    pub fn pending_send_requests(&self, lp: &EventLoop) -> usize {
        state_ref(lp, self.id).map_or(0, |s| s.send_queue.len())
    }

    /// Closes the connection; queued sends fail with `OperationCanceled`
    /// and the server's close-connection callback fires with OK.
    pub fn close(&self, lp: &mut EventLoop) {
        if lp.resolve_ref(self.id).is_some() {
            do_close(lp, self.id.token, Error::ok(), false);
        }
    }

    /// Terminates immediately; the peer observes `ConnectionResetByPeer`.
    pub fn close_with_reset(&self, lp: &mut EventLoop) {
        if lp.resolve_ref(self.id).is_some() {
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

    /// Remote endpoint of this connection.
    pub fn endpoint(&self, lp: &EventLoop) -> Endpoint {
        state_ref(lp, self.id).map_or(Endpoint::Undefined, |s| s.peer)
    }

    pub fn is_open(&self, lp: &EventLoop) -> bool {
        state_ref(lp, self.id).is_some_and(|s| s.state == ConnState::Open)
    }

    /// The server this connection was accepted by.
    pub fn server(&self, lp: &EventLoop) -> Option<TcpServer> {
        let server = state_ref(lp, self.id)?.server;
        tcp_server_at(lp, server)
    }
}

fn tcp_server_at(lp: &EventLoop, token: Token) -> Option<TcpServer> {
    // Reconstructed the same way the server module builds its handles.
    lp.gen_of(token).map(|gen| {
        let id = HandleId { token, gen };
        TcpServer::from_id(id)
    })
}

impl Handle for TcpConnectedClient {
    fn handle_id(&self) -> HandleId {
        self.id
    }
}

fn send_impl(
    lp: &mut EventLoop,
    id: HandleId,
    buf: SharedBuf,
    callback: Option<EndSendCallback>,
) {
    let token = id.token;
    let Some(conn) = conn_at(lp, token) else {
        return;
    };

    if buf.is_empty() {
        if let Some(callback) = callback {
            lp.schedule_callback(move |lp| {
                callback(lp, conn, &Error::new(StatusCode::InvalidArgument));
            });
        }
        return;
    }

    let open = state_ref(lp, id).is_some_and(|s| s.state == ConnState::Open);
    if !open {
        if let Some(callback) = callback {
            lp.schedule_callback(move |lp| {
                callback(lp, conn, &Error::new(StatusCode::NotConnected));
            });
        }
        return;
    }

    if let Some(state) = state_mut(lp, token) {
        state.send_queue.push_back(SendRequest::new(buf, callback));
    }
    flush_sends(lp, token);
}

fn flush_sends(lp: &mut EventLoop, token: Token) {
    let Some(conn) = conn_at(lp, token) else {
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
        FlushOutcome::Drained(completed) => {
            for callback in completed {
                callback(lp, conn, &Error::ok());
            }
            let draining = state_ref(lp, conn.id).is_some_and(|s| s.draining);
            if draining {
                do_close(lp, token, Error::ok(), false);
            } else {
                sync_interest(lp, token);
            }
        }
        FlushOutcome::WouldBlock(completed) => {
            for callback in completed {
                callback(lp, conn, &Error::ok());
            }
            sync_interest(lp, token);
        }
        FlushOutcome::Failed(e, completed) => {
            for callback in completed {
                callback(lp, conn, &Error::ok());
            }
            do_close(lp, token, Error::from(&e), false);
        }
    }
}

fn sync_interest(lp: &mut EventLoop, token: Token) {
    let (fd, interest) = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        let Some(socket) = &state.socket else {
            return;
        };
        let interest = if state.send_queue.is_empty() {
            sys::Interest::READABLE
        } else {
            sys::Interest::READABLE | sys::Interest::WRITABLE
        };
        (socket.as_raw_fd(), interest)
    };
    if let Err(e) = lp.reregister_io(fd, token, interest) {
        warn!("failed to update interest; token={:?}: {}", token, e);
    }
}

pub(crate) fn on_event(lp: &mut EventLoop, token: Token, event: sys::Event) {
    if event.is_writable() {
        flush_sends(lp, token);
    }
    if event.is_readable() || event.is_read_closed() {
        handle_readable(lp, token);
    }
}

fn handle_readable(lp: &mut EventLoop, token: Token) {
    let Some(conn) = conn_at(lp, token) else {
        return;
    };

    loop {
        let (fd, server) = match state_mut(lp, token) {
            Some(state) => match &state.socket {
                Some(socket) => (socket.as_raw_fd(), state.server),
                None => return,
            },
            None => return,
        };

        match sys::unix::read(fd, &mut lp.scratch) {
            Ok(0) => {
                // Peer closed its write side.
                do_close(lp, token, Error::ok(), false);
                return;
            }
            Ok(n) => {
                let chunk = DataChunk::new(SharedBuf::from(&lp.scratch[..n]), 0);
                dispatch_data(lp, server, conn, &chunk);
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

/// Routes a received chunk to the owning server's data callback.
fn dispatch_data(lp: &mut EventLoop, server: Token, conn: TcpConnectedClient, chunk: &DataChunk) {
    let callback = tcp_server::state_mut(lp, server).and_then(|s| s.data_callback.take());
    if let Some(mut callback) = callback {
        callback(lp, conn, chunk, &Error::ok());
        if let Some(state) = tcp_server::state_mut(lp, server) {
            if state.data_callback.is_none() {
                state.data_callback = Some(callback);
            }
        }
    }
}

/// Half-closes and waits for the send queue to drain, then closes. Used
/// by the server's graceful shutdown.
pub(crate) fn begin_drain(lp: &mut EventLoop, token: Token) {
    let queue_empty = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        state.draining = true;
        state.send_queue.is_empty()
    };
    if queue_empty {
        do_close(lp, token, Error::ok(), false);
    }
}

pub(crate) fn close_from_server(lp: &mut EventLoop, token: Token, error: Error) {
    do_close(lp, token, error, false);
}

/// Tears the connection down, cancels queued sends, reports to the
/// server's close-connection callback and schedules the handle's removal.
fn do_close(lp: &mut EventLoop, token: Token, error: Error, reset: bool) {
    let Some(conn) = conn_at(lp, token) else {
        return;
    };

    let (server, canceled) = {
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
        if let Err(e) = lp.deregister_io(socket.as_raw_fd()) {
            trace!("deregister on close failed; token={:?}: {}", token, e);
        }
        drop(socket);
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        state.state = ConnState::Closed;
        (
            state.server,
            stream::drain_callbacks(&mut state.send_queue),
        )
    };

    trace!("tcp connection closed; token={:?}; error={}", token, error);

    for callback in canceled {
        callback(lp, conn, &Error::new(StatusCode::OperationCanceled));
    }

    // Unlink from the owning server before its callback observes counts.
    if let Some(state) = tcp_server::state_mut(lp, server) {
        state.clients.retain(|t| *t != token);
    }

    let callback = tcp_server::state_mut(lp, server).and_then(|s| s.close_connection_callback.take());
    if let Some(mut callback) = callback {
        callback(lp, conn, &error);
        if let Some(state) = tcp_server::state_mut(lp, server) {
            if state.close_connection_callback.is_none() {
                state.close_connection_callback = Some(callback);
            }
        }
    }

    lp.schedule_removal_id(conn.id);
    tcp_server::maybe_finish_close(lp, server);
}

pub(crate) fn teardown(lp: &mut EventLoop, token: Token) {
    // Removal of a connection closes it quietly if still open.
    let open = state_ref_by_token(lp, token).is_some_and(|s| s.socket.is_some());
    if open {
        do_close(lp, token, Error::ok(), false);
    }
}

fn state_ref_by_token(lp: &EventLoop, token: Token) -> Option<&TcpConnState> {
    match lp.handles.get(token.0) {
        Some(entry) => match &entry.kind {
            HandleKind::TcpConn(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}
