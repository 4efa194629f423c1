use std::io;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use log::{trace, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::buf::{DataChunk, SharedBuf};
use crate::error::{Error, StatusCode};
use crate::event_loop::{DeadlineKind, EventLoop};
use crate::handle::{Handle, HandleId, HandleKind};
use crate::net::{Endpoint, EndpointType};
use crate::sys;
use crate::token::Token;

/// UDP client bound to a single destination.
///
/// `set_destination` connects the underlying socket, so only datagrams
/// whose source equals the destination are delivered. Sends issued before
/// the set-destination callback fires fail with `OperationCanceled`.
/// With an inactivity timeout configured, silence beyond the window fires
/// the timeout callback and closes the client.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UdpClient {
    id: HandleId,
}

type SetDestinationCallback = Box<dyn FnOnce(&mut EventLoop, UdpClient, &Error)>;
type DataReceivedCallback = Box<dyn FnMut(&mut EventLoop, UdpClient, &DataChunk, &Error)>;
type TimeoutCallback = Box<dyn FnOnce(&mut EventLoop, UdpClient, &Error)>;
type EndSendCallback = Box<dyn FnOnce(&mut EventLoop, UdpClient, &Error)>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DestState {
    Unset,
    Setting,
    Set,
    Closed,
}

pub(crate) struct UdpClientState {
    socket: Option<Socket>,
    dest: Endpoint,
    state: DestState,
    data_callback: Option<DataReceivedCallback>,
    timeout_callback: Option<TimeoutCallback>,
    timeout_ms: u64,
    last_packet_at: Instant,
    deadline_seq: u64,
    bound_port: u16,
}

impl UdpClientState {
    fn new() -> UdpClientState {
        UdpClientState {
            socket: None,
            dest: Endpoint::Undefined,
            state: DestState::Unset,
            data_callback: None,
            timeout_callback: None,
            timeout_ms: 0,
            last_packet_at: Instant::now(),
            deadline_seq: 0,
            bound_port: 0,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.socket.is_some() && (self.data_callback.is_some() || self.timeout_ms > 0)
    }
}

fn state_mut(lp: &mut EventLoop, token: Token) -> Option<&mut UdpClientState> {
    match lp.entry_mut(token) {
        Some(entry) => match &mut entry.kind {
            HandleKind::UdpClient(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

fn state_ref(lp: &EventLoop, id: HandleId) -> Option<&UdpClientState> {
    match lp.resolve_ref(id) {
        Some(entry) => match &entry.kind {
            HandleKind::UdpClient(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

fn client_at(lp: &EventLoop, token: Token) -> Option<UdpClient> {
    lp.gen_of(token).map(|gen| UdpClient {
        id: HandleId { token, gen },
    })
}

impl UdpClient {
    pub fn new(lp: &mut EventLoop) -> UdpClient {
        let id = lp.allocate_handle(HandleKind::UdpClient(UdpClientState::new()));
        UdpClient { id }
    }

    /// Binds and connects the socket to `endpoint`; send-only.
    pub fn set_destination<F>(&self, lp: &mut EventLoop, endpoint: Endpoint, callback: F)
    where
        F: FnOnce(&mut EventLoop, UdpClient, &Error) + 'static,
    {
        set_destination_impl(lp, self.id, endpoint, Box::new(callback), None, 0, None);
    }

    /// Like [`set_destination`], also delivering received datagrams whose
    /// source equals the destination.
    ///
    /// [`set_destination`]: UdpClient::set_destination
    pub fn set_destination_with_receive<F, D>(
        &self,
        lp: &mut EventLoop,
        endpoint: Endpoint,
        callback: F,
        receive_callback: D,
    ) where
        F: FnOnce(&mut EventLoop, UdpClient, &Error) + 'static,
        D: FnMut(&mut EventLoop, UdpClient, &DataChunk, &Error) + 'static,
    {
        set_destination_impl(
            lp,
            self.id,
            endpoint,
            Box::new(callback),
            Some(Box::new(receive_callback)),
            0,
            None,
        );
    }

    /// Full form: receive callback plus an inactivity timeout measured
    /// from the last received datagram.
    pub fn set_destination_with_timeout<F, D, T>(
        &self,
        lp: &mut EventLoop,
        endpoint: Endpoint,
        callback: F,
        receive_callback: D,
        timeout_ms: u64,
        timeout_callback: T,
    ) where
        F: FnOnce(&mut EventLoop, UdpClient, &Error) + 'static,
        D: FnMut(&mut EventLoop, UdpClient, &DataChunk, &Error) + 'static,
        T: FnOnce(&mut EventLoop, UdpClient, &Error) + 'static,
    {
        set_destination_impl(
            lp,
            self.id,
            endpoint,
            Box::new(callback),
            Some(Box::new(receive_callback)),
            timeout_ms,
            Some(Box::new(timeout_callback)),
        );
    }

    /// Sends one datagram to the configured destination.
    pub fn send_data<B>(&self, lp: &mut EventLoop, data: B)
    where
        B: Into<SharedBuf>,
    {
        send_impl(lp, self.id, data.into(), None);
    }

    pub fn send_data_with_callback<B, F>(&self, lp: &mut EventLoop, data: B, callback: F)
    where
        B: Into<SharedBuf>,
        F: FnOnce(&mut EventLoop, UdpClient, &Error) + 'static,
    {
        send_impl(lp, self.id, data.into(), Some(Box::new(callback)));
    }

    /// Closes the socket. `bound_port` reads zero afterwards; a later
    /// `set_destination` (any family) reopens the client.
    pub fn close(&self, lp: &mut EventLoop) {
        close_impl(lp, self.id.token);
    }

    /// Destination endpoint configured by the last `set_destination`.
    pub fn endpoint(&self, lp: &EventLoop) -> Endpoint {
        state_ref(lp, self.id).map_or(Endpoint::Undefined, |s| s.dest)
    }

    /// Locally bound port; zero unless a destination is set.
    pub fn bound_port(&self, lp: &EventLoop) -> u16 {
        state_ref(lp, self.id).map_or(0, |s| s.bound_port)
    }

    pub fn is_open(&self, lp: &EventLoop) -> bool {
        state_ref(lp, self.id).is_some_and(|s| s.socket.is_some())
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

impl Handle for UdpClient {
    fn handle_id(&self) -> HandleId {
        self.id
    }
}

fn set_destination_impl(
    lp: &mut EventLoop,
    id: HandleId,
    endpoint: Endpoint,
    callback: SetDestinationCallback,
    data_callback: Option<DataReceivedCallback>,
    timeout_ms: u64,
    timeout_callback: Option<TimeoutCallback>,
) {
    let token = id.token;
    let Some(client) = client_at(lp, token) else {
        return;
    };

    let Some(addr) = endpoint.to_socket_addr() else {
        lp.schedule_callback(move |lp| {
            callback(lp, client, &Error::new(StatusCode::InvalidArgument));
        });
        return;
    };

    // The address family is fixed while the socket is open.
    let family_conflict = state_ref(lp, id).is_some_and(|s| {
        s.socket.is_some() && s.dest.endpoint_type() != endpoint.endpoint_type()
    });
    if family_conflict {
        lp.schedule_callback(move |lp| {
            callback(lp, client, &Error::new(StatusCode::InvalidArgument));
        });
        return;
    }

    let reuse = state_ref(lp, id).is_some_and(|s| s.socket.is_some());
    if !reuse {
        let socket = match open_datagram_socket(&addr) {
            Ok(socket) => socket,
            Err(e) => {
                let error = Error::from(&e);
                lp.schedule_callback(move |lp| callback(lp, client, &error));
                return;
            }
        };
        if let Err(e) = lp.register_io(socket.as_raw_fd(), token, sys::Interest::READABLE) {
            let error = Error::from(&e);
            lp.schedule_callback(move |lp| callback(lp, client, &error));
            return;
        }
        if let Some(state) = state_mut(lp, token) {
            state.socket = Some(socket);
        }
    }

    let connect_result = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        match &state.socket {
            Some(socket) => socket.connect(&addr.into()).and_then(|_| socket.local_addr()),
            None => return,
        }
    };

    let local = match connect_result {
        Ok(local) => local,
        Err(e) => {
            let error = Error::from(&e);
            close_impl(lp, token);
            lp.schedule_callback(move |lp| callback(lp, client, &error));
            return;
        }
    };

    let bound_port = local.as_socket().map_or(0, |a| a.port());
    trace!(
        "udp destination set; token={:?}; endpoint={}; bound_port={}",
        token,
        endpoint,
        bound_port
    );

    {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        state.dest = endpoint;
        state.state = DestState::Setting;
        state.data_callback = data_callback;
        state.timeout_callback = timeout_callback;
        state.timeout_ms = timeout_ms;
        state.last_packet_at = Instant::now();
        state.bound_port = bound_port;
    }

    if timeout_ms > 0 {
        arm_timeout(lp, token, Duration::from_millis(timeout_ms));
    }

    // Sends stay rejected until this callback has fired.
    lp.schedule_callback(move |lp| {
        if let Some(state) = state_mut(lp, token) {
            if state.state == DestState::Setting {
                state.state = DestState::Set;
            }
        }
        callback(lp, client, &Error::ok());
    });
}

fn open_datagram_socket(addr: &std::net::SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(*addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn arm_timeout(lp: &mut EventLoop, token: Token, after: Duration) {
    let seq = lp.arm_deadline(
        Instant::now() + after,
        token,
        DeadlineKind::UdpClientTimeout,
    );
    if let Some(state) = state_mut(lp, token) {
        state.deadline_seq = seq;
    }
}

fn send_impl(lp: &mut EventLoop, id: HandleId, buf: SharedBuf, callback: Option<EndSendCallback>) {
    let token = id.token;
    let Some(client) = client_at(lp, token) else {
        return;
    };

    let state = match state_ref(lp, id) {
        Some(state) => state.state,
        None => return,
    };

    let failure = match state {
        DestState::Set => None,
        // Destination is being configured; the set callback has not fired.
        DestState::Setting => Some(StatusCode::OperationCanceled),
        DestState::Unset | DestState::Closed => Some(StatusCode::NotConnected),
    };
    if let Some(code) = failure {
        if let Some(callback) = callback {
            lp.schedule_callback(move |lp| callback(lp, client, &Error::new(code)));
        }
        return;
    }

    let result = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        match &state.socket {
            Some(socket) => socket.send(&buf),
            None => return,
        }
    };

    match result {
        Ok(_) => {
            if let Some(callback) = callback {
                lp.schedule_callback(move |lp| callback(lp, client, &Error::ok()));
            }
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
            // Kernel send buffer full; retry next cycle.
            lp.schedule_callback(move |lp| send_impl(lp, id, buf, callback));
        }
        Err(e) => {
            let error = Error::from(&e);
            if let Some(callback) = callback {
                lp.schedule_callback(move |lp| callback(lp, client, &error));
            }
        }
    }
}

pub(crate) fn on_event(lp: &mut EventLoop, token: Token, event: sys::Event) {
    if !event.is_readable() {
        return;
    }
    let Some(client) = client_at(lp, token) else {
        return;
    };

    loop {
        let fd = match state_mut(lp, token) {
            Some(state) => match &state.socket {
                Some(socket) => socket.as_raw_fd(),
                None => return,
            },
            None => return,
        };

        match sys::unix::read(fd, &mut lp.scratch) {
            Ok(n) => {
                if let Some(state) = state_mut(lp, token) {
                    state.last_packet_at = Instant::now();
                }
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
                trace!("udp client recv failed; token={:?}: {}", token, e);
                return;
            }
        }
    }
}

/// The inactivity deadline matured: close the client, or re-arm if a
/// datagram refreshed it.
pub(crate) fn on_timeout_deadline(lp: &mut EventLoop, token: Token, seq: u64) {
    let (timeout_ms, last_packet_at) = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        if state.socket.is_none() || state.deadline_seq != seq || state.timeout_ms == 0 {
            return;
        }
        (state.timeout_ms, state.last_packet_at)
    };

    let timeout = Duration::from_millis(timeout_ms);
    if last_packet_at.elapsed() < timeout {
        let seq = lp.arm_deadline(
            last_packet_at + timeout,
            token,
            DeadlineKind::UdpClientTimeout,
        );
        if let Some(state) = state_mut(lp, token) {
            state.deadline_seq = seq;
        }
        return;
    }

    trace!("udp client timed out; token={:?}", token);

    let Some(client) = client_at(lp, token) else {
        return;
    };
    let callback = state_mut(lp, token).and_then(|s| s.timeout_callback.take());
    close_impl(lp, token);
    if let Some(callback) = callback {
        callback(lp, client, &Error::ok());
    }
}

fn close_impl(lp: &mut EventLoop, token: Token) {
    let Some(state) = state_mut(lp, token) else {
        return;
    };
    let Some(socket) = state.socket.take() else {
        return;
    };
    if let Err(e) = lp.deregister_io(socket.as_raw_fd()) {
        trace!("deregister udp client failed; token={:?}: {}", token, e);
    }
    drop(socket);
    let Some(state) = state_mut(lp, token) else {
        return;
    };
    state.state = DestState::Closed;
    state.bound_port = 0;
    state.data_callback = None;
    state.timeout_callback = None;
    state.timeout_ms = 0;
    trace!("udp client closed; token={:?}", token);
}

pub(crate) fn teardown(lp: &mut EventLoop, token: Token) {
    close_impl(lp, token);
}
