use std::time::Instant;

use log::trace;

use crate::buf::SharedBuf;
use crate::error::{Error, StatusCode};
use crate::event_loop::EventLoop;
use crate::handle::{Handle, HandleId, HandleKind, RefCountedHandle};
use crate::net::udp_server::{self, UdpServer};
use crate::net::Endpoint;
use crate::token::Token;

/// Server-side representation of a remote endpoint sending datagrams.
///
/// Synthesized lazily by [`UdpServer`] on the first datagram from a new
/// source. With peer tracking enabled the same peer instance (and its
/// user data) persists across datagrams until it times out or is closed;
/// without tracking each datagram delivers a transient peer that lives
/// only for the duration of the callback, unless referenced.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UdpPeer {
    id: HandleId,
}

type EndSendCallback = Box<dyn FnOnce(&mut EventLoop, UdpPeer, &Error)>;

pub(crate) struct UdpPeerState {
    pub(crate) server: Token,
    pub(crate) endpoint: Endpoint,
    pub(crate) last_packet_at: Instant,
    pub(crate) deadline_seq: u64,
    pub(crate) closed: bool,
}

impl UdpPeerState {
    pub(crate) fn new(server: Token, endpoint: Endpoint) -> UdpPeerState {
        UdpPeerState {
            server,
            endpoint,
            last_packet_at: Instant::now(),
            deadline_seq: 0,
            closed: false,
        }
    }
}

pub(crate) fn state_mut(lp: &mut EventLoop, token: Token) -> Option<&mut UdpPeerState> {
    match lp.entry_mut(token) {
        Some(entry) => match &mut entry.kind {
            HandleKind::UdpPeer(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

fn state_ref(lp: &EventLoop, id: HandleId) -> Option<&UdpPeerState> {
    match lp.resolve_ref(id) {
        Some(entry) => match &entry.kind {
            HandleKind::UdpPeer(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

pub(crate) fn peer_at(lp: &EventLoop, token: Token) -> Option<UdpPeer> {
    lp.gen_of(token).map(|gen| UdpPeer {
        id: HandleId { token, gen },
    })
}

impl UdpPeer {
    /// Sends one datagram back to this peer through the owning server's
    /// socket.
    pub fn send_data<B>(&self, lp: &mut EventLoop, data: B)
    where
        B: Into<SharedBuf>,
    {
        send_impl(lp, self.id, data.into(), None);
    }

    pub fn send_data_with_callback<B, F>(&self, lp: &mut EventLoop, data: B, callback: F)
    where
        B: Into<SharedBuf>,
        F: FnOnce(&mut EventLoop, UdpPeer, &Error) + 'static,
    {
        send_impl(lp, self.id, data.into(), Some(Box::new(callback)));
    }

    /// Source endpoint this peer was synthesized from.
    pub fn endpoint(&self, lp: &EventLoop) -> Endpoint {
        state_ref(lp, self.id).map_or(Endpoint::Undefined, |s| s.endpoint)
    }

    /// Monotonic timestamp of the last datagram received from this peer.
    pub fn last_packet_time(&self, lp: &EventLoop) -> Option<Instant> {
        state_ref(lp, self.id).map(|s| s.last_packet_at)
    }

    pub fn is_open(&self, lp: &EventLoop) -> bool {
        state_ref(lp, self.id).is_some_and(|s| !s.closed)
    }

    /// The server that synthesized this peer.
    pub fn server(&self, lp: &EventLoop) -> Option<UdpServer> {
        let server = state_ref(lp, self.id)?.server;
        udp_server::server_at(lp, server)
    }

    /// Closes the peer. Datagrams from its endpoint are dropped silently
    /// for `inactivity_timeout_ms`; after the window a new peer is
    /// synthesized. Only the first close takes effect.
    pub fn close(&self, lp: &mut EventLoop, inactivity_timeout_ms: u64) {
        let token = self.id.token;
        let (server, endpoint) = {
            let Some(state) = state_mut(lp, token) else {
                return;
            };
            if state.closed {
                return;
            }
            state.closed = true;
            (state.server, state.endpoint)
        };
        trace!(
            "udp peer closed; token={:?}; graveyard_ms={}",
            token,
            inactivity_timeout_ms
        );
        udp_server::bury_peer(lp, server, endpoint, inactivity_timeout_ms);
        self.unref_handle(lp);
    }
}

impl Handle for UdpPeer {
    fn handle_id(&self) -> HandleId {
        self.id
    }
}

impl RefCountedHandle for UdpPeer {}

fn send_impl(lp: &mut EventLoop, id: HandleId, buf: SharedBuf, callback: Option<EndSendCallback>) {
    let token = id.token;
    let Some(peer) = peer_at(lp, token) else {
        return;
    };

    let target = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        if state.closed {
            None
        } else {
            Some((state.server, state.endpoint))
        }
    };

    let Some((server, endpoint)) = target else {
        if let Some(callback) = callback {
            lp.schedule_callback(move |lp| {
                callback(lp, peer, &Error::new(StatusCode::NotConnected));
            });
        }
        return;
    };

    udp_server::send_datagram(
        lp,
        server,
        endpoint,
        buf,
        Box::new(move |lp, error| {
            if let Some(callback) = callback {
                callback(lp, peer, error);
            }
        }),
    );
}

pub(crate) fn teardown(lp: &mut EventLoop, token: Token) {
    if let Some(state) = state_mut(lp, token) {
        state.closed = true;
    }
}
