use std::any::Any;

use crate::event_loop::EventLoop;
use crate::token::Token;

/// Identity of a handle: its arena slot plus a generation stamp.
///
/// Handles are `Copy` values that stay valid to *hold* forever; the
/// generation lets the loop detect a handle whose slot was destroyed and
/// reused, so operations on stale handles are ignored instead of touching
/// an unrelated handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HandleId {
    pub(crate) token: Token,
    pub(crate) gen: u32,
}

/// One slot in the loop's handle arena.
pub(crate) struct HandleEntry {
    pub(crate) gen: u32,
    pub(crate) kind: HandleKind,
    pub(crate) removal_scheduled: bool,
    pub(crate) on_removal: Option<Box<dyn FnOnce(&mut EventLoop)>>,
    // Reference count; only `UdpPeer` exposes it, everything else stays at 1.
    pub(crate) refs: usize,
    pub(crate) user_data: Option<Box<dyn Any>>,
}

pub(crate) enum HandleKind {
    Timer(crate::timer::TimerState),
    TcpClient(crate::net::tcp_client::TcpClientState),
    TcpServer(crate::net::tcp_server::TcpServerState),
    TcpConn(crate::net::tcp_conn::TcpConnState),
    UdpServer(crate::net::udp_server::UdpServerState),
    UdpPeer(crate::net::udp_peer::UdpPeerState),
    UdpClient(crate::net::udp_client::UdpClientState),
    File(crate::fs::file::FileState),
    Dir(crate::fs::dir::DirState),
}

/// Discriminant used to route dispatch without borrowing the entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum KindTag {
    Timer,
    TcpClient,
    TcpServer,
    TcpConn,
    UdpServer,
    UdpPeer,
    UdpClient,
    File,
    Dir,
}

impl HandleKind {
    pub(crate) fn tag(&self) -> KindTag {
        match self {
            HandleKind::Timer(_) => KindTag::Timer,
            HandleKind::TcpClient(_) => KindTag::TcpClient,
            HandleKind::TcpServer(_) => KindTag::TcpServer,
            HandleKind::TcpConn(_) => KindTag::TcpConn,
            HandleKind::UdpServer(_) => KindTag::UdpServer,
            HandleKind::UdpPeer(_) => KindTag::UdpPeer,
            HandleKind::UdpClient(_) => KindTag::UdpClient,
            HandleKind::File(_) => KindTag::File,
            HandleKind::Dir(_) => KindTag::Dir,
        }
    }
}

impl HandleEntry {
    /// Whether this handle gives the loop a reason to keep running.
    pub(crate) fn is_active(&self) -> bool {
        match &self.kind {
            HandleKind::Timer(s) => s.is_active(),
            HandleKind::TcpClient(s) => s.is_active(),
            HandleKind::TcpServer(s) => s.is_active(),
            HandleKind::TcpConn(s) => s.is_active(),
            HandleKind::UdpServer(s) => s.is_active(),
            HandleKind::UdpPeer(_) => false,
            HandleKind::UdpClient(s) => s.is_active(),
            HandleKind::File(s) => s.is_active(),
            HandleKind::Dir(s) => s.is_active(),
        }
    }

    /// Whether all protocol work and external buffer references have
    /// drained, making the slot safe to destroy.
    pub(crate) fn is_drained(&self) -> bool {
        match &self.kind {
            HandleKind::Timer(_) => true,
            HandleKind::TcpClient(s) => s.is_drained(),
            HandleKind::TcpServer(s) => s.is_drained(),
            HandleKind::TcpConn(s) => s.is_drained(),
            HandleKind::UdpServer(_) => true,
            HandleKind::UdpPeer(_) => true,
            HandleKind::UdpClient(_) => true,
            HandleKind::File(s) => s.is_drained(),
            HandleKind::Dir(s) => s.is_drained(),
        }
    }
}

/// Lifecycle contract shared by every handle type.
///
/// Destruction is always asynchronous: [`schedule_removal`] marks the
/// handle, the loop tears protocol state down, and the slot is reclaimed
/// once in-flight work and external buffer references drain. Calling any
/// operation on a handle after its slot was reclaimed is a no-op.
///
/// [`schedule_removal`]: Handle::schedule_removal
pub trait Handle: Copy {
    #[doc(hidden)]
    fn handle_id(&self) -> HandleId;

    /// Requests asynchronous destruction of the handle.
    ///
    /// Safe to call from inside any of the handle's own callbacks; the
    /// handle is never destroyed while one of its callbacks is on the
    /// stack. Idempotent.
    fn schedule_removal(&self, lp: &mut EventLoop) {
        lp.schedule_removal_id(self.handle_id());
    }

    /// Registers a callback fired when removal is scheduled.
    ///
    /// Does nothing if removal was already scheduled.
    fn set_on_schedule_removal<F>(&self, lp: &mut EventLoop, callback: F)
    where
        F: FnOnce(&mut EventLoop) + 'static,
    {
        lp.set_on_schedule_removal_id(self.handle_id(), Box::new(callback));
    }

    fn is_removal_scheduled(&self, lp: &EventLoop) -> bool {
        lp.is_removal_scheduled_id(self.handle_id())
    }

    /// Stores an opaque value on the handle, replacing any previous one.
    fn set_user_data<T: Any>(&self, lp: &mut EventLoop, value: T) {
        lp.set_user_data_id(self.handle_id(), Box::new(value));
    }

    fn user_data<'a, T: Any>(&self, lp: &'a EventLoop) -> Option<&'a T> {
        lp.user_data_id(self.handle_id())
            .and_then(|data| data.downcast_ref())
    }

    fn user_data_mut<'a, T: Any>(&self, lp: &'a mut EventLoop) -> Option<&'a mut T> {
        lp.user_data_mut_id(self.handle_id())
            .and_then(|data| data.downcast_mut())
    }

    fn take_user_data(&self, lp: &mut EventLoop) -> Option<Box<dyn Any>> {
        lp.take_user_data_id(self.handle_id())
    }
}

/// Reference counting on top of [`Handle`].
///
/// The count starts at 1 for the creator. Dropping it to zero schedules
/// removal; extra `unref_handle` calls at zero are no-ops.
pub trait RefCountedHandle: Handle {
    fn ref_handle(&self, lp: &mut EventLoop) {
        lp.ref_handle_id(self.handle_id());
    }

    fn unref_handle(&self, lp: &mut EventLoop) {
        lp.unref_handle_id(self.handle_id());
    }

    fn ref_count(&self, lp: &EventLoop) -> usize {
        lp.ref_count_id(self.handle_id())
    }
}
