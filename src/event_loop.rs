use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{trace, warn};
use slab::Slab;

use crate::error::{Error, StatusCode};
use crate::handle::{HandleEntry, HandleId, HandleKind, KindTag};
use crate::net::Endpoint;
use crate::sys;
use crate::thread_pool::ThreadPool;
use crate::token::Token;

/// Token reserved for the cross-thread waker.
const WAKE: Token = Token(usize::MAX);

/// Scratch buffer shared by all stream and datagram reads. Large enough
/// for a full UDP datagram.
pub(crate) const READ_BUFFER_SIZE: usize = 65536;

/// Configure `EventLoop` runtime details.
#[derive(Copy, Clone, Debug)]
pub struct EventLoopConfig {
    /// Capacity of the readiness-event buffer handed to the OS selector.
    pub events_capacity: usize,
    /// Upper bound of worker threads used by `add_work`, filesystem
    /// requests and DNS resolution.
    pub thread_pool_size: usize,
}

impl Default for EventLoopConfig {
    fn default() -> EventLoopConfig {
        EventLoopConfig {
            events_capacity: 1_024,
            thread_pool_size: 4,
        }
    }
}

type Posted = Box<dyn FnOnce(&mut EventLoop) + Send>;
type Deferred = Box<dyn FnOnce(&mut EventLoop)>;
type CycleCallback = Box<dyn FnMut(&mut EventLoop)>;
type WorkCompletion = Box<dyn FnOnce(&mut EventLoop, Box<dyn Any + Send>)>;

/// What a matured deadline refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DeadlineKind {
    Timer,
    UdpPeerTimeout,
    UdpGraveyard(Endpoint),
    UdpClientTimeout,
}

#[derive(Debug)]
struct Deadline {
    at: Instant,
    token: Token,
    seq: u64,
    kind: DeadlineKind,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Deadline) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Deadline) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Deadline) -> std::cmp::Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

/// Single-threaded cooperative I/O event loop.
///
/// A loop owns every handle allocated against it. User code registers
/// callbacks on handles and calls [`run`], which processes readiness
/// events, matured timers, per-cycle callbacks and cross-thread posts
/// until no handle is active, nothing is queued and the block-from-exit
/// counter is zero.
///
/// All handle operations must be invoked from the loop's thread. The only
/// cross-thread entry point is [`LoopSender::execute_on_loop_thread`],
/// obtainable via [`sender`].
///
/// [`run`]: EventLoop::run
/// [`sender`]: EventLoop::sender
pub struct EventLoop {
    selector: sys::Selector,
    events: Option<sys::Events>,
    events_capacity: usize,
    waker: Arc<sys::Waker>,
    pub(crate) handles: Slab<HandleEntry>,
    next_gen: u32,
    deadlines: BinaryHeap<Reverse<Deadline>>,
    next_deadline_seq: u64,
    posted_tx: Sender<Posted>,
    posted_rx: Receiver<Posted>,
    deferred: VecDeque<Deferred>,
    cycle_callbacks: Slab<Option<CycleCallback>>,
    removals: Vec<Token>,
    block_exit: usize,
    pending_work: usize,
    completions: Slab<WorkCompletion>,
    pool: ThreadPool,
    running: bool,
    user_data: Option<Box<dyn Any>>,
    pub(crate) scratch: Box<[u8]>,
}

/// Thread-safe sender posting callables to an [`EventLoop`].
///
/// Obtained from [`EventLoop::sender`]; may be cloned and moved to any
/// thread. Posted callables run on the loop thread on its next cycle.
#[derive(Clone)]
pub struct LoopSender {
    tx: Sender<Posted>,
    waker: Arc<sys::Waker>,
}

impl std::fmt::Debug for LoopSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopSender").finish()
    }
}

impl LoopSender {
    /// Enqueues `callback` to run on the loop thread, waking the loop if
    /// it is blocked in the selector.
    pub fn execute_on_loop_thread<F>(&self, callback: F)
    where
        F: FnOnce(&mut EventLoop) + Send + 'static,
    {
        let _ = self.tx.send(Box::new(callback));
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake event loop: {}", e);
        }
    }
}

impl EventLoop {
    pub fn new() -> Result<EventLoop, Error> {
        EventLoop::with_config(EventLoopConfig::default())
    }

    pub fn with_config(config: EventLoopConfig) -> Result<EventLoop, Error> {
        let selector = sys::Selector::new().map_err(Error::from)?;
        let waker = Arc::new(sys::Waker::new().map_err(Error::from)?);
        selector
            .register(waker.as_raw_fd(), WAKE, sys::Interest::READABLE)
            .map_err(Error::from)?;

        let (posted_tx, posted_rx) = unbounded();

        Ok(EventLoop {
            selector,
            events: Some(sys::Events::with_capacity(config.events_capacity)),
            events_capacity: config.events_capacity,
            waker,
            handles: Slab::new(),
            next_gen: 1,
            deadlines: BinaryHeap::new(),
            next_deadline_seq: 1,
            posted_tx,
            posted_rx,
            deferred: VecDeque::new(),
            cycle_callbacks: Slab::new(),
            removals: Vec::new(),
            block_exit: 0,
            pending_work: 0,
            completions: Slab::new(),
            pool: ThreadPool::new(config.thread_pool_size),
            running: false,
            user_data: None,
            scratch: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
        })
    }

    /// Runs the loop until no handle is active, nothing is queued and the
    /// block-from-exit counter is zero.
    ///
    /// Not reentrant; calling `run` from inside a callback fails with
    /// [`StatusCode::OperationAlreadyInProgress`].
    pub fn run(&mut self) -> Result<(), Error> {
        if self.running {
            return Err(Error::new(StatusCode::OperationAlreadyInProgress));
        }

        self.running = true;
        trace!("event loop running");

        let mut result = Ok(());
        while self.keeps_running() {
            if let Err(e) = self.turn() {
                result = Err(e);
                break;
            }
        }

        self.running = false;
        trace!("event loop finished");
        result
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Returns a cloneable, `Send` handle for posting callables to this
    /// loop from other threads.
    pub fn sender(&self) -> LoopSender {
        LoopSender {
            tx: self.posted_tx.clone(),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Enqueues `callback` to run on the loop thread on the next cycle.
    ///
    /// Equivalent to going through [`sender`]; usable directly when the
    /// loop itself is reachable.
    ///
    /// [`sender`]: EventLoop::sender
    pub fn execute_on_loop_thread<F>(&self, callback: F)
    where
        F: FnOnce(&mut EventLoop) + Send + 'static,
    {
        let _ = self.posted_tx.send(Box::new(callback));
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake event loop: {}", e);
        }
    }

    /// Defers `callback` to the tail of the current cycle. Not thread
    /// safe; blocks the loop from exiting until executed.
    pub fn schedule_callback<F>(&mut self, callback: F)
    where
        F: FnOnce(&mut EventLoop) + 'static,
    {
        self.deferred.push_back(Box::new(callback));
    }

    /// Registers `callback` to run once per loop cycle until stopped via
    /// [`stop_call_on_each_loop_cycle`]. The callback must not block; it
    /// keeps the loop alive and busy.
    ///
    /// [`stop_call_on_each_loop_cycle`]: EventLoop::stop_call_on_each_loop_cycle
    pub fn schedule_call_on_each_loop_cycle<F>(&mut self, callback: F) -> usize
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        self.cycle_callbacks.insert(Some(Box::new(callback)))
    }

    pub fn stop_call_on_each_loop_cycle(&mut self, handle: usize) {
        if self.cycle_callbacks.contains(handle) {
            self.cycle_callbacks.remove(handle);
        }
    }

    /// Keeps `run` from returning even when no handle is active. Paired
    /// with [`stop_block_loop_from_exit`].
    ///
    /// [`stop_block_loop_from_exit`]: EventLoop::stop_block_loop_from_exit
    pub fn start_block_loop_from_exit(&mut self) {
        self.block_exit += 1;
    }

    pub fn stop_block_loop_from_exit(&mut self) {
        if self.block_exit == 0 {
            warn!("stop_block_loop_from_exit called without matching start");
            return;
        }
        self.block_exit -= 1;
    }

    /// Runs `work` on a worker thread.
    pub fn add_work<W>(&mut self, work: W)
    where
        W: FnOnce() + Send + 'static,
    {
        self.add_work_with_result(work, |_, ()| {});
    }

    /// Runs `work` on a worker thread, then `done` on the loop thread.
    pub fn add_work_with_done<W, D>(&mut self, work: W, done: D)
    where
        W: FnOnce() + Send + 'static,
        D: FnOnce(&mut EventLoop) + 'static,
    {
        self.add_work_with_result(work, move |lp, ()| done(lp));
    }

    /// Runs `work` on a worker thread and hands its result to `done` on
    /// the loop thread.
    pub fn add_work_with_result<W, R, D>(&mut self, work: W, done: D)
    where
        W: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
        D: FnOnce(&mut EventLoop, R) + 'static,
    {
        let key = self.completions.insert(Box::new(move |lp, payload| {
            // The payload type is fixed by the matching `work` closure.
            if let Ok(result) = payload.downcast::<R>() {
                done(lp, *result);
            }
        }));
        self.pending_work += 1;

        let tx = self.posted_tx.clone();
        let waker = Arc::clone(&self.waker);
        self.pool.execute(Box::new(move || {
            let payload: Box<dyn Any + Send> = Box::new(work());
            let _ = tx.send(Box::new(move |lp: &mut EventLoop| {
                lp.finish_work(key, payload);
            }));
            let _ = waker.wake();
        }));
    }

    fn finish_work(&mut self, key: usize, payload: Box<dyn Any + Send>) {
        self.pending_work -= 1;
        if self.completions.contains(key) {
            let done = self.completions.remove(key);
            done(self, payload);
        }
    }

    /// Stores an opaque value on the loop itself.
    pub fn set_user_data<T: Any>(&mut self, value: T) {
        self.user_data = Some(Box::new(value));
    }

    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_deref().and_then(|d| d.downcast_ref())
    }

    pub fn user_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.user_data.as_deref_mut().and_then(|d| d.downcast_mut())
    }

    pub fn take_user_data(&mut self) -> Option<Box<dyn Any>> {
        self.user_data.take()
    }

    // === Cycle machinery ===

    fn keeps_running(&self) -> bool {
        self.block_exit > 0
            || self.pending_work > 0
            || !self.deferred.is_empty()
            || !self.posted_rx.is_empty()
            || !self.cycle_callbacks.is_empty()
            || !self.removals.is_empty()
            || self.handles.iter().any(|(_, entry)| entry.is_active())
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if !self.cycle_callbacks.is_empty()
            || !self.deferred.is_empty()
            || !self.posted_rx.is_empty()
        {
            return Some(Duration::ZERO);
        }
        self.deadlines
            .peek()
            .map(|Reverse(d)| d.at.saturating_duration_since(Instant::now()))
    }

    fn turn(&mut self) -> Result<(), Error> {
        let timeout = self.poll_timeout();

        let mut events = self
            .events
            .take()
            .unwrap_or_else(|| sys::Events::with_capacity(self.events_capacity));
        let res = self.selector.select(&mut events, timeout);

        for i in 0..events.len() {
            if let Some(event) = events.get(i) {
                self.dispatch_event(event);
            }
        }
        self.events = Some(events);
        res.map_err(Error::from)?;

        self.drain_posted();
        self.fire_deadlines();
        self.run_cycle_callbacks();
        self.drain_deferred();
        self.sweep_removals();
        Ok(())
    }

    fn dispatch_event(&mut self, event: sys::Event) {
        let token = event.token();
        if token == WAKE {
            if let Err(e) = self.waker.reset() {
                warn!("failed to reset waker: {}", e);
            }
            return;
        }

        let tag = match self.handles.get(token.0) {
            Some(entry) => entry.kind.tag(),
            None => {
                trace!("event for vacated handle; token={:?}", token);
                return;
            }
        };

        match tag {
            KindTag::TcpClient => crate::net::tcp_client::on_event(self, token, event),
            KindTag::TcpServer => crate::net::tcp_server::on_event(self, token, event),
            KindTag::TcpConn => crate::net::tcp_conn::on_event(self, token, event),
            KindTag::UdpServer => crate::net::udp_server::on_event(self, token, event),
            KindTag::UdpClient => crate::net::udp_client::on_event(self, token, event),
            _ => trace!("spurious event; token={:?}", token),
        }
    }

    fn drain_posted(&mut self) {
        while let Ok(posted) = self.posted_rx.try_recv() {
            posted(self);
        }
    }

    fn fire_deadlines(&mut self) {
        // Deadlines armed during dispatch target a later `Instant` and are
        // picked up on a following cycle, never this one.
        let now = Instant::now();
        loop {
            match self.deadlines.peek() {
                Some(Reverse(d)) if d.at <= now => {}
                _ => break,
            }
            let Some(Reverse(deadline)) = self.deadlines.pop() else {
                break;
            };
            match deadline.kind {
                DeadlineKind::Timer => {
                    crate::timer::on_deadline(self, deadline.token, deadline.seq);
                }
                DeadlineKind::UdpPeerTimeout => {
                    crate::net::udp_server::on_peer_deadline(self, deadline.token, deadline.seq);
                }
                DeadlineKind::UdpGraveyard(endpoint) => {
                    crate::net::udp_server::on_graveyard_deadline(self, deadline.token, endpoint);
                }
                DeadlineKind::UdpClientTimeout => {
                    crate::net::udp_client::on_timeout_deadline(self, deadline.token, deadline.seq);
                }
            }
        }
    }

    fn run_cycle_callbacks(&mut self) {
        let keys: Vec<usize> = self.cycle_callbacks.iter().map(|(k, _)| k).collect();
        for key in keys {
            let callback = match self.cycle_callbacks.get_mut(key) {
                Some(slot) => slot.take(),
                None => continue,
            };
            if let Some(mut callback) = callback {
                callback(self);
                // Put the callback back unless it stopped itself.
                if let Some(slot) = self.cycle_callbacks.get_mut(key) {
                    if slot.is_none() {
                        *slot = Some(callback);
                    }
                }
            }
        }
    }

    fn drain_deferred(&mut self) {
        // Callables queued while draining run on the next cycle.
        let n = self.deferred.len();
        for _ in 0..n {
            let Some(deferred) = self.deferred.pop_front() else {
                break;
            };
            deferred(self);
        }
    }

    fn sweep_removals(&mut self) {
        if self.removals.is_empty() {
            return;
        }
        let pending = mem::take(&mut self.removals);
        for token in pending {
            let drained = match self.handles.get(token.0) {
                Some(entry) if entry.removal_scheduled => entry.is_drained(),
                _ => continue,
            };
            if drained {
                trace!("handle destroyed; token={:?}", token);
                self.handles.remove(token.0);
            } else {
                self.removals.push(token);
            }
        }
    }

    // === Handle arena plumbing (crate internal) ===

    pub(crate) fn allocate_handle(&mut self, kind: HandleKind) -> HandleId {
        let gen = self.next_gen;
        self.next_gen = self.next_gen.wrapping_add(1);
        let token = Token(self.handles.insert(HandleEntry {
            gen,
            kind,
            removal_scheduled: false,
            on_removal: None,
            refs: 1,
            user_data: None,
        }));
        trace!("handle allocated; token={:?}", token);
        HandleId { token, gen }
    }

    pub(crate) fn entry_mut(&mut self, token: Token) -> Option<&mut HandleEntry> {
        self.handles.get_mut(token.0)
    }

    pub(crate) fn resolve_mut(&mut self, id: HandleId) -> Option<&mut HandleEntry> {
        self.handles.get_mut(id.token.0).filter(|e| e.gen == id.gen)
    }

    pub(crate) fn resolve_ref(&self, id: HandleId) -> Option<&HandleEntry> {
        self.handles.get(id.token.0).filter(|e| e.gen == id.gen)
    }

    /// Generation of the entry currently occupying `token`'s slot.
    pub(crate) fn gen_of(&self, token: Token) -> Option<u32> {
        self.handles.get(token.0).map(|e| e.gen)
    }

    pub(crate) fn schedule_removal_id(&mut self, id: HandleId) {
        let token = id.token;
        let Some(entry) = self.resolve_mut(id) else {
            return;
        };
        if entry.removal_scheduled {
            return;
        }
        entry.removal_scheduled = true;
        let on_removal = entry.on_removal.take();
        let tag = entry.kind.tag();
        trace!("removal scheduled; token={:?}", token);

        if let Some(callback) = on_removal {
            callback(self);
        }

        match tag {
            KindTag::Timer => crate::timer::teardown(self, token),
            KindTag::TcpClient => crate::net::tcp_client::teardown(self, token),
            KindTag::TcpServer => crate::net::tcp_server::teardown(self, token),
            KindTag::TcpConn => crate::net::tcp_conn::teardown(self, token),
            KindTag::UdpServer => crate::net::udp_server::teardown(self, token),
            KindTag::UdpPeer => crate::net::udp_peer::teardown(self, token),
            KindTag::UdpClient => crate::net::udp_client::teardown(self, token),
            KindTag::File => crate::fs::file::teardown(self, token),
            KindTag::Dir => crate::fs::dir::teardown(self, token),
        }

        self.removals.push(token);
    }

    pub(crate) fn set_on_schedule_removal_id(
        &mut self,
        id: HandleId,
        callback: Box<dyn FnOnce(&mut EventLoop)>,
    ) {
        if let Some(entry) = self.resolve_mut(id) {
            // Ignored once removal is underway.
            if !entry.removal_scheduled {
                entry.on_removal = Some(callback);
            }
        }
    }

    pub(crate) fn is_removal_scheduled_id(&self, id: HandleId) -> bool {
        self.resolve_ref(id).is_some_and(|e| e.removal_scheduled)
    }

    pub(crate) fn ref_handle_id(&mut self, id: HandleId) {
        if let Some(entry) = self.resolve_mut(id) {
            entry.refs += 1;
        }
    }

    pub(crate) fn unref_handle_id(&mut self, id: HandleId) {
        let Some(entry) = self.resolve_mut(id) else {
            return;
        };
        if entry.refs == 0 {
            return;
        }
        entry.refs -= 1;
        if entry.refs == 0 {
            self.schedule_removal_id(id);
        }
    }

    pub(crate) fn ref_count_id(&self, id: HandleId) -> usize {
        self.resolve_ref(id).map_or(0, |e| e.refs)
    }

    pub(crate) fn set_user_data_id(&mut self, id: HandleId, data: Box<dyn Any>) {
        if let Some(entry) = self.resolve_mut(id) {
            entry.user_data = Some(data);
        }
    }

    pub(crate) fn user_data_id(&self, id: HandleId) -> Option<&dyn Any> {
        self.resolve_ref(id).and_then(|e| e.user_data.as_deref())
    }

    pub(crate) fn user_data_mut_id(&mut self, id: HandleId) -> Option<&mut dyn Any> {
        self.resolve_mut(id).and_then(|e| e.user_data.as_deref_mut())
    }

    pub(crate) fn take_user_data_id(&mut self, id: HandleId) -> Option<Box<dyn Any>> {
        self.resolve_mut(id).and_then(|e| e.user_data.take())
    }

    // === Deadline and selector plumbing (crate internal) ===

    pub(crate) fn arm_deadline(&mut self, at: Instant, token: Token, kind: DeadlineKind) -> u64 {
        let seq = self.next_deadline_seq;
        self.next_deadline_seq += 1;
        self.deadlines.push(Reverse(Deadline {
            at,
            token,
            seq,
            kind,
        }));
        seq
    }

    pub(crate) fn register_io(
        &self,
        fd: RawFd,
        token: Token,
        interest: sys::Interest,
    ) -> io::Result<()> {
        self.selector.register(fd, token, interest)
    }

    pub(crate) fn reregister_io(
        &self,
        fd: RawFd,
        token: Token,
        interest: sys::Interest,
    ) -> io::Result<()> {
        self.selector.reregister(fd, token, interest)
    }

    pub(crate) fn deregister_io(&self, fd: RawFd) -> io::Result<()> {
        self.selector.deregister(fd)
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("running", &self.running)
            .field("handles", &self.handles.len())
            .field("block_exit", &self.block_exit)
            .field("pending_work", &self.pending_work)
            .finish()
    }
}
