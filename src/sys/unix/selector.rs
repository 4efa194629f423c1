use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::token::Token;

/// Readiness interest used when registering a file descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Interest(u8);

impl Interest {
    pub(crate) const READABLE: Interest = Interest(0b01);
    pub(crate) const WRITABLE: Interest = Interest(0b10);

    pub(crate) const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    pub(crate) fn is_readable(self) -> bool {
        self.0 & Interest::READABLE.0 != 0
    }

    pub(crate) fn is_writable(self) -> bool {
        self.0 & Interest::WRITABLE.0 != 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, other: Interest) -> Interest {
        self.add(other)
    }
}

#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a zero timeout,
                // unless the caller explicitly requests that by specifying a
                // zero timeout.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis()
                    .min(libc::c_int::MAX as u128) as libc::c_int
            })
            .unwrap_or(-1);

        events.inner.clear();
        let n_events = match syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.inner.as_mut_ptr(),
            events.inner.capacity() as i32,
            timeout,
        )) {
            Ok(n) => n,
            // The wait is restarted by the caller's next cycle.
            Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => 0,
            Err(e) => return Err(e),
        };
        // SAFETY: `epoll_wait` ensures that `n_events` entries are assigned.
        unsafe { events.inner.set_len(n_events as usize) };
        Ok(())
    }

    pub(crate) fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: usize::from(token) as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: usize::from(token) as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut()
        ))
        .map(|_| ())
    }
}

fn interests_to_epoll(interests: Interest) -> u32 {
    // Level-triggered; the loop re-reads until `WouldBlock` anyway and
    // level triggering keeps partial drains safe.
    let mut kind = EPOLLRDHUP;
    if interests.is_readable() {
        kind |= EPOLLIN;
    }
    if interests.is_writable() {
        kind |= EPOLLOUT;
    }
    kind as u32
}

/// A single readiness event as reported by `epoll_wait`.
#[derive(Copy, Clone)]
pub(crate) struct Event {
    inner: libc::epoll_event,
}

impl Event {
    pub(crate) fn token(&self) -> Token {
        Token(self.inner.u64 as usize)
    }

    pub(crate) fn is_readable(&self) -> bool {
        self.inner.events as libc::c_int & (EPOLLIN | EPOLLHUP) != 0
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.inner.events as libc::c_int & (EPOLLOUT | EPOLLHUP) != 0
    }

    pub(crate) fn is_error(&self) -> bool {
        self.inner.events as libc::c_int & EPOLLERR != 0
    }

    pub(crate) fn is_read_closed(&self) -> bool {
        self.inner.events as libc::c_int & (EPOLLHUP | EPOLLRDHUP) != 0
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("token", &self.token())
            .field("readable", &self.is_readable())
            .field("writable", &self.is_writable())
            .field("error", &self.is_error())
            .finish()
    }
}

/// Buffer of events filled by [`Selector::select`].
pub(crate) struct Events {
    inner: Vec<libc::epoll_event>,
}

impl Events {
    pub(crate) fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(crate) fn get(&self, index: usize) -> Option<Event> {
        self.inner.get(index).map(|inner| Event { inner: *inner })
    }
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events").field("len", &self.len()).finish()
    }
}
