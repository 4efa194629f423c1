use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Cross-thread wakeup for a blocked selector, backed by `eventfd(2)`.
///
/// The loop registers the waker's fd for readability; any thread holding an
/// `Arc<Waker>` can interrupt `epoll_wait` by writing to it.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let flags = libc::EFD_CLOEXEC | libc::EFD_NONBLOCK;
        // SAFETY: `eventfd(2)` ensures the fd is valid.
        let fd = unsafe { OwnedFd::from_raw_fd(syscall!(eventfd(0, flags))?) };
        Ok(Waker { fd })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match syscall!(write(
            self.fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len()
        )) {
            Ok(_) => Ok(()),
            // The counter hit its max value; a wakeup is already pending.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Resets the counter after the readiness event was observed.
    pub(crate) fn reset(&self) -> io::Result<()> {
        let mut buf = [0u8; 8];
        match syscall!(read(
            self.fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        )) {
            Ok(_) => Ok(()),
            // A spurious wakeup leaves nothing to drain.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
