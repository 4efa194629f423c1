//! Send-queue plumbing shared by the TCP client and server-side
//! connection handles.

use std::collections::VecDeque;
use std::io;

use socket2::Socket;

use crate::buf::SharedBuf;

/// A queued send: the buffer, how much of it the kernel accepted so far
/// and the user completion callback.
pub(crate) struct SendRequest<C> {
    pub(crate) buf: SharedBuf,
    pub(crate) written: usize,
    pub(crate) callback: Option<C>,
}

impl<C> SendRequest<C> {
    pub(crate) fn new(buf: SharedBuf, callback: Option<C>) -> SendRequest<C> {
        SendRequest {
            buf,
            written: 0,
            callback,
        }
    }
}

/// Result of pushing queued sends into the kernel.
pub(crate) enum FlushOutcome<C> {
    /// Queue empty; completion callbacks to fire in send-issue order.
    Drained(Vec<C>),
    /// Kernel buffer full; writable interest must stay registered.
    WouldBlock(Vec<C>),
    /// Stream failed; the remaining queue should be canceled.
    Failed(io::Error, Vec<C>),
}

/// Writes queued buffers until the queue drains or the kernel pushes
/// back. Completion callbacks are collected, not invoked; the caller fires
/// them after releasing its borrow of the handle state.
pub(crate) fn flush_queue<C>(
    socket: &Socket,
    queue: &mut VecDeque<SendRequest<C>>,
) -> FlushOutcome<C> {
    let mut completed = Vec::new();
    loop {
        let Some(front) = queue.front_mut() else {
            return FlushOutcome::Drained(completed);
        };
        let data = &front.buf[front.written..];
        match socket.send(data) {
            Ok(n) => {
                front.written += n;
                if front.written == front.buf.len() {
                    if let Some(request) = queue.pop_front() {
                        if let Some(callback) = request.callback {
                            completed.push(callback);
                        }
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return FlushOutcome::WouldBlock(completed);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return FlushOutcome::Failed(e, completed),
        }
    }
}

/// Takes every pending request's callback, for cancellation.
pub(crate) fn drain_callbacks<C>(queue: &mut VecDeque<SendRequest<C>>) -> Vec<C> {
    queue.drain(..).filter_map(|request| request.callback).collect()
}
