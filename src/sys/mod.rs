//! OS selector layer.
//!
//! Only the Unix (epoll) backend is provided. The rest of the crate talks
//! to this module exclusively through `Selector`, `Events`, `Event` and
//! `Waker`.

#[cfg(unix)]
pub(crate) mod unix;

#[cfg(unix)]
pub(crate) use self::unix::{Event, Events, Interest, Selector, Waker};
