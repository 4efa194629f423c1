use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::trace;

use crate::event_loop::{DeadlineKind, EventLoop};
use crate::handle::{Handle, HandleId, HandleKind};
use crate::token::Token;

/// One-shot, repeating or multi-interval timer.
///
/// A timer fires its callback after each armed interval. Restarting a
/// running timer (including from inside its own callback) replaces the
/// schedule and callback and resets the call counter; the replaced
/// callback stays alive until the end of the current loop cycle so state
/// captured by it is not dropped mid-call.
///
/// # Examples
///
/// ```no_run
/// use evio::{EventLoop, Timer};
///
/// let mut lp = EventLoop::new().unwrap();
/// let timer = Timer::new(&mut lp);
/// timer.start(&mut lp, 100, |lp, timer| {
///     println!("fired after {:?}", timer.real_time_passed_since_last_callback(lp));
/// });
/// lp.run().unwrap();
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timer {
    id: HandleId,
}

pub(crate) type TimerCallback = Box<dyn FnMut(&mut EventLoop, Timer)>;

pub(crate) struct TimerState {
    schedule: VecDeque<u64>,
    repeat_ms: u64,
    current_timeout_ms: u64,
    // Final schedule entry was armed with a repeat interval.
    repeating: bool,
    callback: Option<TimerCallback>,
    call_counter: usize,
    // Set by `start` so an in-callback restart keeps the dispatcher from
    // advancing the replaced schedule.
    state_reset: bool,
    last_callback_at: Instant,
    active: bool,
    deadline_seq: u64,
}

impl TimerState {
    fn new() -> TimerState {
        TimerState {
            schedule: VecDeque::new(),
            repeat_ms: 0,
            current_timeout_ms: 0,
            repeating: false,
            callback: None,
            call_counter: 0,
            state_reset: false,
            last_callback_at: Instant::now(),
            active: false,
            deadline_seq: 0,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active
    }
}

fn state_mut(lp: &mut EventLoop, token: Token) -> Option<&mut TimerState> {
    match lp.entry_mut(token) {
        Some(entry) => match &mut entry.kind {
            HandleKind::Timer(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

fn state_ref(lp: &EventLoop, id: HandleId) -> Option<&TimerState> {
    match lp.resolve_ref(id) {
        Some(entry) => match &entry.kind {
            HandleKind::Timer(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

impl Timer {
    pub fn new(lp: &mut EventLoop) -> Timer {
        let id = lp.allocate_handle(HandleKind::Timer(TimerState::new()));
        Timer { id }
    }

    /// Arms a one-shot fire after `timeout_ms`.
    pub fn start<F>(&self, lp: &mut EventLoop, timeout_ms: u64, callback: F)
    where
        F: FnMut(&mut EventLoop, Timer) + 'static,
    {
        self.start_series_repeating(lp, [timeout_ms], 0, callback);
    }

    /// Arms an initial delay of `timeout_ms`, then fires every `repeat_ms`.
    pub fn start_repeating<F>(&self, lp: &mut EventLoop, timeout_ms: u64, repeat_ms: u64, callback: F)
    where
        F: FnMut(&mut EventLoop, Timer) + 'static,
    {
        self.start_series_repeating(lp, [timeout_ms], repeat_ms, callback);
    }

    /// Fires once per entry of `timeouts_ms`, in order, then stops.
    ///
    /// An empty series only resets the call counter; the previous schedule
    /// and callback stay in place.
    pub fn start_series<I, F>(&self, lp: &mut EventLoop, timeouts_ms: I, callback: F)
    where
        I: IntoIterator<Item = u64>,
        F: FnMut(&mut EventLoop, Timer) + 'static,
    {
        self.start_series_repeating(lp, timeouts_ms, 0, callback);
    }

    /// Fires through `timeouts_ms`; after the final entry keeps firing
    /// every `repeat_ms` (if non-zero).
    pub fn start_series_repeating<I, F>(
        &self,
        lp: &mut EventLoop,
        timeouts_ms: I,
        repeat_ms: u64,
        callback: F,
    ) where
        I: IntoIterator<Item = u64>,
        F: FnMut(&mut EventLoop, Timer) + 'static,
    {
        let token = self.id.token;
        if lp.resolve_mut(self.id).is_none() {
            return;
        }
        let timeouts: VecDeque<u64> = timeouts_ms.into_iter().collect();

        let old_callback = {
            let Some(state) = state_mut(lp, token) else {
                return;
            };
            state.call_counter = 0;
            state.last_callback_at = Instant::now();

            if timeouts.is_empty() {
                return;
            }

            state.state_reset = true;
            let old = state.callback.take();
            state.schedule = timeouts;
            state.repeat_ms = repeat_ms;
            state.repeating = false;
            state.callback = Some(Box::new(callback));
            old
        };

        // Keep the replaced callback alive until the cycle's tail so state
        // it captured outlives the call that may be replacing it.
        if let Some(old) = old_callback {
            lp.schedule_callback(move |_| drop(old));
        }

        arm_next(lp, token);
    }

    /// Cancels pending fires. The timer handle stays usable; `start` arms
    /// it again.
    pub fn stop(&self, lp: &mut EventLoop) {
        let Some(state) = state_mut(lp, self.id.token) else {
            return;
        };
        state.active = false;
        state.repeating = false;
        state.schedule.clear();
        trace!("timer stopped; token={:?}", self.id.token);
    }

    /// Interval armed for the pending (or most recent) fire.
    pub fn timeout_ms(&self, lp: &EventLoop) -> u64 {
        state_ref(lp, self.id).map_or(0, |s| s.current_timeout_ms)
    }

    pub fn repeat_ms(&self, lp: &EventLoop) -> u64 {
        state_ref(lp, self.id).map_or(0, |s| s.repeat_ms)
    }

    /// Number of fires of the current schedule; 0 inside the first call.
    pub fn callback_call_counter(&self, lp: &EventLoop) -> usize {
        state_ref(lp, self.id).map_or(0, |s| s.call_counter)
    }

    /// Monotonic time elapsed since the last fire, or since `start` if the
    /// timer has not fired yet.
    pub fn real_time_passed_since_last_callback(&self, lp: &EventLoop) -> Duration {
        state_ref(lp, self.id).map_or(Duration::ZERO, |s| s.last_callback_at.elapsed())
    }
}

impl Handle for Timer {
    fn handle_id(&self) -> HandleId {
        self.id
    }
}

/// Arms the next schedule entry.
fn arm_next(lp: &mut EventLoop, token: Token) {
    let (timeout_ms, at) = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        let Some(timeout_ms) = state.schedule.pop_front() else {
            return;
        };
        state.current_timeout_ms = timeout_ms;
        state.repeating = state.schedule.is_empty() && state.repeat_ms > 0;
        state.active = true;
        (timeout_ms, Instant::now() + Duration::from_millis(timeout_ms))
    };

    let seq = lp.arm_deadline(at, token, DeadlineKind::Timer);
    if let Some(state) = state_mut(lp, token) {
        state.deadline_seq = seq;
    }
    trace!("timer armed; token={:?}; timeout_ms={}", token, timeout_ms);
}

/// Fires a matured timer deadline.
pub(crate) fn on_deadline(lp: &mut EventLoop, token: Token, seq: u64) {
    let (callback, timer) = {
        let Some(gen) = lp.gen_of(token) else {
            return;
        };
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        if !state.active || state.deadline_seq != seq {
            // Stale deadline of a stopped or restarted schedule.
            return;
        }
        state.state_reset = false;
        let timer = Timer {
            id: HandleId { token, gen },
        };
        (state.callback.take(), timer)
    };

    let callback = match callback {
        Some(mut callback) => {
            callback(lp, timer);
            callback
        }
        None => return,
    };

    let Some(state) = state_mut(lp, token) else {
        // Destroyed during the callback; nothing left to advance.
        lp.schedule_callback(move |_| drop(callback));
        return;
    };
    state.last_callback_at = Instant::now();

    if state.state_reset {
        // The callback restarted the timer: the new schedule is already
        // armed, and the executing callback is dropped at the cycle tail.
        lp.schedule_callback(move |_| drop(callback));
        return;
    }

    if state.callback.is_none() {
        state.callback = Some(callback);
    }
    state.call_counter += 1;

    if !state.active {
        // Stopped (or removal-scheduled) inside the callback.
        return;
    }

    if !state.schedule.is_empty() {
        arm_next(lp, token);
    } else if state.repeating {
        let repeat_ms = state.repeat_ms;
        let at = Instant::now() + Duration::from_millis(repeat_ms);
        let seq = lp.arm_deadline(at, token, DeadlineKind::Timer);
        if let Some(state) = state_mut(lp, token) {
            state.deadline_seq = seq;
        }
    } else {
        state.active = false;
    }
}

/// `schedule_removal` implicitly stops the timer.
pub(crate) fn teardown(lp: &mut EventLoop, token: Token) {
    if let Some(state) = state_mut(lp, token) {
        state.active = false;
        state.repeating = false;
        state.schedule.clear();
    }
}
