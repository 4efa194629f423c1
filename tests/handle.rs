use std::cell::Cell;
use std::rc::Rc;

use evio::{EventLoop, Handle, TcpClient, Timer};

mod util;
use util::init;

#[test]
fn on_schedule_removal_fires_exactly_once() {
    init();

    let fired = Rc::new(Cell::new(0usize));
    let fired_cb = Rc::clone(&fired);

    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    timer.set_on_schedule_removal(&mut lp, move |_lp| {
        fired_cb.set(fired_cb.get() + 1);
    });

    timer.schedule_removal(&mut lp);
    timer.schedule_removal(&mut lp);

    lp.run().unwrap();
    assert_eq!(fired.get(), 1);
}

#[test]
fn on_schedule_removal_registered_after_scheduling_never_fires() {
    init();

    let fired = Rc::new(Cell::new(false));
    let fired_cb = Rc::clone(&fired);

    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    timer.schedule_removal(&mut lp);
    // Registration after scheduling is a silent no-op.
    timer.set_on_schedule_removal(&mut lp, move |_lp| fired_cb.set(true));

    lp.run().unwrap();
    assert!(!fired.get());
}

#[test]
fn is_removal_scheduled_flips_once() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    assert!(!timer.is_removal_scheduled(&lp));
    timer.schedule_removal(&mut lp);
    assert!(timer.is_removal_scheduled(&lp));
}

#[test]
fn operations_on_removed_handles_are_ignored() {
    init();

    let calls = Rc::new(Cell::new(0usize));
    let calls_cb = Rc::clone(&calls);

    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    timer.schedule_removal(&mut lp);
    lp.run().unwrap();

    // The slot is reclaimed; a start on the stale handle does nothing.
    timer.start(&mut lp, 10, move |_lp, _timer| {
        calls_cb.set(calls_cb.get() + 1);
    });
    lp.run().unwrap();
    assert_eq!(calls.get(), 0);
    assert_eq!(timer.callback_call_counter(&lp), 0);
}

#[test]
fn removal_inside_own_callback_is_deferred() {
    init();

    let after_removal_ok = Rc::new(Cell::new(false));
    let after_removal_ok_cb = Rc::clone(&after_removal_ok);

    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    timer.start(&mut lp, 10, move |lp, timer| {
        timer.schedule_removal(lp);
        // Still alive while the callback is on the stack.
        after_removal_ok_cb.set(timer.is_removal_scheduled(lp));
    });

    lp.run().unwrap();
    assert!(after_removal_ok.get());
}

#[test]
fn user_data_round_trips_through_a_handle() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let client = TcpClient::new(&mut lp);

    assert!(client.user_data::<u32>(&lp).is_none());
    client.set_user_data(&mut lp, 17u32);
    assert_eq!(client.user_data::<u32>(&lp), Some(&17));

    *client.user_data_mut::<u32>(&mut lp).unwrap() = 18;
    assert_eq!(client.user_data::<u32>(&lp), Some(&18));

    // A different type does not match.
    assert!(client.user_data::<String>(&lp).is_none());

    let taken = client.take_user_data(&mut lp).unwrap();
    assert_eq!(taken.downcast_ref::<u32>(), Some(&18));
    assert!(client.user_data::<u32>(&lp).is_none());
}
