use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use evio::{EventLoop, Handle, Timer};

mod util;
use util::init;

#[test]
fn one_shot_fires_once() {
    init();

    let calls = Rc::new(Cell::new(0usize));
    let calls_cb = Rc::clone(&calls);
    let counter_inside = Rc::new(Cell::new(usize::MAX));
    let counter_inside_cb = Rc::clone(&counter_inside);

    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    timer.start(&mut lp, 50, move |lp, timer| {
        calls_cb.set(calls_cb.get() + 1);
        // The counter reports fires of the current schedule and reads 0
        // inside the first call.
        counter_inside_cb.set(timer.callback_call_counter(lp));
    });

    let started = Instant::now();
    lp.run().unwrap();

    assert_eq!(calls.get(), 1);
    assert_eq!(counter_inside.get(), 0);
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(timer.callback_call_counter(&lp), 1);
}

#[test]
fn non_zero_timeout_keeps_loop_alive() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    timer.start(&mut lp, 120, |_lp, _timer| {});

    let started = Instant::now();
    lp.run().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn repeating_fires_until_stopped() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    timer.start_repeating(&mut lp, 20, 20, move |lp, timer| {
        if timer.callback_call_counter(lp) >= 4 {
            timer.stop(lp);
        }
    });

    lp.run().unwrap();
    assert_eq!(timer.callback_call_counter(&lp), 5);
    assert_eq!(timer.repeat_ms(&lp), 20);
}

#[test]
fn series_fires_once_per_entry() {
    init();

    let intervals = Rc::new(RefCell::new(Vec::new()));
    let intervals_cb = Rc::clone(&intervals);
    let last = Rc::new(Cell::new(Instant::now()));
    let last_cb = Rc::clone(&last);

    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    last.set(Instant::now());
    timer.start_series(&mut lp, [100u64, 200, 300], move |_lp, _timer| {
        intervals_cb.borrow_mut().push(last_cb.get().elapsed());
        last_cb.set(Instant::now());
    });

    lp.run().unwrap();

    let intervals = intervals.borrow();
    assert_eq!(intervals.len(), 3);
    // Generous margins; scheduling jitter is expected.
    assert!(intervals[0] >= Duration::from_millis(70), "{:?}", intervals[0]);
    assert!(intervals[0] <= Duration::from_millis(250), "{:?}", intervals[0]);
    assert!(intervals[1] >= Duration::from_millis(170), "{:?}", intervals[1]);
    assert!(intervals[1] <= Duration::from_millis(350), "{:?}", intervals[1]);
    assert!(intervals[2] >= Duration::from_millis(270), "{:?}", intervals[2]);
    assert!(intervals[2] <= Duration::from_millis(450), "{:?}", intervals[2]);
    assert_eq!(timer.callback_call_counter(&lp), 3);
}

#[test]
fn series_with_repeat_continues_after_last_entry() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    timer.start_series_repeating(&mut lp, [10u64, 10], 15, move |lp, timer| {
        if timer.callback_call_counter(lp) >= 5 {
            timer.stop(lp);
        }
    });

    lp.run().unwrap();
    assert_eq!(timer.callback_call_counter(&lp), 6);
}

#[test]
fn restart_inside_callback_resets_state() {
    init();

    let first_calls = Rc::new(Cell::new(0usize));
    let second_calls = Rc::new(Cell::new(0usize));
    let first_calls_cb = Rc::clone(&first_calls);
    let second_calls_cb = Rc::clone(&second_calls);

    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    timer.start(&mut lp, 20, move |lp, timer| {
        first_calls_cb.set(first_calls_cb.get() + 1);
        // Replacing the schedule inside the callback must not advance the
        // replaced schedule's counter.
        assert_eq!(timer.callback_call_counter(lp), 0);
        let second_calls = Rc::clone(&second_calls_cb);
        timer.start(lp, 30, move |lp, timer| {
            second_calls.set(second_calls.get() + 1);
            assert_eq!(timer.callback_call_counter(lp), 0);
            timer.stop(lp);
        });
    });

    lp.run().unwrap();
    assert_eq!(first_calls.get(), 1);
    assert_eq!(second_calls.get(), 1);
}

#[test]
fn stop_cancels_pending_fire() {
    init();

    let calls = Rc::new(Cell::new(0usize));
    let calls_cb = Rc::clone(&calls);

    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    timer.start(&mut lp, 500, move |_lp, _timer| {
        calls_cb.set(calls_cb.get() + 1);
    });
    timer.stop(&mut lp);

    let started = Instant::now();
    lp.run().unwrap();
    assert_eq!(calls.get(), 0);
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[test]
fn empty_series_keeps_previous_schedule_inert() {
    init();

    let calls = Rc::new(Cell::new(0usize));
    let calls_cb = Rc::clone(&calls);

    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    timer.start_series(&mut lp, std::iter::empty::<u64>(), move |_lp, _timer| {
        calls_cb.set(calls_cb.get() + 1);
    });

    lp.run().unwrap();
    assert_eq!(calls.get(), 0);
}

#[test]
fn timeout_getter_reflects_current_interval() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    timer.start(&mut lp, 75, |lp, timer| {
        assert_eq!(timer.timeout_ms(lp), 75);
    });
    assert_eq!(timer.timeout_ms(&lp), 75);
    lp.run().unwrap();
}

#[test]
fn real_time_passed_measures_since_start() {
    init();

    let measured = Rc::new(Cell::new(Duration::ZERO));
    let measured_cb = Rc::clone(&measured);

    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    timer.start(&mut lp, 80, move |lp, timer| {
        measured_cb.set(timer.real_time_passed_since_last_callback(lp));
    });

    lp.run().unwrap();
    assert!(measured.get() >= Duration::from_millis(60), "{:?}", measured.get());
}

#[test]
fn schedule_removal_stops_the_timer() {
    init();

    let calls = Rc::new(Cell::new(0usize));
    let calls_cb = Rc::clone(&calls);

    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    timer.start(&mut lp, 300, move |_lp, _timer| {
        calls_cb.set(calls_cb.get() + 1);
    });
    timer.schedule_removal(&mut lp);

    let started = Instant::now();
    lp.run().unwrap();
    assert_eq!(calls.get(), 0);
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[test]
fn zero_timeout_fires_on_next_cycle() {
    init();

    let fired = Rc::new(Cell::new(false));
    let fired_cb = Rc::clone(&fired);

    let mut lp = EventLoop::new().unwrap();
    let timer = Timer::new(&mut lp);
    timer.start(&mut lp, 0, move |_lp, _timer| fired_cb.set(true));
    lp.run().unwrap();
    assert!(fired.get());
}
