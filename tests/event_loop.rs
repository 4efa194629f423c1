use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use evio::{EventLoop, EventLoopConfig, Timer};

mod util;
use util::init;

#[test]
fn run_with_nothing_to_do_returns_immediately() {
    init();

    let mut lp = EventLoop::new().unwrap();
    assert!(!lp.is_running());
    lp.run().unwrap();
    assert!(!lp.is_running());
}

#[test]
fn with_config() {
    init();

    let mut lp = EventLoop::with_config(EventLoopConfig {
        events_capacity: 16,
        thread_pool_size: 2,
    })
    .unwrap();
    lp.run().unwrap();
}

#[test]
fn is_running_inside_callback() {
    init();

    let observed = Rc::new(Cell::new(false));
    let observed_cb = Rc::clone(&observed);

    let mut lp = EventLoop::new().unwrap();
    lp.schedule_callback(move |lp| {
        observed_cb.set(lp.is_running());
    });
    lp.run().unwrap();
    assert!(observed.get());
}

#[test]
fn schedule_callback_runs_in_order() {
    init();

    let order = Rc::new(std::cell::RefCell::new(Vec::new()));

    let mut lp = EventLoop::new().unwrap();
    for i in 0..5 {
        let order = Rc::clone(&order);
        lp.schedule_callback(move |_| order.borrow_mut().push(i));
    }
    lp.run().unwrap();
    assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn each_loop_cycle_callback_runs_until_stopped() {
    init();

    let calls = Rc::new(Cell::new(0usize));
    let calls_cb = Rc::clone(&calls);

    let mut lp = EventLoop::new().unwrap();
    let handle = Rc::new(Cell::new(usize::MAX));
    let handle_cb = Rc::clone(&handle);
    let id = lp.schedule_call_on_each_loop_cycle(move |lp| {
        let n = calls_cb.get() + 1;
        calls_cb.set(n);
        if n >= 10 {
            lp.stop_call_on_each_loop_cycle(handle_cb.get());
        }
    });
    handle.set(id);

    lp.run().unwrap();
    assert_eq!(calls.get(), 10);
}

#[test]
fn block_loop_from_exit_until_unblocked_from_another_thread() {
    init();

    let mut lp = EventLoop::new().unwrap();
    lp.start_block_loop_from_exit();

    let sender = lp.sender();
    let unblocked = Rc::new(Cell::new(false));
    let unblocked_cb = Rc::clone(&unblocked);

    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        sender.execute_on_loop_thread(move |lp| {
            lp.stop_block_loop_from_exit();
        });
    });

    lp.schedule_callback(move |_| unblocked_cb.set(true));
    lp.run().unwrap();
    handle.join().unwrap();
    assert!(unblocked.get());
}

#[test]
fn add_work_runs_done_on_loop_thread_with_result() {
    init();

    let result = Rc::new(Cell::new(0u64));
    let result_cb = Rc::clone(&result);

    let mut lp = EventLoop::new().unwrap();
    lp.add_work_with_result(
        || (1..=10u64).product::<u64>(),
        move |_lp, value| result_cb.set(value),
    );
    lp.run().unwrap();
    assert_eq!(result.get(), 3_628_800);
}

#[test]
fn add_work_without_done_keeps_loop_alive_until_finished() {
    init();

    let mut lp = EventLoop::new().unwrap();
    lp.add_work(|| thread::sleep(Duration::from_millis(50)));
    let started = std::time::Instant::now();
    lp.run().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[test]
fn execute_on_loop_thread_from_worker() {
    init();

    let value = Rc::new(Cell::new(0));
    let value_cb = Rc::clone(&value);

    let mut lp = EventLoop::new().unwrap();
    let sender = lp.sender();
    lp.add_work(move || {
        sender.execute_on_loop_thread(move |lp| {
            lp.schedule_callback(move |_| value_cb.set(42));
        });
    });
    lp.run().unwrap();
    assert_eq!(value.get(), 42);
}

#[test]
fn loop_user_data_slot() {
    init();

    let mut lp = EventLoop::new().unwrap();
    lp.set_user_data(String::from("state"));
    assert_eq!(lp.user_data::<String>().map(String::as_str), Some("state"));

    lp.user_data_mut::<String>().unwrap().push_str("-updated");
    assert_eq!(
        lp.user_data::<String>().map(String::as_str),
        Some("state-updated")
    );

    let taken = lp.take_user_data().unwrap();
    assert!(taken.downcast_ref::<String>().is_some());
    assert!(lp.user_data::<String>().is_none());
}

#[test]
fn timer_callbacks_precede_cycle_callbacks_in_a_cycle() {
    init();

    // A zero timer armed before the cycle fires before that cycle's
    // per-cycle callback.
    let order = Rc::new(std::cell::RefCell::new(Vec::new()));

    let mut lp = EventLoop::new().unwrap();

    let order_timer = Rc::clone(&order);
    let timer = Timer::new(&mut lp);
    timer.start(&mut lp, 0, move |lp, timer| {
        order_timer.borrow_mut().push("timer");
        timer.stop(lp);
    });

    let order_cycle = Rc::clone(&order);
    let handle = Rc::new(Cell::new(usize::MAX));
    let handle_cb = Rc::clone(&handle);
    let id = lp.schedule_call_on_each_loop_cycle(move |lp| {
        order_cycle.borrow_mut().push("cycle");
        lp.stop_call_on_each_loop_cycle(handle_cb.get());
    });
    handle.set(id);

    lp.run().unwrap();

    let order = order.borrow();
    assert_eq!(order.first().copied(), Some("timer"));
    assert!(order.contains(&"cycle"));
}
