use std::cell::{Cell, RefCell};
use std::rc::Rc;

use evio::net::resolve_host;
use evio::{EndpointType, EventLoop, StatusCode};

mod util;
use util::init;

#[test]
fn resolves_localhost() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let endpoints = Rc::new(RefCell::new(Vec::new()));
    let code = Rc::new(Cell::new(StatusCode::Undefined));

    {
        let endpoints = Rc::clone(&endpoints);
        let code = Rc::clone(&code);
        resolve_host(
            &mut lp,
            "localhost",
            EndpointType::Undefined,
            move |_lp, resolved, error| {
                code.set(error.code());
                *endpoints.borrow_mut() = resolved;
            },
        );
    }

    lp.run().unwrap();

    assert_eq!(code.get(), StatusCode::Ok);
    let endpoints = endpoints.borrow();
    assert!(!endpoints.is_empty());
    assert!(endpoints
        .iter()
        .all(|e| e.endpoint_type() != EndpointType::Undefined));
}

#[test]
fn family_filter_restricts_results() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let all_v4 = Rc::new(Cell::new(false));

    {
        let all_v4 = Rc::clone(&all_v4);
        resolve_host(
            &mut lp,
            "localhost",
            EndpointType::IpV4,
            move |_lp, resolved, error| {
                assert!(error.is_ok(), "{}", error);
                all_v4.set(
                    !resolved.is_empty()
                        && resolved.iter().all(|e| e.endpoint_type() == EndpointType::IpV4),
                );
            },
        );
    }

    lp.run().unwrap();
    assert!(all_v4.get());
}

#[test]
fn unknown_host_reports_empty_list_and_error() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let code = Rc::new(Cell::new(StatusCode::Ok));
    let count = Rc::new(Cell::new(usize::MAX));

    {
        let code = Rc::clone(&code);
        let count = Rc::clone(&count);
        resolve_host(
            &mut lp,
            "definitely-not-a-real-host.invalid",
            EndpointType::Undefined,
            move |_lp, resolved, error| {
                code.set(error.code());
                count.set(resolved.len());
            },
        );
    }

    lp.run().unwrap();

    assert_eq!(code.get(), StatusCode::UnknownNodeOrService);
    assert_eq!(count.get(), 0);
}
