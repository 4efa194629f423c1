use std::cell::{Cell, RefCell};
use std::rc::Rc;

use evio::{Endpoint, EventLoop, StatusCode, TcpClient, TcpServer};

mod util;
use util::{free_port, init};

fn local_endpoint() -> Endpoint {
    Endpoint::new("127.0.0.1", 0)
}

#[test]
fn echo_roundtrip() {
    init();

    let mut lp = EventLoop::new().unwrap();

    let server_received = Rc::new(RefCell::new(Vec::new()));
    let client_received = Rc::new(RefCell::new(Vec::new()));
    let server_peer_closed = Rc::new(Cell::new(false));
    let client_closed = Rc::new(Cell::new(false));
    let server_closed = Rc::new(Cell::new(false));

    let server = TcpServer::new(&mut lp);
    {
        let server_received = Rc::clone(&server_received);
        let server_peer_closed = Rc::clone(&server_peer_closed);
        server
            .listen(
                &mut lp,
                local_endpoint(),
                |_lp, _client, error| assert!(error.is_ok(), "{}", error),
                move |lp, client, chunk, error| {
                    assert!(error.is_ok(), "{}", error);
                    server_received.borrow_mut().extend_from_slice(chunk.as_slice());
                    client.send_data(lp, chunk.as_slice());
                },
                move |_lp, _client, error| {
                    assert!(error.is_ok(), "{}", error);
                    server_peer_closed.set(true);
                },
            )
            .unwrap();
    }
    let server_endpoint = server.endpoint(&lp);
    assert_ne!(server_endpoint.port(), 0);

    let client = TcpClient::new(&mut lp);
    {
        let client_received = Rc::clone(&client_received);
        let client_closed = Rc::clone(&client_closed);
        let server_closed = Rc::clone(&server_closed);
        client.connect_with_callbacks(
            &mut lp,
            server_endpoint,
            |lp, client, error| {
                assert!(error.is_ok(), "{}", error);
                client.send_data(lp, "Hello world!");
            },
            move |lp, client, chunk, error| {
                assert!(error.is_ok(), "{}", error);
                client_received.borrow_mut().extend_from_slice(chunk.as_slice());
                if client_received.borrow().len() >= 12 {
                    client.close(lp);
                }
            },
            move |lp, _client, error| {
                assert!(error.is_ok(), "{}", error);
                client_closed.set(true);
                let server_closed = Rc::clone(&server_closed);
                server.close(lp, move |_lp, _server, error| {
                    assert!(error.is_ok(), "{}", error);
                    server_closed.set(true);
                });
            },
        );
    }

    lp.run().unwrap();

    assert_eq!(&*server_received.borrow(), b"Hello world!");
    assert_eq!(&*client_received.borrow(), b"Hello world!");
    assert!(server_peer_closed.get());
    assert!(client_closed.get());
    assert!(server_closed.get());
}

#[test]
fn connect_refused_does_not_fire_close_callback() {
    init();

    let mut lp = EventLoop::new().unwrap();

    let connect_error = Rc::new(Cell::new(StatusCode::Ok));
    let close_fired = Rc::new(Cell::new(false));

    let client = TcpClient::new(&mut lp);
    {
        let connect_error = Rc::clone(&connect_error);
        let close_fired = Rc::clone(&close_fired);
        client.connect_with_callbacks(
            &mut lp,
            Endpoint::new("127.0.0.1", free_port()),
            move |_lp, _client, error| connect_error.set(error.code()),
            |_lp, _client, _chunk, _error| panic!("no data expected"),
            move |_lp, _client, _error| close_fired.set(true),
        );
    }

    lp.run().unwrap();

    assert_eq!(connect_error.get(), StatusCode::ConnectionRefused);
    assert!(!close_fired.get());
}

#[test]
fn malformed_endpoint_fails_connect_with_invalid_argument() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let code = Rc::new(Cell::new(StatusCode::Ok));
    let code_cb = Rc::clone(&code);

    let client = TcpClient::new(&mut lp);
    client.connect(&mut lp, Endpoint::new("bla", 1234), move |_lp, _client, error| {
        code_cb.set(error.code());
    });

    lp.run().unwrap();
    assert_eq!(code.get(), StatusCode::InvalidArgument);
}

#[test]
fn second_listen_is_rejected_while_listening() {
    init();

    let mut lp = EventLoop::new().unwrap();

    let server = TcpServer::new(&mut lp);
    server
        .listen(
            &mut lp,
            local_endpoint(),
            |_, _, _| {},
            |_, _, _, _| {},
            |_, _, _| {},
        )
        .unwrap();

    let second = server.listen(
        &mut lp,
        local_endpoint(),
        |_, _, _| {},
        |_, _, _, _| {},
        |_, _, _| {},
    );
    assert_eq!(
        second.unwrap_err().code(),
        StatusCode::ConnectionAlreadyInProgress
    );

    server.close(&mut lp, |_, _, error| assert!(error.is_ok()));
    lp.run().unwrap();
}

#[test]
fn close_of_non_listening_server_reports_not_connected() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let code = Rc::new(Cell::new(StatusCode::Ok));
    let code_cb = Rc::clone(&code);

    let server = TcpServer::new(&mut lp);
    server.close(&mut lp, move |_lp, _server, error| {
        code_cb.set(error.code());
    });

    lp.run().unwrap();
    assert_eq!(code.get(), StatusCode::NotConnected);
}

#[test]
fn second_close_reports_not_connected() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let first = Rc::new(Cell::new(StatusCode::Undefined));
    let second = Rc::new(Cell::new(StatusCode::Undefined));
    let first_cb = Rc::clone(&first);
    let second_cb = Rc::clone(&second);

    let server = TcpServer::new(&mut lp);
    server
        .listen(
            &mut lp,
            local_endpoint(),
            |_, _, _| {},
            |_, _, _, _| {},
            |_, _, _| {},
        )
        .unwrap();

    server.close(&mut lp, move |_lp, _server, error| first_cb.set(error.code()));
    server.close(&mut lp, move |_lp, _server, error| second_cb.set(error.code()));

    lp.run().unwrap();
    assert_eq!(first.get(), StatusCode::Ok);
    assert_eq!(second.get(), StatusCode::NotConnected);
}

#[test]
fn listen_after_close_callback_succeeds() {
    init();

    let mut lp = EventLoop::new().unwrap();

    let relistened = Rc::new(Cell::new(false));
    let relistened_cb = Rc::clone(&relistened);

    let server = TcpServer::new(&mut lp);
    server
        .listen(
            &mut lp,
            local_endpoint(),
            |_, _, _| {},
            |_, _, _, _| {},
            |_, _, _| {},
        )
        .unwrap();

    server.close(&mut lp, move |lp, server, error| {
        assert!(error.is_ok());
        server
            .listen(lp, local_endpoint(), |_, _, _| {}, |_, _, _, _| {}, |_, _, _| {})
            .unwrap();
        relistened_cb.set(true);
        server.close(lp, |_, _, _| {});
    });

    lp.run().unwrap();
    assert!(relistened.get());
}

#[test]
fn send_before_connect_fails_with_not_connected() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let code = Rc::new(Cell::new(StatusCode::Ok));
    let code_cb = Rc::clone(&code);

    let client = TcpClient::new(&mut lp);
    client.send_data_with_callback(&mut lp, "nope", move |_lp, _client, error| {
        code_cb.set(error.code());
    });

    lp.run().unwrap();
    assert_eq!(code.get(), StatusCode::NotConnected);
}

#[test]
fn zero_length_send_fails_with_invalid_argument() {
    init();

    let mut lp = EventLoop::new().unwrap();

    let server = TcpServer::new(&mut lp);
    server
        .listen(
            &mut lp,
            local_endpoint(),
            |_, _, _| {},
            |_, _, _, _| {},
            |_, _, _| {},
        )
        .unwrap();
    let server_endpoint = server.endpoint(&lp);

    let code = Rc::new(Cell::new(StatusCode::Ok));
    let code_cb = Rc::clone(&code);

    let client = TcpClient::new(&mut lp);
    client.connect_with_callbacks(
        &mut lp,
        server_endpoint,
        move |lp, client, error| {
            assert!(error.is_ok(), "{}", error);
            let code_cb = Rc::clone(&code_cb);
            client.send_data_with_callback(lp, Vec::new(), move |lp, client, error| {
                code_cb.set(error.code());
                client.close(lp);
                server.close(lp, |_, _, _| {});
            });
        },
        |_, _, _, _| {},
        |_, _, error| assert!(error.is_ok()),
    );

    lp.run().unwrap();
    assert_eq!(code.get(), StatusCode::InvalidArgument);
}

#[test]
fn bulk_transfer_preserves_byte_count() {
    init();

    const CHUNK: usize = 16 * 1024;
    const CHUNKS: usize = 64;

    let mut lp = EventLoop::new().unwrap();
    let received_total = Rc::new(Cell::new(0usize));

    let server = TcpServer::new(&mut lp);
    {
        let received_total = Rc::clone(&received_total);
        server
            .listen(
                &mut lp,
                local_endpoint(),
                |_, _, _| {},
                move |lp, client, chunk, _error| {
                    received_total.set(received_total.get() + chunk.len());
                    if received_total.get() == CHUNK * CHUNKS {
                        client.close(lp);
                        if let Some(server) = client.server(lp) {
                            server.close(lp, |_, _, _| {});
                        }
                    }
                },
                |_, _, _| {},
            )
            .unwrap();
    }
    let server_endpoint = server.endpoint(&lp);

    let sends_completed = Rc::new(Cell::new(0usize));
    let client = TcpClient::new(&mut lp);
    {
        let sends_completed = Rc::clone(&sends_completed);
        client.connect_with_callbacks(
            &mut lp,
            server_endpoint,
            move |lp, client, error| {
                assert!(error.is_ok(), "{}", error);
                let payload = vec![0xA5u8; CHUNK];
                for _ in 0..CHUNKS {
                    let sends_completed = Rc::clone(&sends_completed);
                    client.send_data_with_callback(
                        lp,
                        payload.clone(),
                        move |_lp, _client, error| {
                            assert!(error.is_ok(), "{}", error);
                            sends_completed.set(sends_completed.get() + 1);
                        },
                    );
                }
            },
            |_, _, _, _| {},
            |_, _, _| {},
        );
    }

    lp.run().unwrap();

    assert_eq!(received_total.get(), CHUNK * CHUNKS);
    assert_eq!(sends_completed.get(), CHUNKS);
}

#[test]
fn reset_is_observed_by_the_peer() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let close_code = Rc::new(Cell::new(StatusCode::Ok));

    let server = TcpServer::new(&mut lp);
    server
        .listen(
            &mut lp,
            local_endpoint(),
            |_, _, _| {},
            move |lp, client, _chunk, _error| {
                // Reset as soon as the client's first bytes arrive.
                client.close_with_reset(lp);
                if let Some(server) = client.server(lp) {
                    server.close(lp, |_, _, _| {});
                }
            },
            |_, _, _| {},
        )
        .unwrap();
    let server_endpoint = server.endpoint(&lp);

    let client = TcpClient::new(&mut lp);
    {
        let close_code = Rc::clone(&close_code);
        client.connect_with_callbacks(
            &mut lp,
            server_endpoint,
            |lp, client, error| {
                assert!(error.is_ok(), "{}", error);
                client.send_data(lp, "trigger");
            },
            |_, _, _, _| {},
            move |_lp, _client, error| close_code.set(error.code()),
        );
    }

    lp.run().unwrap();
    assert_eq!(close_code.get(), StatusCode::ConnectionResetByPeer);
}

#[test]
fn send_after_shutdown_fails() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let code = Rc::new(Cell::new(StatusCode::Ok));
    let peer_saw_eof = Rc::new(Cell::new(false));

    let server = TcpServer::new(&mut lp);
    {
        let peer_saw_eof = Rc::clone(&peer_saw_eof);
        server
            .listen(
                &mut lp,
                local_endpoint(),
                |_, _, _| {},
                |_, _, _, _| {},
                move |lp, client, error| {
                    assert!(error.is_ok(), "{}", error);
                    peer_saw_eof.set(true);
                    if let Some(server) = client.server(lp) {
                        server.close(lp, |_, _, _| {});
                    }
                },
            )
            .unwrap();
    }
    let server_endpoint = server.endpoint(&lp);

    let client = TcpClient::new(&mut lp);
    {
        let code = Rc::clone(&code);
        client.connect_with_callbacks(
            &mut lp,
            server_endpoint,
            move |lp, client, error| {
                assert!(error.is_ok(), "{}", error);
                client.shutdown(lp);
                let code = Rc::clone(&code);
                client.send_data_with_callback(lp, "late", move |lp, client, error| {
                    code.set(error.code());
                    client.close(lp);
                });
            },
            |_, _, _, _| {},
            |_, _, _| {},
        );
    }

    lp.run().unwrap();
    assert_eq!(code.get(), StatusCode::NotConnected);
    assert!(peer_saw_eof.get());
}

#[test]
fn connected_clients_count_tracks_connections() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let count_at_connect = Rc::new(Cell::new(0usize));

    let server = TcpServer::new(&mut lp);
    {
        let count_at_connect = Rc::clone(&count_at_connect);
        server
            .listen(
                &mut lp,
                local_endpoint(),
                move |lp, client, error| {
                    assert!(error.is_ok(), "{}", error);
                    if let Some(server) = client.server(lp) {
                        count_at_connect.set(server.connected_clients_count(lp));
                    }
                },
                |_, _, _, _| {},
                |_, _, _| {},
            )
            .unwrap();
    }
    let server_endpoint = server.endpoint(&lp);

    let client = TcpClient::new(&mut lp);
    client.connect_with_callbacks(
        &mut lp,
        server_endpoint,
        move |lp, client, error| {
            assert!(error.is_ok(), "{}", error);
            client.close(lp);
        },
        |_, _, _, _| {},
        move |lp, _client, _error| {
            server.close(lp, |_, _, _| {});
        },
    );

    lp.run().unwrap();
    assert_eq!(count_at_connect.get(), 1);
    assert_eq!(server.connected_clients_count(&lp), 0);
}

#[test]
fn delay_send_toggle_roundtrips() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let client = TcpClient::new(&mut lp);
    assert!(client.is_delay_send(&lp));
    client.delay_send(&mut lp, false);
    assert!(!client.is_delay_send(&lp));
    client.delay_send(&mut lp, true);
    assert!(client.is_delay_send(&lp));
    lp.run().unwrap();
}
