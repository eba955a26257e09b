use std::time::{Duration, Instant};

use rill::{Error, Event, Reactor, ReadyState, Token};

/// Polls until `done` says so or the deadline passes, handing each turn's
/// events back for the test to act on between turns.
fn pump<F>(reactor: &mut Reactor, for_how_long: Duration, mut on_batch: F)
where
    F: FnMut(&mut Reactor, Vec<Event>) -> bool,
{
    let deadline = Instant::now() + for_how_long;
    while Instant::now() < deadline {
        let mut batch = Vec::new();
        reactor.poll_with(Some(Duration::from_millis(10)), |ev| batch.push(ev)).unwrap();
        if on_batch(reactor, batch) {
            return;
        }
    }
    panic!("pump deadline passed");
}

#[test]
fn echo_roundtrip() {
    let mut reactor = Reactor::new().unwrap();
    let server = reactor.listen_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = reactor.server_addr(server).unwrap().unwrap();

    let client = reactor.connect_addr(addr).unwrap();
    assert_eq!(reactor.ready_state(client), ReadyState::Opening);

    let mut saw_listening = false;
    let mut saw_connect = false;
    let mut accepted: Option<Token> = None;
    let mut echoed = Vec::new();

    pump(&mut reactor, Duration::from_secs(5), |reactor, batch| {
        for ev in batch {
            match ev {
                Event::Listening { server: s } => {
                    assert_eq!(s, server);
                    saw_listening = true;
                }
                Event::Connection { server: s, stream, peer_addr } => {
                    assert_eq!(s, server);
                    assert!(peer_addr.is_some());
                    accepted = Some(stream);
                }
                Event::Connect { stream } => {
                    assert_eq!(stream, client);
                    saw_connect = true;
                    assert!(reactor.write(client, b"hello").unwrap());
                }
                Event::Data { stream, payload } if Some(stream) == accepted => {
                    assert_eq!(payload.as_bytes(), &[0x68, 0x65, 0x6c, 0x6c, 0x6f]);
                    reactor.write(stream, payload.as_bytes()).unwrap();
                }
                Event::Data { stream, payload } if stream == client => {
                    echoed.extend_from_slice(payload.as_bytes());
                }
                ev => panic!("unexpected event {ev:?}"),
            }
        }
        !echoed.is_empty()
    });

    assert!(saw_listening);
    assert!(saw_connect);
    assert_eq!(echoed, b"hello");
    assert_eq!(reactor.ready_state(client), ReadyState::Open);
    assert!(reactor.local_addr(client).unwrap().is_some());
    assert_eq!(reactor.peer_addr(client).unwrap(), Some(addr));
}

#[test]
fn hostname_connect_resolves_on_next_turn() {
    let mut reactor = Reactor::new().unwrap();
    let server = reactor.listen_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
    let port = reactor.server_addr(server).unwrap().unwrap().port();

    let client = reactor.connect("localhost", port).unwrap();
    assert_eq!(reactor.ready_state(client), ReadyState::Opening);

    let mut connected = false;
    pump(&mut reactor, Duration::from_secs(5), |_, batch| {
        for ev in batch {
            if let Event::Connect { stream } = ev {
                assert_eq!(stream, client);
                connected = true;
            }
        }
        connected
    });
    assert_eq!(reactor.ready_state(client), ReadyState::Open);
}

#[test]
fn zero_byte_write_returns_true_and_emits_no_drain() {
    let mut reactor = Reactor::new().unwrap();
    let server = reactor.listen_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = reactor.server_addr(server).unwrap().unwrap();
    let client = reactor.connect_addr(addr).unwrap();

    let mut connected = false;
    pump(&mut reactor, Duration::from_secs(5), |_, batch| {
        for ev in batch {
            if let Event::Connect { .. } = ev {
                connected = true;
            }
        }
        connected
    });

    assert!(reactor.write(client, b"").unwrap());
    assert_eq!(reactor.queued_bytes(client), 0);

    // a couple of quiet turns: no drain may appear
    for _ in 0..5 {
        reactor
            .poll_with(Some(Duration::from_millis(5)), |ev| match ev {
                Event::Drain { .. } => panic!("drain after zero-byte write"),
                Event::Connection { .. } => {}
                ev => panic!("unexpected event {ev:?}"),
            })
            .unwrap();
    }
}

#[test]
fn write_after_close_is_a_caller_error() {
    let mut reactor = Reactor::new().unwrap();
    let server = reactor.listen_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = reactor.server_addr(server).unwrap().unwrap();
    let client = reactor.connect_addr(addr).unwrap();

    // still connecting: writes queue behind the eventual connect, and a
    // close parks the sentinel behind them
    assert!(!reactor.write(client, b"queued").unwrap());
    reactor.close(client).unwrap();
    assert!(matches!(reactor.write(client, b"late"), Err(Error::CloseAlreadyCalled)));
}

#[test]
fn pause_is_idempotent_and_resume_restores_data() {
    let mut reactor = Reactor::new().unwrap();
    let server = reactor.listen_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = reactor.server_addr(server).unwrap().unwrap();
    let client = reactor.connect_addr(addr).unwrap();

    let mut accepted = None;
    let mut connected = false;
    pump(&mut reactor, Duration::from_secs(5), |_, batch| {
        for ev in batch {
            match ev {
                Event::Connection { stream, .. } => accepted = Some(stream),
                Event::Connect { .. } => connected = true,
                _ => {}
            }
        }
        connected && accepted.is_some()
    });
    let accepted = accepted.unwrap();

    reactor.pause(client).unwrap();
    reactor.pause(client).unwrap();
    assert!(reactor.write(accepted, b"while-paused").unwrap());

    // paused: nothing may surface on the client
    let quiet_until = Instant::now() + Duration::from_millis(300);
    while Instant::now() < quiet_until {
        reactor
            .poll_with(Some(Duration::from_millis(10)), |ev| {
                if let Event::Data { stream, .. } = &ev {
                    assert_ne!(*stream, client, "data while paused");
                }
            })
            .unwrap();
    }

    reactor.resume(client).unwrap();
    let mut got = Vec::new();
    pump(&mut reactor, Duration::from_secs(5), |_, batch| {
        for ev in batch {
            if let Event::Data { stream, payload } = ev
                && stream == client
            {
                got.extend_from_slice(payload.as_bytes());
            }
        }
        !got.is_empty()
    });
    assert_eq!(got, b"while-paused");
}

#[test]
fn force_close_reports_plain_close_next_turn() {
    let mut reactor = Reactor::new().unwrap();
    let server = reactor.listen_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = reactor.server_addr(server).unwrap().unwrap();
    let client = reactor.connect_addr(addr).unwrap();

    let mut connected = false;
    pump(&mut reactor, Duration::from_secs(5), |_, batch| {
        for ev in batch {
            if let Event::Connect { .. } = ev {
                connected = true;
            }
        }
        connected
    });

    reactor.force_close(client).unwrap();
    // teardown is immediate, the event pair is next-tick
    assert_eq!(reactor.ready_state(client), ReadyState::Closed);

    let mut closed = false;
    pump(&mut reactor, Duration::from_secs(2), |_, batch| {
        for ev in batch {
            match ev {
                Event::Close { stream, had_error } => {
                    assert_eq!(stream, client);
                    assert!(!had_error);
                    closed = true;
                }
                Event::Error { .. } => panic!("no error expected"),
                _ => {}
            }
        }
        closed
    });
    // the token is dead now
    assert!(matches!(reactor.resume(client), Err(Error::UnknownToken)));
}
