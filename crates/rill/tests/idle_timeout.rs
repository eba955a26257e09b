use std::{
    net::{SocketAddr, TcpListener},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use rill::{Event, Reactor, ReadyState};

/// Accepts one connection and holds it open, silently, until told to go.
fn spawn_silent_peer() -> (SocketAddr, mpsc::Sender<()>, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let (_stream, _) = listener.accept().unwrap();
        let _ = rx.recv();
    });
    (addr, tx, handle)
}

fn pump_until_connected(reactor: &mut Reactor) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut connected = false;
    while !connected {
        assert!(Instant::now() < deadline, "connect timed out");
        reactor
            .poll_with(Some(Duration::from_millis(10)), |ev| {
                if let Event::Connect { .. } = ev {
                    connected = true;
                }
            })
            .unwrap();
    }
}

#[test]
fn idle_stream_times_out_in_its_bucket() {
    let (addr, release, peer) = spawn_silent_peer();
    let mut reactor = Reactor::new().unwrap();
    let client = reactor.connect_addr(addr).unwrap();
    pump_until_connected(&mut reactor);

    // 1500 floors into the 1000ms bucket
    reactor.set_timeout(client, 1_500).unwrap();
    let start = Instant::now();

    let mut order = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !matches!(order.last(), Some(&"close")) {
        assert!(Instant::now() < deadline, "timeout never fired");
        reactor
            .poll_with(Some(Duration::from_millis(50)), |ev| match ev {
                Event::Timeout { stream } => {
                    assert_eq!(stream, client);
                    order.push("timeout");
                }
                Event::Error { stream, error } => {
                    assert_eq!(stream, client);
                    assert_eq!(error.to_string(), "idle timeout");
                    order.push("error");
                }
                Event::Close { stream, had_error } => {
                    assert_eq!(stream, client);
                    assert!(had_error);
                    order.push("close");
                }
                ev => panic!("unexpected event {ev:?}"),
            })
            .unwrap();
    }
    let elapsed = start.elapsed();
    assert_eq!(order, vec!["timeout", "error", "close"]);
    assert!(elapsed >= Duration::from_millis(900), "fired too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3_000), "fired too late: {elapsed:?}");

    let _ = release.send(());
    peer.join().unwrap();
}

#[test]
fn activity_defers_the_timeout() {
    let (addr, release, peer) = spawn_silent_peer();
    let mut reactor = Reactor::new().unwrap();
    let client = reactor.connect_addr(addr).unwrap();
    pump_until_connected(&mut reactor);

    reactor.set_timeout(client, 1_000).unwrap();
    let start = Instant::now();

    // keep touching the socket for a while; each write re-stamps activity
    let mut closed_at = None;
    while closed_at.is_none() {
        if start.elapsed() < Duration::from_millis(1_500) && reactor.queued_bytes(client) == 0 {
            let _ = reactor.write(client, b"ping");
        }
        reactor
            .poll_with(Some(Duration::from_millis(100)), |ev| {
                if let Event::Close { .. } = ev {
                    closed_at = Some(start.elapsed());
                }
            })
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(6), "never timed out");
    }
    // the clock only starts counting after the last write
    assert!(closed_at.unwrap() >= Duration::from_millis(2_000), "activity did not defer expiry");

    let _ = release.send(());
    peer.join().unwrap();
}

#[test]
fn zero_timeout_disables_expiry() {
    let (addr, release, peer) = spawn_silent_peer();
    let mut reactor = Reactor::new().unwrap();
    let client = reactor.connect_addr(addr).unwrap();
    pump_until_connected(&mut reactor);

    reactor.set_timeout(client, 1_000).unwrap();
    reactor.set_timeout(client, 0).unwrap();

    let quiet_until = Instant::now() + Duration::from_millis(1_800);
    while Instant::now() < quiet_until {
        reactor
            .poll_with(Some(Duration::from_millis(50)), |ev| {
                panic!("no event expected, got {ev:?}");
            })
            .unwrap();
    }
    assert_eq!(reactor.ready_state(client), ReadyState::Open);

    let _ = release.send(());
    peer.join().unwrap();
}
