use std::{collections::VecDeque, io, net::SocketAddr, path::Path, time::Duration};

use mio::{Events, Poll, Token};
use rill_timing::Millis;
use rill_utils::{FreeList, safe_assert, safe_panic};
use slab::Slab;
use tracing::{debug, warn};

use crate::{
    error::Error,
    event::{Encoding, Event, Payload, ReadyState, Transport},
    idle::{IdleLinks, IdleNode, IdleScheduler},
    pool::Pool,
    resolve,
    server::{self, Server},
    stream::{Chunk, ConnectCheck, Flush, ReadStep, Stream, StreamIo, dial_tcp},
};

const DEFAULT_EVENT_CAPACITY: usize = 1024;
/// Soft cap on cached private write buffers.
const SPARE_BUFFERS: usize = 100;

/// One slab slot: a stream or a listener, sharing the token space.
enum Entry {
    Stream(Stream),
    Listener(Server),
}

impl IdleNode for Entry {
    fn idle(&self) -> &IdleLinks {
        match self {
            Entry::Stream(s) => s.idle(),
            Entry::Listener(_) => unreachable!("listeners carry no idle linkage"),
        }
    }

    fn idle_mut(&mut self) -> &mut IdleLinks {
        match self {
            Entry::Stream(s) => s.idle_mut(),
            Entry::Listener(_) => unreachable!("listeners carry no idle linkage"),
        }
    }
}

/// Work parked until the next `poll_with` turn, so nothing observable
/// ever fires from inside the call that caused it.
enum Deferred {
    Resolve { token: Token, host: String, port: u16 },
    Listening { server: Token },
    Drain { token: Token },
    StreamClosed { token: Token, error: Option<Error> },
    ServerClosed { token: Token },
}

struct Core {
    poll: Poll,
    conns: Slab<Entry>,
    idle: IdleScheduler,
    pool: Pool,
    spares: FreeList<Vec<u8>>,
    deferred: VecDeque<Deferred>,
    expired: Vec<usize>,
    socket_bufs: Option<usize>,
}

/// Single-threaded stream-socket runtime.
///
/// Owns every stream and listener, addressed by [`Token`]. All I/O and
/// every event is driven by [`poll_with`](Reactor::poll_with); the other
/// methods only mutate state and queue work.
pub struct Reactor {
    events: Events,
    core: Core,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            events: Events::with_capacity(DEFAULT_EVENT_CAPACITY),
            core: Core {
                poll: Poll::new()?,
                conns: Slab::new(),
                idle: IdleScheduler::new(),
                pool: Pool::new(),
                spares: FreeList::new(SPARE_BUFFERS),
                deferred: VecDeque::new(),
                expired: Vec::new(),
                socket_bufs: None,
            },
        })
    }

    /// Sizes the readiness event buffer.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.events = Events::with_capacity(capacity);
        self
    }

    /// Sets kernel SO_SNDBUF and SO_RCVBUF on every socket this reactor
    /// creates or accepts.
    pub fn with_socket_bufs(mut self, size: usize) -> Self {
        self.core.socket_bufs = Some(size);
        self
    }

    /// Polls readiness once and dispatches everything that is due:
    /// deferred work first (next-tick semantics), then socket readiness,
    /// then idle-timeout expiry. The poll timeout is clamped to the
    /// earliest timeout-bucket deadline. Returns whether anything ran.
    pub fn poll_with<F>(&mut self, timeout: Option<Duration>, mut handler: F) -> io::Result<bool>
    where
        F: FnMut(Event),
    {
        let mut any = self.core.run_deferred(&mut handler);
        let poll_timeout = self.core.next_poll_timeout(timeout);
        match self.core.poll.poll(&mut self.events, poll_timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        for event in self.events.iter() {
            any = true;
            self.core.dispatch(event, &mut handler);
        }
        if self.core.fire_idle(Millis::now(), &mut handler) {
            any = true;
        }
        Ok(any)
    }

    /// Connects to `host:port`, resolving the host on the next turn when
    /// it is not a literal address. The stream opens as `Opening`.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<Token, Error> {
        if resolve::needs_lookup(host) {
            return self.core.connect_resolving(host, port);
        }
        let ip = resolve::lookup(host)?;
        self.core.connect_addr(SocketAddr::new(ip, port))
    }

    /// Connects to a literal socket address.
    pub fn connect_addr(&mut self, addr: SocketAddr) -> Result<Token, Error> {
        self.core.connect_addr(addr)
    }

    /// Connects to a UNIX socket path.
    pub fn connect_unix<P: AsRef<Path>>(&mut self, path: P) -> Result<Token, Error> {
        self.core.connect_unix(path.as_ref())
    }

    /// Wraps an already-connected TCP socket in the open state.
    pub fn adopt_tcp(&mut self, stream: std::net::TcpStream) -> Result<Token, Error> {
        stream.set_nonblocking(true).map_err(|e| Error::io("fcntl", e))?;
        let peer = stream.peer_addr().ok();
        self.core.install_open(StreamIo::Tcp(mio::net::TcpStream::from_std(stream)), peer)
    }

    /// Wraps an already-connected UNIX socket in the open state.
    pub fn adopt_unix(&mut self, stream: std::os::unix::net::UnixStream) -> Result<Token, Error> {
        stream.set_nonblocking(true).map_err(|e| Error::io("fcntl", e))?;
        self.core.install_open(StreamIo::Unix(mio::net::UnixStream::from_std(stream)), None)
    }

    /// Binds a TCP listener; port 0 picks an ephemeral port.
    pub fn listen_tcp(&mut self, addr: SocketAddr) -> Result<Token, Error> {
        self.core.listen(server::bind_tcp(addr)?, None)
    }

    /// Binds a UNIX listener, clearing a stale regular file at the path.
    pub fn listen_unix<P: AsRef<Path>>(&mut self, path: P) -> Result<Token, Error> {
        let path = path.as_ref();
        self.core.listen(server::bind_unix(path)?, Some(path.to_owned()))
    }

    /// Local address of a TCP listener.
    pub fn server_addr(&mut self, server: Token) -> Result<Option<SocketAddr>, Error> {
        match self.core.conns.get(server.0) {
            Some(Entry::Listener(srv)) => match &srv.io {
                Some(io) => io.local_addr().map_err(|e| Error::io("getsockname", e)),
                None => Err(Error::Closed),
            },
            _ => Err(Error::UnknownToken),
        }
    }

    /// Stops accepting, closes the listener and unlinks its UNIX path;
    /// `ServerClose` follows on the next turn.
    pub fn close_server(&mut self, server: Token) -> Result<(), Error> {
        self.core.close_server(server)
    }

    /// Writes raw bytes. `Ok(true)` means every byte reached the OS
    /// synchronously; `Ok(false)` means the residual is queued and the
    /// write watcher is armed. Queue-order is submission order.
    pub fn write(&mut self, stream: Token, data: &[u8]) -> Result<bool, Error> {
        self.core.write(stream, data)
    }

    /// Writes text in the given encoding, staging it in the shared pool
    /// when it fits.
    pub fn write_str(&mut self, stream: Token, text: &str, encoding: Encoding) -> Result<bool, Error> {
        self.core.write_str(stream, text, encoding)
    }

    /// Attempts to drain the write queue now. `Ok(true)` when nothing is
    /// left pending.
    pub fn flush(&mut self, stream: Token) -> Result<bool, Error> {
        self.core.flush(stream)
    }

    /// Graceful close: queues the EOF sentinel; shutdown-write happens
    /// once everything before it has drained.
    pub fn close(&mut self, stream: Token) -> Result<(), Error> {
        self.core.close(stream)
    }

    /// Immediate teardown. Watchers are detached and the descriptor is
    /// closed now; `Close` (with `Error` first if there was a cause) is
    /// delivered on the next turn.
    pub fn force_close(&mut self, stream: Token) -> Result<(), Error> {
        let index = stream.0;
        match self.core.conns.get(index) {
            Some(Entry::Stream(_)) => {
                self.core.force_close_inner(index, None);
                Ok(())
            }
            _ => Err(Error::UnknownToken),
        }
    }

    /// Configures text decoding for subsequent `Data` events.
    pub fn set_encoding(&mut self, stream: Token, encoding: Option<Encoding>) -> Result<(), Error> {
        self.core.stream_mut(stream)?.encoding = encoding;
        Ok(())
    }

    /// Sets the idle timeout, rounded to whole seconds; zero disables.
    pub fn set_timeout(&mut self, stream: Token, ms: u64) -> Result<(), Error> {
        self.core.set_timeout(stream, ms)
    }

    pub fn set_nodelay(&mut self, stream: Token, on: bool) -> Result<(), Error> {
        let s = self.core.stream_mut(stream)?;
        match &s.io {
            Some(io @ StreamIo::Tcp(_)) => io.set_nodelay(on).map_err(|e| Error::io("setsockopt", e)),
            Some(StreamIo::Unix(_)) => Err(Error::NotTcp),
            None => Err(Error::Closed),
        }
    }

    /// Kernel SO_SNDBUF and SO_RCVBUF for one stream.
    pub fn set_socket_bufs(&mut self, stream: Token, size: usize) -> Result<(), Error> {
        let s = self.core.stream_mut(stream)?;
        match &s.io {
            Some(io) => {
                io.set_bufs(size);
                Ok(())
            }
            None => Err(Error::Closed),
        }
    }

    /// Stops read readiness; queued OS bytes wait until `resume`.
    pub fn pause(&mut self, stream: Token) -> Result<(), Error> {
        self.core.set_paused(stream, true)
    }

    pub fn resume(&mut self, stream: Token) -> Result<(), Error> {
        self.core.set_paused(stream, false)
    }

    /// The OS's view of the local endpoint (TCP only carries an address).
    pub fn local_addr(&mut self, stream: Token) -> Result<Option<SocketAddr>, Error> {
        let s = self.core.stream_mut(stream)?;
        match &s.io {
            Some(io) => io.local_addr().map_err(|e| Error::io("getsockname", e)),
            None => Err(Error::Closed),
        }
    }

    pub fn peer_addr(&mut self, stream: Token) -> Result<Option<SocketAddr>, Error> {
        Ok(self.core.stream_mut(stream)?.peer_addr)
    }

    /// Transport family of a live stream.
    pub fn transport(&self, stream: Token) -> Option<Transport> {
        match self.core.conns.get(stream.0) {
            Some(Entry::Stream(s)) => Some(s.kind),
            _ => None,
        }
    }

    /// Derived lifecycle state; unknown (already-closed) tokens read as
    /// `Closed`.
    pub fn ready_state(&self, stream: Token) -> ReadyState {
        match self.core.conns.get(stream.0) {
            Some(Entry::Stream(s)) => s.ready_state(),
            _ => ReadyState::Closed,
        }
    }

    /// Bytes sitting in the write queue (the runtime's one flow-control
    /// metric).
    pub fn queued_bytes(&self, stream: Token) -> usize {
        match self.core.conns.get(stream.0) {
            Some(Entry::Stream(s)) => s.queued_bytes(),
            _ => 0,
        }
    }
}

impl Core {
    fn stream_mut(&mut self, token: Token) -> Result<&mut Stream, Error> {
        match self.conns.get_mut(token.0) {
            Some(Entry::Stream(s)) => Ok(s),
            _ => Err(Error::UnknownToken),
        }
    }

    // ---- connection setup ----

    fn connect_addr(&mut self, addr: SocketAddr) -> Result<Token, Error> {
        let io = dial_tcp(addr).map_err(|e| Error::io("connect", e))?;
        self.install_connecting(StreamIo::Tcp(io))
    }

    fn connect_unix(&mut self, path: &Path) -> Result<Token, Error> {
        let io = mio::net::UnixStream::connect(path).map_err(|e| Error::io("connect", e))?;
        self.install_connecting(StreamIo::Unix(io))
    }

    fn connect_resolving(&mut self, host: &str, port: u16) -> Result<Token, Error> {
        let entry = self.conns.vacant_entry();
        let index = entry.key();
        entry.insert(Entry::Stream(Stream::resolving(index)));
        let token = Token(index);
        self.deferred.push_back(Deferred::Resolve { token, host: host.to_owned(), port });
        Ok(token)
    }

    fn install_connecting(&mut self, io: StreamIo) -> Result<Token, Error> {
        if let Some(size) = self.socket_bufs {
            io.set_bufs(size);
        }
        let entry = self.conns.vacant_entry();
        let index = entry.key();
        entry.insert(Entry::Stream(Stream::connecting(index, io)));
        self.finish_install(index)
    }

    fn install_open(&mut self, io: StreamIo, peer_addr: Option<SocketAddr>) -> Result<Token, Error> {
        if let Some(size) = self.socket_bufs {
            io.set_bufs(size);
        }
        let entry = self.conns.vacant_entry();
        let index = entry.key();
        entry.insert(Entry::Stream(Stream::open(index, io, peer_addr)));
        self.finish_install(index)
    }

    fn finish_install(&mut self, index: usize) -> Result<Token, Error> {
        let token = Token(index);
        let registry = self.poll.registry();
        if let Some(Entry::Stream(s)) = self.conns.get_mut(index)
            && let Err(e) = s.update_registration(registry, token)
        {
            self.conns.remove(index);
            return Err(Error::io("register", e));
        }
        Ok(token)
    }

    fn listen(
        &mut self,
        mut io: server::ListenerIo,
        path: Option<std::path::PathBuf>,
    ) -> Result<Token, Error> {
        let entry = self.conns.vacant_entry();
        let token = Token(entry.key());
        io.register(self.poll.registry(), token).map_err(|e| Error::io("register", e))?;
        let srv = match path {
            Some(path) => Server::unix(io, path),
            None => Server::tcp(io),
        };
        entry.insert(Entry::Listener(srv));
        self.deferred.push_back(Deferred::Listening { server: token });
        Ok(token)
    }

    fn close_server(&mut self, token: Token) -> Result<(), Error> {
        let registry = self.poll.registry();
        match self.conns.get_mut(token.0) {
            Some(Entry::Listener(srv)) => {
                if let Some(mut io) = srv.io.take() {
                    let _ = io.deregister(registry);
                    srv.unlink_path();
                    debug!(?token, kind = ?srv.kind, "listener closed");
                    self.deferred.push_back(Deferred::ServerClosed { token });
                }
                Ok(())
            }
            _ => Err(Error::UnknownToken),
        }
    }

    // ---- write paths ----

    fn owned_chunk(&mut self, data: &[u8]) -> Chunk {
        let mut buf = self.spares.alloc_with(Vec::new);
        buf.clear();
        buf.extend_from_slice(data);
        Chunk::Owned { buf, sent: 0 }
    }

    fn write(&mut self, token: Token, data: &[u8]) -> Result<bool, Error> {
        let index = token.0;
        enum Outcome {
            Queued,
            Full,
            Partial(usize),
            Blocked,
            Failed(io::Error),
        }

        let outcome = {
            let s = self.stream_mut(token)?;
            if s.eof_queued() {
                return Err(Error::CloseAlreadyCalled);
            }
            if s.resolving || s.connecting {
                if data.is_empty() {
                    return Ok(true);
                }
                Outcome::Queued
            } else if s.io.is_none() {
                return Err(Error::Closed);
            } else if !s.writable {
                return Err(Error::NotWritable);
            } else if data.is_empty() {
                return Ok(true);
            } else if !s.queue_is_empty() {
                Outcome::Queued
            } else {
                match s.write_step(data) {
                    Ok(n) if n == data.len() => Outcome::Full,
                    Ok(n) => Outcome::Partial(n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Outcome::Blocked,
                    Err(e) => Outcome::Failed(e),
                }
            }
        };

        match outcome {
            Outcome::Full => {
                self.mark_active_now(index);
                Ok(true)
            }
            Outcome::Queued => {
                let chunk = self.owned_chunk(data);
                let s = self.stream_mut(token)?;
                s.enqueue_back(chunk);
                self.refresh_registration(index);
                Ok(false)
            }
            Outcome::Partial(n) => {
                let chunk = self.owned_chunk(&data[n..]);
                let s = self.stream_mut(token)?;
                s.enqueue_front(chunk);
                self.refresh_registration(index);
                self.mark_active_now(index);
                Ok(false)
            }
            Outcome::Blocked => {
                let chunk = self.owned_chunk(data);
                let s = self.stream_mut(token)?;
                s.enqueue_front(chunk);
                self.refresh_registration(index);
                Ok(false)
            }
            Outcome::Failed(e) => {
                self.force_close_inner(index, Some(Error::write_failure(e)));
                Ok(false)
            }
        }
    }

    fn write_str(&mut self, token: Token, text: &str, encoding: Encoding) -> Result<bool, Error> {
        let index = token.0;
        // slow path and misuse checks first
        {
            let s = self.stream_mut(token)?;
            if s.eof_queued() {
                return Err(Error::CloseAlreadyCalled);
            }
            if s.resolving || s.connecting || !s.queue_is_empty() {
                if text.is_empty() {
                    return Ok(true);
                }
                let mut buf = self.spares.alloc_with(Vec::new);
                buf.clear();
                encoding.encode_into(text, &mut buf);
                let s = self.stream_mut(token)?;
                s.enqueue_back(Chunk::Owned { buf, sent: 0 });
                self.refresh_registration(index);
                return Ok(false);
            }
            if s.io.is_none() {
                return Err(Error::Closed);
            }
            if !s.writable {
                return Err(Error::NotWritable);
            }
            if text.is_empty() {
                return Ok(true);
            }
        }

        let len = encoding.encoded_len(text);
        if let Some(mut reservation) = self.pool.reserve_write(len) {
            encoding.encode_to_slice(text, &mut reservation[..]);
            let outcome = {
                let s = self.stream_mut(token)?;
                s.write_step(&reservation)
            };
            match outcome {
                Ok(n) if n == len => {
                    // fully written strings give their reservation back
                    self.pool.rewind(reservation);
                    self.mark_active_now(index);
                    Ok(true)
                }
                Ok(n) => {
                    let chunk = Chunk::Pooled { data: reservation.freeze(), sent: n };
                    let s = self.stream_mut(token)?;
                    s.enqueue_front(chunk);
                    self.refresh_registration(index);
                    self.mark_active_now(index);
                    Ok(false)
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let chunk = Chunk::Pooled { data: reservation.freeze(), sent: 0 };
                    let s = self.stream_mut(token)?;
                    s.enqueue_front(chunk);
                    self.refresh_registration(index);
                    Ok(false)
                }
                Err(e) => {
                    self.pool.rewind(reservation);
                    self.force_close_inner(index, Some(Error::write_failure(e)));
                    Ok(false)
                }
            }
        } else {
            // too big for the pool: private buffer sized exactly
            let mut buf = self.spares.alloc_with(Vec::new);
            buf.clear();
            buf.reserve_exact(len);
            encoding.encode_into(text, &mut buf);
            let outcome = {
                let s = self.stream_mut(token)?;
                s.write_step(&buf)
            };
            match outcome {
                Ok(n) if n == len => {
                    self.spares.free(buf);
                    self.mark_active_now(index);
                    Ok(true)
                }
                Ok(n) => {
                    let s = self.stream_mut(token)?;
                    s.enqueue_front(Chunk::Owned { buf, sent: n });
                    self.refresh_registration(index);
                    self.mark_active_now(index);
                    Ok(false)
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let s = self.stream_mut(token)?;
                    s.enqueue_front(Chunk::Owned { buf, sent: 0 });
                    self.refresh_registration(index);
                    Ok(false)
                }
                Err(e) => {
                    self.spares.free(buf);
                    self.force_close_inner(index, Some(Error::write_failure(e)));
                    Ok(false)
                }
            }
        }
    }

    fn flush(&mut self, token: Token) -> Result<bool, Error> {
        let index = token.0;
        let (status, wrote) = {
            let Some(Entry::Stream(s)) = self.conns.get_mut(index) else {
                return Err(Error::UnknownToken);
            };
            if s.io.is_none() {
                return Err(Error::Closed);
            }
            if s.connecting {
                return Ok(false);
            }
            let before = s.queued_bytes();
            let status = s.flush(&mut self.spares);
            (status, before != s.queued_bytes())
        };
        if wrote {
            self.mark_active_now(index);
        }
        self.settle_flush(token, status)
    }

    /// Common post-flush bookkeeping; returns whether the queue drained.
    fn settle_flush(&mut self, token: Token, status: Flush) -> Result<bool, Error> {
        let index = token.0;
        match status {
            Flush::Idle => {
                self.refresh_registration(index);
                Ok(true)
            }
            Flush::Drained => {
                self.refresh_registration(index);
                self.deferred.push_back(Deferred::Drain { token });
                Ok(true)
            }
            Flush::Shutdown => {
                let still_readable = match self.conns.get(index) {
                    Some(Entry::Stream(s)) => s.readable,
                    _ => false,
                };
                if still_readable {
                    self.refresh_registration(index);
                } else {
                    self.force_close_inner(index, None);
                }
                Ok(true)
            }
            Flush::Pending => Ok(false),
            Flush::Failed(e) => {
                self.force_close_inner(index, Some(Error::write_failure(e)));
                Ok(false)
            }
        }
    }

    fn close(&mut self, token: Token) -> Result<(), Error> {
        let index = token.0;
        {
            let s = self.stream_mut(token)?;
            if s.close_queued || s.eof_queued() {
                return Ok(());
            }
            if s.resolving {
                self.force_close_inner(index, None);
                return Ok(());
            }
            if s.io.is_none() {
                return Ok(());
            }
            s.enqueue_eof();
        }
        if let Ok(false) = self.flush(token) {
            self.refresh_registration(index);
        }
        Ok(())
    }

    fn force_close_inner(&mut self, index: usize, error: Option<Error>) {
        let registry = self.poll.registry();
        let Some(Entry::Stream(s)) = self.conns.get_mut(index) else { return };
        if s.close_queued {
            return;
        }
        s.close_queued = true;
        s.readable = false;
        s.writable = false;
        s.resolving = false;
        s.connecting = false;
        // dropping the detached half closes the descriptor exactly once
        drop(s.detach_io(registry));
        self.idle.unenroll(&mut self.conns, index);
        if let Some(Entry::Stream(s)) = self.conns.get_mut(index) {
            s.clear_queue(&mut self.spares);
        }
        self.deferred.push_back(Deferred::StreamClosed { token: Token(index), error });
    }

    // ---- timeouts ----

    fn set_timeout(&mut self, token: Token, ms: u64) -> Result<(), Error> {
        let index = token.0;
        let open = match self.conns.get(index) {
            Some(Entry::Stream(s)) => s.io.is_some() && !s.connecting,
            _ => return Err(Error::UnknownToken),
        };
        self.idle.enroll(&mut self.conns, index, ms);
        if open {
            self.mark_active_now(index);
        }
        Ok(())
    }

    fn mark_active_now(&mut self, index: usize) {
        self.idle.mark_active(&mut self.conns, index, Millis::now());
    }

    fn set_paused(&mut self, token: Token, paused: bool) -> Result<(), Error> {
        let index = token.0;
        {
            let s = self.stream_mut(token)?;
            if !paused && s.io.is_none() {
                return Err(Error::Closed);
            }
            s.paused = paused;
        }
        self.refresh_registration(index);
        Ok(())
    }

    fn fire_idle<F: FnMut(Event)>(&mut self, now: Millis, handler: &mut F) -> bool {
        self.expired.clear();
        let mut expired = std::mem::take(&mut self.expired);
        self.idle.expire(&mut self.conns, now, &mut expired);
        let any = !expired.is_empty();
        for &index in &expired {
            safe_assert!(
                matches!(self.conns.get(index), Some(Entry::Stream(_))),
                "expired index {index} is not a stream"
            );
            handler(Event::Timeout { stream: Token(index) });
            self.force_close_inner(index, Some(Error::IdleTimeout));
        }
        self.expired = expired;
        any
    }

    // ---- readiness dispatch ----

    fn dispatch<F: FnMut(Event)>(&mut self, event: &mio::event::Event, handler: &mut F) {
        let token = event.token();
        enum Kind {
            Listener,
            Connecting,
            Stream,
        }
        let kind = match self.conns.get(token.0) {
            None => {
                safe_panic!("readiness for unknown token {:?}", token);
                return;
            }
            Some(Entry::Listener(_)) => Kind::Listener,
            Some(Entry::Stream(s)) => {
                if s.connecting {
                    Kind::Connecting
                } else {
                    Kind::Stream
                }
            }
        };
        match kind {
            Kind::Listener => self.accept_drain(token, handler),
            Kind::Connecting => {
                if event.is_writable() || event.is_error() {
                    self.connect_ready(token, handler);
                }
            }
            Kind::Stream => {
                if event.is_readable() {
                    self.stream_readable(token, handler);
                }
                if event.is_writable() {
                    self.stream_writable(token, handler);
                }
            }
        }
    }

    fn connect_ready<F: FnMut(Event)>(&mut self, token: Token, handler: &mut F) {
        let index = token.0;
        let check = {
            let Some(Entry::Stream(s)) = self.conns.get_mut(index) else { return };
            let Some(io) = s.io.as_ref() else { return };
            io.check_connected()
        };
        match check {
            ConnectCheck::Connected(peer_addr) => {
                {
                    let registry = self.poll.registry();
                    let Some(Entry::Stream(s)) = self.conns.get_mut(index) else { return };
                    s.mark_connected(peer_addr);
                    if let Err(e) = s.update_registration(registry, token) {
                        self.force_close_inner(index, Some(Error::io("register", e)));
                        return;
                    }
                }
                self.mark_active_now(index);
                debug!(?token, "connected");
                handler(Event::Connect { stream: token });
                // drain anything written while the connect was in flight
                self.stream_writable(token, handler);
            }
            ConnectCheck::Pending => {}
            ConnectCheck::Failed(e) => {
                self.force_close_inner(index, Some(Error::io("connect", e)));
            }
        }
    }

    fn stream_readable<F: FnMut(Event)>(&mut self, token: Token, handler: &mut F) {
        let index = token.0;
        loop {
            let step = {
                let Some(Entry::Stream(s)) = self.conns.get_mut(index) else { return };
                if !s.readable || s.paused || s.close_queued {
                    return;
                }
                s.read_step(&mut self.pool)
            };
            match step {
                ReadStep::Data(n) => {
                    let data = self.pool.take(n);
                    self.mark_active_now(index);
                    let payload = {
                        let Some(Entry::Stream(s)) = self.conns.get_mut(index) else { return };
                        match s.encoding {
                            Some(enc) => Payload::Text(enc.decode(&data)),
                            None => Payload::Bytes(data),
                        }
                    };
                    handler(Event::Data { stream: token, payload });
                }
                ReadStep::Eof => {
                    let still_writable = {
                        let registry = self.poll.registry();
                        let Some(Entry::Stream(s)) = self.conns.get_mut(index) else { return };
                        s.readable = false;
                        let _ = s.update_registration(registry, token);
                        s.writable
                    };
                    handler(Event::End { stream: token });
                    if !still_writable {
                        self.force_close_inner(index, None);
                    }
                    return;
                }
                ReadStep::WouldBlock => return,
                ReadStep::Failed(e) => {
                    self.force_close_inner(index, Some(Error::io("read", e)));
                    return;
                }
            }
        }
    }

    fn stream_writable<F: FnMut(Event)>(&mut self, token: Token, handler: &mut F) {
        let index = token.0;
        let (status, wrote) = {
            let Some(Entry::Stream(s)) = self.conns.get_mut(index) else { return };
            if s.close_queued || s.io.is_none() {
                return;
            }
            let before = s.queued_bytes();
            let status = s.flush(&mut self.spares);
            (status, before != s.queued_bytes())
        };
        if wrote {
            self.mark_active_now(index);
        }
        match status {
            Flush::Idle => self.refresh_registration(index),
            Flush::Drained => {
                self.refresh_registration(index);
                handler(Event::Drain { stream: token });
            }
            Flush::Shutdown => {
                let still_readable = match self.conns.get(index) {
                    Some(Entry::Stream(s)) => s.readable,
                    _ => false,
                };
                if still_readable {
                    self.refresh_registration(index);
                } else {
                    self.force_close_inner(index, None);
                }
            }
            Flush::Pending => {}
            Flush::Failed(e) => {
                self.force_close_inner(index, Some(Error::write_failure(e)));
            }
        }
    }

    fn accept_drain<F: FnMut(Event)>(&mut self, server_token: Token, handler: &mut F) {
        loop {
            let accepted = {
                let Some(Entry::Listener(srv)) = self.conns.get_mut(server_token.0) else { return };
                let Some(lio) = srv.io.as_ref() else { return };
                lio.accept()
            };
            match accepted {
                Ok((io, peer_addr)) => {
                    match self.install_open(io, peer_addr) {
                        Ok(stream_token) => {
                            debug!(?peer_addr, "client connected");
                            handler(Event::Connection {
                                server: server_token,
                                stream: stream_token,
                                peer_addr,
                            });
                        }
                        Err(e) => warn!("couldn't register accepted stream: {e}"),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("accept failed, closing listener: {e}");
                    let _ = self.close_server(server_token);
                    return;
                }
            }
        }
    }

    // ---- deferred phase ----

    fn run_deferred<F: FnMut(Event)>(&mut self, handler: &mut F) -> bool {
        let mut any = false;
        // snapshot: items deferred while running wait for the next turn
        let due = self.deferred.len();
        for _ in 0..due {
            let Some(item) = self.deferred.pop_front() else { break };
            any = true;
            match item {
                Deferred::Resolve { token, host, port } => self.finish_resolve(token, &host, port),
                Deferred::Listening { server } => handler(Event::Listening { server }),
                Deferred::Drain { token } => {
                    let alive = matches!(
                        self.conns.get(token.0),
                        Some(Entry::Stream(s)) if s.io.is_some()
                    );
                    if alive {
                        handler(Event::Drain { stream: token });
                    }
                }
                Deferred::StreamClosed { token, error } => {
                    let had_error = error.is_some();
                    if let Some(error) = error {
                        handler(Event::Error { stream: token, error });
                    }
                    handler(Event::Close { stream: token, had_error });
                    if self.conns.contains(token.0) {
                        self.conns.remove(token.0);
                    }
                }
                Deferred::ServerClosed { token } => {
                    handler(Event::ServerClose { server: token });
                    if self.conns.contains(token.0) {
                        self.conns.remove(token.0);
                    }
                }
            }
        }
        any
    }

    /// Deferred half of a resolving connect. Must no-op when the stream
    /// was force-closed in the meantime.
    fn finish_resolve(&mut self, token: Token, host: &str, port: u16) {
        let index = token.0;
        match self.conns.get(index) {
            Some(Entry::Stream(s)) if s.resolving => {}
            _ => return,
        }
        match resolve::lookup(host) {
            Ok(ip) => match dial_tcp(SocketAddr::new(ip, port)) {
                Ok(io) => {
                    let io = StreamIo::Tcp(io);
                    if let Some(size) = self.socket_bufs {
                        io.set_bufs(size);
                    }
                    let registry = self.poll.registry();
                    let Some(Entry::Stream(s)) = self.conns.get_mut(index) else { return };
                    s.resolving = false;
                    s.connecting = true;
                    s.io = Some(io);
                    if let Err(e) = s.update_registration(registry, token) {
                        self.force_close_inner(index, Some(Error::io("register", e)));
                    }
                }
                Err(e) => self.force_close_inner(index, Some(Error::io("connect", e))),
            },
            Err(e) => self.force_close_inner(index, Some(e)),
        }
    }

    fn next_poll_timeout(&self, user: Option<Duration>) -> Option<Duration> {
        if !self.deferred.is_empty() {
            return Some(Duration::ZERO);
        }
        let idle = self
            .idle
            .next_deadline()
            .map(|deadline| Duration::from(deadline.saturating_sub(Millis::now())));
        match (user, idle) {
            (Some(u), Some(i)) => Some(u.min(i)),
            (u, i) => u.or(i),
        }
    }

    /// Re-derives and applies the watcher interest for a stream.
    fn refresh_registration(&mut self, index: usize) {
        let registry = self.poll.registry();
        if let Some(Entry::Stream(s)) = self.conns.get_mut(index)
            && let Err(e) = s.update_registration(registry, Token(index))
        {
            self.force_close_inner(index, Some(Error::io("register", e)));
        }
    }
}
