use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
    os::fd::AsRawFd,
};

use bytes::Bytes;
use mio::{Interest, Registry, Token, net as mio_net};
use rill_utils::FreeList;

use crate::{
    event::{Encoding, ReadyState, Transport},
    idle::{IdleLinks, IdleNode},
    pool::Pool,
};

/// The OS half of a stream. `Option<StreamIo>` on the stream itself plays
/// the nullable-descriptor role: `None` is closed.
pub(crate) enum StreamIo {
    Tcp(mio_net::TcpStream),
    Unix(mio_net::UnixStream),
}

impl StreamIo {
    pub(crate) fn transport(&self) -> Transport {
        match self {
            StreamIo::Tcp(_) => Transport::Tcp,
            StreamIo::Unix(_) => Transport::Unix,
        }
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StreamIo::Tcp(s) => s.read(buf),
            StreamIo::Unix(s) => s.read(buf),
        }
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            StreamIo::Tcp(s) => s.write(buf),
            StreamIo::Unix(s) => s.write(buf),
        }
    }

    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        match self {
            StreamIo::Tcp(s) => s.shutdown(Shutdown::Write),
            StreamIo::Unix(s) => s.shutdown(Shutdown::Write),
        }
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            StreamIo::Tcp(s) => s.take_error(),
            StreamIo::Unix(s) => s.take_error(),
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<Option<SocketAddr>> {
        match self {
            StreamIo::Tcp(s) => s.local_addr().map(Some),
            StreamIo::Unix(_) => Ok(None),
        }
    }

    pub(crate) fn set_nodelay(&self, on: bool) -> io::Result<()> {
        match self {
            StreamIo::Tcp(s) => s.set_nodelay(on),
            StreamIo::Unix(_) => Err(io::ErrorKind::InvalidInput.into()),
        }
    }

    /// Kernel SO_SNDBUF and SO_RCVBUF.
    pub(crate) fn set_bufs(&self, size: usize) {
        let fd = match self {
            StreamIo::Tcp(s) => s.as_raw_fd(),
            StreamIo::Unix(s) => s.as_raw_fd(),
        };
        let size = size as libc::c_int;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                (&raw const size).cast::<libc::c_void>(),
                core::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                (&raw const size).cast::<libc::c_void>(),
                core::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    /// Connect-completion probe, run on the first writable readiness.
    /// A pending socket error fails the connect; for TCP a present peer
    /// address is what distinguishes "connected" from "still in flight".
    pub(crate) fn check_connected(&self) -> ConnectCheck {
        match self.take_error() {
            Ok(Some(err)) | Err(err) => ConnectCheck::Failed(err),
            Ok(None) => match self {
                StreamIo::Tcp(s) => match s.peer_addr() {
                    Ok(addr) => ConnectCheck::Connected(Some(addr)),
                    Err(e)
                        if e.kind() == io::ErrorKind::NotConnected
                            || e.raw_os_error() == Some(libc::EINPROGRESS) =>
                    {
                        ConnectCheck::Pending
                    }
                    Err(e) => ConnectCheck::Failed(e),
                },
                StreamIo::Unix(_) => ConnectCheck::Connected(None),
            },
        }
    }

    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            StreamIo::Tcp(s) => registry.register(s, token, interest),
            StreamIo::Unix(s) => registry.register(s, token, interest),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        match self {
            StreamIo::Tcp(s) => registry.reregister(s, token, interest),
            StreamIo::Unix(s) => registry.reregister(s, token, interest),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            StreamIo::Tcp(s) => registry.deregister(s),
            StreamIo::Unix(s) => registry.deregister(s),
        }
    }
}

pub(crate) enum ConnectCheck {
    Connected(Option<SocketAddr>),
    Pending,
    Failed(io::Error),
}

/// Starts a non-blocking TCP connect. `EINPROGRESS` is the normal case
/// and not an error; completion arrives as writable readiness.
pub(crate) fn dial_tcp(addr: SocketAddr) -> io::Result<mio_net::TcpStream> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(mio_net::TcpStream::from_std(socket.into()))
}

/// A queued outbound span: either a view into a pool slab or a private
/// buffer recycled through the free list. `sent` is the cursor of bytes
/// the kernel already took.
pub(crate) enum Chunk {
    Pooled { data: Bytes, sent: usize },
    Owned { buf: Vec<u8>, sent: usize },
}

impl Chunk {
    #[inline]
    pub(crate) fn remaining(&self) -> &[u8] {
        match self {
            Chunk::Pooled { data, sent } => &data[*sent..],
            Chunk::Owned { buf, sent } => &buf[*sent..],
        }
    }

    #[inline]
    fn advance(&mut self, n: usize) {
        match self {
            Chunk::Pooled { sent, .. } | Chunk::Owned { sent, .. } => *sent += n,
        }
    }

    #[inline]
    fn is_done(&self) -> bool {
        self.remaining().is_empty()
    }

    fn into_spare(self) -> Option<Vec<u8>> {
        match self {
            Chunk::Owned { buf, .. } => Some(buf),
            Chunk::Pooled { .. } => None,
        }
    }
}

/// Write-queue entry; `Eof` requests shutdown-write when reached.
pub(crate) enum WriteItem {
    Data(Chunk),
    Eof,
}

/// What one flush pass achieved.
pub(crate) enum Flush {
    /// Queue was already empty.
    Idle,
    /// Queue emptied while the stream is still writable.
    Drained,
    /// Reached the EOF sentinel and shut the write side down.
    Shutdown,
    /// Stopped at a residual; write interest must stay armed.
    Pending,
    Failed(io::Error),
}

pub(crate) enum ReadStep {
    Data(usize),
    Eof,
    WouldBlock,
    Failed(io::Error),
}

/// Per-connection state machine. Owned by the reactor slab and addressed
/// by token; the reactor performs all event dispatch, this type keeps the
/// flags, the write queue and the socket honest.
pub(crate) struct Stream {
    pub(crate) io: Option<StreamIo>,
    pub(crate) kind: Transport,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) resolving: bool,
    pub(crate) connecting: bool,
    pub(crate) paused: bool,
    /// Set once teardown is queued; makes `force_close` idempotent.
    pub(crate) close_queued: bool,
    registered: Option<Interest>,
    queue: VecDeque<WriteItem>,
    queued_bytes: usize,
    pub(crate) encoding: Option<Encoding>,
    pub(crate) peer_addr: Option<SocketAddr>,
    idle: IdleLinks,
}

impl IdleNode for Stream {
    fn idle(&self) -> &IdleLinks {
        &self.idle
    }

    fn idle_mut(&mut self) -> &mut IdleLinks {
        &mut self.idle
    }
}

impl Stream {
    fn bare(index: usize, kind: Transport) -> Self {
        Self {
            io: None,
            kind,
            readable: false,
            writable: false,
            resolving: false,
            connecting: false,
            paused: false,
            close_queued: false,
            registered: None,
            queue: VecDeque::new(),
            queued_bytes: 0,
            encoding: None,
            peer_addr: None,
            idle: IdleLinks::detached(index),
        }
    }

    /// A connect already submitted to the OS; waits for writability.
    pub(crate) fn connecting(index: usize, io: StreamIo) -> Self {
        let kind = io.transport();
        let mut stream = Self::bare(index, kind);
        stream.io = Some(io);
        stream.connecting = true;
        stream
    }

    /// A connect parked on the resolver; no descriptor yet.
    pub(crate) fn resolving(index: usize) -> Self {
        let mut stream = Self::bare(index, Transport::Tcp);
        stream.resolving = true;
        stream
    }

    /// An inherited descriptor that is already connected.
    pub(crate) fn open(index: usize, io: StreamIo, peer_addr: Option<SocketAddr>) -> Self {
        let kind = io.transport();
        let mut stream = Self::bare(index, kind);
        stream.io = Some(io);
        stream.readable = true;
        stream.writable = true;
        stream.peer_addr = peer_addr;
        stream
    }

    pub(crate) fn ready_state(&self) -> ReadyState {
        if self.resolving {
            ReadyState::Opening
        } else if self.io.is_none() {
            ReadyState::Closed
        } else if self.readable && self.writable {
            ReadyState::Open
        } else if self.readable {
            ReadyState::ReadOnly
        } else if self.writable {
            ReadyState::WriteOnly
        } else {
            ReadyState::Opening
        }
    }

    pub(crate) fn mark_connected(&mut self, peer_addr: Option<SocketAddr>) {
        self.connecting = false;
        self.resolving = false;
        self.readable = true;
        self.writable = true;
        self.peer_addr = peer_addr;
    }

    /// Interest the event loop should currently watch, derived from the
    /// state flags so the armed-iff-needed invariants hold by
    /// construction: read interest while readable and not paused, write
    /// interest exactly while the queue is non-empty.
    fn desired_interest(&self) -> Option<Interest> {
        if self.io.is_none() {
            return None;
        }
        if self.connecting {
            return Some(Interest::WRITABLE);
        }
        let read = self.readable && !self.paused;
        let write = !self.queue.is_empty();
        match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Applies the derived interest, issuing at most one registry call.
    pub(crate) fn update_registration(
        &mut self,
        registry: &Registry,
        token: Token,
    ) -> io::Result<()> {
        let want = self.desired_interest();
        if want == self.registered {
            return Ok(());
        }
        let Some(io) = self.io.as_mut() else { return Ok(()) };
        match (self.registered, want) {
            (None, Some(interest)) => io.register(registry, token, interest)?,
            (Some(_), Some(interest)) => io.reregister(registry, token, interest)?,
            (Some(_), None) => io.deregister(registry)?,
            (None, None) => {}
        }
        self.registered = want;
        Ok(())
    }

    /// Detaches the descriptor for teardown; dropping the returned half
    /// closes the fd exactly once.
    pub(crate) fn detach_io(&mut self, registry: &Registry) -> Option<StreamIo> {
        let mut io = self.io.take()?;
        if self.registered.take().is_some() {
            let _ = io.deregister(registry);
        }
        Some(io)
    }

    #[inline]
    pub(crate) fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub(crate) fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub(crate) fn eof_queued(&self) -> bool {
        matches!(self.queue.back(), Some(WriteItem::Eof))
    }

    pub(crate) fn enqueue_back(&mut self, chunk: Chunk) {
        self.queued_bytes += chunk.remaining().len();
        self.queue.push_back(WriteItem::Data(chunk));
    }

    pub(crate) fn enqueue_front(&mut self, chunk: Chunk) {
        self.queued_bytes += chunk.remaining().len();
        self.queue.push_front(WriteItem::Data(chunk));
    }

    pub(crate) fn enqueue_eof(&mut self) {
        self.queue.push_back(WriteItem::Eof);
    }

    /// Drops all queued data, recycling private buffers.
    pub(crate) fn clear_queue(&mut self, spares: &mut FreeList<Vec<u8>>) {
        for item in self.queue.drain(..) {
            if let WriteItem::Data(chunk) = item
                && let Some(mut buf) = chunk.into_spare()
            {
                buf.clear();
                spares.free(buf);
            }
        }
        self.queued_bytes = 0;
    }

    /// One non-blocking read into the shared pool. The caller claims the
    /// filled span with `pool.take(n)` before the next read.
    pub(crate) fn read_step(&mut self, pool: &mut Pool) -> ReadStep {
        pool.ensure();
        let Some(io) = self.io.as_mut() else { return ReadStep::WouldBlock };
        loop {
            return match io.read(pool.read_space()) {
                Ok(0) => ReadStep::Eof,
                Ok(n) => ReadStep::Data(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadStep::WouldBlock,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => ReadStep::Failed(e),
            };
        }
    }

    /// One non-blocking write of the caller's bytes.
    pub(crate) fn write_step(&mut self, data: &[u8]) -> io::Result<usize> {
        let Some(io) = self.io.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        loop {
            return match io.write(data) {
                Ok(n) => Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(e),
            };
        }
    }

    /// Drains queue heads until the first residual. Stops on a short
    /// write (the kernel will tell us when to continue), shuts down the
    /// write side when the EOF sentinel surfaces, and reports a clean
    /// drain so the caller can emit it.
    pub(crate) fn flush(&mut self, spares: &mut FreeList<Vec<u8>>) -> Flush {
        if self.queue.is_empty() {
            return Flush::Idle;
        }
        let Some(io) = self.io.as_mut() else { return Flush::Idle };
        while let Some(item) = self.queue.front_mut() {
            match item {
                WriteItem::Data(chunk) => {
                    let outcome = loop {
                        match io.write(chunk.remaining()) {
                            Ok(n) => break Ok(n),
                            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(e) => break Err(e),
                        }
                    };
                    match outcome {
                        Ok(0) => return Flush::Failed(io::ErrorKind::WriteZero.into()),
                        Ok(n) => {
                            self.queued_bytes -= n;
                            chunk.advance(n);
                            if chunk.is_done() {
                                if let Some(WriteItem::Data(done)) = self.queue.pop_front()
                                    && let Some(mut buf) = done.into_spare()
                                {
                                    buf.clear();
                                    spares.free(buf);
                                }
                            } else {
                                return Flush::Pending;
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Flush::Pending;
                        }
                        Err(e) => return Flush::Failed(e),
                    }
                }
                WriteItem::Eof => {
                    self.queue.pop_front();
                    self.writable = false;
                    return match io.shutdown_write() {
                        Ok(()) => Flush::Shutdown,
                        Err(e) => Flush::Failed(e),
                    };
                }
            }
        }
        Flush::Drained
    }
}
