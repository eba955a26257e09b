use std::{
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use mio::{Interest, Registry, Token, net as mio_net};
use socket2::{Domain, Socket, Type};

use crate::{error::Error, event::Transport, stream::StreamIo};

/// Listen backlog for both families.
pub(crate) const BACKLOG: i32 = 128;

#[derive(Debug)]
pub(crate) enum ListenerIo {
    Tcp(mio_net::TcpListener),
    Unix(mio_net::UnixListener),
}

impl ListenerIo {
    /// A single accept attempt; the reactor drains until `WouldBlock`.
    pub(crate) fn accept(&self) -> io::Result<(StreamIo, Option<SocketAddr>)> {
        match self {
            ListenerIo::Tcp(l) => l.accept().map(|(s, addr)| (StreamIo::Tcp(s), Some(addr))),
            ListenerIo::Unix(l) => l.accept().map(|(s, _)| (StreamIo::Unix(s), None)),
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<Option<SocketAddr>> {
        match self {
            ListenerIo::Tcp(l) => l.local_addr().map(Some),
            ListenerIo::Unix(_) => Ok(None),
        }
    }

    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        match self {
            ListenerIo::Tcp(l) => registry.register(l, token, Interest::READABLE),
            ListenerIo::Unix(l) => registry.register(l, token, Interest::READABLE),
        }
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            ListenerIo::Tcp(l) => registry.deregister(l),
            ListenerIo::Unix(l) => registry.deregister(l),
        }
    }
}

/// A listening socket plus what is needed to clean up after it.
pub(crate) struct Server {
    pub(crate) io: Option<ListenerIo>,
    pub(crate) kind: Transport,
    pub(crate) path: Option<PathBuf>,
}

impl Server {
    pub(crate) fn tcp(io: ListenerIo) -> Self {
        Self { io: Some(io), kind: Transport::Tcp, path: None }
    }

    pub(crate) fn unix(io: ListenerIo, path: PathBuf) -> Self {
        Self { io: Some(io), kind: Transport::Unix, path: Some(path) }
    }

    /// UNIX listeners own their filesystem name; remove it on shutdown.
    pub(crate) fn unlink_path(&self) {
        if let Some(path) = &self.path {
            let _ = fs::remove_file(path);
        }
    }
}

/// Binds a TCP listener with an explicit backlog.
pub(crate) fn bind_tcp(addr: SocketAddr) -> Result<ListenerIo, Error> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None).map_err(|e| Error::io("socket", e))?;
    socket.set_reuse_address(true).map_err(|e| Error::io("setsockopt", e))?;
    socket.set_nonblocking(true).map_err(|e| Error::io("fcntl", e))?;
    socket.bind(&addr.into()).map_err(|e| Error::io("bind", e))?;
    socket.listen(BACKLOG).map_err(|e| Error::io("listen", e))?;
    Ok(ListenerIo::Tcp(mio_net::TcpListener::from_std(socket.into())))
}

/// Binds a UNIX listener, clearing a stale regular file first.
///
/// An absent path binds directly; a regular file is unlinked; anything
/// else at the path refuses without touching it.
pub(crate) fn bind_unix(path: &Path) -> Result<ListenerIo, Error> {
    match fs::metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::io("stat", e)),
        Ok(meta) if meta.is_file() => {
            fs::remove_file(path).map_err(|e| Error::io("unlink", e))?;
        }
        Ok(_) => return Err(Error::PathNotFile { path: path.to_owned() }),
    }
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(|e| Error::io("socket", e))?;
    socket.set_nonblocking(true).map_err(|e| Error::io("fcntl", e))?;
    let addr = socket2::SockAddr::unix(path).map_err(|e| Error::io("bind", e))?;
    socket.bind(&addr).map_err(|e| Error::io("bind", e))?;
    socket.listen(BACKLOG).map_err(|e| Error::io("listen", e))?;
    let std_listener: std::os::unix::net::UnixListener =
        std::os::fd::OwnedFd::from(socket).into();
    Ok(ListenerIo::Unix(mio_net::UnixListener::from_std(std_listener)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_regular_file_is_unlinked_and_bound() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        fs::write(&path, b"leftover").unwrap();

        let listener = bind_unix(&path).unwrap();
        assert!(matches!(listener, ListenerIo::Unix(_)));
        // the regular file is gone, replaced by the socket
        assert!(!fs::metadata(&path).unwrap().is_file());
    }

    #[test]
    fn directory_at_path_refuses_without_unlinking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken");
        fs::create_dir(&path).unwrap();

        let err = bind_unix(&path).unwrap_err();
        assert!(matches!(err, Error::PathNotFile { .. }));
        assert!(fs::metadata(&path).unwrap().is_dir());
    }

    #[test]
    fn absent_path_binds_directly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.sock");
        bind_unix(&path).unwrap();
        assert!(fs::metadata(&path).is_ok());
    }
}
