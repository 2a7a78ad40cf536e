/*! FCGI Servers usually listen on TCP as well as Unixsockets
 *
 * A web server that spawns the application itself passes the listening socket
 * as file descriptor 0 ([`LISTENSOCK_FILENO`](crate::fastcgi::LISTENSOCK_FILENO)).
 */

use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use std::fmt;
use std::io;
use std::net;
#[cfg(unix)]
use std::os::unix::net as unix;
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Where a [`Listener`] accepts connections
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FCGIAddr {
    Inet(net::SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl From<net::SocketAddr> for FCGIAddr {
    fn from(s: net::SocketAddr) -> FCGIAddr {
        FCGIAddr::Inet(s)
    }
}

#[cfg(unix)]
impl From<&Path> for FCGIAddr {
    fn from(s: &Path) -> FCGIAddr {
        FCGIAddr::Unix(s.to_path_buf())
    }
}
#[cfg(unix)]
impl From<PathBuf> for FCGIAddr {
    fn from(s: PathBuf) -> FCGIAddr {
        FCGIAddr::Unix(s)
    }
}
#[cfg(unix)]
impl From<unix::SocketAddr> for FCGIAddr {
    fn from(s: unix::SocketAddr) -> FCGIAddr {
        FCGIAddr::Unix(match s.as_pathname() {
            None => Path::new("unnamed").to_path_buf(),
            Some(p) => p.to_path_buf(),
        })
    }
}
#[cfg(unix)]
impl From<tokio::net::unix::SocketAddr> for FCGIAddr {
    fn from(s: tokio::net::unix::SocketAddr) -> FCGIAddr {
        FCGIAddr::Unix(match s.as_pathname() {
            None => Path::new("unnamed").to_path_buf(),
            Some(p) => p.to_path_buf(),
        })
    }
}

impl fmt::Display for FCGIAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FCGIAddr::Inet(n) => write!(f, "{}", n),
            #[cfg(unix)]
            FCGIAddr::Unix(n) => write!(f, "{}", n.to_string_lossy()),
        }
    }
}

/// `/some/path` is a unix socket, anything else an `ip:port`
impl FromStr for FCGIAddr {
    type Err = net::AddrParseError;

    #[cfg(unix)]
    fn from_str(s: &str) -> Result<FCGIAddr, net::AddrParseError> {
        if s.starts_with('/') {
            Ok(FCGIAddr::Unix(PathBuf::from(s)))
        } else {
            s.parse().map(FCGIAddr::Inet)
        }
    }

    #[cfg(not(unix))]
    fn from_str(s: &str) -> Result<FCGIAddr, net::AddrParseError> {
        s.parse().map(FCGIAddr::Inet)
    }
}

/// A source of connections from web servers
#[derive(Debug)]
pub enum Listener {
    Inet(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl From<TcpListener> for Listener {
    fn from(s: TcpListener) -> Listener {
        Listener::Inet(s)
    }
}
#[cfg(unix)]
impl From<UnixListener> for Listener {
    fn from(s: UnixListener) -> Listener {
        Listener::Unix(s)
    }
}

impl Listener {
    pub async fn bind(addr: &FCGIAddr) -> io::Result<Listener> {
        match addr {
            FCGIAddr::Inet(a) => TcpListener::bind(a).await.map(Listener::Inet),
            #[cfg(unix)]
            FCGIAddr::Unix(p) => UnixListener::bind(p).map(Listener::Unix),
        }
    }
    /// The socket the web server handed over as `FCGI_LISTENSOCK_FILENO`
    ///
    /// Must be called from within a tokio runtime.
    #[cfg(unix)]
    pub fn from_listensock() -> io::Result<Listener> {
        // fd 0 is only ours if we were spawned as a FastCGI application
        unsafe { Listener::from_raw_fd(crate::fastcgi::LISTENSOCK_FILENO) }
    }
    /// Take ownership of an already listening socket, unix or TCP.
    ///
    /// # Safety
    /// `fd` must be an open listening socket that nothing else owns.
    #[cfg(unix)]
    pub unsafe fn from_raw_fd(fd: std::os::unix::io::RawFd) -> io::Result<Listener> {
        use std::os::unix::io::{FromRawFd, IntoRawFd};

        let l = unix::UnixListener::from_raw_fd(fd);
        if l.local_addr().is_ok() {
            l.set_nonblocking(true)?;
            return UnixListener::from_std(l).map(Listener::Unix);
        }
        let l = net::TcpListener::from_raw_fd(l.into_raw_fd());
        l.set_nonblocking(true)?;
        TcpListener::from_std(l).map(Listener::Inet)
    }
    pub async fn accept(&self) -> io::Result<(Stream, FCGIAddr)> {
        match self {
            Listener::Inet(l) => {
                let (s, a) = l.accept().await?;
                Ok((Stream::Inet(s), FCGIAddr::Inet(a)))
            }
            #[cfg(unix)]
            Listener::Unix(l) => {
                let (s, a) = l.accept().await?;
                Ok((Stream::Unix(s), a.into()))
            }
        }
    }
    pub fn local_addr(&self) -> io::Result<FCGIAddr> {
        match self {
            Listener::Inet(l) => l.local_addr().map(FCGIAddr::Inet),
            #[cfg(unix)]
            Listener::Unix(l) => l.local_addr().map(|e| e.into()),
        }
    }
}

/// An accepted connection
#[derive(Debug)]
pub enum Stream {
    Inet(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl From<TcpStream> for Stream {
    fn from(s: TcpStream) -> Stream {
        Stream::Inet(s)
    }
}

#[cfg(unix)]
impl From<UnixStream> for Stream {
    fn from(s: UnixStream) -> Stream {
        Stream::Unix(s)
    }
}

impl Stream {
    pub async fn connect(s: &FCGIAddr) -> io::Result<Stream> {
        match s {
            FCGIAddr::Inet(s) => TcpStream::connect(s).await.map(Stream::Inet),
            #[cfg(unix)]
            FCGIAddr::Unix(s) => UnixStream::connect(s).await.map(Stream::Unix),
        }
    }

    pub fn local_addr(&self) -> io::Result<FCGIAddr> {
        match self {
            Stream::Inet(s) => s.local_addr().map(FCGIAddr::Inet),
            #[cfg(unix)]
            Stream::Unix(s) => s.local_addr().map(|e| e.into()),
        }
    }

    pub fn peer_addr(&self) -> io::Result<FCGIAddr> {
        match self {
            Stream::Inet(s) => s.peer_addr().map(FCGIAddr::Inet),
            #[cfg(unix)]
            Stream::Unix(s) => s.peer_addr().map(|e| e.into()),
        }
    }
}
impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Inet(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}
impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Stream::Inet(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Inet(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        match &mut *self {
            Stream::Inet(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Stream::Inet(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write_vectored(cx, bufs),
        }
    }
    fn is_write_vectored(&self) -> bool {
        match self {
            Stream::Inet(s) => s.is_write_vectored(),
            #[cfg(unix)]
            Stream::Unix(s) => s.is_write_vectored(),
        }
    }
}
