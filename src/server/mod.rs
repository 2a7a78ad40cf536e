/*! Fast CGI server/application side

A [`Server`] owns every connection a web server opened to it.
Connections come from one or more [`Listener`]s or are handed over
directly with [`Server::serve_connection`].
Requests that are ready for the application show up on [`Incoming`].

```no_run
use async_fcgi_server::server::{Config, Server};

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let (server, mut incoming) = Server::new(Config::default().max_conns(64));
    server.bind(&"127.0.0.1:9000".parse().unwrap()).await?;
    while let Some(mut req) = incoming.next().await {
        let name = req.get_param("SCRIPT_NAME").unwrap_or("?").to_string();
        req.output_stream().write_bytes(format!("Status: 200\r\n\r\n{}", name).into())?;
        req.finalize(0)?;
    }
    Ok(())
}
```
*/
use log::{debug, error, info};
use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;

use crate::request::Request;
use crate::stream::{FCGIAddr, Listener};

pub mod connection;

use connection::{next_connection_id, InnerConnection};

/// Receive buffer capacity of a new connection
pub const DEFAULT_READ_BUFFER: usize = 8 * 1024;
/// room for one record header
const MIN_READ_BUFFER: usize = 8;

/// Server settings
#[derive(Debug, Clone)]
pub struct Config {
    max_conns: Option<usize>,
    read_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_conns: None,
            read_buffer_size: DEFAULT_READ_BUFFER,
        }
    }
}

impl Config {
    /// Accept at most `max` connections at the same time.
    /// Accept loops wait until a connection ends.
    pub fn max_conns(mut self, max: usize) -> Config {
        self.max_conns = Some(max);
        self
    }
    pub fn read_buffer_size(mut self, size: usize) -> Config {
        self.read_buffer_size = size.max(MIN_READ_BUFFER);
        self
    }
    pub fn get_max_conns(&self) -> Option<usize> {
        self.max_conns
    }
    pub fn get_read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }
}

struct Shared {
    config: Config,
    ready: UnboundedSender<Request>,
    conns: Mutex<HashMap<u64, AbortHandle>>,
    listeners: Mutex<Vec<AbortHandle>>,
    permits: Option<Arc<Semaphore>>,
}

/// Handle to the set of connections.
/// Clones share the same set.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Shared>,
}

/// Requests that are ready for the application
pub struct Incoming {
    rx: UnboundedReceiver<Request>,
}

impl Incoming {
    /// Wait for the next request.
    /// `None` once the [`Server`] and all its connections are gone
    pub async fn next(&mut self) -> Option<Request> {
        self.rx.recv().await
    }
    /// A request if one is ready right now
    pub fn try_next(&mut self) -> Option<Request> {
        self.rx.try_recv().ok()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Server {
    pub fn new(config: Config) -> (Server, Incoming) {
        let (ready, rx) = unbounded_channel();
        let permits = config.max_conns.map(|m| Arc::new(Semaphore::new(m)));
        let server = Server {
            inner: Arc::new(Shared {
                config,
                ready,
                conns: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                permits,
            }),
        };
        (server, Incoming { rx })
    }
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Run the protocol on `io` in a new task.
    /// Returns the id of the new connection.
    ///
    /// This does not count against [`Config::max_conns`].
    /// Must be called from within a tokio runtime.
    pub fn serve_connection<IO>(&self, io: IO) -> u64
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.spawn_connection(io, None)
    }

    fn spawn_connection<IO>(&self, io: IO, permit: Option<OwnedSemaphorePermit>) -> u64
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = next_connection_id();
        let (tx, rx) = unbounded_channel();
        let con = InnerConnection::new(id, tx, self.inner.ready.clone());
        let read_buffer_size = self.inner.config.read_buffer_size;
        let shared = Arc::clone(&self.inner);
        // hold the lock so the task can not remove itself before it is added
        let mut conns = lock(&self.inner.conns);
        let task = tokio::spawn(async move {
            if let Err(e) = con.run(io, rx, read_buffer_size).await {
                debug!("[{}] ended with {}", id, e);
            }
            lock(&shared.conns).remove(&id);
            drop(permit);
        });
        conns.insert(id, task.abort_handle());
        debug!("[{}] new connection ({} open)", id, conns.len());
        id
    }

    /// Accept connections from `listener` until it fails or the server is shut down.
    pub async fn serve(&self, listener: Listener) -> Result<(), IoError> {
        let addr = listener.local_addr().map(|a| a.to_string()).unwrap_or_default();
        info!("serving {}", addr);
        loop {
            let permit = match &self.inner.permits {
                Some(sem) => match Arc::clone(sem).acquire_owned().await {
                    Ok(p) => Some(p),
                    // closed by shutdown
                    Err(_) => return Ok(()),
                },
                None => None,
            };
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let id = self.spawn_connection(stream, permit);
                    info!("[{}] accepted {} on {}", id, peer, addr);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionAborted
                            | ErrorKind::ConnectionReset
                            | ErrorKind::Interrupted
                    ) =>
                {
                    debug!("accept on {}: {}", addr, e);
                }
                Err(e) => {
                    error!("accept on {}: {}", addr, e);
                    return Err(e);
                }
            }
        }
    }

    /// Listen on `addr` and accept connections in a new task.
    /// Returns the address that was bound (useful for port 0).
    pub async fn bind(&self, addr: &FCGIAddr) -> Result<FCGIAddr, IoError> {
        let listener = Listener::bind(addr).await?;
        let local = listener.local_addr()?;
        self.spawn_listener(listener);
        Ok(local)
    }

    /// Accept connections on the socket inherited as `FCGI_LISTENSOCK_FILENO`
    /// in a new task.
    #[cfg(unix)]
    pub fn serve_listensock(&self) -> Result<(), IoError> {
        let listener = Listener::from_listensock()?;
        self.spawn_listener(listener);
        Ok(())
    }

    fn spawn_listener(&self, listener: Listener) {
        let server = self.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                error!("listener stopped: {}", e);
            }
        });
        lock(&self.inner.listeners).push(task.abort_handle());
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        lock(&self.inner.conns).len()
    }

    /// Stop accepting and drop every connection.
    /// Running requests are discarded.
    pub fn shutdown(&self) {
        if let Some(sem) = &self.inner.permits {
            sem.close();
        }
        for l in lock(&self.inner.listeners).drain(..) {
            l.abort();
        }
        let conns: Vec<_> = lock(&self.inner.conns).drain().collect();
        info!("shutdown, dropping {} connections", conns.len());
        for (_, c) in conns {
            c.abort();
        }
    }
}
