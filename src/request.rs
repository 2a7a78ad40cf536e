/*! A FastCGI request received from the web server.

[`Request`]s are created by the connection they arrive on and handed to the
application through [`Incoming`](crate::server::Incoming) once all
parameters are known.
The handle is the only way for the application to talk back:
write to [`Request::output_stream`] / [`Request::error_stream`], read from
[`Request::input_stream`] and end it with [`Request::finalize`].

```no_run
# use async_fcgi_server::server::{Config, Server};
# use tokio::io::{AsyncReadExt, AsyncWriteExt};
# async fn app() -> std::io::Result<()> {
let (server, mut incoming) = Server::new(Config::default());
server.bind(&"127.0.0.1:9000".parse().unwrap()).await?;
while let Some(mut req) = incoming.next().await {
    let mut body = Vec::new();
    req.input_stream().read_to_end(&mut body).await?;
    let out = req.output_stream();
    out.write_all(b"Content-Type: text/plain\r\n\r\n").await?;
    out.write_all(format!("got {} bytes\n", body.len()).as_bytes()).await?;
    req.finalize(0)?;
}
# Ok(())
# }
```
*/
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::io::{Error as IoError, ErrorKind};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::UnboundedSender;

use crate::duplex::DuplexStream;
use crate::fastcgi::RecordType;

/// What the application asks its connection to do
#[derive(Debug)]
pub(crate) enum Outbound {
    /// STDOUT or STDERR data
    Write {
        request_id: u16,
        rtype: RecordType,
        data: Bytes,
    },
    Finalize {
        request_id: u16,
        app_status: u32,
    },
    /// the handle was dropped without `finalize`
    Abandon { request_id: u16 },
}

pub(crate) type SharedStream = Arc<Mutex<DuplexStream>>;

/// Request stream
///
/// Manages one request from
/// `FCGI_BEGIN_REQUEST` to `FCGI_END_REQUEST`
pub struct Request {
    id: u16,
    conn_id: u64,
    keep_conn: bool,
    params: HashMap<String, String>,
    stdin: InputStream,
    stdout: OutputStream,
    stderr: OutputStream,
    con: UnboundedSender<Outbound>,
    finalized: bool,
}

/// FCGI_STDIN of a [`Request`]
///
/// Data is buffered as it arrives on the connection, independent of
/// whether the application reads it yet.
pub struct InputStream {
    inner: SharedStream,
}

/// FCGI_STDOUT or FCGI_STDERR of a [`Request`]
///
/// Every write is turned into records of at most 65535 bytes by the
/// connection task, in the order the writes were made.
pub struct OutputStream {
    request_id: u16,
    rtype: RecordType,
    con: UnboundedSender<Outbound>,
}

fn gone() -> IoError {
    IoError::new(ErrorKind::BrokenPipe, "FastCGI connection is closed")
}

impl Request {
    pub(crate) fn new(
        id: u16,
        conn_id: u64,
        keep_conn: bool,
        params: HashMap<String, String>,
        stdin: SharedStream,
        con: UnboundedSender<Outbound>,
    ) -> Request {
        Request {
            id,
            conn_id,
            keep_conn,
            params,
            stdin: InputStream { inner: stdin },
            stdout: OutputStream::new(id, RecordType::StdOut, con.clone()),
            stderr: OutputStream::new(id, RecordType::StdErr, con.clone()),
            con,
            finalized: false,
        }
    }
    /// The FastCGI request id, unique on its connection while the request runs
    pub fn get_id(&self) -> u16 {
        self.id
    }
    /// Id of the connection this request arrived on
    pub fn connection_id(&self) -> u64 {
        self.conn_id
    }
    /// If `false`, the connection is closed once this request is finalized
    pub fn keep_connection(&self) -> bool {
        self.keep_conn
    }
    pub fn get_param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
    /// Names of all parameters, in no particular order
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }
    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }
    pub fn input_stream(&mut self) -> &mut InputStream {
        &mut self.stdin
    }
    pub fn output_stream(&mut self) -> &mut OutputStream {
        &mut self.stdout
    }
    pub fn error_stream(&mut self) -> &mut OutputStream {
        &mut self.stderr
    }
    /// End the request.
    ///
    /// The web server receives the end of STDOUT and STDERR followed by
    /// FCGI_END_REQUEST with `app_status` (0 usually means success).
    /// The connection is closed afterwards unless [`Request::keep_connection`].
    ///
    /// Dropping a `Request` without calling this ends it with status 1.
    pub fn finalize(mut self, app_status: u32) -> Result<(), IoError> {
        self.finalized = true;
        self.con
            .send(Outbound::Finalize {
                request_id: self.id,
                app_status,
            })
            .map_err(|_| gone())
    }
    /// Drop without telling the connection
    pub(crate) fn discard(mut self) {
        self.finalized = true;
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        let abandon = Outbound::Abandon {
            request_id: self.id,
        };
        // nothing to end if the connection is gone
        let _ = self.con.send(abandon);
    }
}

impl InputStream {
    fn lock(&self) -> MutexGuard<'_, DuplexStream> {
        // the stream holds no invariant a panicking holder could break
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
    /// Read without waiting.
    ///
    /// - `Ok(n)` with `n > 0`: data
    /// - `Ok(0)`: the web server ended the stream
    /// - `Err(WouldBlock)`: nothing has arrived yet
    pub fn try_read(&mut self, dst: &mut [u8]) -> Result<usize, IoError> {
        self.lock().read(dst)
    }
    pub fn bytes_available(&self) -> usize {
        self.lock().bytes_available()
    }
    /// everything was read and the web server ended the stream
    pub fn at_end(&self) -> bool {
        self.lock().at_end()
    }
}

impl AsyncRead for InputStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let mut stream = self.lock();
        match stream.read(buf.initialize_unfilled()) {
            Ok(n) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                stream.set_waker(cx.waker());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl OutputStream {
    fn new(request_id: u16, rtype: RecordType, con: UnboundedSender<Outbound>) -> OutputStream {
        OutputStream {
            request_id,
            rtype,
            con,
        }
    }
    /// Returns the stream this writer is writing to.
    pub fn stream(&self) -> RecordType {
        self.rtype
    }
    /// Queue `data` for the web server.
    /// Empty writes are dropped, the end of stream is sent by [`Request::finalize`]
    pub fn write_bytes(&mut self, data: Bytes) -> Result<usize, IoError> {
        let len = data.len();
        if len == 0 {
            return Ok(0);
        }
        self.con
            .send(Outbound::Write {
                request_id: self.request_id,
                rtype: self.rtype,
                data,
            })
            .map_err(|_| gone())?;
        Ok(len)
    }
}

impl AsyncWrite for OutputStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Poll::Ready(self.get_mut().write_bytes(Bytes::copy_from_slice(buf)))
    }
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl std::io::Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_bytes(Bytes::copy_from_slice(buf))
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("conn_id", &self.conn_id)
            .field("keep_conn", &self.keep_conn)
            .field("params", &self.params)
            .finish()
    }
}
