/*! A single connection (TCP, Unix or any other duplex) from a web server.

Multiple Requests can be multiplexed on it.
Everything that happens on a connection runs inside one task:
records are read and dispatched, parameters decoded and the output of the
application is cut into records and written back. The application talks to
that task through the [`Request`] handles it was given.
*/
use bytes::{Bytes, BytesMut};
use log::{debug, error, info, log_enabled, trace, warn, Level::Trace};
use std::collections::HashMap;
use std::fmt;
use std::io::{Error as IoError, ErrorKind};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::RecordCodec;
use crate::duplex::{DuplexStream, Mode};
use crate::fastcgi::{BeginRequestBody, EndRequestBody, Record, RecordType, MAX_LENGTH};
use crate::params::ParamDecoder;
use crate::request::{Outbound, Request, SharedStream};

/// app_status of a request the application dropped without finalizing
pub const ABANDONED_STATUS: u32 = 1;

/// initialized once, never reset
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// The web server sent something that makes the rest of the connection unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// FCGI_BEGIN_REQUEST with less than 8 bytes of content
    BadBeginRequest(u16),
    /// A record for a request id that is not running
    OrphanRecord { request_id: u16, rtype: RecordType },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// FCGI_BEGIN_REQUEST seen, collecting FCGI_PARAMS
    Open,
    /// handed to the application
    Ready,
}

/// Connection side of a request
struct RequestSlot {
    keep_conn: bool,
    state: State,
    params: ParamDecoder,
    stdin: SharedStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
}

impl RequestSlot {
    fn new(keep_conn: bool) -> RequestSlot {
        RequestSlot {
            keep_conn,
            state: State::Open,
            params: ParamDecoder::new(),
            stdin: Arc::new(Mutex::new(DuplexStream::open(Mode::Read))),
            stdout: DuplexStream::open(Mode::Write),
            stderr: DuplexStream::open(Mode::Write),
        }
    }
}
impl Drop for RequestSlot {
    fn drop(&mut self) {
        // readers still holding the Request learn that the connection is gone
        self.stdin.lock().unwrap_or_else(|e| e.into_inner()).close();
    }
}

/// Multiplexing table and outbound buffer of one connection
pub(crate) struct InnerConnection {
    id: u64,
    requests: HashMap<u16, RequestSlot>,
    codec: RecordCodec,
    wbuf: BytesMut,
    /// no more records are dispatched
    closing: bool,
    /// cloned into every Request
    tx: UnboundedSender<Outbound>,
    ready: UnboundedSender<Request>,
}

fn emit(codec: &mut RecordCodec, wbuf: &mut BytesMut, rec: Record) {
    trace!(
        "send {} #{} ({} bytes)",
        rec.get_type(),
        rec.get_request_id(),
        rec.get_content().len()
    );
    if let Err(e) = codec.encode(rec, wbuf) {
        // only records we built ourselves get here, all of them fit
        error!("{}", e);
    }
}

impl InnerConnection {
    pub(crate) fn new(
        id: u64,
        tx: UnboundedSender<Outbound>,
        ready: UnboundedSender<Request>,
    ) -> InnerConnection {
        InnerConnection {
            id,
            requests: HashMap::new(),
            codec: RecordCodec::new(),
            wbuf: BytesMut::new(),
            closing: false,
            tx,
            ready,
        }
    }
    pub(crate) fn is_closing(&self) -> bool {
        self.closing
    }
    fn send(&mut self, rec: Record) {
        emit(&mut self.codec, &mut self.wbuf, rec);
    }
    fn close(&mut self) {
        debug!("[{}] closing", self.id);
        self.closing = true;
    }

    /// Dispatch every whole record in `rbuf`.
    /// Stops early once the connection is closing.
    pub(crate) fn decode(&mut self, rbuf: &mut BytesMut) -> Result<(), IoError> {
        while !self.closing {
            match self.codec.decode(rbuf)? {
                Some(rec) => self.dispatch(rec)?,
                None => break,
            }
        }
        Ok(())
    }

    pub(crate) fn dispatch(&mut self, rec: Record) -> Result<(), DispatchError> {
        let rid = rec.get_request_id();
        let rtype = rec.get_type();
        if rec.is_management() {
            debug!("[{}] management record {} ignored", self.id, rtype);
            return Ok(());
        }
        if rtype == RecordType::BeginRequest {
            return self.begin_request(rid, rec.get_content());
        }
        let id = self.id;
        let slot = self
            .requests
            .get_mut(&rid)
            .ok_or(DispatchError::OrphanRecord { request_id: rid, rtype })?;
        let content = rec.into_content();
        match rtype {
            RecordType::Params if slot.state == State::Ready => {
                warn!("[{}] #{} {} after the end of the stream", id, rid, rtype);
            }
            RecordType::Params if content.is_empty() => {
                debug!("[{}] #{} FCGI_PARAMS (end of stream)", id, rid);
                let pending = slot.params.pending();
                if pending > 0 {
                    warn!("[{}] #{} {} bytes of an incomplete param dropped", id, rid, pending);
                }
                slot.state = State::Ready;
                let params = mem::take(&mut slot.params).into_params();
                let stdin = slot.stdin.clone();
                let req = Request::new(rid, id, slot.keep_conn, params, stdin, self.tx.clone());
                if let Err(SendError(req)) = self.ready.send(req) {
                    warn!("[{}] #{} nobody takes requests anymore", id, rid);
                    req.discard();
                    self.finalize(rid, ABANDONED_STATUS);
                }
            }
            RecordType::Params => {
                let n = slot.params.feed(&content);
                trace!("[{}] #{} FCGI_PARAMS: {} pairs", id, rid, n);
            }
            RecordType::StdIn if content.is_empty() => {
                debug!("[{}] #{} FCGI_STDIN (end of stream)", id, rid);
                if !slot.stdin.lock().unwrap_or_else(|e| e.into_inner()).set_eof() {
                    debug!("[{}] #{} FCGI_STDIN already ended", id, rid);
                }
            }
            RecordType::StdIn => {
                if log_enabled!(Trace) {
                    let len = content.len();
                    let print = if len > 50 {
                        let (head, tail) = (content.slice(..21), content.slice(len - 21..));
                        format!("({}) {:?}...{:?}", len, head, tail)
                    } else {
                        format!("{:?}", content)
                    };
                    trace!("[{}] #{} FCGI_STDIN {}", id, rid, print);
                }
                if !slot.stdin.lock().unwrap_or_else(|e| e.into_inner()).append(content) {
                    warn!("[{}] #{} FCGI_STDIN after the end of the stream", id, rid);
                }
            }
            other => debug!("[{}] #{} {} ignored", id, rid, other),
        }
        Ok(())
    }

    fn begin_request(&mut self, rid: u16, content: &Bytes) -> Result<(), DispatchError> {
        let body = BeginRequestBody::parse(content).ok_or(DispatchError::BadBeginRequest(rid))?;
        let keep_conn = body.keep_conn();
        if body.role != BeginRequestBody::RESPONDER {
            let valid = body.is_defined_role();
            info!(
                "[{}] #{} {} role {} (keep_conn: {})",
                self.id,
                rid,
                if valid { "unsupported" } else { "invalid" },
                body.role,
                keep_conn
            );
            self.send(Record::end_request(rid, 0, EndRequestBody::UNKNOWN_ROLE));
            // a refused request ends like any other: keep_conn decides.
            // An undefined role means the peer is confused, always close then.
            if !valid || !keep_conn {
                self.close();
            }
            return Ok(());
        }
        if self.requests.contains_key(&rid) {
            warn!("[{}] #{} is already running", self.id, rid);
            self.send(Record::end_request(rid, 0, EndRequestBody::OVERLOADED));
            self.close();
            return Ok(());
        }
        debug!("[{}] #{} new request (keep_conn: {})", self.id, rid, keep_conn);
        self.requests.insert(rid, RequestSlot::new(keep_conn));
        Ok(())
    }

    /// Act on a message from a Request handle
    pub(crate) fn handle(&mut self, msg: Outbound) {
        match msg {
            Outbound::Write {
                request_id,
                rtype,
                data,
            } => self.output(request_id, rtype, data),
            Outbound::Finalize {
                request_id,
                app_status,
            } => self.finalize(request_id, app_status),
            Outbound::Abandon { request_id } => {
                warn!("[{}] #{} dropped without finalize", self.id, request_id);
                self.finalize(request_id, ABANDONED_STATUS);
            }
        }
    }

    fn output(&mut self, request_id: u16, rtype: RecordType, data: Bytes) {
        let InnerConnection {
            id,
            requests,
            codec,
            wbuf,
            ..
        } = self;
        let slot = match requests.get_mut(&request_id) {
            Some(slot) => slot,
            None => {
                debug!("[{}] #{} output for a request that is gone", id, request_id);
                return;
            }
        };
        let stream = match rtype {
            RecordType::StdErr => &mut slot.stderr,
            _ => &mut slot.stdout,
        };
        if let Err(e) = stream.write(data) {
            error!("[{}] #{} {}", id, request_id, e);
            return;
        }
        while let Some(chunk) = stream.drain(MAX_LENGTH) {
            emit(codec, wbuf, Record::new(rtype, request_id, chunk));
        }
    }

    fn finalize(&mut self, request_id: u16, app_status: u32) {
        let slot = match self.requests.remove(&request_id) {
            Some(slot) => slot,
            None => {
                warn!("[{}] #{} finalized twice", self.id, request_id);
                return;
            }
        };
        debug!("[{}] #{} end request ({})", self.id, request_id, app_status);
        self.send(Record::stdout(request_id, Bytes::new()));
        self.send(Record::stderr(request_id, Bytes::new()));
        self.send(Record::end_request(request_id, app_status, EndRequestBody::REQUEST_COMPLETE));
        if !slot.keep_conn {
            self.close();
        }
    }

    async fn flush<W: AsyncWrite + Unpin>(&mut self, wr: &mut W) -> Result<(), IoError> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        wr.write_all_buf(&mut self.wbuf).await?;
        wr.flush().await
    }

    /// Serve `io` until the web server disconnects,
    /// the connection is closed by the protocol or an error happens.
    ///
    /// Running requests are discarded, not finalized.
    pub(crate) async fn run<IO>(
        mut self,
        io: IO,
        mut rx: UnboundedReceiver<Outbound>,
        read_buffer_size: usize,
    ) -> Result<(), IoError>
    where
        IO: AsyncRead + AsyncWrite,
    {
        let (mut rd, mut wr) = tokio::io::split(io);
        let mut rbuf = BytesMut::with_capacity(read_buffer_size);
        let res = loop {
            if rbuf.capacity() == rbuf.len() {
                rbuf.reserve(read_buffer_size);
            }
            tokio::select! {
                read = rd.read_buf(&mut rbuf) => match read {
                    Ok(0) => {
                        info!("[{}] connection closed", self.id);
                        break Ok(());
                    }
                    Ok(n) => {
                        trace!("[{}] read {} bytes", self.id, n);
                        if let Err(e) = self.decode(&mut rbuf) {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(e),
                },
                Some(msg) = rx.recv() => self.handle(msg),
            }
            if let Err(e) = self.flush(&mut wr).await {
                break Err(e);
            }
            if self.is_closing() {
                if let Err(e) = wr.shutdown().await {
                    debug!("[{}] shutdown: {}", self.id, e);
                }
                break Ok(());
            }
        };
        if let Err(e) = &res {
            error!("[{}] {}", self.id, e);
        }
        self.teardown();
        res
    }

    fn teardown(&mut self) {
        if !self.requests.is_empty() {
            info!("[{}] discarding {} running requests", self.id, self.requests.len());
        }
        self.requests.clear();
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DispatchError::BadBeginRequest(rid) => {
                write!(f, "#{} FCGI_BEGIN_REQUEST is too short", rid)
            }
            DispatchError::OrphanRecord { request_id, rtype } => {
                write!(f, "{} for unknown request #{}", rtype, request_id)
            }
        }
    }
}
impl std::error::Error for DispatchError {}

impl From<DispatchError> for IoError {
    fn from(e: DispatchError) -> IoError {
        IoError::new(ErrorKind::InvalidData, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fastcgi::binary_record;
    use crate::params::encode_param;
    use tokio::io::duplex;
    use tokio::runtime::Builder;
    use tokio::sync::mpsc::unbounded_channel;

    struct Harness {
        con: InnerConnection,
        rx: UnboundedReceiver<Outbound>,
        ready: UnboundedReceiver<Request>,
    }
    fn harness() -> Harness {
        let (tx, rx) = unbounded_channel();
        let (rtx, ready) = unbounded_channel();
        Harness {
            con: InnerConnection::new(next_connection_id(), tx, rtx),
            rx,
            ready,
        }
    }
    fn begin(rid: u16, role: u16, flags: u8) -> Record {
        BeginRequestBody { role, flags }.to_record(rid)
    }
    fn params(rid: u16, data: &[u8]) -> Record {
        Record::new(RecordType::Params, rid, Bytes::copy_from_slice(data))
    }
    fn stdin(rid: u16, data: &[u8]) -> Record {
        Record::new(RecordType::StdIn, rid, Bytes::copy_from_slice(data))
    }
    /// everything the connection wants to send
    fn sent(con: &mut InnerConnection) -> Vec<Record> {
        let mut out = Vec::new();
        while let Some(r) = Record::read(&mut con.wbuf).unwrap() {
            out.push(r);
        }
        assert!(con.wbuf.is_empty());
        out
    }
    fn end_status(r: &Record) -> (u32, u8) {
        assert_eq!(r.get_type(), RecordType::EndRequest);
        let b = EndRequestBody::parse(r.get_content()).unwrap();
        (b.app_status, b.protocol_status)
    }

    #[test]
    fn responder_creates_request() {
        let mut h = harness();
        h.con.dispatch(begin(1, BeginRequestBody::RESPONDER, 0)).unwrap();
        assert_eq!(h.con.requests.len(), 1);
        assert!(sent(&mut h.con).is_empty());
        assert!(h.ready.try_recv().is_err());
        h.con.dispatch(params(1, &encode_param("k", "v"))).unwrap();
        h.con.dispatch(params(1, b"")).unwrap();
        let req = h.ready.try_recv().unwrap();
        assert_eq!(req.get_id(), 1);
        assert_eq!(req.connection_id(), h.con.id);
        assert!(!req.keep_connection());
        assert_eq!(req.get_param("k"), Some("v"));
        assert!(!h.con.is_closing());
    }
    #[test]
    fn duplicate_id_is_overloaded() {
        let mut h = harness();
        h.con.dispatch(begin(1, BeginRequestBody::RESPONDER, 1)).unwrap();
        h.con.dispatch(begin(1, BeginRequestBody::RESPONDER, 1)).unwrap();
        let out = sent(&mut h.con);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_request_id(), 1);
        assert_eq!(end_status(&out[0]), (0, EndRequestBody::OVERLOADED));
        assert!(h.con.is_closing());
    }
    #[test]
    fn authorizer_is_unknown_role() {
        let mut h = harness();
        let keep = BeginRequestBody::KEEP_CONN;
        h.con.dispatch(begin(5, BeginRequestBody::AUTHORIZER, keep)).unwrap();
        let out = sent(&mut h.con);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_request_id(), 5);
        assert_eq!(end_status(&out[0]), (0, EndRequestBody::UNKNOWN_ROLE));
        assert!(h.con.requests.is_empty());
        assert!(!h.con.is_closing());
        // FILTER without keep_conn ends the connection like any finished request
        h.con.dispatch(begin(6, BeginRequestBody::FILTER, 0)).unwrap();
        assert_eq!(end_status(&sent(&mut h.con)[0]), (0, EndRequestBody::UNKNOWN_ROLE));
        assert!(h.con.is_closing());
    }
    #[test]
    fn invalid_role_closes() {
        let mut h = harness();
        h.con.dispatch(begin(2, 9, BeginRequestBody::KEEP_CONN)).unwrap();
        let out = sent(&mut h.con);
        assert_eq!(end_status(&out[0]), (0, EndRequestBody::UNKNOWN_ROLE));
        assert!(h.con.is_closing());
    }
    #[test]
    fn short_begin_request() {
        let mut h = harness();
        let r = Record::new(RecordType::BeginRequest, 1, Bytes::from_static(b"\0\x01"));
        assert_eq!(h.con.dispatch(r), Err(DispatchError::BadBeginRequest(1)));
    }
    #[test]
    fn orphan_record() {
        let mut h = harness();
        assert_eq!(
            h.con.dispatch(stdin(3, b"x")),
            Err(DispatchError::OrphanRecord {
                request_id: 3,
                rtype: RecordType::StdIn
            })
        );
        let mut rbuf = binary_record(1, RecordType::PARAMS, 3, b"");
        let e = h.con.decode(&mut rbuf).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidData);
    }
    #[test]
    fn management_and_other_records_are_ignored() {
        let mut h = harness();
        h.con.dispatch(Record::new(RecordType::GetValues, 0, Bytes::new())).unwrap();
        h.con.dispatch(begin(1, BeginRequestBody::RESPONDER, 0)).unwrap();
        h.con.dispatch(Record::data(1, Bytes::from_static(b"x"))).unwrap();
        h.con.dispatch(Record::new(RecordType::UnknownType, 1, Bytes::new())).unwrap();
        assert!(sent(&mut h.con).is_empty());
        assert!(!h.con.is_closing());
        assert_eq!(h.con.requests.len(), 1);
    }
    #[test]
    fn params_split_over_records() {
        let mut whole = encode_param("SCRIPT_NAME", "/index.php");
        whole.unsplit(encode_param("X", &"y".repeat(300)));
        let mut h = harness();
        h.con.dispatch(begin(1, BeginRequestBody::RESPONDER, 1)).unwrap();
        h.con.dispatch(params(1, &whole[..5])).unwrap();
        h.con.dispatch(params(1, &whole[5..20])).unwrap();
        h.con.dispatch(params(1, &whole[20..])).unwrap();
        h.con.dispatch(params(1, b"")).unwrap();
        let req = h.ready.try_recv().unwrap();
        assert_eq!(req.params().len(), 2);
        assert_eq!(req.get_param("SCRIPT_NAME"), Some("/index.php"));
        assert_eq!(req.get_param("X").map(str::len), Some(300));
        // a late PARAMS does not announce the request again
        h.con.dispatch(params(1, b"")).unwrap();
        assert!(h.ready.try_recv().is_err());
    }
    #[test]
    fn stdin_reaches_the_request() {
        let mut h = harness();
        h.con.dispatch(begin(1, BeginRequestBody::RESPONDER, 1)).unwrap();
        h.con.dispatch(params(1, b"")).unwrap();
        let mut req = h.ready.try_recv().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            req.input_stream().try_read(&mut buf).unwrap_err().kind(),
            ErrorKind::WouldBlock
        );
        h.con.dispatch(stdin(1, b"abc")).unwrap();
        h.con.dispatch(stdin(1, b"")).unwrap();
        assert_eq!(req.input_stream().try_read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(req.input_stream().try_read(&mut buf).unwrap(), 0);
    }
    #[test]
    fn output_is_chunked() {
        let mut h = harness();
        h.con.dispatch(begin(1, BeginRequestBody::RESPONDER, 1)).unwrap();
        h.con.dispatch(params(1, b"")).unwrap();
        let mut req = h.ready.try_recv().unwrap();
        req.output_stream().write_bytes(Bytes::from(vec![b'a'; MAX_LENGTH + 10])).unwrap();
        req.error_stream().write_bytes(Bytes::from_static(b"warn")).unwrap();
        while let Ok(msg) = h.rx.try_recv() {
            h.con.handle(msg);
        }
        let out = sent(&mut h.con);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].get_type(), RecordType::StdOut);
        assert_eq!(out[0].get_content().len(), MAX_LENGTH);
        assert_eq!(out[1].get_type(), RecordType::StdOut);
        assert_eq!(out[1].get_content().len(), 10);
        assert_eq!(out[2], Record::stderr(1, Bytes::from_static(b"warn")));
    }
    #[test]
    fn finalize_ends_streams_and_closes() {
        let mut h = harness();
        h.con.dispatch(begin(7, BeginRequestBody::RESPONDER, 0)).unwrap();
        h.con.dispatch(params(7, b"")).unwrap();
        let req = h.ready.try_recv().unwrap();
        req.finalize(42).unwrap();
        h.con.handle(h.rx.try_recv().unwrap());
        let out = sent(&mut h.con);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], Record::stdout(7, Bytes::new()));
        assert_eq!(out[1], Record::stderr(7, Bytes::new()));
        assert_eq!(end_status(&out[2]), (42, EndRequestBody::REQUEST_COMPLETE));
        assert!(h.con.requests.is_empty());
        assert!(h.con.is_closing());
    }
    #[test]
    fn finalize_keeps_connection() {
        let mut h = harness();
        h.con.dispatch(begin(7, BeginRequestBody::RESPONDER, 1)).unwrap();
        h.con.dispatch(params(7, b"")).unwrap();
        h.ready.try_recv().unwrap().finalize(0).unwrap();
        h.con.handle(h.rx.try_recv().unwrap());
        assert_eq!(sent(&mut h.con).len(), 3);
        assert!(!h.con.is_closing());
        // the id can be used again
        h.con.dispatch(begin(7, BeginRequestBody::RESPONDER, 1)).unwrap();
        assert!(sent(&mut h.con).is_empty());
    }
    #[test]
    fn dropped_request_releases_the_id() {
        let mut h = harness();
        h.con.dispatch(begin(1, BeginRequestBody::RESPONDER, 1)).unwrap();
        h.con.dispatch(params(1, b"")).unwrap();
        drop(h.ready.try_recv().unwrap());
        h.con.handle(h.rx.try_recv().unwrap());
        assert!(h.con.requests.is_empty());
        let out = sent(&mut h.con);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], Record::stdout(1, Bytes::new()));
        assert_eq!(out[1], Record::stderr(1, Bytes::new()));
        assert_eq!(end_status(&out[2]), (ABANDONED_STATUS, EndRequestBody::REQUEST_COMPLETE));
        assert!(!h.con.is_closing());

        // the web server may use the id again
        h.con.dispatch(begin(1, BeginRequestBody::RESPONDER, 1)).unwrap();
        assert!(sent(&mut h.con).is_empty());
        assert!(!h.con.is_closing());
        assert_eq!(h.con.requests.len(), 1);
        h.con.dispatch(params(1, b"")).unwrap();
        assert_eq!(h.ready.try_recv().unwrap().get_id(), 1);
    }
    #[test]
    fn unclaimed_request_is_ended() {
        let mut h = harness();
        drop(h.ready);
        h.con.dispatch(begin(4, BeginRequestBody::RESPONDER, 1)).unwrap();
        h.con.dispatch(params(4, b"")).unwrap();
        assert!(h.con.requests.is_empty());
        let out = sent(&mut h.con);
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].get_request_id(), 4);
        assert_eq!(end_status(&out[2]), (ABANDONED_STATUS, EndRequestBody::REQUEST_COMPLETE));
        // ended right away, nothing left for the task to do
        assert!(h.rx.try_recv().is_err());
    }
    #[test]
    fn teardown_closes_input() {
        let mut h = harness();
        h.con.dispatch(begin(1, BeginRequestBody::RESPONDER, 1)).unwrap();
        h.con.dispatch(params(1, b"")).unwrap();
        let mut req = h.ready.try_recv().unwrap();
        h.con.teardown();
        let mut buf = [0u8; 8];
        assert_eq!(
            req.input_stream().try_read(&mut buf).unwrap_err().kind(),
            ErrorKind::NotConnected
        );
    }
    #[test]
    fn ids_are_unique() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert!(a >= 1);
        assert!(b > a);
    }

    #[test]
    fn serve_a_request() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (mut web, app) = duplex(4096);
            let (tx, rx) = unbounded_channel();
            let (rtx, mut ready) = unbounded_channel();
            let con = InnerConnection::new(next_connection_id(), tx, rtx);
            let task = tokio::spawn(con.run(app, rx, 64));

            let mut out = BytesMut::new();
            begin(1, BeginRequestBody::RESPONDER, 0).append(&mut out).unwrap();
            let mut p = encode_param("k1", "v1");
            p.unsplit(encode_param("k2", "v2"));
            params(1, &p).append(&mut out).unwrap();
            params(1, b"").append(&mut out).unwrap();
            stdin(1, b"").append(&mut out).unwrap();
            web.write_all(&out).await.unwrap();

            let mut req = ready.recv().await.unwrap();
            assert_eq!(req.get_param("k1"), Some("v1"));
            assert_eq!(req.get_param("k2"), Some("v2"));
            let mut body = Vec::new();
            req.input_stream().read_to_end(&mut body).await.unwrap();
            assert!(body.is_empty());
            assert!(req.input_stream().at_end());
            req.finalize(0).unwrap();

            let mut resp = Vec::new();
            web.read_to_end(&mut resp).await.unwrap();
            let mut resp = BytesMut::from(&resp[..]);
            assert_eq!(Record::read(&mut resp).unwrap(), Some(Record::stdout(1, Bytes::new())));
            assert_eq!(Record::read(&mut resp).unwrap(), Some(Record::stderr(1, Bytes::new())));
            let end = Record::read(&mut resp).unwrap().unwrap();
            assert_eq!(end_status(&end), (0, EndRequestBody::REQUEST_COMPLETE));
            assert!(resp.is_empty());
            task.await.unwrap().unwrap();
        });
    }
    #[test]
    fn framing_error_drops_connection() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (mut web, app) = duplex(4096);
            let (tx, rx) = unbounded_channel();
            let (rtx, _ready) = unbounded_channel();
            let con = InnerConnection::new(next_connection_id(), tx, rtx);
            let task = tokio::spawn(con.run(app, rx, 64));
            web.write_all(&binary_record(2, RecordType::BEGIN_REQUEST, 1, &[0; 8])).await.unwrap();
            let e = task.await.unwrap().unwrap_err();
            assert_eq!(e.kind(), ErrorKind::InvalidData);
            let mut rest = Vec::new();
            web.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        });
    }
}
