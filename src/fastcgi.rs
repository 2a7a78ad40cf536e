/*! Contains constants and models for fcgi data records.
```
    use bytes::{Bytes, BytesMut};
    use async_fcgi_server::fastcgi::*;
    let mut b = BytesMut::new();
    let page = Bytes::from_static(b"Content-Type: text/plain\r\n\r\nhi");
    Record::stdout(1, page).append(&mut b).expect("fits");
    Record::stdout(1, Bytes::new()).append(&mut b).expect("fits");
    Record::end_request(1, 0, EndRequestBody::REQUEST_COMPLETE).append(&mut b).expect("fits");
    let first = Record::read(&mut b).expect("valid").expect("complete");
    assert_eq!(first.get_type(), RecordType::StdOut);
```
*/
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, trace};
use std::fmt;
use std::io::{Error as IoError, ErrorKind};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// FCGI record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) version: u8,
    pub(crate) rtype: u8,
    pub(crate) request_id: u16, // Management records have a requestId value of zero
    pub(crate) content_length: u16,
    pub(crate) padding_length: u8, // align by 8
//    reserved: [u8; 1],
}

/// The 11 record kinds of FastCGI 1.0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    StdIn,
    StdOut,
    StdErr,
    Data,
    GetValues,
    GetValuesResult,
    /// Unrecognized management record
    UnknownType,
}

/// Body of a FCGI_BEGIN_REQUEST record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequestBody {
    pub role: u16,
    pub flags: u8,
    //    reserved: [u8; 5],
}

/// Body of a FCGI_END_REQUEST record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequestBody {
    pub app_status: u32,
    pub protocol_status: u8,
    //    pub reserved: [u8; 3],
}

/// FCGI record: one frame of the wire protocol, without its padding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    rtype: RecordType,
    request_id: u16,
    content: Bytes,
}

/// The byte stream can no longer be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// version byte was not 1
    Version(u8),
    /// type byte was outside 1..=11
    Type(u8),
}

/// Listening socket file number
pub const LISTENSOCK_FILENO: i32 = 0;

/// Maximum content length per record
pub const MAX_LENGTH: usize = 0xffff;

impl Header {
    /// Number of bytes in a Header.
    ///
    /// Future versions of the protocol will not reduce this number.
    pub(crate) const HEADER_LEN: usize = 8;

    /// version component of Header
    pub(crate) const VERSION_1: u8 = 1;
}

impl Record {
    /// Default request id component of Header
    pub const MGMT_REQUEST_ID: u16 = 0;
}

impl RecordType {
    /// type component of Header
    /// # Request
    /// The Web server sends a FCGI_BEGIN_REQUEST record to start a request
    pub const BEGIN_REQUEST: u8 = 1;

    /// type component of Header
    /// # Request
    /// A Web server aborts a FastCGI request when an HTTP client closes its transport connection
    /// while the FastCGI request is running on behalf of that client
    pub const ABORT_REQUEST: u8 = 2;

    /// type component of Header
    /// # Response
    /// The application sends a FCGI_END_REQUEST record to terminate a request
    pub const END_REQUEST: u8 = 3;

    /// type component of Header
    /// # Request
    /// Receive name-value pairs from the Web server to the application
    pub const PARAMS: u8 = 4;

    /// type component of Header
    /// # Request
    /// Byte Stream
    pub const STDIN: u8 = 5;

    /// type component of Header
    /// # Response
    /// Byte Stream
    pub const STDOUT: u8 = 6;

    /// type component of Header
    /// # Response
    /// Byte Stream
    pub const STDERR: u8 = 7;

    /// type component of Header
    /// # Request
    /// Byte Stream
    pub const DATA: u8 = 8;

    /// type component of Header
    /// # Request
    /// The Web server can query specific variables within the application
    /// The application receives.
    pub const GET_VALUES: u8 = 9;

    /// type component of Header
    /// # Response
    /// The Web server can query specific variables within the application.
    /// The application responds.
    pub const GET_VALUES_RESULT: u8 = 10;

    /// type component of Header
    ///
    /// Unrecognized management record
    pub const UNKNOWN_TYPE: u8 = 11;

    /// `None` for anything outside 1..=11
    pub fn from_u8(rtype: u8) -> Option<RecordType> {
        Some(match rtype {
            RecordType::BEGIN_REQUEST => RecordType::BeginRequest,
            RecordType::ABORT_REQUEST => RecordType::AbortRequest,
            RecordType::END_REQUEST => RecordType::EndRequest,
            RecordType::PARAMS => RecordType::Params,
            RecordType::STDIN => RecordType::StdIn,
            RecordType::STDOUT => RecordType::StdOut,
            RecordType::STDERR => RecordType::StdErr,
            RecordType::DATA => RecordType::Data,
            RecordType::GET_VALUES => RecordType::GetValues,
            RecordType::GET_VALUES_RESULT => RecordType::GetValuesResult,
            RecordType::UNKNOWN_TYPE => RecordType::UnknownType,
            _ => return None,
        })
    }
    pub fn as_u8(self) -> u8 {
        match self {
            RecordType::BeginRequest => RecordType::BEGIN_REQUEST,
            RecordType::AbortRequest => RecordType::ABORT_REQUEST,
            RecordType::EndRequest => RecordType::END_REQUEST,
            RecordType::Params => RecordType::PARAMS,
            RecordType::StdIn => RecordType::STDIN,
            RecordType::StdOut => RecordType::STDOUT,
            RecordType::StdErr => RecordType::STDERR,
            RecordType::Data => RecordType::DATA,
            RecordType::GetValues => RecordType::GET_VALUES,
            RecordType::GetValuesResult => RecordType::GET_VALUES_RESULT,
            RecordType::UnknownType => RecordType::UNKNOWN_TYPE,
        }
    }
}
impl BeginRequestBody {
    /// Mask for flags component of BeginRequestBody
    pub const KEEP_CONN: u8 = 1;

    /// FastCGI role
    /// emulated CGI/1.1 program
    pub const RESPONDER: u16 = 1;

    /// FastCGI role
    /// authorized/unauthorized decision
    pub const AUTHORIZER: u16 = 2;

    /// FastCGI role
    /// extra stream of data from a file
    pub const FILTER: u16 = 3;

    /// Number of content bytes of a FCGI_BEGIN_REQUEST record
    pub const LEN: usize = 8;
}
impl EndRequestBody {
    /// protocol_status component of EndRequestBody
    ///
    /// Normal end of request
    pub const REQUEST_COMPLETE: u8 = 0;

    /// protocol_status component of EndRequestBody
    ///
    /// Application is designed to process one request at a time per connection
    pub const CANT_MPX_CONN: u8 = 1;

    /// protocol_status component of EndRequestBody
    ///
    /// The application runs out of some resource, e.g. database connections
    pub const OVERLOADED: u8 = 2;

    /// protocol_status component of EndRequestBody
    ///
    /// Web server has specified a role that is unknown to the application
    pub const UNKNOWN_ROLE: u8 = 3;
}

// ----------------- implementation -----------------

/// `(8 - len % 8) % 8`
#[inline]
pub fn padding_for(content_length: usize) -> u8 {
    ((8 - content_length % 8) % 8) as u8
}

impl Header {
    pub(crate) fn new(rtype: u8, request_id: u16, len: u16) -> Header {
        Header {
            version: Header::VERSION_1,
            rtype,
            request_id,
            content_length: len,
            padding_length: padding_for(len as usize),
        }
    }
    pub(crate) fn write_into(self, data: &mut BytesMut) {
        data.put_u8(self.version);
        data.put_u8(self.rtype);
        data.put_u16(self.request_id);
        data.put_u16(self.content_length);
        data.put_u8(self.padding_length);
        data.put_u8(0); // reserved
    }
    /// `data` must hold at least `HEADER_LEN` bytes
    fn parse(mut data: &[u8]) -> Header {
        // data[7] is reserved
        Header {
            version: data.get_u8(),
            rtype: data.get_u8(),
            request_id: data.get_u16(),
            content_length: data.get_u16(),
            padding_length: data.get_u8(),
        }
    }
    /// content and padding
    fn body_len(&self) -> usize {
        self.content_length as usize + self.padding_length as usize
    }
}

impl BeginRequestBody {
    /// `None` if the content is shorter than the 8 byte body
    pub fn parse(mut data: &[u8]) -> Option<BeginRequestBody> {
        if data.len() < BeginRequestBody::LEN {
            return None;
        }
        let b = BeginRequestBody {
            role: data.get_u16(),
            flags: data.get_u8(),
        };
        Some(b)
    }
    pub fn keep_conn(&self) -> bool {
        self.flags & BeginRequestBody::KEEP_CONN != 0
    }
    /// one of RESPONDER, AUTHORIZER, FILTER
    pub fn is_defined_role(&self) -> bool {
        matches!(
            self.role,
            BeginRequestBody::RESPONDER | BeginRequestBody::AUTHORIZER | BeginRequestBody::FILTER
        )
    }
    /// create a record of type BeginRequest
    pub fn to_record(self, request_id: u16) -> Record {
        let mut data = BytesMut::with_capacity(BeginRequestBody::LEN);
        data.put_u16(self.role);
        data.put_u8(self.flags);
        data.put_slice(&[0; 5]); // reserved
        Record::new(RecordType::BeginRequest, request_id, data.freeze())
    }
}

impl EndRequestBody {
    pub fn parse(mut data: &[u8]) -> Option<EndRequestBody> {
        if data.len() < 8 {
            return None;
        }
        Some(EndRequestBody {
            app_status: data.get_u32(),
            protocol_status: data.get_u8(),
        })
    }
}

impl Record {
    pub fn new(rtype: RecordType, request_id: u16, content: Bytes) -> Record {
        Record {
            rtype,
            request_id,
            content,
        }
    }
    /// FCGI_END_REQUEST: `appStatus (u32 BE) | protocolStatus | 3 reserved`
    pub fn end_request(request_id: u16, app_status: u32, protocol_status: u8) -> Record {
        let mut data = BytesMut::with_capacity(8);
        data.put_u32(app_status);
        data.put_u8(protocol_status);
        data.put_slice(&[0; 3]); // reserved
        Record::new(RecordType::EndRequest, request_id, data.freeze())
    }
    /// FCGI_STDOUT, an empty payload ends the stream
    pub fn stdout(request_id: u16, payload: Bytes) -> Record {
        Record::new(RecordType::StdOut, request_id, payload)
    }
    /// FCGI_STDERR, an empty payload ends the stream
    pub fn stderr(request_id: u16, payload: Bytes) -> Record {
        Record::new(RecordType::StdErr, request_id, payload)
    }
    /// FCGI_DATA, an empty payload ends the stream
    pub fn data(request_id: u16, payload: Bytes) -> Record {
        Record::new(RecordType::Data, request_id, payload)
    }

    pub fn get_type(&self) -> RecordType {
        self.rtype
    }
    pub fn get_request_id(&self) -> u16 {
        self.request_id
    }
    pub fn get_content(&self) -> &Bytes {
        &self.content
    }
    pub fn into_content(self) -> Bytes {
        self.content
    }
    /// management records carry request id 0
    pub fn is_management(&self) -> bool {
        self.request_id == Record::MGMT_REQUEST_ID
    }

    /// parse bytes to a single record.
    ///
    /// - `Ok(None)` leaves data untouched if not enough data is available
    /// - `Ok(Some(_))` consumed header, content and padding from `data`
    /// - `Err(_)` on a bad version or type. `data` is left untouched
    pub fn read(data: &mut BytesMut) -> Result<Option<Record>, FramingError> {
        //dont alter data until we have a whole header to read
        if data.len() < Header::HEADER_LEN {
            return Ok(None);
        }
        let header = Header::parse(&data[..Header::HEADER_LEN]);
        if header.version != Header::VERSION_1 {
            return Err(FramingError::Version(header.version));
        }
        let rtype = RecordType::from_u8(header.rtype).ok_or(FramingError::Type(header.rtype))?;
        if data.len() < Header::HEADER_LEN + header.body_len() {
            trace!(
                "record incomplete: {} of {} bytes",
                data.len(),
                Header::HEADER_LEN + header.body_len()
            );
            return Ok(None);
        }
        data.advance(Header::HEADER_LEN);
        let content = data.split_to(header.content_length as usize).freeze();
        // padding is skipped, never copied
        data.advance(header.padding_length as usize);
        debug!(
            "read type {} #{} ({} bytes)",
            header.rtype,
            header.request_id,
            content.len()
        );
        Ok(Some(Record {
            rtype,
            request_id: header.request_id,
            content,
        }))
    }
    /// Total number of bytes this record occupies on the wire
    pub fn wire_len(&self) -> usize {
        Header::HEADER_LEN + self.content.len() + padding_for(self.content.len()) as usize
    }
    fn header(&self) -> Result<Header, IoError> {
        let len = u16::try_from(self.content.len()).map_err(|_| {
            IoError::new(
                ErrorKind::InvalidInput,
                format!("record content of {} bytes exceeds {}", self.content.len(), MAX_LENGTH),
            )
        })?;
        Ok(Header::new(self.rtype.as_u8(), self.request_id, len))
    }
    ///serialize this record and append it to buf.
    /// returns the number of bytes appended
    pub fn append(&self, buf: &mut BytesMut) -> Result<usize, IoError> {
        let header = self.header()?;
        let pad = header.padding_length as usize;
        buf.reserve(self.wire_len());
        header.write_into(buf);
        buf.put_slice(&self.content);
        buf.put_bytes(0, pad);
        trace!("h {} {} +{}", self.request_id, self.content.len(), pad);
        Ok(self.wire_len())
    }
    /// write header, content and zeroed padding to `w`.
    /// returns the number of bytes written
    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<usize, IoError> {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        let n = self.append(&mut buf)?;
        w.write_all(&buf).await?;
        Ok(n)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            RecordType::BeginRequest => "FCGI_BEGIN_REQUEST",
            RecordType::AbortRequest => "FCGI_ABORT_REQUEST",
            RecordType::EndRequest => "FCGI_END_REQUEST",
            RecordType::Params => "FCGI_PARAMS",
            RecordType::StdIn => "FCGI_STDIN",
            RecordType::StdOut => "FCGI_STDOUT",
            RecordType::StdErr => "FCGI_STDERR",
            RecordType::Data => "FCGI_DATA",
            RecordType::GetValues => "FCGI_GET_VALUES",
            RecordType::GetValuesResult => "FCGI_GET_VALUES_RESULT",
            RecordType::UnknownType => "FCGI_UNKNOWN_TYPE",
        };
        f.write_str(name)
    }
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FramingError::Version(v) => write!(f, "unsupported FCGI version {}", v),
            FramingError::Type(t) => write!(f, "invalid FCGI record type {}", t),
        }
    }
}
impl std::error::Error for FramingError {}

impl From<FramingError> for IoError {
    fn from(e: FramingError) -> IoError {
        IoError::new(ErrorKind::InvalidData, e)
    }
}

#[cfg(test)]
pub(crate) fn binary_record(version: u8, rtype: u8, request_id: u16, content: &[u8]) -> BytesMut {
    let mut b = BytesMut::new();
    let mut h = Header::new(rtype, request_id, content.len() as u16);
    h.version = version;
    h.write_into(&mut b);
    b.put_slice(content);
    b.put_bytes(0, h.padding_length as usize);
    b
}

#[test]
fn read_needs_whole_header() {
    let mut b = BytesMut::from(&b"\x01\x06\0\x01\0"[..]);
    assert_eq!(Record::read(&mut b), Ok(None));
    assert_eq!(b.len(), 5);
}
#[test]
fn read_needs_whole_body() {
    let mut b = binary_record(1, RecordType::STDIN, 3, b"12345");
    b.truncate(14); // padding missing
    assert_eq!(Record::read(&mut b), Ok(None));
    assert_eq!(b.len(), 14);
}
#[test]
fn read_invalid_version() {
    let mut b = binary_record(9, RecordType::BEGIN_REQUEST, 0, b"");
    assert_eq!(Record::read(&mut b), Err(FramingError::Version(9)));
}
#[test]
fn read_invalid_type() {
    let mut b = binary_record(1, 12, 0, b"");
    assert_eq!(Record::read(&mut b), Err(FramingError::Type(12)));
    let mut b = binary_record(1, 0, 0, b"");
    assert_eq!(Record::read(&mut b), Err(FramingError::Type(0)));
}
#[test]
fn read_no_content() {
    let mut b = binary_record(1, RecordType::ABORT_REQUEST, 3, b"");
    let r = Record::read(&mut b).unwrap().unwrap();
    assert_eq!(r.get_type(), RecordType::AbortRequest);
    assert_eq!(r.get_request_id(), 3);
    assert!(r.get_content().is_empty());
    assert!(b.is_empty());
}
#[test]
fn read_skips_padding() {
    let mut b = binary_record(1, RecordType::ABORT_REQUEST, 3, b"12345");
    assert_eq!(b.len(), 16);
    b.put_slice(b"next");
    let r = Record::read(&mut b).unwrap().unwrap();
    assert_eq!(r.get_content(), &b"12345"[..]);
    assert_eq!(&b[..], b"next");

    let mut b = binary_record(1, RecordType::ABORT_REQUEST, 3, b"12345678");
    assert_eq!(b.len(), 16);
    let r = Record::read(&mut b).unwrap().unwrap();
    assert_eq!(r.get_content(), &b"12345678"[..]);
    assert!(b.is_empty());
}
#[test]
fn write_padding() {
    for t in RecordType::BEGIN_REQUEST..=RecordType::UNKNOWN_TYPE {
        let rtype = RecordType::from_u8(t).unwrap();
        assert_eq!(rtype.as_u8(), t);
        for len in [0usize, 1, 7, 8, 9, 15, 16, 100, MAX_LENGTH] {
            let r = Record::new(rtype, 7, Bytes::from(vec![b'x'; len]));
            let mut b = BytesMut::new();
            let n = r.append(&mut b).unwrap();
            let pad = (8 - len % 8) % 8;
            assert_eq!(b[1], t);
            assert_eq!(b[6] as usize, pad);
            assert_eq!(n, 8 + len + pad);
            assert_eq!(n, r.wire_len());
            assert_eq!(b.len(), n);
            assert_eq!(n % 8, 0);
            assert_eq!(Record::read(&mut b).unwrap(), Some(r), "{} {}", rtype, len);
        }
    }
}
#[test]
fn write_to_stream() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let mut out: Vec<u8> = Vec::new();
        let r = Record::stderr(3, Bytes::from_static(b"12345678901"));
        assert_eq!(r.write(&mut out).await.unwrap(), 8 + 11 + 5);
        let end = Record::end_request(3, 0, EndRequestBody::CANT_MPX_CONN);
        assert_eq!(end.write(&mut out).await.unwrap(), 16);
        assert_eq!(out.len(), 40);
        assert!(out[19..24].iter().all(|&p| p == 0));

        let mut b = BytesMut::from(&out[..]);
        assert_eq!(Record::read(&mut b).unwrap(), Some(r));
        let got = Record::read(&mut b).unwrap().unwrap();
        let body = EndRequestBody::parse(got.get_content()).unwrap();
        assert_eq!(body.protocol_status, EndRequestBody::CANT_MPX_CONN);
        assert!(b.is_empty());

        let too_long = Record::stdout(3, Bytes::from(vec![0; MAX_LENGTH + 1]));
        let e = too_long.write(&mut out).await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidInput);
        assert_eq!(out.len(), 40);
    });
}
#[test]
fn write_too_long() {
    let r = Record::stdout(1, Bytes::from(vec![0; MAX_LENGTH + 1]));
    let mut b = BytesMut::new();
    assert!(r.append(&mut b).is_err());
    assert!(b.is_empty());
}
#[test]
fn create_end_request() {
    let mut b = BytesMut::new();
    assert_eq!(
        Record::end_request(99, 1, EndRequestBody::OVERLOADED).append(&mut b).unwrap(),
        16
    );
    assert_eq!(&b[..], &b"\x01\x03\0\x63\0\x08\0\0\0\0\0\x01\x02\0\0\0"[..]);
    let r = Record::read(&mut b).unwrap().unwrap();
    let body = EndRequestBody::parse(r.get_content()).unwrap();
    assert_eq!(body.app_status, 1);
    assert_eq!(body.protocol_status, EndRequestBody::OVERLOADED);
}
#[test]
fn create_streams() {
    let mut b = BytesMut::new();
    assert_eq!(Record::stdout(99, Bytes::from_static(b"123")).append(&mut b).unwrap(), 16);
    assert_eq!(b, binary_record(1, 6, 99, b"123"));
    b.clear();
    assert_eq!(Record::stderr(99, Bytes::new()).append(&mut b).unwrap(), 8);
    assert_eq!(b, binary_record(1, 7, 99, b""));
    b.clear();
    assert_eq!(Record::data(99, Bytes::from_static(b"123")).append(&mut b).unwrap(), 16);
    assert_eq!(b, binary_record(1, 8, 99, b"123"));
}
#[test]
fn begin_request_body() {
    let r = BeginRequestBody {
        role: BeginRequestBody::RESPONDER,
        flags: BeginRequestBody::KEEP_CONN,
    }
    .to_record(1);
    let mut b = BytesMut::new();
    r.append(&mut b).unwrap();
    assert_eq!(&b[..], &b"\x01\x01\0\x01\0\x08\0\0\0\x01\x01\0\0\0\0\0"[..]);
    let body = BeginRequestBody::parse(r.get_content()).unwrap();
    assert!(body.keep_conn());
    assert!(body.is_defined_role());
    assert!(BeginRequestBody::parse(b"\0\x01").is_none());
    assert!(!BeginRequestBody { role: 4, flags: 0 }.is_defined_role());
}
