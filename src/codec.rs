/*! Fast CGI server/application side framing
 *
 * [`RecordCodec`] turns the receive buffer of a connection into [`Record`]s
 * and serializes outgoing [`Record`]s into the send buffer.
*/
use bytes::BytesMut;
use std::io::Error as IoError;
use tokio_util::codec::{Decoder, Encoder};

use crate::fastcgi::Record;

/// A `Codec` implementation that parses FCGI records for FCGI servers like backend services.
/// The Decoder returns `fastcgi::Record` objects containing header/body request data from an
/// FCGI client such as a frontend web server. The Encoder writes whole records, padding included,
/// back to the FCGI client.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecordCodec {}

impl RecordCodec {
    /// Returns a `RecordCodec` for accepting and parsing FCGI-format requests by FCGI servers
    /// like backend services.
    pub fn new() -> RecordCodec {
        RecordCodec {}
    }
}

/// Decodes FCGI-format requests. A bad version or type byte is an
/// `InvalidData` error after which the stream must be dropped.
impl Decoder for RecordCodec {
    type Item = Record;
    type Error = IoError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Record>, IoError> {
        Ok(Record::read(buf)?)
    }
}

/// Forwards a response record back to the client/webserver.
impl Encoder<Record> for RecordCodec {
    type Error = IoError;

    fn encode(&mut self, data: Record, buf: &mut BytesMut) -> Result<(), IoError> {
        data.append(buf)?;
        Ok(())
    }
}
