/*! Buffered byte channel behind the streams of a request.

A [`DuplexStream`] is opened either for reading (FCGI_STDIN, filled by the
connection and drained by the application) or for writing (FCGI_STDOUT and
FCGI_STDERR, filled by the application and drained by the connection in
record sized chunks).
*/
use bytes::{Buf, Bytes};
use std::io::{Error as IoError, ErrorKind};
use std::task::Waker;

use crate::bufvec::BufList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

#[derive(Debug)]
pub struct DuplexStream {
    buf: BufList<Bytes>,
    eof: bool,
    mode: Option<Mode>,
    waker: Option<Waker>,
}

impl DuplexStream {
    /// A stream that is not open for anything
    pub fn closed() -> DuplexStream {
        DuplexStream {
            buf: BufList::new(),
            eof: false,
            mode: None,
            waker: None,
        }
    }
    pub fn open(mode: Mode) -> DuplexStream {
        let mut s = DuplexStream::closed();
        s.mode = Some(mode);
        s
    }
    pub fn close(&mut self) {
        self.mode = None;
        self.wake();
    }
    pub fn is_readable(&self) -> bool {
        self.mode == Some(Mode::Read)
    }
    pub fn is_writable(&self) -> bool {
        self.mode == Some(Mode::Write)
    }
    pub fn bytes_available(&self) -> usize {
        self.buf.remaining()
    }
    /// all data was read and no more will come
    pub fn at_end(&self) -> bool {
        self.is_readable() && self.eof && self.buf.is_empty()
    }

    /// Register the task to wake on the next append or EOF
    pub fn set_waker(&mut self, waker: &Waker) {
        match &self.waker {
            Some(w) if w.will_wake(waker) => {}
            _ => self.waker = Some(waker.clone()),
        }
    }
    fn wake(&mut self) {
        if let Some(w) = self.waker.take() {
            w.wake();
        }
    }

    /// Protocol side of a read stream: new input data.
    /// `false` if the stream is not readable or already at EOF
    pub fn append(&mut self, data: Bytes) -> bool {
        if !self.is_readable() || self.eof {
            return false;
        }
        self.buf.push(data);
        self.wake();
        true
    }
    /// Protocol side of a read stream: no more input.
    /// `false` if the stream is not readable or EOF was already set
    pub fn set_eof(&mut self) -> bool {
        if !self.is_readable() || self.eof {
            return false;
        }
        self.eof = true;
        self.wake();
        true
    }
    /// Application side of a read stream.
    ///
    /// - `Ok(n)` with `n > 0`: data was copied into `dst`
    /// - `Ok(0)`: end of stream (or `dst` is empty)
    /// - `Err(WouldBlock)`: no data yet, but more will come
    /// - `Err(NotConnected)`: the connection is gone
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize, IoError> {
        match self.mode {
            Some(Mode::Read) => {}
            Some(Mode::Write) => {
                return Err(IoError::new(ErrorKind::PermissionDenied, "stream is not readable"))
            }
            None => return Err(IoError::new(ErrorKind::NotConnected, "stream is closed")),
        }
        if self.buf.is_empty() {
            return if self.eof || dst.is_empty() {
                Ok(0)
            } else {
                Err(ErrorKind::WouldBlock.into())
            };
        }
        let n = dst.len().min(self.buf.remaining());
        self.buf.copy_to_slice(&mut dst[..n]);
        Ok(n)
    }

    /// Application side of a write stream.
    /// Returns the number of bytes now buffered, the caller drains them
    pub fn write(&mut self, data: Bytes) -> Result<usize, IoError> {
        if !self.is_writable() {
            return Err(IoError::new(ErrorKind::PermissionDenied, "stream is not writable"));
        }
        self.buf.push(data);
        Ok(self.buf.remaining())
    }
    /// Connection side of a write stream: take at most `max` bytes.
    /// `None` once the buffer is empty
    pub fn drain(&mut self, max: usize) -> Option<Bytes> {
        if self.buf.is_empty() {
            return None;
        }
        Some(self.buf.take_front(max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountWakes(AtomicUsize);
    impl Wake for CountWakes {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn reader() -> DuplexStream {
        DuplexStream::open(Mode::Read)
    }

    #[test]
    fn append() {
        let mut s = reader();
        assert!(s.append(Bytes::from_static(b"123")));
        assert_eq!(s.bytes_available(), 3);
        let mut data = [0u8; 16];
        assert_eq!(s.read(&mut data).unwrap(), 3);
        assert_eq!(&data[..3], b"123");
    }
    #[test]
    fn append_not_open() {
        let mut s = reader();
        s.close();
        assert!(!s.append(Bytes::from_static(b"123")));
        assert_eq!(s.bytes_available(), 0);
    }
    #[test]
    fn append_at_eof() {
        let mut s = reader();
        assert!(s.set_eof());
        assert!(!s.append(Bytes::from_static(b"123")));
        assert_eq!(s.bytes_available(), 0);
    }
    #[test]
    fn set_eof_once() {
        let mut s = reader();
        assert!(s.set_eof());
        assert!(s.at_end());
        assert!(!s.set_eof());
        let mut w = DuplexStream::open(Mode::Write);
        assert!(!w.set_eof());
    }
    #[test]
    fn at_end() {
        let mut s = reader();
        assert!(!s.at_end());
        assert!(s.append(Bytes::from_static(b"123")));
        assert!(s.set_eof());
        assert!(!s.at_end());
        let mut data = [0u8; 2];
        assert_eq!(s.read(&mut data).unwrap(), 2);
        assert_eq!(s.read(&mut data).unwrap(), 1);
        assert!(s.at_end());
        s.close();
        assert!(!s.at_end());
    }
    #[test]
    fn read_no_data() {
        let mut s = reader();
        let mut data = [0u8; 16];
        assert_eq!(s.read(&mut data).unwrap_err().kind(), ErrorKind::WouldBlock);
    }
    #[test]
    fn read_eof() {
        let mut s = reader();
        s.set_eof();
        let mut data = [0u8; 16];
        assert_eq!(s.read(&mut data).unwrap(), 0);
    }
    #[test]
    fn read_not_open() {
        let mut s = DuplexStream::open(Mode::Write);
        let mut data = [0u8; 16];
        assert_eq!(s.read(&mut data).unwrap_err().kind(), ErrorKind::PermissionDenied);
    }
    #[test]
    fn read_closed() {
        let mut s = reader();
        s.append(Bytes::from_static(b"123"));
        s.close();
        let mut data = [0u8; 16];
        assert_eq!(s.read(&mut data).unwrap_err().kind(), ErrorKind::NotConnected);
    }
    #[test]
    fn write_and_drain() {
        let mut s = DuplexStream::open(Mode::Write);
        assert_eq!(s.write(Bytes::from_static(b"123")).unwrap(), 3);
        assert_eq!(s.write(Bytes::from_static(b"45")).unwrap(), 5);
        assert_eq!(s.drain(4).unwrap(), &b"1234"[..]);
        assert_eq!(s.drain(4).unwrap(), &b"5"[..]);
        assert!(s.drain(4).is_none());
    }
    #[test]
    fn write_not_open() {
        let mut s = reader();
        assert!(s.write(Bytes::from_static(b"123")).is_err());
        let mut s = DuplexStream::closed();
        assert!(s.write(Bytes::from_static(b"123")).is_err());
    }
    #[test]
    fn events_wake_the_reader() {
        let counter = Arc::new(CountWakes(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());
        let mut s = reader();

        s.set_waker(&waker);
        s.append(Bytes::from_static(b"1"));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        // waker is consumed by the event
        s.append(Bytes::from_static(b"2"));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        s.set_waker(&waker);
        assert!(s.set_eof());
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        s.set_waker(&waker);
        assert!(!s.set_eof());
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}
