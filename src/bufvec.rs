use bytes::{Buf, Bytes};
use std::collections::VecDeque;

/// Chunks of received or written data, read front to back without copying
/// them into one buffer.
#[derive(Debug)]
pub(crate) struct BufList<T> {
    bufs: VecDeque<T>,
}

impl<T: Buf> BufList<T> {
    pub(crate) fn new() -> BufList<T> {
        BufList {
            bufs: VecDeque::new(),
        }
    }

    /// empty chunks are dropped
    #[inline]
    pub(crate) fn push(&mut self, buf: T) {
        if buf.has_remaining() {
            self.bufs.push_back(buf);
        }
    }
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }
}

impl BufList<Bytes> {
    /// Take up to `max` bytes from the front.
    /// A single chunk is split instead of copied.
    pub(crate) fn take_front(&mut self, max: usize) -> Bytes {
        match self.bufs.front_mut() {
            None => return Bytes::new(),
            Some(front) if front.len() > max => return front.split_to(max),
            Some(_) => {}
        }
        if self.bufs.len() == 1 || self.bufs.front().map_or(0, Bytes::len) == max {
            return self.bufs.pop_front().unwrap_or_default();
        }
        let n = max.min(self.remaining());
        self.copy_to_bytes(n)
    }
}

impl<T: Buf> Buf for BufList<T> {
    #[inline]
    fn remaining(&self) -> usize {
        self.bufs.iter().map(|buf| buf.remaining()).sum()
    }

    #[inline]
    fn chunk(&self) -> &[u8] {
        self.bufs.front().map(Buf::chunk).unwrap_or_default()
    }

    #[inline]
    fn advance(&mut self, mut cnt: usize) {
        while cnt > 0 {
            if let Some(front) = &mut self.bufs.front_mut() {
                let rem = front.remaining();
                if rem > cnt {
                    front.advance(cnt);
                    return;
                } else {
                    front.advance(rem);
                    cnt -= rem;
                }
            } else {
                //no data
                return;
            }
            self.bufs.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_front_across_chunks() {
        let mut l = BufList::new();
        l.push(Bytes::from_static(b"abc"));
        l.push(Bytes::new());
        l.push(Bytes::from_static(b"defg"));
        assert_eq!(l.remaining(), 7);
        assert_eq!(l.take_front(2), &b"ab"[..]);
        assert_eq!(l.take_front(3), &b"cde"[..]);
        assert_eq!(l.take_front(10), &b"fg"[..]);
        assert!(l.is_empty());
        assert_eq!(l.take_front(10), Bytes::new());
    }
    #[test]
    fn copy_out() {
        let mut l = BufList::new();
        l.push(Bytes::from_static(b"12"));
        l.push(Bytes::from_static(b"345"));
        let mut dst = [0u8; 4];
        l.copy_to_slice(&mut dst);
        assert_eq!(&dst, b"1234");
        assert_eq!(l.remaining(), 1);
        assert_eq!(l.chunk(), b"5");
    }
}
