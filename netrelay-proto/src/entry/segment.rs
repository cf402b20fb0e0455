use std::time::Instant;

use bytes::{Buf, BytesMut};

use crate::{seq, TcpFlags};

#[derive(Debug, Clone)]
enum Payload<'a> {
    Borrowed(&'a [u8]),
    Owned(BytesMut),
}

impl Payload<'_> {
    fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Borrowed(data) => data,
            Payload::Owned(data) => data,
        }
    }
}

/// A contiguous run of sequence space with its TCP flags
///
/// Segments received from the host borrow the captured frame; segments queued for
/// (re)transmission own their payload. A segment that has never been transmitted has no
/// `last_transmit` time.
#[derive(Debug, Clone)]
pub struct Segment<'a> {
    seq: u32,
    flags: TcpFlags,
    payload: Payload<'a>,
    last_transmit: Option<Instant>,
}

impl<'a> Segment<'a> {
    /// A segment viewing `data` without copying it
    pub fn borrowed(seq: u32, flags: TcpFlags, data: &'a [u8]) -> Self {
        Self {
            seq,
            flags,
            payload: Payload::Borrowed(data),
            last_transmit: None,
        }
    }

    /// First sequence number covered
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Payload length in octets
    pub fn len(&self) -> u32 {
        self.data().len() as u32
    }

    /// Whether the segment carries no payload
    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// Sequence number right after the payload
    pub fn following_seq(&self) -> u32 {
        self.seq.wrapping_add(self.len())
    }

    /// Flags carried by the segment
    pub fn flags(&self) -> TcpFlags {
        self.flags
    }

    pub(crate) fn add_flags(&mut self, flags: TcpFlags) {
        self.flags |= flags;
    }

    pub(crate) fn set_flags(&mut self, flags: TcpFlags) {
        self.flags = flags;
    }

    /// Payload bytes
    pub fn data(&self) -> &[u8] {
        self.payload.as_slice()
    }

    /// When the segment was last handed to the host, if ever
    pub fn last_transmit(&self) -> Option<Instant> {
        self.last_transmit
    }

    pub(crate) fn set_last_transmit(&mut self, now: Instant) {
        self.last_transmit = Some(now);
    }

    /// Copy a borrowed payload so the segment can outlive the frame it came from
    pub fn into_owned(self) -> Segment<'static> {
        let payload = match self.payload {
            Payload::Borrowed(data) => BytesMut::from(data),
            Payload::Owned(data) => data,
        };
        Segment {
            seq: self.seq,
            flags: self.flags,
            payload: Payload::Owned(payload),
            last_transmit: self.last_transmit,
        }
    }

    /// Drop `n` octets from the front, advancing the sequence number
    pub(crate) fn trim_front(&mut self, n: u32) {
        let n = (n as usize).min(self.data().len());
        match &mut self.payload {
            Payload::Borrowed(data) => *data = &data[n..],
            Payload::Owned(data) => data.advance(n),
        }
        self.seq = self.seq.wrapping_add(n as u32);
    }

    /// Split off the first `n` octets as a new segment carrying the same flags
    pub(crate) fn split_to(&mut self, n: u32) -> Segment<'static> {
        let n = (n as usize).min(self.data().len());
        let head = BytesMut::from(&self.data()[..n]);
        let seq = self.seq;
        self.trim_front(n as u32);
        Segment::owned(seq, self.flags, head)
    }

    /// Whether more payload may still be appended
    ///
    /// Only segments the host has never seen and that carry no SYN, FIN or RST qualify.
    pub(crate) fn can_append(&self) -> bool {
        self.last_transmit.is_none()
            && !self
                .flags
                .intersects(TcpFlags::SYN | TcpFlags::FIN | TcpFlags::RST)
    }

    /// Append `data`, converting to an owned payload when needed
    pub(crate) fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match &mut self.payload {
            Payload::Owned(buf) => buf.extend_from_slice(data),
            Payload::Borrowed(existing) => {
                let mut buf = BytesMut::with_capacity(existing.len() + data.len());
                buf.extend_from_slice(existing);
                buf.extend_from_slice(data);
                self.payload = Payload::Owned(buf);
            }
        }
    }

    /// The octet stored at sequence number `at`, if covered
    pub(crate) fn octet_at(&self, at: u32) -> Option<u8> {
        if !seq::in_window(at, self.seq, self.len()) {
            return None;
        }
        self.data().get(seq::distance(self.seq, at) as usize).copied()
    }
}

impl Segment<'static> {
    /// A segment owning `data`
    pub fn owned(seq: u32, flags: TcpFlags, data: BytesMut) -> Self {
        Self {
            seq,
            flags,
            payload: Payload::Owned(data),
            last_transmit: None,
        }
    }

    /// A zero-length segment that only carries flags, such as a queued FIN
    pub fn marker(seq: u32, flags: TcpFlags) -> Self {
        Self::owned(seq, flags, BytesMut::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_and_split() {
        let raw = b"abcdefgh";
        let mut segment = Segment::borrowed(u32::MAX - 1, TcpFlags::ACK, raw);
        assert_eq!(segment.following_seq(), 6);
        segment.trim_front(2);
        assert_eq!(segment.seq(), 0);
        assert_eq!(segment.data(), b"cdefgh");

        let head = segment.split_to(4);
        assert_eq!(head.seq(), 0);
        assert_eq!(head.data(), b"cdef");
        assert_eq!(segment.seq(), 4);
        assert_eq!(segment.data(), b"gh");
    }

    #[test]
    fn append_rules() {
        let mut segment = Segment::borrowed(10, TcpFlags::ACK, b"ab");
        assert!(segment.can_append());
        segment.append(b"cd");
        assert_eq!(segment.data(), b"abcd");
        assert_eq!(segment.octet_at(13), Some(b'd'));
        assert_eq!(segment.octet_at(14), None);

        segment.set_last_transmit(Instant::now());
        assert!(!segment.can_append());
        assert!(!Segment::marker(0, TcpFlags::FIN | TcpFlags::ACK).can_append());
    }
}
