use std::collections::VecDeque;

use thiserror::Error;

use super::Segment;
use crate::{seq, TcpFlags};

/// Circular buffer that puts host segments back in sequence order
///
/// Stored bytes are tracked as a sorted list of disjoint, non-adjacent ranges. Bytes in the
/// range starting at `reading_seq` are *ready*; anything after the first hole is buffered but
/// not yet deliverable. The backing storage starts at `min_size` and doubles on demand up to
/// `max_size`.
#[derive(Debug)]
pub(crate) struct ReassemblyBuffer {
    data: Vec<u8>,
    read_ptr: usize,
    min_size: usize,
    max_size: usize,
    /// Sequence number of the byte at `read_ptr`
    reading_seq: u32,
    /// First sequence number not yet received in order
    next_expected: u32,
    ranges: VecDeque<Range>,
    ready: usize,
    total: usize,
}

#[derive(Debug, Clone, Copy)]
struct Range {
    seq: u32,
    len: u32,
    flags: TcpFlags,
}

impl Range {
    fn following_seq(&self) -> u32 {
        self.seq.wrapping_add(self.len)
    }
}

/// Description of bytes read out of a [`ReassemblyBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Chunk {
    pub(crate) seq: u32,
    pub(crate) len: usize,
    pub(crate) flags: TcpFlags,
}

impl ReassemblyBuffer {
    pub(crate) fn new(min_size: usize, max_size: usize) -> Self {
        Self {
            data: vec![0; min_size],
            read_ptr: 0,
            min_size,
            max_size,
            reading_seq: 0,
            next_expected: 0,
            ranges: VecDeque::new(),
            ready: 0,
            total: 0,
        }
    }

    /// Drop all buffered data and shrink back to the minimum size
    pub(crate) fn reset(&mut self) {
        if self.data.len() != self.min_size {
            self.data = vec![0; self.min_size];
        }
        self.read_ptr = 0;
        self.reading_seq = 0;
        self.next_expected = 0;
        self.ranges.clear();
        self.ready = 0;
        self.total = 0;
    }

    /// Reset and start expecting data at `seq`
    pub(crate) fn reset_to(&mut self, seq: u32) {
        self.reset();
        self.reading_seq = seq;
        self.next_expected = seq;
    }

    /// Store a segment
    ///
    /// Returns the number of bytes newly written. Without `overwrite`, bytes already present
    /// are kept and only the gaps are filled; with it, the segment's bytes replace whatever
    /// was stored. A segment that adds nothing is accepted and yields 0.
    pub(crate) fn insert(
        &mut self,
        segment: &Segment<'_>,
        overwrite: bool,
    ) -> Result<usize, InsertError> {
        let following = segment.following_seq();
        if seq::lt(following, self.next_expected) {
            return Err(InsertError::Stale);
        }
        let end_off = self.offset(following);
        if end_off > self.max_size {
            return Err(InsertError::ExceedsCapacity);
        }
        if !self.is_useful(segment, overwrite) {
            return Ok(0);
        }
        self.grow(end_off);

        let mut start = segment.seq();
        let mut bytes = segment.data();
        if seq::gt(self.next_expected, start) {
            bytes = &bytes[seq::distance(start, self.next_expected) as usize..];
            start = self.next_expected;
        }
        let lo = self.offset(start);
        let hi = lo + bytes.len();

        // Ranges that overlap or touch [lo, hi]
        let first = self
            .ranges
            .iter()
            .position(|r| self.offset(r.following_seq()) >= lo)
            .unwrap_or(self.ranges.len());
        let last = self
            .ranges
            .iter()
            .position(|r| self.offset(r.seq) > hi)
            .unwrap_or(self.ranges.len());

        let written = if overwrite {
            self.write_at(lo, bytes);
            bytes.len()
        } else {
            let mut cursor = lo;
            let mut written = 0;
            for i in first..last {
                let range = self.ranges[i];
                let (r_lo, r_hi) = (self.offset(range.seq), self.offset(range.following_seq()));
                if r_lo > cursor {
                    let gap = &bytes[cursor - lo..r_lo.min(hi) - lo];
                    self.write_at(cursor, gap);
                    written += gap.len();
                }
                cursor = cursor.max(r_hi);
            }
            if cursor < hi {
                self.write_at(cursor, &bytes[cursor - lo..]);
                written += hi - cursor;
            }
            written
        };

        let mut merged = Range {
            seq: start,
            len: bytes.len() as u32,
            flags: segment.flags(),
        };
        for range in self.ranges.drain(first..last) {
            let merged_lo = seq_min(merged.seq, range.seq);
            let merged_hi = seq::max(merged.following_seq(), range.following_seq());
            merged = Range {
                seq: merged_lo,
                len: seq::distance(merged_lo, merged_hi),
                flags: merged.flags | range.flags,
            };
        }
        self.ranges.insert(first, merged);

        self.update_counters();
        Ok(written)
    }

    /// Copy ready bytes into `buf` without consuming them
    ///
    /// At most one stored range is read per call. The returned flags are those of the range if
    /// it was read to its end, and a bare ACK otherwise.
    pub(crate) fn peek(&self, buf: &mut [u8]) -> Option<Chunk> {
        if self.ready == 0 {
            return None;
        }
        let front = self.ranges.front()?;
        let len = buf.len().min(front.len as usize);
        self.read_at(0, &mut buf[..len]);
        let flags = match len == front.len as usize {
            true => front.flags,
            false => TcpFlags::ACK,
        };
        Some(Chunk {
            seq: self.reading_seq,
            len,
            flags,
        })
    }

    /// Like [`peek`](Self::peek), but consumes what was read
    ///
    /// When no bytes are ready but a zero-length range sits at the read position, its flags are
    /// returned and the range is dropped.
    pub(crate) fn extract(&mut self, buf: &mut [u8]) -> Option<Chunk> {
        if self.ready == 0 {
            let front = self.ranges.front()?;
            if front.len != 0 || front.seq != self.reading_seq {
                return None;
            }
            let chunk = Chunk {
                seq: front.seq,
                len: 0,
                flags: front.flags,
            };
            self.ranges.pop_front();
            self.update_counters();
            return Some(chunk);
        }

        let chunk = self.peek(buf)?;
        // Cannot fail: the chunk is bounded by the ready range
        self.remove(chunk.len).ok()?;
        Some(chunk)
    }

    /// Discard `n` ready bytes from the front
    pub(crate) fn remove(&mut self, n: usize) -> Result<(), RemoveError> {
        if n > self.ready {
            return Err(RemoveError {
                requested: n,
                ready: self.ready,
            });
        }
        if let Some(front) = self.ranges.front_mut() {
            if n as u32 >= front.len {
                self.ranges.pop_front();
            } else {
                front.seq = front.seq.wrapping_add(n as u32);
                front.len -= n as u32;
            }
        }
        self.reading_seq = self.reading_seq.wrapping_add(n as u32);
        self.read_ptr = (self.read_ptr + n) % self.data.len();
        self.ready = self.ready.saturating_sub(n);
        self.total = self.total.saturating_sub(n);
        Ok(())
    }

    /// Account for a consumed FIN, which occupies one sequence number but no storage
    pub(crate) fn advance_next_expected(&mut self, n: u32) {
        self.next_expected = self.next_expected.wrapping_add(n);
    }

    pub(crate) fn next_expected(&self) -> u32 {
        self.next_expected
    }

    pub(crate) fn ready_bytes(&self) -> usize {
        self.ready
    }

    pub(crate) fn total_bytes(&self) -> usize {
        self.total
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Whether something, possibly only flags, can be extracted
    pub(crate) fn is_ready(&self) -> bool {
        self.ranges
            .front()
            .map_or(false, |r| r.seq == self.reading_seq)
    }

    /// Whether out-of-order data is waiting behind a gap
    pub(crate) fn has_holes(&self) -> bool {
        self.total > self.ready
    }

    pub(crate) fn remaining_space(&self) -> usize {
        self.max_size.saturating_sub(self.total)
    }

    pub(crate) fn remaining_space_percentage(&self) -> usize {
        match self.max_size {
            0 => 0,
            max => self.remaining_space() * 100 / max,
        }
    }

    fn offset(&self, seq: u32) -> usize {
        seq::distance(self.reading_seq, seq) as usize
    }

    fn is_useful(&self, segment: &Segment<'_>, overwrite: bool) -> bool {
        if overwrite || segment.is_empty() {
            return true;
        }
        let (lo, hi) = (segment.seq(), segment.following_seq());
        for range in self.ranges.iter().take_while(|r| seq::le(r.seq, lo)) {
            if seq::lt(lo, range.following_seq()) {
                return seq::gt(hi, range.following_seq());
            }
        }
        true
    }

    fn grow(&mut self, needed: usize) {
        let size = self.data.len();
        if needed <= size || size >= self.max_size {
            return;
        }
        let mut new_size = size.max(1) * 2;
        while new_size < needed && new_size < self.max_size {
            new_size *= 2;
        }
        let new_size = new_size.min(self.max_size);

        let mut data = Vec::with_capacity(new_size);
        data.extend_from_slice(&self.data[self.read_ptr..]);
        data.extend_from_slice(&self.data[..self.read_ptr]);
        data.resize(new_size, 0);
        self.data = data;
        self.read_ptr = 0;
    }

    fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        let size = self.data.len();
        let pos = (self.read_ptr + offset) % size;
        let first = bytes.len().min(size - pos);
        self.data[pos..pos + first].copy_from_slice(&bytes[..first]);
        self.data[..bytes.len() - first].copy_from_slice(&bytes[first..]);
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) {
        let size = self.data.len();
        let pos = (self.read_ptr + offset) % size;
        let first = buf.len().min(size - pos);
        buf[..first].copy_from_slice(&self.data[pos..pos + first]);
        let rest = buf.len() - first;
        buf[first..].copy_from_slice(&self.data[..rest]);
    }

    fn update_counters(&mut self) {
        let Some(front) = self.ranges.front() else {
            self.ready = 0;
            self.total = 0;
            return;
        };
        if front.seq == self.reading_seq {
            self.next_expected = front.following_seq();
        } else {
            self.next_expected = self.reading_seq;
        }
        self.ready = self.offset(self.next_expected);
        self.total = self
            .ranges
            .back()
            .map_or(0, |r| self.offset(r.following_seq()));
    }
}

fn seq_min(a: u32, b: u32) -> u32 {
    if seq::lt(a, b) {
        a
    } else {
        b
    }
}

/// Reasons a segment cannot be stored
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// The segment ends before the next expected sequence number
    #[error("segment precedes the receive window")]
    Stale,
    /// The segment extends past the buffer's maximum size
    #[error("segment exceeds buffer capacity")]
    ExceedsCapacity,
}

/// More bytes were requested than are ready
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("cannot remove {requested} bytes, only {ready} ready")]
pub struct RemoveError {
    requested: usize,
    ready: usize,
}
