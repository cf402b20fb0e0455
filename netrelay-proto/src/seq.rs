//! Wrapping comparisons on 32-bit TCP sequence numbers
//!
//! Sequence numbers live in a circular space, so `a < b` means "`b` lies less than half the space
//! ahead of `a`". Plain integer comparisons break as soon as a connection crosses the 2^32
//! boundary.

/// `a` precedes `b`
#[inline]
pub fn lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a` precedes or equals `b`
#[inline]
pub fn le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// `a` follows `b`
#[inline]
pub fn gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// `a` follows or equals `b`
#[inline]
pub fn ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// Distance from `from` forward to `to`
#[inline]
pub fn distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from)
}

/// The later of two sequence numbers
#[inline]
pub fn max(a: u32, b: u32) -> u32 {
    if gt(a, b) {
        a
    } else {
        b
    }
}

/// Whether `seq` lies in the half-open window `[start, start + len)`
#[inline]
pub fn in_window(seq: u32, start: u32, len: u32) -> bool {
    distance(start, seq) < len
}
