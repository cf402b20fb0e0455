use std::{fmt, ops};

/// The control bits of a TCP header
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    /// No flags set
    pub const EMPTY: Self = Self(0);
    /// No more data from sender
    pub const FIN: Self = Self(0x01);
    /// Synchronize sequence numbers
    pub const SYN: Self = Self(0x02);
    /// Reset the connection
    pub const RST: Self = Self(0x04);
    /// Push function
    pub const PSH: Self = Self(0x08);
    /// Acknowledgment field significant
    pub const ACK: Self = Self(0x10);
    /// Urgent pointer field significant
    pub const URG: Self = Self(0x20);

    /// Flags that may be carried forward when data is merged or split: everything but
    /// FIN, SYN and RST
    pub const MERGEABLE: Self = Self(0xF8);
    /// Like [`MERGEABLE`](Self::MERGEABLE), also dropping PSH
    pub const MERGEABLE_NO_PUSH: Self = Self(0xF0);

    /// Whether all bits of `other` are set in `self`
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set in `self`
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether no bits are set
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of sequence numbers consumed by SYN and FIN
    pub fn seq_len(self) -> u32 {
        u32::from(self.contains(Self::SYN)) + u32::from(self.contains(Self::FIN))
    }
}

impl ops::BitOr for TcpFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for TcpFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl ops::BitAnd for TcpFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl ops::Not for TcpFlags {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TcpFlags, &str); 6] = [
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::URG, "URG"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks() {
        let all = TcpFlags::FIN | TcpFlags::PSH | TcpFlags::ACK;
        assert_eq!(all & TcpFlags::MERGEABLE, TcpFlags::PSH | TcpFlags::ACK);
        assert_eq!(all & TcpFlags::MERGEABLE_NO_PUSH, TcpFlags::ACK);
        assert_eq!((TcpFlags::SYN | TcpFlags::FIN).seq_len(), 2);
        assert_eq!(format!("{:?}", TcpFlags::RST | TcpFlags::ACK), "RST|ACK");
    }
}
