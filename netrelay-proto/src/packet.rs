use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::{entry::Segment, TcpFlags};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERNET_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const IPV4_MIN_HEADER_LEN: usize = 20;
const TCP_MIN_HEADER_LEN: usize = 20;
const PROTOCOL_TCP: u8 = 6;
/// Synthesized packets never leave the host's network
const TTL: u8 = 8;

/// Bytes of IPv4 and TCP header in every packet we synthesize
pub const HEADER_LEN: usize = IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN;

/// A decoded TCP segment borrowing its payload from the captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpPacket<'a> {
    /// Sender address and port
    pub source: SocketAddrV4,
    /// Receiver address and port
    pub destination: SocketAddrV4,
    /// Sequence number
    pub seq: u32,
    /// Acknowledgment number, meaningful only with ACK set
    pub ack: u32,
    /// Control bits
    pub flags: TcpFlags,
    /// Advertised receive window
    pub window: u16,
    /// Segment text
    pub payload: &'a [u8],
}

impl<'a> TcpPacket<'a> {
    /// Decode an Ethernet II frame, optionally carrying one 802.1Q tag
    pub fn parse_frame(frame: &'a [u8], verify_checksums: bool) -> Result<Self, PacketError> {
        if frame.len() < ETHERNET_HEADER_LEN {
            return Err(PacketError::Truncated);
        }
        let mut header = &frame[12..];
        let mut offset = ETHERNET_HEADER_LEN;
        let mut ether_type = header.get_u16();
        if ether_type == ETHERTYPE_VLAN {
            if frame.len() < ETHERNET_HEADER_LEN + VLAN_TAG_LEN {
                return Err(PacketError::Truncated);
            }
            header.advance(2);
            ether_type = header.get_u16();
            offset += VLAN_TAG_LEN;
        }
        if ether_type != ETHERTYPE_IPV4 {
            return Err(PacketError::UnsupportedEtherType(ether_type));
        }
        Self::parse(&frame[offset..], verify_checksums)
    }

    /// Decode an IPv4 packet carrying TCP
    ///
    /// Trailing bytes beyond the IPv4 total length, such as Ethernet padding, are ignored.
    pub fn parse(packet: &'a [u8], verify_checksums: bool) -> Result<Self, PacketError> {
        if packet.len() < IPV4_MIN_HEADER_LEN {
            return Err(PacketError::Truncated);
        }
        let mut ip = packet;
        let version_ihl = ip.get_u8();
        if version_ihl >> 4 != 4 {
            return Err(PacketError::NotIpv4(version_ihl >> 4));
        }
        let ihl = usize::from(version_ihl & 0x0F) * 4;
        ip.advance(1);
        let total_len = usize::from(ip.get_u16());
        ip.advance(2);
        let fragment = ip.get_u16();
        ip.advance(1);
        let protocol = ip.get_u8();
        ip.advance(2);
        let source = Ipv4Addr::from(ip.get_u32());
        let destination = Ipv4Addr::from(ip.get_u32());

        if ihl < IPV4_MIN_HEADER_LEN || total_len < ihl {
            return Err(PacketError::BadHeaderLength);
        }
        if total_len > packet.len() {
            return Err(PacketError::Truncated);
        }
        // More-fragments bit or a nonzero offset
        if fragment & 0x3FFF != 0 {
            return Err(PacketError::Fragmented);
        }
        if protocol != PROTOCOL_TCP {
            return Err(PacketError::NotTcp(protocol));
        }
        if verify_checksums && checksum(&packet[..ihl]) != 0 {
            return Err(PacketError::BadChecksum);
        }

        let segment = &packet[ihl..total_len];
        if segment.len() < TCP_MIN_HEADER_LEN {
            return Err(PacketError::Truncated);
        }
        let mut tcp = segment;
        let source_port = tcp.get_u16();
        let destination_port = tcp.get_u16();
        let seq = tcp.get_u32();
        let ack = tcp.get_u32();
        let data_offset = usize::from(tcp.get_u8() >> 4) * 4;
        let flags = TcpFlags(tcp.get_u8() & 0x3F);
        let window = tcp.get_u16();
        if data_offset < TCP_MIN_HEADER_LEN || data_offset > segment.len() {
            return Err(PacketError::BadHeaderLength);
        }
        if verify_checksums && tcp_checksum(source, destination, segment) != 0 {
            return Err(PacketError::BadChecksum);
        }

        Ok(Self {
            source: SocketAddrV4::new(source, source_port),
            destination: SocketAddrV4::new(destination, destination_port),
            seq,
            ack,
            flags,
            window,
            payload: &segment[data_offset..],
        })
    }

    /// The segment text as a borrowed [`Segment`]
    pub fn segment(&self) -> Segment<'a> {
        Segment::borrowed(self.seq, self.flags, self.payload)
    }

    /// Append this segment to `buf` as an IPv4 packet with valid checksums
    pub fn encode(&self, ident: u16, buf: &mut BytesMut) {
        Header {
            source: self.source,
            destination: self.destination,
            ident,
            seq: self.seq,
            ack: self.ack,
            flags: self.flags,
            window: self.window,
        }
        .encode(self.payload, buf);
    }
}

/// Header fields of a TCP/IPv4 packet to synthesize
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub(crate) source: SocketAddrV4,
    pub(crate) destination: SocketAddrV4,
    pub(crate) ident: u16,
    pub(crate) seq: u32,
    pub(crate) ack: u32,
    pub(crate) flags: TcpFlags,
    pub(crate) window: u16,
}

impl Header {
    /// Append a complete IPv4 packet with both checksums filled in
    pub(crate) fn encode(&self, payload: &[u8], buf: &mut BytesMut) {
        let start = buf.len();
        let total_len = (HEADER_LEN + payload.len()) as u16;
        buf.reserve(usize::from(total_len));

        buf.put_u8(0x45);
        buf.put_u8(0);
        buf.put_u16(total_len);
        buf.put_u16(self.ident);
        buf.put_u16(0);
        buf.put_u8(TTL);
        buf.put_u8(PROTOCOL_TCP);
        buf.put_u16(0);
        buf.put_slice(&self.source.ip().octets());
        buf.put_slice(&self.destination.ip().octets());

        buf.put_u16(self.source.port());
        buf.put_u16(self.destination.port());
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u8((TCP_MIN_HEADER_LEN as u8 / 4) << 4);
        buf.put_u8(self.flags.0);
        buf.put_u16(self.window);
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_slice(payload);

        let ip_checksum = checksum(&buf[start..start + IPV4_MIN_HEADER_LEN]);
        buf[start + 10..start + 12].copy_from_slice(&ip_checksum.to_be_bytes());
        let tcp_start = start + IPV4_MIN_HEADER_LEN;
        let tcp_checksum = tcp_checksum(
            *self.source.ip(),
            *self.destination.ip(),
            &buf[tcp_start..],
        );
        buf[tcp_start + 16..tcp_start + 18].copy_from_slice(&tcp_checksum.to_be_bytes());
    }
}

/// One's complement sum as used by IPv4 and TCP (RFC 1071)
#[derive(Debug, Default, Clone, Copy)]
struct Checksum(u32);

impl Checksum {
    fn add(&mut self, data: &[u8]) {
        let mut chunks = data.chunks_exact(2);
        for pair in &mut chunks {
            self.0 += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
        }
        if let [last] = chunks.remainder() {
            self.0 += u32::from(*last) << 8;
        }
    }

    fn finish(self) -> u16 {
        let mut sum = self.0;
        while sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }
}

/// Checksum of `data`; 0 when `data` already contains a correct checksum
fn checksum(data: &[u8]) -> u16 {
    let mut sum = Checksum::default();
    sum.add(data);
    sum.finish()
}

fn tcp_checksum(source: Ipv4Addr, destination: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum = Checksum::default();
    sum.add(&source.octets());
    sum.add(&destination.octets());
    sum.add(&[0, PROTOCOL_TCP]);
    sum.add(&(segment.len() as u16).to_be_bytes());
    sum.add(segment);
    sum.finish()
}

/// Reasons a captured frame is not relayed
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// The frame ends before a complete header
    #[error("truncated frame")]
    Truncated,
    /// The link layer carries something other than IPv4
    #[error("unsupported ethertype {0:#06x}")]
    UnsupportedEtherType(u16),
    /// The IP version is not 4
    #[error("not IPv4 (version {0})")]
    NotIpv4(u8),
    /// The IPv4 payload is not TCP
    #[error("not TCP (protocol {0})")]
    NotTcp(u8),
    /// IPv4 fragments are not reassembled
    #[error("fragmented packet")]
    Fragmented,
    /// A header length field is inconsistent
    #[error("bad header length")]
    BadHeaderLength,
    /// An IPv4 or TCP checksum does not match
    #[error("bad checksum")]
    BadChecksum,
}
