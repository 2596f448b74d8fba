/*!
# Header Parser

Turns a received [`Frame`] into [`ParsedHeaders`]: the offsets and TCP/IP
fields the aggregation engine decides on. Frames may start at the IP header
([`LinkType::RawIp`]) or with an Ethernet II header carrying up to two
802.1Q/802.1ad tags ([`LinkType::Ethernet`]).

Only TCP over IPv4 or IPv6 (without extension headers) parses successfully.
Segments that parse but must never be merged (SYN/FIN/RST/URG/CWR/ECE, empty
payload, IPv4 fragments, link-layer padding) are reported through
[`ParsedHeaders::is_coalescible`].

All header mutation done while finalizing an aggregate goes through the
writer methods here, so offsets are only ever computed in this module.
*/

use crate::{Frame, GroError, LinkType};
use byteorder::{BigEndian, ByteOrder};

const ETHERNET_HEADER_LEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;
const MAX_VLAN_TAGS: usize = 2;

const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const IPV4_FLAG_MORE_FRAGMENTS: u8 = 0x20;
const IPV4_SRC_ADDR_OFFSET: usize = 12;
const IPV6_SRC_ADDR_OFFSET: usize = 8;
const IPV4_CHECKSUM_OFFSET: usize = 10;

const TCP_MIN_HEADER_LEN: usize = 20;
const TCP_MAX_HEADER_LEN: usize = 60;
const TCP_ACK_OFFSET: usize = 8;
const TCP_FLAGS_OFFSET: usize = 13;
const TCP_WINDOW_OFFSET: usize = 14;
/// Offset of the checksum within the TCP header.
pub const TCP_CHECKSUM_OFFSET: usize = 16;
const TCP_URGENT_OFFSET: usize = 18;

const TCP_OPT_EOL: u8 = 0;
const TCP_OPT_NOP: u8 = 1;
const TCP_OPT_TIMESTAMP: u8 = 8;
const TCP_OPT_TIMESTAMP_LEN: u8 = 10;

pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;
pub const TCP_FLAG_URG: u8 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpVersion {
    #[default]
    V4,
    V6,
}

/// TCP timestamp option (RFC 7323) found in a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpTimestamp {
    pub value: u32,
    pub echo: u32,
    /// Offset of the TSval field from the start of the frame.
    offset: u16,
}

/// IP header fields that must be equal across every segment of an aggregate,
/// since only the first segment's copy reaches the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpFields {
    /// IPv4 ToS byte or IPv6 traffic class, DSCP and ECN together.
    pub traffic_class: u8,
    /// IPv4 TTL or IPv6 hop limit.
    pub hop_limit: u8,
    /// IPv4 reserved and DF bits; always zero for IPv6.
    pub df_bits: u8,
}

/// Raw TCP option bytes of a segment with the timestamp echo reply zeroed.
///
/// The echo reply is rewritten from the last segment when an aggregate is
/// finalized; every other option byte is emitted as the first segment
/// carried it, so it must match exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpOptions {
    len: u8,
    bytes: [u8; TCP_MAX_HEADER_LEN - TCP_MIN_HEADER_LEN],
}

impl Default for TcpOptions {
    fn default() -> Self {
        TcpOptions {
            len: 0,
            bytes: [0; TCP_MAX_HEADER_LEN - TCP_MIN_HEADER_LEN],
        }
    }
}

impl TcpOptions {
    fn new(raw: &[u8], tsval_at: Option<usize>) -> Self {
        let mut options = TcpOptions {
            len: raw.len() as u8,
            ..TcpOptions::default()
        };
        options.bytes[..raw.len()].copy_from_slice(raw);
        if let Some(at) = tsval_at {
            options.bytes[at + 4..at + 8].fill(0);
        }
        options
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// Header fields of one TCP segment, see the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHeaders {
    ip_version: IpVersion,
    l3_offset: u16,
    l4_offset: u16,
    tcp_header_len: u8,
    ip_end: u32,
    ecn: u8,
    ip_fields: IpFields,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    urgent: u16,
    timestamp: Option<TcpTimestamp>,
    options: TcpOptions,
    fragment: bool,
    padded: bool,
}

fn ethernet_l3_offset(b: &[u8]) -> Result<usize, GroError> {
    if b.len() < ETHERNET_HEADER_LEN {
        return Err(GroError::Malformed("frame shorter than an Ethernet header"));
    }
    let mut ethertype_at = 12;
    for _ in 0..=MAX_VLAN_TAGS {
        if b.len() < ethertype_at + 2 {
            break;
        }
        match BigEndian::read_u16(&b[ethertype_at..]) {
            ETHERTYPE_VLAN | ETHERTYPE_QINQ => ethertype_at += 4,
            ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => return Ok(ethertype_at + 2),
            _ => return Err(GroError::Malformed("not an IP ethertype")),
        }
    }
    Err(GroError::Malformed("truncated or over-tagged Ethernet header"))
}

fn find_timestamp(options: &[u8], options_at: usize) -> Option<TcpTimestamp> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            TCP_OPT_EOL => break,
            TCP_OPT_NOP => i += 1,
            kind => {
                let len = *options.get(i + 1)? as usize;
                if len < 2 || i + len > options.len() {
                    return None;
                }
                if kind == TCP_OPT_TIMESTAMP && len == TCP_OPT_TIMESTAMP_LEN as usize {
                    return Some(TcpTimestamp {
                        value: BigEndian::read_u32(&options[i + 2..]),
                        echo: BigEndian::read_u32(&options[i + 6..]),
                        offset: (options_at + i + 2) as u16,
                    });
                }
                i += len;
            }
        }
    }
    None
}

/// Parses the L2..L4 headers of `frame`.
///
/// # Errors
///
/// [`GroError::Malformed`] when the frame is truncated, is not TCP over
/// IPv4/IPv6, or its IP length field claims more bytes than the frame holds.
pub fn parse(frame: &Frame) -> Result<ParsedHeaders, GroError> {
    let b = frame.as_bytes();
    if b.len() > u16::MAX as usize + ETHERNET_HEADER_LEN + 4 * MAX_VLAN_TAGS {
        return Err(GroError::Malformed("frame exceeds the largest IP datagram"));
    }
    let l3_offset = match frame.link() {
        LinkType::RawIp => 0,
        LinkType::Ethernet => ethernet_l3_offset(b)?,
    };
    let ip = &b[l3_offset..];
    if ip.is_empty() {
        return Err(GroError::Malformed("missing IP header"));
    }

    let (ip_version, iph_len, ip_len, ip_fields, fragment) = match ip[0] >> 4 {
        4 => {
            let iph_len = ((ip[0] & 0x0F) as usize) * 4;
            if iph_len < IPV4_MIN_HEADER_LEN || ip.len() < iph_len {
                return Err(GroError::Malformed("truncated IPv4 header"));
            }
            if ip[9] != libc::IPPROTO_TCP as u8 {
                return Err(GroError::Malformed("not a TCP segment"));
            }
            let total_len = BigEndian::read_u16(&ip[2..4]) as usize;
            if total_len < iph_len {
                return Err(GroError::Malformed("IPv4 total length below header length"));
            }
            let fragment =
                ip[6] & IPV4_FLAG_MORE_FRAGMENTS != 0 || ip[6] << 3 != 0 || ip[7] != 0;
            let ip_fields = IpFields {
                traffic_class: ip[1],
                hop_limit: ip[8],
                df_bits: ip[6] >> 5,
            };
            (IpVersion::V4, iph_len, total_len, ip_fields, fragment)
        }
        6 => {
            if ip.len() < IPV6_HEADER_LEN {
                return Err(GroError::Malformed("truncated IPv6 header"));
            }
            if ip[6] != libc::IPPROTO_TCP as u8 {
                return Err(GroError::Malformed("not a TCP segment"));
            }
            let payload_len = BigEndian::read_u16(&ip[4..6]) as usize;
            let ip_fields = IpFields {
                traffic_class: (ip[0] << 4) | (ip[1] >> 4),
                hop_limit: ip[7],
                df_bits: 0,
            };
            (
                IpVersion::V6,
                IPV6_HEADER_LEN,
                IPV6_HEADER_LEN + payload_len,
                ip_fields,
                false,
            )
        }
        _ => return Err(GroError::Malformed("unknown IP version")),
    };
    if ip_len > ip.len() {
        return Err(GroError::Malformed("IP length exceeds frame length"));
    }

    let l4_offset = l3_offset + iph_len;
    let ip_end = l3_offset + ip_len;
    if ip_end < l4_offset + TCP_MIN_HEADER_LEN {
        return Err(GroError::Malformed("truncated TCP header"));
    }
    let tcp = &b[l4_offset..ip_end];
    let tcp_header_len = ((tcp[12] >> 4) as usize) * 4;
    if !(TCP_MIN_HEADER_LEN..=TCP_MAX_HEADER_LEN).contains(&tcp_header_len)
        || tcp.len() < tcp_header_len
    {
        return Err(GroError::Malformed("invalid TCP data offset"));
    }

    let options_at = l4_offset + TCP_MIN_HEADER_LEN;
    let raw_options = &tcp[TCP_MIN_HEADER_LEN..tcp_header_len];
    let timestamp = find_timestamp(raw_options, options_at);
    let options = TcpOptions::new(
        raw_options,
        timestamp.map(|ts| ts.offset as usize - options_at),
    );

    Ok(ParsedHeaders {
        ip_version,
        l3_offset: l3_offset as u16,
        l4_offset: l4_offset as u16,
        tcp_header_len: tcp_header_len as u8,
        ip_end: ip_end as u32,
        ecn: ip_fields.traffic_class & 0x03,
        ip_fields,
        seq: BigEndian::read_u32(&tcp[4..8]),
        ack: BigEndian::read_u32(&tcp[TCP_ACK_OFFSET..]),
        flags: tcp[TCP_FLAGS_OFFSET],
        window: BigEndian::read_u16(&tcp[TCP_WINDOW_OFFSET..]),
        urgent: BigEndian::read_u16(&tcp[TCP_URGENT_OFFSET..]),
        timestamp,
        options,
        fragment,
        padded: ip_end != b.len(),
    })
}

impl ParsedHeaders {
    pub fn ip_version(&self) -> IpVersion {
        self.ip_version
    }
    pub fn l3_offset(&self) -> usize {
        self.l3_offset as usize
    }
    pub fn l4_offset(&self) -> usize {
        self.l4_offset as usize
    }
    pub fn tcp_header_len(&self) -> usize {
        self.tcp_header_len as usize
    }
    /// Length of everything up to the TCP payload (L2..L4).
    pub fn headers_len(&self) -> usize {
        self.l4_offset() + self.tcp_header_len()
    }
    pub fn payload_len(&self) -> usize {
        self.ip_end as usize - self.headers_len()
    }
    pub fn ecn(&self) -> u8 {
        self.ecn
    }
    pub fn seq(&self) -> u32 {
        self.seq
    }
    pub fn ack(&self) -> u32 {
        self.ack
    }
    pub fn flags(&self) -> u8 {
        self.flags
    }
    pub fn window(&self) -> u16 {
        self.window
    }
    pub fn urgent(&self) -> u16 {
        self.urgent
    }
    pub fn psh(&self) -> bool {
        self.flags & TCP_FLAG_PSH != 0
    }
    pub fn timestamp(&self) -> Option<TcpTimestamp> {
        self.timestamp
    }
    pub fn ip_fields(&self) -> IpFields {
        self.ip_fields
    }
    /// TCP options as they must appear in every segment of one aggregate.
    pub fn options(&self) -> &TcpOptions {
        &self.options
    }
    pub fn is_fragment(&self) -> bool {
        self.fragment
    }

    /// Whether this segment may take part in an aggregation at all.
    ///
    /// Only ACK or ACK|PSH segments carrying payload, unfragmented and
    /// without link-layer padding, are candidates.
    pub fn is_coalescible(&self) -> bool {
        (self.flags == TCP_FLAG_ACK || self.flags == TCP_FLAG_ACK | TCP_FLAG_PSH)
            && self.payload_len() > 0
            && !self.fragment
            && !self.padded
    }

    fn addr_range(&self) -> (usize, usize) {
        match self.ip_version {
            IpVersion::V4 => (self.l3_offset() + IPV4_SRC_ADDR_OFFSET, 4),
            IpVersion::V6 => (self.l3_offset() + IPV6_SRC_ADDR_OFFSET, 16),
        }
    }

    /// Source and destination address bytes of `frame`.
    pub fn addresses<'a>(&self, frame: &'a [u8]) -> (&'a [u8], &'a [u8]) {
        let (at, len) = self.addr_range();
        (&frame[at..at + len], &frame[at + len..at + 2 * len])
    }

    /// Rewrites the IPv4 total length or IPv6 payload length so the datagram
    /// covers `frame_len - l3_offset` bytes. Returns the (old, new) field values.
    pub fn write_ip_length(&self, frame: &mut [u8], frame_len: usize) -> (u16, u16) {
        let l3 = self.l3_offset();
        let (at, new) = match self.ip_version {
            IpVersion::V4 => (l3 + 2, frame_len - l3),
            IpVersion::V6 => (l3 + 4, frame_len - l3 - IPV6_HEADER_LEN),
        };
        let old = BigEndian::read_u16(&frame[at..]);
        BigEndian::write_u16(&mut frame[at..], new as u16);
        (old, new as u16)
    }

    /// IPv4 header checksum field; `None` for IPv6, which has none.
    pub fn ipv4_checksum(&self, frame: &[u8]) -> Option<u16> {
        match self.ip_version {
            IpVersion::V4 => Some(BigEndian::read_u16(
                &frame[self.l3_offset() + IPV4_CHECKSUM_OFFSET..],
            )),
            IpVersion::V6 => None,
        }
    }

    pub fn write_ipv4_checksum(&self, frame: &mut [u8], csum: u16) {
        if self.ip_version == IpVersion::V4 {
            BigEndian::write_u16(&mut frame[self.l3_offset() + IPV4_CHECKSUM_OFFSET..], csum);
        }
    }

    /// Overwrites the trailing TCP header fields (ack, flags, window, urgent
    /// pointer, timestamp option) of `frame` with those of another segment.
    pub fn write_trailer(&self, frame: &mut [u8], trailer: &SegmentTrailer) {
        let l4 = self.l4_offset();
        BigEndian::write_u32(&mut frame[l4 + TCP_ACK_OFFSET..], trailer.ack);
        frame[l4 + TCP_FLAGS_OFFSET] = trailer.flags;
        BigEndian::write_u16(&mut frame[l4 + TCP_WINDOW_OFFSET..], trailer.window);
        BigEndian::write_u16(&mut frame[l4 + TCP_URGENT_OFFSET..], trailer.urgent);
        if let (Some(ts), Some(echo)) = (self.timestamp, trailer.ts_echo) {
            let at = ts.offset as usize;
            BigEndian::write_u32(&mut frame[at..], trailer.ts_value);
            BigEndian::write_u32(&mut frame[at + 4..], echo);
        }
    }

    /// Offset of the TCP checksum field from the start of the frame.
    pub fn tcp_checksum_offset(&self) -> usize {
        self.l4_offset() + TCP_CHECKSUM_OFFSET
    }

    pub fn write_tcp_checksum(&self, frame: &mut [u8], csum: u16) {
        BigEndian::write_u16(&mut frame[self.tcp_checksum_offset()..], csum);
    }

    /// The TCP header and payload of `frame`.
    pub fn tcp_segment<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        &frame[self.l4_offset()..]
    }

    /// The trailing header fields of this segment.
    pub fn trailer(&self) -> SegmentTrailer {
        SegmentTrailer {
            ack: self.ack,
            flags: self.flags,
            window: self.window,
            urgent: self.urgent,
            ts_value: self.timestamp.map(|ts| ts.value).unwrap_or(0),
            ts_echo: self.timestamp.map(|ts| ts.echo),
        }
    }
}

/// Trailing TCP header fields of the most recently added segment.
///
/// These, rather than the first segment's, end up in the emitted aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentTrailer {
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub urgent: u16,
    pub ts_value: u32,
    pub ts_echo: Option<u32>,
}
