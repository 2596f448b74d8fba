#![allow(dead_code)]

use byteorder::{BigEndian, ByteOrder};
use gro_rs::{
    AggregationParams, CounterBank, DeadlineTimers, Frame, FramePool, GroEngine, MetadataMemory,
};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::tcp::TcpPacket;
use std::net::{Ipv4Addr, Ipv6Addr};

pub const TCP_ACK: u8 = 0x10;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_FIN: u8 = 0x01;

pub const SRC_V4: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const DST_V4: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const SRC_V6: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1);
pub const DST_V6: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Describes one synthetic TCP segment.
#[derive(Debug, Clone)]
pub struct Seg {
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload_len: usize,
    pub ecn: u8,
    pub timestamp: Option<(u32, u32)>,
    pub sack: Option<(u32, u32)>,
    pub dscp: u8,
    pub ttl: u8,
    pub v6: bool,
    pub vlans: Option<usize>,
}

impl Default for Seg {
    fn default() -> Self {
        Seg {
            seq: 1000,
            ack: 1,
            flags: TCP_ACK,
            window: 512,
            payload_len: 60,
            ecn: 0,
            timestamp: None,
            sack: None,
            dscp: 0,
            ttl: 64,
            v6: false,
            vlans: None,
        }
    }
}

impl Seg {
    pub fn new(seq: u32) -> Self {
        Seg {
            seq,
            ..Seg::default()
        }
    }
    pub fn payload(mut self, payload_len: usize) -> Self {
        self.payload_len = payload_len;
        self
    }
    pub fn ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }
    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }
    pub fn psh(self) -> Self {
        self.flags(TCP_ACK | TCP_PSH)
    }
    pub fn window(mut self, window: u16) -> Self {
        self.window = window;
        self
    }
    pub fn ecn(mut self, ecn: u8) -> Self {
        self.ecn = ecn;
        self
    }
    pub fn timestamp(mut self, value: u32, echo: u32) -> Self {
        self.timestamp = Some((value, echo));
        self
    }
    /// Adds one SACK block (padded to 12 option bytes).
    pub fn sack(mut self, left: u32, right: u32) -> Self {
        self.sack = Some((left, right));
        self
    }
    pub fn dscp(mut self, dscp: u8) -> Self {
        self.dscp = dscp;
        self
    }
    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }
    pub fn v6(mut self) -> Self {
        self.v6 = true;
        self
    }
    /// Ethernet framing with `tags` 802.1Q tags.
    pub fn ethernet(mut self, tags: usize) -> Self {
        self.vlans = Some(tags);
        self
    }

    pub fn l2_len(&self) -> usize {
        self.vlans.map(|tags| 14 + 4 * tags).unwrap_or(0)
    }
    pub fn ip_header_len(&self) -> usize {
        if self.v6 {
            40
        } else {
            20
        }
    }
    pub fn tcp_header_len(&self) -> usize {
        20 + 12 * (self.timestamp.is_some() as usize + self.sack.is_some() as usize)
    }
    pub fn headers_len(&self) -> usize {
        self.l2_len() + self.ip_header_len() + self.tcp_header_len()
    }
    pub fn len(&self) -> usize {
        self.headers_len() + self.payload_len
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.len()];
        let l3 = self.l2_len();
        if let Some(tags) = self.vlans {
            buf[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
            buf[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
            for tag in 0..tags {
                let at = 12 + 4 * tag;
                BigEndian::write_u16(&mut buf[at..], 0x8100);
                BigEndian::write_u16(&mut buf[at + 2..], 100 + tag as u16);
            }
            let ethertype = if self.v6 { 0x86DD } else { 0x0800 };
            BigEndian::write_u16(&mut buf[l3 - 2..], ethertype);
        }

        let l4 = l3 + self.ip_header_len();
        let ip_len = self.len() - l3;
        if self.v6 {
            let ip = &mut buf[l3..];
            let traffic_class = (self.dscp << 2) | (self.ecn & 0x03);
            ip[0] = 0x60 | (traffic_class >> 4);
            ip[1] = (traffic_class & 0x0F) << 4;
            BigEndian::write_u16(&mut ip[4..6], (ip_len - 40) as u16);
            ip[6] = 6;
            ip[7] = self.ttl;
            ip[8..24].copy_from_slice(&SRC_V6.octets());
            ip[24..40].copy_from_slice(&DST_V6.octets());
        } else {
            let ip = &mut buf[l3..];
            ip[0] = 0x45;
            ip[1] = (self.dscp << 2) | (self.ecn & 0x03);
            BigEndian::write_u16(&mut ip[2..4], ip_len as u16);
            BigEndian::write_u16(&mut ip[4..6], 0x1c46);
            ip[6] = 0x40;
            ip[8] = self.ttl;
            ip[9] = 6;
            ip[12..16].copy_from_slice(&SRC_V4.octets());
            ip[16..20].copy_from_slice(&DST_V4.octets());
            let csum = pnet_packet::ipv4::checksum(&Ipv4Packet::new(&ip[..20]).unwrap());
            BigEndian::write_u16(&mut ip[10..12], csum);
        }

        {
            let tcp = &mut buf[l4..];
            BigEndian::write_u16(&mut tcp[0..2], 40000);
            BigEndian::write_u16(&mut tcp[2..4], 8080);
            BigEndian::write_u32(&mut tcp[4..8], self.seq);
            BigEndian::write_u32(&mut tcp[8..12], self.ack);
            tcp[12] = ((self.tcp_header_len() / 4) as u8) << 4;
            tcp[13] = self.flags;
            BigEndian::write_u16(&mut tcp[14..16], self.window);
            let mut at = 20;
            if let Some((value, echo)) = self.timestamp {
                tcp[at..at + 4].copy_from_slice(&[1, 1, 8, 10]);
                BigEndian::write_u32(&mut tcp[at + 4..at + 8], value);
                BigEndian::write_u32(&mut tcp[at + 8..at + 12], echo);
                at += 12;
            }
            if let Some((left, right)) = self.sack {
                tcp[at..at + 4].copy_from_slice(&[1, 1, 5, 10]);
                BigEndian::write_u32(&mut tcp[at + 4..at + 8], left);
                BigEndian::write_u32(&mut tcp[at + 8..at + 12], right);
            }
            let payload_at = self.tcp_header_len();
            for (i, byte) in tcp[payload_at..].iter_mut().enumerate() {
                *byte = stream_byte(self.seq.wrapping_add(i as u32));
            }
        }
        let csum = tcp_checksum(&buf[l4..], self.v6);
        BigEndian::write_u16(&mut buf[l4 + 16..l4 + 18], csum);
        buf
    }

    pub fn frame(&self) -> Frame {
        let bytes = self.bytes();
        if self.vlans.is_some() {
            Frame::ethernet(&bytes[..])
        } else {
            Frame::ip(&bytes[..])
        }
    }
}

/// The payload byte carried at sequence number `seq`.
pub fn stream_byte(seq: u32) -> u8 {
    (seq % 251) as u8
}

/// TCP checksum of `tcp` (header and payload) as computed by pnet.
pub fn tcp_checksum(tcp: &[u8], v6: bool) -> u16 {
    let packet = TcpPacket::new(tcp).unwrap();
    if v6 {
        pnet_packet::tcp::ipv6_checksum(&packet, &SRC_V6, &DST_V6)
    } else {
        pnet_packet::tcp::ipv4_checksum(&packet, &SRC_V4, &DST_V4)
    }
}

/// A run of `count` in-order segments starting at `seq`, each carrying `payload_len` bytes.
pub fn run(seq: u32, count: usize, payload_len: usize) -> Vec<Seg> {
    (0..count)
        .map(|i| Seg::new(seq + (i * payload_len) as u32).payload(payload_len))
        .collect()
}

pub fn params(seg_num_limit: u16, packet_size_limit: u32) -> AggregationParams {
    AggregationParams::builder()
        .seg_num_limit(seg_num_limit)
        .packet_size_limit(packet_size_limit)
        .build()
        .unwrap()
}

pub type TestEngine = GroEngine<FramePool, DeadlineTimers, CounterBank, MetadataMemory>;

pub fn engine() -> TestEngine {
    GroEngine::default()
}

pub fn engine_with(frames: FramePool, timers: DeadlineTimers) -> TestEngine {
    GroEngine::new(frames, timers, CounterBank::new(), MetadataMemory::new())
}
