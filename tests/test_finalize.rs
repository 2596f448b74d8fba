mod common;

use common::*;
use gro_rs::parse::{self, IpVersion};
use gro_rs::{
    AggregationParams, Disposition, GroFlags, VirtioNetHdr, VIRTIO_NET_HDR_F_DATA_VALID,
    VIRTIO_NET_HDR_F_NEEDS_CSUM, VIRTIO_NET_HDR_GSO_NONE, VIRTIO_NET_HDR_GSO_TCPV4,
    VIRTIO_NET_HDR_GSO_TCPV6, VIRTIO_NET_HDR_LEN,
};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::Packet;

const FLOW: u64 = 0x9000;

fn aggregate_of(segs: &[Seg], flags: GroFlags) -> gro_rs::Aggregate {
    let engine = engine();
    let params = params(16, 65535);
    for seg in segs {
        let out = engine.aggregate_segment(FLOW, seg.frame(), &params, flags);
        assert!(!out.disposition.must_emit(), "{:?}", out.disposition);
    }
    let out = engine.flush_aggregation(FLOW);
    assert_eq!(out.disposition, Disposition::FLUSH_AGG_DONE);
    out.aggregate.unwrap()
}

#[test]
fn two_segment_checksum_round_trip() {
    init_logger();
    let segs = run(1000, 2, 60);
    let aggregate = aggregate_of(&segs, GroFlags::TCP_CHECKSUM);
    assert_eq!(aggregate.len(), segs[0].len() + segs[1].len() - 40);

    let ip = Ipv4Packet::new(aggregate.as_bytes()).unwrap();
    assert_eq!(ip.get_total_length() as usize, aggregate.len());
    assert_eq!(ip.get_checksum(), pnet_packet::ipv4::checksum(&ip));

    let tcp = TcpPacket::new(ip.payload()).unwrap();
    assert_eq!(tcp.get_sequence(), 1000);
    assert_eq!(tcp.payload().len(), 120);
    assert_eq!(
        tcp.get_checksum(),
        pnet_packet::tcp::ipv4_checksum(&tcp, &SRC_V4, &DST_V4)
    );
    assert!(aggregate.info().checksum_complete);
    assert_eq!(aggregate.virtio_hdr().flags, VIRTIO_NET_HDR_F_DATA_VALID);
}

#[test]
fn trailer_comes_from_the_last_segment() {
    let segs = [
        Seg::new(1000).ack(10).window(100).timestamp(77, 1),
        Seg::new(1060).ack(20).window(200).timestamp(77, 2),
        Seg::new(1120).ack(30).window(300).timestamp(77, 3),
    ];
    let aggregate = aggregate_of(&segs, GroFlags::TCP_CHECKSUM);
    let view = parse::parse(aggregate.frame()).unwrap();
    assert_eq!(view.ack(), 30);
    assert_eq!(view.window(), 300);
    let ts = view.timestamp().unwrap();
    assert_eq!((ts.value, ts.echo), (77, 3));
    assert_eq!(view.payload_len(), 180);

    let ip = Ipv4Packet::new(aggregate.as_bytes()).unwrap();
    let tcp = TcpPacket::new(ip.payload()).unwrap();
    assert_eq!(
        tcp.get_checksum(),
        pnet_packet::tcp::ipv4_checksum(&tcp, &SRC_V4, &DST_V4)
    );
}

#[test]
fn partial_checksum_for_offload() {
    let segs = run(1000, 3, 60);
    let aggregate = aggregate_of(&segs, GroFlags::empty());
    assert!(!aggregate.info().checksum_complete);

    // Folding the pseudo-header sum left in the field together with the
    // segment yields the real checksum.
    let tcp_bytes = &aggregate.as_bytes()[20..];
    let completed = !gro_rs::checksum::checksum(tcp_bytes, 0);
    let tcp = TcpPacket::new(tcp_bytes).unwrap();
    assert_eq!(
        completed,
        pnet_packet::tcp::ipv4_checksum(&tcp, &SRC_V4, &DST_V4)
    );

    let hdr = aggregate.virtio_hdr();
    assert_eq!(
        hdr,
        VirtioNetHdr {
            flags: VIRTIO_NET_HDR_F_NEEDS_CSUM,
            gso_type: VIRTIO_NET_HDR_GSO_TCPV4,
            hdr_len: 40,
            gso_size: 60,
            csum_start: 20,
            csum_offset: 16,
        }
    );
    // The IPv4 header checksum is always complete.
    let ip = Ipv4Packet::new(aggregate.as_bytes()).unwrap();
    assert_eq!(ip.get_checksum(), pnet_packet::ipv4::checksum(&ip));
}

#[test]
fn vnet_bytes_prefix_the_aggregate() {
    let aggregate = aggregate_of(&run(1, 2, 100), GroFlags::empty());
    let bytes = aggregate.to_vnet_bytes().unwrap();
    assert_eq!(bytes.len(), VIRTIO_NET_HDR_LEN + aggregate.len());
    let hdr = VirtioNetHdr::decode(&bytes).unwrap();
    assert_eq!(hdr, aggregate.virtio_hdr());
    assert_eq!(&bytes[VIRTIO_NET_HDR_LEN..], aggregate.as_bytes());

    let single = aggregate_of(&run(1, 1, 100), GroFlags::empty());
    assert_eq!(single.virtio_hdr().gso_type, VIRTIO_NET_HDR_GSO_NONE);
    assert_eq!(single.virtio_hdr().flags, 0);
}

#[test]
fn ipv6_aggregate() {
    let segs: Vec<Seg> = run(50, 3, 80).into_iter().map(Seg::v6).collect();
    assert_eq!(segs[0].headers_len(), 60);
    let aggregate = aggregate_of(&segs, GroFlags::TCP_CHECKSUM);
    assert_eq!(aggregate.len(), 60 + 3 * 80);
    assert_eq!(aggregate.info().ip_version, IpVersion::V6);

    let ip = Ipv6Packet::new(aggregate.as_bytes()).unwrap();
    assert_eq!(ip.get_payload_length() as usize, aggregate.len() - 40);
    let tcp = TcpPacket::new(ip.payload()).unwrap();
    assert_eq!(
        tcp.get_checksum(),
        pnet_packet::tcp::ipv6_checksum(&tcp, &SRC_V6, &DST_V6)
    );
    let hdr = aggregate.virtio_hdr();
    assert_eq!(hdr.gso_type, VIRTIO_NET_HDR_GSO_TCPV6);
    assert_eq!(hdr.csum_start, 40);
}

#[test]
fn vlan_tagged_ethernet_aggregate() {
    for tags in [0, 1, 2] {
        let segs: Vec<Seg> = run(7, 2, 60)
            .into_iter()
            .map(|seg| seg.ethernet(tags))
            .collect();
        let l2 = 14 + 4 * tags;
        let aggregate = aggregate_of(&segs, GroFlags::TCP_CHECKSUM);
        assert_eq!(aggregate.len(), l2 + 40 + 120);
        assert_eq!(aggregate.info().headers_len as usize, l2 + 40);
        assert_eq!(aggregate.info().l4_offset as usize, l2 + 20);
        assert_eq!(&aggregate.as_bytes()[..l2], &segs[0].bytes()[..l2]);

        let ip = Ipv4Packet::new(&aggregate.as_bytes()[l2..]).unwrap();
        assert_eq!(ip.get_total_length(), 160);
        assert_eq!(ip.get_checksum(), pnet_packet::ipv4::checksum(&ip));
        let tcp = TcpPacket::new(ip.payload()).unwrap();
        assert_eq!(
            tcp.get_checksum(),
            pnet_packet::tcp::ipv4_checksum(&tcp, &SRC_V4, &DST_V4)
        );
    }
}

#[test]
fn segment_sizes_and_count_are_logged() {
    let engine = engine();
    let params = AggregationParams::builder()
        .metadata_base(0x8000)
        .build()
        .unwrap();
    let segs = [
        Seg::new(100).payload(60),
        Seg::new(160).payload(60),
        Seg::new(220).payload(30),
    ];
    for seg in &segs {
        engine.aggregate_segment(FLOW, seg.frame(), &params, GroFlags::LOG_SEGMENT_SIZES);
    }
    engine.flush_aggregation(FLOW);

    let metadata = engine.metadata();
    assert_eq!(metadata.segment_count(0x8000), 3);
    assert_eq!(metadata.segment_size(0x8000, 0), 60);
    assert_eq!(metadata.segment_size(0x8000, 1), 60);
    assert_eq!(metadata.segment_size(0x8000, 2), 30);
    assert_eq!(metadata.segment_size(0x8000, 3), 0);
}

#[test]
fn segment_sizes_are_not_logged_by_default() {
    let engine = engine();
    let params = AggregationParams::builder()
        .metadata_base(0x8000)
        .build()
        .unwrap();
    for seg in run(100, 2, 60) {
        engine.aggregate_segment(FLOW, seg.frame(), &params, GroFlags::empty());
    }
    engine.flush_aggregation(FLOW);
    assert_eq!(engine.metadata().segment_count(0x8000), 2);
    assert_eq!(engine.metadata().segment_size(0x8000, 0), 0);
}

#[test]
fn emitted_checksum_patches_incrementally() {
    let segs = run(1000, 3, 60).into_iter().map(|s| s.ack(5)).collect::<Vec<_>>();
    let aggregate = aggregate_of(&segs, GroFlags::TCP_CHECKSUM);
    let mut bytes = aggregate.as_bytes().to_vec();

    // Rewrite the ack of the emitted aggregate the way a forwarding stage would.
    let ack_at = 20 + 8;
    let csum_at = 20 + 16;
    let old_ack = u32::from_be_bytes(bytes[ack_at..ack_at + 4].try_into().unwrap());
    assert_eq!(old_ack, 5);
    bytes[ack_at..ack_at + 4].copy_from_slice(&0xdead_beefu32.to_be_bytes());
    let old_csum = u16::from_be_bytes([bytes[csum_at], bytes[csum_at + 1]]);
    let new_csum = gro_rs::checksum::checksum_update_u32(old_csum, old_ack, 0xdead_beef);
    bytes[csum_at..csum_at + 2].copy_from_slice(&new_csum.to_be_bytes());

    let ip = Ipv4Packet::new(&bytes[..]).unwrap();
    let tcp = TcpPacket::new(ip.payload()).unwrap();
    assert_eq!(tcp.get_acknowledgement(), 0xdead_beef);
    assert_eq!(
        tcp.get_checksum(),
        pnet_packet::tcp::ipv4_checksum(&tcp, &SRC_V4, &DST_V4)
    );
}
