use crate::parse::IpVersion;
use crate::virtio::{
    VirtioNetHdr, VIRTIO_NET_HDR_F_DATA_VALID, VIRTIO_NET_HDR_F_NEEDS_CSUM,
    VIRTIO_NET_HDR_GSO_NONE, VIRTIO_NET_HDR_GSO_TCPV4, VIRTIO_NET_HDR_GSO_TCPV6,
    VIRTIO_NET_HDR_LEN,
};
use crate::Frame;
use bytes::BytesMut;
use std::io;

bitflags::bitflags! {
    /// What the caller must do after an engine entry point returns.
    ///
    /// Several bits can be set at once, e.g. `FLUSH_NOW | NEW_AGGREGATION_STARTED`
    /// when a closed aggregate is emitted and the arriving segment seeded
    /// the next one.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Disposition: u16 {
        /// The segment was absorbed; nothing to emit.
        const AGGREGATED = 1 << 0;
        /// A frame is ready: the finalized aggregate, or the arriving
        /// segment passed through untouched.
        const FLUSH_NOW = 1 << 1;
        /// The arriving segment was dropped for lack of buffer space.
        const SEGMENT_DISCARDED = 1 << 2;
        /// No timer could be armed; the arriving segment must be emitted now.
        const TIMER_UNAVAILABLE = 1 << 3;
        /// Buffer exhaustion destroyed the in-flight aggregate.
        const AGGREGATION_DISCARDED = 1 << 4;
        /// The arriving segment opened a new aggregation.
        const NEW_AGGREGATION_STARTED = 1 << 5;
        /// Explicit flush found nothing to flush.
        const NO_AGGREGATION = 1 << 6;
        /// Explicit flush finalized the aggregate.
        const FLUSH_AGG_DONE = 1 << 7;
        /// The frame was rejected before any flow state was touched.
        const BAD_FRAME = 1 << 8;
    }
}

impl Disposition {
    /// Whether the caller has at least one frame to emit.
    pub fn must_emit(self) -> bool {
        self.intersects(
            Disposition::FLUSH_NOW | Disposition::FLUSH_AGG_DONE | Disposition::TIMER_UNAVAILABLE,
        )
    }
    /// Whether in-flight data was lost.
    pub fn lost_data(self) -> bool {
        self.intersects(Disposition::SEGMENT_DISCARDED | Disposition::AGGREGATION_DISCARDED)
    }
}

/// Shape of a finalized aggregate, enough to describe it to a segmentation
/// offload consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateInfo {
    pub segment_count: u32,
    /// Largest TCP payload among the merged segments.
    pub gso_size: u16,
    /// L2..L4 header length.
    pub headers_len: u16,
    pub l4_offset: u16,
    pub ip_version: IpVersion,
    /// `false` when the TCP checksum field holds only the pseudo-header sum.
    pub checksum_complete: bool,
}

/// A finalized aggregate frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub(crate) frame: Frame,
    pub(crate) info: AggregateInfo,
}

impl Aggregate {
    pub fn frame(&self) -> &Frame {
        &self.frame
    }
    pub fn info(&self) -> &AggregateInfo {
        &self.info
    }
    pub fn segment_count(&self) -> u32 {
        self.info.segment_count
    }
    pub fn len(&self) -> usize {
        self.frame.len()
    }
    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }
    pub fn as_bytes(&self) -> &[u8] {
        self.frame.as_bytes()
    }
    pub fn into_frame(self) -> Frame {
        self.frame
    }

    /// The virtio-net header announcing this aggregate to a consumer that
    /// can re-segment it. Single-segment aggregates get a plain
    /// `GSO_NONE` header.
    pub fn virtio_hdr(&self) -> VirtioNetHdr {
        let info = &self.info;
        if info.segment_count <= 1 {
            return VirtioNetHdr {
                gso_type: VIRTIO_NET_HDR_GSO_NONE,
                ..VirtioNetHdr::default()
            };
        }
        VirtioNetHdr {
            flags: if info.checksum_complete {
                VIRTIO_NET_HDR_F_DATA_VALID
            } else {
                VIRTIO_NET_HDR_F_NEEDS_CSUM
            },
            gso_type: match info.ip_version {
                IpVersion::V4 => VIRTIO_NET_HDR_GSO_TCPV4,
                IpVersion::V6 => VIRTIO_NET_HDR_GSO_TCPV6,
            },
            hdr_len: info.headers_len,
            gso_size: info.gso_size,
            csum_start: info.l4_offset,
            csum_offset: crate::parse::TCP_CHECKSUM_OFFSET as u16,
        }
    }

    /// The aggregate prefixed with its encoded [`VirtioNetHdr`], as written
    /// to a device opened with `IFF_VNET_HDR`.
    pub fn to_vnet_bytes(&self) -> io::Result<BytesMut> {
        let mut buf = BytesMut::zeroed(VIRTIO_NET_HDR_LEN + self.len());
        self.virtio_hdr().encode(&mut buf)?;
        buf[VIRTIO_NET_HDR_LEN..].copy_from_slice(self.as_bytes());
        Ok(buf)
    }
}

/// Result of [`GroEngine::aggregate_segment`](crate::GroEngine::aggregate_segment)
/// and [`GroEngine::flush_aggregation`](crate::GroEngine::flush_aggregation).
#[derive(Debug)]
pub struct GroOutput {
    pub disposition: Disposition,
    /// The finalized aggregate, emitted first.
    pub aggregate: Option<Aggregate>,
    /// The arriving segment handed back: emit it after `aggregate`, unless
    /// the disposition is [`Disposition::BAD_FRAME`] in which case drop it.
    pub segment: Option<Frame>,
}

impl GroOutput {
    pub(crate) fn new(disposition: Disposition) -> Self {
        GroOutput {
            disposition,
            aggregate: None,
            segment: None,
        }
    }

    pub(crate) fn pass_through(disposition: Disposition, segment: Frame) -> Self {
        GroOutput {
            disposition,
            aggregate: None,
            segment: Some(segment),
        }
    }

    /// Output carrying a just-closed aggregate; `closed` is reported when it
    /// survived finalization, [`Disposition::AGGREGATION_DISCARDED`] otherwise.
    pub(crate) fn closed(aggregate: Option<Aggregate>, closed: Disposition) -> Self {
        let disposition = if aggregate.is_some() {
            closed
        } else {
            Disposition::AGGREGATION_DISCARDED
        };
        GroOutput {
            disposition,
            aggregate,
            segment: None,
        }
    }

    /// Frames to emit, in wire order.
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        let segment = if self.disposition.contains(Disposition::BAD_FRAME) {
            None
        } else {
            self.segment.as_ref()
        };
        self.aggregate.iter().map(Aggregate::frame).chain(segment)
    }

    pub fn into_frames(self) -> Vec<Frame> {
        let bad_frame = self.disposition.contains(Disposition::BAD_FRAME);
        let mut frames = Vec::with_capacity(2);
        frames.extend(self.aggregate.map(Aggregate::into_frame));
        if !bad_frame {
            frames.extend(self.segment);
        }
        frames
    }
}

/// Delivered to the completion callback when an aggregation times out.
#[derive(Debug)]
pub struct TimeoutFlush {
    pub context_addr: u64,
    pub aggregate: Aggregate,
    /// The opaque argument registered with the callback.
    pub arg: u64,
}
