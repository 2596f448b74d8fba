use super::context::{AggregationContext, ContextFlags};
use super::disposition::{Aggregate, AggregateInfo};
use crate::checksum::{checksum, checksum_update_u16, pseudo_header_checksum_no_fold};
use crate::parse::{self, ParsedHeaders, SegmentTrailer};
use crate::{Frame, GroError};

/// Turns the stored frame of a closing aggregation into the frame that is
/// emitted. Owns the frame while its headers are rewritten so that a
/// half-patched aggregate never becomes visible.
pub(crate) struct AggregateBuilder {
    frame: Frame,
    view: ParsedHeaders,
    segment_count: u32,
    gso_size: u16,
    checksum_complete: bool,
}

impl AggregateBuilder {
    /// Re-parses the stored frame: offsets cached from the segment that
    /// seeded the aggregation are not trusted here.
    pub(crate) fn new(frame: Frame, segment_count: u32, gso_size: u16) -> Result<Self, GroError> {
        let view = parse::parse(&frame)?;
        Ok(AggregateBuilder {
            frame,
            view,
            segment_count,
            gso_size,
            checksum_complete: true,
        })
    }

    /// Finalizes per the context that owned the frame.
    pub(crate) fn finish(frame: Frame, ctx: &AggregationContext) -> Result<Aggregate, GroError> {
        let builder = AggregateBuilder::new(frame, ctx.segment_count, ctx.max_segment_size)?;
        if ctx.segment_count <= 1 {
            // A lone segment leaves exactly as it arrived.
            return Ok(builder.build());
        }
        Ok(builder
            .fix_ip_length()
            .apply_trailer(&ctx.trailer)
            .tcp_checksum(ctx.flags.contains(ContextFlags::TCP_CHECKSUM))
            .build())
    }

    /// Rewrites the IP length field to cover the whole frame and patches the
    /// IPv4 header checksum for the changed field.
    pub(crate) fn fix_ip_length(mut self) -> Self {
        let len = self.frame.len();
        let view = self.view;
        let bytes = self.frame.as_bytes_mut();
        let (old, new) = view.write_ip_length(bytes, len);
        if let Some(csum) = view.ipv4_checksum(bytes) {
            view.write_ipv4_checksum(bytes, checksum_update_u16(csum, old, new));
        }
        self
    }

    pub(crate) fn apply_trailer(mut self, trailer: &SegmentTrailer) -> Self {
        let view = self.view;
        view.write_trailer(self.frame.as_bytes_mut(), trailer);
        self
    }

    /// Writes the complete TCP checksum when `full`, otherwise the folded
    /// pseudo-header sum for a checksum-offload consumer to complete.
    pub(crate) fn tcp_checksum(mut self, full: bool) -> Self {
        let view = self.view;
        let tcp_len = self.frame.len() - view.l4_offset();
        let psum = {
            let (src, dst) = view.addresses(self.frame.as_bytes());
            pseudo_header_checksum_no_fold(libc::IPPROTO_TCP as u8, src, dst, tcp_len as u16)
        };
        let bytes = self.frame.as_bytes_mut();
        let csum = if full {
            view.write_tcp_checksum(bytes, 0);
            !checksum(view.tcp_segment(bytes), psum)
        } else {
            checksum(&[], psum)
        };
        view.write_tcp_checksum(bytes, csum);
        self.checksum_complete = full;
        self
    }

    pub(crate) fn build(self) -> Aggregate {
        Aggregate {
            info: AggregateInfo {
                segment_count: self.segment_count,
                gso_size: self.gso_size,
                headers_len: self.view.headers_len() as u16,
                l4_offset: self.view.l4_offset() as u16,
                ip_version: self.view.ip_version(),
                checksum_complete: self.checksum_complete,
            },
            frame: self.frame,
        }
    }
}
