use byteorder::{ByteOrder, NativeEndian};
use std::io;

/// GSO type: not a GSO frame.
pub const VIRTIO_NET_HDR_GSO_NONE: u8 = 0;
/// Flag: the checksum at `csum_start + csum_offset` holds only the
/// pseudo-header sum and must be completed downstream.
pub const VIRTIO_NET_HDR_F_NEEDS_CSUM: u8 = 1;
/// Flag: the checksum has been verified and is complete.
pub const VIRTIO_NET_HDR_F_DATA_VALID: u8 = 2;
/// GSO type: IPv4 TCP.
pub const VIRTIO_NET_HDR_GSO_TCPV4: u8 = 1;
/// GSO type: IPv6 TCP.
pub const VIRTIO_NET_HDR_GSO_TCPV6: u8 = 4;

/// Size of the virtio network header in bytes (12 bytes).
pub const VIRTIO_NET_HDR_LEN: usize = 12;

/// Virtio network header describing a coalesced frame to a consumer that
/// can re-segment it (a TUN/TAP device with `IFF_VNET_HDR`, a virtio NIC).
///
/// Layout matches `struct virtio_net_hdr` from
/// <https://github.com/torvalds/linux/blob/master/include/uapi/linux/virtio_net.h>,
/// multi-byte fields in native endianness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    // Ethernet + IP + tcp hdrs
    pub hdr_len: u16,
    // Bytes to append to hdr_len per frame
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
}

impl VirtioNetHdr {
    /// Decodes a header from the first [`VIRTIO_NET_HDR_LEN`] bytes of `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is too short.
    pub fn decode(buf: &[u8]) -> io::Result<VirtioNetHdr> {
        if buf.len() < VIRTIO_NET_HDR_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "too short"));
        }
        Ok(VirtioNetHdr {
            flags: buf[0],
            gso_type: buf[1],
            hdr_len: NativeEndian::read_u16(&buf[2..4]),
            gso_size: NativeEndian::read_u16(&buf[4..6]),
            csum_start: NativeEndian::read_u16(&buf[6..8]),
            csum_offset: NativeEndian::read_u16(&buf[8..10]),
        })
    }

    /// Encodes this header into the first [`VIRTIO_NET_HDR_LEN`] bytes of `buf`.
    ///
    /// The two trailing bytes (`num_buffers` of the mergeable-buffer variant)
    /// are zeroed.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is too short.
    pub fn encode(&self, buf: &mut [u8]) -> io::Result<()> {
        if buf.len() < VIRTIO_NET_HDR_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "too short"));
        }
        buf[0] = self.flags;
        buf[1] = self.gso_type;
        NativeEndian::write_u16(&mut buf[2..4], self.hdr_len);
        NativeEndian::write_u16(&mut buf[4..6], self.gso_size);
        NativeEndian::write_u16(&mut buf[6..8], self.csum_start);
        NativeEndian::write_u16(&mut buf[8..10], self.csum_offset);
        buf[10] = 0;
        buf[11] = 0;
        Ok(())
    }
}
