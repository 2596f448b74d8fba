use byteorder::{BigEndian, ByteOrder};

/// Accumulates `b` as a sequence of big-endian u32 words into a 64-bit
/// one's-complement accumulator without folding.
///
/// A trailing odd byte is treated as the high byte of a 16-bit word (RFC 1071).
pub fn checksum_no_fold(b: &[u8], initial: u64) -> u64 {
    let mut accumulator = initial;
    let mut words = b.chunks_exact(4);
    for word in &mut words {
        accumulator += BigEndian::read_u32(word) as u64;
    }
    let rest = words.remainder();
    let mut rest = rest.chunks_exact(2);
    for half in &mut rest {
        accumulator += BigEndian::read_u16(half) as u64;
    }
    if let Some(&byte) = rest.remainder().first() {
        accumulator += (byte as u64) << 8;
    }
    accumulator
}

fn fold(mut accumulator: u64) -> u16 {
    while accumulator > 0xFFFF {
        accumulator = (accumulator >> 16) + (accumulator & 0xFFFF);
    }
    accumulator as u16
}

/// Folds the accumulated sum of `b` into the 16-bit internet checksum sum.
///
/// The caller complements the result before writing it into a header.
pub fn checksum(b: &[u8], initial: u64) -> u16 {
    fold(checksum_no_fold(b, initial))
}

/// Accumulator for a TCP/UDP pseudo-header: `{src, dst, 0, protocol, len}`.
pub fn pseudo_header_checksum_no_fold(
    protocol: u8,
    src_addr: &[u8],
    dst_addr: &[u8],
    total_len: u16,
) -> u64 {
    let sum = checksum_no_fold(src_addr, 0);
    let sum = checksum_no_fold(dst_addr, sum);
    let len = total_len.to_be_bytes();
    checksum_no_fold(&[0, protocol, len[0], len[1]], sum)
}

/// Incrementally patches a stored checksum after a covered 16-bit field
/// changed from `old` to `new` (RFC 1624, eqn. 3).
pub fn checksum_update_u16(csum: u16, old: u16, new: u16) -> u16 {
    let sum = (!csum) as u64 + (!old) as u64 + new as u64;
    !fold(sum)
}

/// Same as [`checksum_update_u16`] for a 32-bit covered field.
pub fn checksum_update_u32(csum: u16, old: u32, new: u32) -> u16 {
    let csum = checksum_update_u16(csum, (old >> 16) as u16, (new >> 16) as u16);
    checksum_update_u16(csum, old as u16, new as u16)
}
