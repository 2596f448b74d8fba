use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Byte-addressable sink for per-aggregation metadata.
pub trait MetadataSink: Send + Sync {
    fn write(&self, addr: u64, bytes: &[u8]);
}

/// Offset of the final segment count (big-endian `u32`) from a flow's metadata address.
pub const METADATA_SEGMENT_COUNT_OFFSET: u64 = 0;
/// Offset of the first logged segment size (big-endian `u16` each).
pub const METADATA_SEGMENT_SIZES_OFFSET: u64 = 4;

/// Sparse in-memory [`MetadataSink`]; unwritten bytes read as zero.
#[derive(Default)]
pub struct MetadataMemory {
    bytes: Mutex<BTreeMap<u64, u8>>,
}

impl MetadataMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let bytes = self.bytes.lock();
        (0..len as u64)
            .map(|i| bytes.get(&addr.wrapping_add(i)).copied().unwrap_or(0))
            .collect()
    }

    /// Final segment count written for the flow whose metadata lives at `base`.
    pub fn segment_count(&self, base: u64) -> u32 {
        BigEndian::read_u32(&self.read(base + METADATA_SEGMENT_COUNT_OFFSET, 4))
    }

    /// The `index`-th logged segment size of the flow at `base`.
    pub fn segment_size(&self, base: u64, index: u16) -> u16 {
        let addr = base + METADATA_SEGMENT_SIZES_OFFSET + 2 * index as u64;
        BigEndian::read_u16(&self.read(addr, 2))
    }
}

impl MetadataSink for MetadataMemory {
    fn write(&self, addr: u64, data: &[u8]) {
        let mut bytes = self.bytes.lock();
        for (i, byte) in data.iter().enumerate() {
            bytes.insert(addr.wrapping_add(i as u64), *byte);
        }
    }
}
