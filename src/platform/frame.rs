use crate::GroError;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Link-layer framing of a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkType {
    /// The frame starts at the IP header (TUN-style).
    #[default]
    RawIp,
    /// The frame starts with an Ethernet II header, optionally VLAN tagged.
    Ethernet,
}

/// A frame as handed over by the receive path.
///
/// `error` is the transport-reported error bit: such a frame is rejected
/// by the engine before any flow state is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: BytesMut,
    link: LinkType,
    error: bool,
}

impl Frame {
    /// Wraps a frame that begins with an IPv4 or IPv6 header.
    pub fn ip<B: Into<BytesMut>>(data: B) -> Self {
        Frame {
            data: data.into(),
            link: LinkType::RawIp,
            error: false,
        }
    }
    /// Wraps a frame that begins with an Ethernet II header.
    pub fn ethernet<B: Into<BytesMut>>(data: B) -> Self {
        Frame {
            data: data.into(),
            link: LinkType::Ethernet,
            error: false,
        }
    }
    /// Marks the frame with the transport error bit.
    pub fn with_error(mut self, error: bool) -> Self {
        self.error = error;
        self
    }
    pub fn has_error(&self) -> bool {
        self.error
    }
    pub fn link(&self) -> LinkType {
        self.link
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
    pub fn into_bytes(self) -> BytesMut {
        self.data
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Opaque reference to a frame held by a [`FrameTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle(pub(crate) u64);

/// Frame storage and concatenation service.
///
/// Every operation that needs buffer space may fail with
/// [`GroError::BufferExhausted`].
pub trait FrameTransport: Send + Sync {
    /// Copies `frame` into transport storage.
    fn store(&self, frame: &Frame) -> Result<FrameHandle, GroError>;
    /// Appends `tail[trim_prefix..]` to the stored frame `head` and returns
    /// the new length of `head`.
    fn concatenate(
        &self,
        head: FrameHandle,
        tail: &Frame,
        trim_prefix: usize,
    ) -> Result<usize, GroError>;
    /// Removes a stored frame and hands ownership back.
    fn take(&self, handle: FrameHandle) -> Option<Frame>;
    /// Drops a stored frame.
    fn discard(&self, handle: FrameHandle);
    fn frame_len(&self, handle: FrameHandle) -> Option<usize>;
}

struct PoolInner {
    frames: HashMap<u64, Frame>,
    next_id: u64,
    bytes_in_use: usize,
}

/// Bounded in-memory [`FrameTransport`].
///
/// The pool is limited both by the number of frames it holds and by the
/// total number of bytes across those frames.
pub struct FramePool {
    max_frames: usize,
    byte_budget: usize,
    inner: Mutex<PoolInner>,
}

/// Default number of frames a [`FramePool`] can hold.
pub const DEFAULT_POOL_FRAMES: usize = 4096;
/// Default byte budget of a [`FramePool`].
pub const DEFAULT_POOL_BYTES: usize = 64 * 1024 * 1024;

impl Default for FramePool {
    fn default() -> Self {
        FramePool::new(DEFAULT_POOL_FRAMES, DEFAULT_POOL_BYTES)
    }
}

impl FramePool {
    pub fn new(max_frames: usize, byte_budget: usize) -> Self {
        FramePool {
            max_frames,
            byte_budget,
            inner: Mutex::new(PoolInner {
                frames: HashMap::with_capacity(max_frames.min(DEFAULT_POOL_FRAMES)),
                next_id: 0,
                bytes_in_use: 0,
            }),
        }
    }
    /// Number of frames currently stored.
    pub fn frames_in_use(&self) -> usize {
        self.inner.lock().frames.len()
    }
    /// Number of bytes currently stored.
    pub fn bytes_in_use(&self) -> usize {
        self.inner.lock().bytes_in_use
    }
}

impl FrameTransport for FramePool {
    fn store(&self, frame: &Frame) -> Result<FrameHandle, GroError> {
        let mut inner = self.inner.lock();
        if inner.frames.len() >= self.max_frames
            || inner.bytes_in_use + frame.len() > self.byte_budget
        {
            return Err(GroError::BufferExhausted);
        }
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1);
        inner.bytes_in_use += frame.len();
        inner.frames.insert(id, frame.clone());
        Ok(FrameHandle(id))
    }

    fn concatenate(
        &self,
        head: FrameHandle,
        tail: &Frame,
        trim_prefix: usize,
    ) -> Result<usize, GroError> {
        let extend = tail
            .as_bytes()
            .get(trim_prefix..)
            .ok_or(GroError::Malformed("trim prefix exceeds frame length"))?;
        let mut inner = self.inner.lock();
        if inner.bytes_in_use + extend.len() > self.byte_budget {
            return Err(GroError::BufferExhausted);
        }
        let frame = inner
            .frames
            .get_mut(&head.0)
            .ok_or(GroError::Malformed("unknown frame handle"))?;
        frame.data.extend_from_slice(extend);
        let len = frame.len();
        inner.bytes_in_use += extend.len();
        Ok(len)
    }

    fn take(&self, handle: FrameHandle) -> Option<Frame> {
        let mut inner = self.inner.lock();
        let frame = inner.frames.remove(&handle.0)?;
        inner.bytes_in_use -= frame.len();
        Some(frame)
    }

    fn discard(&self, handle: FrameHandle) {
        drop(self.take(handle));
    }

    fn frame_len(&self, handle: FrameHandle) -> Option<usize> {
        self.inner.lock().frames.get(&handle.0).map(Frame::len)
    }
}
