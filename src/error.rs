use std::io;

/// Failures reported by the engine's collaborators and configuration layer.
///
/// The aggregation entry points never surface these directly: resource
/// exhaustion is folded into a [`Disposition`](crate::Disposition) and
/// counted. They are visible when driving a collaborator by hand or when
/// building [`AggregationParams`](crate::AggregationParams).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GroError {
    /// The frame pool has no buffer left for the requested store/append.
    #[error("frame buffer pool exhausted")]
    BufferExhausted,
    /// Every timer slot in the pool is in use.
    #[error("no timer slot available in pool {pool}")]
    TimerExhausted { pool: u16 },
    /// The timer pool id was never registered with the timer service.
    #[error("unknown timer pool {0}")]
    UnknownTimerPool(u16),
    /// The handle no longer names an armed timer (deleted, fired or reused).
    #[error("timer is not owned by the caller")]
    TimerNotOwned,
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("invalid aggregation parameters: {0}")]
    InvalidParams(&'static str),
}

impl From<GroError> for io::Error {
    fn from(err: GroError) -> Self {
        let kind = match err {
            GroError::BufferExhausted => io::ErrorKind::OutOfMemory,
            GroError::TimerExhausted { .. } => io::ErrorKind::WouldBlock,
            GroError::UnknownTimerPool(_) => io::ErrorKind::NotFound,
            GroError::TimerNotOwned => io::ErrorKind::PermissionDenied,
            GroError::Malformed(_) | GroError::InvalidParams(_) => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, err)
    }
}
