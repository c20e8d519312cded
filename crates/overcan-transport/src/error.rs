/// Errors surfaced by the public transport surface
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The deadline elapsed before the operation made progress; retry freely
    #[error("timed out")]
    Timeout,
    /// `send` before the node holds an address; connect first
    #[error("transport is not serving yet")]
    InvalidState,
    /// `send` payload exceeds [MAX_PACKET_SIZE](crate::MAX_PACKET_SIZE)
    #[error("payload of {size} bytes exceeds the {max}-byte packet bound")]
    InvalidSize { size: usize, max: usize },
    /// Packet allocation or queue admission failed
    #[error("out of packet memory")]
    OutOfMemory,
    /// The transfer failed on the wire, or re-addressing aborted it; retry after reconnecting
    #[error("transmission failed")]
    Fail,
}
