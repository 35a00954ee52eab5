//! Common types shared across the network, transport, diagnostic, VT, file-server, TECU, and NIU
//! modules.

/// An 8-bit J1939 address. `0..=253` are assignable, `254` is the null address (unclaimed),
/// `255` is the broadcast/global address.
pub type Address = u8;

/// The null address: no control function currently claims it.
pub const NULL_ADDRESS: Address = 254;

/// The broadcast/global address.
pub const BROADCAST_ADDRESS: Address = 255;

/// Milliseconds since an arbitrary epoch, advanced only by explicit `update(elapsed_ms)` calls.
pub type Timestamp = u32;

/// Raw CAN frame payload, 0-8 bytes for classic CAN.
pub type FrameData = Vec<u8>;

/// Configuration trait implemented by every component's `*Config` struct.
pub trait Config {
    /// Validate the configuration, returning the first violation found.
    fn validate(&self) -> crate::error::Result<()>;
}

/// Non-blocking CAN driver boundary (spec §6). Implementations must not reorder frames within a
/// (source, destination) pair.
pub trait CanDriver {
    /// Enqueue a frame for transmission. Must not block.
    fn send_frame(&mut self, raw_id: u32, data: &[u8]) -> crate::error::Result<()>;

    /// Non-blocking poll for the next received frame, if any.
    fn poll_frame(&mut self) -> Option<crate::frame::RawFrame>;

    /// Whether the underlying hardware link is currently usable.
    fn valid(&self) -> bool;
}
