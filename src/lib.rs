//! ISO 11783 (ISOBUS) / SAE J1939 protocol engine for agricultural equipment.
//!
//! Address claiming, multi-frame transport, diagnostics, virtual-terminal object pools, the
//! ISO 11783-13 file server/client, tractor-ECU facility coordination, network interconnect
//! bridging, and the safety policy engine. The core is single-threaded cooperative: every
//! stateful component exposes `update(elapsed_ms)` and never blocks internally.

pub mod diagnostics;
pub mod error;
pub mod event;
pub mod frame;
pub mod fs;
pub mod network;
pub mod niu;
pub mod physical;
pub mod safety;
pub mod tecu;
pub mod transport;
pub mod types;
pub mod vt;

pub use error::{IsobusError, Result};
pub use event::{Event, StateMachine};
pub use frame::{Frame, RawFrame};
pub use network::{ControlFunction, Message, Name, NetworkManager};
pub use niu::NetworkInterconnectUnit;
pub use safety::SafetyPolicyEngine;
pub use tecu::TractorECU;
pub use types::{Address, CanDriver, Config, Timestamp, BROADCAST_ADDRESS, NULL_ADDRESS};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_valid() {
        assert!(!VERSION.is_empty());
    }
}
