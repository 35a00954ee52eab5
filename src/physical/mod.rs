//! CAN driver boundary consumed by [`crate::network::NetworkManager`].
//!
//! The engine never talks to hardware directly; it is generic over
//! [`crate::types::CanDriver`], a minimal send/poll boundary. Production code plugs in a real
//! SocketCAN/J2534/etc adapter; tests use [`mock::MockDriver`].

pub mod mock;
