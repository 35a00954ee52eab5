//! Network manager (module B): owns control functions, the PGN dispatch table, and the
//! address-claim procedure; drives transport-protocol segmentation for payloads over 8 bytes.

pub mod control_function;
pub mod name;

use std::collections::{HashMap, VecDeque};

use crate::error::{IsobusError, Result};
use crate::frame::{Frame, RawFrame};
use crate::transport::TransportProtocol;
use crate::types::{Address, CanDriver, Timestamp, BROADCAST_ADDRESS, NULL_ADDRESS};

pub use control_function::{ClaimState, ControlFunction};
pub use name::Name;

/// PGN of the Request message.
pub const PGN_REQUEST: u32 = 0xEA00;
/// PGN of the Address Claimed / Cannot-Claim message.
pub const PGN_ADDRESS_CLAIMED: u32 = 0xEE00;
/// PGN of the Acknowledgment message.
pub const PGN_ACKNOWLEDGMENT: u32 = 0xE800;

/// A fully decoded incoming or outgoing application message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Parameter Group Number.
    pub pgn: u32,
    /// Message priority, 0 (highest) to 7 (lowest).
    pub priority: u8,
    /// Source address.
    pub source: Address,
    /// Destination address (255 = broadcast).
    pub destination: Address,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Timestamp (simulated milliseconds) at which this message was processed.
    pub timestamp: Timestamp,
}

/// An opaque handle returned by [`NetworkManager::register_pgn_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

/// An opaque handle for an internal control function, indexing into the manager's internal-CF
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFunctionHandle(usize);

struct Subscriber {
    id: u64,
    handler: Box<dyn FnMut(&Message)>,
}

/// Owns internal and observed-external control functions, the PGN dispatch table, and drives
/// address claim plus transport-protocol segmentation. Single-threaded cooperative: all progress
/// happens inside `update(elapsed_ms)` or the synchronous public operations.
pub struct NetworkManager<D: CanDriver> {
    driver: D,
    internal_cfs: Vec<ControlFunction>,
    external_cfs: HashMap<Address, Name>,
    subscribers: HashMap<u32, Vec<Subscriber>>,
    next_subscriber_id: u64,
    outbound: VecDeque<RawFrame>,
    transport: TransportProtocol,
    now_ms: Timestamp,
}

impl<D: CanDriver> NetworkManager<D> {
    /// Create a manager around a concrete (possibly mock) CAN driver.
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            internal_cfs: Vec::new(),
            external_cfs: HashMap::new(),
            subscribers: HashMap::new(),
            next_subscriber_id: 0,
            outbound: VecDeque::new(),
            transport: TransportProtocol::new(),
            now_ms: 0,
        }
    }

    /// Begin an internal control function's address-claim procedure.
    pub fn create_internal(&mut self, name: Name, preferred_address: Address) -> ControlFunctionHandle {
        let mut cf = ControlFunction::new(name, preferred_address);
        cf.begin_claim();
        self.send_address_claim(name, preferred_address);
        self.internal_cfs.push(cf);
        ControlFunctionHandle(self.internal_cfs.len() - 1)
    }

    /// Look up an internal control function by handle.
    pub fn control_function(&self, handle: ControlFunctionHandle) -> &ControlFunction {
        &self.internal_cfs[handle.0]
    }

    /// NAME currently observed claiming `address`, if any (internal or external).
    pub fn resolve_name(&self, address: Address) -> Option<Name> {
        if let Some(name) = self.external_cfs.get(&address) {
            return Some(*name);
        }
        self.internal_cfs
            .iter()
            .find(|cf| cf.state() == ClaimState::Claimed && cf.address() == address)
            .map(|cf| cf.name())
    }

    /// Register a subscriber for a PGN. Subscribers fire in registration order on every matching
    /// incoming message.
    pub fn register_pgn_callback(
        &mut self,
        pgn: u32,
        handler: impl FnMut(&Message) + 'static,
    ) -> SubscriptionHandle {
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;
        self.subscribers.entry(pgn).or_default().push(Subscriber {
            id,
            handler: Box::new(handler),
        });
        SubscriptionHandle(id)
    }

    /// Remove a previously registered subscriber.
    pub fn unregister_pgn_callback(&mut self, handle: SubscriptionHandle) {
        for subs in self.subscribers.values_mut() {
            subs.retain(|s| s.id != handle.0);
        }
    }

    /// Send application data. Single frames go out directly; payloads over 8 bytes are handed to
    /// the transport protocol for segmentation.
    pub fn send(&mut self, pgn: u32, payload: &[u8], from: ControlFunctionHandle, to: Address) -> Result<()> {
        let cf = &self.internal_cfs[from.0];
        if cf.state() != ClaimState::Claimed {
            return Err(IsobusError::InvalidState(
                "control function has not claimed an address".into(),
            ));
        }
        let source = cf.address();

        if payload.len() <= 8 {
            let frame = Frame::from_message(6, pgn, source, to, payload.to_vec());
            self.outbound.push_back(frame.to_raw());
            Ok(())
        } else {
            let frames = self.transport.begin_send(pgn, source, to, payload)?;
            self.outbound.extend(frames);
            Ok(())
        }
    }

    /// Pass a raw frame straight to the driver, bypassing PGN dispatch. Used by test harnesses and
    /// the NIU.
    pub fn send_frame(&mut self, raw: RawFrame) -> Result<()> {
        self.driver
            .send_frame(raw.id, &raw.data)
            .map_err(|e| IsobusError::BusError(e.to_string()))
    }

    /// Deliver a fully decoded message to subscribers without going through the framer. Test only.
    pub fn inject_message(&mut self, message: Message) {
        self.dispatch(&message);
    }

    /// Drive address-claim timers, transport-session timers, and deliver queued frames. This is
    /// the only place time advances; everything else is computed synchronously.
    pub fn update(&mut self, elapsed_ms: u32) {
        self.now_ms = self.now_ms.wrapping_add(elapsed_ms);

        // TP session timers are checked before new frames are accepted (spec §5 ordering).
        let expired = self.transport.update(elapsed_ms);
        self.outbound.extend(expired.outbound_frames);
        for msg in expired.reassembled {
            self.dispatch(&msg);
        }

        for cf in self.internal_cfs.iter_mut() {
            cf.tick(elapsed_ms);
        }

        // Drain the CAN driver's inbound queue, FIFO, before flushing outbound frames.
        while let Some(raw) = self.driver.poll_frame() {
            self.handle_raw_frame(raw);
        }

        while let Some(raw) = self.outbound.pop_front() {
            let _ = self.driver.send_frame(raw.id, &raw.data);
        }
    }

    fn handle_raw_frame(&mut self, raw: RawFrame) {
        let frame = match Frame::from_raw(&raw) {
            Ok(f) => f,
            Err(_) => return,
        };

        match frame.pgn() {
            PGN_ADDRESS_CLAIMED => self.handle_address_claim(&frame),
            crate::transport::PGN_TP_CM | crate::transport::PGN_TP_DT => {
                if let Some(reassembled) = self.transport.handle_frame(&frame) {
                    self.outbound.extend(self.transport.drain_outbound());
                    self.dispatch(&reassembled);
                } else {
                    self.outbound.extend(self.transport.drain_outbound());
                }
            }
            _ => {
                let message = Message {
                    pgn: frame.pgn(),
                    priority: frame.priority(),
                    source: frame.source(),
                    destination: frame.destination(),
                    payload: frame.payload().to_vec(),
                    timestamp: self.now_ms,
                };
                self.dispatch(&message);
            }
        }
    }

    fn handle_address_claim(&mut self, frame: &Frame) {
        if frame.payload().len() < 8 {
            return;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&frame.payload()[0..8]);
        let claimed_name = Name::from(u64::from_le_bytes(bytes));
        let source = frame.source();

        if source == NULL_ADDRESS || source == BROADCAST_ADDRESS {
            return;
        }

        self.external_cfs.insert(source, claimed_name);

        for cf in self.internal_cfs.iter_mut() {
            if cf.state() == ClaimState::Claimed && cf.address() == source {
                match cf.handle_contention(claimed_name) {
                    Some(new_addr) if new_addr != source => {
                        self.outbound.push_back(
                            Frame::from_message(
                                6,
                                PGN_ADDRESS_CLAIMED,
                                new_addr,
                                BROADCAST_ADDRESS,
                                cf.name().raw().to_le_bytes().to_vec(),
                            )
                            .to_raw(),
                        );
                    }
                    None => {
                        self.outbound.push_back(
                            Frame::from_message(
                                6,
                                PGN_ADDRESS_CLAIMED,
                                0xFE,
                                BROADCAST_ADDRESS,
                                cf.name().raw().to_le_bytes().to_vec(),
                            )
                            .to_raw(),
                        );
                    }
                    _ => {}
                }
            }
        }
    }

    fn send_address_claim(&mut self, name: Name, address: Address) {
        let frame = Frame::from_message(
            6,
            PGN_ADDRESS_CLAIMED,
            address,
            BROADCAST_ADDRESS,
            name.raw().to_le_bytes().to_vec(),
        );
        self.outbound.push_back(frame.to_raw());
    }

    fn dispatch(&mut self, message: &Message) {
        if let Some(subs) = self.subscribers.get_mut(&message.pgn) {
            let ids: Vec<u64> = subs.iter().map(|s| s.id).collect();
            for id in ids {
                if let Some(sub) = subs.iter_mut().find(|s| s.id == id) {
                    (sub.handler)(message);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::mock::MockDriver;

    #[test]
    fn subscribers_fire_in_registration_order_on_injected_message() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut nm = NetworkManager::new(MockDriver::new());
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        nm.register_pgn_callback(0x1234, move |_| o1.borrow_mut().push(1));
        let o2 = order.clone();
        nm.register_pgn_callback(0x1234, move |_| o2.borrow_mut().push(2));

        nm.inject_message(Message {
            pgn: 0x1234,
            priority: 6,
            source: 1,
            destination: 255,
            payload: vec![],
            timestamp: 0,
        });

        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn claim_settles_and_address_becomes_available() {
        let mut nm = NetworkManager::new(MockDriver::new());
        let handle = nm.create_internal(Name::from(42), 0x20);
        nm.update(300);
        assert_eq!(nm.control_function(handle).state(), ClaimState::Claimed);
        assert_eq!(nm.control_function(handle).address(), 0x20);
    }

    #[test]
    fn send_before_claim_is_rejected() {
        let mut nm = NetworkManager::new(MockDriver::new());
        let handle = nm.create_internal(Name::from(42), 0x20);
        let result = nm.send(0x1234, &[1, 2, 3], handle, BROADCAST_ADDRESS);
        assert!(matches!(result, Err(IsobusError::InvalidState(_))));
    }
}
