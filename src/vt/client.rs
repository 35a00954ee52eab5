//! VT client connection state machine: status wait, object-pool upload, and pool swap.

use crate::event::{Event, StateMachine};
use crate::network::Message;
use crate::types::{Address, Result};
use crate::vt::objects::ObjectPool;

pub const PGN_VT_TO_ECU: u32 = 0xE600;
pub const PGN_ECU_TO_VT: u32 = 0xE700;

const CMD_VT_STATUS: u8 = 0xFE;
const CMD_OBJECT_POOL_TRANSFER: u8 = 0x11;
const CMD_END_OF_OBJECT_POOL: u8 = 0x12;
const CMD_END_OF_OBJECT_POOL_RESPONSE: u8 = 0x12;

const DEFAULT_STATUS_TIMEOUT_MS: u32 = 3000;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VtClientState {
    Disconnected,
    WaitingForStatus,
    Uploading,
    Ready,
    ReloadPool,
}

/// Drives the upload/reload handshake with a Virtual Terminal.
pub struct VtClient {
    state: StateMachine<VtClientState>,
    vt_address: Option<Address>,
    status_timer_ms: u32,
    status_timeout_ms: u32,
    pending_store_label: Option<String>,

    pub on_state_changed: Event<VtClientState>,
    pub on_upload_failed: Event<u8>,
}

impl Default for VtClient {
    fn default() -> Self {
        Self::new()
    }
}

impl VtClient {
    pub fn new() -> Self {
        Self {
            state: StateMachine::new(VtClientState::Disconnected),
            vt_address: None,
            status_timer_ms: 0,
            status_timeout_ms: DEFAULT_STATUS_TIMEOUT_MS,
            pending_store_label: None,
            on_state_changed: Event::new(),
            on_upload_failed: Event::new(),
        }
    }

    pub fn with_status_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.status_timeout_ms = timeout_ms;
        self
    }

    pub fn state(&self) -> VtClientState {
        self.state.state()
    }

    pub fn vt_address(&self) -> Option<Address> {
        self.vt_address
    }

    /// Begin waiting for a VT-Status broadcast from `vt_address`.
    pub fn connect(&mut self, vt_address: Address) {
        self.vt_address = Some(vt_address);
        self.status_timer_ms = 0;
        self.transition(VtClientState::WaitingForStatus);
    }

    /// Swap the active pool for a new one. Only valid while [`VtClientState::Ready`].
    /// Caller is responsible for having persisted `pool` under `old_label` first if
    /// `store_old` semantics are desired; this only gates the transition and returns the
    /// upload frames.
    pub fn swap_pool(&mut self, pool: &ObjectPool, store_old_label: Option<String>) -> Result<Vec<(u32, Vec<u8>)>> {
        if self.state() != VtClientState::Ready {
            return Err(crate::error::IsobusError::InvalidState(
                "pool swap is only valid while ready".into(),
            ));
        }
        if pool.objects.is_empty() {
            return Err(crate::error::IsobusError::InvalidArgument("new pool is empty".into()));
        }
        self.pending_store_label = store_old_label;
        self.status_timer_ms = 0;
        self.transition(VtClientState::ReloadPool);
        Ok(self.upload_frames(pool))
    }

    fn upload_frames(&self, pool: &ObjectPool) -> Vec<(u32, Vec<u8>)> {
        let mut frames = Vec::new();
        let serialized = pool.serialize();
        let mut transfer = vec![CMD_OBJECT_POOL_TRANSFER];
        transfer.extend_from_slice(&serialized);
        frames.push((PGN_ECU_TO_VT, transfer));
        frames.push((PGN_ECU_TO_VT, vec![CMD_END_OF_OBJECT_POOL]));
        frames
    }

    /// Handle an inbound VT-to-ECU message, returning any outbound upload frames this
    /// triggers (e.g. beginning upload once the expected VT-Status arrives).
    pub fn handle_message(&mut self, msg: &Message, pool: &ObjectPool) -> Vec<(u32, Vec<u8>)> {
        if msg.pgn != PGN_VT_TO_ECU || msg.payload.is_empty() {
            return Vec::new();
        }
        if self.vt_address != Some(msg.source) {
            return Vec::new();
        }
        match msg.payload[0] {
            CMD_VT_STATUS if self.state() == VtClientState::WaitingForStatus => {
                self.status_timer_ms = 0;
                self.transition(VtClientState::Uploading);
                self.upload_frames(pool)
            }
            CMD_VT_STATUS => {
                self.status_timer_ms = 0;
                Vec::new()
            }
            CMD_END_OF_OBJECT_POOL_RESPONSE
                if matches!(self.state(), VtClientState::Uploading | VtClientState::ReloadPool) =>
            {
                self.status_timer_ms = 0;
                let error_code = msg.payload.get(1).copied().unwrap_or(0);
                if error_code == 0 {
                    self.transition(VtClientState::Ready);
                } else {
                    self.on_upload_failed.emit(error_code);
                    self.transition(VtClientState::Disconnected);
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Advance the status-timeout watchdog; any state but `Disconnected` reverts to it once
    /// no VT activity has been observed for `status_timeout_ms`.
    pub fn update(&mut self, elapsed_ms: u32) {
        if self.state() == VtClientState::Disconnected {
            return;
        }
        self.status_timer_ms += elapsed_ms;
        if self.status_timer_ms >= self.status_timeout_ms {
            self.transition(VtClientState::Disconnected);
        }
    }

    fn transition(&mut self, new_state: VtClientState) {
        self.state.transition(new_state);
        self.on_state_changed.emit(new_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vt::objects::{ObjectType, VtObject};

    fn sample_pool() -> ObjectPool {
        let mut pool = ObjectPool::new("TESTLBL".to_string());
        pool.push(VtObject::new(0, ObjectType::WorkingSet, vec![], vec![1]));
        pool.push(VtObject::new(1, ObjectType::DataMask, vec![], vec![]));
        pool
    }

    fn vt_message(source: Address, payload: Vec<u8>) -> Message {
        Message {
            pgn: PGN_VT_TO_ECU,
            priority: 6,
            source,
            destination: 0x20,
            payload,
            timestamp: 0,
        }
    }

    #[test]
    fn connect_then_status_moves_to_uploading_and_emits_frames() {
        let mut client = VtClient::new();
        client.connect(0x26);
        let pool = sample_pool();
        let frames = client.handle_message(&vt_message(0x26, vec![CMD_VT_STATUS]), &pool);
        assert_eq!(client.state(), VtClientState::Uploading);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn successful_end_of_pool_ack_reaches_ready() {
        let mut client = VtClient::new();
        client.connect(0x26);
        let pool = sample_pool();
        client.handle_message(&vt_message(0x26, vec![CMD_VT_STATUS]), &pool);
        client.handle_message(&vt_message(0x26, vec![CMD_END_OF_OBJECT_POOL_RESPONSE, 0]), &pool);
        assert_eq!(client.state(), VtClientState::Ready);
    }

    #[test]
    fn failed_end_of_pool_ack_disconnects() {
        let mut client = VtClient::new();
        client.connect(0x26);
        let pool = sample_pool();
        client.handle_message(&vt_message(0x26, vec![CMD_VT_STATUS]), &pool);
        client.handle_message(&vt_message(0x26, vec![CMD_END_OF_OBJECT_POOL_RESPONSE, 7]), &pool);
        assert_eq!(client.state(), VtClientState::Disconnected);
    }

    #[test]
    fn status_timeout_disconnects_from_any_state() {
        let mut client = VtClient::new().with_status_timeout_ms(100);
        client.connect(0x26);
        client.update(150);
        assert_eq!(client.state(), VtClientState::Disconnected);
    }

    #[test]
    fn swap_pool_rejected_unless_ready() {
        let mut client = VtClient::new();
        client.connect(0x26);
        let pool = sample_pool();
        assert!(client.swap_pool(&pool, None).is_err());
    }

    #[test]
    fn swap_pool_rejects_empty_pool() {
        let mut client = VtClient::new();
        client.connect(0x26);
        let pool = sample_pool();
        client.handle_message(&vt_message(0x26, vec![CMD_VT_STATUS]), &pool);
        client.handle_message(&vt_message(0x26, vec![CMD_END_OF_OBJECT_POOL_RESPONSE, 0]), &pool);
        let empty = ObjectPool::new("EMPTY".to_string());
        assert!(client.swap_pool(&empty, None).is_err());
    }
}
