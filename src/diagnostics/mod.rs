//! Diagnostic protocol (module D): DM1/DM2/DM3/DM5/DM11/DM13/DM20/DM22/DM25.
//!
//! This is a standalone, cooperatively-ticked component: it does not own a network manager
//! reference. Callers wire it up by registering [`DiagnosticProtocol::handle_message`] against
//! the PGNs below and feeding outgoing frames produced by `update`/`handle_message` back through
//! [`crate::network::NetworkManager::send`].

pub mod dtc;

use std::collections::HashMap;

pub use dtc::{
    Dm20Response, Dtc, DiagnosticLamps, Fmi, FreezeFrame, LampFlash, LampStatus, MonitorPerformanceRatio,
    SpnSnapshot,
};

use crate::types::Timestamp;

/// DM1 — active DTCs, broadcast.
pub const PGN_DM1: u32 = 0xFECA;
/// DM2 — previously-active DTCs.
pub const PGN_DM2: u32 = 0xFECB;
/// DM3 — clear previously-active.
pub const PGN_DM3: u32 = 0xFECC;
/// DM5 — diagnostic-protocol identification.
pub const PGN_DM5: u32 = 0xFED5;
/// DM11 — clear all active.
pub const PGN_DM11: u32 = 0xFED3;
/// DM13 — stop/start broadcast.
pub const PGN_DM13: u32 = 0xFED4;
/// DM20 — performance ratios.
pub const PGN_DM20: u32 = 0xC200;
/// DM22 — clear individual DTC.
pub const PGN_DM22: u32 = 0xC300;
/// DM25 — expanded freeze frame.
pub const PGN_DM25: u32 = 0xD600;

/// Bitmask of supported non-J1939 diagnostic protocols (DM5 body, ISO 11783-12 B.5/A.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticProtocolId {
    pub protocols: u8,
}

impl Default for DiagnosticProtocolId {
    fn default() -> Self {
        Self { protocols: 0x01 } // J1939-73
    }
}

impl DiagnosticProtocolId {
    pub fn encode(&self) -> Vec<u8> {
        let mut data = vec![0xFFu8; 8];
        data[0] = self.protocols;
        data
    }

    pub fn decode(data: &[u8]) -> Self {
        Self {
            protocols: data.first().copied().unwrap_or(0),
        }
    }
}

/// DM13 hold/resume control (one message, independent per-DM1/DM2/DM3 signal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dm13Command {
    SuspendBroadcast = 0,
    ResumeBroadcast = 1,
    Undefined = 2,
    DoNotCare = 3,
}

impl Dm13Command {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Dm13Command::SuspendBroadcast,
            1 => Dm13Command::ResumeBroadcast,
            2 => Dm13Command::Undefined,
            _ => Dm13Command::DoNotCare,
        }
    }
}

/// The per-message suspend/resume signals carried by one DM13 frame.
#[derive(Debug, Clone, Copy)]
pub struct Dm13Signals {
    pub dm1_signal: Dm13Command,
    pub dm2_signal: Dm13Command,
    pub dm3_signal: Dm13Command,
    pub suspend_duration_s: u16,
}

impl Dm13Signals {
    pub fn decode(data: &[u8]) -> Self {
        let byte0 = data.first().copied().unwrap_or(0xFF);
        let suspend_duration_s = if data.len() >= 4 {
            u16::from_le_bytes([data[2], data[3]])
        } else {
            0xFFFF
        };
        Self {
            dm1_signal: Dm13Command::from_bits(byte0),
            dm2_signal: Dm13Command::from_bits(byte0 >> 2),
            dm3_signal: Dm13Command::from_bits(byte0 >> 4),
            suspend_duration_s,
        }
    }
}

/// DM22 clear-individual-DTC control codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dm22Control {
    ClearPreviouslyActive = 0x01,
    ClearActive = 0x02,
    AckClearPreviouslyActive = 0x11,
    AckClearActive = 0x12,
    NackClearPreviouslyActive = 0x21,
    NackClearActive = 0x22,
}

/// DM22 negative-acknowledgment reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dm22NackReason {
    GeneralNack = 0x00,
    AccessDenied = 0x01,
    UnknownDtc = 0x02,
    DtcNoLongerActive = 0x03,
    DtcNoLongerPrevious = 0x04,
}

/// Product identification (make/model/serial), `*`-delimited ASCII on the wire.
#[derive(Debug, Clone, Default)]
pub struct ProductIdentification {
    pub make: String,
    pub model: String,
    pub serial_number: String,
}

impl ProductIdentification {
    pub fn encode(&self) -> Vec<u8> {
        format!("{}*{}*{}*", self.make, self.model, self.serial_number).into_bytes()
    }

    pub fn decode(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        let mut fields = text.split('*');
        Self {
            make: fields.next().unwrap_or_default().to_string(),
            model: fields.next().unwrap_or_default().to_string(),
            serial_number: fields.next().unwrap_or_default().to_string(),
        }
    }
}

/// Software identification: a count-prefixed, `*`-delimited list of version strings.
#[derive(Debug, Clone, Default)]
pub struct SoftwareIdentification {
    pub versions: Vec<String>,
}

impl SoftwareIdentification {
    pub fn encode(&self) -> Vec<u8> {
        let mut data = vec![self.versions.len() as u8];
        for version in &self.versions {
            data.extend_from_slice(version.as_bytes());
            data.push(b'*');
        }
        data
    }

    pub fn decode(data: &[u8]) -> Self {
        if data.is_empty() {
            return Self::default();
        }
        let count = data[0] as usize;
        let text = String::from_utf8_lossy(&data[1..]);
        let versions: Vec<String> = text
            .split('*')
            .filter(|s| !s.is_empty())
            .take(count)
            .map(String::from)
            .collect();
        Self { versions }
    }
}

/// Behaviour knobs for [`DiagnosticProtocol`].
#[derive(Debug, Clone)]
pub struct DiagnosticConfig {
    pub dm1_interval_ms: u32,
    pub auto_send: bool,
    pub max_freeze_frames_per_dtc: u8,
    pub auto_capture_freeze_frames: bool,
}

impl Default for DiagnosticConfig {
    fn default() -> Self {
        Self {
            dm1_interval_ms: 1000,
            auto_send: false,
            max_freeze_frames_per_dtc: 3,
            auto_capture_freeze_frames: true,
        }
    }
}

impl crate::types::Config for DiagnosticConfig {
    fn validate(&self) -> crate::error::Result<()> {
        if self.max_freeze_frames_per_dtc == 0 {
            return Err(crate::error::IsobusError::InvalidArgument(
                "max_freeze_frames_per_dtc must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Owns active/previously-active DTC lists, freeze-frame storage, lamp state, and DM13
/// suspend timers. `update(elapsed_ms)` advances broadcast and suspend timers and returns any
/// frames to send; `handle_message` processes an inbound diagnostic PGN and returns the reply (if
/// any) plus any events worth surfacing to the caller.
pub struct DiagnosticProtocol {
    config: DiagnosticConfig,
    active: Vec<Dtc>,
    previously_active: Vec<Dtc>,
    lamps: DiagnosticLamps,
    freeze_frames: HashMap<u32, Vec<FreezeFrame>>,
    dm1_suspend_remaining_ms: Option<u32>,
    dm2_suspend_remaining_ms: Option<u32>,
    dm1_timer_ms: u32,
    now_ms: Timestamp,
}

/// Outcome of feeding one message or tick into the protocol.
#[derive(Debug, Default)]
pub struct DiagnosticOutcome {
    /// (pgn, payload) pairs to transmit.
    pub outbound: Vec<(u32, Vec<u8>)>,
}

impl DiagnosticProtocol {
    pub fn new(config: DiagnosticConfig) -> Self {
        Self {
            config,
            active: Vec::new(),
            previously_active: Vec::new(),
            lamps: DiagnosticLamps::default(),
            freeze_frames: HashMap::new(),
            dm1_suspend_remaining_ms: None,
            dm2_suspend_remaining_ms: None,
            dm1_timer_ms: 0,
            now_ms: 0,
        }
    }

    /// Currently active DTCs.
    pub fn active_dtcs(&self) -> &[Dtc] {
        &self.active
    }

    /// DTCs that were previously active and have since cleared.
    pub fn previously_active_dtcs(&self) -> &[Dtc] {
        &self.previously_active
    }

    /// Activate a DTC: inserts with occurrence count 1, or bumps the count if (SPN, FMI) already
    /// active. Captures a freeze frame on activation if auto-capture is enabled.
    pub fn set_active(&mut self, spn: u32, fmi: Fmi, snapshots: Vec<SpnSnapshot>) {
        if let Some(existing) = self.active.iter_mut().find(|d| d.spn == spn && d.fmi == fmi) {
            existing.bump();
            return;
        }
        let dtc = Dtc::new(spn, fmi);
        if self.config.auto_capture_freeze_frames {
            self.capture_freeze_frame(dtc, snapshots);
        }
        log::info!("DTC activated: SPN {} FMI {:?}", spn, fmi);
        self.active.push(dtc);
    }

    /// Clear an active DTC, moving it to the previously-active list with its occurrence count
    /// preserved.
    pub fn clear_active(&mut self, spn: u32, fmi: Fmi) -> bool {
        if let Some(pos) = self.active.iter().position(|d| d.spn == spn && d.fmi == fmi) {
            let dtc = self.active.remove(pos);
            self.previously_active.push(dtc);
            true
        } else {
            false
        }
    }

    /// Clear all active DTCs (DM11), moving each to previously-active.
    pub fn clear_all_active(&mut self) {
        let cleared: Vec<Dtc> = self.active.drain(..).collect();
        self.previously_active.extend(cleared);
    }

    /// Clear the previously-active list (DM3).
    pub fn clear_previously_active(&mut self) {
        self.previously_active.clear();
    }

    fn capture_freeze_frame(&mut self, dtc: Dtc, snapshots: Vec<SpnSnapshot>) {
        let frames = self.freeze_frames.entry(dtc.key()).or_default();
        frames.insert(
            0,
            FreezeFrame {
                dtc,
                timestamp_ms: self.now_ms,
                snapshots,
            },
        );
        while frames.len() > self.config.max_freeze_frames_per_dtc as usize {
            frames.pop();
        }
    }

    /// Freeze frames stored for a given DTC, frame 0 = most recent.
    pub fn freeze_frames_for(&self, spn: u32, fmi: Fmi) -> &[FreezeFrame] {
        let key = (spn << 8) | fmi.code() as u32;
        self.freeze_frames.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Encode the current DM1 payload (active DTCs + lamp status).
    pub fn encode_dm1(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(2 + self.active.len() * 4);
        data.extend_from_slice(&self.lamps.encode());
        for dtc in &self.active {
            data.extend_from_slice(&dtc.encode());
        }
        if data.len() < 8 {
            data.resize(8, 0x00);
        }
        data
    }

    /// Process a DM13 frame, applying suspend/resume state to DM1/DM2 broadcast.
    pub fn handle_dm13(&mut self, payload: &[u8]) {
        let signals = Dm13Signals::decode(payload);
        let duration = if signals.suspend_duration_s == 0xFFFF {
            None
        } else {
            Some(signals.suspend_duration_s as u32)
        };
        let duration_ms = duration.map(|s| s.saturating_mul(1000));
        match signals.dm1_signal {
            Dm13Command::SuspendBroadcast => self.dm1_suspend_remaining_ms = Some(duration_ms.unwrap_or(u32::MAX)),
            Dm13Command::ResumeBroadcast => self.dm1_suspend_remaining_ms = None,
            _ => {}
        }
        match signals.dm2_signal {
            Dm13Command::SuspendBroadcast => self.dm2_suspend_remaining_ms = Some(duration_ms.unwrap_or(u32::MAX)),
            Dm13Command::ResumeBroadcast => self.dm2_suspend_remaining_ms = None,
            _ => {}
        }
    }

    /// Process a DM22 individual-clear request, returning the ack/nack control byte and (for a
    /// previously-active clear) the freed DTC.
    pub fn handle_dm22(&mut self, payload: &[u8]) -> Vec<u8> {
        if payload.len() < 4 {
            return vec![Dm22Control::NackClearActive as u8, Dm22NackReason::GeneralNack as u8];
        }
        let control = payload[0];
        let dtc = Dtc::decode(&payload[1..]);

        if control == Dm22Control::ClearActive as u8 {
            if self.clear_active(dtc.spn, dtc.fmi) {
                vec![Dm22Control::AckClearActive as u8]
            } else {
                vec![
                    Dm22Control::NackClearActive as u8,
                    Dm22NackReason::UnknownDtc as u8,
                ]
            }
        } else if control == Dm22Control::ClearPreviouslyActive as u8 {
            if let Some(pos) = self
                .previously_active
                .iter()
                .position(|d| d.spn == dtc.spn && d.fmi == dtc.fmi)
            {
                self.previously_active.remove(pos);
                vec![Dm22Control::AckClearPreviouslyActive as u8]
            } else {
                vec![
                    Dm22Control::NackClearPreviouslyActive as u8,
                    Dm22NackReason::UnknownDtc as u8,
                ]
            }
        } else {
            vec![Dm22Control::NackClearActive as u8, Dm22NackReason::GeneralNack as u8]
        }
    }

    /// Build this node's own DM20 performance-ratio response.
    pub fn encode_dm20(&self, response: &Dm20Response) -> Vec<u8> {
        response.encode()
    }

    /// Advance broadcast timers. Auto-resume fires when a suspend's scheduled duration elapses;
    /// an indefinite suspend (`u32::MAX`) never auto-resumes.
    pub fn update(&mut self, elapsed_ms: u32) -> DiagnosticOutcome {
        self.now_ms = self.now_ms.wrapping_add(elapsed_ms);
        let mut outcome = DiagnosticOutcome::default();

        if let Some(remaining) = self.dm1_suspend_remaining_ms.as_mut() {
            if *remaining != u32::MAX {
                if elapsed_ms >= *remaining {
                    self.dm1_suspend_remaining_ms = None;
                } else {
                    *remaining -= elapsed_ms;
                }
            }
        }
        if let Some(remaining) = self.dm2_suspend_remaining_ms.as_mut() {
            if *remaining != u32::MAX {
                if elapsed_ms >= *remaining {
                    self.dm2_suspend_remaining_ms = None;
                } else {
                    *remaining -= elapsed_ms;
                }
            }
        }

        if self.config.auto_send && self.dm1_suspend_remaining_ms.is_none() {
            self.dm1_timer_ms += elapsed_ms;
            if self.dm1_timer_ms >= self.config.dm1_interval_ms {
                self.dm1_timer_ms = 0;
                outcome.outbound.push((PGN_DM1, self.encode_dm1()));
            }
        }

        outcome
    }

    /// Whether DM1 broadcast is currently suspended.
    pub fn dm1_suspended(&self) -> bool {
        self.dm1_suspend_remaining_ms.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_active_twice_increments_occurrence_count() {
        let mut proto = DiagnosticProtocol::new(DiagnosticConfig::default());
        proto.set_active(100, Fmi::Erratic, vec![]);
        proto.set_active(100, Fmi::Erratic, vec![]);
        assert_eq!(proto.active_dtcs().len(), 1);
        assert_eq!(proto.active_dtcs()[0].occurrence_count, 2);
    }

    #[test]
    fn clear_active_moves_to_previously_active_preserving_count() {
        let mut proto = DiagnosticProtocol::new(DiagnosticConfig::default());
        proto.set_active(200, Fmi::VoltageLow, vec![]);
        proto.set_active(200, Fmi::VoltageLow, vec![]);
        assert!(proto.clear_active(200, Fmi::VoltageLow));
        assert!(proto.active_dtcs().is_empty());
        assert_eq!(proto.previously_active_dtcs()[0].occurrence_count, 2);
    }

    #[test]
    fn freeze_frame_depth_is_bounded_fifo() {
        let mut config = DiagnosticConfig::default();
        config.max_freeze_frames_per_dtc = 2;
        let mut proto = DiagnosticProtocol::new(config);
        for i in 0..4u32 {
            proto.clear_active(1, Fmi::Erratic); // no-op, just advancing state
            proto.set_active(1, Fmi::Erratic, vec![SpnSnapshot { spn: 1, value: i }]);
            proto.clear_active(1, Fmi::Erratic);
        }
        proto.set_active(1, Fmi::Erratic, vec![SpnSnapshot { spn: 1, value: 99 }]);
        let frames = proto.freeze_frames_for(1, Fmi::Erratic);
        assert!(frames.len() <= 2);
    }

    #[test]
    fn dm13_indefinite_suspend_does_not_auto_resume() {
        let mut proto = DiagnosticProtocol::new(DiagnosticConfig::default());
        proto.handle_dm13(&[0x01, 0xFF, 0xFF, 0xFF]);
        assert!(proto.dm1_suspended());
        proto.update(10_000_000);
        assert!(proto.dm1_suspended());
    }

    #[test]
    fn dm13_timed_suspend_auto_resumes() {
        let mut proto = DiagnosticProtocol::new(DiagnosticConfig::default());
        proto.handle_dm13(&[0x01, 0xFF, 0x02, 0x00]); // 2 second suspend
        assert!(proto.dm1_suspended());
        proto.update(3000);
        assert!(!proto.dm1_suspended());
    }

    #[test]
    fn dm22_clear_active_acks_when_dtc_exists() {
        let mut proto = DiagnosticProtocol::new(DiagnosticConfig::default());
        proto.set_active(50, Fmi::CurrentHigh, vec![]);
        let dtc_bytes = Dtc::new(50, Fmi::CurrentHigh).encode();
        let mut payload = vec![Dm22Control::ClearActive as u8];
        payload.extend_from_slice(&dtc_bytes);
        let reply = proto.handle_dm22(&payload);
        assert_eq!(reply[0], Dm22Control::AckClearActive as u8);
    }

    #[test]
    fn dm22_clear_active_nacks_when_dtc_unknown() {
        let mut proto = DiagnosticProtocol::new(DiagnosticConfig::default());
        let dtc_bytes = Dtc::new(999, Fmi::CurrentHigh).encode();
        let mut payload = vec![Dm22Control::ClearActive as u8];
        payload.extend_from_slice(&dtc_bytes);
        let reply = proto.handle_dm22(&payload);
        assert_eq!(reply[0], Dm22Control::NackClearActive as u8);
    }

    #[test]
    fn product_identification_roundtrips() {
        let id = ProductIdentification {
            make: "Acme".into(),
            model: "T1".into(),
            serial_number: "SN123".into(),
        };
        let decoded = ProductIdentification::decode(&id.encode());
        assert_eq!(decoded.make, "Acme");
        assert_eq!(decoded.model, "T1");
        assert_eq!(decoded.serial_number, "SN123");
    }

    #[test]
    fn software_identification_roundtrips() {
        let id = SoftwareIdentification {
            versions: vec!["1.0.0".into(), "2.1.0".into()],
        };
        let decoded = SoftwareIdentification::decode(&id.encode());
        assert_eq!(decoded.versions, vec!["1.0.0".to_string(), "2.1.0".to_string()]);
    }
}
