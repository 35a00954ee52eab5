//! DTC, freeze-frame, and monitor-performance-ratio codecs (spec §4.D encoding rules).

/// Failure Mode Identifier (SAE J1939-73 Table 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fmi {
    AboveNormal = 0,
    BelowNormal = 1,
    Erratic = 2,
    VoltageHigh = 3,
    VoltageLow = 4,
    CurrentLow = 5,
    CurrentHigh = 6,
    MechanicalFail = 7,
    AbnormalFrequency = 8,
    AbnormalUpdate = 9,
    AbnormalRateChange = 10,
    RootCauseUnknown = 11,
    BadDevice = 12,
    OutOfCalibration = 13,
    SpecialInstructions = 14,
    AboveNormalLeast = 15,
    AboveNormalModerate = 16,
    BelowNormalLeast = 17,
    BelowNormalModerate = 18,
    ReceivedNetworkData = 19,
    ConditionExists = 31,
}

impl Fmi {
    /// Decode a 5-bit FMI code, falling back to `RootCauseUnknown` for reserved values.
    pub fn from_code(code: u8) -> Self {
        match code & 0x1F {
            0 => Fmi::AboveNormal,
            1 => Fmi::BelowNormal,
            2 => Fmi::Erratic,
            3 => Fmi::VoltageHigh,
            4 => Fmi::VoltageLow,
            5 => Fmi::CurrentLow,
            6 => Fmi::CurrentHigh,
            7 => Fmi::MechanicalFail,
            8 => Fmi::AbnormalFrequency,
            9 => Fmi::AbnormalUpdate,
            10 => Fmi::AbnormalRateChange,
            12 => Fmi::BadDevice,
            13 => Fmi::OutOfCalibration,
            14 => Fmi::SpecialInstructions,
            15 => Fmi::AboveNormalLeast,
            16 => Fmi::AboveNormalModerate,
            17 => Fmi::BelowNormalLeast,
            18 => Fmi::BelowNormalModerate,
            19 => Fmi::ReceivedNetworkData,
            31 => Fmi::ConditionExists,
            _ => Fmi::RootCauseUnknown,
        }
    }

    /// The 5-bit wire code for this FMI.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Diagnostic Trouble Code: SPN + FMI + occurrence count. Equality is over (SPN, FMI) only,
/// per spec — the occurrence count tracks repeat activations, not identity.
#[derive(Debug, Clone, Copy)]
pub struct Dtc {
    pub spn: u32,
    pub fmi: Fmi,
    pub occurrence_count: u8,
}

impl PartialEq for Dtc {
    fn eq(&self, other: &Self) -> bool {
        self.spn == other.spn && self.fmi == other.fmi
    }
}
impl Eq for Dtc {}

impl Dtc {
    /// A freshly-activated DTC with occurrence count 1.
    pub fn new(spn: u32, fmi: Fmi) -> Self {
        Self {
            spn,
            fmi,
            occurrence_count: 1,
        }
    }

    /// Key used to index freeze-frame storage: `(SPN << 8) | FMI`.
    pub fn key(&self) -> u32 {
        (self.spn << 8) | self.fmi.code() as u32
    }

    /// Encode to the 4-byte wire layout: `SPN[0..15]`, `(SPN[16..18] << 5) | FMI`, `OC & 0x7F`.
    pub fn encode(&self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes[0] = (self.spn & 0xFF) as u8;
        bytes[1] = ((self.spn >> 8) & 0xFF) as u8;
        bytes[2] = (((self.spn >> 16) & 0x07) as u8) << 5 | self.fmi.code();
        bytes[3] = self.occurrence_count & 0x7F;
        bytes
    }

    /// Decode from a 4-byte slice (expects at least 4 bytes).
    pub fn decode(data: &[u8]) -> Self {
        let spn = data[0] as u32 | ((data[1] as u32) << 8) | (((data[2] >> 5) as u32 & 0x07) << 16);
        let fmi = Fmi::from_code(data[2] & 0x1F);
        let occurrence_count = data[3] & 0x7F;
        Self {
            spn,
            fmi,
            occurrence_count,
        }
    }

    /// Increment occurrence count, saturating at 126 (spec §4.D).
    pub fn bump(&mut self) {
        if self.occurrence_count < 126 {
            self.occurrence_count += 1;
        }
    }
}

/// Malfunction-indicator-lamp state (2-bit field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LampStatus {
    Off = 0,
    On = 1,
    Error = 2,
    NotAvailable = 3,
}

impl LampStatus {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => LampStatus::Off,
            1 => LampStatus::On,
            2 => LampStatus::Error,
            _ => LampStatus::NotAvailable,
        }
    }
}

/// Lamp flash state (2-bit field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LampFlash {
    SlowFlash = 0,
    FastFlash = 1,
    Off = 2,
    NotAvailable = 3,
}

impl LampFlash {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => LampFlash::SlowFlash,
            1 => LampFlash::FastFlash,
            2 => LampFlash::Off,
            _ => LampFlash::NotAvailable,
        }
    }
}

/// The four J1939 malfunction lamps, each with a status and flash pattern.
#[derive(Debug, Clone, Copy)]
pub struct DiagnosticLamps {
    pub malfunction: LampStatus,
    pub malfunction_flash: LampFlash,
    pub red_stop: LampStatus,
    pub red_stop_flash: LampFlash,
    pub amber_warning: LampStatus,
    pub amber_warning_flash: LampFlash,
    pub engine_protect: LampStatus,
    pub engine_protect_flash: LampFlash,
}

impl Default for DiagnosticLamps {
    fn default() -> Self {
        Self {
            malfunction: LampStatus::Off,
            malfunction_flash: LampFlash::Off,
            red_stop: LampStatus::Off,
            red_stop_flash: LampFlash::Off,
            amber_warning: LampStatus::Off,
            amber_warning_flash: LampFlash::Off,
            engine_protect: LampStatus::Off,
            engine_protect_flash: LampFlash::Off,
        }
    }
}

impl DiagnosticLamps {
    /// Encode to 2 bytes of packed 2-bit fields.
    pub fn encode(&self) -> [u8; 2] {
        let b0 = (self.malfunction as u8)
            | ((self.red_stop as u8) << 2)
            | ((self.amber_warning as u8) << 4)
            | ((self.engine_protect as u8) << 6);
        let b1 = (self.malfunction_flash as u8)
            | ((self.red_stop_flash as u8) << 2)
            | ((self.amber_warning_flash as u8) << 4)
            | ((self.engine_protect_flash as u8) << 6);
        [b0, b1]
    }

    /// Decode from a 2-byte slice.
    pub fn decode(data: &[u8]) -> Self {
        Self {
            malfunction: LampStatus::from_bits(data[0]),
            red_stop: LampStatus::from_bits(data[0] >> 2),
            amber_warning: LampStatus::from_bits(data[0] >> 4),
            engine_protect: LampStatus::from_bits(data[0] >> 6),
            malfunction_flash: LampFlash::from_bits(data[1]),
            red_stop_flash: LampFlash::from_bits(data[1] >> 2),
            amber_warning_flash: LampFlash::from_bits(data[1] >> 4),
            engine_protect_flash: LampFlash::from_bits(data[1] >> 6),
        }
    }
}

/// A single SPN value captured as part of a freeze frame.
#[derive(Debug, Clone, Copy)]
pub struct SpnSnapshot {
    pub spn: u32,
    pub value: u32,
}

impl SpnSnapshot {
    /// Encode to the 7-byte layout: 19-bit SPN + 32-bit value.
    pub fn encode(&self) -> [u8; 7] {
        let mut bytes = [0u8; 7];
        bytes[0] = (self.spn & 0xFF) as u8;
        bytes[1] = ((self.spn >> 8) & 0xFF) as u8;
        bytes[2] = ((self.spn >> 16) & 0x07) as u8;
        bytes[3..7].copy_from_slice(&self.value.to_le_bytes());
        bytes
    }

    /// Decode from a 7-byte slice.
    pub fn decode(data: &[u8]) -> Self {
        let spn = data[0] as u32 | ((data[1] as u32) << 8) | (((data[2] & 0x07) as u32) << 16);
        let value = u32::from_le_bytes([data[3], data[4], data[5], data[6]]);
        Self { spn, value }
    }
}

/// A freeze frame: the DTC that triggered capture, the time it was taken, and the SPN values
/// observed at that instant.
#[derive(Debug, Clone)]
pub struct FreezeFrame {
    pub dtc: Dtc,
    pub timestamp_ms: u32,
    pub snapshots: Vec<SpnSnapshot>,
}

impl FreezeFrame {
    /// Encode for a DM25 response: DTC (4B) + timestamp (4B LE) + count (1B) + snapshots (7B each).
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(9 + self.snapshots.len() * 7);
        data.extend_from_slice(&self.dtc.encode());
        data.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        data.push(self.snapshots.len() as u8);
        for snap in &self.snapshots {
            data.extend_from_slice(&snap.encode());
        }
        data
    }

    /// Decode a DM25-response body. Returns `None` if the buffer is too short for even the
    /// fixed-size header.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 9 {
            return None;
        }
        let dtc = Dtc::decode(&data[0..4]);
        let timestamp_ms = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let num_snapshots = data[8] as usize;
        let mut snapshots = Vec::with_capacity(num_snapshots);
        let mut offset = 9;
        for _ in 0..num_snapshots {
            if offset + 7 > data.len() {
                break;
            }
            snapshots.push(SpnSnapshot::decode(&data[offset..offset + 7]));
            offset += 7;
        }
        Some(Self {
            dtc,
            timestamp_ms,
            snapshots,
        })
    }
}

/// A single monitor's execution ratio (DM20).
#[derive(Debug, Clone, Copy)]
pub struct MonitorPerformanceRatio {
    pub spn: u32,
    pub numerator: u16,
    pub denominator: u16,
}

impl MonitorPerformanceRatio {
    /// Encode to the 7-byte layout: SPN (19 bits) + numerator (16 bits) + denominator (16 bits).
    pub fn encode(&self) -> [u8; 7] {
        let mut bytes = [0u8; 7];
        bytes[0] = (self.spn & 0xFF) as u8;
        bytes[1] = ((self.spn >> 8) & 0xFF) as u8;
        bytes[2] = ((self.spn >> 16) & 0x07) as u8;
        bytes[3..5].copy_from_slice(&self.numerator.to_le_bytes());
        bytes[5..7].copy_from_slice(&self.denominator.to_le_bytes());
        bytes
    }

    /// Decode from a 7-byte slice.
    pub fn decode(data: &[u8]) -> Self {
        let spn = data[0] as u32 | ((data[1] as u32) << 8) | (((data[2] & 0x07) as u32) << 16);
        let numerator = u16::from_le_bytes([data[3], data[4]]);
        let denominator = u16::from_le_bytes([data[5], data[6]]);
        Self {
            spn,
            numerator,
            denominator,
        }
    }

    /// Execution ratio as a 0-100 percentage; 0 if the monitor has never had an opportunity.
    pub fn percentage(&self) -> u8 {
        if self.denominator == 0 {
            return 0;
        }
        let result = (self.numerator as u32 * 100) / self.denominator as u32;
        result.min(100) as u8
    }

    /// Whether this ratio meets a minimum OBD-readiness threshold (default 75%).
    pub fn meets_threshold(&self, threshold: u8) -> bool {
        self.percentage() >= threshold
    }
}

/// DM20 response body: ignition cycles, OBD monitoring condition count, and per-monitor ratios.
#[derive(Debug, Clone, Default)]
pub struct Dm20Response {
    pub ignition_cycles: u8,
    pub obd_monitoring_conditions_met: u8,
    pub ratios: Vec<MonitorPerformanceRatio>,
}

impl Dm20Response {
    /// Encode, zero-padded to at least 8 bytes (a single frame with no ratios still fills a PDU).
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(2 + self.ratios.len() * 7);
        data.push(self.ignition_cycles);
        data.push(self.obd_monitoring_conditions_met);
        for ratio in &self.ratios {
            data.extend_from_slice(&ratio.encode());
        }
        while data.len() < 8 {
            data.push(0xFF);
        }
        data
    }

    /// Decode; tolerates a short buffer by returning as many whole ratios as fit.
    pub fn decode(data: &[u8]) -> Self {
        if data.len() < 2 {
            return Self::default();
        }
        let mut offset = 2;
        let mut ratios = Vec::new();
        while offset + 7 <= data.len() {
            ratios.push(MonitorPerformanceRatio::decode(&data[offset..offset + 7]));
            offset += 7;
        }
        Self {
            ignition_cycles: data[0],
            obd_monitoring_conditions_met: data[1],
            ratios,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtc_roundtrips_through_encode_decode() {
        let dtc = Dtc::new(123_456, Fmi::VoltageHigh);
        let bytes = dtc.encode();
        let decoded = Dtc::decode(&bytes);
        assert_eq!(decoded.spn, 123_456);
        assert_eq!(decoded.fmi, Fmi::VoltageHigh);
    }

    #[test]
    fn occurrence_count_saturates_at_126() {
        let mut dtc = Dtc::new(1, Fmi::Erratic);
        dtc.occurrence_count = 126;
        dtc.bump();
        assert_eq!(dtc.occurrence_count, 126);
    }

    #[test]
    fn equality_ignores_occurrence_count() {
        let a = Dtc::new(1, Fmi::Erratic);
        let mut b = Dtc::new(1, Fmi::Erratic);
        b.occurrence_count = 5;
        assert_eq!(a, b);
    }

    #[test]
    fn lamps_roundtrip() {
        let lamps = DiagnosticLamps {
            malfunction: LampStatus::On,
            red_stop: LampStatus::Error,
            amber_warning: LampStatus::NotAvailable,
            engine_protect: LampStatus::Off,
            ..Default::default()
        };
        let bytes = lamps.encode();
        let decoded = DiagnosticLamps::decode(&bytes);
        assert_eq!(decoded.malfunction, LampStatus::On);
        assert_eq!(decoded.red_stop, LampStatus::Error);
        assert_eq!(decoded.amber_warning, LampStatus::NotAvailable);
    }

    #[test]
    fn freeze_frame_roundtrips() {
        let ff = FreezeFrame {
            dtc: Dtc::new(500, Fmi::CurrentLow),
            timestamp_ms: 123_000,
            snapshots: vec![SpnSnapshot { spn: 100, value: 42 }],
        };
        let encoded = ff.encode();
        let decoded = FreezeFrame::decode(&encoded).unwrap();
        assert_eq!(decoded.dtc, ff.dtc);
        assert_eq!(decoded.timestamp_ms, 123_000);
        assert_eq!(decoded.snapshots.len(), 1);
        assert_eq!(decoded.snapshots[0].value, 42);
    }

    #[test]
    fn performance_ratio_percentage_and_threshold() {
        let ratio = MonitorPerformanceRatio {
            spn: 1,
            numerator: 75,
            denominator: 100,
        };
        assert_eq!(ratio.percentage(), 75);
        assert!(ratio.meets_threshold(75));
        assert!(!ratio.meets_threshold(76));
    }

    #[test]
    fn dm20_response_roundtrips() {
        let resp = Dm20Response {
            ignition_cycles: 5,
            obd_monitoring_conditions_met: 2,
            ratios: vec![MonitorPerformanceRatio {
                spn: 10,
                numerator: 1,
                denominator: 2,
            }],
        };
        let encoded = resp.encode();
        let decoded = Dm20Response::decode(&encoded);
        assert_eq!(decoded.ignition_cycles, 5);
        assert_eq!(decoded.ratios.len(), 1);
        assert_eq!(decoded.ratios[0].spn, 10);
    }
}
