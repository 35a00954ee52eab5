//! ISO 11783-4 Network Interconnect Unit: filter-based bridging between two bus instances.

use crate::event::{Event, StateMachine};
use crate::frame::Frame;
use crate::network::{Message, Name};
use crate::types::{Address, Config, Result};

/// Control PGN carrying NIU filter-management messages (ISO 11783-4 §6.5).
pub const PGN_NIU_CONTROL: u32 = 0xED00;

/// What to do with a frame matching a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardPolicy {
    Allow,
    Block,
    Monitor,
}

/// Which bus a frame arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Tractor,
    Implement,
}

/// Inbound NIU control-message function codes (ISO 11783-4 §6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NIUFunction {
    RequestFilterDB = 1,
    AddFilterEntry = 2,
    DeleteFilterEntry = 3,
    DeleteAllEntries = 4,
    RequestFilterMode = 5,
    SetFilterMode = 6,
    RequestPortConfig = 9,
    PortConfigResponse = 10,
    FilterDBResponse = 11,
    RequestPortStats = 12,
    PortStatsResponse = 13,
    OpenConnection = 14,
    CloseConnection = 15,
    Unknown(u8),
}

impl NIUFunction {
    fn from_code(code: u8) -> Self {
        match code {
            1 => Self::RequestFilterDB,
            2 => Self::AddFilterEntry,
            3 => Self::DeleteFilterEntry,
            4 => Self::DeleteAllEntries,
            5 => Self::RequestFilterMode,
            6 => Self::SetFilterMode,
            9 => Self::RequestPortConfig,
            10 => Self::PortConfigResponse,
            11 => Self::FilterDBResponse,
            12 => Self::RequestPortStats,
            13 => Self::PortStatsResponse,
            14 => Self::OpenConnection,
            15 => Self::CloseConnection,
            other => Self::Unknown(other),
        }
    }

    fn code(&self) -> u8 {
        match self {
            Self::RequestFilterDB => 1,
            Self::AddFilterEntry => 2,
            Self::DeleteFilterEntry => 3,
            Self::DeleteAllEntries => 4,
            Self::RequestFilterMode => 5,
            Self::SetFilterMode => 6,
            Self::RequestPortConfig => 9,
            Self::PortConfigResponse => 10,
            Self::FilterDBResponse => 11,
            Self::RequestPortStats => 12,
            Self::PortStatsResponse => 13,
            Self::OpenConnection => 14,
            Self::CloseConnection => 15,
            Self::Unknown(code) => *code,
        }
    }
}

/// Default-forwarding policy when no rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NIUFilterMode {
    BlockAll = 0,
    PassAll = 1,
}

/// A decoded NIU control message body (8-byte payload).
#[derive(Debug, Clone, Copy)]
pub struct NIUNetworkMsg {
    pub function: NIUFunction,
    pub port_number: u8,
    pub filter_pgn: u32,
    pub filter_mode: NIUFilterMode,
    pub msgs_forwarded: u32,
    pub msgs_blocked: u32,
}

impl NIUNetworkMsg {
    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }
        let function = NIUFunction::from_code(data[0]);
        let mut msg = Self {
            function,
            port_number: data[1],
            filter_pgn: 0,
            filter_mode: NIUFilterMode::PassAll,
            msgs_forwarded: 0,
            msgs_blocked: 0,
        };
        match msg.function {
            NIUFunction::AddFilterEntry | NIUFunction::DeleteFilterEntry | NIUFunction::FilterDBResponse => {
                if data.len() >= 5 {
                    msg.filter_pgn =
                        data[2] as u32 | ((data[3] as u32) << 8) | (((data[4] & 0x03) as u32) << 16);
                }
            }
            NIUFunction::SetFilterMode | NIUFunction::RequestFilterMode => {
                if data.len() >= 3 {
                    msg.filter_mode = if data[2] == 0 {
                        NIUFilterMode::BlockAll
                    } else {
                        NIUFilterMode::PassAll
                    };
                }
            }
            NIUFunction::PortStatsResponse => {
                if data.len() >= 6 {
                    msg.msgs_forwarded = data[2] as u32 | ((data[3] as u32) << 8);
                    msg.msgs_blocked = data[4] as u32 | ((data[5] as u32) << 8);
                }
            }
            _ => {}
        }
        Some(msg)
    }

    fn encode(&self) -> [u8; 8] {
        let mut data = [0xFFu8; 8];
        data[0] = self.function.code();
        data[1] = self.port_number;
        match self.function {
            NIUFunction::AddFilterEntry | NIUFunction::DeleteFilterEntry | NIUFunction::FilterDBResponse => {
                data[2] = (self.filter_pgn & 0xFF) as u8;
                data[3] = ((self.filter_pgn >> 8) & 0xFF) as u8;
                data[4] = ((self.filter_pgn >> 16) & 0x03) as u8;
            }
            NIUFunction::SetFilterMode | NIUFunction::RequestFilterMode => {
                data[2] = self.filter_mode as u8;
            }
            NIUFunction::PortStatsResponse => {
                data[2] = (self.msgs_forwarded & 0xFF) as u8;
                data[3] = ((self.msgs_forwarded >> 8) & 0xFF) as u8;
                data[4] = (self.msgs_blocked & 0xFF) as u8;
                data[5] = ((self.msgs_blocked >> 8) & 0xFF) as u8;
            }
            _ => {}
        }
        data
    }
}

const FILTER_RULE_ENCODED_LEN: usize = 22;

/// One entry in the NIU's filter database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub pgn: u32,
    pub policy: ForwardPolicy,
    pub bidirectional: bool,
    pub source_name: Option<Name>,
    pub destination_name: Option<Name>,
    pub max_frequency_ms: u32,
    pub last_forward_time_ms: u32,
    pub persistent: bool,
}

impl FilterRule {
    pub fn new(pgn: u32, policy: ForwardPolicy, bidirectional: bool) -> Self {
        Self {
            pgn,
            policy,
            bidirectional,
            source_name: None,
            destination_name: None,
            max_frequency_ms: 0,
            last_forward_time_ms: 0,
            persistent: false,
        }
    }

    pub fn encode(&self) -> [u8; FILTER_RULE_ENCODED_LEN] {
        let mut data = [0u8; FILTER_RULE_ENCODED_LEN];
        data[0] = (self.pgn & 0xFF) as u8;
        data[1] = ((self.pgn >> 8) & 0xFF) as u8;
        data[2] = ((self.pgn >> 16) & 0x03) as u8;

        let mut flags = match self.policy {
            ForwardPolicy::Allow => 0,
            ForwardPolicy::Block => 1,
            ForwardPolicy::Monitor => 2,
        };
        if self.bidirectional {
            flags |= 0x04;
        }
        if self.persistent {
            flags |= 0x08;
        }
        if self.source_name.is_some() {
            flags |= 0x10;
        }
        if self.destination_name.is_some() {
            flags |= 0x20;
        }
        data[3] = flags;

        let source_bytes = self.source_name.map(|n| u64::from(n).to_le_bytes()).unwrap_or([0xFF; 8]);
        data[4..12].copy_from_slice(&source_bytes);
        let dest_bytes = self.destination_name.map(|n| u64::from(n).to_le_bytes()).unwrap_or([0xFF; 8]);
        data[12..20].copy_from_slice(&dest_bytes);

        data[20] = (self.max_frequency_ms & 0xFF) as u8;
        data[21] = ((self.max_frequency_ms >> 8) & 0xFF) as u8;
        data
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FILTER_RULE_ENCODED_LEN {
            return Err(crate::error::IsobusError::InvalidArgument(
                "filter rule too short".into(),
            ));
        }
        let pgn = data[0] as u32 | ((data[1] as u32) << 8) | (((data[2] & 0x03) as u32) << 16);
        let flags = data[3];
        let policy = match flags & 0x03 {
            0 => ForwardPolicy::Allow,
            1 => ForwardPolicy::Block,
            _ => ForwardPolicy::Monitor,
        };
        let bidirectional = flags & 0x04 != 0;
        let persistent = flags & 0x08 != 0;
        let has_source = flags & 0x10 != 0;
        let has_dest = flags & 0x20 != 0;

        let source_name = has_source.then(|| Name::from(u64::from_le_bytes(data[4..12].try_into().unwrap())));
        let destination_name = has_dest.then(|| Name::from(u64::from_le_bytes(data[12..20].try_into().unwrap())));
        let max_frequency_ms = data[20] as u32 | ((data[21] as u32) << 8);

        Ok(Self {
            pgn,
            policy,
            bidirectional,
            source_name,
            destination_name,
            max_frequency_ms,
            last_forward_time_ms: 0,
            persistent,
        })
    }
}

/// Tunables for [`NetworkInterconnectUnit`].
#[derive(Debug, Clone)]
pub struct NIUConfig {
    pub name: String,
    pub forward_global_by_default: bool,
    pub forward_specific_by_default: bool,
    pub filter_mode: NIUFilterMode,
}

impl Default for NIUConfig {
    fn default() -> Self {
        Self {
            name: "NIU".to_string(),
            forward_global_by_default: true,
            forward_specific_by_default: true,
            filter_mode: NIUFilterMode::PassAll,
        }
    }
}

impl Config for NIUConfig {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NiuState {
    Inactive,
    Active,
    Error,
}

/// Bridges a tractor-side and implement-side bus, applying filter rules and rate limits.
///
/// NAME predicates are resolved through an injected lookup (`set_name_resolver`) instead of
/// being silently skipped, unlike the reference source's `continue`-and-ignore placeholder.
pub struct NetworkInterconnectUnit {
    config: NIUConfig,
    filters: Vec<FilterRule>,
    state: StateMachine<NiuState>,
    forwarded_count: u32,
    blocked_count: u32,
    now_ms: u32,
    name_resolver: Option<Box<dyn Fn(Address) -> Option<Name>>>,

    pub on_forwarded: Event<Side>,
    pub on_blocked: Event<Side>,
    pub on_monitored: Event<Side>,
}

/// Result of routing one frame through [`NetworkInterconnectUnit::process_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Forwarded,
    Blocked,
    Monitored,
    Inactive,
}

impl NetworkInterconnectUnit {
    pub fn new(config: NIUConfig) -> Self {
        Self {
            config,
            filters: Vec::new(),
            state: StateMachine::new(NiuState::Inactive),
            forwarded_count: 0,
            blocked_count: 0,
            now_ms: 0,
            name_resolver: None,
            on_forwarded: Event::new(),
            on_blocked: Event::new(),
            on_monitored: Event::new(),
        }
    }

    /// Install a hook resolving a claimed address to its NAME, used to evaluate NAME-based rules.
    pub fn set_name_resolver(&mut self, resolver: impl Fn(Address) -> Option<Name> + 'static) {
        self.name_resolver = Some(Box::new(resolver));
    }

    pub fn start(&mut self) -> Result<()> {
        self.state.transition(NiuState::Active);
        log::info!("{} active", self.config.name);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.state.transition(NiuState::Inactive);
        log::info!("{} stopped", self.config.name);
    }

    pub fn is_active(&self) -> bool {
        self.state.is(NiuState::Active)
    }

    pub fn add_filter(&mut self, rule: FilterRule) -> &mut Self {
        self.filters.push(rule);
        self
    }

    pub fn allow_pgn(&mut self, pgn: u32, bidirectional: bool) -> &mut Self {
        self.add_filter(FilterRule::new(pgn, ForwardPolicy::Allow, bidirectional))
    }

    pub fn block_pgn(&mut self, pgn: u32, bidirectional: bool) -> &mut Self {
        self.add_filter(FilterRule::new(pgn, ForwardPolicy::Block, bidirectional))
    }

    pub fn monitor_pgn(&mut self, pgn: u32, bidirectional: bool) -> &mut Self {
        self.add_filter(FilterRule::new(pgn, ForwardPolicy::Monitor, bidirectional))
    }

    pub fn clear_filters(&mut self) {
        self.filters.clear();
    }

    pub fn filters(&self) -> &[FilterRule] {
        &self.filters
    }

    pub fn forwarded(&self) -> u32 {
        self.forwarded_count
    }

    pub fn blocked(&self) -> u32 {
        self.blocked_count
    }

    pub fn filter_mode(&self) -> NIUFilterMode {
        self.config.filter_mode
    }

    pub fn set_filter_mode(&mut self, mode: NIUFilterMode) {
        self.config.filter_mode = mode;
        self.config.forward_global_by_default = matches!(mode, NIUFilterMode::PassAll);
        self.config.forward_specific_by_default = matches!(mode, NIUFilterMode::PassAll);
    }

    /// Encode every `persistent` rule as a concatenation of 22-byte records.
    pub fn encode_persistent_filters(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for rule in self.filters.iter().filter(|r| r.persistent) {
            out.extend_from_slice(&rule.encode());
        }
        out
    }

    pub fn advance_clock(&mut self, elapsed_ms: u32) {
        self.now_ms = self.now_ms.wrapping_add(elapsed_ms);
    }

    pub fn process_tractor_frame(&mut self, frame: &Frame) -> RouteOutcome {
        self.process_frame(frame, Side::Tractor)
    }

    pub fn process_implement_frame(&mut self, frame: &Frame) -> RouteOutcome {
        self.process_frame(frame, Side::Implement)
    }

    fn process_frame(&mut self, frame: &Frame, origin: Side) -> RouteOutcome {
        if !self.is_active() {
            return RouteOutcome::Inactive;
        }

        let (policy, rate_limited) = self.resolve_policy(frame, origin);

        if rate_limited {
            self.blocked_count += 1;
            self.on_blocked.emit(origin);
            return RouteOutcome::Blocked;
        }

        match policy {
            ForwardPolicy::Allow => {
                self.forwarded_count += 1;
                self.on_forwarded.emit(origin);
                RouteOutcome::Forwarded
            }
            ForwardPolicy::Block => {
                self.blocked_count += 1;
                self.on_blocked.emit(origin);
                log::debug!("blocked PGN {:#06x} from {:?}", frame.pgn(), origin);
                RouteOutcome::Blocked
            }
            ForwardPolicy::Monitor => {
                self.forwarded_count += 1;
                self.on_forwarded.emit(origin);
                self.on_monitored.emit(origin);
                RouteOutcome::Monitored
            }
        }
    }

    fn resolve_policy(&mut self, frame: &Frame, origin: Side) -> (ForwardPolicy, bool) {
        let now = self.now_ms;
        for rule in &mut self.filters {
            if rule.pgn != 0 && rule.pgn != frame.pgn() {
                continue;
            }
            if !rule.bidirectional && origin != Side::Tractor {
                continue;
            }
            if let Some(expected) = rule.source_name {
                match &self.name_resolver {
                    Some(resolve) if resolve(frame.source()) == Some(expected) => {}
                    _ => continue,
                }
            }
            if let Some(expected) = rule.destination_name {
                match &self.name_resolver {
                    Some(resolve) if resolve(frame.destination()) == Some(expected) => {}
                    _ => continue,
                }
            }

            if rule.max_frequency_ms > 0 {
                let elapsed = now.wrapping_sub(rule.last_forward_time_ms);
                if elapsed < rule.max_frequency_ms {
                    return (rule.policy, true);
                }
                rule.last_forward_time_ms = now;
            }

            return (rule.policy, false);
        }

        match self.config.filter_mode {
            NIUFilterMode::BlockAll => (ForwardPolicy::Block, false),
            NIUFilterMode::PassAll => {
                if frame.is_broadcast() {
                    (
                        if self.config.forward_global_by_default { ForwardPolicy::Allow } else { ForwardPolicy::Block },
                        false,
                    )
                } else {
                    (
                        if self.config.forward_specific_by_default { ForwardPolicy::Allow } else { ForwardPolicy::Block },
                        false,
                    )
                }
            }
        }
    }

    /// Handle an inbound NIU control message (PGN `0xED00`). Malformed (< 2 byte) payloads are
    /// silently dropped.
    pub fn handle_control_message(&mut self, msg: &Message) -> Option<Vec<u8>> {
        if msg.pgn != PGN_NIU_CONTROL {
            return None;
        }
        let niu_msg = NIUNetworkMsg::decode(&msg.payload)?;
        match niu_msg.function {
            NIUFunction::AddFilterEntry => {
                self.filters.push(FilterRule::new(niu_msg.filter_pgn, ForwardPolicy::Allow, true));
                None
            }
            NIUFunction::DeleteFilterEntry => {
                if let Some(pos) = self.filters.iter().position(|r| r.pgn == niu_msg.filter_pgn) {
                    self.filters.remove(pos);
                }
                None
            }
            NIUFunction::DeleteAllEntries => {
                self.filters.clear();
                None
            }
            NIUFunction::SetFilterMode => {
                self.set_filter_mode(niu_msg.filter_mode);
                None
            }
            NIUFunction::RequestPortStats => {
                let reply = NIUNetworkMsg {
                    function: NIUFunction::PortStatsResponse,
                    port_number: niu_msg.port_number,
                    filter_pgn: 0,
                    filter_mode: NIUFilterMode::PassAll,
                    msgs_forwarded: self.forwarded_count,
                    msgs_blocked: self.blocked_count,
                };
                Some(reply.encode().to_vec())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dm1_frame(source: Address) -> Frame {
        Frame::from_message(3, 0xFECA, source, crate::types::BROADCAST_ADDRESS, vec![0; 8])
    }

    #[test]
    fn bidirectional_block_blocks_both_sides() {
        let mut niu = NetworkInterconnectUnit::new(NIUConfig::default());
        niu.start().unwrap();
        niu.block_pgn(0xFECA, true);

        let r1 = niu.process_tractor_frame(&dm1_frame(0x10));
        let r2 = niu.process_implement_frame(&dm1_frame(0x20));

        assert_eq!(r1, RouteOutcome::Blocked);
        assert_eq!(r2, RouteOutcome::Blocked);
        assert_eq!(niu.blocked(), 2);
        assert_eq!(niu.forwarded(), 0);
    }

    #[test]
    fn inactive_niu_drops_silently_without_counting() {
        let mut niu = NetworkInterconnectUnit::new(NIUConfig::default());
        let outcome = niu.process_tractor_frame(&dm1_frame(0x10));
        assert_eq!(outcome, RouteOutcome::Inactive);
        assert_eq!(niu.forwarded(), 0);
        assert_eq!(niu.blocked(), 0);
    }

    #[test]
    fn no_rule_match_pass_all_forwards_broadcast() {
        let mut niu = NetworkInterconnectUnit::new(NIUConfig::default());
        niu.start().unwrap();
        let outcome = niu.process_tractor_frame(&dm1_frame(0x10));
        assert_eq!(outcome, RouteOutcome::Forwarded);
    }

    #[test]
    fn no_rule_match_block_all_blocks() {
        let mut config = NIUConfig::default();
        config.filter_mode = NIUFilterMode::BlockAll;
        let mut niu = NetworkInterconnectUnit::new(config);
        niu.start().unwrap();
        let outcome = niu.process_tractor_frame(&dm1_frame(0x10));
        assert_eq!(outcome, RouteOutcome::Blocked);
    }

    #[test]
    fn rate_limited_rule_blocks_within_window() {
        let mut niu = NetworkInterconnectUnit::new(NIUConfig::default());
        niu.start().unwrap();
        let mut rule = FilterRule::new(0xFECA, ForwardPolicy::Allow, true);
        rule.max_frequency_ms = 1000;
        niu.add_filter(rule);

        let first = niu.process_tractor_frame(&dm1_frame(0x10));
        assert_eq!(first, RouteOutcome::Forwarded);

        niu.advance_clock(500);
        let second = niu.process_tractor_frame(&dm1_frame(0x10));
        assert_eq!(second, RouteOutcome::Blocked);

        niu.advance_clock(600);
        let third = niu.process_tractor_frame(&dm1_frame(0x10));
        assert_eq!(third, RouteOutcome::Forwarded);
    }

    #[test]
    fn name_predicate_resolves_through_injected_lookup() {
        let mut niu = NetworkInterconnectUnit::new(NIUConfig::default());
        niu.start().unwrap();
        let target_name = Name::from(0xABCDu64);
        niu.set_name_resolver(move |addr| if addr == 0x30 { Some(target_name) } else { None });

        let mut rule = FilterRule::new(0, ForwardPolicy::Block, true);
        rule.source_name = Some(target_name);
        niu.add_filter(rule);

        let matching = niu.process_tractor_frame(&dm1_frame(0x30));
        assert_eq!(matching, RouteOutcome::Blocked);

        let non_matching = niu.process_tractor_frame(&dm1_frame(0x31));
        assert_eq!(non_matching, RouteOutcome::Forwarded);
    }

    #[test]
    fn filter_rule_roundtrips_through_encode_decode() {
        let mut rule = FilterRule::new(0xFECA, ForwardPolicy::Monitor, false);
        rule.persistent = true;
        rule.max_frequency_ms = 250;
        rule.source_name = Some(Name::from(0x1122_3344_5566_7788u64));

        let encoded = rule.encode();
        assert_eq!(encoded.len(), FILTER_RULE_ENCODED_LEN);
        let decoded = FilterRule::decode(&encoded).unwrap();
        assert_eq!(decoded, rule);
    }

    #[test]
    fn control_message_add_then_delete_round_trips_filter_db() {
        let mut niu = NetworkInterconnectUnit::new(NIUConfig::default());
        niu.start().unwrap();
        let add = Message {
            pgn: PGN_NIU_CONTROL,
            priority: 6,
            source: 0x10,
            destination: crate::types::BROADCAST_ADDRESS,
            payload: vec![NIUFunction::AddFilterEntry.code(), 0, 0xCA, 0xFE, 0x00],
            timestamp: 0,
        };
        niu.handle_control_message(&add);
        assert_eq!(niu.filters().len(), 1);

        let delete = Message {
            payload: vec![NIUFunction::DeleteFilterEntry.code(), 0, 0xCA, 0xFE, 0x00],
            ..add
        };
        niu.handle_control_message(&delete);
        assert!(niu.filters().is_empty());
    }

    #[test]
    fn malformed_control_message_is_dropped() {
        let mut niu = NetworkInterconnectUnit::new(NIUConfig::default());
        niu.start().unwrap();
        let malformed = Message {
            pgn: PGN_NIU_CONTROL,
            priority: 6,
            source: 0x10,
            destination: crate::types::BROADCAST_ADDRESS,
            payload: vec![0x02],
            timestamp: 0,
        };
        assert!(niu.handle_control_message(&malformed).is_none());
        assert!(niu.filters().is_empty());
    }
}
