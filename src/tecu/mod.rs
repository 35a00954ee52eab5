//! ISO 11783-9 Tractor ECU: classification-driven facilities, power management, safe-mode.

pub mod facilities;

pub use facilities::{facilities_for_classification, TECUClass, TECUClassification, TractorFacilities};

use crate::event::{Event, StateMachine};
use crate::network::Message;
use crate::types::{Address, Config, Result};

/// ISO 11783-9 Tractor Facilities PGN, carried both in response to a standard PGN request and
/// in the TECU's own periodic broadcast.
pub const PGN_TRACTOR_FACILITIES: u32 = 0xFEBD;

/// Power rail state machine (ISO 11783-9 §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    PowerOff,
    IgnitionOn,
    ShutdownInitiated,
    FinalShutdown,
}

/// Why safe-mode was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeModeTrigger {
    None,
    PowerLoss,
    ECUPowerLoss,
    CANBusFail,
    TECUCommLoss,
    ManualTrigger,
}

/// A live request from a control function to keep a power rail asserted during shutdown.
#[derive(Debug, Clone, Copy)]
struct MaintainPowerRequest {
    requester: Address,
    ecu_pwr: bool,
    pwr: bool,
    timestamp_ms: u32,
}

impl MaintainPowerRequest {
    fn is_expired(&self, current_time_ms: u32, timeout_ms: u32) -> bool {
        current_time_ms.wrapping_sub(self.timestamp_ms) > timeout_ms
    }
}

/// Power-rail timing tunables.
#[derive(Debug, Clone, Copy)]
pub struct PowerConfig {
    pub shutdown_max_time_ms: u32,
    pub maintain_timeout_ms: u32,
    pub ecu_pwr_current_amps: u8,
    pub pwr_current_amps: u8,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            shutdown_max_time_ms: 180_000,
            maintain_timeout_ms: 2_000,
            ecu_pwr_current_amps: 15,
            pwr_current_amps: 50,
        }
    }
}

impl PowerConfig {
    pub fn shutdown_time(mut self, ms: u32) -> Self {
        self.shutdown_max_time_ms = ms;
        self
    }

    pub fn maintain_timeout(mut self, ms: u32) -> Self {
        self.maintain_timeout_ms = ms;
        self
    }
}

/// Tunables for [`TractorECU`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TECUConfig {
    pub classification: TECUClassification,
    pub power: PowerConfig,
    pub facilities_broadcast_interval_ms: u32,
    pub status_broadcast_interval_ms: u32,
}

impl TECUConfig {
    pub fn new() -> Self {
        Self {
            facilities_broadcast_interval_ms: 2_000,
            status_broadcast_interval_ms: 100,
            ..Default::default()
        }
    }

    pub fn set_classification(mut self, classification: TECUClassification) -> Self {
        self.classification = classification;
        self
    }

    pub fn set_power(mut self, power: PowerConfig) -> Self {
        self.power = power;
        self
    }

    pub fn broadcast_interval(mut self, ms: u32) -> Self {
        self.facilities_broadcast_interval_ms = ms;
        self
    }

    pub fn status_interval(mut self, ms: u32) -> Self {
        self.status_broadcast_interval_ms = ms;
        self
    }
}

impl Config for TECUConfig {
    fn validate(&self) -> Result<()> {
        if self.power.maintain_timeout_ms > self.power.shutdown_max_time_ms {
            return Err(crate::error::IsobusError::InvalidArgument(
                "maintain_timeout_ms cannot exceed shutdown_max_time_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Actions a caller must carry out when safe-mode is triggered: disengage both PTOs, neutralise
/// both hitches, and close every supported auxiliary valve. No TIM wiring is assumed here; the
/// caller translates this into whatever implement-side commands it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeModeActions {
    pub disengage_front_pto: bool,
    pub disengage_rear_pto: bool,
    pub neutralize_front_hitch: bool,
    pub neutralize_rear_hitch: bool,
    pub close_aux_valves: bool,
}

impl Default for SafeModeActions {
    fn default() -> Self {
        Self {
            disengage_front_pto: true,
            disengage_rear_pto: true,
            neutralize_front_hitch: true,
            neutralize_rear_hitch: true,
            close_aux_valves: true,
        }
    }
}

/// Outbound frames and the per-tick outcome of [`TractorECU::update`].
#[derive(Debug, Clone, Default)]
pub struct TecuOutcome {
    pub outbound: Vec<(u32, Vec<u8>)>,
}

/// Gateway between the tractor bus and implement bus, exposing the set of facilities implied by
/// a classification and driving the power-management and safe-mode logic.
pub struct TractorECU {
    config: TECUConfig,

    power_state: StateMachine<PowerState>,
    safe_mode_trigger: SafeModeTrigger,

    facilities_timer_ms: u32,
    status_timer_ms: u32,
    shutdown_timer_ms: u32,

    maintain_power_requests: Vec<MaintainPowerRequest>,
    key_switch_on: bool,
    ecu_pwr_enabled: bool,
    pwr_enabled: bool,

    supported_facilities: TractorFacilities,
    primary_tecu_facilities: Option<TractorFacilities>,

    pub on_power_state_changed: Event<PowerState>,
    pub on_safe_mode_triggered: Event<SafeModeTrigger>,
    pub on_safe_mode_cleared: Event<()>,
    pub on_facilities_request_received: Event<TractorFacilities>,
    pub on_shutdown_complete: Event<()>,
}

impl TractorECU {
    pub fn new(config: TECUConfig) -> Self {
        let supported_facilities = facilities_for_classification(&config.classification);
        Self {
            config,
            power_state: StateMachine::new(PowerState::PowerOff),
            safe_mode_trigger: SafeModeTrigger::None,
            facilities_timer_ms: 0,
            status_timer_ms: 0,
            shutdown_timer_ms: 0,
            maintain_power_requests: Vec::new(),
            key_switch_on: false,
            ecu_pwr_enabled: false,
            pwr_enabled: false,
            supported_facilities,
            primary_tecu_facilities: None,
            on_power_state_changed: Event::new(),
            on_safe_mode_triggered: Event::new(),
            on_safe_mode_cleared: Event::new(),
            on_facilities_request_received: Event::new(),
            on_shutdown_complete: Event::new(),
        }
    }

    // ─── Power control ───────────────────────────────────────────────────

    pub fn set_key_switch(&mut self, on: bool) {
        self.key_switch_on = on;
        if on {
            self.shutdown_timer_ms = 0;
            self.ecu_pwr_enabled = true;
            self.pwr_enabled = true;
            self.transition_power(PowerState::IgnitionOn);
        } else {
            self.shutdown_timer_ms = 0;
            self.transition_power(PowerState::ShutdownInitiated);
        }
    }

    pub fn key_switch(&self) -> bool {
        self.key_switch_on
    }

    pub fn power_state(&self) -> PowerState {
        self.power_state.state()
    }

    pub fn ecu_pwr_enabled(&self) -> bool {
        self.ecu_pwr_enabled
    }

    pub fn pwr_enabled(&self) -> bool {
        self.pwr_enabled
    }

    fn transition_power(&mut self, new_state: PowerState) {
        self.power_state.transition(new_state);
        log::debug!("power state -> {:?}", new_state);
        self.on_power_state_changed.emit(new_state);
    }

    /// Record (or refresh) a maintain-power request from a control function during shutdown.
    pub fn receive_maintain_power_request(&mut self, requester: Address, ecu_pwr: bool, pwr: bool, current_time_ms: u32) {
        if let Some(existing) = self.maintain_power_requests.iter_mut().find(|r| r.requester == requester) {
            existing.ecu_pwr = ecu_pwr;
            existing.pwr = pwr;
            existing.timestamp_ms = current_time_ms;
            return;
        }
        self.maintain_power_requests.push(MaintainPowerRequest {
            requester,
            ecu_pwr,
            pwr,
            timestamp_ms: current_time_ms,
        });
    }

    fn update_power_management(&mut self, elapsed_ms: u32) {
        match self.power_state.state() {
            PowerState::PowerOff | PowerState::IgnitionOn | PowerState::FinalShutdown => {}
            PowerState::ShutdownInitiated => {
                self.shutdown_timer_ms = self.shutdown_timer_ms.saturating_add(elapsed_ms);

                self.maintain_power_requests
                    .retain(|req| !req.is_expired(self.shutdown_timer_ms, self.config.power.maintain_timeout_ms));

                let any_ecu_pwr = self.maintain_power_requests.iter().any(|r| r.ecu_pwr);
                let any_pwr = self.maintain_power_requests.iter().any(|r| r.pwr);

                if self.shutdown_timer_ms < self.config.power.maintain_timeout_ms {
                    self.ecu_pwr_enabled = true;
                    self.pwr_enabled = true;
                } else {
                    self.ecu_pwr_enabled = any_ecu_pwr;
                    self.pwr_enabled = any_pwr;
                }

                if self.shutdown_timer_ms >= self.config.power.shutdown_max_time_ms {
                    self.ecu_pwr_enabled = false;
                    self.pwr_enabled = false;
                    self.transition_power(PowerState::FinalShutdown);
                    self.on_shutdown_complete.emit(());
                } else if self.maintain_power_requests.is_empty()
                    && self.shutdown_timer_ms >= self.config.power.maintain_timeout_ms
                {
                    self.ecu_pwr_enabled = false;
                    self.pwr_enabled = false;
                    self.transition_power(PowerState::FinalShutdown);
                    self.on_shutdown_complete.emit(());
                }
            }
        }
    }

    // ─── Safe mode ───────────────────────────────────────────────────────

    /// Enter safe-mode: the caller is responsible for acting on the returned [`SafeModeActions`].
    pub fn trigger_safe_mode(&mut self, trigger: SafeModeTrigger) -> SafeModeActions {
        self.safe_mode_trigger = trigger;
        log::warn!("safe mode triggered: {:?}", trigger);
        self.on_safe_mode_triggered.emit(trigger);
        SafeModeActions::default()
    }

    pub fn safe_mode_trigger(&self) -> SafeModeTrigger {
        self.safe_mode_trigger
    }

    /// Clear the safe-mode latch. Does not re-engage anything.
    pub fn clear_safe_mode(&mut self) {
        self.safe_mode_trigger = SafeModeTrigger::None;
        self.on_safe_mode_cleared.emit(());
    }

    // ─── Classification and facilities ──────────────────────────────────

    pub fn classification(&self) -> TECUClassification {
        self.config.classification
    }

    pub fn set_classification(&mut self, classification: TECUClassification) {
        self.config.classification = classification;
        self.supported_facilities = facilities_for_classification(&classification);
    }

    pub fn supported_facilities(&self) -> TractorFacilities {
        self.supported_facilities
    }

    fn is_secondary(&self) -> bool {
        self.config.classification.is_secondary()
    }

    /// What this TECU would currently broadcast: all supported facilities if primary (or if no
    /// primary broadcast has been observed yet), else the set not already offered by the primary.
    fn effective_facilities(&self) -> TractorFacilities {
        match &self.primary_tecu_facilities {
            Some(primary) if self.is_secondary() => self.supported_facilities.difference(primary),
            _ => self.supported_facilities,
        }
    }

    /// Handle an inbound facilities-related message: a request for our facilities, or (for a
    /// secondary TECU) a primary's facilities broadcast to deduplicate against.
    pub fn handle_message(&mut self, msg: &Message) -> TecuOutcome {
        let mut outcome = TecuOutcome::default();
        if msg.pgn != PGN_TRACTOR_FACILITIES {
            return outcome;
        }

        if !msg.payload.is_empty() {
            let facilities = TractorFacilities::decode(&msg.payload);
            if self.is_secondary() {
                self.primary_tecu_facilities = Some(facilities);
            }
            self.on_facilities_request_received.emit(facilities);
        }

        outcome.outbound.push((PGN_TRACTOR_FACILITIES, self.effective_facilities().encode().to_vec()));
        outcome
    }

    fn send_facilities_broadcast(&self, outbound: &mut Vec<(u32, Vec<u8>)>) {
        if self.power_state.state() != PowerState::IgnitionOn {
            return;
        }
        if self.is_secondary() && self.primary_tecu_facilities.is_none() {
            return;
        }
        outbound.push((PGN_TRACTOR_FACILITIES, self.effective_facilities().encode().to_vec()));
    }

    // ─── Update loop ─────────────────────────────────────────────────────

    pub fn update(&mut self, elapsed_ms: u32) -> TecuOutcome {
        let mut outcome = TecuOutcome::default();

        self.facilities_timer_ms = self.facilities_timer_ms.saturating_add(elapsed_ms);
        if self.facilities_timer_ms >= self.config.facilities_broadcast_interval_ms {
            self.facilities_timer_ms = 0;
            self.send_facilities_broadcast(&mut outcome.outbound);
        }

        self.status_timer_ms = self.status_timer_ms.saturating_add(elapsed_ms);
        if self.status_timer_ms >= self.config.status_broadcast_interval_ms {
            self.status_timer_ms = 0;
        }

        self.update_power_management(elapsed_ms);

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message(source: Address, payload: Vec<u8>) -> Message {
        Message {
            pgn: PGN_TRACTOR_FACILITIES,
            priority: 6,
            source,
            destination: crate::types::BROADCAST_ADDRESS,
            payload,
            timestamp: 0,
        }
    }

    #[test]
    fn class1_classification_yields_basic_facilities() {
        let config = TECUConfig::new().set_classification(TECUClassification {
            base_class: TECUClass::Class1,
            ..Default::default()
        });
        let tecu = TractorECU::new(config);
        let f = tecu.supported_facilities();
        assert!(f.rear_hitch_position);
        assert!(!f.ground_based_distance);
    }

    #[test]
    fn power_startup_asserts_both_rails() {
        let mut tecu = TractorECU::new(TECUConfig::new());
        assert_eq!(tecu.power_state(), PowerState::PowerOff);
        tecu.set_key_switch(true);
        assert_eq!(tecu.power_state(), PowerState::IgnitionOn);
        assert!(tecu.ecu_pwr_enabled());
        assert!(tecu.pwr_enabled());
    }

    #[test]
    fn shutdown_without_maintain_requests_reaches_final_shutdown() {
        let config = TECUConfig::new().set_power(PowerConfig::default().shutdown_time(10_000).maintain_timeout(2_000));
        let mut tecu = TractorECU::new(config);
        tecu.set_key_switch(true);
        tecu.set_key_switch(false);
        assert_eq!(tecu.power_state(), PowerState::ShutdownInitiated);

        for _ in 0..25 {
            tecu.update(100);
        }

        assert_eq!(tecu.power_state(), PowerState::FinalShutdown);
        assert!(!tecu.ecu_pwr_enabled());
        assert!(!tecu.pwr_enabled());
    }

    #[test]
    fn shutdown_with_live_requests_holds_rails_until_requests_stop() {
        let config = TECUConfig::new().set_power(PowerConfig::default().shutdown_time(10_000).maintain_timeout(2_000));
        let mut tecu = TractorECU::new(config);
        tecu.set_key_switch(true);
        tecu.set_key_switch(false);

        let mut current_time = 0u32;
        for i in 0..40u32 {
            current_time += 100;
            tecu.update(100);
            if i % 15 == 0 {
                tecu.receive_maintain_power_request(0x42, true, true, current_time);
            }
            assert_eq!(tecu.power_state(), PowerState::ShutdownInitiated);
        }

        for _ in 0..25 {
            tecu.update(100);
        }

        assert_eq!(tecu.power_state(), PowerState::FinalShutdown);
    }

    #[test]
    fn max_shutdown_time_forces_power_off_despite_live_requests() {
        let config = TECUConfig::new().set_power(PowerConfig::default().shutdown_time(5_000).maintain_timeout(2_000));
        let mut tecu = TractorECU::new(config);
        tecu.set_key_switch(true);
        tecu.set_key_switch(false);

        let mut current_time = 0u32;
        for i in 0..60u32 {
            current_time += 100;
            tecu.update(100);
            if i % 10 == 0 {
                tecu.receive_maintain_power_request(0x43, true, true, current_time);
            }
        }

        assert_eq!(tecu.power_state(), PowerState::FinalShutdown);
        assert!(!tecu.ecu_pwr_enabled());
    }

    #[test]
    fn safe_mode_trigger_emits_and_latches() {
        let mut tecu = TractorECU::new(TECUConfig::new());
        let mut triggered = false;
        tecu.on_safe_mode_triggered.subscribe(move |_| triggered = true);
        let actions = tecu.trigger_safe_mode(SafeModeTrigger::CANBusFail);
        assert_eq!(tecu.safe_mode_trigger(), SafeModeTrigger::CANBusFail);
        assert!(actions.disengage_rear_pto);
        assert!(actions.neutralize_front_hitch);
    }

    #[test]
    fn clear_safe_mode_resets_latch_and_emits() {
        let mut tecu = TractorECU::new(TECUConfig::new());
        tecu.trigger_safe_mode(SafeModeTrigger::ManualTrigger);
        tecu.clear_safe_mode();
        assert_eq!(tecu.safe_mode_trigger(), SafeModeTrigger::None);
    }

    #[test]
    fn secondary_withholds_broadcast_until_primary_observed() {
        let config = TECUConfig::new().set_classification(TECUClassification {
            base_class: TECUClass::Class1,
            instance: 1,
            ..Default::default()
        });
        let mut tecu = TractorECU::new(config);
        tecu.set_key_switch(true);
        let outcome = tecu.update(2_000);
        assert!(outcome.outbound.is_empty());
    }

    #[test]
    fn secondary_deduplicates_against_primary_broadcast() {
        let mut secondary_class = TECUClassification {
            base_class: TECUClass::Class2,
            navigation: true,
            instance: 1,
            ..Default::default()
        };
        secondary_class.instance = 1;
        let mut secondary = TractorECU::new(TECUConfig::new().set_classification(secondary_class));

        let primary_facilities = facilities_for_classification(&TECUClassification {
            base_class: TECUClass::Class2,
            ..Default::default()
        });
        secondary.handle_message(&sample_message(0x10, primary_facilities.encode().to_vec()));

        let effective = secondary.effective_facilities();
        assert!(!effective.rear_hitch_position);
        assert!(effective.navigation);
    }

    #[test]
    fn facilities_request_with_empty_payload_still_answers() {
        let mut tecu = TractorECU::new(TECUConfig::new());
        let outcome = tecu.handle_message(&sample_message(0x05, vec![]));
        assert_eq!(outcome.outbound.len(), 1);
    }
}
