//! Safety policy engine (module I): per-source freshness tracking and state escalation.

use std::collections::HashMap;

use crate::event::{Event, StateMachine};
use crate::network::Name;
use crate::types::{Config, Result, Timestamp};

/// What a stale source demands of the caller, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscalationAction {
    HoldLast,
    RampDown,
    Immediate,
    Disable,
}

/// Overall safety-engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyState {
    Normal,
    Degraded,
    Emergency,
    Shutdown,
}

/// Registration of a source whose liveness this engine tracks.
#[derive(Debug, Clone, Copy)]
struct SourceSpec {
    max_age_ms: u32,
    escalation_delay_ms: u32,
    action: EscalationAction,
    last_seen_ms: Timestamp,
}

impl SourceSpec {
    fn age(&self, now_ms: Timestamp) -> u32 {
        now_ms.wrapping_sub(self.last_seen_ms)
    }

    fn is_stale(&self, now_ms: Timestamp) -> bool {
        self.age(now_ms) > self.max_age_ms
    }
}

/// Tunables for [`SafetyPolicyEngine`]. Currently carries no fields of its own — every tunable
/// lives per-source in `require_freshness` — but still implements [`Config`] for uniformity with
/// every other stateful component.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetyConfig;

impl Config for SafetyConfig {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Tracks liveness of named sources and escalates `Normal -> Degraded -> Emergency` when sources
/// go stale for too long.
pub struct SafetyPolicyEngine {
    state: StateMachine<SafetyState>,
    sources: HashMap<Name, SourceSpec>,
    now_ms: Timestamp,
    degraded_since_ms: Option<Timestamp>,

    pub on_state_changed: Event<SafetyState>,
    pub on_emergency_triggered: Event<()>,
}

impl Default for SafetyPolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyPolicyEngine {
    pub fn new() -> Self {
        Self {
            state: StateMachine::new(SafetyState::Normal),
            sources: HashMap::new(),
            now_ms: 0,
            degraded_since_ms: None,
            on_state_changed: Event::new(),
            on_emergency_triggered: Event::new(),
        }
    }

    pub fn state(&self) -> SafetyState {
        self.state.state()
    }

    /// Register a source to track, assumed fresh as of the current tick.
    pub fn require_freshness(&mut self, source_name: Name, max_age_ms: u32, escalation_delay_ms: u32, action: EscalationAction) {
        self.sources.insert(
            source_name,
            SourceSpec {
                max_age_ms,
                escalation_delay_ms,
                action,
                last_seen_ms: self.now_ms,
            },
        );
    }

    /// Record a liveness signal from `source_name`. No-op if the source was never registered.
    pub fn report_alive(&mut self, source_name: Name) {
        if let Some(source) = self.sources.get_mut(&source_name) {
            source.last_seen_ms = self.now_ms;
        }
    }

    /// The most severe action among currently stale sources, if any.
    pub fn current_action(&self) -> Option<EscalationAction> {
        self.sources
            .values()
            .filter(|s| s.is_stale(self.now_ms))
            .map(|s| s.action)
            .max()
    }

    fn any_stale(&self) -> bool {
        self.sources.values().any(|s| s.is_stale(self.now_ms))
    }

    fn max_stale_escalation_delay(&self) -> u32 {
        self.sources
            .values()
            .filter(|s| s.is_stale(self.now_ms))
            .map(|s| s.escalation_delay_ms)
            .max()
            .unwrap_or(0)
    }

    fn transition(&mut self, new_state: SafetyState) {
        self.state.transition(new_state);
        log::debug!("safety state -> {:?}", new_state);
        self.on_state_changed.emit(new_state);
    }

    /// Jump directly to `Emergency` from any non-terminal state.
    pub fn trigger_emergency(&mut self, reason: &str) {
        if matches!(self.state(), SafetyState::Emergency | SafetyState::Shutdown) {
            return;
        }
        log::warn!("emergency triggered: {}", reason);
        self.transition(SafetyState::Emergency);
        self.on_emergency_triggered.emit(());
    }

    /// Manually leave `Emergency`/`Shutdown` and resume tracking from `Normal`.
    pub fn reset_to_normal(&mut self) {
        self.degraded_since_ms = None;
        self.transition(SafetyState::Normal);
    }

    pub fn update(&mut self, elapsed_ms: u32) {
        self.now_ms = self.now_ms.wrapping_add(elapsed_ms);

        match self.state() {
            SafetyState::Normal => {
                if self.any_stale() {
                    self.degraded_since_ms = Some(self.now_ms);
                    self.transition(SafetyState::Degraded);
                }
            }
            SafetyState::Degraded => {
                if !self.any_stale() {
                    self.degraded_since_ms = None;
                    self.transition(SafetyState::Normal);
                } else if let Some(since) = self.degraded_since_ms {
                    let elapsed_since_degraded = self.now_ms.wrapping_sub(since);
                    if elapsed_since_degraded > self.max_stale_escalation_delay() {
                        self.transition(SafetyState::Emergency);
                    }
                }
            }
            SafetyState::Emergency | SafetyState::Shutdown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_sources_stay_normal() {
        let mut engine = SafetyPolicyEngine::new();
        engine.require_freshness(Name::from(1u64), 1000, 500, EscalationAction::Immediate);
        engine.update(100);
        assert_eq!(engine.state(), SafetyState::Normal);
    }

    #[test]
    fn stale_source_degrades_then_escalates_to_emergency() {
        let mut engine = SafetyPolicyEngine::new();
        let source = Name::from(1u64);
        engine.require_freshness(source, 1000, 500, EscalationAction::Immediate);

        engine.update(1100);
        assert_eq!(engine.state(), SafetyState::Degraded);

        engine.update(600);
        assert_eq!(engine.state(), SafetyState::Emergency);
    }

    #[test]
    fn liveness_report_recovers_to_normal_before_escalation_delay() {
        let mut engine = SafetyPolicyEngine::new();
        let source = Name::from(1u64);
        engine.require_freshness(source, 1000, 500, EscalationAction::Immediate);

        engine.update(1100);
        assert_eq!(engine.state(), SafetyState::Degraded);

        engine.report_alive(source);
        engine.update(100);
        assert_eq!(engine.state(), SafetyState::Normal);
    }

    #[test]
    fn current_action_is_most_severe_among_stale_sources() {
        let mut engine = SafetyPolicyEngine::new();
        engine.require_freshness(Name::from(1u64), 500, 100, EscalationAction::HoldLast);
        engine.require_freshness(Name::from(2u64), 500, 100, EscalationAction::Disable);

        engine.update(600);
        assert_eq!(engine.current_action(), Some(EscalationAction::Disable));
    }

    #[test]
    fn trigger_emergency_jumps_from_any_nonterminal_state() {
        let mut engine = SafetyPolicyEngine::new();
        engine.trigger_emergency("manual test trigger");
        assert_eq!(engine.state(), SafetyState::Emergency);
    }

    #[test]
    fn emergency_and_shutdown_are_terminal_until_manual_reset() {
        let mut engine = SafetyPolicyEngine::new();
        engine.trigger_emergency("initial");
        engine.update(10_000);
        assert_eq!(engine.state(), SafetyState::Emergency);

        engine.reset_to_normal();
        assert_eq!(engine.state(), SafetyState::Normal);
    }
}
