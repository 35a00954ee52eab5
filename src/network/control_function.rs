//! Address-claim state machine (spec §4.B).

use super::name::Name;
use crate::types::{Address, NULL_ADDRESS};

/// Address-claim lifecycle state for an internal control function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    /// No claim has been sent yet.
    Unclaimed,
    /// Address Claim sent, waiting out the 250 ms settle timer.
    ClaimingWait,
    /// Lost contention at the current address and is retrying (arbitrary-address-capable only).
    Contending,
    /// Address successfully claimed.
    Claimed,
    /// Lost contention and is not arbitrary-address-capable. Terminal until `retry()`.
    Failed,
}

/// Dynamic address range for arbitrary-address-capable contention resolution.
pub const DYNAMIC_ADDRESS_RANGE: std::ops::RangeInclusive<Address> = 128..=247;

/// The 250 ms settle timer after sending an Address Claim.
pub const CLAIM_SETTLE_TIME_MS: u32 = 250;

/// A control function owned by this node, actively driving its own address claim.
#[derive(Debug, Clone)]
pub struct ControlFunction {
    name: Name,
    preferred_address: Address,
    current_address: Address,
    state: ClaimState,
    settle_timer_ms: u32,
    /// Addresses already tried and rejected during this contention episode.
    tried_addresses: Vec<Address>,
}

impl ControlFunction {
    /// Create a new, as-yet-unclaimed control function.
    pub fn new(name: Name, preferred_address: Address) -> Self {
        Self {
            name,
            preferred_address,
            current_address: NULL_ADDRESS,
            state: ClaimState::Unclaimed,
            settle_timer_ms: 0,
            tried_addresses: Vec::new(),
        }
    }

    /// This control function's NAME.
    pub fn name(&self) -> Name {
        self.name
    }

    /// Current claim state.
    pub fn state(&self) -> ClaimState {
        self.state
    }

    /// Currently claimed address, or `NULL_ADDRESS` if not claimed.
    pub fn address(&self) -> Address {
        self.current_address
    }

    /// Begin (or restart) the claim procedure at the preferred address.
    pub fn begin_claim(&mut self) {
        self.current_address = self.preferred_address;
        self.state = ClaimState::ClaimingWait;
        self.settle_timer_ms = 0;
        self.tried_addresses.clear();
        self.tried_addresses.push(self.preferred_address);
    }

    /// Advance the settle timer; returns `true` the instant the claim settles into `Claimed`.
    pub fn tick(&mut self, elapsed_ms: u32) -> bool {
        if self.state == ClaimState::ClaimingWait {
            self.settle_timer_ms += elapsed_ms;
            if self.settle_timer_ms >= CLAIM_SETTLE_TIME_MS {
                self.state = ClaimState::Claimed;
                log::info!("{:?} claimed address {:#04x}", self.name, self.current_address);
                return true;
            }
        }
        false
    }

    /// A contending claim with a lower NAME arrived at our current address. Returns the new
    /// address to claim if contention can be resolved (arbitrary-address-capable), or `None` if
    /// the claim has failed outright.
    pub fn handle_contention(&mut self, contender_name: Name) -> Option<Address> {
        if contender_name >= self.name {
            // We still win; nothing changes.
            return Some(self.current_address);
        }

        if !self.name.arbitrary_address_capable() {
            self.state = ClaimState::Failed;
            self.current_address = NULL_ADDRESS;
            log::warn!(
                "{:?} lost address contention to {:?} and cannot relocate",
                self.name,
                contender_name
            );
            return None;
        }

        self.state = ClaimState::Contending;
        let next = DYNAMIC_ADDRESS_RANGE
            .into_iter()
            .find(|addr| !self.tried_addresses.contains(addr));

        match next {
            Some(addr) => {
                self.tried_addresses.push(addr);
                self.current_address = addr;
                self.state = ClaimState::ClaimingWait;
                self.settle_timer_ms = 0;
                Some(addr)
            }
            None => {
                self.state = ClaimState::Failed;
                self.current_address = NULL_ADDRESS;
                log::warn!("{:?} exhausted the dynamic address range", self.name);
                None
            }
        }
    }

    /// Release a currently claimed address, returning to `Unclaimed`.
    pub fn release(&mut self) {
        self.state = ClaimState::Unclaimed;
        self.current_address = NULL_ADDRESS;
    }

    /// Retry a `Failed` claim from the beginning.
    pub fn retry(&mut self) {
        if self.state == ClaimState::Failed {
            self.begin_claim();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(raw: u64) -> Name {
        Name::from(raw)
    }

    #[test]
    fn claim_settles_after_timer() {
        let mut cf = ControlFunction::new(name(100), 0x20);
        cf.begin_claim();
        assert_eq!(cf.state(), ClaimState::ClaimingWait);
        assert!(!cf.tick(100));
        assert!(cf.tick(150));
        assert_eq!(cf.state(), ClaimState::Claimed);
        assert_eq!(cf.address(), 0x20);
    }

    #[test]
    fn higher_name_non_arbitrary_fails() {
        let mut cf = ControlFunction::new(name(1000), 0x20);
        cf.begin_claim();
        let lower = name(1);
        assert!(cf.handle_contention(lower).is_none());
        assert_eq!(cf.state(), ClaimState::Failed);
        assert_eq!(cf.address(), NULL_ADDRESS);
    }

    #[test]
    fn higher_name_arbitrary_moves_to_dynamic_range() {
        let mut name_bits: u64 = 1000;
        name_bits |= 1 << 63; // arbitrary-address-capable
        let mut cf = ControlFunction::new(name(name_bits), 0x20);
        cf.begin_claim();
        let lower = name(1);
        let new_addr = cf.handle_contention(lower).unwrap();
        assert!(DYNAMIC_ADDRESS_RANGE.contains(&new_addr));
        assert_eq!(cf.state(), ClaimState::ClaimingWait);
    }

    #[test]
    fn lower_name_wins_unaffected() {
        let mut cf = ControlFunction::new(name(1), 0x20);
        cf.begin_claim();
        cf.tick(300);
        let higher = name(1000);
        assert_eq!(cf.handle_contention(higher), Some(0x20));
        assert_eq!(cf.state(), ClaimState::Claimed);
    }
}
