//! Passive VT state mirror and alarm-priority stack.
//!
//! Observes VT-to-ECU messages and maintains active masks, per-object numeric/string values,
//! visibility, enable state, and the sorted active-alarm stack. This never talks back to the VT;
//! it is a read-only mirror fed by [`handle_vt_message`](VtClientStateTracker::handle_vt_message).

use std::collections::HashMap;

use crate::event::Event;
use crate::network::Message;
use crate::types::Address;
use crate::vt::client::PGN_VT_TO_ECU;
use crate::vt::objects::ObjectId;

const CMD_VT_STATUS: u8 = 0xFE;
const CMD_NUMERIC_VALUE: u8 = 0xA6;
const CMD_STRING_VALUE: u8 = 0xD3;
const CMD_HIDE_SHOW_OBJECT: u8 = 0xA1;
const CMD_ENABLE_DISABLE_OBJECT: u8 = 0xA2;
const CMD_CHANGE_ACTIVE_MASK: u8 = 0xA0;

fn le16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

/// Alarm severity; lower numeric value is higher priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlarmPriority {
    Critical = 0,
    Warning = 1,
    Information = 2,
}

/// One entry in the active-alarm stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmEntry {
    pub alarm_mask_id: ObjectId,
    pub priority: AlarmPriority,
    pub activation_timestamp_ms: u32,
}

impl PartialOrd for AlarmEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for AlarmEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.activation_timestamp_ms.cmp(&other.activation_timestamp_ms))
    }
}

/// A mirror of VT-reported client state, maintained passively from observed VT→ECU traffic.
pub struct VtClientStateTracker {
    active_data_mask: ObjectId,
    active_soft_key_mask: ObjectId,
    active_alarm_mask: ObjectId,
    numeric_values: HashMap<ObjectId, u32>,
    string_values: HashMap<ObjectId, String>,
    visibility: HashMap<ObjectId, bool>,
    enable_state: HashMap<ObjectId, bool>,
    soft_key_mask_assignments: HashMap<ObjectId, ObjectId>,
    active_alarms: Vec<AlarmEntry>,
    alarm_priorities: HashMap<ObjectId, AlarmPriority>,
    vt_address: Address,
    vt_busy_code: u8,
    vt_function_code: u8,

    /// Fires with the new active data-mask id.
    pub on_active_mask_changed: Event<ObjectId>,
    /// Fires with (object-id, new value).
    pub on_numeric_value_changed: Event<(ObjectId, u32)>,
    /// Fires with (object-id, new value).
    pub on_string_value_changed: Event<(ObjectId, String)>,
    /// Fires with (object-id, new value).
    pub on_visibility_changed: Event<(ObjectId, bool)>,
    /// Fires with (object-id, new value).
    pub on_enable_state_changed: Event<(ObjectId, bool)>,
    /// Fires with (alarm-mask-id, priority) on activation.
    pub on_alarm_activated: Event<(ObjectId, AlarmPriority)>,
    /// Fires with the deactivated alarm-mask-id.
    pub on_alarm_deactivated: Event<ObjectId>,
}

const NO_OBJECT: ObjectId = 0xFFFF;

impl Default for VtClientStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl VtClientStateTracker {
    pub fn new() -> Self {
        Self {
            active_data_mask: NO_OBJECT,
            active_soft_key_mask: NO_OBJECT,
            active_alarm_mask: NO_OBJECT,
            numeric_values: HashMap::new(),
            string_values: HashMap::new(),
            visibility: HashMap::new(),
            enable_state: HashMap::new(),
            soft_key_mask_assignments: HashMap::new(),
            active_alarms: Vec::new(),
            alarm_priorities: HashMap::new(),
            vt_address: crate::types::NULL_ADDRESS,
            vt_busy_code: 0,
            vt_function_code: 0xFF,
            on_active_mask_changed: Event::new(),
            on_numeric_value_changed: Event::new(),
            on_string_value_changed: Event::new(),
            on_visibility_changed: Event::new(),
            on_enable_state_changed: Event::new(),
            on_alarm_activated: Event::new(),
            on_alarm_deactivated: Event::new(),
        }
    }

    pub fn active_data_mask(&self) -> ObjectId {
        self.active_data_mask
    }
    pub fn active_soft_key_mask(&self) -> ObjectId {
        self.active_soft_key_mask
    }
    pub fn active_alarm_mask(&self) -> ObjectId {
        self.active_alarm_mask
    }
    pub fn numeric_value(&self, id: ObjectId) -> Option<u32> {
        self.numeric_values.get(&id).copied()
    }
    pub fn string_value(&self, id: ObjectId) -> Option<&str> {
        self.string_values.get(&id).map(String::as_str)
    }
    pub fn is_visible(&self, id: ObjectId) -> Option<bool> {
        self.visibility.get(&id).copied()
    }
    pub fn is_enabled(&self, id: ObjectId) -> Option<bool> {
        self.enable_state.get(&id).copied()
    }
    pub fn soft_key_mask_for(&self, data_mask_id: ObjectId) -> Option<ObjectId> {
        self.soft_key_mask_assignments.get(&data_mask_id).copied()
    }
    pub fn vt_address(&self) -> Address {
        self.vt_address
    }
    pub fn vt_busy_code(&self) -> u8 {
        self.vt_busy_code
    }
    pub fn vt_function_code(&self) -> u8 {
        self.vt_function_code
    }

    /// Feed an observed VT-to-ECU message through the tracker, updating mirrored state and
    /// raising events for whatever changed. Ignores PGNs other than [`PGN_VT_TO_ECU`] and
    /// messages with an empty payload.
    pub fn handle_vt_message(&mut self, msg: &Message) {
        if msg.pgn != PGN_VT_TO_ECU || msg.payload.is_empty() {
            return;
        }
        self.vt_address = msg.source;
        match msg.payload[0] {
            CMD_VT_STATUS => self.handle_vt_status(&msg.payload),
            CMD_NUMERIC_VALUE => self.handle_numeric_change(&msg.payload),
            CMD_STRING_VALUE => self.handle_string_change(&msg.payload),
            CMD_HIDE_SHOW_OBJECT => self.handle_hide_show(&msg.payload),
            CMD_ENABLE_DISABLE_OBJECT => self.handle_enable_disable(&msg.payload),
            CMD_CHANGE_ACTIVE_MASK => self.handle_change_active_mask(&msg.payload),
            _ => {}
        }
    }

    fn handle_vt_status(&mut self, data: &[u8]) {
        if data.len() < 7 {
            return;
        }
        let data_mask = le16(data, 1);
        let soft_key_mask = le16(data, 3);
        self.vt_busy_code = data[5];
        self.vt_function_code = data[6];
        if data_mask != self.active_data_mask {
            self.set_active_data_mask(data_mask);
        }
        self.active_soft_key_mask = soft_key_mask;
        self.soft_key_mask_assignments.insert(data_mask, soft_key_mask);
    }

    fn handle_numeric_change(&mut self, data: &[u8]) {
        if data.len() < 7 {
            return;
        }
        let object_id = le16(data, 1);
        let value = u32::from_le_bytes([data[3], data[4], data[5], data[6]]);
        self.set_numeric_value(object_id, value);
    }

    fn handle_string_change(&mut self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        let object_id = le16(data, 1);
        let len = data[3] as usize;
        let value = String::from_utf8_lossy(&data[4..(4 + len).min(data.len())]).into_owned();
        self.set_string_value(object_id, value);
    }

    fn handle_hide_show(&mut self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        let object_id = le16(data, 1);
        self.set_visibility(object_id, data[3] != 0);
    }

    fn handle_enable_disable(&mut self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        let object_id = le16(data, 1);
        self.set_enable_state(object_id, data[3] != 0);
    }

    fn handle_change_active_mask(&mut self, data: &[u8]) {
        if data.len() < 3 {
            return;
        }
        let mask_id = le16(data, 1);
        self.set_active_data_mask(mask_id);
    }

    /// Record a mask's alarm priority, typically populated from pool upload metadata.
    pub fn register_alarm_priority(&mut self, alarm_mask_id: ObjectId, priority: AlarmPriority) {
        self.alarm_priorities.insert(alarm_mask_id, priority);
    }

    /// Activate an alarm, inserting it into the stack sorted by (priority asc, timestamp asc).
    /// A no-op if the alarm is already active.
    pub fn activate_alarm(&mut self, alarm_mask_id: ObjectId, timestamp_ms: u32) {
        if self.active_alarms.iter().any(|a| a.alarm_mask_id == alarm_mask_id) {
            return;
        }
        let priority = self
            .alarm_priorities
            .get(&alarm_mask_id)
            .copied()
            .unwrap_or(AlarmPriority::Information);
        let entry = AlarmEntry {
            alarm_mask_id,
            priority,
            activation_timestamp_ms: timestamp_ms,
        };
        let pos = self.active_alarms.partition_point(|a| *a <= entry);
        self.active_alarms.insert(pos, entry);
        self.active_alarm_mask = self.active_alarms[0].alarm_mask_id;
        self.on_alarm_activated.emit((alarm_mask_id, priority));
    }

    /// Acknowledge (pop) the top-of-stack alarm.
    pub fn acknowledge_alarm(&mut self) {
        if self.active_alarms.is_empty() {
            return;
        }
        let deactivated = self.active_alarms.remove(0);
        self.active_alarm_mask = self
            .active_alarms
            .first()
            .map(|a| a.alarm_mask_id)
            .unwrap_or(NO_OBJECT);
        self.on_alarm_deactivated.emit(deactivated.alarm_mask_id);
    }

    /// Remove a specific alarm from the stack, wherever it sits.
    pub fn deactivate_alarm(&mut self, alarm_mask_id: ObjectId) {
        if let Some(pos) = self.active_alarms.iter().position(|a| a.alarm_mask_id == alarm_mask_id) {
            self.active_alarms.remove(pos);
            self.on_alarm_deactivated.emit(alarm_mask_id);
        }
        self.active_alarm_mask = self
            .active_alarms
            .first()
            .map(|a| a.alarm_mask_id)
            .unwrap_or(NO_OBJECT);
    }

    /// The full active-alarm stack, highest priority first.
    pub fn active_alarms(&self) -> &[AlarmEntry] {
        &self.active_alarms
    }

    /// The highest-priority active alarm, if any.
    pub fn highest_priority_alarm(&self) -> Option<AlarmEntry> {
        self.active_alarms.first().copied()
    }

    pub fn is_alarm_active(&self, alarm_mask_id: ObjectId) -> bool {
        self.active_alarms.iter().any(|a| a.alarm_mask_id == alarm_mask_id)
    }

    pub fn set_numeric_value(&mut self, id: ObjectId, value: u32) {
        self.numeric_values.insert(id, value);
        self.on_numeric_value_changed.emit((id, value));
    }

    pub fn set_string_value(&mut self, id: ObjectId, value: String) {
        self.string_values.insert(id, value.clone());
        self.on_string_value_changed.emit((id, value));
    }

    pub fn set_visibility(&mut self, id: ObjectId, visible: bool) {
        self.visibility.insert(id, visible);
        self.on_visibility_changed.emit((id, visible));
    }

    pub fn set_enable_state(&mut self, id: ObjectId, enabled: bool) {
        self.enable_state.insert(id, enabled);
        self.on_enable_state_changed.emit((id, enabled));
    }

    pub fn set_active_data_mask(&mut self, id: ObjectId) {
        self.active_data_mask = id;
        self.on_active_mask_changed.emit(id);
    }

    pub fn set_active_soft_key_mask(&mut self, id: ObjectId) {
        self.active_soft_key_mask = id;
    }

    pub fn assign_soft_key_mask(&mut self, data_mask_id: ObjectId, soft_key_mask_id: ObjectId) {
        self.soft_key_mask_assignments.insert(data_mask_id, soft_key_mask_id);
    }

    /// Clear all tracked state back to defaults.
    pub fn reset(&mut self) {
        self.active_data_mask = NO_OBJECT;
        self.active_soft_key_mask = NO_OBJECT;
        self.active_alarm_mask = NO_OBJECT;
        self.numeric_values.clear();
        self.string_values.clear();
        self.visibility.clear();
        self.enable_state.clear();
        self.soft_key_mask_assignments.clear();
        self.active_alarms.clear();
        self.alarm_priorities.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alarms_sort_by_priority_then_timestamp() {
        let mut tracker = VtClientStateTracker::new();
        tracker.register_alarm_priority(1, AlarmPriority::Warning);
        tracker.register_alarm_priority(2, AlarmPriority::Critical);
        tracker.activate_alarm(1, 100);
        tracker.activate_alarm(2, 200);
        assert_eq!(tracker.highest_priority_alarm().unwrap().alarm_mask_id, 2);
    }

    #[test]
    fn same_priority_orders_by_timestamp() {
        let mut tracker = VtClientStateTracker::new();
        tracker.register_alarm_priority(1, AlarmPriority::Warning);
        tracker.register_alarm_priority(2, AlarmPriority::Warning);
        tracker.activate_alarm(2, 500);
        tracker.activate_alarm(1, 100);
        assert_eq!(tracker.highest_priority_alarm().unwrap().alarm_mask_id, 1);
    }

    #[test]
    fn acknowledge_pops_top_and_reveals_next() {
        let mut tracker = VtClientStateTracker::new();
        tracker.register_alarm_priority(1, AlarmPriority::Critical);
        tracker.register_alarm_priority(2, AlarmPriority::Warning);
        tracker.activate_alarm(1, 0);
        tracker.activate_alarm(2, 0);
        tracker.acknowledge_alarm();
        assert_eq!(tracker.active_alarm_mask(), 2);
    }

    #[test]
    fn deactivate_specific_alarm_removes_it_regardless_of_position() {
        let mut tracker = VtClientStateTracker::new();
        tracker.register_alarm_priority(1, AlarmPriority::Critical);
        tracker.register_alarm_priority(2, AlarmPriority::Warning);
        tracker.activate_alarm(1, 0);
        tracker.activate_alarm(2, 0);
        tracker.deactivate_alarm(2);
        assert!(!tracker.is_alarm_active(2));
        assert_eq!(tracker.active_alarms().len(), 1);
    }

    #[test]
    fn reactivating_same_alarm_is_a_no_op() {
        let mut tracker = VtClientStateTracker::new();
        tracker.activate_alarm(5, 0);
        tracker.activate_alarm(5, 10);
        assert_eq!(tracker.active_alarms().len(), 1);
    }
}
