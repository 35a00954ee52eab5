//! TECU classification and the tractor facilities bitmap (ISO 11783-9 §4.4/4.6).

/// Base classification class (ISO 11783-9 Table 2). Ordered: a higher class is a strict
/// superset of the facilities of every lower class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TECUClass {
    Class1 = 1,
    Class2 = 2,
    Class3 = 3,
}

/// Full classification of a tractor ECU: base class, addenda letters, protocol version, and
/// instance number (0 = primary, >=1 = secondary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TECUClassification {
    pub base_class: TECUClass,
    pub navigation: bool,
    pub guidance: bool,
    pub front_mounted: bool,
    pub powertrain: bool,
    pub motion_init: bool,
    pub version: u8,
    pub instance: u8,
}

impl Default for TECUClassification {
    fn default() -> Self {
        Self {
            base_class: TECUClass::Class1,
            navigation: false,
            guidance: false,
            front_mounted: false,
            powertrain: false,
            motion_init: false,
            version: 1,
            instance: 0,
        }
    }
}

impl TECUClassification {
    pub fn is_primary(&self) -> bool {
        self.instance == 0
    }

    pub fn is_secondary(&self) -> bool {
        self.instance > 0
    }

    /// Human-readable class label, e.g. `"Class 2NF"`.
    pub fn label(&self) -> String {
        let mut s = format!("Class {}", self.base_class as u8);
        if self.navigation {
            s.push('N');
        }
        if self.front_mounted {
            s.push('F');
        }
        if self.guidance {
            s.push('G');
        }
        if self.powertrain {
            s.push('P');
        }
        if self.motion_init {
            s.push('M');
        }
        s
    }
}

macro_rules! facility_bitmap {
    ($($field:ident),* $(,)?) => {
        /// Fixed-shape record of boolean tractor-implement capabilities (ISO 11783-9 Annex).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct TractorFacilities {
            $(pub $field: bool,)*
        }

        impl TractorFacilities {
            /// Facilities offered by either operand (logical OR of every field).
            pub fn union(&self, other: &Self) -> Self {
                Self {
                    $($field: self.$field || other.$field,)*
                }
            }

            /// Facilities in `self` not already present in `already_offered` — used by a
            /// secondary TECU to withhold facilities the primary already broadcasts.
            pub fn difference(&self, already_offered: &Self) -> Self {
                Self {
                    $($field: self.$field && !already_offered.$field,)*
                }
            }

            pub fn encode(&self) -> [u8; 8] {
                let mut bits: u64 = 0;
                let mut i = 0u32;
                $(
                    if self.$field {
                        bits |= 1u64 << i;
                    }
                    i += 1;
                )*
                bits.to_le_bytes()
            }

            pub fn decode(bytes: &[u8]) -> Self {
                let mut buf = [0u8; 8];
                let n = bytes.len().min(8);
                buf[..n].copy_from_slice(&bytes[..n]);
                let bits = u64::from_le_bytes(buf);
                let mut out = Self::default();
                let mut i = 0u32;
                $(
                    out.$field = (bits >> i) & 1 != 0;
                    i += 1;
                )*
                out
            }
        }
    };
}

facility_bitmap!(
    rear_hitch_position,
    rear_hitch_in_work,
    rear_pto_speed,
    rear_pto_engagement,
    wheel_based_speed,
    ground_based_speed,
    ground_based_distance,
    ground_based_direction,
    wheel_based_distance,
    wheel_based_direction,
    rear_draft,
    lighting,
    aux_valve_flow,
    rear_hitch_command,
    rear_pto_command,
    aux_valve_command,
    rear_hitch_limit_status,
    rear_hitch_exit_code,
    rear_pto_engagement_request,
    rear_pto_speed_limit_status,
    rear_pto_exit_code,
    aux_valve_limit_status,
    aux_valve_exit_code,
    front_hitch_position,
    front_hitch_in_work,
    front_pto_speed,
    front_pto_engagement,
    front_hitch_command,
    front_pto_command,
    front_hitch_limit_status,
    front_hitch_exit_code,
    front_pto_engagement_request,
    front_pto_speed_limit_status,
    front_pto_exit_code,
    navigation,
    guidance,
    machine_selected_speed,
    machine_selected_speed_command,
);

/// Derive the facilities a TECU of the given classification supports, per the classification
/// table in ISO 11783-9 §4.4.2.
pub fn facilities_for_classification(classification: &TECUClassification) -> TractorFacilities {
    let mut f = TractorFacilities::default();

    if classification.base_class >= TECUClass::Class1 {
        f.rear_hitch_position = true;
        f.rear_hitch_in_work = true;
        f.rear_pto_speed = true;
        f.rear_pto_engagement = true;
        f.wheel_based_speed = true;
        f.ground_based_speed = true;
    }

    if classification.base_class >= TECUClass::Class2 {
        f.ground_based_distance = true;
        f.ground_based_direction = true;
        f.wheel_based_distance = true;
        f.wheel_based_direction = true;
        f.rear_draft = true;
        f.lighting = true;
        f.aux_valve_flow = true;
    }

    if classification.base_class >= TECUClass::Class3 {
        f.rear_hitch_command = true;
        f.rear_pto_command = true;
        f.aux_valve_command = true;

        if classification.version >= 2 {
            f.rear_hitch_limit_status = true;
            f.rear_hitch_exit_code = true;
            f.rear_pto_engagement_request = true;
            f.rear_pto_speed_limit_status = true;
            f.rear_pto_exit_code = true;
            f.aux_valve_limit_status = true;
            f.aux_valve_exit_code = true;
        }
    }

    if classification.navigation {
        f.navigation = true;
    }
    if classification.guidance {
        f.guidance = true;
    }

    if classification.front_mounted {
        f.front_hitch_position = true;
        f.front_hitch_in_work = true;
        f.front_pto_speed = true;
        f.front_pto_engagement = true;

        if classification.base_class >= TECUClass::Class3 {
            f.front_hitch_command = true;
            f.front_pto_command = true;

            if classification.version >= 2 {
                f.front_hitch_limit_status = true;
                f.front_hitch_exit_code = true;
                f.front_pto_engagement_request = true;
                f.front_pto_speed_limit_status = true;
                f.front_pto_exit_code = true;
            }
        }
    }

    if classification.powertrain {
        f.machine_selected_speed = true;
        if classification.base_class >= TECUClass::Class3 {
            f.machine_selected_speed_command = true;
        }
    }

    f
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classification(class: TECUClass) -> TECUClassification {
        TECUClassification {
            base_class: class,
            ..Default::default()
        }
    }

    #[test]
    fn class1_has_basic_facilities_only() {
        let f = facilities_for_classification(&classification(TECUClass::Class1));
        assert!(f.rear_hitch_position);
        assert!(f.rear_pto_speed);
        assert!(f.wheel_based_speed);
        assert!(!f.ground_based_distance);
        assert!(!f.rear_hitch_command);
    }

    #[test]
    fn class2_adds_measurements_not_commands() {
        let f = facilities_for_classification(&classification(TECUClass::Class2));
        assert!(f.ground_based_distance);
        assert!(f.rear_draft);
        assert!(f.lighting);
        assert!(!f.rear_hitch_command);
    }

    #[test]
    fn class3_adds_commands_and_v2_adds_limit_status() {
        let mut c = classification(TECUClass::Class3);
        let f = facilities_for_classification(&c);
        assert!(f.rear_hitch_command);
        assert!(f.rear_pto_command);
        assert!(!f.rear_hitch_limit_status);

        c.version = 2;
        let f2 = facilities_for_classification(&c);
        assert!(f2.rear_hitch_limit_status);
        assert!(f2.rear_pto_exit_code);
    }

    #[test]
    fn addenda_add_navigation_and_front_mirrors() {
        let mut c = classification(TECUClass::Class2);
        c.navigation = true;
        c.front_mounted = true;
        let f = facilities_for_classification(&c);
        assert!(f.navigation);
        assert!(f.front_hitch_position);
        assert!(f.front_pto_speed);
        assert!(!f.front_hitch_command); // class2, no commands yet
    }

    #[test]
    fn encode_decode_roundtrips() {
        let mut f = TractorFacilities::default();
        f.rear_hitch_position = true;
        f.rear_pto_speed = true;
        f.wheel_based_speed = true;
        f.navigation = true;
        let encoded = f.encode();
        assert_eq!(encoded.len(), 8);
        let decoded = TractorFacilities::decode(&encoded);
        assert_eq!(decoded, f);
    }

    #[test]
    fn difference_withholds_primary_facilities() {
        let primary = facilities_for_classification(&classification(TECUClass::Class2));
        let mut secondary_class = classification(TECUClass::Class2);
        secondary_class.navigation = true;
        let secondary = facilities_for_classification(&secondary_class);

        let effective = secondary.difference(&primary);
        assert!(!effective.rear_hitch_position); // already offered by primary
        assert!(effective.navigation); // unique to secondary
    }

    #[test]
    fn union_combines_both_operands() {
        let mut a = TractorFacilities::default();
        a.navigation = true;
        let mut b = TractorFacilities::default();
        b.guidance = true;
        let u = a.union(&b);
        assert!(u.navigation);
        assert!(u.guidance);
    }
}
