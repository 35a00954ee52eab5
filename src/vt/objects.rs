//! VT object graph: the 48-member [`ObjectType`] enumeration, [`VtObject`], and [`ObjectPool`]
//! (module E).
//!
//! Wire layout per object: `[id LE:2][type:1][body-length LE:2][body...][children-count LE:2][child-ids LE:2 each]`.

use std::collections::HashSet;

use crate::error::{IsobusError, PoolValidationError, Result};

pub type ObjectId = u16;

/// One of the 48 object types defined by ISO 11783-6 (editions through Ed.4 / VT version 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    WorkingSet = 0,
    DataMask = 1,
    AlarmMask = 2,
    Container = 3,
    SoftKeyMask = 4,
    Key = 5,
    Button = 6,
    InputBoolean = 7,
    InputString = 8,
    InputNumber = 9,
    InputList = 10,
    OutputString = 11,
    OutputNumber = 12,
    Line = 13,
    Rectangle = 14,
    Ellipse = 15,
    Polygon = 16,
    Meter = 17,
    LinearBarGraph = 18,
    ArchedBarGraph = 19,
    PictureGraphic = 20,
    NumberVariable = 21,
    StringVariable = 22,
    FontAttributes = 23,
    LineAttributes = 24,
    FillAttributes = 25,
    InputAttributes = 26,
    ObjectPointer = 27,
    Macro = 28,
    AuxFunction = 29,
    AuxInput = 30,
    AuxFunction2 = 31,
    AuxInput2 = 32,
    AuxControlDesignator = 33,
    WindowMask = 34,
    KeyGroup = 35,
    GraphicData = 36,
    ScaledGraphic = 37,
    Animation = 38,
    ColourMap = 39,
    GraphicContext = 40,
    ExternalObjectDefinition = 41,
    ExternalReferenceName = 42,
    ExternalObjectPointer = 43,
    ColourPalette = 44,
    GraphicsContextV6 = 45,
    ObjectLabelRefList = 46,
    ScaledBitmap = 47,
}

impl ObjectType {
    fn from_u8(tag: u8) -> Result<Self> {
        use ObjectType::*;
        Ok(match tag {
            0 => WorkingSet,
            1 => DataMask,
            2 => AlarmMask,
            3 => Container,
            4 => SoftKeyMask,
            5 => Key,
            6 => Button,
            7 => InputBoolean,
            8 => InputString,
            9 => InputNumber,
            10 => InputList,
            11 => OutputString,
            12 => OutputNumber,
            13 => Line,
            14 => Rectangle,
            15 => Ellipse,
            16 => Polygon,
            17 => Meter,
            18 => LinearBarGraph,
            19 => ArchedBarGraph,
            20 => PictureGraphic,
            21 => NumberVariable,
            22 => StringVariable,
            23 => FontAttributes,
            24 => LineAttributes,
            25 => FillAttributes,
            26 => InputAttributes,
            27 => ObjectPointer,
            28 => Macro,
            29 => AuxFunction,
            30 => AuxInput,
            31 => AuxFunction2,
            32 => AuxInput2,
            33 => AuxControlDesignator,
            34 => WindowMask,
            35 => KeyGroup,
            36 => GraphicData,
            37 => ScaledGraphic,
            38 => Animation,
            39 => ColourMap,
            40 => GraphicContext,
            41 => ExternalObjectDefinition,
            42 => ExternalReferenceName,
            43 => ExternalObjectPointer,
            44 => ColourPalette,
            45 => GraphicsContextV6,
            46 => ObjectLabelRefList,
            47 => ScaledBitmap,
            other => {
                return Err(IsobusError::InvalidArgument(format!(
                    "unknown VT object type tag {}",
                    other
                )))
            }
        })
    }
}

/// One node in the object graph: an id, a type tag, opaque body bytes, and an ordered list of
/// child object-ids.
#[derive(Debug, Clone)]
pub struct VtObject {
    pub id: ObjectId,
    pub object_type: ObjectType,
    pub body: Vec<u8>,
    pub children: Vec<ObjectId>,
}

impl VtObject {
    pub fn new(id: ObjectId, object_type: ObjectType, body: Vec<u8>, children: Vec<ObjectId>) -> Self {
        Self {
            id,
            object_type,
            body,
            children,
        }
    }

    /// Serialize this object per the wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(7 + self.body.len() + self.children.len() * 2);
        out.extend_from_slice(&self.id.to_le_bytes());
        out.push(self.object_type as u8);
        out.extend_from_slice(&(self.body.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.body);
        out.extend_from_slice(&(self.children.len() as u16).to_le_bytes());
        for child in &self.children {
            out.extend_from_slice(&child.to_le_bytes());
        }
        out
    }

    /// Decode one object starting at `data[0]`. Returns the object and the number of bytes
    /// consumed, or `PoolValidation(TruncatedBody)` if the declared lengths overrun the buffer.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 5 {
            return Err(IsobusError::PoolValidation(PoolValidationError::TruncatedBody));
        }
        let id = u16::from_le_bytes([data[0], data[1]]);
        let object_type = ObjectType::from_u8(data[2])?;
        let body_len = u16::from_le_bytes([data[3], data[4]]) as usize;
        let body_start = 5;
        let body_end = body_start + body_len;
        if body_end > data.len() {
            return Err(IsobusError::PoolValidation(PoolValidationError::TruncatedBody));
        }
        let body = data[body_start..body_end].to_vec();

        if body_end + 2 > data.len() {
            return Err(IsobusError::PoolValidation(PoolValidationError::TruncatedBody));
        }
        let children_count = u16::from_le_bytes([data[body_end], data[body_end + 1]]) as usize;
        let children_start = body_end + 2;
        let children_end = children_start + children_count * 2;
        if children_end > data.len() {
            return Err(IsobusError::PoolValidation(PoolValidationError::TruncatedBody));
        }
        let mut children = Vec::with_capacity(children_count);
        for i in 0..children_count {
            let off = children_start + i * 2;
            children.push(u16::from_le_bytes([data[off], data[off + 1]]));
        }

        Ok((
            Self {
                id,
                object_type,
                body,
                children,
            },
            children_end,
        ))
    }
}

/// An ordered collection of VT objects plus a 7-character version label.
#[derive(Debug, Clone)]
pub struct ObjectPool {
    pub label: String,
    pub objects: Vec<VtObject>,
}

impl ObjectPool {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            objects: Vec::new(),
        }
    }

    pub fn push(&mut self, object: VtObject) {
        self.objects.push(object);
    }

    /// Validate the four pool invariants, returning the first violation found.
    pub fn validate(&self) -> Result<()> {
        let mut seen_ids = HashSet::new();
        let mut working_sets = 0usize;

        for object in &self.objects {
            if !seen_ids.insert(object.id) {
                return Err(IsobusError::PoolValidation(PoolValidationError::DuplicateObjectId(
                    object.id,
                )));
            }
            if object.object_type == ObjectType::WorkingSet {
                working_sets += 1;
            }
        }

        if working_sets == 0 {
            return Err(IsobusError::PoolValidation(PoolValidationError::MissingWorkingSet));
        }
        if working_sets > 1 {
            return Err(IsobusError::PoolValidation(PoolValidationError::DuplicateWorkingSet));
        }

        let working_set = self
            .objects
            .iter()
            .find(|o| o.object_type == ObjectType::WorkingSet)
            .unwrap();
        let has_mask_child = working_set.children.iter().any(|child_id| {
            self.objects.iter().any(|o| {
                o.id == *child_id && matches!(o.object_type, ObjectType::DataMask | ObjectType::AlarmMask)
            })
        });
        if !has_mask_child {
            return Err(IsobusError::PoolValidation(
                PoolValidationError::WorkingSetMissingMask,
            ));
        }

        for object in &self.objects {
            for child_id in &object.children {
                if !seen_ids.contains(child_id) {
                    return Err(IsobusError::PoolValidation(PoolValidationError::OrphanChild(
                        *child_id,
                    )));
                }
            }
        }

        Ok(())
    }

    /// Concatenate every object in insertion order.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for object in &self.objects {
            out.extend_from_slice(&object.encode());
        }
        out
    }

    /// Reconstruct a pool (minus its label, which is stored out-of-band) from serialized bytes.
    pub fn deserialize(label: impl Into<String>, data: &[u8]) -> Result<Self> {
        let mut objects = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let (object, consumed) = VtObject::decode(&data[offset..])?;
            objects.push(object);
            offset += consumed;
        }
        Ok(Self {
            label: label.into(),
            objects,
        })
    }

    pub fn object(&self, id: ObjectId) -> Option<&VtObject> {
        self.objects.iter().find(|o| o.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_pool() -> ObjectPool {
        let mut pool = ObjectPool::new("LBL0001");
        pool.push(VtObject::new(1, ObjectType::WorkingSet, vec![], vec![2]));
        pool.push(VtObject::new(2, ObjectType::DataMask, vec![0, 0], vec![]));
        pool
    }

    #[test]
    fn valid_pool_passes_validation() {
        assert!(valid_pool().validate().is_ok());
    }

    #[test]
    fn missing_working_set_fails() {
        let mut pool = ObjectPool::new("LBL0001");
        pool.push(VtObject::new(2, ObjectType::DataMask, vec![], vec![]));
        assert!(matches!(
            pool.validate(),
            Err(IsobusError::PoolValidation(PoolValidationError::MissingWorkingSet))
        ));
    }

    #[test]
    fn duplicate_working_set_fails() {
        let mut pool = valid_pool();
        pool.push(VtObject::new(3, ObjectType::WorkingSet, vec![], vec![2]));
        assert!(matches!(
            pool.validate(),
            Err(IsobusError::PoolValidation(PoolValidationError::DuplicateWorkingSet))
        ));
    }

    #[test]
    fn working_set_without_mask_child_fails() {
        let mut pool = ObjectPool::new("LBL0001");
        pool.push(VtObject::new(1, ObjectType::WorkingSet, vec![], vec![2]));
        pool.push(VtObject::new(2, ObjectType::Container, vec![], vec![]));
        assert!(matches!(
            pool.validate(),
            Err(IsobusError::PoolValidation(PoolValidationError::WorkingSetMissingMask))
        ));
    }

    #[test]
    fn orphan_child_reference_fails() {
        let mut pool = ObjectPool::new("LBL0001");
        pool.push(VtObject::new(1, ObjectType::WorkingSet, vec![], vec![99]));
        assert!(matches!(
            pool.validate(),
            Err(IsobusError::PoolValidation(PoolValidationError::OrphanChild(99)))
        ));
    }

    #[test]
    fn duplicate_object_id_fails() {
        let mut pool = ObjectPool::new("LBL0001");
        pool.push(VtObject::new(1, ObjectType::WorkingSet, vec![], vec![2]));
        pool.push(VtObject::new(1, ObjectType::DataMask, vec![], vec![]));
        assert!(matches!(
            pool.validate(),
            Err(IsobusError::PoolValidation(PoolValidationError::DuplicateObjectId(1)))
        ));
    }

    #[test]
    fn serialize_deserialize_roundtrips() {
        let pool = valid_pool();
        let bytes = pool.serialize();
        let restored = ObjectPool::deserialize(pool.label.clone(), &bytes).unwrap();
        assert_eq!(restored.objects.len(), 2);
        assert_eq!(restored.object(2).unwrap().object_type, ObjectType::DataMask);
        assert!(restored.validate().is_ok());
    }

    #[test]
    fn truncated_body_fails_pool_validation() {
        let data = vec![1, 0, 1, 10, 0]; // declares 10-byte body but none follows
        let err = VtObject::decode(&data).unwrap_err();
        assert!(matches!(
            err,
            IsobusError::PoolValidation(PoolValidationError::TruncatedBody)
        ));
    }
}
