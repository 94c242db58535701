//! Per-frame controls and result metadata

use std::fmt;

/// Known control identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControlId {
    AeEnable,
    ExposureTime,
    AnalogueGain,
    Brightness,
    Contrast,
    FrameDuration,
    SensorTimestamp,
}

impl ControlId {
    pub fn name(self) -> &'static str {
        match self {
            ControlId::AeEnable => "AeEnable",
            ControlId::ExposureTime => "ExposureTime",
            ControlId::AnalogueGain => "AnalogueGain",
            ControlId::Brightness => "Brightness",
            ControlId::Contrast => "Contrast",
            ControlId::FrameDuration => "FrameDuration",
            ControlId::SensorTimestamp => "SensorTimestamp",
        }
    }
}

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
}

impl ControlValue {
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            ControlValue::Float(v) => Some(v),
            ControlValue::Int32(v) => Some(v as f32),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            ControlValue::Int32(v) => Some(v as i64),
            ControlValue::Int64(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ControlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlValue::Bool(v) => write!(f, "{v}"),
            ControlValue::Int32(v) => write!(f, "{v}"),
            ControlValue::Int64(v) => write!(f, "{v}"),
            ControlValue::Float(v) => write!(f, "{v:.6}"),
        }
    }
}

/// Ordered list of control values, one entry per id.
///
/// Backed by a vector so that clearing it between frames keeps its capacity.
#[derive(Debug, Clone, Default)]
pub struct ControlList {
    entries: Vec<(ControlId, ControlValue)>,
}

impl ControlList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value for `id`.
    pub fn set(&mut self, id: ControlId, value: ControlValue) {
        match self.entries.iter_mut().find(|(existing, _)| *existing == id) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((id, value)),
        }
    }

    pub fn get(&self, id: ControlId) -> Option<ControlValue> {
        self.entries
            .iter()
            .find(|(existing, _)| *existing == id)
            .map(|(_, value)| *value)
    }

    pub fn contains(&self, id: ControlId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ControlId, ControlValue)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn entries_capacity(&self) -> usize {
        self.entries.capacity()
    }
}
