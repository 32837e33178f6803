use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Bits reserved for the coarse component id (upper bits of a probe id).
pub const COMPONENT_BITS: u32 = 6;
/// Bits reserved for the sub-unit id inside a component.
pub const UNIT_BITS: u32 = 8;
/// Bits reserved for the location id inside a sub-unit.
pub const LOCATION_BITS: u32 = 10;
/// Total width of the probe id space.
pub const PROBE_BITS: u32 = COMPONENT_BITS + UNIT_BITS + LOCATION_BITS;
/// Number of distinct probe ids; also the size of a full coverage table.
pub const PROBE_SPACE: usize = 1 << PROBE_BITS;

/// Errors raised when packing or validating probe ids.
///
/// These indicate that the instrumentation handed the engine ids it cannot represent, so the
/// coverage signal is untrustworthy and the session must stop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// A sub-field does not fit into its fixed bit width.
    #[error("Probe {field} id {value} does not fit in {bits} bits")]
    FieldOverflow {
        field: &'static str,
        value: u32,
        bits: u32,
    },
    /// A raw id lies outside the packed probe space.
    #[error("Raw probe id {0:#x} is outside the probe space")]
    OutOfRange(u32),
}

/// A packed coverage probe id: `component | unit | location`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProbeId(u32);

impl ProbeId {
    /// Packs the three sub-fields into a single id, rejecting any overflowing field.
    pub fn pack(component: u32, unit: u32, location: u32) -> Result<Self, ProbeError> {
        check_field("component", component, COMPONENT_BITS)?;
        check_field("unit", unit, UNIT_BITS)?;
        check_field("location", location, LOCATION_BITS)?;
        Ok(Self(
            (component << (UNIT_BITS + LOCATION_BITS)) | (unit << LOCATION_BITS) | location,
        ))
    }

    pub fn from_raw(raw: u32) -> Result<Self, ProbeError> {
        if (raw as usize) < PROBE_SPACE {
            Ok(Self(raw))
        } else {
            Err(ProbeError::OutOfRange(raw))
        }
    }

    /// Returns `(component, unit, location)`.
    pub fn unpack(self) -> (u32, u32, u32) {
        (
            self.0 >> (UNIT_BITS + LOCATION_BITS),
            (self.0 >> LOCATION_BITS) & mask(UNIT_BITS),
            self.0 & mask(LOCATION_BITS),
        )
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (component, unit, location) = self.unpack();
        write!(f, "{component}:{unit}:{location}")
    }
}

fn mask(bits: u32) -> u32 {
    (1 << bits) - 1
}

fn check_field(field: &'static str, value: u32, bits: u32) -> Result<(), ProbeError> {
    if value > mask(bits) {
        return Err(ProbeError::FieldOverflow { field, value, bits });
    }
    Ok(())
}
