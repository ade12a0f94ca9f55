use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ModelError, Reference};

/// Clearance granted to an object. Higher levels allow more intrusive scans.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum ScanLevel {
    #[default]
    L0 = 0,
    L1 = 1,
    L2 = 2,
    L3 = 3,
    L4 = 4,
}

impl ScanLevel {
    pub const MAX: ScanLevel = ScanLevel::L4;

    pub fn all() -> &'static [Self] {
        &[
            ScanLevel::L0,
            ScanLevel::L1,
            ScanLevel::L2,
            ScanLevel::L3,
            ScanLevel::L4,
        ]
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Clamp to an optional edge bound; `None` leaves the level untouched.
    pub fn clamp_to(self, bound: Option<ScanLevel>) -> ScanLevel {
        match bound {
            Some(bound) => self.min(bound),
            None => self,
        }
    }
}

impl TryFrom<u8> for ScanLevel {
    type Error = ModelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ScanLevel::L0),
            1 => Ok(ScanLevel::L1),
            2 => Ok(ScanLevel::L2),
            3 => Ok(ScanLevel::L3),
            4 => Ok(ScanLevel::L4),
            other => Err(ModelError::InvalidScanLevel(other)),
        }
    }
}

impl From<ScanLevel> for u8 {
    fn from(level: ScanLevel) -> Self {
        level as u8
    }
}

impl fmt::Display for ScanLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.as_u8())
    }
}

/// How a scan profile came to be.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ScanProfileKind {
    #[default]
    Empty,
    Declared,
    Inherited,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ScanProfile {
    pub reference: Reference,
    pub level: ScanLevel,
    pub kind: ScanProfileKind,
}

impl ScanProfile {
    pub fn empty(reference: Reference) -> Self {
        Self {
            reference,
            level: ScanLevel::L0,
            kind: ScanProfileKind::Empty,
        }
    }

    pub fn declared(reference: Reference, level: ScanLevel) -> Self {
        Self {
            reference,
            level,
            kind: ScanProfileKind::Declared,
        }
    }

    pub fn inherited(reference: Reference, level: ScanLevel) -> Self {
        Self {
            reference,
            level,
            kind: ScanProfileKind::Inherited,
        }
    }

    pub fn is_declared(&self) -> bool {
        matches!(self.kind, ScanProfileKind::Declared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_levels_order_and_clamp() {
        assert!(ScanLevel::L0 < ScanLevel::L4);
        assert_eq!(ScanLevel::L3.clamp_to(Some(ScanLevel::L1)), ScanLevel::L1);
        assert_eq!(ScanLevel::L3.clamp_to(None), ScanLevel::L3);
        assert_eq!(ScanLevel::L0.clamp_to(Some(ScanLevel::L4)), ScanLevel::L0);
    }

    #[test]
    fn scan_level_rejects_out_of_range() {
        assert!(ScanLevel::try_from(5).is_err());
        assert_eq!(ScanLevel::try_from(2), Ok(ScanLevel::L2));
    }

    #[test]
    fn scan_level_serializes_as_integer() {
        let json = serde_json::to_string(&ScanLevel::L2).expect("serialize");
        assert_eq!(json, "2");
        let parsed: ScanLevel = serde_json::from_str("4").expect("parse");
        assert_eq!(parsed, ScanLevel::L4);
    }
}
