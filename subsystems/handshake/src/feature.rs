//! # Feature Descriptors
//!
//! Runtime features are negotiated per endpoint as `(id, level, version)`
//! triples. The host sends what it *requests*, the device answers with what
//! it *offers*, and [`negotiate`] decides what both sides will actually use.
//!
//! ## Match Rules
//!
//! | Requested         | Response offers feature         | Negotiated    |
//! |-------------------|---------------------------------|---------------|
//! | `NotExist`        | anything                        | `NotExist`    |
//! | `NotSupport`      | anything                        | `NotExist`    |
//! | `MustSupport`     | `MustSupport`                   | `MustSupport` |
//! | `MustSupport`     | anything else                   | error         |
//! | `OptionalSupport` | version equal                   | `MustSupport` |
//! | `OptionalSupport` | version differs / not offered   | `NotSupport`  |
//! | `BackwardCompat`  | version ≥ requested             | `MustSupport` |
//! | `BackwardCompat`  | version older / not offered     | `NotExist`    |

use alloc::vec::Vec;
use core::fmt;

use crate::error::{HandshakeError, HandshakeResult};
use crate::wire::FEATURE_COUNT;

// =============================================================================
// SUPPORT LEVEL
// =============================================================================

/// How strongly a side needs or offers a feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SupportLevel {
    /// Feature unknown to this side
    NotExist        = 0,
    /// Known but not supported
    NotSupport      = 1,
    /// Must be supported by both sides
    MustSupport     = 2,
    /// Used only when versions match exactly
    OptionalSupport = 3,
    /// Used when the peer's version is the same or newer
    BackwardCompat  = 4,
}

impl SupportLevel {
    /// Every level, in encoding order
    pub const ALL: [SupportLevel; 5] = [
        SupportLevel::NotExist,
        SupportLevel::NotSupport,
        SupportLevel::MustSupport,
        SupportLevel::OptionalSupport,
        SupportLevel::BackwardCompat,
    ];

    /// Whether a response at this level actually offers the feature
    pub const fn offers(self) -> bool {
        matches!(
            self,
            Self::MustSupport | Self::OptionalSupport | Self::BackwardCompat
        )
    }
}

impl TryFrom<u8> for SupportLevel {
    type Error = HandshakeError;

    fn try_from(value: u8) -> HandshakeResult<Self> {
        match value {
            0 => Ok(Self::NotExist),
            1 => Ok(Self::NotSupport),
            2 => Ok(Self::MustSupport),
            3 => Ok(Self::OptionalSupport),
            4 => Ok(Self::BackwardCompat),
            other => Err(HandshakeError::UnknownSupportLevel(other)),
        }
    }
}

// =============================================================================
// FEATURE ID
// =============================================================================

/// Runtime feature identifier (index into the query table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeatureId(pub u8);

impl FeatureId {
    /// MD port enumeration
    pub const MD_PORT_ENUM: Self = Self(0);
    /// SAP port enumeration
    pub const SAP_PORT_ENUM: Self = Self(1);
    /// MD port configuration
    pub const MD_PORT_CFG: Self = Self(2);

    /// Table index
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MD_PORT_ENUM => write!(f, "md-port-enum"),
            Self::SAP_PORT_ENUM => write!(f, "sap-port-enum"),
            Self::MD_PORT_CFG => write!(f, "md-port-cfg"),
            Self(id) => write!(f, "feature-{}", id),
        }
    }
}

// =============================================================================
// DESCRIPTOR
// =============================================================================

const LEVEL_MASK: u8 = 0x0F;
const VERSION_SHIFT: u8 = 4;
/// Highest encodable version
pub const MAX_VERSION: u8 = 0x0F;

/// One negotiable capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeatureDescriptor {
    /// Feature id
    pub id: FeatureId,
    /// Support level
    pub level: SupportLevel,
    /// Feature version (0..=15)
    pub version: u8,
}

impl FeatureDescriptor {
    /// Create a descriptor
    pub const fn new(id: FeatureId, level: SupportLevel, version: u8) -> Self {
        Self { id, level, version }
    }

    /// Descriptor for a feature the side does not know
    pub const fn absent(id: FeatureId) -> Self {
        Self::new(id, SupportLevel::NotExist, 0)
    }

    /// Pack level and version into the wire info byte
    pub const fn info_byte(&self) -> u8 {
        (self.level as u8 & LEVEL_MASK) | ((self.version & MAX_VERSION) << VERSION_SHIFT)
    }

    /// Decode a wire info byte
    pub fn from_info(id: FeatureId, info: u8) -> HandshakeResult<Self> {
        let level = SupportLevel::try_from(info & LEVEL_MASK)?;
        Ok(Self::new(id, level, info >> VERSION_SHIFT))
    }
}

// =============================================================================
// NEGOTIATION
// =============================================================================

/// Apply the match rules to one requested feature and the peer's answer
///
/// The version rules for `OptionalSupport` and `BackwardCompat` apply only
/// when the peer offers the feature (`MustSupport`, `OptionalSupport` or
/// `BackwardCompat`). A `NotExist` or `NotSupport` answer carrying a matching
/// version still declines: `NotSupport` and `NotExist` respectively.
pub fn negotiate(
    requested: &FeatureDescriptor,
    response: &FeatureDescriptor,
) -> HandshakeResult<SupportLevel> {
    match requested.level {
        SupportLevel::NotExist | SupportLevel::NotSupport => Ok(SupportLevel::NotExist),
        SupportLevel::MustSupport => {
            if response.level == SupportLevel::MustSupport {
                Ok(SupportLevel::MustSupport)
            } else {
                Err(HandshakeError::MustSupportMismatch {
                    feature: requested.id,
                    response: response.level,
                })
            }
        },
        SupportLevel::OptionalSupport => {
            if response.level.offers() && response.version == requested.version {
                Ok(SupportLevel::MustSupport)
            } else {
                Ok(SupportLevel::NotSupport)
            }
        },
        SupportLevel::BackwardCompat => {
            if response.level.offers() && response.version >= requested.version {
                Ok(SupportLevel::MustSupport)
            } else {
                Ok(SupportLevel::NotExist)
            }
        },
    }
}

// =============================================================================
// FEATURE SET
// =============================================================================

/// Ordered list of descriptors, at most one per id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet {
    entries: Vec<FeatureDescriptor>,
}

impl FeatureSet {
    /// Empty set
    pub const fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Build a set, rejecting out-of-range ids, versions and duplicates
    pub fn new(entries: Vec<FeatureDescriptor>) -> HandshakeResult<Self> {
        for (i, d) in entries.iter().enumerate() {
            if d.id.index() >= FEATURE_COUNT {
                return Err(HandshakeError::FeatureIdOutOfRange(d.id.0));
            }
            if d.version > MAX_VERSION {
                return Err(HandshakeError::InvalidVersion(d.version));
            }
            if entries[..i].iter().any(|e| e.id == d.id) {
                return Err(HandshakeError::DuplicateFeature(d.id));
            }
        }
        Ok(Self { entries })
    }

    /// Descriptor for `id`, if present
    pub fn get(&self, id: FeatureId) -> Option<&FeatureDescriptor> {
        self.entries.iter().find(|d| d.id == id)
    }

    /// Descriptor for `id`, or `NotExist` when absent
    pub fn get_or_absent(&self, id: FeatureId) -> FeatureDescriptor {
        self.get(id)
            .copied()
            .unwrap_or_else(|| FeatureDescriptor::absent(id))
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &FeatureDescriptor> {
        self.entries.iter()
    }

    /// Number of descriptors
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render into the fixed query table indexed by feature id
    pub fn to_table(&self) -> [u8; FEATURE_COUNT] {
        let mut table = [0u8; FEATURE_COUNT];
        for d in &self.entries {
            table[d.id.index()] = d.info_byte();
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(level: SupportLevel, version: u8) -> FeatureDescriptor {
        FeatureDescriptor::new(FeatureId(5), level, version)
    }

    #[test]
    fn test_info_byte_roundtrip() {
        let d = FeatureDescriptor::new(FeatureId(3), SupportLevel::BackwardCompat, 7);
        assert_eq!(d.info_byte(), 0x74);
        assert_eq!(FeatureDescriptor::from_info(FeatureId(3), 0x74).unwrap(), d);
    }

    #[test]
    fn test_unknown_level_rejected() {
        assert_eq!(
            FeatureDescriptor::from_info(FeatureId(0), 0x05),
            Err(HandshakeError::UnknownSupportLevel(5))
        );
    }

    #[test]
    fn test_full_rule_table() {
        use SupportLevel::*;

        for &r in &SupportLevel::ALL {
            for &p in &SupportLevel::ALL {
                let out = negotiate(&req(r, 1), &req(p, 1));
                let expected = match (r, p) {
                    (NotExist | NotSupport, _) => Ok(NotExist),
                    (MustSupport, MustSupport) => Ok(MustSupport),
                    (MustSupport, _) => Err(HandshakeError::MustSupportMismatch {
                        feature: FeatureId(5),
                        response: p,
                    }),
                    (OptionalSupport, MustSupport | OptionalSupport | BackwardCompat) => {
                        Ok(MustSupport)
                    },
                    (OptionalSupport, _) => Ok(NotSupport),
                    (BackwardCompat, MustSupport | OptionalSupport | BackwardCompat) => {
                        Ok(MustSupport)
                    },
                    (BackwardCompat, _) => Ok(NotExist),
                };
                assert_eq!(out, expected, "requested {:?} response {:?}", r, p);
            }
        }
    }

    #[test]
    fn test_optional_version_mismatch() {
        for &p in &[
            SupportLevel::MustSupport,
            SupportLevel::OptionalSupport,
            SupportLevel::BackwardCompat,
        ] {
            for v in 0..=MAX_VERSION {
                let out = negotiate(&req(SupportLevel::OptionalSupport, 4), &req(p, v)).unwrap();
                if v == 4 {
                    assert_eq!(out, SupportLevel::MustSupport);
                } else {
                    assert_eq!(out, SupportLevel::NotSupport);
                }
            }
        }
    }

    #[test]
    fn test_declining_answer_ignores_version() {
        for &p in &[SupportLevel::NotExist, SupportLevel::NotSupport] {
            assert_eq!(
                negotiate(&req(SupportLevel::OptionalSupport, 3), &req(p, 3)),
                Ok(SupportLevel::NotSupport)
            );
            assert_eq!(
                negotiate(&req(SupportLevel::BackwardCompat, 1), &req(p, 9)),
                Ok(SupportLevel::NotExist)
            );
        }
    }

    #[test]
    fn test_backward_compat_versions() {
        for v in 0..=MAX_VERSION {
            let out = negotiate(
                &req(SupportLevel::BackwardCompat, 6),
                &req(SupportLevel::MustSupport, v),
            )
            .unwrap();
            if v >= 6 {
                assert_eq!(out, SupportLevel::MustSupport);
            } else {
                assert_eq!(out, SupportLevel::NotExist);
            }
        }
    }

    #[test]
    fn test_feature_set_validation() {
        let dup = FeatureSet::new(alloc::vec![
            FeatureDescriptor::new(FeatureId(1), SupportLevel::MustSupport, 0),
            FeatureDescriptor::new(FeatureId(1), SupportLevel::OptionalSupport, 0),
        ]);
        assert_eq!(dup, Err(HandshakeError::DuplicateFeature(FeatureId(1))));

        let big = FeatureSet::new(alloc::vec![FeatureDescriptor::new(
            FeatureId(64),
            SupportLevel::MustSupport,
            0
        )]);
        assert_eq!(big, Err(HandshakeError::FeatureIdOutOfRange(64)));

        let ver = FeatureSet::new(alloc::vec![FeatureDescriptor::new(
            FeatureId(0),
            SupportLevel::MustSupport,
            16
        )]);
        assert_eq!(ver, Err(HandshakeError::InvalidVersion(16)));
    }

    #[test]
    fn test_table_rendering() {
        let set = FeatureSet::new(alloc::vec![FeatureDescriptor::new(
            FeatureId::MD_PORT_CFG,
            SupportLevel::OptionalSupport,
            2
        )])
        .unwrap();
        let table = set.to_table();
        assert_eq!(table[2], 0x23);
        assert_eq!(table.iter().filter(|b| **b != 0).count(), 1);
        assert_eq!(
            set.get_or_absent(FeatureId(9)).level,
            SupportLevel::NotExist
        );
    }
}
