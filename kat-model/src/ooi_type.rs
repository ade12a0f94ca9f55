use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Type tag for every node in the object graph, including the abstract
/// supertypes that rules and relations may target.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub enum OoiType {
    Ooi,
    Network,
    Hostname,
    IpAddress,
    IpAddressV4,
    IpAddressV6,
    IpPort,
    DnsRecord,
    DnsARecord,
    DnsAaaaRecord,
    DnsMxRecord,
    DnsNsRecord,
    DnsTxtRecord,
    ResolvedHostname,
    FindingType,
    KatFindingType,
    CveFindingType,
    CweFindingType,
    Finding,
    Config,
}

impl OoiType {
    pub fn all() -> &'static [Self] {
        &[
            OoiType::Ooi,
            OoiType::Network,
            OoiType::Hostname,
            OoiType::IpAddress,
            OoiType::IpAddressV4,
            OoiType::IpAddressV6,
            OoiType::IpPort,
            OoiType::DnsRecord,
            OoiType::DnsARecord,
            OoiType::DnsAaaaRecord,
            OoiType::DnsMxRecord,
            OoiType::DnsNsRecord,
            OoiType::DnsTxtRecord,
            OoiType::ResolvedHostname,
            OoiType::FindingType,
            OoiType::KatFindingType,
            OoiType::CveFindingType,
            OoiType::CweFindingType,
            OoiType::Finding,
            OoiType::Config,
        ]
    }

    pub fn name(self) -> &'static str {
        match self {
            OoiType::Ooi => "OOI",
            OoiType::Network => "Network",
            OoiType::Hostname => "Hostname",
            OoiType::IpAddress => "IPAddress",
            OoiType::IpAddressV4 => "IPAddressV4",
            OoiType::IpAddressV6 => "IPAddressV6",
            OoiType::IpPort => "IPPort",
            OoiType::DnsRecord => "DNSRecord",
            OoiType::DnsARecord => "DNSARecord",
            OoiType::DnsAaaaRecord => "DNSAAAARecord",
            OoiType::DnsMxRecord => "DNSMXRecord",
            OoiType::DnsNsRecord => "DNSNSRecord",
            OoiType::DnsTxtRecord => "DNSTXTRecord",
            OoiType::ResolvedHostname => "ResolvedHostname",
            OoiType::FindingType => "FindingType",
            OoiType::KatFindingType => "KATFindingType",
            OoiType::CveFindingType => "CVEFindingType",
            OoiType::CweFindingType => "CWEFindingType",
            OoiType::Finding => "Finding",
            OoiType::Config => "Config",
        }
    }

    /// Direct supertype in the static hierarchy. Only the root has none.
    pub fn parent(self) -> Option<OoiType> {
        match self {
            OoiType::Ooi => None,
            OoiType::IpAddressV4 | OoiType::IpAddressV6 => {
                Some(OoiType::IpAddress)
            }
            OoiType::DnsARecord
            | OoiType::DnsAaaaRecord
            | OoiType::DnsMxRecord
            | OoiType::DnsNsRecord
            | OoiType::DnsTxtRecord => Some(OoiType::DnsRecord),
            OoiType::KatFindingType
            | OoiType::CveFindingType
            | OoiType::CweFindingType => Some(OoiType::FindingType),
            _ => Some(OoiType::Ooi),
        }
    }

    /// The type itself followed by every supertype up to the root.
    pub fn ancestors(self) -> Vec<OoiType> {
        let mut chain = vec![self];
        let mut current = self;
        while let Some(parent) = current.parent() {
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// True when `self` is `other` or one of its subtypes.
    pub fn is_a(self, other: OoiType) -> bool {
        self.ancestors().contains(&other)
    }

    /// Either type is an ancestor of the other.
    pub fn overlaps(self, other: OoiType) -> bool {
        self.is_a(other) || other.is_a(self)
    }

    pub fn is_abstract(self) -> bool {
        matches!(
            self,
            OoiType::Ooi
                | OoiType::IpAddress
                | OoiType::DnsRecord
                | OoiType::FindingType
        )
    }

    pub fn concrete_subtypes(self) -> Vec<OoiType> {
        Self::all()
            .iter()
            .copied()
            .filter(|ty| !ty.is_abstract() && ty.is_a(self))
            .collect()
    }
}

impl fmt::Display for OoiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OoiType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|ty| ty.name() == s)
            .ok_or_else(|| ModelError::UnknownType(s.to_string()))
    }
}

impl TryFrom<String> for OoiType {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OoiType> for String {
    fn from(ty: OoiType) -> Self {
        ty.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_type_roots_at_ooi() {
        for ty in OoiType::all() {
            assert_eq!(ty.ancestors().last(), Some(&OoiType::Ooi), "{ty}");
        }
    }

    #[test]
    fn hierarchy_is_polymorphic() {
        assert!(OoiType::IpAddressV4.is_a(OoiType::IpAddress));
        assert!(OoiType::DnsNsRecord.is_a(OoiType::DnsRecord));
        assert!(OoiType::KatFindingType.is_a(OoiType::FindingType));
        assert!(!OoiType::IpAddress.is_a(OoiType::IpAddressV4));
        assert!(!OoiType::Hostname.is_a(OoiType::DnsRecord));
        assert!(OoiType::IpAddress.overlaps(OoiType::IpAddressV6));
    }

    #[test]
    fn names_round_trip() {
        for ty in OoiType::all() {
            assert_eq!(ty.name().parse::<OoiType>(), Ok(*ty));
        }
        assert!("Nope".parse::<OoiType>().is_err());
    }

    #[test]
    fn concrete_subtypes_skip_abstract() {
        assert_eq!(
            OoiType::IpAddress.concrete_subtypes(),
            vec![OoiType::IpAddressV4, OoiType::IpAddressV6]
        );
    }
}
