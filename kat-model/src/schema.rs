//! Static relation schema: which reference fields exist on which types, what
//! they point at, and the clearance bounds each edge carries.

use crate::{ModelError, OoiType, Result, ScanLevel};

/// A reference-valued field declared on `source` pointing at `target`.
///
/// `max_issue_scan_level` bounds the clearance `source` may grant to the
/// object it points at; `max_inherit_scan_level` bounds what `source` may
/// inherit back from it. A `None` bound carries no clearance during profile
/// propagation and does not clamp objects resolved across the edge.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RelationField {
    pub source: OoiType,
    pub name: &'static str,
    pub target: OoiType,
    pub max_issue_scan_level: Option<ScanLevel>,
    pub max_inherit_scan_level: Option<ScanLevel>,
}

impl RelationField {
    /// Lowest declared bound on this edge in either direction.
    pub fn firewall_bound(&self) -> Option<ScanLevel> {
        match (self.max_issue_scan_level, self.max_inherit_scan_level) {
            (Some(issue), Some(inherit)) => Some(issue.min(inherit)),
            (Some(bound), None) | (None, Some(bound)) => Some(bound),
            (None, None) => None,
        }
    }
}

const fn field(
    source: OoiType,
    name: &'static str,
    target: OoiType,
    max_issue_scan_level: Option<ScanLevel>,
    max_inherit_scan_level: Option<ScanLevel>,
) -> RelationField {
    RelationField {
        source,
        name,
        target,
        max_issue_scan_level,
        max_inherit_scan_level,
    }
}

static RELATIONS: &[RelationField] = &[
    field(OoiType::Hostname, "network", OoiType::Network, None, None),
    field(OoiType::IpAddress, "network", OoiType::Network, None, None),
    field(
        OoiType::IpPort,
        "address",
        OoiType::IpAddress,
        Some(ScanLevel::L0),
        Some(ScanLevel::L4),
    ),
    field(
        OoiType::DnsRecord,
        "hostname",
        OoiType::Hostname,
        Some(ScanLevel::L0),
        Some(ScanLevel::L2),
    ),
    field(OoiType::DnsARecord, "address", OoiType::IpAddressV4, None, None),
    field(
        OoiType::DnsAaaaRecord,
        "address",
        OoiType::IpAddressV6,
        None,
        None,
    ),
    field(
        OoiType::DnsMxRecord,
        "mail_hostname",
        OoiType::Hostname,
        None,
        None,
    ),
    field(
        OoiType::DnsNsRecord,
        "name_server_hostname",
        OoiType::Hostname,
        Some(ScanLevel::L1),
        Some(ScanLevel::L0),
    ),
    field(
        OoiType::ResolvedHostname,
        "hostname",
        OoiType::Hostname,
        Some(ScanLevel::L0),
        Some(ScanLevel::L4),
    ),
    field(
        OoiType::ResolvedHostname,
        "address",
        OoiType::IpAddress,
        Some(ScanLevel::L4),
        Some(ScanLevel::L0),
    ),
    field(
        OoiType::Finding,
        "finding_type",
        OoiType::FindingType,
        None,
        None,
    ),
    field(OoiType::Finding, "ooi", OoiType::Ooi, None, None),
    field(OoiType::Config, "ooi", OoiType::Ooi, None, None),
];

pub fn relations() -> &'static [RelationField] {
    RELATIONS
}

/// Field `name` as seen from `object_type`, including fields inherited from
/// a supertype (`DNSARecord.hostname` is declared on `DNSRecord`).
pub fn relation(
    object_type: OoiType,
    name: &str,
) -> Option<&'static RelationField> {
    RELATIONS
        .iter()
        .find(|field| field.name == name && object_type.is_a(field.source))
}

pub fn require_relation(
    object_type: OoiType,
    name: &str,
) -> Result<&'static RelationField> {
    relation(object_type, name).ok_or_else(|| ModelError::UnknownRelation {
        object_type: object_type.to_string(),
        field: name.to_string(),
    })
}

/// Fields whose target may hold an object of `object_type`.
pub fn incoming_relations(
    object_type: OoiType,
) -> impl Iterator<Item = &'static RelationField> {
    RELATIONS
        .iter()
        .filter(move |field| object_type.is_a(field.target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inherited_fields_resolve_through_supertype() {
        let hostname = relation(OoiType::DnsNsRecord, "hostname")
            .expect("DNSRecord.hostname applies to NS records");
        assert_eq!(hostname.source, OoiType::DnsRecord);
        assert_eq!(hostname.target, OoiType::Hostname);
        assert!(relation(OoiType::Hostname, "hostname").is_none());
    }

    #[test]
    fn firewall_bound_takes_the_lowest_side() {
        let ns = relation(OoiType::DnsNsRecord, "name_server_hostname")
            .expect("declared");
        assert_eq!(ns.firewall_bound(), Some(ScanLevel::L0));
        let network = relation(OoiType::Hostname, "network").expect("declared");
        assert_eq!(network.firewall_bound(), None);
    }

    #[test]
    fn incoming_relations_for_hostname() {
        let names: Vec<_> = incoming_relations(OoiType::Hostname)
            .map(|field| (field.source, field.name))
            .collect();
        assert!(names.contains(&(OoiType::DnsRecord, "hostname")));
        assert!(names.contains(&(OoiType::Finding, "ooi")));
        assert!(!names.contains(&(OoiType::Hostname, "network")));
    }
}
