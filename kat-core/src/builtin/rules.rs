use kat_model::{
    DnsARecord, DnsAaaaRecord, Finding, Hostname, IpPort, KatFindingType, Ooi,
    OoiObject, OoiType, PortState, Protocol, RelationPath, ResolvedHostname,
};

use crate::{
    error::Result,
    plugin::{RuleConfig, RuleContext, RuleError},
    registry::{RuleDefinition, RuleParameter},
};

pub const DNS_RESOLVING: &str = "dns-resolving";
pub const IPV6_ON_NAMESERVERS: &str = "ipv6-on-nameservers";
pub const PORT_CLASSIFICATION_IP: &str = "port-classification-ip";

pub fn dns_resolving_definition() -> Result<RuleDefinition> {
    Ok(RuleDefinition::new(
        DNS_RESOLVING,
        OoiType::Hostname,
        [OoiType::ResolvedHostname],
    )
    .with_parameter(
        RuleParameter::new(
            "a_records",
            OoiType::DnsARecord,
            RelationPath::parse("Hostname.<hostname[is DNSARecord]")?,
        )
        .optional(),
    )
    .with_parameter(
        RuleParameter::new(
            "aaaa_records",
            OoiType::DnsAaaaRecord,
            RelationPath::parse("Hostname.<hostname[is DNSAAAARecord]")?,
        )
        .optional(),
    ))
}

/// Links a hostname to every address its A and AAAA records point at.
pub fn dns_resolving(
    root: &Ooi,
    context: &RuleContext,
    _config: &RuleConfig,
) -> std::result::Result<Vec<Ooi>, RuleError> {
    if root.downcast::<Hostname>().is_none() {
        return Err(RuleError::new(format!(
            "expected a Hostname root, got {}",
            root.object_type()
        )));
    }
    let hostname = root.reference();

    let v4 = context
        .objects_of::<DnsARecord>("a_records")
        .into_iter()
        .map(|record| record.address.clone());
    let v6 = context
        .objects_of::<DnsAaaaRecord>("aaaa_records")
        .into_iter()
        .map(|record| record.address.clone());

    Ok(v4
        .chain(v6)
        .map(|address| {
            Ooi::from(ResolvedHostname {
                hostname: hostname.clone(),
                address,
            })
        })
        .collect())
}

pub fn ipv6_on_nameservers_definition() -> Result<RuleDefinition> {
    Ok(RuleDefinition::new(
        IPV6_ON_NAMESERVERS,
        OoiType::Hostname,
        [OoiType::KatFindingType, OoiType::Finding],
    )
    .with_parameter(RuleParameter::new(
        "ns_records",
        OoiType::DnsNsRecord,
        RelationPath::parse("Hostname.<name_server_hostname[is DNSNSRecord]")?,
    ))
    .with_parameter(
        RuleParameter::new(
            "aaaa_records",
            OoiType::DnsAaaaRecord,
            RelationPath::parse("Hostname.<hostname[is DNSAAAARecord]")?,
        )
        .optional(),
    ))
}

/// A hostname serving as nameserver for any domain should have an IPv6
/// address.
pub fn ipv6_on_nameservers(
    root: &Ooi,
    context: &RuleContext,
    _config: &RuleConfig,
) -> std::result::Result<Vec<Ooi>, RuleError> {
    if context.objects("ns_records").is_empty()
        || !context.objects("aaaa_records").is_empty()
    {
        return Ok(Vec::new());
    }

    let finding_type = KatFindingType::new("KAT-NAMESERVER-NO-IPV6");
    let finding = Finding::new(
        finding_type.reference(),
        root.reference(),
        "This nameserver has no IPv6 address.",
    );
    Ok(vec![Ooi::from(finding_type), Ooi::from(finding)])
}

const COMMON_TCP_PORTS: &[u16] =
    &[25, 53, 80, 110, 143, 443, 465, 587, 993, 995];
const COMMON_UDP_PORTS: &[u16] = &[53];
const SA_TCP_PORTS: &[u16] = &[21, 22, 23, 5900];
const DB_TCP_PORTS: &[u16] = &[1433, 1434, 3050, 3306, 5432];
const MICROSOFT_RDP_PORTS: &[u16] = &[3389];

pub fn port_classification_ip_definition() -> Result<RuleDefinition> {
    Ok(RuleDefinition::new(
        PORT_CLASSIFICATION_IP,
        OoiType::IpPort,
        [OoiType::KatFindingType, OoiType::Finding],
    )
    .with_config_path(RelationPath::parse("IPPort.address.network")?))
}

/// Port list under `key`, or `default` when unset. An empty value means no
/// ports.
fn configured_ports(
    config: &RuleConfig,
    key: &str,
    default: &[u16],
) -> std::result::Result<Vec<u16>, RuleError> {
    let Some(value) = config.get(key) else {
        return Ok(default.to_vec());
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|port| !port.is_empty())
        .map(|port| {
            port.parse::<u16>().map_err(|_| {
                RuleError::new(format!("invalid port {port:?} in {key}"))
            })
        })
        .collect()
}

/// Flags open ports by category: sysadmin, database, remote desktop or
/// otherwise uncommon. With `aggregate_findings` the finding is attached to
/// the address instead of the port.
pub fn port_classification_ip(
    root: &Ooi,
    _context: &RuleContext,
    config: &RuleConfig,
) -> std::result::Result<Vec<Ooi>, RuleError> {
    let port = root.downcast::<IpPort>().ok_or_else(|| {
        RuleError::new(format!(
            "expected an IPPort root, got {}",
            root.object_type()
        ))
    })?;
    if matches!(port.state, Some(PortState::Closed | PortState::Filtered)) {
        return Ok(Vec::new());
    }

    let aggregate = config
        .get("aggregate_findings")
        .is_some_and(|value| value.eq_ignore_ascii_case("true"));
    let common_tcp =
        configured_ports(config, "common_tcp_ports", COMMON_TCP_PORTS)?;
    let common_udp =
        configured_ports(config, "common_udp_ports", COMMON_UDP_PORTS)?;
    let sa_tcp = configured_ports(config, "sa_tcp_ports", SA_TCP_PORTS)?;
    let db_tcp = configured_ports(config, "db_tcp_ports", DB_TCP_PORTS)?;
    let rdp =
        configured_ports(config, "microsoft_rdp_ports", MICROSOFT_RDP_PORTS)?;

    let number = port.port;
    let protocol = port.protocol;
    let label = format!("{number}/{protocol}");
    let classified = if protocol == Protocol::Tcp && sa_tcp.contains(&number) {
        Some((
            "KAT-OPEN-SYSADMIN-PORT",
            format!(
                "Port {label} is a system administrator port and should possibly not be open."
            ),
        ))
    } else if protocol == Protocol::Tcp && db_tcp.contains(&number) {
        Some((
            "KAT-OPEN-DATABASE-PORT",
            format!("Port {label} is a database port and should not be open."),
        ))
    } else if rdp.contains(&number) {
        Some((
            "KAT-REMOTE-DESKTOP-PORT",
            format!(
                "Port {label} is a Microsoft Remote Desktop port and should possibly not be open."
            ),
        ))
    } else if (protocol == Protocol::Tcp && !common_tcp.contains(&number))
        || (protocol == Protocol::Udp && !common_udp.contains(&number))
    {
        Some((
            "KAT-UNCOMMON-OPEN-PORT",
            format!(
                "Port {label} is not a common port and should possibly not be open."
            ),
        ))
    } else {
        None
    };

    let Some((finding_type_id, description)) = classified else {
        return Ok(Vec::new());
    };

    let (finding_type, finding) = if aggregate {
        let finding_type = KatFindingType::new("KAT-UNCOMMON-OPEN-PORT");
        let finding = Finding::new(
            finding_type.reference(),
            port.address.clone(),
            format!(
                "Ports {number} are not common ports and should possibly not be open."
            ),
        );
        (finding_type, finding)
    } else {
        let finding_type = KatFindingType::new(finding_type_id);
        let finding = Finding::new(
            finding_type.reference(),
            root.reference(),
            description,
        );
        (finding_type, finding)
    };
    Ok(vec![Ooi::from(finding_type), Ooi::from(finding)])
}
