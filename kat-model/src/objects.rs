//! Concrete object types and the [`OoiKind`] tagged union over them.
//!
//! Each struct declares its natural key through [`OoiObject`]; the primary key
//! of an object is the string form of its [`Reference`]. Reference-valued
//! fields inline the referenced object's natural key, except where the target
//! is polymorphic (`Finding.ooi`, `Config.ooi`) and the full reference is kept.

use std::{
    collections::BTreeMap,
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{OoiType, Reference, ScanLevel, ScanProfile};

/// Shared behaviour of every concrete object struct.
pub trait OoiObject: Clone + Into<OoiKind> {
    const OBJECT_TYPE: OoiType;

    fn natural_key_tokens(&self) -> Vec<String>;

    /// Reference-valued fields as `(field name, target)`; unset optional
    /// references are skipped.
    fn relations(&self) -> Vec<(&'static str, &Reference)> {
        Vec::new()
    }

    fn reference(&self) -> Reference {
        Reference::from_parts(Self::OBJECT_TYPE, self.natural_key_tokens())
    }
}

/// Borrow the concrete struct out of an [`OoiKind`].
pub trait Downcast {
    fn downcast(kind: &OoiKind) -> Option<&Self>;
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
}

impl Network {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn internet() -> Self {
        Self::new("internet")
    }
}

impl OoiObject for Network {
    const OBJECT_TYPE: OoiType = OoiType::Network;

    fn natural_key_tokens(&self) -> Vec<String> {
        vec![self.name.clone()]
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Hostname {
    pub network: Reference,
    pub name: String,
}

impl Hostname {
    pub fn new(network: Reference, name: impl Into<String>) -> Self {
        Self {
            network,
            name: name.into(),
        }
    }
}

impl OoiObject for Hostname {
    const OBJECT_TYPE: OoiType = OoiType::Hostname;

    fn natural_key_tokens(&self) -> Vec<String> {
        vec![self.network.natural_key().to_string(), self.name.clone()]
    }

    fn relations(&self) -> Vec<(&'static str, &Reference)> {
        vec![("network", &self.network)]
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct IpAddressV4 {
    pub network: Reference,
    pub address: Ipv4Addr,
}

impl OoiObject for IpAddressV4 {
    const OBJECT_TYPE: OoiType = OoiType::IpAddressV4;

    fn natural_key_tokens(&self) -> Vec<String> {
        vec![
            self.network.natural_key().to_string(),
            self.address.to_string(),
        ]
    }

    fn relations(&self) -> Vec<(&'static str, &Reference)> {
        vec![("network", &self.network)]
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct IpAddressV6 {
    pub network: Reference,
    pub address: Ipv6Addr,
}

impl OoiObject for IpAddressV6 {
    const OBJECT_TYPE: OoiType = OoiType::IpAddressV6;

    fn natural_key_tokens(&self) -> Vec<String> {
        vec![
            self.network.natural_key().to_string(),
            self.address.to_string(),
        ]
    }

    fn relations(&self) -> Vec<(&'static str, &Reference)> {
        vec![("network", &self.network)]
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct IpPort {
    pub address: Reference,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(default)]
    pub state: Option<PortState>,
}

impl OoiObject for IpPort {
    const OBJECT_TYPE: OoiType = OoiType::IpPort;

    fn natural_key_tokens(&self) -> Vec<String> {
        vec![
            self.address.natural_key().to_string(),
            self.protocol.to_string(),
            self.port.to_string(),
        ]
    }

    fn relations(&self) -> Vec<(&'static str, &Reference)> {
        vec![("address", &self.address)]
    }
}

fn record_key(hostname: &Reference, value: &str) -> Vec<String> {
    vec![hostname.natural_key().to_string(), value.to_string()]
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DnsARecord {
    pub hostname: Reference,
    pub value: String,
    pub address: Reference,
    #[serde(default)]
    pub ttl: Option<u32>,
}

impl OoiObject for DnsARecord {
    const OBJECT_TYPE: OoiType = OoiType::DnsARecord;

    fn natural_key_tokens(&self) -> Vec<String> {
        record_key(&self.hostname, &self.value)
    }

    fn relations(&self) -> Vec<(&'static str, &Reference)> {
        vec![("hostname", &self.hostname), ("address", &self.address)]
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DnsAaaaRecord {
    pub hostname: Reference,
    pub value: String,
    pub address: Reference,
    #[serde(default)]
    pub ttl: Option<u32>,
}

impl OoiObject for DnsAaaaRecord {
    const OBJECT_TYPE: OoiType = OoiType::DnsAaaaRecord;

    fn natural_key_tokens(&self) -> Vec<String> {
        record_key(&self.hostname, &self.value)
    }

    fn relations(&self) -> Vec<(&'static str, &Reference)> {
        vec![("hostname", &self.hostname), ("address", &self.address)]
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DnsMxRecord {
    pub hostname: Reference,
    pub value: String,
    #[serde(default)]
    pub mail_hostname: Option<Reference>,
    #[serde(default)]
    pub preference: Option<u16>,
    #[serde(default)]
    pub ttl: Option<u32>,
}

impl OoiObject for DnsMxRecord {
    const OBJECT_TYPE: OoiType = OoiType::DnsMxRecord;

    fn natural_key_tokens(&self) -> Vec<String> {
        record_key(&self.hostname, &self.value)
    }

    fn relations(&self) -> Vec<(&'static str, &Reference)> {
        let mut relations = vec![("hostname", &self.hostname)];
        if let Some(mail) = &self.mail_hostname {
            relations.push(("mail_hostname", mail));
        }
        relations
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DnsNsRecord {
    pub hostname: Reference,
    pub value: String,
    pub name_server_hostname: Reference,
    #[serde(default)]
    pub ttl: Option<u32>,
}

impl OoiObject for DnsNsRecord {
    const OBJECT_TYPE: OoiType = OoiType::DnsNsRecord;

    fn natural_key_tokens(&self) -> Vec<String> {
        record_key(&self.hostname, &self.value)
    }

    fn relations(&self) -> Vec<(&'static str, &Reference)> {
        vec![
            ("hostname", &self.hostname),
            ("name_server_hostname", &self.name_server_hostname),
        ]
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DnsTxtRecord {
    pub hostname: Reference,
    pub value: String,
    #[serde(default)]
    pub ttl: Option<u32>,
}

impl OoiObject for DnsTxtRecord {
    const OBJECT_TYPE: OoiType = OoiType::DnsTxtRecord;

    fn natural_key_tokens(&self) -> Vec<String> {
        record_key(&self.hostname, &self.value)
    }

    fn relations(&self) -> Vec<(&'static str, &Reference)> {
        vec![("hostname", &self.hostname)]
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ResolvedHostname {
    pub hostname: Reference,
    pub address: Reference,
}

impl OoiObject for ResolvedHostname {
    const OBJECT_TYPE: OoiType = OoiType::ResolvedHostname;

    fn natural_key_tokens(&self) -> Vec<String> {
        vec![
            self.hostname.natural_key().to_string(),
            self.address.natural_key().to_string(),
        ]
    }

    fn relations(&self) -> Vec<(&'static str, &Reference)> {
        vec![("hostname", &self.hostname), ("address", &self.address)]
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevelSeverity {
    Critical,
    High,
    Medium,
    Low,
    Recommendation,
    Pending,
    Unknown,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct KatFindingType {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub risk_severity: Option<RiskLevelSeverity>,
}

impl KatFindingType {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            risk_severity: None,
        }
    }
}

impl OoiObject for KatFindingType {
    const OBJECT_TYPE: OoiType = OoiType::KatFindingType;

    fn natural_key_tokens(&self) -> Vec<String> {
        vec![self.id.clone()]
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CveFindingType {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub risk_severity: Option<RiskLevelSeverity>,
}

impl OoiObject for CveFindingType {
    const OBJECT_TYPE: OoiType = OoiType::CveFindingType;

    fn natural_key_tokens(&self) -> Vec<String> {
        vec![self.id.clone()]
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CweFindingType {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub risk_severity: Option<RiskLevelSeverity>,
}

impl OoiObject for CweFindingType {
    const OBJECT_TYPE: OoiType = OoiType::CweFindingType;

    fn natural_key_tokens(&self) -> Vec<String> {
        vec![self.id.clone()]
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Finding {
    pub finding_type: Reference,
    pub ooi: Reference,
    #[serde(default)]
    pub proof: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reproduce: Option<String>,
}

impl Finding {
    pub fn new(
        finding_type: Reference,
        ooi: Reference,
        description: impl Into<String>,
    ) -> Self {
        Self {
            finding_type,
            ooi,
            proof: None,
            description: Some(description.into()),
            reproduce: None,
        }
    }
}

impl OoiObject for Finding {
    const OBJECT_TYPE: OoiType = OoiType::Finding;

    fn natural_key_tokens(&self) -> Vec<String> {
        vec![
            self.ooi.to_string(),
            self.finding_type.natural_key().to_string(),
        ]
    }

    fn relations(&self) -> Vec<(&'static str, &Reference)> {
        vec![("finding_type", &self.finding_type), ("ooi", &self.ooi)]
    }
}

/// Per-rule settings attached to an object, keyed by the rule id.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Config {
    pub ooi: Reference,
    pub bit_id: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl Config {
    pub fn reference_for(ooi: &Reference, bit_id: &str) -> Reference {
        Reference::from_parts(OoiType::Config, [ooi.as_str(), bit_id])
    }
}

impl OoiObject for Config {
    const OBJECT_TYPE: OoiType = OoiType::Config;

    fn natural_key_tokens(&self) -> Vec<String> {
        vec![self.ooi.to_string(), self.bit_id.clone()]
    }

    fn relations(&self) -> Vec<(&'static str, &Reference)> {
        vec![("ooi", &self.ooi)]
    }
}

macro_rules! ooi_kinds {
    ($($variant:ident($ty:ident) => $tag:literal),+ $(,)?) => {
        /// Tagged union over every concrete object type.
        #[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
        #[serde(tag = "object_type")]
        pub enum OoiKind {
            $(
                #[serde(rename = $tag)]
                $variant($ty),
            )+
        }

        impl OoiKind {
            pub fn object_type(&self) -> OoiType {
                match self {
                    $(OoiKind::$variant(_) => <$ty as OoiObject>::OBJECT_TYPE,)+
                }
            }

            pub fn reference(&self) -> Reference {
                match self {
                    $(OoiKind::$variant(inner) => inner.reference(),)+
                }
            }

            pub fn relations(&self) -> Vec<(&'static str, &Reference)> {
                match self {
                    $(OoiKind::$variant(inner) => inner.relations(),)+
                }
            }
        }

        $(
            impl From<$ty> for OoiKind {
                fn from(value: $ty) -> Self {
                    OoiKind::$variant(value)
                }
            }

            impl Downcast for $ty {
                fn downcast(kind: &OoiKind) -> Option<&Self> {
                    match kind {
                        OoiKind::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            }
        )+
    };
}

ooi_kinds! {
    Network(Network) => "Network",
    Hostname(Hostname) => "Hostname",
    IpAddressV4(IpAddressV4) => "IPAddressV4",
    IpAddressV6(IpAddressV6) => "IPAddressV6",
    IpPort(IpPort) => "IPPort",
    DnsARecord(DnsARecord) => "DNSARecord",
    DnsAaaaRecord(DnsAaaaRecord) => "DNSAAAARecord",
    DnsMxRecord(DnsMxRecord) => "DNSMXRecord",
    DnsNsRecord(DnsNsRecord) => "DNSNSRecord",
    DnsTxtRecord(DnsTxtRecord) => "DNSTXTRecord",
    ResolvedHostname(ResolvedHostname) => "ResolvedHostname",
    KatFindingType(KatFindingType) => "KATFindingType",
    CveFindingType(CveFindingType) => "CVEFindingType",
    CweFindingType(CweFindingType) => "CWEFindingType",
    Finding(Finding) => "Finding",
    Config(Config) => "Config",
}

/// An object together with its clearance and the valid time it was read at.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Ooi {
    pub object: OoiKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_profile: Option<ScanProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_time: Option<DateTime<Utc>>,
}

impl Ooi {
    pub fn new(object: impl Into<OoiKind>) -> Self {
        Self {
            object: object.into(),
            scan_profile: None,
            valid_time: None,
        }
    }

    pub fn with_scan_level(mut self, level: ScanLevel) -> Self {
        self.scan_profile =
            Some(ScanProfile::declared(self.reference(), level));
        self
    }

    pub fn with_valid_time(mut self, valid_time: DateTime<Utc>) -> Self {
        self.valid_time = Some(valid_time);
        self
    }

    pub fn object_type(&self) -> OoiType {
        self.object.object_type()
    }

    pub fn reference(&self) -> Reference {
        self.object.reference()
    }

    pub fn primary_key(&self) -> String {
        self.reference().to_string()
    }

    pub fn relations(&self) -> Vec<(&'static str, &Reference)> {
        self.object.relations()
    }

    /// Effective clearance; objects without a profile sit at L0.
    pub fn scan_level(&self) -> ScanLevel {
        self.scan_profile
            .as_ref()
            .map(|profile| profile.level)
            .unwrap_or_default()
    }

    pub fn downcast<T: Downcast>(&self) -> Option<&T> {
        T::downcast(&self.object)
    }

    /// Value of a reference-valued field by name.
    pub fn relation(&self, field: &str) -> Option<&Reference> {
        self.relations()
            .into_iter()
            .find(|(name, _)| *name == field)
            .map(|(_, target)| target)
    }
}

impl<T: OoiObject> From<T> for Ooi {
    fn from(value: T) -> Self {
        Ooi::new(value)
    }
}
