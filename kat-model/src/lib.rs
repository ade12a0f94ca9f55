//! Typed object graph vocabulary for the KAT pipeline: object types and their
//! supertype table, references, clearance levels, the relation schema and
//! relation path expressions.
#![allow(missing_docs)]

pub mod error;
pub mod objects;
pub mod ooi_type;
pub mod path;
pub mod reference;
pub mod scan_level;
pub mod schema;

pub use error::{ModelError, Result};
pub use objects::{
    Config, CveFindingType, CweFindingType, DnsARecord, DnsAaaaRecord,
    DnsMxRecord, DnsNsRecord, DnsTxtRecord, Downcast, Finding, Hostname,
    IpAddressV4, IpAddressV6, IpPort, KatFindingType, Network, Ooi, OoiKind,
    OoiObject, PortState, Protocol, ResolvedHostname, RiskLevelSeverity,
};
pub use ooi_type::OoiType;
pub use path::{Direction, RelationPath, Segment};
pub use reference::Reference;
pub use scan_level::{ScanLevel, ScanProfile, ScanProfileKind};
pub use schema::RelationField;
