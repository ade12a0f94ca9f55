//! Relation path expressions such as `Hostname.<hostname[is DNSARecord]`.
//!
//! A path starts at a root type and walks reference fields: `.field` follows a
//! field of the current object (outgoing), `.<field[is Type]` finds objects of
//! `Type` whose `field` points back at the current object (incoming). Paths
//! are validated against the static schema when parsed.

use std::{fmt, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    ModelError, OoiType, Result, ScanLevel,
    schema::{self, RelationField},
};

static INCOMING_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^<([A-Za-z_][A-Za-z0-9_]*)\[is ([A-Za-z0-9]+)\]$")
        .expect("incoming segment regex should compile")
});

static OUTGOING_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")
        .expect("outgoing segment regex should compile")
});

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Segment {
    pub direction: Direction,
    pub field: &'static RelationField,
    pub from: OoiType,
    pub to: OoiType,
}

impl Segment {
    /// Clearance bound for what flows from `from` to `to` along this step.
    pub fn issuance_bound(&self) -> Option<ScanLevel> {
        match self.direction {
            Direction::Outgoing => self.field.max_issue_scan_level,
            Direction::Incoming => self.field.max_inherit_scan_level,
        }
    }

    fn flipped(&self) -> Segment {
        Segment {
            direction: match self.direction {
                Direction::Outgoing => Direction::Incoming,
                Direction::Incoming => Direction::Outgoing,
            },
            field: self.field,
            from: self.to,
            to: self.from,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Outgoing => write!(f, "{}", self.field.name),
            Direction::Incoming => {
                write!(f, "<{}[is {}]", self.field.name, self.to)
            }
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelationPath {
    root: OoiType,
    segments: Vec<Segment>,
}

impl RelationPath {
    pub fn parse(expr: &str) -> Result<Self> {
        let invalid = |reason: String| ModelError::InvalidPath {
            path: expr.to_string(),
            reason,
        };

        let mut parts = expr.split('.');
        let root_name = parts.next().unwrap_or_default().trim();
        let root: OoiType = root_name
            .parse()
            .map_err(|_| invalid(format!("unknown root type {root_name:?}")))?;

        let mut segments = Vec::new();
        let mut current = root;
        for raw in parts {
            let raw = raw.trim();
            let segment = if let Some(caps) = INCOMING_SEGMENT.captures(raw) {
                let name = &caps[1];
                let holder: OoiType = caps[2]
                    .parse()
                    .map_err(|_| invalid(format!("unknown type in {raw:?}")))?;
                let field = schema::relation(holder, name).ok_or_else(|| {
                    invalid(format!("{holder} has no relation {name}"))
                })?;
                if !field.target.overlaps(current) {
                    return Err(invalid(format!(
                        "{holder}.{name} points at {}, not {current}",
                        field.target
                    )));
                }
                Segment {
                    direction: Direction::Incoming,
                    field,
                    from: current,
                    to: holder,
                }
            } else if OUTGOING_SEGMENT.is_match(raw) {
                let field = schema::relation(current, raw).ok_or_else(|| {
                    invalid(format!("{current} has no relation {raw}"))
                })?;
                Segment {
                    direction: Direction::Outgoing,
                    field,
                    from: current,
                    to: field.target,
                }
            } else {
                return Err(invalid(format!("malformed segment {raw:?}")));
            };
            current = segment.to;
            segments.push(segment);
        }

        Ok(Self { root, segments })
    }

    /// Path of length zero: the root itself.
    pub fn identity(root: OoiType) -> Self {
        Self {
            root,
            segments: Vec::new(),
        }
    }

    pub fn root(&self) -> OoiType {
        self.root
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn end_type(&self) -> OoiType {
        self.segments.last().map(|s| s.to).unwrap_or(self.root)
    }

    /// Lowest bound of any edge crossed, regardless of direction.
    pub fn firewall_bound(&self) -> Option<ScanLevel> {
        self.segments
            .iter()
            .filter_map(|segment| segment.field.firewall_bound())
            .min()
    }

    /// Lowest directional issuance bound along the walk.
    pub fn issuance_bound(&self) -> Option<ScanLevel> {
        self.segments
            .iter()
            .filter_map(Segment::issuance_bound)
            .min()
    }

    /// The same walk from the end type back to the root.
    pub fn reversed(&self) -> Self {
        Self {
            root: self.end_type(),
            segments: self
                .segments
                .iter()
                .rev()
                .map(Segment::flipped)
                .collect(),
        }
    }
}

impl fmt::Display for RelationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for segment in &self.segments {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for RelationPath {
    type Err = ModelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RelationPath {
    type Error = ModelError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RelationPath> for String {
    fn from(path: RelationPath) -> Self {
        path.to_string()
    }
}
