use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{ModelError, OoiType};

pub const KEY_SEPARATOR: char = '|';

/// Typed pointer `Type|token|token` to an object, usable without loading it.
#[derive(
    Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Reference(String);

impl Reference {
    pub fn from_parts<I, S>(object_type: OoiType, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut raw = object_type.name().to_string();
        for token in tokens {
            raw.push(KEY_SEPARATOR);
            raw.push_str(token.as_ref());
        }
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The type prefix. Construction guarantees it parses.
    pub fn object_type(&self) -> OoiType {
        self.0
            .split(KEY_SEPARATOR)
            .next()
            .and_then(|prefix| prefix.parse().ok())
            .unwrap_or(OoiType::Ooi)
    }

    /// Everything after the type prefix.
    pub fn natural_key(&self) -> &str {
        self.0
            .split_once(KEY_SEPARATOR)
            .map(|(_, key)| key)
            .unwrap_or_default()
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.natural_key().split(KEY_SEPARATOR)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Reference {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((prefix, key)) = s.split_once(KEY_SEPARATOR) else {
            return Err(ModelError::InvalidReference(s.to_string()));
        };
        if key.is_empty() {
            return Err(ModelError::InvalidReference(s.to_string()));
        }
        let object_type: OoiType = prefix.parse()?;
        if object_type.is_abstract() {
            return Err(ModelError::InvalidReference(format!(
                "{s}: abstract type {object_type}"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for Reference {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Reference> for String {
    fn from(reference: Reference) -> Self {
        reference.0
    }
}
