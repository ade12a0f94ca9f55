use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::plugin::{Boefje, Normalizer, Rule};

/// Plugin implementation a declaration's `entrypoint` name resolves to.
#[derive(Clone)]
pub enum Entrypoint {
    Boefje(Arc<dyn Boefje>),
    Normalizer(Arc<dyn Normalizer>),
    Rule(Arc<dyn Rule>),
}

impl Entrypoint {
    pub fn kind(&self) -> &'static str {
        match self {
            Entrypoint::Boefje(_) => "boefje",
            Entrypoint::Normalizer(_) => "normalizer",
            Entrypoint::Rule(_) => "rule",
        }
    }
}

impl fmt::Debug for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entrypoint::{}", self.kind())
    }
}

/// Named implementations compiled into the binary.
#[derive(Clone, Debug, Default)]
pub struct EntrypointTable {
    entries: BTreeMap<String, Entrypoint>,
}

impl EntrypointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        name: impl Into<String>,
        entrypoint: Entrypoint,
    ) -> Self {
        self.insert(name, entrypoint);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, entrypoint: Entrypoint) {
        self.entries.insert(name.into(), entrypoint);
    }

    pub fn get(&self, name: &str) -> Option<&Entrypoint> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
