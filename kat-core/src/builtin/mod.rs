//! Plugins compiled into the pipeline: the `dns-records` Boefje, its
//! normalizer and the DNS and port rules.

mod dns;
mod rules;

use std::sync::Arc;

pub use dns::{
    DNS_NORMALIZER, DNS_RECORDS, DnsAnswer, DnsNormalizer, DnsRecordsBoefje,
    dns_normalizer_definition, dns_records_definition,
};
pub use rules::{
    DNS_RESOLVING, IPV6_ON_NAMESERVERS, PORT_CLASSIFICATION_IP, dns_resolving,
    dns_resolving_definition, ipv6_on_nameservers,
    ipv6_on_nameservers_definition, port_classification_ip,
    port_classification_ip_definition,
};

use crate::{
    error::Result,
    registry::{
        Entrypoint, EntrypointTable, RegistryBuilder, StaticPluginRegistry,
    },
};

/// Entrypoints of every built-in plugin, named by plugin id.
pub fn entrypoints() -> EntrypointTable {
    EntrypointTable::new()
        .with(DNS_RECORDS, Entrypoint::Boefje(Arc::new(DnsRecordsBoefje)))
        .with(DNS_NORMALIZER, Entrypoint::Normalizer(Arc::new(DnsNormalizer)))
        .with(DNS_RESOLVING, Entrypoint::Rule(Arc::new(dns_resolving)))
        .with(
            IPV6_ON_NAMESERVERS,
            Entrypoint::Rule(Arc::new(ipv6_on_nameservers)),
        )
        .with(
            PORT_CLASSIFICATION_IP,
            Entrypoint::Rule(Arc::new(port_classification_ip)),
        )
}

/// Add the built-in plugins to `builder`.
pub fn register(builder: RegistryBuilder) -> Result<RegistryBuilder> {
    Ok(builder
        .boefje(dns_records_definition(), DnsRecordsBoefje)
        .normalizer(dns_normalizer_definition(), DnsNormalizer)
        .rule(dns_resolving_definition()?, dns_resolving)
        .rule(ipv6_on_nameservers_definition()?, ipv6_on_nameservers)
        .rule(port_classification_ip_definition()?, port_classification_ip))
}

/// Registry holding only the built-in plugins.
pub fn registry() -> Result<StaticPluginRegistry> {
    register(StaticPluginRegistry::builder())?.build()
}

#[cfg(test)]
mod tests {
    use kat_model::OoiType;

    use super::*;
    use crate::registry::PluginId;

    #[test]
    fn builtins_pass_registration() {
        let registry = registry().expect("built-in plugins are consistent");
        let mut rules: Vec<_> = registry
            .rules_for_root(OoiType::Hostname)
            .into_iter()
            .map(|rule| rule.id().to_string())
            .collect();
        rules.sort();
        assert_eq!(rules, vec![DNS_RESOLVING, IPV6_ON_NAMESERVERS]);
        assert!(registry.boefje(&PluginId::from(DNS_RECORDS)).is_some());
    }

    #[test]
    fn every_builtin_has_an_entrypoint() {
        let table = entrypoints();
        let names: Vec<_> = table.names().collect();
        for id in [
            DNS_RECORDS,
            DNS_NORMALIZER,
            DNS_RESOLVING,
            IPV6_ON_NAMESERVERS,
            PORT_CLASSIFICATION_IP,
        ] {
            assert!(names.contains(&id), "missing entrypoint {id}");
        }
    }
}
