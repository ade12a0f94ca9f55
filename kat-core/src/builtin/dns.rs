use std::{
    collections::BTreeSet,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use async_trait::async_trait;
use kat_model::{
    DnsARecord, DnsAaaaRecord, DnsMxRecord, DnsNsRecord, DnsTxtRecord, Hostname,
    IpAddressV4, IpAddressV6, Ooi, OoiObject, OoiType, Reference, ScanLevel,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{PipelineError, Result},
    job::{BoefjeJob, NormalizerJob, RawResult},
    plugin::{Boefje, Normalizer, ScanError},
    registry::{
        BoefjeDefinition, NormalizerDefinition, PluginId, boefje_content_tag,
    },
};

pub const DNS_RECORDS: &str = "dns-records";
pub const DNS_NORMALIZER: &str = "kat_dns_normalize";

/// Raw answer exchanged between the Boefje and the normalizer. Records are
/// zone-file lines: `name ttl class type value`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsAnswer {
    pub dns_records: String,
}

impl DnsAnswer {
    /// Answer listing the addresses a name resolved to.
    pub fn from_addresses(
        name: &str,
        addresses: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        let name = name.trim_end_matches('.');
        let unique: BTreeSet<IpAddr> = addresses.into_iter().collect();
        let dns_records = unique
            .into_iter()
            .map(|address| {
                let rtype = if address.is_ipv4() { "A" } else { "AAAA" };
                format!("{name}. 0 IN {rtype} {address}")
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self { dns_records }
    }
}

pub fn dns_records_definition() -> BoefjeDefinition {
    let id = PluginId::from(DNS_RECORDS);
    BoefjeDefinition {
        produces: [boefje_content_tag(&id)].into_iter().collect(),
        id,
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        consumes: [OoiType::Hostname].into_iter().collect(),
        scan_level: ScanLevel::L1,
    }
}

pub fn dns_normalizer_definition() -> NormalizerDefinition {
    NormalizerDefinition {
        id: PluginId::from(DNS_NORMALIZER),
        consumes: [boefje_content_tag(&PluginId::from(DNS_RECORDS))]
            .into_iter()
            .collect(),
        produces: [
            OoiType::Hostname,
            OoiType::IpAddressV4,
            OoiType::IpAddressV6,
            OoiType::DnsARecord,
            OoiType::DnsAaaaRecord,
            OoiType::DnsMxRecord,
            OoiType::DnsNsRecord,
            OoiType::DnsTxtRecord,
        ]
        .into_iter()
        .collect(),
    }
}

/// Resolves a hostname through the system resolver.
#[derive(Clone, Copy, Debug, Default)]
pub struct DnsRecordsBoefje;

#[async_trait]
impl Boefje for DnsRecordsBoefje {
    async fn scan(
        &self,
        _job: &BoefjeJob,
        input: &Ooi,
    ) -> std::result::Result<RawResult, ScanError> {
        let hostname = input.downcast::<Hostname>().ok_or_else(|| {
            ScanError::Infrastructure(format!(
                "{DNS_RECORDS} cannot scan {}",
                input.object_type()
            ))
        })?;

        let addresses = tokio::net::lookup_host((hostname.name.as_str(), 0))
            .await
            .map_err(|err| {
                ScanError::Expected(format!(
                    "resolving {} failed: {err}",
                    hostname.name
                ))
            })?
            .map(|socket| socket.ip());

        let answer = DnsAnswer::from_addresses(&hostname.name, addresses);
        let bytes = serde_json::to_vec(&answer)
            .map_err(|err| ScanError::Infrastructure(err.to_string()))?;
        Ok(RawResult::new(bytes))
    }
}

/// Parses [`DnsAnswer`] payloads into hostnames, records and addresses.
#[derive(Clone, Copy, Debug, Default)]
pub struct DnsNormalizer;

#[async_trait]
impl Normalizer for DnsNormalizer {
    async fn normalize(
        &self,
        _job: &NormalizerJob,
        input: &Ooi,
        raw: &[u8],
    ) -> Result<Vec<Ooi>> {
        let hostname = input.downcast::<Hostname>().ok_or_else(|| {
            PipelineError::MalformedInput(format!(
                "{DNS_NORMALIZER} expects a Hostname input, got {}",
                input.object_type()
            ))
        })?;
        if raw.trim_ascii() == b"NXDOMAIN" {
            return Ok(Vec::new());
        }

        let answer: DnsAnswer = serde_json::from_slice(raw)
            .map_err(|err| PipelineError::MalformedInput(err.to_string()))?;

        let mut parser = AnswerParser::new(hostname.network.clone());
        parser.push(Ooi::from(hostname.clone()));
        for line in answer.dns_records.lines() {
            parser.line(line)?;
        }
        Ok(parser.objects)
    }
}

struct AnswerParser {
    network: Reference,
    objects: Vec<Ooi>,
}

fn malformed(line: &str, reason: &str) -> PipelineError {
    PipelineError::MalformedInput(format!("{reason}: {line:?}"))
}

impl AnswerParser {
    fn new(network: Reference) -> Self {
        Self {
            network,
            objects: Vec::new(),
        }
    }

    fn push(&mut self, ooi: Ooi) {
        self.objects.push(ooi);
    }

    fn hostname(&mut self, name: &str) -> Reference {
        let host =
            Hostname::new(self.network.clone(), name.trim_end_matches('.'));
        let reference = host.reference();
        self.push(Ooi::from(host));
        reference
    }

    fn line(&mut self, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            return Ok(());
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [name, ttl, _class, rtype, rest @ ..] = tokens.as_slice() else {
            return Err(malformed(line, "expected `name ttl class type value`"));
        };
        if rest.is_empty() {
            return Err(malformed(line, "record without value"));
        }
        let ttl = ttl.parse::<u32>().ok();
        let value = rest.join(" ");

        match rtype.to_ascii_uppercase().as_str() {
            "A" => {
                let address: Ipv4Addr = value
                    .parse()
                    .map_err(|_| malformed(line, "invalid IPv4 address"))?;
                let hostname = self.hostname(name);
                let ip = IpAddressV4 {
                    network: self.network.clone(),
                    address,
                };
                let record = DnsARecord {
                    hostname,
                    value,
                    address: ip.reference(),
                    ttl,
                };
                self.push(Ooi::from(ip));
                self.push(Ooi::from(record));
            }
            "AAAA" => {
                let address: Ipv6Addr = value
                    .parse()
                    .map_err(|_| malformed(line, "invalid IPv6 address"))?;
                let hostname = self.hostname(name);
                let ip = IpAddressV6 {
                    network: self.network.clone(),
                    address,
                };
                let record = DnsAaaaRecord {
                    hostname,
                    value,
                    address: ip.reference(),
                    ttl,
                };
                self.push(Ooi::from(ip));
                self.push(Ooi::from(record));
            }
            "NS" => {
                let hostname = self.hostname(name);
                let name_server_hostname = self.hostname(&value);
                self.push(Ooi::from(DnsNsRecord {
                    hostname,
                    value,
                    name_server_hostname,
                    ttl,
                }));
            }
            "MX" => {
                let [preference, exchange] = rest else {
                    return Err(malformed(
                        line,
                        "expected `preference exchange`",
                    ));
                };
                let preference = preference
                    .parse::<u16>()
                    .map_err(|_| malformed(line, "invalid MX preference"))?;
                let hostname = self.hostname(name);
                // "0 ." is a null MX: the domain accepts no mail.
                let mail_hostname = match exchange.trim_end_matches('.') {
                    "" => None,
                    exchange => Some(self.hostname(exchange)),
                };
                self.push(Ooi::from(DnsMxRecord {
                    hostname,
                    value,
                    mail_hostname,
                    preference: Some(preference),
                    ttl,
                }));
            }
            "TXT" => {
                let hostname = self.hostname(name);
                self.push(Ooi::from(DnsTxtRecord {
                    hostname,
                    value: value.trim_matches('"').to_string(),
                    ttl,
                }));
            }
            other => {
                debug!(
                    target: "kat::normalizer",
                    record_type = other,
                    "skipping unsupported record type"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use kat_model::Network;

    use super::*;
    use crate::job::PluginRef;

    fn example() -> Ooi {
        Ooi::from(Hostname::new(Network::internet().reference(), "example.com"))
    }

    fn job() -> NormalizerJob {
        let boefje =
            BoefjeJob::new(PluginRef::new(DNS_RECORDS), &example(), "test")
                .expect("boefje job");
        NormalizerJob::new(boefje, PluginRef::new(DNS_NORMALIZER))
    }

    fn answer(records: &str) -> Vec<u8> {
        serde_json::to_vec(&DnsAnswer {
            dns_records: records.to_string(),
        })
        .expect("serializable")
    }

    fn types(objects: &[Ooi]) -> Vec<OoiType> {
        let mut types: Vec<_> = objects.iter().map(Ooi::object_type).collect();
        types.sort();
        types.dedup();
        types
    }

    #[tokio::test]
    async fn parses_address_records() {
        let raw = answer(
            "example.com. 300 IN A 192.0.2.10\n\
             example.com. 300 IN AAAA 2001:db8::1",
        );
        let objects = DnsNormalizer
            .normalize(&job(), &example(), &raw)
            .await
            .expect("parsed");

        assert_eq!(
            types(&objects),
            vec![
                OoiType::Hostname,
                OoiType::IpAddressV4,
                OoiType::IpAddressV6,
                OoiType::DnsARecord,
                OoiType::DnsAaaaRecord,
            ]
        );
        let record = objects
            .iter()
            .find_map(|ooi| ooi.downcast::<DnsARecord>())
            .expect("A record");
        assert_eq!(record.hostname, example().reference());
        assert_eq!(record.ttl, Some(300));
        assert_eq!(record.address.as_str(), "IPAddressV4|internet|192.0.2.10");
    }

    #[tokio::test]
    async fn parses_ns_mx_and_txt() {
        let raw = answer(
            "; answer\n\
             example.com. 3600 IN NS ns1.example.net.\n\
             example.com. 3600 IN MX 10 mail.example.com.\n\
             example.com. 3600 IN TXT \"v=spf1 -all\"\n\
             example.com. 3600 IN SOA ns1.example.net. admin.example.com. \
             1 2 3 4 5",
        );
        let objects = DnsNormalizer
            .normalize(&job(), &example(), &raw)
            .await
            .expect("parsed");

        let ns = objects
            .iter()
            .find_map(|ooi| ooi.downcast::<DnsNsRecord>())
            .expect("NS record");
        assert_eq!(
            ns.name_server_hostname.as_str(),
            "Hostname|internet|ns1.example.net"
        );

        let mx = objects
            .iter()
            .find_map(|ooi| ooi.downcast::<DnsMxRecord>())
            .expect("MX record");
        assert_eq!(mx.preference, Some(10));
        assert_eq!(
            mx.mail_hostname.as_ref().map(Reference::as_str),
            Some("Hostname|internet|mail.example.com")
        );

        let txt = objects
            .iter()
            .find_map(|ooi| ooi.downcast::<DnsTxtRecord>())
            .expect("TXT record");
        assert_eq!(txt.value, "v=spf1 -all");
    }

    #[tokio::test]
    async fn nxdomain_yields_nothing() {
        let objects = DnsNormalizer
            .normalize(&job(), &example(), b"NXDOMAIN")
            .await
            .expect("empty");
        assert!(objects.is_empty());
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let err = DnsNormalizer
            .normalize(&job(), &example(), b"not json")
            .await
            .expect_err("malformed");
        assert!(matches!(err, PipelineError::MalformedInput(_)));

        let raw = answer("example.com. 300 IN A not-an-ip");
        let err = DnsNormalizer
            .normalize(&job(), &example(), &raw)
            .await
            .expect_err("bad address");
        assert!(matches!(err, PipelineError::MalformedInput(_)));
    }

    #[test]
    fn answers_list_each_address_once() {
        let answer = DnsAnswer::from_addresses(
            "example.com",
            [
                IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
                IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ],
        );
        assert_eq!(
            answer.dns_records,
            "example.com. 0 IN A 192.0.2.10\nexample.com. 0 IN AAAA ::1"
        );
    }

    #[tokio::test]
    async fn boefje_rejects_non_hostnames() {
        let network = Ooi::from(Network::internet());
        let job = BoefjeJob::new(PluginRef::new(DNS_RECORDS), &network, "test")
            .expect("boefje job");
        let err = DnsRecordsBoefje
            .scan(&job, &network)
            .await
            .expect_err("wrong input type");
        assert!(matches!(err, ScanError::Infrastructure(_)));
    }
}
