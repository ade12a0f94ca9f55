use std::{
    collections::BTreeSet,
    net::{IpAddr, Ipv4Addr},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kat_core::{
    PipelineError,
    artifacts::InMemoryArtifactStore,
    builtin::{self, DnsAnswer},
    config::{DerivationConfig, PipelineConfig},
    derive::{
        DerivationCache, DerivationEngine, RuleOutcome, RuleStatus, SkipReason,
    },
    events::{InProcEventBus, PipelineEventPayload, RuleEvaluation},
    job::{
        BOEFJE_ERROR_TAG, BoefjeJob, JobKind, JobStatus, NormalizerJob,
        RawResult,
    },
    plugin::{Normalizer, Rule, RuleConfig, RuleContext, RuleError, ScanError},
    queue::{InMemoryQueue, QueueInstrumentation},
    registry::{
        BoefjeDefinition, NormalizerDefinition, PluginId, RuleDefinition,
        RuleParameter, StaticPluginRegistry,
    },
    runner::BoefjeBackend,
    runtime::{PipelineRuntime, PipelineRuntimeBuilder},
    store::{
        GraphStore, InMemoryGraphStore, Observation, OoiEvent, StoreError,
        StoreResult,
    },
};
use kat_model::{
    DnsARecord, DnsNsRecord, DnsTxtRecord, Finding, Hostname, IpAddressV4,
    Network, Ooi, OoiObject, OoiType, Reference, RelationPath,
    ResolvedHostname, ScanLevel,
};

fn host(name: &str) -> Hostname {
    Hostname::new(Network::internet().reference(), name)
}

fn a_record(hostname: &Hostname, ip: Ipv4Addr) -> (DnsARecord, IpAddressV4) {
    let address = IpAddressV4 {
        network: Network::internet().reference(),
        address: ip,
    };
    let record = DnsARecord {
        hostname: hostname.reference(),
        value: ip.to_string(),
        address: address.reference(),
        ttl: None,
    };
    (record, address)
}

async fn seed(store: &InMemoryGraphStore, ooi: Ooi, at: DateTime<Utc>) -> Ooi {
    let reference = ooi.reference();
    store.insert(ooi, at).await.expect("seed object");
    store
        .get(&reference, at)
        .await
        .expect("store available")
        .expect("seeded object visible")
}

async fn observe(
    store: &InMemoryGraphStore,
    source: &Ooi,
    result: Vec<Ooi>,
    at: DateTime<Utc>,
) {
    store
        .save_observation(Observation {
            method: "test".into(),
            source: source.reference(),
            task_id: None,
            valid_time: at,
            result,
        })
        .await
        .expect("observation saved");
}

/// Answers every scan with a fixed set of addresses.
struct StaticAnswer(Vec<IpAddr>);

#[async_trait]
impl BoefjeBackend for StaticAnswer {
    async fn execute(
        &self,
        _job: &BoefjeJob,
        input: &Ooi,
    ) -> Result<RawResult, ScanError> {
        let hostname = input
            .downcast::<Hostname>()
            .ok_or_else(|| ScanError::Infrastructure("not a hostname".into()))?;
        let answer = DnsAnswer::from_addresses(&hostname.name, self.0.clone());
        let bytes = serde_json::to_vec(&answer)
            .map_err(|err| ScanError::Infrastructure(err.to_string()))?;
        Ok(RawResult::new(bytes))
    }
}

struct Unreachable;

#[async_trait]
impl BoefjeBackend for Unreachable {
    async fn execute(
        &self,
        _job: &BoefjeJob,
        _input: &Ooi,
    ) -> Result<RawResult, ScanError> {
        Err(ScanError::Expected("connection refused".into()))
    }
}

fn runtime_with_backend(
    config: PipelineConfig,
    registry: StaticPluginRegistry,
    store: Arc<InMemoryGraphStore>,
    backend: impl BoefjeBackend + 'static,
) -> PipelineRuntime<InMemoryQueue, InProcEventBus> {
    PipelineRuntimeBuilder::new(config)
        .with_registry(Arc::new(registry))
        .with_store(store)
        .with_queue(Arc::new(InMemoryQueue::new()))
        .with_events(Arc::new(InProcEventBus::new(256)))
        .with_boefje_backend(Arc::new(backend))
        .build()
        .expect("runtime builds")
}

fn engine(
    store: Arc<InMemoryGraphStore>,
    registry: StaticPluginRegistry,
) -> DerivationEngine {
    DerivationEngine::new(
        store,
        Arc::new(registry),
        DerivationCache::new(),
        DerivationConfig::default(),
    )
}

async fn evaluate(
    engine: &DerivationEngine,
    rule: &PluginId,
    root: &Ooi,
) -> RuleOutcome {
    engine
        .evaluate_rule(rule, root, Utc::now())
        .await
        .expect("rule exists")
}

fn finding_rule(id: &str, root: OoiType) -> RuleDefinition {
    RuleDefinition::new(id, root, [OoiType::KatFindingType])
}

#[tokio::test]
async fn dns_scan_flows_through_normalizer_and_rules() {
    let store = Arc::new(InMemoryGraphStore::new());
    let now = Utc::now();
    let example = host("example.com");
    let cleared = Ooi::from(example.clone()).with_scan_level(ScanLevel::L1);
    seed(&store, cleared, now).await;

    let runtime = runtime_with_backend(
        PipelineConfig::default(),
        builtin::registry().expect("builtins"),
        Arc::clone(&store),
        StaticAnswer(vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))]),
    );
    let mut events = runtime.events().subscribe();

    let dns = PluginId::from(builtin::DNS_RECORDS);
    let handle = runtime
        .submit_boefje(&dns, &example.reference())
        .await
        .expect("boefje accepted");
    let summary = runtime.drain().await.expect("drained");
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.completed, 5);

    let objects = store.all(Utc::now()).await;
    let mut types: Vec<OoiType> =
        objects.iter().map(Ooi::object_type).collect();
    types.sort();
    let mut expected = vec![
        OoiType::Hostname,
        OoiType::DnsARecord,
        OoiType::IpAddressV4,
        OoiType::ResolvedHostname,
    ];
    expected.sort();
    assert_eq!(types, expected);

    let (record, address) = a_record(&example, Ipv4Addr::new(192, 0, 2, 1));
    let resolved = ResolvedHostname {
        hostname: example.reference(),
        address: address.reference(),
    };
    assert!(objects.iter().any(|ooi| ooi.reference() == resolved.reference()));
    let stored_record = objects
        .iter()
        .find(|ooi| ooi.reference() == record.reference())
        .expect("record committed");
    assert_eq!(stored_record.scan_level(), ScanLevel::L1);

    let raw = runtime
        .artifacts()
        .raw(handle.job_id)
        .await
        .expect("artifacts available")
        .expect("raw output kept");
    assert!(raw.content_tags.contains("boefje/dns-records"));

    let attempts = runtime
        .artifacts()
        .derivation_attempts(Some(&PluginId::from(builtin::DNS_RESOLVING)))
        .await
        .expect("attempts");
    assert!(
        attempts
            .iter()
            .any(|attempt| attempt.output == vec![resolved.reference()])
    );

    let mut committed = 0;
    while let Ok(event) = events.try_recv() {
        match event.payload {
            PipelineEventPayload::ObjectsCommitted { .. } => committed += 1,
            PipelineEventPayload::JobFailed { error, .. } => {
                panic!("job failed: {error}")
            }
            _ => {}
        }
    }
    assert!(committed >= 2);
}

#[tokio::test]
async fn failed_scans_keep_error_output_and_stop_there() {
    let store = Arc::new(InMemoryGraphStore::new());
    let now = Utc::now();
    let example = host("down.example");
    let cleared = Ooi::from(example.clone()).with_scan_level(ScanLevel::L2);
    seed(&store, cleared, now).await;

    let runtime = runtime_with_backend(
        PipelineConfig::default(),
        builtin::registry().expect("builtins"),
        Arc::clone(&store),
        Unreachable,
    );
    let dns = PluginId::from(builtin::DNS_RECORDS);
    let handle = runtime
        .submit_boefje(&dns, &example.reference())
        .await
        .expect("accepted");
    let summary = runtime.drain().await.expect("drained");
    assert_eq!(summary.completed, 1);

    let raw = runtime
        .artifacts()
        .raw(handle.job_id)
        .await
        .expect("artifacts")
        .expect("error output stored");
    assert!(raw.is_error());
    assert_eq!(raw.bytes, b"connection refused");
    assert_eq!(store.all(Utc::now()).await.len(), 1);
}

#[tokio::test]
async fn boefje_scheduling_is_gated() {
    let store = Arc::new(InMemoryGraphStore::new());
    let now = Utc::now();
    let unscoped = host("unscoped.example");
    seed(&store, Ooi::from(unscoped.clone()), now).await;
    let (_, address) = a_record(&unscoped, Ipv4Addr::new(198, 51, 100, 7));
    let cleared = Ooi::from(address.clone()).with_scan_level(ScanLevel::L4);
    seed(&store, cleared, now).await;

    let runtime = PipelineRuntime::in_memory(
        PipelineConfig::default(),
        Arc::new(builtin::registry().expect("builtins")),
        store,
    )
    .expect("runtime");
    let dns = PluginId::from(builtin::DNS_RECORDS);

    let err = runtime
        .submit_boefje(&dns, &unscoped.reference())
        .await
        .expect_err("no clearance");
    assert!(matches!(
        err,
        PipelineError::InsufficientClearance {
            required: ScanLevel::L1,
            actual: ScanLevel::L0
        }
    ));

    let err = runtime
        .submit_boefje(&dns, &address.reference())
        .await
        .expect_err("wrong type");
    assert!(matches!(err, PipelineError::SchemaViolation(_)));

    let err = runtime
        .submit_boefje(&PluginId::from("nmap"), &address.reference())
        .await
        .expect_err("unknown boefje");
    assert!(matches!(err, PipelineError::NotFound(_)));
}

#[tokio::test]
async fn nameserver_without_ipv6_gets_exactly_one_finding() {
    let store = Arc::new(InMemoryGraphStore::new());
    let now = Utc::now();
    let com = seed(&store, Ooi::from(host("example.com")), now).await;
    let org = seed(&store, Ooi::from(host("example.org")), now).await;
    let nameserver = host("ns1.example.net");
    seed(&store, Ooi::from(nameserver.clone()), now).await;

    let runtime = PipelineRuntime::in_memory(
        PipelineConfig::default(),
        Arc::new(builtin::registry().expect("builtins")),
        Arc::clone(&store) as Arc<dyn GraphStore>,
    )
    .expect("runtime");

    for domain in [&com, &org] {
        let record = DnsNsRecord {
            hostname: domain.reference(),
            value: "ns1.example.net.".into(),
            name_server_hostname: nameserver.reference(),
            ttl: Some(3600),
        };
        runtime
            .submit_observation("manual", domain, vec![Ooi::from(record)], now)
            .await
            .expect("observation accepted");
    }
    let summary = runtime.drain().await.expect("drained");
    assert_eq!(summary.failed, 0);

    let finding_types = store.list(OoiType::FindingType, now).await;
    assert_eq!(finding_types.len(), 1);
    let findings = store.list(OoiType::Finding, now).await;
    assert_eq!(findings.len(), 1);
    let finding = findings[0].downcast::<Finding>().expect("a finding");
    assert_eq!(finding.ooi, nameserver.reference());
    assert_eq!(
        finding.description.as_deref(),
        Some("This nameserver has no IPv6 address.")
    );
}

#[tokio::test]
async fn manual_observations_schedule_scans_when_enabled() {
    let addresses = vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5))];
    for auto_schedule in [false, true] {
        let store = Arc::new(InMemoryGraphStore::new());
        let now = Utc::now();
        let source = seed(&store, Ooi::from(host("seed.example")), now).await;
        let config = PipelineConfig {
            auto_schedule_boefjes: auto_schedule,
            ..PipelineConfig::default()
        };
        let runtime = runtime_with_backend(
            config,
            builtin::registry().expect("builtins"),
            Arc::clone(&store),
            StaticAnswer(addresses.clone()),
        );

        let target =
            Ooi::from(host("auto.example")).with_scan_level(ScanLevel::L1);
        runtime
            .submit_observation("manual", &source, vec![target], now)
            .await
            .expect("accepted");
        runtime.drain().await.expect("drained");

        let resolved = store.list(OoiType::ResolvedHostname, Utc::now()).await;
        assert_eq!(resolved.len(), usize::from(auto_schedule));
    }
}

fn txt_counter(
    root: &Ooi,
    context: &RuleContext,
    _config: &RuleConfig,
) -> Result<Vec<Ooi>, RuleError> {
    let seen = context.objects("txt").len();
    Ok(vec![Ooi::from(DnsTxtRecord {
        hostname: root.reference(),
        value: format!("seen={seen}"),
        ttl: None,
    })])
}

#[tokio::test]
async fn rules_do_not_retrigger_themselves() {
    let records = RelationPath::parse("Hostname.<hostname[is DNSTXTRecord]")
        .expect("path");
    let rule = RuleDefinition::new(
        "txt-counter",
        OoiType::Hostname,
        [OoiType::DnsTxtRecord],
    )
    .with_parameter(
        RuleParameter::new("txt", OoiType::DnsTxtRecord, records).optional(),
    );
    let registry = StaticPluginRegistry::builder()
        .rule(rule, txt_counter)
        .build()
        .expect("registry");

    let store = Arc::new(InMemoryGraphStore::new());
    let now = Utc::now();
    let source = seed(&store, Ooi::from(host("seed.example")), now).await;
    let runtime = PipelineRuntime::in_memory(
        PipelineConfig::default(),
        Arc::new(registry),
        Arc::clone(&store) as Arc<dyn GraphStore>,
    )
    .expect("runtime");

    let observed = vec![Ooi::from(host("loop.example"))];
    runtime
        .submit_observation("manual", &source, observed, now)
        .await
        .expect("accepted");
    runtime.drain().await.expect("drained");

    let records = store.list(OoiType::DnsTxtRecord, now).await;
    assert_eq!(records.len(), 1);
    let record = records[0].downcast::<DnsTxtRecord>().expect("txt");
    assert_eq!(record.value, "seen=0");

    let attempts = runtime
        .artifacts()
        .derivation_attempts(Some(&PluginId::from("txt-counter")))
        .await
        .expect("attempts");
    assert_eq!(attempts.len(), 2);
}

fn subdomain(
    root: &Ooi,
    _context: &RuleContext,
    _config: &RuleConfig,
) -> Result<Vec<Ooi>, RuleError> {
    let hostname = root
        .downcast::<Hostname>()
        .ok_or_else(|| RuleError::new("not a hostname"))?;
    Ok(vec![Ooi::from(Hostname::new(
        hostname.network.clone(),
        format!("x.{}", hostname.name),
    ))])
}

#[tokio::test]
async fn derivation_chains_stop_at_max_depth() {
    let registry = StaticPluginRegistry::builder()
        .rule(
            RuleDefinition::new(
                "subdomain",
                OoiType::Hostname,
                [OoiType::Hostname],
            ),
            subdomain,
        )
        .build()
        .expect("registry");
    let mut config = PipelineConfig::default();
    config.derivation.max_depth = 3;

    let store = Arc::new(InMemoryGraphStore::new());
    let now = Utc::now();
    let source = seed(&store, Ooi::from(host("seed.example")), now).await;
    let runtime = PipelineRuntime::in_memory(
        config,
        Arc::new(registry),
        Arc::clone(&store) as Arc<dyn GraphStore>,
    )
    .expect("runtime");

    let observed = vec![Ooi::from(host("a.example"))];
    runtime
        .submit_observation("manual", &source, observed, now)
        .await
        .expect("accepted");
    let summary = runtime.drain().await.expect("drained");
    assert_eq!(summary.completed, 4);

    let mut names: Vec<String> = store
        .list(OoiType::Hostname, now)
        .await
        .iter()
        .filter_map(|ooi| ooi.downcast::<Hostname>().map(|h| h.name.clone()))
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "a.example",
            "seed.example",
            "x.a.example",
            "x.x.a.example",
            "x.x.x.a.example",
            "x.x.x.x.a.example",
        ]
    );
}

fn noop(
    _root: &Ooi,
    _context: &RuleContext,
    _config: &RuleConfig,
) -> Result<Vec<Ooi>, RuleError> {
    Ok(Vec::new())
}

#[tokio::test]
async fn rules_match_supertypes_of_the_root() {
    let registry = StaticPluginRegistry::builder()
        .rule(finding_rule("any-address", OoiType::IpAddress), noop)
        .rule(finding_rule("anything", OoiType::Ooi), noop)
        .rule(finding_rule("hosts-only", OoiType::Hostname), noop)
        .build()
        .expect("registry");

    let store = Arc::new(InMemoryGraphStore::new());
    let now = Utc::now();
    let (_, address) =
        a_record(&host("example.com"), Ipv4Addr::new(192, 0, 2, 9));
    let root = seed(&store, Ooi::from(address), now).await;

    let mut matched: Vec<String> = engine(store, registry)
        .derive(&root, now)
        .await
        .into_iter()
        .map(|outcome| outcome.rule.to_string())
        .collect();
    matched.sort();
    assert_eq!(matched, vec!["any-address", "anything"]);
}

struct Counting(Arc<AtomicUsize>);

impl Rule for Counting {
    fn evaluate(
        &self,
        _root: &Ooi,
        _context: &RuleContext,
        _config: &RuleConfig,
    ) -> Result<Vec<Ooi>, RuleError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

async fn counting_engine(
    ttl_secs: u64,
) -> (DerivationEngine, Ooi, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = StaticPluginRegistry::builder()
        .rule(
            finding_rule("counted", OoiType::Hostname)
                .with_cache_ttl_secs(ttl_secs),
            Counting(Arc::clone(&calls)),
        )
        .build()
        .expect("registry");
    let store = Arc::new(InMemoryGraphStore::new());
    let root =
        seed(&store, Ooi::from(host("cached.example")), Utc::now()).await;
    (engine(store, registry), root, calls)
}

#[tokio::test]
async fn identical_inputs_hit_the_cache() {
    let (engine, root, calls) = counting_engine(3600).await;
    let rule = PluginId::from("counted");

    let first = evaluate(&engine, &rule, &root).await;
    let second = evaluate(&engine, &rule, &root).await;

    assert!(matches!(first.status, RuleStatus::Derived { cached: false, .. }));
    assert!(matches!(second.status, RuleStatus::Derived { cached: true, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.cache().stats().hits, 1);
}

#[tokio::test]
async fn expired_entries_are_recomputed() {
    let (engine, root, calls) = counting_engine(0).await;
    let rule = PluginId::from("counted");

    evaluate(&engine, &rule, &root).await;
    let second = evaluate(&engine, &rule, &root).await;

    assert!(matches!(
        second.status,
        RuleStatus::Derived { cached: false, .. }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cached_output_is_served_until_the_ttl_elapses() {
    let (engine, root, calls) = counting_engine(1).await;
    let rule = PluginId::from("counted");

    let first = evaluate(&engine, &rule, &root).await;
    let second = evaluate(&engine, &rule, &root).await;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let third = evaluate(&engine, &rule, &root).await;

    assert!(matches!(first.status, RuleStatus::Derived { cached: false, .. }));
    assert!(matches!(second.status, RuleStatus::Derived { cached: true, .. }));
    assert!(matches!(third.status, RuleStatus::Derived { cached: false, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let stats = engine.cache().stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.evictions, 1);
}

#[tokio::test]
async fn context_order_does_not_change_output() {
    let now = Utc::now();
    let example = host("example.com");
    let pairs: Vec<_> = [1u8, 2, 3]
        .into_iter()
        .map(|last| a_record(&example, Ipv4Addr::new(192, 0, 2, last)))
        .collect();
    let rule = PluginId::from(builtin::DNS_RESOLVING);

    let mut outputs = Vec::new();
    for reverse in [false, true] {
        let store = Arc::new(InMemoryGraphStore::new());
        let root = seed(&store, Ooi::from(example.clone()), now).await;
        let mut ordered: Vec<Ooi> = pairs
            .iter()
            .flat_map(|(record, address)| {
                [Ooi::from(address.clone()), Ooi::from(record.clone())]
            })
            .collect();
        if reverse {
            ordered.reverse();
        }
        observe(&store, &root, ordered, now).await;

        let outcome = engine(store, builtin::registry().expect("builtins"))
            .evaluate_rule(&rule, &root, now)
            .await
            .expect("rule exists");
        let mut references: Vec<_> =
            outcome.objects().iter().map(Ooi::reference).collect();
        references.sort();
        outputs.push(references);
    }

    assert_eq!(outputs[0].len(), 3);
    assert_eq!(outputs[0], outputs[1]);
}

fn explodes(
    _root: &Ooi,
    _context: &RuleContext,
    _config: &RuleConfig,
) -> Result<Vec<Ooi>, RuleError> {
    Err(RuleError::new("malformed record"))
}

fn panics(
    _root: &Ooi,
    _context: &RuleContext,
    _config: &RuleConfig,
) -> Result<Vec<Ooi>, RuleError> {
    panic!("index out of range")
}

#[tokio::test]
async fn one_failing_rule_does_not_block_the_others() {
    let registry = StaticPluginRegistry::builder()
        .rule(finding_rule("explodes", OoiType::Hostname), explodes)
        .rule(finding_rule("panics", OoiType::Hostname), panics)
        .rule(finding_rule("quiet", OoiType::Hostname), noop)
        .build()
        .expect("registry");
    let store = Arc::new(InMemoryGraphStore::new());
    let now = Utc::now();
    let root = seed(&store, Ooi::from(host("example.com")), now).await;

    let outcomes = engine(store, registry).derive(&root, now).await;
    assert_eq!(outcomes.len(), 3);
    for outcome in &outcomes {
        match outcome.rule.as_str() {
            "quiet" => {
                assert!(matches!(outcome.status, RuleStatus::Derived { .. }))
            }
            _ => assert!(matches!(
                outcome.status,
                RuleStatus::Failed(PipelineError::RuleExecution { .. })
            )),
        }
    }
}

#[tokio::test]
async fn unreachable_store_fails_without_caching() {
    let store = Arc::new(InMemoryGraphStore::new());
    let now = Utc::now();
    let root = seed(&store, Ooi::from(host("example.com")), now).await;
    let registry = builtin::registry().expect("builtins");
    let engine = engine(Arc::clone(&store), registry);
    let rule = PluginId::from(builtin::DNS_RESOLVING);

    store.set_unavailable(true);
    let outcome = evaluate(&engine, &rule, &root).await;
    assert!(matches!(
        outcome.status,
        RuleStatus::Failed(PipelineError::ContextResolution(_))
    ));
    assert!(engine.cache().is_empty());

    store.set_unavailable(false);
    let outcome = evaluate(&engine, &rule, &root).await;
    assert!(matches!(
        outcome.status,
        RuleStatus::Derived { cached: false, .. }
    ));
}

#[tokio::test]
async fn mandatory_parameters_gate_evaluation() {
    let store = Arc::new(InMemoryGraphStore::new());
    let now = Utc::now();
    let root = seed(&store, Ooi::from(host("ns1.example.net")), now).await;

    let engine = engine(store, builtin::registry().expect("builtins"));
    let rule = PluginId::from(builtin::IPV6_ON_NAMESERVERS);
    let outcome = evaluate(&engine, &rule, &root).await;
    assert!(matches!(
        outcome.status,
        RuleStatus::Skipped(SkipReason::MissingParameter(ref name))
            if name == "ns_records"
    ));
}

/// Records the clearance of every context object it is handed.
struct ClearanceRecorder(Arc<std::sync::Mutex<Vec<ScanLevel>>>);

impl Rule for ClearanceRecorder {
    fn evaluate(
        &self,
        _root: &Ooi,
        context: &RuleContext,
        _config: &RuleConfig,
    ) -> Result<Vec<Ooi>, RuleError> {
        let mut seen = self
            .0
            .lock()
            .map_err(|_| RuleError::new("recorder poisoned"))?;
        seen.extend(context.objects("ns_records").iter().map(Ooi::scan_level));
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn firewalled_edges_cap_context_clearance() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let ns_records = RelationPath::parse(
        "Hostname.<name_server_hostname[is DNSNSRecord]",
    )
    .expect("path");
    let registry = StaticPluginRegistry::builder()
        .rule(
            finding_rule("clearance-recorder", OoiType::Hostname)
                .with_parameter(RuleParameter::new(
                    "ns_records",
                    OoiType::DnsNsRecord,
                    ns_records,
                )),
            ClearanceRecorder(Arc::clone(&seen)),
        )
        .build()
        .expect("registry");

    let store = Arc::new(InMemoryGraphStore::new());
    let now = Utc::now();
    let domain = seed(&store, Ooi::from(host("example.com")), now).await;
    let nameserver = host("ns1.example.net");
    let cleared = Ooi::from(nameserver.clone()).with_scan_level(ScanLevel::L4);
    let root = seed(&store, cleared, now).await;
    let record = DnsNsRecord {
        hostname: domain.reference(),
        value: "ns1.example.net.".into(),
        name_server_hostname: nameserver.reference(),
        ttl: None,
    };
    observe(&store, &domain, vec![Ooi::from(record.clone())], now).await;
    store
        .declare_scan_profile(&record.reference(), ScanLevel::L3, now)
        .await
        .expect("declare");

    let engine = engine(store, registry);
    let rule = PluginId::from("clearance-recorder");
    let outcome = evaluate(&engine, &rule, &root).await;
    assert!(matches!(outcome.status, RuleStatus::Derived { .. }));
    let seen = seen.lock().expect("recorder lock").clone();
    assert_eq!(seen, vec![ScanLevel::L0]);
}

fn external_scan(id: &str) -> BoefjeDefinition {
    BoefjeDefinition {
        id: id.into(),
        version: None,
        consumes: BTreeSet::from([OoiType::Hostname]),
        produces: BTreeSet::new(),
        scan_level: ScanLevel::L1,
    }
}

fn parses(id: &str, consumes: &str) -> NormalizerDefinition {
    NormalizerDefinition {
        id: id.into(),
        consumes: BTreeSet::from([consumes.to_string()]),
        produces: BTreeSet::from([OoiType::Hostname]),
    }
}

/// Counts calls and produces nothing.
struct CountingNormalizer(Arc<AtomicUsize>);

#[async_trait]
impl Normalizer for CountingNormalizer {
    async fn normalize(
        &self,
        _job: &NormalizerJob,
        _input: &Ooi,
        _raw: &[u8],
    ) -> kat_core::Result<Vec<Ooi>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

struct PanickingNormalizer;

#[async_trait]
impl Normalizer for PanickingNormalizer {
    async fn normalize(
        &self,
        _job: &NormalizerJob,
        _input: &Ooi,
        raw: &[u8],
    ) -> kat_core::Result<Vec<Ooi>> {
        panic!("unexpected answer of {} bytes", raw.len())
    }
}

#[tokio::test]
async fn scan_errors_only_reach_error_normalizers() {
    let by_id = Arc::new(AtomicUsize::new(0));
    let on_error = Arc::new(AtomicUsize::new(0));
    let registry = StaticPluginRegistry::builder()
        .external_boefje(external_scan("scan-x"))
        .normalizer(
            parses("by-id", "scan-x"),
            CountingNormalizer(Arc::clone(&by_id)),
        )
        .normalizer(
            parses("on-error", BOEFJE_ERROR_TAG),
            CountingNormalizer(Arc::clone(&on_error)),
        )
        .build()
        .expect("registry");

    let store = Arc::new(InMemoryGraphStore::new());
    let target = host("down.example");
    seed(
        &store,
        Ooi::from(target.clone()).with_scan_level(ScanLevel::L1),
        Utc::now(),
    )
    .await;
    let runtime = runtime_with_backend(
        PipelineConfig::default(),
        registry,
        Arc::clone(&store),
        Unreachable,
    );

    runtime
        .submit_boefje(&PluginId::from("scan-x"), &target.reference())
        .await
        .expect("accepted");
    let summary = runtime.drain().await.expect("drained");

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(by_id.load(Ordering::SeqCst), 0);
    assert_eq!(on_error.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panicking_normalizers_fail_only_their_job() {
    let registry = StaticPluginRegistry::builder()
        .external_boefje(external_scan("scan-x"))
        .normalizer(parses("explodes", "scan-x"), PanickingNormalizer)
        .build()
        .expect("registry");
    let store = Arc::new(InMemoryGraphStore::new());
    let target = host("example.com");
    seed(
        &store,
        Ooi::from(target.clone()).with_scan_level(ScanLevel::L1),
        Utc::now(),
    )
    .await;
    let artifacts = Arc::new(InMemoryArtifactStore::new());
    let runtime = PipelineRuntimeBuilder::new(PipelineConfig::default())
        .with_registry(Arc::new(registry))
        .with_store(store)
        .with_artifacts(artifacts.clone())
        .with_queue(Arc::new(InMemoryQueue::new()))
        .with_events(Arc::new(InProcEventBus::new(64)))
        .with_boefje_backend(Arc::new(StaticAnswer(vec![IpAddr::V4(
            Ipv4Addr::new(192, 0, 2, 1),
        )])))
        .build()
        .expect("runtime builds");

    runtime
        .submit_boefje(&PluginId::from("scan-x"), &target.reference())
        .await
        .expect("accepted");
    let summary = runtime.drain().await.expect("panic stays inside the job");
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);

    let jobs = artifacts.normalizer_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].lifecycle.status, JobStatus::Failed);
    let error = jobs[0].lifecycle.error.as_deref().expect("error recorded");
    assert!(error.contains("normalizer panicked"));

    let queued = runtime.queue().failure(jobs[0].id).await;
    assert!(queued.is_some_and(|error| error.contains("unexpected answer")));
}

#[tokio::test]
async fn store_outages_fail_derive_jobs_visibly() {
    let store = Arc::new(InMemoryGraphStore::new());
    let now = Utc::now();
    let source = seed(&store, Ooi::from(host("seed.example")), now).await;
    let artifacts = Arc::new(InMemoryArtifactStore::new());
    let runtime = PipelineRuntimeBuilder::new(PipelineConfig::default())
        .with_registry(Arc::new(builtin::registry().expect("builtins")))
        .with_store(Arc::clone(&store) as Arc<dyn GraphStore>)
        .with_artifacts(artifacts.clone())
        .with_queue(Arc::new(InMemoryQueue::new()))
        .with_events(Arc::new(InProcEventBus::new(64)))
        .build()
        .expect("runtime builds");

    runtime
        .submit_observation(
            "manual",
            &source,
            vec![Ooi::from(host("outage.example"))],
            now,
        )
        .await
        .expect("accepted");
    store.set_unavailable(true);
    let summary = runtime.drain().await.expect("drained");
    assert_eq!(summary.failed, 1);

    let jobs = artifacts.derive_jobs();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.event.reference, host("outage.example").reference());
    assert_eq!(job.lifecycle.status, JobStatus::Failed);
    assert!(
        job.lifecycle
            .error
            .as_deref()
            .is_some_and(|error| error.contains("unavailable"))
    );
    assert!(runtime.queue().failure(job.id).await.is_some());
}

/// Delegates reads to an in-memory store; writes can be switched to
/// rejections or panics.
struct GuardedWrites {
    inner: InMemoryGraphStore,
    reject: AtomicBool,
    panic: AtomicBool,
}

impl GuardedWrites {
    fn new() -> Self {
        Self {
            inner: InMemoryGraphStore::new(),
            reject: AtomicBool::new(false),
            panic: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl GraphStore for GuardedWrites {
    async fn get(
        &self,
        reference: &Reference,
        valid_time: DateTime<Utc>,
    ) -> StoreResult<Option<Ooi>> {
        self.inner.get(reference, valid_time).await
    }

    async fn get_along_relation_path(
        &self,
        root: &Reference,
        path: &RelationPath,
        type_filter: OoiType,
        valid_time: DateTime<Utc>,
    ) -> StoreResult<Vec<Ooi>> {
        self.inner
            .get_along_relation_path(root, path, type_filter, valid_time)
            .await
    }

    async fn save_observation(
        &self,
        observation: Observation,
    ) -> StoreResult<Vec<OoiEvent>> {
        if self.panic.load(Ordering::SeqCst) {
            panic!("write path corrupted");
        }
        if self.reject.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("read-only replica".into()));
        }
        self.inner.save_observation(observation).await
    }

    async fn declare_scan_profile(
        &self,
        reference: &Reference,
        level: ScanLevel,
        valid_time: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.inner
            .declare_scan_profile(reference, level, valid_time)
            .await
    }
}

async fn guarded_runtime(
    store: Arc<GuardedWrites>,
) -> PipelineRuntime<InMemoryQueue, InProcEventBus> {
    let registry = StaticPluginRegistry::builder()
        .rule(
            RuleDefinition::new(
                "subdomain",
                OoiType::Hostname,
                [OoiType::Hostname],
            ),
            subdomain,
        )
        .build()
        .expect("registry");
    let runtime = PipelineRuntime::in_memory(
        PipelineConfig::default(),
        Arc::new(registry),
        store.clone(),
    )
    .expect("runtime");
    let now = Utc::now();
    let source = seed(&store.inner, Ooi::from(host("seed.example")), now).await;
    runtime
        .submit_observation(
            "manual",
            &source,
            vec![Ooi::from(host("a.example"))],
            now,
        )
        .await
        .expect("accepted");
    runtime
}

#[tokio::test]
async fn rejected_commits_are_recorded_as_failed_attempts() {
    let store = Arc::new(GuardedWrites::new());
    let runtime = guarded_runtime(Arc::clone(&store)).await;
    store.reject.store(true, Ordering::SeqCst);

    let summary = runtime.drain().await.expect("drained");
    assert_eq!(summary.completed, 1);

    let attempts = runtime
        .artifacts()
        .derivation_attempts(Some(&PluginId::from("subdomain")))
        .await
        .expect("attempts");
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].output.is_empty());
    assert!(matches!(
        &attempts[0].evaluation,
        RuleEvaluation::Failed { error } if error.contains("read-only replica")
    ));
    assert!(
        store
            .inner
            .get(&host("x.a.example").reference(), Utc::now())
            .await
            .expect("store available")
            .is_none()
    );
}

#[tokio::test]
async fn panics_outside_plugin_bodies_fail_the_job() {
    let store = Arc::new(GuardedWrites::new());
    let runtime = guarded_runtime(Arc::clone(&store)).await;
    store.panic.store(true, Ordering::SeqCst);

    let summary = runtime.drain().await.expect("panic stays inside the job");
    assert_eq!(summary.failed, 1);
    let snapshot = runtime.queue().queue_snapshot().await.expect("snapshot");
    assert_eq!(snapshot.entry(JobKind::Derive).failed, 1);
    assert!(runtime.queue().is_idle().await);
}
