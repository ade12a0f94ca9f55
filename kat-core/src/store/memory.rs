use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kat_model::{
    Direction, Ooi, OoiKind, OoiType, Reference, RelationPath, ScanLevel,
    ScanProfile, ScanProfileKind,
};
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    GraphStore, Observation, OoiEvent, StoreError, StoreResult,
};
use crate::clearance::ClearanceGraph;

#[derive(Clone, Debug)]
struct Version {
    valid_time: DateTime<Utc>,
    object: OoiKind,
}

#[derive(Debug, Default)]
struct StoreState {
    /// Versions per reference, ascending by valid time.
    versions: HashMap<Reference, Vec<Version>>,
    profiles: HashMap<Reference, ScanProfile>,
    observations: Vec<Observation>,
}

impl StoreState {
    fn current(
        &self,
        reference: &Reference,
        valid_time: DateTime<Utc>,
    ) -> Option<&OoiKind> {
        self.versions
            .get(reference)?
            .iter()
            .rev()
            .find(|version| version.valid_time <= valid_time)
            .map(|version| &version.object)
    }

    fn live(
        &self,
        valid_time: DateTime<Utc>,
    ) -> impl Iterator<Item = (&Reference, &OoiKind)> {
        self.versions.keys().filter_map(move |reference| {
            self.current(reference, valid_time)
                .map(|object| (reference, object))
        })
    }

    fn materialize(
        &self,
        reference: &Reference,
        object: &OoiKind,
        valid_time: DateTime<Utc>,
    ) -> Ooi {
        let profile = self
            .profiles
            .get(reference)
            .cloned()
            .unwrap_or_else(|| ScanProfile::empty(reference.clone()));
        Ooi {
            object: object.clone(),
            scan_profile: Some(profile),
            valid_time: Some(valid_time),
        }
    }

    fn upsert(
        &mut self,
        object: OoiKind,
        valid_time: DateTime<Utc>,
    ) -> Option<OoiEvent> {
        let reference = object.reference();
        let event = match self.current(&reference, valid_time) {
            None => OoiEvent::created(reference.clone(), valid_time),
            Some(existing) if *existing == object => return None,
            Some(_) => OoiEvent::updated(reference.clone(), valid_time),
        };

        let versions = self.versions.entry(reference).or_default();
        match versions
            .iter_mut()
            .find(|version| version.valid_time == valid_time)
        {
            Some(version) => version.object = object,
            None => {
                versions.push(Version { valid_time, object });
                versions.sort_by_key(|version| version.valid_time);
            }
        }
        Some(event)
    }

    /// Declared profiles win, inherited ones only ever raise a level.
    fn merge_profile(&mut self, incoming: &ScanProfile) {
        let existing = self.profiles.get(&incoming.reference);
        let replace = match (incoming.kind, existing) {
            (ScanProfileKind::Declared, _) => true,
            (_, None) => true,
            (_, Some(current)) if current.is_declared() => false,
            (ScanProfileKind::Inherited, Some(current)) => {
                incoming.level > current.level
            }
            (ScanProfileKind::Empty, Some(_)) => false,
        };
        if replace {
            self.profiles
                .insert(incoming.reference.clone(), incoming.clone());
        }
    }
}

/// Process-local temporal object store.
///
/// Profiles are not versioned: the latest merged profile applies to every
/// valid time of an object.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    state: RwLock<StoreState>,
    unavailable: AtomicBool,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store switched off".into(),
            ));
        }
        Ok(())
    }

    /// Write an object directly, outside any observation. Used to seed
    /// declared objects; returns the commit event if state changed.
    pub async fn insert(
        &self,
        ooi: Ooi,
        valid_time: DateTime<Utc>,
    ) -> StoreResult<Option<OoiEvent>> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let event = state.upsert(ooi.object.clone(), valid_time);
        if let Some(profile) = &ooi.scan_profile {
            state.merge_profile(profile);
        }
        Ok(event)
    }

    pub async fn all(&self, valid_time: DateTime<Utc>) -> Vec<Ooi> {
        let state = self.state.read().await;
        let mut objects: Vec<Ooi> = state
            .live(valid_time)
            .map(|(reference, object)| {
                state.materialize(reference, object, valid_time)
            })
            .collect();
        objects.sort_by_key(Ooi::reference);
        objects
    }

    pub async fn list(
        &self,
        object_type: OoiType,
        valid_time: DateTime<Utc>,
    ) -> Vec<Ooi> {
        self.all(valid_time)
            .await
            .into_iter()
            .filter(|ooi| ooi.object_type().is_a(object_type))
            .collect()
    }

    pub async fn observations(&self) -> Vec<Observation> {
        self.state.read().await.observations.clone()
    }

    /// Recompute every non-declared profile from the declared ones.
    /// Returns the references whose level changed.
    pub async fn recalculate_scan_profiles(
        &self,
        valid_time: DateTime<Utc>,
    ) -> StoreResult<Vec<Reference>> {
        self.ensure_available()?;
        let mut state = self.state.write().await;

        let live: Vec<Ooi> = state
            .live(valid_time)
            .map(|(reference, object)| {
                state.materialize(reference, object, valid_time)
            })
            .collect();
        let graph = ClearanceGraph::from_objects(live.iter());
        let seeds: HashMap<Reference, ScanLevel> = state
            .profiles
            .values()
            .filter(|profile| profile.is_declared())
            .map(|profile| (profile.reference.clone(), profile.level))
            .collect();
        let assigned = graph.propagate(&seeds);

        let mut changed = Vec::new();
        for ooi in &live {
            let reference = ooi.reference();
            if seeds.contains_key(&reference) {
                continue;
            }
            let next = match assigned.get(&reference) {
                Some(level) if *level > ScanLevel::L0 => {
                    ScanProfile::inherited(reference.clone(), *level)
                }
                _ => ScanProfile::empty(reference.clone()),
            };
            if ooi.scan_level() != next.level {
                changed.push(reference.clone());
            }
            state.profiles.insert(reference, next);
        }

        changed.sort();
        debug!(
            target: "kat::store",
            changed = changed.len(),
            "recalculated inherited scan profiles"
        );
        Ok(changed)
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn get(
        &self,
        reference: &Reference,
        valid_time: DateTime<Utc>,
    ) -> StoreResult<Option<Ooi>> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(state
            .current(reference, valid_time)
            .map(|object| state.materialize(reference, object, valid_time)))
    }

    async fn get_along_relation_path(
        &self,
        root: &Reference,
        path: &RelationPath,
        type_filter: OoiType,
        valid_time: DateTime<Utc>,
    ) -> StoreResult<Vec<Ooi>> {
        self.ensure_available()?;
        let state = self.state.read().await;
        if state.current(root, valid_time).is_none() {
            return Ok(Vec::new());
        }

        let mut frontier = vec![root.clone()];
        for segment in path.segments() {
            let name = segment.field.name;
            let mut seen = HashSet::new();
            let mut next = Vec::new();
            for current in &frontier {
                match segment.direction {
                    Direction::Outgoing => {
                        let target = state
                            .current(current, valid_time)
                            .and_then(|object| {
                                object
                                    .relations()
                                    .into_iter()
                                    .find(|(field, _)| *field == name)
                                    .map(|(_, target)| target.clone())
                            });
                        if let Some(target) = target
                            && state.current(&target, valid_time).is_some()
                            && seen.insert(target.clone())
                        {
                            next.push(target);
                        }
                    }
                    Direction::Incoming => {
                        for (reference, object) in state.live(valid_time) {
                            let points_back =
                                object.object_type().is_a(segment.to)
                                    && object.relations().into_iter().any(
                                        |(field, target)| {
                                            field == name && target == current
                                        },
                                    );
                            if points_back && seen.insert(reference.clone()) {
                                next.push(reference.clone());
                            }
                        }
                    }
                }
            }
            frontier = next;
        }

        frontier.sort();
        Ok(frontier
            .iter()
            .filter_map(|reference| {
                state
                    .current(reference, valid_time)
                    .filter(|object| object.object_type().is_a(type_filter))
                    .map(|object| {
                        state.materialize(reference, object, valid_time)
                    })
            })
            .collect())
    }

    async fn save_observation(
        &self,
        observation: Observation,
    ) -> StoreResult<Vec<OoiEvent>> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let valid_time = observation.valid_time;

        if state.current(&observation.source, valid_time).is_none() {
            return Err(StoreError::Rejected(format!(
                "observation source {} does not exist",
                observation.source
            )));
        }

        let mut events = Vec::new();
        for ooi in &observation.result {
            if let Some(event) = state.upsert(ooi.object.clone(), valid_time) {
                events.push(event);
            }
            match &ooi.scan_profile {
                Some(profile) => state.merge_profile(profile),
                None => state
                    .merge_profile(&ScanProfile::empty(ooi.reference())),
            }
        }

        debug!(
            target: "kat::store",
            method = %observation.method,
            source = %observation.source,
            objects = observation.result.len(),
            changed = events.len(),
            "saved observation"
        );
        state.observations.push(observation);
        Ok(events)
    }

    async fn declare_scan_profile(
        &self,
        reference: &Reference,
        level: ScanLevel,
        valid_time: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        if state.current(reference, valid_time).is_none() {
            return Err(StoreError::Rejected(format!(
                "cannot declare a profile for unknown object {reference}"
            )));
        }
        state.merge_profile(&ScanProfile::declared(reference.clone(), level));
        Ok(())
    }
}
