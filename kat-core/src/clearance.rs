//! Clearance (scan level) propagation across relation edges.
//!
//! A reference field contributes up to two directed edges: the holder issues
//! clearance to the target bounded by `max_issue_scan_level`, and the target
//! passes clearance back to the holder bounded by `max_inherit_scan_level`.
//! An undeclared bound contributes no edge. Levels are assigned from L4 down
//! to L1, breadth first, so every object ends up with the highest level
//! reachable through edges that admit it.

use std::collections::HashMap;

use kat_model::{
    Ooi, Reference, RelationPath, ScanLevel, ScanProfile, schema,
};

const PROPAGATION_LEVELS: [ScanLevel; 4] =
    [ScanLevel::L4, ScanLevel::L3, ScanLevel::L2, ScanLevel::L1];

#[derive(Clone, Debug, Default)]
pub struct ClearanceGraph {
    edges: HashMap<Reference, Vec<(Reference, ScanLevel)>>,
}

impl ClearanceGraph {
    pub fn from_objects<'a>(
        objects: impl IntoIterator<Item = &'a Ooi>,
    ) -> Self {
        let mut graph = Self::default();
        for ooi in objects {
            let source = ooi.reference();
            let object_type = ooi.object_type();
            for (name, target) in ooi.relations() {
                let Some(field) = schema::relation(object_type, name) else {
                    continue;
                };
                if let Some(bound) = field.max_issue_scan_level {
                    graph.add_edge(source.clone(), target.clone(), bound);
                }
                if let Some(bound) = field.max_inherit_scan_level {
                    graph.add_edge(target.clone(), source.clone(), bound);
                }
            }
        }
        graph
    }

    fn add_edge(&mut self, from: Reference, to: Reference, bound: ScanLevel) {
        self.edges.entry(from).or_default().push((to, bound));
    }

    pub fn neighbours(
        &self,
        reference: &Reference,
    ) -> &[(Reference, ScanLevel)] {
        self.edges
            .get(reference)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Levels reachable from `seeds`. Seeds keep their own level; objects no
    /// seed reaches above L0 are absent from the result.
    pub fn propagate(
        &self,
        seeds: &HashMap<Reference, ScanLevel>,
    ) -> HashMap<Reference, ScanLevel> {
        let mut assigned = seeds.clone();

        for level in PROPAGATION_LEVELS {
            let mut frontier: Vec<Reference> = assigned
                .iter()
                .filter(|(_, assigned_level)| **assigned_level >= level)
                .map(|(reference, _)| reference.clone())
                .collect();

            while !frontier.is_empty() {
                let mut next = Vec::new();
                for node in &frontier {
                    for (neighbour, bound) in self.neighbours(node) {
                        if *bound < level || assigned.contains_key(neighbour)
                        {
                            continue;
                        }
                        assigned.insert(neighbour.clone(), level);
                        next.push(neighbour.clone());
                    }
                }
                frontier = next;
            }
        }

        assigned
    }
}

/// Give freshly emitted objects the inherited profile implied by `source`.
pub fn apply_implied_profiles(source: &Ooi, objects: &mut [Ooi]) {
    let source_ref = source.reference();
    let graph = ClearanceGraph::from_objects(
        std::iter::once(source).chain(objects.iter()),
    );
    let seeds = HashMap::from([(source_ref.clone(), source.scan_level())]);
    let assigned = graph.propagate(&seeds);

    for ooi in objects.iter_mut() {
        let reference = ooi.reference();
        if reference == source_ref {
            continue;
        }
        ooi.scan_profile = Some(match assigned.get(&reference) {
            Some(level) if *level > ScanLevel::L0 => {
                ScanProfile::inherited(reference, *level)
            }
            _ => ScanProfile::empty(reference),
        });
    }
}

/// Clamp an object resolved through `path` to the lowest declared bound on
/// the path.
pub fn clamp_to_path(ooi: &mut Ooi, path: &RelationPath) {
    let bound = path.firewall_bound();
    if let Some(profile) = ooi.scan_profile.as_mut() {
        profile.level = profile.level.clamp_to(bound);
    }
}
