//! Segment registry
//!
//! Maps each canonical subnet to the segment that carries it. Lookups are
//! keyed by [`Subnet`], so `10.0.1.0/24` can never match `10.0.10.0/24`.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::{debug, warn};

use crate::address::Subnet;
use crate::provider::{NetworkProvider, ProviderError, SegmentInfo};
use crate::types::{Member, Segment};

/// Disagreement between the registry and the provider
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    #[error("Segment {name} ({subnet}) exists in the provider but was not registered")]
    SegmentAppeared { name: String, subnet: Subnet },

    #[error("Segment {name} ({subnet}) is registered but missing from the provider")]
    SegmentVanished { name: String, subnet: Subnet },

    #[error("Subnet {subnet} is carried by {actual}, registry had {registered}")]
    SegmentRenamed {
        subnet: Subnet,
        registered: String,
        actual: String,
    },

    #[error("Members of {name} drifted: missing {missing:?}, unexpected {unexpected:?}")]
    MembersDrifted {
        name: String,
        missing: Vec<Member>,
        unexpected: Vec<Member>,
    },

    #[error("Segment {name} reports unparsable subnet '{subnet}'")]
    UnparsableSubnet { name: String, subnet: String },

    #[error("Segment {name} could not be inspected: {source}")]
    InspectFailed {
        name: String,
        #[source]
        source: ProviderError,
    },

    #[error("Subnet {subnet} is carried by both {first} and {second}")]
    DuplicateSubnet {
        subnet: Subnet,
        first: String,
        second: String,
    },
}

/// Provider view gathered by [`SegmentRegistry::observe_provider`]
#[derive(Debug, Clone, Default)]
pub struct Observation {
    /// Segments with a parsable IPv4 subnet, keyed by subnet
    pub segments: HashMap<Subnet, Segment>,

    /// Listed segments that could not be inspected, keyed by subnet
    pub uninspected: HashMap<Subnet, String>,

    /// Problems found while observing
    pub problems: Vec<ConsistencyError>,
}

/// Subnet to segment registry
#[derive(Debug, Clone, Default)]
pub struct SegmentRegistry {
    segments: HashMap<Subnet, Segment>,
}

impl SegmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a registry from persisted segments
    pub fn from_snapshot(segments: impl IntoIterator<Item = Segment>) -> Self {
        Self {
            segments: segments.into_iter().map(|s| (s.subnet, s)).collect(),
        }
    }

    /// Segments sorted by subnet
    pub fn snapshot(&self) -> Vec<Segment> {
        let mut segments: Vec<Segment> = self.segments.values().cloned().collect();
        segments.sort_by_key(|s| s.subnet);
        segments
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn find_segment_by_subnet(&self, subnet: &Subnet) -> Option<&Segment> {
        self.segments.get(subnet)
    }

    /// Inserts or replaces the record for the segment's subnet
    pub fn insert_segment(&mut self, segment: Segment) -> Option<Segment> {
        self.segments.insert(segment.subnet, segment)
    }

    pub fn remove_segment(&mut self, subnet: &Subnet) -> Option<Segment> {
        self.segments.remove(subnet)
    }

    /// Records `node` as attached with `ip`, creating the record if absent
    ///
    /// An earlier membership of the same node is replaced.
    pub fn register_attachment(&mut self, subnet: Subnet, node: &str, ip: Ipv4Addr) {
        let segment = self
            .segments
            .entry(subnet)
            .or_insert_with(|| Segment::new(subnet.segment_name(), subnet));
        segment.members.retain(|m| m.node != node);
        segment.members.insert(Member::new(node, ip));
        debug!("Registered {} as {} on {}", node, ip, segment.name);
    }

    /// Drops the membership of `node`; true if the segment is now empty
    pub fn deregister_attachment(&mut self, subnet: &Subnet, node: &str) -> bool {
        match self.segments.get_mut(subnet) {
            Some(segment) => {
                segment.members.retain(|m| m.node != node);
                segment.is_deletable()
            }
            None => true,
        }
    }

    /// Lists and inspects every provider segment
    ///
    /// Fails only if the listing itself fails; per-segment problems are
    /// collected in the observation.
    pub async fn observe_provider(
        provider: &dyn NetworkProvider,
    ) -> Result<Observation, ProviderError> {
        let listing = provider.list_segments().await?;
        let mut observation = Observation::default();

        for summary in listing {
            let Some(raw) = summary.subnet else {
                debug!("Skipping {} without IPv4 subnet", summary.name);
                continue;
            };
            let subnet = match raw.parse::<Subnet>() {
                Ok(subnet) => subnet,
                Err(_) => {
                    observation.problems.push(ConsistencyError::UnparsableSubnet {
                        name: summary.name,
                        subnet: raw,
                    });
                    continue;
                }
            };

            let info = match provider.inspect_segment(&summary.name).await {
                Ok(info) => info,
                Err(source) => {
                    observation
                        .uninspected
                        .entry(subnet)
                        .or_insert_with(|| summary.name.clone());
                    observation.problems.push(ConsistencyError::InspectFailed {
                        name: summary.name,
                        source,
                    });
                    continue;
                }
            };

            let segment = segment_from_info(info, subnet);
            if let Some(existing) = observation.segments.get(&subnet) {
                observation.problems.push(ConsistencyError::DuplicateSubnet {
                    subnet,
                    first: existing.name.clone(),
                    second: segment.name,
                });
                continue;
            }
            observation.segments.insert(subnet, segment);
        }

        Ok(observation)
    }

    /// Replaces the registry with the observed provider state
    ///
    /// Returns every disagreement with the previous contents; the provider
    /// view always wins. A registered segment that is listed but could not
    /// be inspected keeps its record under the listed name.
    pub fn apply_observation(&mut self, observation: Observation) -> Vec<ConsistencyError> {
        let Observation {
            mut segments,
            uninspected,
            mut problems,
        } = observation;
        let mut kept = Vec::new();

        for (subnet, registered) in &self.segments {
            match segments.get(subnet) {
                None => match uninspected.get(subnet) {
                    Some(listed) => {
                        if *listed != registered.name {
                            problems.push(ConsistencyError::SegmentRenamed {
                                subnet: *subnet,
                                registered: registered.name.clone(),
                                actual: listed.clone(),
                            });
                        }
                        debug!("Keeping record of uninspected segment {}", listed);
                        let mut segment = registered.clone();
                        segment.name = listed.clone();
                        kept.push(segment);
                    }
                    None => problems.push(ConsistencyError::SegmentVanished {
                        name: registered.name.clone(),
                        subnet: *subnet,
                    }),
                },
                Some(actual) => {
                    if actual.name != registered.name {
                        problems.push(ConsistencyError::SegmentRenamed {
                            subnet: *subnet,
                            registered: registered.name.clone(),
                            actual: actual.name.clone(),
                        });
                    }
                    let missing: Vec<Member> = registered
                        .members
                        .difference(&actual.members)
                        .cloned()
                        .collect();
                    let unexpected: Vec<Member> = actual
                        .members
                        .difference(&registered.members)
                        .cloned()
                        .collect();
                    if !missing.is_empty() || !unexpected.is_empty() {
                        problems.push(ConsistencyError::MembersDrifted {
                            name: actual.name.clone(),
                            missing,
                            unexpected,
                        });
                    }
                }
            }
        }

        let mut appeared: Vec<&Segment> = segments
            .iter()
            .filter(|(subnet, _)| !self.segments.contains_key(*subnet))
            .map(|(_, segment)| segment)
            .collect();
        appeared.sort_by_key(|s| s.subnet);
        for segment in appeared {
            problems.push(ConsistencyError::SegmentAppeared {
                name: segment.name.clone(),
                subnet: segment.subnet,
            });
        }

        for problem in &problems {
            warn!("Registry drift: {}", problem);
        }

        for segment in kept {
            segments.insert(segment.subnet, segment);
        }
        self.segments = segments;
        problems
    }

    /// Observes the provider and adopts its state
    pub async fn reconcile_with_provider(
        &mut self,
        provider: &dyn NetworkProvider,
    ) -> Result<Vec<ConsistencyError>, ProviderError> {
        let observation = Self::observe_provider(provider).await?;
        Ok(self.apply_observation(observation))
    }
}

fn segment_from_info(info: SegmentInfo, subnet: Subnet) -> Segment {
    let members: BTreeSet<Member> = info
        .members
        .into_iter()
        .map(|(node, ip)| Member::new(node, ip))
        .collect();
    Segment {
        name: info.name,
        subnet,
        members,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{FaultPoint, MockProvider};
    use pretty_assertions::assert_eq;

    fn subnet(s: &str) -> Subnet {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_lookup_is_exact() {
        let mut registry = SegmentRegistry::new();
        registry.register_attachment(subnet("10.0.1.0/24"), "host1", ip("10.0.1.2"));

        assert!(registry
            .find_segment_by_subnet(&subnet("10.0.10.0/24"))
            .is_none());
        let segment = registry
            .find_segment_by_subnet(&subnet("10.0.1.77/255.255.255.0"))
            .unwrap();
        assert_eq!(segment.name, "net_10_0_1_0_24");
    }

    #[test]
    fn test_register_keeps_existing_name() {
        let mut registry = SegmentRegistry::new();
        registry.insert_segment(Segment::new("lab-lan", subnet("10.0.0.0/24")));
        registry.register_attachment(subnet("10.0.0.0/24"), "host1", ip("10.0.0.2"));
        registry.register_attachment(subnet("10.0.0.0/24"), "host1", ip("10.0.0.3"));

        let segment = registry.find_segment_by_subnet(&subnet("10.0.0.0/24")).unwrap();
        assert_eq!(segment.name, "lab-lan");
        assert_eq!(segment.members.len(), 1);
        assert_eq!(segment.member("host1").unwrap().ip, ip("10.0.0.3"));
    }

    #[test]
    fn test_deregister_reports_deletable() {
        let mut registry = SegmentRegistry::new();
        let lan = subnet("10.0.0.0/24");
        registry.register_attachment(lan, "host1", ip("10.0.0.2"));
        registry.register_attachment(lan, "router1", ip("10.0.0.1"));

        assert!(!registry.deregister_attachment(&lan, "host1"));
        assert!(registry.deregister_attachment(&lan, "router1"));
        assert!(registry.deregister_attachment(&subnet("10.9.0.0/16"), "host1"));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut registry = SegmentRegistry::new();
        registry.register_attachment(subnet("10.0.1.0/24"), "host1", ip("10.0.1.2"));
        registry.register_attachment(subnet("10.0.0.0/24"), "host2", ip("10.0.0.2"));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].subnet, subnet("10.0.0.0/24"));
        let restored = SegmentRegistry::from_snapshot(snapshot.clone());
        assert_eq!(restored.snapshot(), snapshot);
    }

    #[tokio::test]
    async fn test_reconcile_adopts_provider_state() {
        let mock = MockProvider::new();
        mock.insert_segment("bridge", Some("172.17.0.0/16"));
        mock.insert_segment("host", None);
        mock.insert_segment("net_10_0_0_0_24", Some("10.0.0.0/24"));
        mock.attach("net_10_0_0_0_24", "host1", ip("10.0.0.2"));
        mock.insert_segment("weird", Some("not-a-subnet"));

        let mut registry = SegmentRegistry::new();
        registry.register_attachment(subnet("10.0.0.0/24"), "host9", ip("10.0.0.9"));
        registry.register_attachment(subnet("10.5.0.0/24"), "host5", ip("10.5.0.5"));

        let problems = registry.reconcile_with_provider(&mock).await.unwrap();

        assert!(problems.contains(&ConsistencyError::UnparsableSubnet {
            name: "weird".to_string(),
            subnet: "not-a-subnet".to_string(),
        }));
        assert!(problems.contains(&ConsistencyError::SegmentVanished {
            name: "net_10_5_0_0_24".to_string(),
            subnet: subnet("10.5.0.0/24"),
        }));
        assert!(problems.contains(&ConsistencyError::MembersDrifted {
            name: "net_10_0_0_0_24".to_string(),
            missing: vec![Member::new("host9", ip("10.0.0.9"))],
            unexpected: vec![Member::new("host1", ip("10.0.0.2"))],
        }));
        assert!(problems.contains(&ConsistencyError::SegmentAppeared {
            name: "bridge".to_string(),
            subnet: subnet("172.17.0.0/16"),
        }));

        assert_eq!(registry.len(), 2);
        let lan = registry.find_segment_by_subnet(&subnet("10.0.0.0/24")).unwrap();
        assert_eq!(lan.member("host1").unwrap().ip, ip("10.0.0.2"));
        assert!(lan.member("host9").is_none());
    }

    #[tokio::test]
    async fn test_reconcile_detects_rename_and_duplicates() {
        let mock = MockProvider::new();
        mock.insert_segment("lab-a", Some("10.0.0.0/24"));
        mock.insert_segment("lab-b", Some("10.0.0.0/24"));

        let mut registry = SegmentRegistry::new();
        registry.insert_segment(Segment::new("net_10_0_0_0_24", subnet("10.0.0.0/24")));

        let problems = registry.reconcile_with_provider(&mock).await.unwrap();
        assert!(problems.iter().any(|p| matches!(p, ConsistencyError::DuplicateSubnet { .. })));
        assert!(problems.iter().any(|p| matches!(
            p,
            ConsistencyError::SegmentRenamed { actual, .. } if actual == "lab-a"
        )));
    }

    #[tokio::test]
    async fn test_reconcile_listing_failure_leaves_registry() {
        let mock = MockProvider::new();
        mock.fail_next(FaultPoint::List, ProviderError::parse("daemon gone"));

        let mut registry = SegmentRegistry::new();
        registry.register_attachment(subnet("10.0.0.0/24"), "host1", ip("10.0.0.2"));

        assert!(registry.reconcile_with_provider(&mock).await.is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_inspect_failure_is_reported() {
        let mock = MockProvider::new();
        mock.insert_segment("net_10_0_0_0_24", Some("10.0.0.0/24"));
        mock.fail_next(
            FaultPoint::Inspect,
            ProviderError::not_found("Network net_10_0_0_0_24"),
        );

        let mut registry = SegmentRegistry::new();
        let problems = registry.reconcile_with_provider(&mock).await.unwrap();
        assert!(matches!(
            problems.as_slice(),
            [ConsistencyError::InspectFailed { .. }]
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_keeps_registered_segment_on_inspect_failure() {
        let mock = MockProvider::new();
        mock.insert_segment("lab", Some("10.0.0.0/24"));
        mock.attach("lab", "host1", ip("10.0.0.2"));
        mock.fail_next(FaultPoint::Inspect, ProviderError::parse("daemon busy"));

        let mut registry = SegmentRegistry::new();
        registry.insert_segment(Segment::new("lab", subnet("10.0.0.0/24")));
        registry.register_attachment(subnet("10.0.0.0/24"), "host1", ip("10.0.0.2"));

        let problems = registry.reconcile_with_provider(&mock).await.unwrap();
        assert!(matches!(
            problems.as_slice(),
            [ConsistencyError::InspectFailed { name, .. }] if name == "lab"
        ));
        let lan = registry.find_segment_by_subnet(&subnet("10.0.0.0/24")).unwrap();
        assert_eq!(lan.name, "lab");
        assert_eq!(lan.member("host1").unwrap().ip, ip("10.0.0.2"));
    }
}
