//! ACL group manager: bulk insertion with split-and-retry conflict
//! resolution, plus record-stream load and save.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, info};

use crate::acl::{AclOrder, compare_acls, split};
use crate::error::{Coexistence, Error};
use crate::network::NetBlock;
use crate::records::AclRecord;
use crate::report::{DiagnosticKind, Report};
use crate::tree::{Group, NodeId, Tree};

/// Which side of a coexistence violation to split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitSide {
    Candidate,
    Existing,
}

/// Pluggable tie-break for choosing the split side. Purely an optimization
/// knob; any deterministic choice keeps the retry loop correct.
pub type SplitHeuristic = fn(&Tree<NetBlock>, &Group, &Coexistence) -> SplitSide;

/// Default split-side choice: split the side that can settle the conflict by
/// moving fewer networks, measured as the smaller of each side's two
/// offending leaf sets. Ties split the candidate.
pub fn smallest_offending_set(
    _tree: &Tree<NetBlock>,
    _group: &Group,
    v: &Coexistence,
) -> SplitSide {
    let candidate = distinct(v.less.iter().map(|&(leaf, _)| leaf))
        .len()
        .min(distinct(v.greater.iter().map(|&(leaf, _)| leaf)).len());
    let existing = distinct(v.greater.iter().map(|&(_, leaf)| leaf))
        .len()
        .min(distinct(v.less.iter().map(|&(_, leaf)| leaf)).len());
    if candidate <= existing {
        SplitSide::Candidate
    } else {
        SplitSide::Existing
    }
}

/// Configuration for an [`AclGroup`].
#[derive(Debug, Clone, Copy)]
pub struct AclGroupOptions {
    /// Escalate malformed records and duplicate names to hard errors.
    pub strict: bool,
    /// Resolve coexistence violations by splitting. When off, conflicting
    /// candidates are reported and dropped, which read-only tooling wants.
    pub resolve_conflicts: bool,
}

impl Default for AclGroupOptions {
    fn default() -> Self {
        AclGroupOptions {
            strict: false,
            resolve_conflicts: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct AclMeta {
    line: Option<u32>,
    comment: Option<String>,
}

enum Resolution {
    CandidateSplit(NodeId, NodeId),
    ExistingSplit,
}

/// The ACL database: one arena of networks and ACL branches, with the
/// top-level ACLs registered in a [`Group`].
///
/// Insertion enforces the coexistence invariant: comparing any two top-level
/// ACLs never yields covered pairs in both directions. Violations are
/// resolved by structurally splitting one side and retrying, via a work
/// queue rather than recursion.
#[derive(Debug)]
pub struct AclGroup {
    tree: Tree<NetBlock>,
    group: Group,
    meta: HashMap<NodeId, AclMeta>,
    opts: AclGroupOptions,
    heuristic: SplitHeuristic,
    report: Report,
}

impl Default for AclGroup {
    fn default() -> Self {
        AclGroup::new(AclGroupOptions::default())
    }
}

impl AclGroup {
    pub fn new(opts: AclGroupOptions) -> Self {
        AclGroup::with_heuristic(opts, smallest_offending_set)
    }

    pub fn with_heuristic(opts: AclGroupOptions, heuristic: SplitHeuristic) -> Self {
        AclGroup {
            tree: Tree::new(),
            group: Group::new(),
            meta: HashMap::new(),
            opts,
            heuristic,
            report: Report::new(),
        }
    }

    pub fn tree(&self) -> &Tree<NetBlock> {
        &self.tree
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    /// Number of top-level ACLs.
    pub fn len(&self) -> usize {
        self.group.len()
    }

    pub fn is_empty(&self) -> bool {
        self.group.is_empty()
    }

    /// Top-level ACL names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.group.iter().map(|(name, _)| name).collect()
    }

    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.group.get(name)
    }

    /// Create a detached ACL branch, not yet registered.
    pub fn new_acl(
        &mut self,
        name: impl Into<String>,
        line: Option<u32>,
        comment: Option<String>,
    ) -> NodeId {
        let id = self.tree.new_branch(name);
        self.meta.insert(id, AclMeta { line, comment });
        id
    }

    /// Attach a network leaf under `acl`.
    pub fn add_network(&mut self, acl: NodeId, block: NetBlock) -> Result<NodeId, Error> {
        let leaf = self.tree.new_leaf(block.to_string(), block);
        self.tree.attach(acl, leaf)?;
        Ok(leaf)
    }

    /// Compare two ACLs of this group.
    pub fn compare(&self, left: NodeId, right: NodeId) -> Result<AclOrder, Error> {
        compare_acls(&self.tree, left, right)
    }

    /// Split the ACL owning `targets` along that leaf set; see
    /// [`crate::acl::split`].
    pub fn split_acl(&mut self, targets: &[NodeId]) -> Result<(NodeId, NodeId), Error> {
        split(&mut self.tree, &mut self.group, targets)
    }

    /// Resolve an ACL name against the group, following split-derived names:
    /// a missing `X` resolves to whatever `X-0`/`X-1` (recursively) resolve
    /// to. Returns the matching `(name, node)` pairs, empty if nothing
    /// matches.
    pub fn resolve(&self, name: &str) -> Vec<(String, NodeId)> {
        if let Some(id) = self.group.get(name) {
            return vec![(name.to_string(), id)];
        }
        let mut out = Vec::new();
        for half in ["-0", "-1"] {
            let derived = format!("{name}{half}");
            // only descend where a registered name is still reachable
            if self.group.iter().any(|(n, _)| n.starts_with(&derived)) {
                out.extend(self.resolve(&derived));
            }
        }
        out
    }

    /// Insert `acl` as a top-level entry, splitting either side as needed
    /// until every pair of top-level ACLs coexists.
    ///
    /// A work queue bounds stack depth: every conflict splits one tree and
    /// re-queues the resulting candidates. Each split strictly shrinks one
    /// side, so the loop terminates.
    pub fn insert(&mut self, acl: NodeId) -> Result<(), Error> {
        let mut queue = VecDeque::from([acl]);
        while let Some(candidate) = queue.pop_front() {
            let name = self.tree.name(candidate).to_string();
            match self.try_register(candidate) {
                Ok(()) => {
                    debug!(event = "AclInsert", phase = "Registered", acl = %name);
                }
                Err(Error::DuplicateName(dup)) => {
                    if self.opts.strict {
                        return Err(Error::DuplicateName(dup));
                    }
                    self.report.record(
                        DiagnosticKind::DuplicateName,
                        format!("acl {dup} dropped, original kept"),
                    );
                }
                Err(Error::Coexistence(violation)) => {
                    if !self.opts.resolve_conflicts {
                        self.report
                            .record(DiagnosticKind::DroppedConflict, violation.to_string());
                        continue;
                    }
                    info!(
                        event = "AclInsert",
                        phase = "Conflict",
                        acl = %name,
                        existing = %violation.right_name
                    );
                    match self.resolve_conflict(candidate, *violation)? {
                        Resolution::CandidateSplit(first, second) => {
                            queue.push_back(first);
                            queue.push_back(second);
                        }
                        Resolution::ExistingSplit => {
                            // the existing entry was replaced by its halves
                            // in place; the candidate gets another try
                            queue.push_back(candidate);
                        }
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    fn try_register(&mut self, candidate: NodeId) -> Result<(), Error> {
        let Self { tree, group, .. } = self;
        group.add(tree, candidate, |tree, candidate, group| {
            for (_, existing) in group.iter() {
                compare_acls(tree, candidate, existing)?;
            }
            Ok(())
        })
    }

    /// Split one side of a coexistence violation on the smaller of its two
    /// offending leaf sets. Falls back to the other side when the chosen one
    /// has no properly splittable set (e.g. a single-network ACL).
    fn resolve_conflict(
        &mut self,
        candidate: NodeId,
        v: Coexistence,
    ) -> Result<Resolution, Error> {
        let preferred = (self.heuristic)(&self.tree, &self.group, &v);
        let order = match preferred {
            SplitSide::Candidate => [SplitSide::Candidate, SplitSide::Existing],
            SplitSide::Existing => [SplitSide::Existing, SplitSide::Candidate],
        };
        for side in order {
            let (root, sets) = match side {
                SplitSide::Candidate => (
                    candidate,
                    (
                        distinct(v.less.iter().map(|&(leaf, _)| leaf)),
                        distinct(v.greater.iter().map(|&(leaf, _)| leaf)),
                    ),
                ),
                SplitSide::Existing => (
                    v.right,
                    (
                        distinct(v.greater.iter().map(|&(_, leaf)| leaf)),
                        distinct(v.less.iter().map(|&(_, leaf)| leaf)),
                    ),
                ),
            };
            if let Some(targets) = pick_targets(&self.tree, root, sets) {
                let (first, second) = split(&mut self.tree, &mut self.group, &targets)?;
                return Ok(match side {
                    SplitSide::Candidate => Resolution::CandidateSplit(first, second),
                    SplitSide::Existing => Resolution::ExistingSplit,
                });
            }
        }
        Err(Error::Coexistence(Box::new(v)))
    }

    /// Consume a classified record stream and build the group, one complete
    /// ACL at a time.
    pub fn load_records(
        &mut self,
        records: impl IntoIterator<Item = AclRecord>,
    ) -> Result<(), Error> {
        let mut current: Option<NodeId> = None;
        for record in records {
            match record {
                AclRecord::AclStart {
                    name,
                    line,
                    comment,
                } => {
                    if let Some(done) = current.take() {
                        self.insert(done)?;
                    }
                    current = Some(self.new_acl(name, line, comment));
                }
                AclRecord::Network {
                    cidr,
                    line,
                    comment,
                } => {
                    let Some(acl) = current else {
                        self.malformed(format!("network {cidr} outside any acl block"))?;
                        continue;
                    };
                    match cidr.parse::<NetBlock>() {
                        Ok(block) => {
                            self.add_network(acl, block.with_provenance(line, comment))?;
                        }
                        Err(err) => self.malformed(err.to_string())?,
                    }
                }
                AclRecord::SubAclRef { name } => {
                    let Some(acl) = current else {
                        self.malformed(format!("reference to {name} outside any acl block"))?;
                        continue;
                    };
                    match self.group.get(&name) {
                        Some(sub) => {
                            let Self { tree, group, .. } = self;
                            group.move_node(tree, sub, acl)?;
                        }
                        None => self.malformed(format!("reference to unknown acl {name}"))?,
                    }
                }
                AclRecord::Comment { .. } => {}
                AclRecord::Other { raw } => self.malformed(format!("unparsed line: {raw}"))?,
            }
        }
        if let Some(done) = current.take() {
            self.insert(done)?;
        }
        Ok(())
    }

    /// Emit the group as a record stream for the external serializer:
    /// depth-first, every referenced ACL ahead of its referent; within one
    /// ACL, sub-ACL references ahead of direct networks. Attached comments
    /// ride along on their records.
    pub fn emit_records(&self) -> Vec<AclRecord> {
        let mut out = Vec::new();
        for (_, id) in self.group.iter() {
            self.emit_acl(id, &mut out);
        }
        out
    }

    fn emit_acl(&self, acl: NodeId, out: &mut Vec<AclRecord>) {
        let (subs, nets): (Vec<NodeId>, Vec<NodeId>) = self
            .tree
            .children(acl)
            .iter()
            .copied()
            .partition(|&child| self.tree.is_branch(child));
        for &sub in &subs {
            self.emit_acl(sub, out);
        }
        let meta = self.meta.get(&acl).cloned().unwrap_or_default();
        out.push(AclRecord::AclStart {
            name: self.tree.name(acl).to_string(),
            line: meta.line,
            comment: meta.comment,
        });
        for &sub in &subs {
            out.push(AclRecord::SubAclRef {
                name: self.tree.name(sub).to_string(),
            });
        }
        for &leaf in &nets {
            if let Some(block) = self.tree.payload(leaf) {
                out.push(AclRecord::Network {
                    cidr: block.to_string(),
                    line: block.line,
                    comment: block.comment.clone(),
                });
            }
        }
    }

    fn malformed(&mut self, detail: String) -> Result<(), Error> {
        if self.opts.strict {
            return Err(Error::Format(detail));
        }
        self.report.record(DiagnosticKind::Malformed, detail);
        Ok(())
    }
}

fn distinct(ids: impl Iterator<Item = NodeId>) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for id in ids {
        if seen.insert(id) {
            out.push(id);
        }
    }
    out
}

/// Pick the smaller offending set that is still a proper subset of the
/// side's leaves, or nothing if neither qualifies.
fn pick_targets(
    tree: &Tree<NetBlock>,
    root: NodeId,
    sets: (Vec<NodeId>, Vec<NodeId>),
) -> Option<Vec<NodeId>> {
    let total = tree.leaves(root).len();
    let (a, b) = sets;
    let ordered = if a.len() <= b.len() { [a, b] } else { [b, a] };
    ordered
        .into_iter()
        .find(|set| !set.is_empty() && set.len() < total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_acl(group: &mut AclGroup, name: &str, nets: &[&str]) -> NodeId {
        let acl = group.new_acl(name, None, None);
        for cidr in nets {
            group
                .add_network(acl, cidr.parse().unwrap())
                .unwrap();
        }
        acl
    }

    fn assert_all_coexist(group: &AclGroup) {
        let ids: Vec<NodeId> = group.group.iter().map(|(_, id)| id).collect();
        for (i, &a) in ids.iter().enumerate() {
            for &b in &ids[i + 1..] {
                assert!(group.compare(a, b).is_ok());
            }
        }
    }

    #[test]
    fn test_mixed_overlap_resolved_by_splitting() {
        let mut group = AclGroup::default();
        let a = build_acl(&mut group, "aclA", &["192.168.1.0/24", "10.1.0.0/16"]);
        let b = build_acl(&mut group, "aclB", &["192.168.0.0/16", "10.1.1.0/24"]);
        group.insert(a).unwrap();
        group.insert(b).unwrap();

        assert!(group.len() >= 3);
        assert!(group.get("aclA").is_some());
        assert!(group.get("aclB").is_none());
        assert!(group.get("aclB-0").is_some());
        assert!(group.get("aclB-1").is_some());
        assert_all_coexist(&group);
    }

    #[test]
    fn test_duplicate_name_drops_candidate() {
        let mut group = AclGroup::default();
        let first = build_acl(&mut group, "dup", &["10.0.0.0/8"]);
        let second = build_acl(&mut group, "dup", &["192.168.0.0/16"]);
        group.insert(first).unwrap();
        group.insert(second).unwrap();

        assert_eq!(group.len(), 1);
        // the original's networks survive
        let kept = group.get("dup").unwrap();
        assert_eq!(group.tree().leaves(kept).len(), 1);
        assert_eq!(
            group.report().entries()[0].kind,
            DiagnosticKind::DuplicateName
        );
    }

    #[test]
    fn test_strict_mode_escalates_duplicates() {
        let mut group = AclGroup::new(AclGroupOptions {
            strict: true,
            ..AclGroupOptions::default()
        });
        let first = build_acl(&mut group, "dup", &["10.0.0.0/8"]);
        let second = build_acl(&mut group, "dup", &["192.168.0.0/16"]);
        group.insert(first).unwrap();
        assert!(matches!(
            group.insert(second),
            Err(Error::DuplicateName(_))
        ));
    }

    #[test]
    fn test_conflicts_dropped_when_resolution_disabled() {
        let mut group = AclGroup::new(AclGroupOptions {
            resolve_conflicts: false,
            ..AclGroupOptions::default()
        });
        let a = build_acl(&mut group, "aclA", &["192.168.1.0/24", "10.1.0.0/16"]);
        let b = build_acl(&mut group, "aclB", &["192.168.0.0/16", "10.1.1.0/24"]);
        group.insert(a).unwrap();
        group.insert(b).unwrap();

        assert_eq!(group.len(), 1);
        assert_eq!(
            group.report().entries()[0].kind,
            DiagnosticKind::DroppedConflict
        );
    }

    #[test]
    fn test_custom_heuristic_splits_existing_side() {
        let mut group = AclGroup::with_heuristic(AclGroupOptions::default(), |_, _, _| {
            SplitSide::Existing
        });
        let existing = build_acl(&mut group, "aclA", &["192.168.1.0/24", "10.1.0.0/16"]);
        let candidate = build_acl(&mut group, "aclB", &["192.168.0.0/16", "10.1.1.0/24"]);
        group.insert(existing).unwrap();
        group.insert(candidate).unwrap();

        assert!(group.get("aclA").is_none());
        assert!(group.get("aclA-0").is_some());
        assert!(group.get("aclA-1").is_some());
        assert!(group.get("aclB").is_some());
        assert_all_coexist(&group);
    }

    #[test]
    fn test_default_heuristic_splits_side_moving_fewer_networks() {
        // the existing acl can settle the conflict by moving one covering
        // network; the candidate would have to move two either way
        let mut group = AclGroup::default();
        let existing = build_acl(
            &mut group,
            "wide",
            &["10.0.0.0/8", "192.168.1.0/24", "172.16.5.0/24"],
        );
        let candidate = build_acl(
            &mut group,
            "mesh",
            &[
                "10.1.0.0/16",
                "10.2.0.0/16",
                "192.168.0.0/16",
                "172.16.0.0/16",
            ],
        );
        group.insert(existing).unwrap();
        group.insert(candidate).unwrap();

        assert!(group.get("wide").is_none());
        assert!(group.get("wide-0").is_some());
        assert!(group.get("wide-1").is_some());
        assert!(group.get("mesh").is_some());
        assert_eq!(group.len(), 3);
        assert_all_coexist(&group);
    }

    #[test]
    fn test_load_records_builds_nested_acls() {
        let mut group = AclGroup::default();
        group
            .load_records([
                AclRecord::AclStart {
                    name: "branch-office".into(),
                    line: Some(1),
                    comment: None,
                },
                AclRecord::Network {
                    cidr: "10.2.0.0/16".into(),
                    line: Some(2),
                    comment: Some("# shenzhen".into()),
                },
                AclRecord::AclStart {
                    name: "corp".into(),
                    line: Some(4),
                    comment: None,
                },
                AclRecord::SubAclRef {
                    name: "branch-office".into(),
                },
                AclRecord::Network {
                    cidr: "10.1.0.0/16".into(),
                    line: Some(6),
                    comment: None,
                },
                AclRecord::Comment {
                    text: "# trailing".into(),
                },
            ])
            .unwrap();

        // branch-office is owned by corp now, not top-level
        assert_eq!(group.names(), vec!["corp"]);
        let corp = group.get("corp").unwrap();
        assert_eq!(group.tree().leaves(corp).len(), 2);

        let records = group.emit_records();
        // referenced acl block comes first, then the referent with its
        // sub-reference ahead of its own networks
        assert_eq!(
            records,
            vec![
                AclRecord::AclStart {
                    name: "branch-office".into(),
                    line: Some(1),
                    comment: None,
                },
                AclRecord::Network {
                    cidr: "10.2.0.0/16".into(),
                    line: Some(2),
                    comment: Some("# shenzhen".into()),
                },
                AclRecord::AclStart {
                    name: "corp".into(),
                    line: Some(4),
                    comment: None,
                },
                AclRecord::SubAclRef {
                    name: "branch-office".into(),
                },
                AclRecord::Network {
                    cidr: "10.1.0.0/16".into(),
                    line: Some(6),
                    comment: None,
                },
            ]
        );
    }

    #[test]
    fn test_malformed_records_reported_not_fatal() {
        let mut group = AclGroup::default();
        group
            .load_records([
                AclRecord::AclStart {
                    name: "a".into(),
                    line: Some(1),
                    comment: None,
                },
                AclRecord::Network {
                    cidr: "300.0.0.0/8".into(),
                    line: Some(2),
                    comment: None,
                },
                AclRecord::Other {
                    raw: "???".into(),
                },
            ])
            .unwrap();
        assert_eq!(group.report().len(), 2);

        let mut strict = AclGroup::new(AclGroupOptions {
            strict: true,
            ..AclGroupOptions::default()
        });
        assert!(matches!(
            strict.load_records([AclRecord::Other { raw: "???".into() }]),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_resolve_follows_split_derived_names() {
        let mut group = AclGroup::default();
        let a = build_acl(&mut group, "aclA", &["192.168.1.0/24", "10.1.0.0/16"]);
        let b = build_acl(&mut group, "aclB", &["192.168.0.0/16", "10.1.1.0/24"]);
        group.insert(a).unwrap();
        group.insert(b).unwrap();

        let parts = group.resolve("aclB");
        let names: Vec<&str> = parts.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["aclB-0", "aclB-1"]);
        assert!(group.resolve("nonesuch").is_empty());
        // prefix of a registered name, but not a registered acl itself
        assert!(group.resolve("acl").is_empty());
        assert_eq!(group.resolve("aclA").len(), 1);
    }
}
