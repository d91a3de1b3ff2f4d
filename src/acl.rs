//! ACL engine: redundancy reduction, pairwise comparison, and the
//! structural split primitive.
//!
//! An ACL is a branch in a [`Tree<NetBlock>`] whose leaves are networks and
//! whose nested branches are sub-ACLs. Everything here works on the reduced
//! ("effective") network set: the maximal, non-redundant prefixes reachable
//! from the branch.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use strum_macros::Display as StrumDisplay;
use tracing::debug;

use crate::error::{Coexistence, Error};
use crate::network::{NetBlock, NetOrder};
use crate::tree::{Group, NodeId, Tree};

/// Relation between two ACLs' effective network sets.
///
/// A mixed relation (covered pairs in both directions) is not an ordering and
/// surfaces as [`Error::Coexistence`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, Serialize, Deserialize)]
pub enum AclOrder {
    /// Some networks are covered by the other ACL, none cover it.
    Less,
    /// Some networks cover networks of the other ACL, none are covered.
    Greater,
    /// Equal or fully disjoint; either order is acceptable.
    Other,
}

pub(crate) fn net(tree: &Tree<NetBlock>, id: NodeId) -> Result<&NetBlock, Error> {
    tree.payload(id)
        .ok_or_else(|| Error::UnknownNode(tree.name(id).to_string()))
}

/// The non-redundant network set of `acl`: every reachable leaf, minus any
/// leaf fully covered by another reachable leaf.
///
/// The result keeps the insertion order of first survival, it is not sorted.
/// Reducing an already-reduced set is a no-op.
pub fn effective_networks(tree: &Tree<NetBlock>, acl: NodeId) -> Result<Vec<NodeId>, Error> {
    let leaves = tree.leaves(acl);
    let mut pending = leaves.clone();
    let mut survivors = Vec::new();

    for &leaf in &leaves {
        // already absorbed by an earlier candidate
        if !pending.contains(&leaf) {
            continue;
        }
        pending.retain(|&n| n != leaf);
        let mut keeper = leaf;
        for other in pending.clone() {
            let relation = net(tree, keeper)?.compare(net(tree, other)?)?;
            if relation == NetOrder::Less {
                keeper = other;
            }
            if relation != NetOrder::NoCommon {
                pending.retain(|&n| n != other);
            }
        }
        survivors.push(keeper);
    }
    Ok(survivors)
}

/// Compare two ACLs by their effective network sets.
///
/// Covered pairs in both directions make the ACLs unorderable; that case is
/// returned as [`Error::Coexistence`] carrying both pair lists so the caller
/// can drive a split.
pub fn compare_acls(tree: &Tree<NetBlock>, left: NodeId, right: NodeId) -> Result<AclOrder, Error> {
    let left_nets = effective_networks(tree, left)?;
    let right_nets = effective_networks(tree, right)?;

    let mut less = Vec::new();
    let mut greater = Vec::new();
    for (&x, &y) in left_nets.iter().cartesian_product(right_nets.iter()) {
        match net(tree, x)?.compare(net(tree, y)?)? {
            NetOrder::Less => less.push((x, y)),
            NetOrder::Greater => greater.push((x, y)),
            NetOrder::Equal | NetOrder::NoCommon => {}
        }
    }

    if !less.is_empty() && !greater.is_empty() {
        return Err(Error::Coexistence(Box::new(Coexistence {
            left,
            right,
            left_name: tree.name(left).to_string(),
            right_name: tree.name(right).to_string(),
            less,
            greater,
        })));
    }
    if !greater.is_empty() {
        Ok(AclOrder::Greater)
    } else if !less.is_empty() {
        Ok(AclOrder::Less)
    } else {
        Ok(AclOrder::Other)
    }
}

/// Derive the `-0`/`-1` half names for a branch, extending the suffix until
/// neither collides with a registered top-level name.
fn split_names(base: &str, group: &Group) -> (String, String) {
    let mut first = format!("{base}-0");
    let mut second = format!("{base}-1");
    while group.contains(&first) || group.contains(&second) {
        first.push_str("-0");
        second.push_str("-1");
    }
    (first, second)
}

/// Split the tree containing `targets` into two disjoint top-level branches.
///
/// Every target leaf ends up in the first ("-0") half, everything else stays
/// in the second ("-1") half. The walk from each leaf folds through
/// single-child ancestors, creates (or reuses, when several targets route
/// through the same ancestor) a first-half sibling at each multi-child
/// ancestor, and terminates at the root. If the root was registered in
/// `group`, its entry is replaced by the two halves in place.
///
/// Returns `(first_half, second_half)`. The target set must be a non-empty
/// proper subset of the root's leaves.
pub fn split(
    tree: &mut Tree<NetBlock>,
    group: &mut Group,
    targets: &[NodeId],
) -> Result<(NodeId, NodeId), Error> {
    let Some(&seed) = targets.first() else {
        return Err(Error::InvalidSplitTargets);
    };
    let root = tree.top_parent(seed);
    let root_name = tree.name(root).to_string();
    let all: HashSet<NodeId> = tree.leaves(root).into_iter().collect();
    let wanted: HashSet<NodeId> = targets.iter().copied().collect();
    if wanted.len() >= all.len() || !wanted.is_subset(&all) {
        return Err(Error::InvalidSplitTargets);
    }

    // original ancestor -> its first-half sibling, for reuse within this call
    let mut siblings: HashMap<NodeId, NodeId> = HashMap::new();
    let mut halves: Option<(NodeId, NodeId)> = None;

    for &leaf in targets {
        let mut node = leaf;
        loop {
            let Some(parent) = tree.parent(node) else {
                return Err(Error::InvalidSplitTargets);
            };
            if tree.children(parent).len() == 1 {
                // a lone child contributes nothing, fold it into the walk
                node = parent;
                continue;
            }
            if let Some(&sibling) = siblings.get(&parent) {
                // everything above was already split by an earlier target
                tree.detach(parent, node)?;
                tree.attach(sibling, node)?;
                break;
            }
            let base = tree.name(parent).to_string();
            let (first_name, second_name) = split_names(&base, group);
            let grandparent = tree.parent(parent);
            let sibling = tree.new_branch(first_name.clone());
            tree.set_name(parent, second_name.clone());
            tree.detach(parent, node)?;
            tree.attach(sibling, node)?;
            siblings.insert(parent, sibling);
            match grandparent {
                Some(grandparent) => {
                    tree.attach(grandparent, sibling)?;
                    node = sibling;
                }
                None => {
                    group.replace_split(&base, (first_name, sibling), (second_name, parent));
                    halves = Some((sibling, parent));
                    break;
                }
            }
        }
    }

    let (first, second) = halves.ok_or(Error::InvalidSplitTargets)?;
    debug!(
        event = "Split",
        branch = root_name,
        first = tree.name(first),
        second = tree.name(second),
        moved = targets.len()
    );
    Ok((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_acl(tree: &mut Tree<NetBlock>, name: &str, nets: &[&str]) -> NodeId {
        let acl = tree.new_branch(name);
        for cidr in nets {
            let leaf = tree.new_leaf(*cidr, cidr.parse().unwrap());
            tree.attach(acl, leaf).unwrap();
        }
        acl
    }

    fn net_strings(tree: &Tree<NetBlock>, ids: &[NodeId]) -> Vec<String> {
        ids.iter().map(|&id| tree.name(id).to_string()).collect()
    }

    #[test]
    fn test_reduction_keeps_maximal_prefixes() {
        let mut tree = Tree::new();
        let acl = flat_acl(
            &mut tree,
            "a",
            &["10.1.1.0/24", "10.1.0.0/16", "10.1.2.0/24", "192.168.0.0/24"],
        );
        let reduced = effective_networks(&tree, acl).unwrap();
        assert_eq!(
            net_strings(&tree, &reduced),
            vec!["10.1.0.0/16", "192.168.0.0/24"]
        );
    }

    #[test]
    fn test_reduction_sees_through_nesting() {
        let mut tree = Tree::new();
        let outer = flat_acl(&mut tree, "outer", &["172.16.0.0/12"]);
        let inner = flat_acl(&mut tree, "inner", &["172.16.1.0/24", "10.0.0.0/8"]);
        tree.attach(outer, inner).unwrap();
        let reduced = effective_networks(&tree, outer).unwrap();
        assert_eq!(
            net_strings(&tree, &reduced),
            vec!["172.16.0.0/12", "10.0.0.0/8"]
        );
    }

    #[test]
    fn test_reduction_is_idempotent() {
        let mut tree = Tree::new();
        let acl = flat_acl(
            &mut tree,
            "a",
            &["10.1.0.0/16", "10.1.1.0/24", "192.168.3.0/24"],
        );
        let once = effective_networks(&tree, acl).unwrap();
        let once_nets = net_strings(&tree, &once);
        let once_refs: Vec<&str> = once_nets.iter().map(String::as_str).collect();
        let again = flat_acl(&mut tree, "b", &once_refs);
        let twice = effective_networks(&tree, again).unwrap();
        assert_eq!(net_strings(&tree, &twice), once_nets);
    }

    #[test]
    fn test_compare_pure_nesting_and_disjoint() {
        let mut tree = Tree::new();
        let small = flat_acl(&mut tree, "small", &["192.168.1.0/24", "10.1.0.0/16"]);
        let big = flat_acl(&mut tree, "big", &["192.168.0.0/16"]);
        let far = flat_acl(&mut tree, "far", &["172.16.0.0/12"]);

        assert_eq!(compare_acls(&tree, small, big).unwrap(), AclOrder::Less);
        assert_eq!(compare_acls(&tree, big, small).unwrap(), AclOrder::Greater);
        assert_eq!(compare_acls(&tree, small, far).unwrap(), AclOrder::Other);
    }

    #[test]
    fn test_compare_mixed_overlap_is_a_violation() {
        let mut tree = Tree::new();
        let a = flat_acl(&mut tree, "a", &["192.168.1.0/24", "10.1.0.0/16"]);
        let b = flat_acl(&mut tree, "b", &["192.168.0.0/16", "10.1.1.0/24"]);

        let err = compare_acls(&tree, a, b).unwrap_err();
        let Error::Coexistence(v) = err else {
            panic!("expected a coexistence violation");
        };
        assert_eq!(v.left_name, "a");
        assert_eq!(v.right_name, "b");
        // a's 192.168.1.0/24 is covered by b's /16
        assert_eq!(v.less.len(), 1);
        assert_eq!(tree.name(v.less[0].0), "192.168.1.0/24");
        // a's 10.1.0.0/16 covers b's /24
        assert_eq!(v.greater.len(), 1);
        assert_eq!(tree.name(v.greater[0].0), "10.1.0.0/16");
    }

    #[test]
    fn test_split_partitions_leaves() {
        let mut tree = Tree::new();
        let mut group = Group::new();
        let acl = flat_acl(
            &mut tree,
            "mix",
            &["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16", "1.1.1.1"],
        );
        group.add(&tree, acl, |_, _, _| Ok(())).unwrap();
        let leaves = tree.leaves(acl);
        let targets = vec![leaves[0], leaves[2]];

        let (first, second) = split(&mut tree, &mut group, &targets).unwrap();

        assert_eq!(tree.name(first), "mix-0");
        assert_eq!(tree.name(second), "mix-1");
        let first_set = net_strings(&tree, &tree.leaves(first));
        let second_set = net_strings(&tree, &tree.leaves(second));
        assert_eq!(first_set, vec!["10.0.0.0/8", "192.168.0.0/16"]);
        assert_eq!(second_set, vec!["172.16.0.0/12", "1.1.1.1"]);
        // group entry replaced by the two halves
        assert!(!group.contains("mix"));
        assert_eq!(group.get("mix-0"), Some(first));
        assert_eq!(group.get("mix-1"), Some(second));
    }

    #[test]
    fn test_split_routes_through_shared_ancestors() {
        // root -> inner{x, y}, chain -> z ; splitting {x, z} must reuse the
        // first-half sibling of root for both walks.
        let mut tree = Tree::new();
        let mut group = Group::new();
        let root = tree.new_branch("root");
        let inner = flat_acl(&mut tree, "inner", &["10.0.0.0/24", "10.0.1.0/24"]);
        let chain = tree.new_branch("chain");
        let z = tree.new_leaf("192.168.0.0/24", "192.168.0.0/24".parse().unwrap());
        tree.attach(root, inner).unwrap();
        tree.attach(root, chain).unwrap();
        tree.attach(chain, z).unwrap();
        group.add(&tree, root, |_, _, _| Ok(())).unwrap();

        let x = tree.leaves(inner)[0];
        let (first, second) = split(&mut tree, &mut group, &[x, z]).unwrap();

        let first_set = net_strings(&tree, &tree.leaves(first));
        let second_set = net_strings(&tree, &tree.leaves(second));
        assert_eq!(first_set, vec!["10.0.0.0/24", "192.168.0.0/24"]);
        assert_eq!(second_set, vec!["10.0.1.0/24"]);
        assert_eq!(tree.name(first), "root-0");
        assert_eq!(tree.name(second), "root-1");
    }

    #[test]
    fn test_split_rejects_improper_target_sets() {
        let mut tree = Tree::new();
        let mut group = Group::new();
        let acl = flat_acl(&mut tree, "a", &["10.0.0.0/8", "192.168.0.0/16"]);
        group.add(&tree, acl, |_, _, _| Ok(())).unwrap();
        let leaves = tree.leaves(acl);

        assert!(matches!(
            split(&mut tree, &mut group, &[]),
            Err(Error::InvalidSplitTargets)
        ));
        assert!(matches!(
            split(&mut tree, &mut group, &leaves),
            Err(Error::InvalidSplitTargets)
        ));
    }
}
