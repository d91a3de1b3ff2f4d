use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tree::NodeId;

/// Crate-wide error type.
///
/// The recoverable conditions (`DuplicateName`, `Coexistence`, `OrderCycle`,
/// `Format`, `MissingAclReference`) are caught by the group managers and feed
/// their retry loops or the diagnostics report. The ownership-tree conditions
/// (`NodeTaken`, `NotChild`, `NotBranch`, `UnknownNode`) indicate corrupted
/// internal state and are never caught internally.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum Error {
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    #[error("node {0} is already attached to a parent")]
    NodeTaken(String),

    #[error("node {child} is not a child of {parent}")]
    NotChild { parent: String, child: String },

    #[error("node {0} is not a branch")]
    NotBranch(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("{0}")]
    Coexistence(Box<Coexistence>),

    #[error("{0}")]
    OrderCycle(Box<OrderCycle>),

    #[error("malformed record: {0}")]
    Format(String),

    #[error("view {view} references unknown acl {acl}")]
    MissingAclReference { view: String, acl: String },

    #[error("networks {left} and {right} overlap without nesting")]
    PartialOverlap { left: String, right: String },

    #[error("split target set must be a non-empty proper subset of the branch's leaves")]
    InvalidSplitTargets,
}

/// Payload of [`Error::Coexistence`]: two ACLs whose effective network sets
/// overlap in both directions and therefore cannot be ordered.
///
/// `less` holds pairs `(left leaf, right leaf)` where the left leaf is covered
/// by the right one, `greater` pairs where the left leaf covers the right one.
/// Both lists are non-empty, that is what makes the overlap mixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coexistence {
    pub left: NodeId,
    pub right: NodeId,
    pub left_name: String,
    pub right_name: String,
    pub less: Vec<(NodeId, NodeId)>,
    pub greater: Vec<(NodeId, NodeId)>,
}

impl Display for Coexistence {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(
            f,
            "acls {} and {} cannot coexist: {} covered pair(s), {} covering pair(s)",
            self.left_name,
            self.right_name,
            self.less.len(),
            self.greater.len()
        )
    }
}

/// Payload of [`Error::OrderCycle`]: inserting a view would close a
/// containment cycle among the ordered chains.
///
/// `offending` is the set of leaves of the incoming view's ACL that cover
/// networks of the conflicting ACL; splitting along it breaks the cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCycle {
    pub view: String,
    pub acl_name: String,
    pub conflicting_name: String,
    pub offending: Vec<NodeId>,
}

impl Display for OrderCycle {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(
            f,
            "inserting view {} (acl {}) creates an ordering cycle against acl {}",
            self.view, self.acl_name, self.conflicting_name
        )
    }
}
