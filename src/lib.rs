// src/lib.rs
pub use acl::{AclOrder, compare_acls, effective_networks, split};
pub use acl_group::{AclGroup, AclGroupOptions, SplitHeuristic, SplitSide, smallest_offending_set};
pub use error::{Coexistence, Error, OrderCycle};
pub use network::{NetBlock, NetOrder};
pub use records::{AclRecord, ViewBlock};
pub use report::{Diagnostic, DiagnosticKind, Report};
pub use tree::{Group, NodeId, NodeKind, Tree};
pub use view::{View, ViewGroup, ViewGroupOptions};

mod acl;
mod acl_group;
mod error;
mod network;
mod records;
mod report;
mod tree;
mod view;
