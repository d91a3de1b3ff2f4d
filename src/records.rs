//! Boundary record types exchanged with the external parser and serializer.
//!
//! The core never touches raw database text; the parser hands it one record
//! per classified source line and the serializer consumes the same shapes on
//! the way out.

use serde::{Deserialize, Serialize};

/// One classified line of the ACL database.
///
/// The same enum doubles as the save-side stream: [`crate::AclGroup`] emits
/// records depth-first with every referenced ACL ahead of its referent, and
/// nested references ahead of direct networks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclRecord {
    /// Opening line of an ACL block.
    AclStart {
        name: String,
        line: Option<u32>,
        comment: Option<String>,
    },
    /// A network entry inside the current ACL block.
    Network {
        cidr: String,
        line: Option<u32>,
        comment: Option<String>,
    },
    /// A reference to another ACL by name inside the current block.
    SubAclRef { name: String },
    /// A standalone comment line; carried for completeness, not interpreted.
    Comment { text: String },
    /// Anything the parser could not classify. Reported, fatal only in
    /// strict mode.
    Other { raw: String },
}

/// One view block of the view database.
///
/// `acl_line` is the raw `match-clients` line, from which the core extracts
/// and rewrites the ACL name; `remainder` is the rest of the block, opaque
/// bytes the core never parses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewBlock {
    pub name: String,
    pub acl_line: String,
    pub remainder: Vec<u8>,
}
