//! View ordering engine.
//!
//! A view binds a resolution profile to one ACL plus an opaque remainder
//! payload. The engine keeps views partitioned into a free set (no
//! containment relation to anything) and ordered chains (ascending by ACL
//! containment), detects ordering cycles across three or more ACLs, and
//! breaks them with the ACL engine's split primitive.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::acl::{AclOrder, compare_acls, effective_networks, net};
use crate::acl_group::AclGroup;
use crate::error::{Error, OrderCycle};
use crate::network::{NetBlock, NetOrder};
use crate::records::ViewBlock;
use crate::report::{DiagnosticKind, Report};
use crate::tree::{NodeId, Tree};

/// One view: a name, the ACL it matches clients against, and the rest of its
/// configuration as uninterpreted bytes.
///
/// The ACL reference line is kept as prefix/suffix around the name so the
/// name can be rewritten in place when a split retires the referenced ACL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub name: String,
    pub acl_name: String,
    line_prefix: String,
    line_suffix: String,
    pub remainder: Vec<u8>,
}

impl View {
    /// Build a view from its database block, extracting the ACL name from
    /// the reference line.
    pub fn from_block(block: ViewBlock) -> Result<Self, Error> {
        let (line_prefix, acl_name, line_suffix) = split_acl_line(&block.acl_line)?;
        Ok(View {
            name: block.name,
            acl_name,
            line_prefix,
            line_suffix,
            remainder: block.remainder,
        })
    }

    /// The ACL reference line with the current ACL name spliced back in.
    pub fn acl_line(&self) -> String {
        format!("{}{}{}", self.line_prefix, self.acl_name, self.line_suffix)
    }

    pub fn to_block(&self) -> ViewBlock {
        ViewBlock {
            name: self.name.clone(),
            acl_line: self.acl_line(),
            remainder: self.remainder.clone(),
        }
    }

    /// Replacement view for a split-derived ACL: same payload, names carry
    /// the derivation suffix (`v` + `-0` for `acl` + `-0`).
    fn with_acl(&self, acl_name: &str) -> View {
        let suffix = acl_name.strip_prefix(&self.acl_name).unwrap_or("");
        View {
            name: format!("{}{}", self.name, suffix),
            acl_name: acl_name.to_string(),
            line_prefix: self.line_prefix.clone(),
            line_suffix: self.line_suffix.clone(),
            remainder: self.remainder.clone(),
        }
    }
}

/// Extract the ACL name from a `match-clients { key k;NAME; };` line as
/// `(prefix, name, suffix)`. The name is the third `;`-separated field from
/// the end.
fn split_acl_line(line: &str) -> Result<(String, String, String), Error> {
    let parts: Vec<&str> = line.split(';').collect();
    if parts.len() < 3 {
        return Err(Error::Format(format!("no acl reference in line: {line}")));
    }
    let token = parts[parts.len() - 3];
    let name = token.trim();
    if name.is_empty() || name.contains(|c: char| c.is_whitespace() || c == '{' || c == '}') {
        return Err(Error::Format(format!("no acl reference in line: {line}")));
    }
    let start: usize = parts[..parts.len() - 3].iter().map(|p| p.len() + 1).sum();
    let begin = start + (token.len() - token.trim_start().len());
    let end = begin + name.len();
    Ok((
        line[..begin].to_string(),
        name.to_string(),
        line[end..].to_string(),
    ))
}

/// Configuration for a [`ViewGroup`].
#[derive(Debug, Clone)]
pub struct ViewGroupOptions {
    /// Escalate malformed blocks, duplicates, and unresolvable ACL
    /// references to hard errors.
    pub strict: bool,
    /// Name of the wildcard-match ACL; the view referencing it is pinned
    /// after everything else and never participates in ordering.
    pub reserved: String,
}

impl Default for ViewGroupOptions {
    fn default() -> Self {
        ViewGroupOptions {
            strict: false,
            reserved: "ANY".to_string(),
        }
    }
}

/// Relations of every placed view to an incoming ACL, computed before any
/// mutation so a detected cycle leaves the group untouched.
struct Placement {
    chain_rels: Vec<Vec<AclOrder>>,
    free_rels: Vec<AclOrder>,
}

/// The view database: a free set, ordered chains, and the pinned catch-all.
///
/// Within a chain, order is ascending containment of the referenced ACLs and
/// is significant; order between chains is not.
#[derive(Debug, Default)]
pub struct ViewGroup {
    chains: Vec<Vec<View>>,
    free: Vec<View>,
    catch_all: Option<View>,
    opts: ViewGroupOptions,
    report: Report,
}

impl ViewGroup {
    pub fn new(opts: ViewGroupOptions) -> Self {
        ViewGroup {
            opts,
            ..ViewGroup::default()
        }
    }

    pub fn chains(&self) -> &[Vec<View>] {
        &self.chains
    }

    pub fn free(&self) -> &[View] {
        &self.free
    }

    pub fn catch_all(&self) -> Option<&View> {
        self.catch_all.as_ref()
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    /// Total number of views held, catch-all included.
    pub fn len(&self) -> usize {
        self.chains.iter().map(Vec::len).sum::<usize>()
            + self.free.len()
            + usize::from(self.catch_all.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains_name(&self, name: &str) -> bool {
        self.chains
            .iter()
            .flatten()
            .chain(self.free.iter())
            .chain(self.catch_all.iter())
            .any(|v| v.name == name)
    }

    /// Build the group from view blocks. The ACL group must already hold the
    /// reserved wildcard ACL.
    pub fn load_blocks(
        &mut self,
        blocks: impl IntoIterator<Item = ViewBlock>,
        acls: &mut AclGroup,
    ) -> Result<(), Error> {
        if acls.get(&self.opts.reserved).is_none() {
            return Err(Error::MissingAclReference {
                view: "*".to_string(),
                acl: self.opts.reserved.clone(),
            });
        }
        for block in blocks {
            let name = block.name.clone();
            match View::from_block(block) {
                Ok(view) => self.insert(view, acls)?,
                Err(Error::Format(detail)) => {
                    if self.opts.strict {
                        return Err(Error::Format(detail));
                    }
                    self.report
                        .record(DiagnosticKind::Malformed, format!("view {name}: {detail}"));
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Insert one view, maintaining chain order.
    ///
    /// An ordering cycle splits the incoming view's ACL along the covering
    /// network set, retires the view (and any placed view on the same ACL),
    /// and re-queues replacements; a view whose ACL was split earlier fans
    /// out over the derived parts the same way. The queue bounds the
    /// recursion either case would need.
    pub fn insert(&mut self, view: View, acls: &mut AclGroup) -> Result<(), Error> {
        let mut queue = VecDeque::from([view]);
        while let Some(v) = queue.pop_front() {
            if v.acl_name == self.opts.reserved {
                if self.catch_all.is_some() {
                    if self.opts.strict {
                        return Err(Error::DuplicateName(v.name));
                    }
                    self.report.record(
                        DiagnosticKind::DuplicateName,
                        format!("second catch-all view {} dropped", v.name),
                    );
                } else {
                    self.catch_all = Some(v);
                }
                continue;
            }
            if self.contains_name(&v.name) {
                if self.opts.strict {
                    return Err(Error::DuplicateName(v.name));
                }
                self.report.record(
                    DiagnosticKind::DuplicateName,
                    format!("view {} dropped, original kept", v.name),
                );
                continue;
            }
            let resolved = acls.resolve(&v.acl_name);
            if resolved.is_empty() {
                if self.opts.strict {
                    return Err(Error::MissingAclReference {
                        view: v.name,
                        acl: v.acl_name,
                    });
                }
                self.report.record(
                    DiagnosticKind::MissingAclReference,
                    format!("view {} references unknown acl {}, dropped", v.name, v.acl_name),
                );
                continue;
            }
            if resolved.len() > 1 || resolved[0].0 != v.acl_name {
                // the acl was split before this view arrived; fan out over
                // the derived parts
                for (acl_name, _) in &resolved {
                    queue.push_back(v.with_acl(acl_name));
                }
                continue;
            }
            let acl = resolved[0].1;
            match self.classify(&v.name, acl, acls) {
                Ok(placement) => self.merge(v, placement),
                Err(Error::OrderCycle(cycle)) => {
                    warn!(
                        event = "ViewOrder",
                        phase = "Cycle",
                        view = %v.name,
                        acl = %cycle.acl_name,
                        against = %cycle.conflicting_name
                    );
                    let (first, second) = acls.split_acl(&cycle.offending)?;
                    let first_name = acls.tree().name(first).to_string();
                    let second_name = acls.tree().name(second).to_string();
                    // placed views on the retired name re-enter the queue
                    // and fan out over the halves like the incoming one
                    queue.extend(self.displace(&v.acl_name));
                    queue.push_back(v.with_acl(&first_name));
                    queue.push_back(v.with_acl(&second_name));
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Relate every placed view to `acl`, surfacing an [`Error::OrderCycle`]
    /// when a chain holds a view less than `acl` after one greater than it.
    fn classify(
        &self,
        view_name: &str,
        acl: NodeId,
        acls: &AclGroup,
    ) -> Result<Placement, Error> {
        let tree = acls.tree();
        let mut chain_rels = Vec::with_capacity(self.chains.len());
        for chain in &self.chains {
            let mut rels = Vec::with_capacity(chain.len());
            let mut saw_greater = false;
            for member in chain {
                let member_acl = self.member_acl(member, acls)?;
                let rel = compare_acls(tree, member_acl, acl)?;
                if rel == AclOrder::Less && saw_greater {
                    // the chain pins this member above a view that contains
                    // acl, while containment pins it below: a cycle
                    return Err(Error::OrderCycle(Box::new(OrderCycle {
                        view: view_name.to_string(),
                        acl_name: tree.name(acl).to_string(),
                        conflicting_name: tree.name(member_acl).to_string(),
                        offending: covering_networks(tree, acl, member_acl)?,
                    })));
                }
                saw_greater = saw_greater || rel == AclOrder::Greater;
                rels.push(rel);
            }
            chain_rels.push(rels);
        }
        let mut free_rels = Vec::with_capacity(self.free.len());
        for member in &self.free {
            let member_acl = self.member_acl(member, acls)?;
            free_rels.push(compare_acls(tree, member_acl, acl)?);
        }
        Ok(Placement {
            chain_rels,
            free_rels,
        })
    }

    /// Remove and return every placed view referencing `acl_name`, dropping
    /// chains that end up empty.
    fn displace(&mut self, acl_name: &str) -> Vec<View> {
        let mut out = Vec::new();
        for chain in &mut self.chains {
            let (hit, kept): (Vec<View>, Vec<View>) =
                chain.drain(..).partition(|member| member.acl_name == acl_name);
            out.extend(hit);
            *chain = kept;
        }
        self.chains.retain(|chain| !chain.is_empty());
        let (hit, kept): (Vec<View>, Vec<View>) = self
            .free
            .drain(..)
            .partition(|member| member.acl_name == acl_name);
        out.extend(hit);
        self.free = kept;
        out
    }

    fn member_acl(&self, member: &View, acls: &AclGroup) -> Result<NodeId, Error> {
        acls.get(&member.acl_name)
            .ok_or_else(|| Error::MissingAclReference {
                view: member.name.clone(),
                acl: member.acl_name.clone(),
            })
    }

    /// Rebuild the partition around the new view.
    ///
    /// A related chain is carried whole: it is cut before its first member
    /// whose ACL contains the incoming one, the front joins the new chain
    /// below the view and the tail above it, so chain-mates are never
    /// separated into different chains. Related free views join the matching
    /// side; chains with no relation stay untouched.
    fn merge(&mut self, view: View, placement: Placement) {
        let mut below = Vec::new();
        let mut above = Vec::new();
        let mut kept: Vec<Vec<View>> = Vec::new();
        for (mut chain, rels) in self.chains.drain(..).zip(placement.chain_rels) {
            if rels.iter().all(|&rel| rel == AclOrder::Other) {
                kept.push(chain);
                continue;
            }
            let cut = rels
                .iter()
                .position(|&rel| rel == AclOrder::Greater)
                .unwrap_or(chain.len());
            let tail = chain.split_off(cut);
            below.extend(chain);
            above.extend(tail);
        }
        let mut still_free = Vec::new();
        for (member, rel) in self.free.drain(..).zip(placement.free_rels) {
            match rel {
                AclOrder::Less => below.push(member),
                AclOrder::Greater => above.push(member),
                AclOrder::Other => still_free.push(member),
            }
        }
        self.free = still_free;
        if below.is_empty() && above.is_empty() {
            debug!(event = "ViewOrder", phase = "Free", view = %view.name);
            self.free.push(view);
        } else {
            debug!(
                event = "ViewOrder",
                phase = "Chained",
                view = %view.name,
                below = below.len(),
                above = above.len()
            );
            let mut chain = below;
            chain.push(view);
            chain.extend(above);
            kept.push(chain);
        }
        self.chains = kept;
    }

    /// Emit all views for the external serializer: chains first in their
    /// internal order, then the free views, then the pinned catch-all.
    pub fn emit_blocks(&self) -> Vec<ViewBlock> {
        self.chains
            .iter()
            .flatten()
            .chain(self.free.iter())
            .chain(self.catch_all.iter())
            .map(View::to_block)
            .collect()
    }
}

/// The networks of `a` that cover at least one network of `m`; splitting `a`
/// along this set disentangles the two.
fn covering_networks(
    tree: &Tree<NetBlock>,
    a: NodeId,
    m: NodeId,
) -> Result<Vec<NodeId>, Error> {
    let a_nets = effective_networks(tree, a)?;
    let m_nets = effective_networks(tree, m)?;
    let mut out = Vec::new();
    for &x in &a_nets {
        for &y in &m_nets {
            if net(tree, x)?.compare(net(tree, y)?)? == NetOrder::Greater {
                out.push(x);
                break;
            }
        }
    }
    Ok(out)
}
