//! IPv4 network intervals and the four-way containment comparison.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use strum_macros::Display as StrumDisplay;

use crate::error::Error;

/// Containment relation between two network intervals.
///
/// Partial overlap is structurally impossible for binary-prefix intervals and
/// is therefore not a variant; see [`NetBlock::compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, Serialize, Deserialize)]
pub enum NetOrder {
    /// The interval is a subset of the other.
    Less,
    Equal,
    /// The interval is a superset of the other.
    Greater,
    /// The intervals are disjoint.
    NoCommon,
}

/// An IPv4 CIDR prefix as a closed interval over the 32-bit address space.
///
/// The prefix is canonicalized on construction: host bits are zeroed, so
/// `192.168.1.3/24` becomes `192.168.1.0/24`. A bare address parses as a
/// `/32`. Provenance from the source database (line number, trailing
/// comment) rides along as plain metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetBlock {
    net: Ipv4Net,
    first: u32,
    last: u32,
    pub line: Option<u32>,
    pub comment: Option<String>,
}

impl NetBlock {
    pub fn new(net: Ipv4Net) -> Self {
        let net = net.trunc();
        NetBlock {
            net,
            first: u32::from(net.network()),
            last: u32::from(net.broadcast()),
            line: None,
            comment: None,
        }
    }

    pub fn with_provenance(mut self, line: Option<u32>, comment: Option<String>) -> Self {
        self.line = line;
        self.comment = comment;
        self
    }

    /// First address of the interval, as an integer.
    pub fn first(&self) -> u32 {
        self.first
    }

    /// Last address of the interval, as an integer.
    pub fn last(&self) -> u32 {
        self.last
    }

    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    /// Compare the two intervals for containment.
    ///
    /// Valid prefixes either nest or are disjoint; a partial overlap means
    /// the interval bounds were corrupted and surfaces as
    /// [`Error::PartialOverlap`] rather than a fourth ordering.
    pub fn compare(&self, other: &NetBlock) -> Result<NetOrder, Error> {
        if self.first == other.first && self.last == other.last {
            Ok(NetOrder::Equal)
        } else if self.first >= other.first && self.last <= other.last {
            Ok(NetOrder::Less)
        } else if self.first <= other.first && self.last >= other.last {
            Ok(NetOrder::Greater)
        } else if self.last < other.first || self.first > other.last {
            Ok(NetOrder::NoCommon)
        } else {
            Err(Error::PartialOverlap {
                left: self.to_string(),
                right: other.to_string(),
            })
        }
    }
}

impl FromStr for NetBlock {
    type Err = Error;

    /// Parse `a.b.c.d/n` or a bare `a.b.c.d` (implicitly `/32`).
    fn from_str(s: &str) -> Result<Self, Error> {
        let net = if s.contains('/') {
            s.parse::<Ipv4Net>()
                .map_err(|_| Error::Format(format!("unrecognized network: {s}")))?
        } else {
            Ipv4Net::from(
                s.parse::<Ipv4Addr>()
                    .map_err(|_| Error::Format(format!("unrecognized network: {s}")))?,
            )
        };
        Ok(NetBlock::new(net))
    }
}

impl Display for NetBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.net)
    }
}
