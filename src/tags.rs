//! Per-link VLAN tag allocation.
//!
//! Switches forward on header bits alone, so concurrent multi-hop routes
//! sharing a physical link are told apart by a VLAN tag unique on that
//! link. The allocator hands out the smallest unused tag per directed link
//! and takes tags back when the owning flow goes away.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::route::SwitchPort;

/// Largest usable VLAN id; 0 and 4095 are reserved by the wire format.
pub const VLAN_TAG_MAX: u16 = 4094;

/// One hop of physical wiring in a specific direction: the egress endpoint
/// it leaves from and the ingress endpoint it arrives at.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct DirectedLink {
    pub src: SwitchPort,
    pub dst: SwitchPort,
}

impl DirectedLink {
    pub fn new(src: SwitchPort, dst: SwitchPort) -> DirectedLink {
        DirectedLink { src, dst }
    }
}

impl fmt::Display for DirectedLink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// A link's 12-bit tag space is full.
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
#[error("no free VLAN tag on link {link}")]
pub struct TagsExhausted {
    pub link: DirectedLink,
}

/// Tracks which VLAN tags are in use on each directed link.
///
/// Owned, internally locked state: callers hold it behind an `Arc` and pass
/// it to the route compiler explicitly. Allocations on the same link are
/// serialized by the mutex.
#[derive(Debug, Default)]
pub struct LinkTagAllocator {
    pools: Mutex<HashMap<DirectedLink, BTreeSet<u16>>>,
}

impl LinkTagAllocator {
    pub fn new() -> LinkTagAllocator {
        LinkTagAllocator::default()
    }

    /// Reserve the smallest tag not currently in use on `link`, starting
    /// from 1. Released tags are handed out again before the pool grows.
    pub fn allocate(&self, link: DirectedLink) -> Result<u16, TagsExhausted> {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        let pool = pools.entry(link).or_default();
        let mut tag = 1;
        for &used in pool.iter() {
            if used == tag {
                tag += 1;
            } else if used > tag {
                break;
            }
        }
        if tag > VLAN_TAG_MAX {
            return Err(TagsExhausted { link });
        }
        pool.insert(tag);
        trace!(%link, tag, "allocated vlan tag");
        Ok(tag)
    }

    /// Return `tag` to `link`'s pool. Releasing a tag that was never
    /// reserved is a no-op.
    pub fn release(&self, link: DirectedLink, tag: u16) {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        match pools.get_mut(&link) {
            Some(pool) if pool.contains(&tag) => {
                pool.remove(&tag);
                trace!(%link, tag, "released vlan tag");
            }
            _ => debug!(%link, tag, "release of a tag that was not reserved"),
        }
    }

    /// Tags currently reserved on `link`, ascending.
    pub fn in_use(&self, link: DirectedLink) -> Vec<u16> {
        let pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools
            .get(&link)
            .map(|pool| pool.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// The tag reservations backing one compiled route.
///
/// Dropping the lease returns every tag to its link, so a route abandoned
/// half-compiled or a flow expired by the execution engine cannot leak tag
/// space.
#[derive(Debug)]
pub struct TagLease {
    allocator: Arc<LinkTagAllocator>,
    tags: Vec<(DirectedLink, u16)>,
}

impl TagLease {
    pub fn new(allocator: Arc<LinkTagAllocator>) -> TagLease {
        TagLease {
            allocator,
            tags: Vec::new(),
        }
    }

    /// Allocate on `link` and record the reservation in this lease.
    pub fn allocate(&mut self, link: DirectedLink) -> Result<u16, TagsExhausted> {
        let tag = self.allocator.allocate(link)?;
        self.tags.push((link, tag));
        Ok(tag)
    }

    pub fn tags(&self) -> &[(DirectedLink, u16)] {
        &self.tags
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl Drop for TagLease {
    fn drop(&mut self) {
        for &(link, tag) in &self.tags {
            self.allocator.release(link, tag);
        }
    }
}
