//! Route-to-policy compilation.
//!
//! A route is an ordered list of (switch, port) waypoints with even length:
//! waypoints 2i and 2i+1 are where the packet enters and leaves the same
//! switch. Compilation turns each such hop into one match/rewrite segment
//! and stitches the hops together with per-link VLAN tags, since a switch
//! has no notion of "this flow" beyond header bits.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::oxm;
use crate::policy::{filter, fwd, modify, Policy};
use crate::tags::{DirectedLink, LinkTagAllocator, TagLease, TagsExhausted};

/// One waypoint: a port on a switch.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SwitchPort {
    pub dpid: u64,
    pub port: u32,
}

impl SwitchPort {
    pub fn new(dpid: u64, port: u32) -> SwitchPort {
        SwitchPort { dpid, port }
    }
}

impl fmt::Display for SwitchPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.dpid, self.port)
    }
}

/// Why a route could not be compiled.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// Waypoints must pair up into (ingress, egress) per switch.
    #[error("route has odd length {0}")]
    OddLength(usize),
    /// An (ingress, egress) pair named two different switches.
    #[error("hop pair {index} spans switches {ingress} and {egress}")]
    SwitchMismatch {
        index: usize,
        ingress: u64,
        egress: u64,
    },
    /// A link along the route had no free VLAN tag.
    #[error(transparent)]
    TagsExhausted(#[from] TagsExhausted),
}

/// A route compiled into a policy, together with the tag reservations that
/// keep it unambiguous on shared links. Dropping the lease frees the tags,
/// so keep it alive as long as the flow entries are installed.
#[derive(Debug)]
pub struct CompiledRoute {
    pub policy: Policy,
    pub lease: TagLease,
}

/// One hop: the packet enters `dpid` at `in_port` and leaves at `out_port`.
#[derive(Copy, Clone, Debug)]
struct Hop {
    dpid: u64,
    in_port: u32,
    out_port: u32,
}

fn hops(route: &[SwitchPort]) -> Result<Vec<Hop>, RouteError> {
    if route.len() % 2 != 0 {
        return Err(RouteError::OddLength(route.len()));
    }
    route
        .chunks_exact(2)
        .enumerate()
        .map(|(index, pair)| {
            if pair[0].dpid != pair[1].dpid {
                return Err(RouteError::SwitchMismatch {
                    index,
                    ingress: pair[0].dpid,
                    egress: pair[1].dpid,
                });
            }
            Ok(Hop {
                dpid: pair[0].dpid,
                in_port: pair[0].port,
                out_port: pair[1].port,
            })
        })
        .collect()
}

/// Compile a route into one policy tree.
///
/// Each hop becomes a `filter(switch) >> filter(in_port) >> ... >> fwd`
/// segment; segments are combined in parallel because every switch installs
/// its own flow entry independently. The first hop matches the packet
/// untagged; each later hop reserves a tag on the directed link feeding it,
/// matches whatever tag the packet already carries, and rewrites only when
/// the tag changes across the link.
///
/// Flow lifetimes are not attached here; that is the decision handler's
/// concern.
pub fn compile_route(
    route: &[SwitchPort],
    allocator: &Arc<LinkTagAllocator>,
) -> Result<CompiledRoute, RouteError> {
    let hops = hops(route)?;
    let mut lease = TagLease::new(Arc::clone(allocator));
    let mut segments = Vec::with_capacity(hops.len());
    let mut carried: Option<u16> = None;
    let mut prev: Option<Hop> = None;

    for hop in hops {
        let mut segment = filter(oxm::switch_id(hop.dpid)) >> filter(oxm::in_port(hop.in_port));
        if let Some(prev) = prev {
            // Entering over a shared link: reserve a tag identifying this
            // route instance on that link.
            let link = DirectedLink::new(
                SwitchPort::new(prev.dpid, prev.out_port),
                SwitchPort::new(hop.dpid, hop.in_port),
            );
            let tag = lease.allocate(link)?;
            if let Some(carried) = carried {
                segment = segment >> filter(oxm::vlan_vid(carried));
            }
            if carried != Some(tag) {
                segment = segment >> modify(oxm::vlan_vid(tag));
            }
            trace!(%link, tag, "stitched hop");
            carried = Some(tag);
        }
        segments.push(segment >> fwd(hop.out_port));
        prev = Some(hop);
    }

    // An empty route compiles to stop: nothing to install anywhere.
    let policy = segments
        .into_iter()
        .reduce(|acc, segment| acc + segment)
        .unwrap_or(Policy::Stop);
    Ok(CompiledRoute { policy, lease })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::stop;

    fn wp(dpid: u64, port: u32) -> SwitchPort {
        SwitchPort::new(dpid, port)
    }

    #[test]
    fn odd_length_is_rejected() {
        let alloc = Arc::new(LinkTagAllocator::new());
        let err = compile_route(&[wp(1, 1), wp(1, 2), wp(2, 1)], &alloc).unwrap_err();
        assert_eq!(err, RouteError::OddLength(3));
    }

    #[test]
    fn mismatched_pair_is_rejected() {
        let alloc = Arc::new(LinkTagAllocator::new());
        let err = compile_route(&[wp(1, 1), wp(2, 2)], &alloc).unwrap_err();
        assert_eq!(
            err,
            RouteError::SwitchMismatch {
                index: 0,
                ingress: 1,
                egress: 2,
            }
        );
    }

    #[test]
    fn failed_compile_releases_partial_allocations() {
        let alloc = Arc::new(LinkTagAllocator::new());
        // Drain the link feeding switch 3 so compilation fails after the
        // link feeding switch 2 already took a tag.
        let second_link = DirectedLink::new(wp(2, 3), wp(3, 4));
        for _ in 1..=crate::tags::VLAN_TAG_MAX {
            alloc.allocate(second_link).unwrap();
        }
        let route = [
            wp(1, 1),
            wp(1, 2),
            wp(2, 1),
            wp(2, 3),
            wp(3, 4),
            wp(3, 5),
        ];
        let err = compile_route(&route, &alloc).unwrap_err();
        assert!(matches!(err, RouteError::TagsExhausted(_)));
        // The partial reservation on the first link was unwound.
        let first_link = DirectedLink::new(wp(1, 2), wp(2, 1));
        assert_eq!(alloc.in_use(first_link), Vec::<u16>::new());
    }

    #[test]
    fn empty_route_compiles_to_stop() {
        let alloc = Arc::new(LinkTagAllocator::new());
        let compiled = compile_route(&[], &alloc).unwrap();
        assert_eq!(compiled.policy, stop());
        assert!(compiled.lease.is_empty());
    }

    #[test]
    fn single_switch_route_carries_no_tag() {
        let alloc = Arc::new(LinkTagAllocator::new());
        let compiled = compile_route(&[wp(1, 1), wp(1, 2)], &alloc).unwrap();
        let expected = filter(oxm::switch_id(1)) >> filter(oxm::in_port(1)) >> fwd(2);
        assert_eq!(compiled.policy, expected);
        assert!(compiled.lease.is_empty());
    }

    #[test]
    fn second_hop_sets_a_tag_without_matching_one() {
        let alloc = Arc::new(LinkTagAllocator::new());
        let route = [wp(1, 1), wp(1, 2), wp(2, 1), wp(2, 3)];
        let compiled = compile_route(&route, &alloc).unwrap();
        let first = filter(oxm::switch_id(1)) >> filter(oxm::in_port(1)) >> fwd(2);
        let second = filter(oxm::switch_id(2))
            >> filter(oxm::in_port(1))
            >> modify(oxm::vlan_vid(1))
            >> fwd(3);
        assert_eq!(compiled.policy, first + second);
        assert_eq!(compiled.lease.tags().len(), 1);
    }

    #[test]
    fn unchanged_tag_is_matched_but_not_rewritten() {
        let alloc = Arc::new(LinkTagAllocator::new());
        let route = [
            wp(1, 1),
            wp(1, 2),
            wp(2, 1),
            wp(2, 3),
            wp(3, 4),
            wp(3, 5),
        ];
        let compiled = compile_route(&route, &alloc).unwrap();
        // Both links are fresh, so both allocations return 1: switch 3
        // matches tag 1 and must not re-set it.
        let third = filter(oxm::switch_id(3))
            >> filter(oxm::in_port(4))
            >> filter(oxm::vlan_vid(1))
            >> fwd(5);
        match compiled.policy {
            Policy::Par(_, rightmost) => assert_eq!(*rightmost, third),
            other => panic!("expected a parallel tree, got {}", other),
        }
    }

    #[test]
    fn changed_tag_is_matched_and_rewritten() {
        let alloc = Arc::new(LinkTagAllocator::new());
        // Occupy tag 1 on the second link so the route gets tag 2 there.
        let second_link = DirectedLink::new(wp(2, 3), wp(3, 4));
        alloc.allocate(second_link).unwrap();
        let route = [
            wp(1, 1),
            wp(1, 2),
            wp(2, 1),
            wp(2, 3),
            wp(3, 4),
            wp(3, 5),
        ];
        let compiled = compile_route(&route, &alloc).unwrap();
        let third = filter(oxm::switch_id(3))
            >> filter(oxm::in_port(4))
            >> filter(oxm::vlan_vid(1))
            >> modify(oxm::vlan_vid(2))
            >> fwd(5);
        match compiled.policy {
            Policy::Par(_, rightmost) => assert_eq!(*rightmost, third),
            other => panic!("expected a parallel tree, got {}", other),
        }
    }

    #[test]
    fn concurrent_routes_on_a_shared_link_get_distinct_tags() {
        let alloc = Arc::new(LinkTagAllocator::new());
        let route = [wp(1, 1), wp(1, 2), wp(2, 1), wp(2, 3)];
        let first = compile_route(&route, &alloc).unwrap();
        let second = compile_route(&route, &alloc).unwrap();
        assert_eq!(first.lease.tags()[0].1, 1);
        assert_eq!(second.lease.tags()[0].1, 2);
        assert_ne!(first.policy, second.policy);
    }
}
