//! Forwarding decision handler.
//!
//! Learns host locations from packet sources, asks the topology for a path
//! to the destination, compiles the path into a policy, and floods over the
//! spanning tree when the destination is unknown. One decision per packet;
//! safe to invoke concurrently from any number of workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::hosts::HostsDb;
use crate::oxm::{EthAddr, EthDst, EthSrc, InPort, SwitchId};
use crate::packet::{Packet, PacketExt};
use crate::policy::{handler, idle_timeout, stop, Policy};
use crate::route::{compile_route, SwitchPort};
use crate::tags::{LinkTagAllocator, TagLease};

/// Topology collaborator: path computation over the discovered network.
///
/// The returned waypoints cover the transit switches only (empty when the
/// endpoints share a switch or no path exists); the caller supplies the
/// first and last waypoints. Must be fast, total, and side-effect free.
pub trait Topology: Send + Sync {
    fn compute_route(&self, from: u64, to: u64) -> Vec<SwitchPort>;
}

/// Spanning-tree collaborator: a loop-free flood policy.
pub trait SpanningTree: Send + Sync {
    fn broadcast_policy(&self) -> Policy;
}

/// Policy execution engine collaborator. The engine compiles registered
/// policies into flow-table state, re-invokes data-dependent policies per
/// matching packet, and honors flow lifetimes.
pub trait PolicyEngine {
    fn register_policy(&mut self, name: &str, policy: Policy);
}

/// The learning-switch application: all shared state behind one service
/// object, composed explicitly from its collaborators.
pub struct LearningSwitch {
    topology: Arc<dyn Topology>,
    stp: Arc<dyn SpanningTree>,
    hosts: Arc<HostsDb>,
    tags: Arc<LinkTagAllocator>,
    // Tag reservations of live routes, keyed by (source, destination)
    // host pair. Recompiling a pair's route replaces its lease, so the
    // superseded tags go back to their links.
    leases: Mutex<HashMap<(EthAddr, EthAddr), TagLease>>,
}

impl LearningSwitch {
    pub fn new(
        topology: Arc<dyn Topology>,
        stp: Arc<dyn SpanningTree>,
        hosts: Arc<HostsDb>,
        tags: Arc<LinkTagAllocator>,
    ) -> LearningSwitch {
        LearningSwitch {
            topology,
            stp,
            hosts,
            tags,
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn hosts(&self) -> &Arc<HostsDb> {
        &self.hosts
    }

    pub fn tags(&self) -> &Arc<LinkTagAllocator> {
        &self.tags
    }

    /// Decide what to do with one packet.
    ///
    /// Switch id and ingress port are watched (the decision depends on
    /// them); the addresses are plain loads. Every failure path degrades
    /// to `stop()` rather than installing a broken policy.
    pub fn decide(&self, pkt: &mut dyn Packet) -> Policy {
        let (Some(dpid), Some(in_port)) = (pkt.watch::<SwitchId>(), pkt.watch::<InPort>())
        else {
            warn!("packet carries no switch identity; dropping");
            return stop();
        };
        let (Some(src), Some(dst)) = (pkt.load::<EthSrc>(), pkt.load::<EthDst>()) else {
            warn!(dpid, in_port, "packet carries no ethernet addresses; dropping");
            return stop();
        };

        self.hosts.learn(dpid, in_port, src);

        let target = self.hosts.query(dst);
        let source = self.hosts.query(src);

        match target {
            Some(target) => {
                let Some(source) = source else {
                    // Unlearnable source (broadcast/multicast): no origin
                    // to route from.
                    warn!(%src, %dst, "destination known but source has no location");
                    return stop();
                };
                self.forward(source, target, src, dst)
            }
            None if !dst.is_broadcast() => {
                // Unknown unicast: flood, but with a zero idle timeout so
                // the decision is not cached and gets re-evaluated once
                // the destination is learned.
                debug!(%dst, "flooding for unknown address");
                idle_timeout(Duration::ZERO) >> self.stp.broadcast_policy()
            }
            None => self.stp.broadcast_policy(),
        }
    }

    fn forward(
        &self,
        source: SwitchPort,
        target: SwitchPort,
        src: EthAddr,
        dst: EthAddr,
    ) -> Policy {
        let transit = self.topology.compute_route(source.dpid, target.dpid);
        if transit.is_empty() && source.dpid != target.dpid {
            warn!(
                from = source.dpid,
                to = target.dpid,
                "path not found"
            );
            return stop();
        }

        let mut route = Vec::with_capacity(transit.len() + 2);
        route.push(source);
        route.extend(transit);
        route.push(target);

        match compile_route(&route, &self.tags) {
            Ok(compiled) => {
                info!(
                    from = source.dpid,
                    to = target.dpid,
                    hops = route.len() / 2,
                    "forwarding through route"
                );
                let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
                leases.insert((src, dst), compiled.lease);
                compiled.policy
            }
            Err(err) => {
                warn!(
                    from = source.dpid,
                    to = target.dpid,
                    error = %err,
                    "route compilation failed"
                );
                stop()
            }
        }
    }

    /// Flow-expiry notification from the execution engine: the flow for
    /// this host pair is gone, so its VLAN tags go back to their links.
    pub fn flow_removed(&self, src: EthAddr, dst: EthAddr) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if leases.remove(&(src, dst)).is_some() {
            debug!(%src, %dst, "released route tags on flow expiry");
        }
    }

    /// The whole application as one data-dependent policy.
    pub fn policy(self: &Arc<Self>) -> Policy {
        let this = Arc::clone(self);
        handler(move |pkt| this.decide(pkt))
    }

    /// Register the forwarding policy with the execution engine.
    pub fn install(self: &Arc<Self>, engine: &mut dyn PolicyEngine) {
        engine.register_policy("forwarding", self.policy());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oxm;
    use crate::packet::FieldSet;
    use crate::policy::fwd;

    struct NoRoutes;

    impl Topology for NoRoutes {
        fn compute_route(&self, _: u64, _: u64) -> Vec<SwitchPort> {
            Vec::new()
        }
    }

    struct Flood;

    impl SpanningTree for Flood {
        fn broadcast_policy(&self) -> Policy {
            fwd(u32::MAX)
        }
    }

    fn switch() -> Arc<LearningSwitch> {
        Arc::new(LearningSwitch::new(
            Arc::new(NoRoutes),
            Arc::new(Flood),
            Arc::new(HostsDb::new()),
            Arc::new(LinkTagAllocator::new()),
        ))
    }

    fn packet(dpid: u64, in_port: u32, src: EthAddr, dst: EthAddr) -> FieldSet {
        FieldSet::new()
            .with(oxm::switch_id(dpid))
            .with(oxm::in_port(in_port))
            .with(oxm::eth_src(src))
            .with(oxm::eth_dst(dst))
    }

    fn mac(last: u8) -> EthAddr {
        EthAddr::new([0x02, 0, 0, 0, 0, last])
    }

    #[test]
    fn malformed_packet_is_dropped() {
        let sw = switch();
        let mut empty = FieldSet::new();
        assert_eq!(sw.decide(&mut empty), stop());
    }

    #[test]
    fn unknown_unicast_floods_without_caching() {
        let sw = switch();
        let mut pkt = packet(1, 1, mac(1), mac(2));
        let decision = sw.decide(&mut pkt);
        assert_eq!(
            decision,
            idle_timeout(Duration::ZERO) >> Flood.broadcast_policy()
        );
    }

    #[test]
    fn broadcast_destination_floods_directly() {
        let sw = switch();
        let mut pkt = packet(1, 1, mac(1), EthAddr::BROADCAST);
        assert_eq!(sw.decide(&mut pkt), Flood.broadcast_policy());
    }

    #[test]
    fn decision_watches_switch_and_port_only() {
        let sw = switch();
        let mut pkt = packet(1, 1, mac(1), EthAddr::BROADCAST);
        sw.decide(&mut pkt);
        let watched: Vec<_> = pkt.watched().collect();
        assert_eq!(
            watched,
            vec![(oxm::ns::OPENFLOW_BASIC, 0), (oxm::ns::NON_OPENFLOW, 0)]
        );
    }

    #[test]
    fn unreachable_known_destination_is_dropped() {
        let sw = switch();
        // Learn both hosts on different switches; NoRoutes finds no path.
        sw.decide(&mut packet(1, 1, mac(1), EthAddr::BROADCAST));
        sw.decide(&mut packet(2, 5, mac(2), EthAddr::BROADCAST));
        let mut pkt = packet(1, 1, mac(1), mac(2));
        assert_eq!(sw.decide(&mut pkt), stop());
    }

    #[test]
    fn same_switch_delivery_needs_no_topology() {
        let sw = switch();
        sw.decide(&mut packet(1, 1, mac(1), EthAddr::BROADCAST));
        sw.decide(&mut packet(1, 5, mac(2), EthAddr::BROADCAST));
        let mut pkt = packet(1, 1, mac(1), mac(2));
        let expected = crate::policy::filter(oxm::switch_id(1))
            >> crate::policy::filter(oxm::in_port(1))
            >> fwd(5);
        assert_eq!(sw.decide(&mut pkt), expected);
    }

    #[test]
    fn broadcast_source_with_known_destination_is_dropped() {
        let sw = switch();
        sw.decide(&mut packet(1, 5, mac(2), EthAddr::BROADCAST));
        let mut pkt = packet(1, 1, EthAddr::BROADCAST, mac(2));
        assert_eq!(sw.decide(&mut pkt), stop());
    }

    #[test]
    fn policy_wraps_decide_as_a_handler() {
        let sw = switch();
        let p = sw.policy();
        match p {
            Policy::Handler(ph) => {
                let mut pkt = packet(1, 1, mac(1), EthAddr::BROADCAST);
                assert_eq!(ph.invoke(&mut pkt), Flood.broadcast_policy());
            }
            other => panic!("expected a handler policy, got {}", other),
        }
    }

    #[test]
    fn install_registers_under_forwarding() {
        struct Recorder(Vec<String>);
        impl PolicyEngine for Recorder {
            fn register_policy(&mut self, name: &str, _: Policy) {
                self.0.push(name.to_owned());
            }
        }
        let sw = switch();
        let mut engine = Recorder(Vec::new());
        sw.install(&mut engine);
        assert_eq!(engine.0, vec!["forwarding".to_owned()]);
    }
}
