use std::sync::Arc;

use rust_sdn::hosts::HostsDb;
use rust_sdn::learning_switch::{LearningSwitch, PolicyEngine, SpanningTree, Topology};
use rust_sdn::oxm::{self, EthAddr};
use rust_sdn::packet::FieldSet;
use rust_sdn::policy::{fwd, Policy};
use rust_sdn::route::SwitchPort;
use rust_sdn::tags::LinkTagAllocator;

/// Static line topology 1 -- 2 -- 3; ports 2 and 1/3 face the neighbors.
struct LineTopology;

impl Topology for LineTopology {
    fn compute_route(&self, from: u64, to: u64) -> Vec<SwitchPort> {
        match (from, to) {
            (1, 3) => vec![
                SwitchPort::new(1, 2),
                SwitchPort::new(2, 1),
                SwitchPort::new(2, 3),
                SwitchPort::new(3, 4),
            ],
            (3, 1) => vec![
                SwitchPort::new(3, 4),
                SwitchPort::new(2, 3),
                SwitchPort::new(2, 1),
                SwitchPort::new(1, 2),
            ],
            _ => Vec::new(),
        }
    }
}

struct FloodEverything;

impl SpanningTree for FloodEverything {
    fn broadcast_policy(&self) -> Policy {
        fwd(u32::MAX)
    }
}

struct PrintingEngine;

impl PolicyEngine for PrintingEngine {
    fn register_policy(&mut self, name: &str, policy: Policy) {
        println!("registered {:?}: {}", name, policy);
    }
}

fn packet(dpid: u64, in_port: u32, src: EthAddr, dst: EthAddr) -> FieldSet {
    FieldSet::new()
        .with(oxm::switch_id(dpid))
        .with(oxm::in_port(in_port))
        .with(oxm::eth_src(src))
        .with(oxm::eth_dst(dst))
}

fn main() {
    tracing_subscriber::fmt().init();

    let switch = Arc::new(LearningSwitch::new(
        Arc::new(LineTopology),
        Arc::new(FloodEverything),
        Arc::new(HostsDb::new()),
        Arc::new(LinkTagAllocator::new()),
    ));
    switch.install(&mut PrintingEngine);

    let h1 = EthAddr::new([0x02, 0, 0, 0, 0, 0x01]);
    let h2 = EthAddr::new([0x02, 0, 0, 0, 0, 0x02]);

    // H1 announces itself; H2 is unknown, so the decision is a flood.
    let mut pkt = packet(1, 1, h1, h2);
    println!("h1 -> h2 (unknown): {}", switch.decide(&mut pkt));

    // H2 answers from the far switch; both locations are now learned.
    let mut pkt = packet(3, 5, h2, h1);
    println!("h2 -> h1: {}", switch.decide(&mut pkt));

    // The return direction compiles into a tag-stitched multi-hop route.
    let mut pkt = packet(1, 1, h1, h2);
    println!("h1 -> h2: {}", switch.decide(&mut pkt));
}
