//! Control-plane core of an OpenFlow learning switch.
//!
//! Packet-processing behavior is expressed as composable [`policy::Policy`]
//! trees over typed match fields ([`oxm`]). The [`learning_switch`] handler
//! observes host locations, asks the topology for multi-hop paths, and
//! [`route`] compiles those paths into per-switch match/rewrite segments
//! stitched together by per-link VLAN tags ([`tags`]). Flow installation,
//! wire encoding, and switch connections belong to the execution engine
//! behind the collaborator traits in [`learning_switch`].

pub mod hosts;
pub mod learning_switch;
pub mod oxm;
pub mod packet;
pub mod policy;
pub mod route;
pub mod tags;
