//! Host-location cache.
//!
//! Maps a host's ethernet address to the (switch, port) it was last seen
//! behind. Written on every observed packet, read on every forwarding
//! decision. Records are never aged out in this core.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{trace, warn};

use crate::oxm::EthAddr;
use crate::route::SwitchPort;

/// Concurrent address-to-location map: shared reads, exclusive writes.
#[derive(Debug, Default)]
pub struct HostsDb {
    db: RwLock<HashMap<EthAddr, SwitchPort>>,
}

impl HostsDb {
    pub fn new() -> HostsDb {
        HostsDb::default()
    }

    /// Record that `mac` was seen entering `dpid` at `in_port`, overwriting
    /// any previous location. Broadcast and multicast sources are refused:
    /// they never name a real host.
    pub fn learn(&self, dpid: u64, in_port: u32, mac: EthAddr) {
        if mac.is_broadcast() || mac.is_multicast() {
            warn!(%mac, "broadcast source address detected");
            return;
        }
        trace!(%mac, dpid, in_port, "learned host location");
        let mut db = self.db.write().unwrap_or_else(|e| e.into_inner());
        db.insert(mac, SwitchPort::new(dpid, in_port));
    }

    /// The last learned location of `mac`, if any.
    pub fn query(&self, mac: EthAddr) -> Option<SwitchPort> {
        let db = self.db.read().unwrap_or_else(|e| e.into_inner());
        db.get(&mac).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn mac(last: u8) -> EthAddr {
        EthAddr::new([0x02, 0, 0, 0, 0, last])
    }

    #[test]
    fn query_of_unknown_address_is_empty() {
        let db = HostsDb::new();
        assert_eq!(db.query(mac(1)), None);
    }

    #[test]
    fn learn_then_query() {
        let db = HostsDb::new();
        db.learn(1, 7, mac(1));
        assert_eq!(db.query(mac(1)), Some(SwitchPort::new(1, 7)));
    }

    #[test]
    fn later_learn_overwrites() {
        let db = HostsDb::new();
        db.learn(1, 7, mac(1));
        db.learn(2, 3, mac(1));
        assert_eq!(db.query(mac(1)), Some(SwitchPort::new(2, 3)));
    }

    #[traced_test]
    #[test]
    fn broadcast_learn_is_refused_with_a_warning() {
        let db = HostsDb::new();
        db.learn(1, 7, EthAddr::BROADCAST);
        assert_eq!(db.query(EthAddr::BROADCAST), None);
        assert!(logs_contain("broadcast source address detected"));
    }

    #[traced_test]
    #[test]
    fn multicast_learn_is_refused() {
        let db = HostsDb::new();
        let mcast = EthAddr::new([0x01, 0x00, 0x5e, 0, 0, 1]);
        db.learn(3, 2, mcast);
        assert_eq!(db.query(mcast), None);
    }

    #[test]
    fn concurrent_learns_and_queries() {
        use std::sync::Arc;
        let db = Arc::new(HostsDb::new());
        let writers: Vec<_> = (0..4u8)
            .map(|i| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || db.learn(u64::from(i), 1, mac(i)))
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        for i in 0..4u8 {
            assert_eq!(db.query(mac(i)), Some(SwitchPort::new(u64::from(i), 1)));
        }
    }
}
