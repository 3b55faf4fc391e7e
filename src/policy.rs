//! Composable packet-processing policies.
//!
//! A [`Policy`] is an immutable value tree; the execution engine compiles it
//! into flow-table state. Composition builds new trees and never mutates
//! operands: `>>` chains sequentially, `+`/`|` run both sides on the same
//! packet (two flow entries, not alternatives).

use std::fmt;
use std::ops::{Add, BitAnd, BitOr, Shr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::oxm::{self, Field};
use crate::packet::Packet;

/// Flow-entry lifetime bounds, as data for the execution engine.
///
/// `Duration::MAX` means unconstrained.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FlowSettings {
    pub idle_timeout: Duration,
    pub hard_timeout: Duration,
}

impl Default for FlowSettings {
    fn default() -> FlowSettings {
        FlowSettings {
            idle_timeout: Duration::MAX,
            hard_timeout: Duration::MAX,
        }
    }
}

/// Commutative merge: component-wise minimum, then idle clamped so the
/// entry can never outlive its hard cutoff.
impl BitAnd for FlowSettings {
    type Output = FlowSettings;

    fn bitand(self, rhs: FlowSettings) -> FlowSettings {
        let hard_timeout = self.hard_timeout.min(rhs.hard_timeout);
        let idle_timeout = self.idle_timeout.min(rhs.idle_timeout).min(hard_timeout);
        FlowSettings {
            idle_timeout,
            hard_timeout,
        }
    }
}

impl fmt::Display for FlowSettings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn secs(f: &mut fmt::Formatter, d: Duration) -> fmt::Result {
            if d == Duration::MAX {
                write!(f, "inf")
            } else {
                write!(f, "{} sec.", d.as_secs())
            }
        }
        write!(f, "{{ idle_timeout = ")?;
        secs(f, self.idle_timeout)?;
        write!(f, " hard_timeout = ")?;
        secs(f, self.hard_timeout)?;
        write!(f, " }}")
    }
}

/// A data-dependent policy: an opaque packet-inspecting function with a
/// process-wide unique identity.
///
/// Equality and hashing use the id only; the captured behavior is never
/// compared structurally.
#[derive(Clone)]
pub struct PacketHandler {
    id: u64,
    f: Arc<dyn Fn(&mut dyn Packet) -> Policy + Send + Sync>,
}

static HANDLER_ID: AtomicU64 = AtomicU64::new(0);

impl PacketHandler {
    fn new<F>(f: F) -> PacketHandler
    where
        F: Fn(&mut dyn Packet) -> Policy + Send + Sync + 'static,
    {
        PacketHandler {
            id: HANDLER_ID.fetch_add(1, Ordering::Relaxed),
            f: Arc::new(f),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run the captured function against a packet.
    pub fn invoke(&self, pkt: &mut dyn Packet) -> Policy {
        (self.f)(pkt)
    }
}

impl PartialEq for PacketHandler {
    fn eq(&self, other: &PacketHandler) -> bool {
        self.id == other.id
    }
}

impl Eq for PacketHandler {}

impl fmt::Debug for PacketHandler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PacketHandler")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// What to do with a packet.
#[derive(Clone, Debug)]
pub enum Policy {
    /// Terminal: forward nowhere.
    Stop,
    /// Pass the packet through unchanged.
    Id,
    /// Continue only if the packet matches the field.
    Filter(Field),
    /// Rewrite the field to the carried value.
    Modify(Field),
    /// Lifetime bounds for the flow entries this tree compiles into.
    Flow(FlowSettings),
    /// Defer to a packet-inspecting function.
    Handler(PacketHandler),
    /// Apply the left policy, then the right.
    Seq(Box<Policy>, Box<Policy>),
    /// Apply both sides independently to the same packet.
    Par(Box<Policy>, Box<Policy>),
}

impl PartialEq for Policy {
    fn eq(&self, other: &Policy) -> bool {
        use Policy::*;
        match (self, other) {
            (Stop, Stop) | (Id, Id) => true,
            (Filter(a), Filter(b)) | (Modify(a), Modify(b)) => a == b,
            (Flow(a), Flow(b)) => a == b,
            (Handler(a), Handler(b)) => a == b,
            (Seq(a1, a2), Seq(b1, b2)) => a1 == b1 && a2 == b2,
            // Two-operand symmetry only; associative regrouping of longer
            // parallel chains does not compare equal.
            (Par(a1, a2), Par(b1, b2)) => {
                (a1 == b1 && a2 == b2) || (a1 == b2 && a2 == b1)
            }
            _ => false,
        }
    }
}

impl Eq for Policy {}

/// Drop the packet.
pub fn stop() -> Policy {
    Policy::Stop
}

/// Pass the packet through unchanged.
pub fn id() -> Policy {
    Policy::Id
}

/// Continue only on packets matching `field`.
pub fn filter(field: Field) -> Policy {
    Policy::Filter(field)
}

/// Rewrite `field` on the packet.
pub fn modify(field: Field) -> Policy {
    Policy::Modify(field)
}

/// Forward out of `port`: shorthand for rewriting the egress-port field.
pub fn fwd(port: u32) -> Policy {
    modify(oxm::out_port(port))
}

/// Constrain only the idle timeout.
pub fn idle_timeout(time: Duration) -> Policy {
    Policy::Flow(FlowSettings {
        idle_timeout: time,
        ..FlowSettings::default()
    })
}

/// Constrain the total lifetime; idle is set alongside since a flow cannot
/// outlive its hard cutoff.
pub fn hard_timeout(time: Duration) -> Policy {
    Policy::Flow(FlowSettings {
        idle_timeout: time,
        hard_timeout: time,
    })
}

/// Wrap a packet-inspecting function as a data-dependent policy.
///
/// Safe to call concurrently; each call gets a fresh identity.
pub fn handler<F>(f: F) -> Policy
where
    F: Fn(&mut dyn Packet) -> Policy + Send + Sync + 'static,
{
    Policy::Handler(PacketHandler::new(f))
}

impl Shr for Policy {
    type Output = Policy;

    fn shr(self, rhs: Policy) -> Policy {
        Policy::Seq(Box::new(self), Box::new(rhs))
    }
}

impl Add for Policy {
    type Output = Policy;

    fn add(self, rhs: Policy) -> Policy {
        Policy::Par(Box::new(self), Box::new(rhs))
    }
}

// Lower-precedence spelling of `+`, so `a >> b | c >> d` groups the
// sequential chains first.
impl BitOr for Policy {
    type Output = Policy;

    fn bitor(self, rhs: Policy) -> Policy {
        self + rhs
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Policy::Stop => write!(f, "stop"),
            Policy::Id => write!(f, "id"),
            Policy::Filter(field) => write!(f, "filter( {} )", field),
            Policy::Modify(field) => write!(f, "modify( {} )", field),
            Policy::Flow(settings) => write!(f, "{}", settings),
            Policy::Handler(_) => write!(f, "function"),
            Policy::Seq(a, b) => write!(f, "{} >> {}", a, b),
            Policy::Par(a, b) => write!(f, "{} + {}", a, b),
        }
    }
}
