//! Typed match-field model.
//!
//! Every matchable or settable packet attribute is a distinct marker type
//! carrying an OXM namespace, a field code, a bit width, and a value type.
//! Policies and packet accessors work with the type-erased [`Field`], which
//! keeps the value as raw bits plus a per-type print hook.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};

/// OXM namespace (match class) identifiers.
pub mod ns {
    /// Standard OpenFlow basic match fields.
    pub const OPENFLOW_BASIC: u16 = 0x8000;
    /// Synthetic fields that are never wire-encoded; they exist only for
    /// policy composition (switch identity, egress port).
    pub const NON_OPENFLOW: u16 = 0xffff;
}

/// A 48-bit ethernet address.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct EthAddr([u8; 6]);

impl EthAddr {
    pub const BROADCAST: EthAddr = EthAddr([0xff; 6]);

    pub fn new(octets: [u8; 6]) -> EthAddr {
        EthAddr(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// ff:ff:ff:ff:ff:ff.
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }

    /// Group bit of the first octet; true for broadcast as well.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl From<u64> for EthAddr {
    fn from(addr: u64) -> EthAddr {
        let mut octets = [0; 6];
        for (i, b) in octets.iter_mut().enumerate() {
            *b = (addr >> (8 * (5 - i))) as u8;
        }
        EthAddr(octets)
    }
}

impl From<EthAddr> for u64 {
    fn from(addr: EthAddr) -> u64 {
        addr.0.iter().fold(0, |acc, &b| (acc << 8) | u64::from(b))
    }
}

impl fmt::Display for EthAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Conversion between a field's typed value and its raw bit representation.
pub trait FieldValue: Copy + fmt::Display {
    fn to_bits(self) -> u128;
    fn from_bits(bits: u128) -> Self;
}

macro_rules! int_field_value {
    ($($t:ty),*) => {$(
        impl FieldValue for $t {
            fn to_bits(self) -> u128 {
                self as u128
            }
            fn from_bits(bits: u128) -> $t {
                bits as $t
            }
        }
    )*};
}

int_field_value!(u8, u16, u32, u64);

impl FieldValue for EthAddr {
    fn to_bits(self) -> u128 {
        u128::from(u64::from(self))
    }
    fn from_bits(bits: u128) -> EthAddr {
        EthAddr::from(bits as u64)
    }
}

impl FieldValue for Ipv4Addr {
    fn to_bits(self) -> u128 {
        u128::from(u32::from(self))
    }
    fn from_bits(bits: u128) -> Ipv4Addr {
        Ipv4Addr::from(bits as u32)
    }
}

impl FieldValue for Ipv6Addr {
    fn to_bits(self) -> u128 {
        u128::from(self)
    }
    fn from_bits(bits: u128) -> Ipv6Addr {
        Ipv6Addr::from(bits)
    }
}

/// One match-field definition: namespace, code, width, and value type.
///
/// Implementors are uninhabited marker types; a concrete value of the field
/// is always a [`Field`].
pub trait FieldType {
    const NAMESPACE: u16;
    const CODE: u8;
    const BITS: u32;
    const MASKABLE: bool;
    const NAME: &'static str;

    type Value: FieldValue;

    /// Render a raw value of this field; overridden where a symbolic
    /// rendering exists (protocol and ethertype numbers).
    fn fmt_bits(bits: u128, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", Self::Value::from_bits(bits))
    }
}

/// A type-erased field value: what a [`crate::policy::Policy`] matches on or
/// rewrites to.
///
/// Equality, ordering, and hashing cover (namespace, code, value, mask)
/// only; the print hook never participates.
#[derive(Copy, Clone)]
pub struct Field {
    ns: u16,
    code: u8,
    bits: u32,
    name: &'static str,
    value: u128,
    mask: Option<u128>,
    print: fn(u128, &mut fmt::Formatter) -> fmt::Result,
}

impl Field {
    /// Build a field of type `F` carrying `value`. Never fails; malformed
    /// combinations are unrepresentable by typing.
    pub fn of<F: FieldType>(value: F::Value) -> Field {
        Field {
            ns: F::NAMESPACE,
            code: F::CODE,
            bits: F::BITS,
            name: F::NAME,
            value: value.to_bits(),
            mask: None,
            print: F::fmt_bits,
        }
    }

    /// Build a masked field of type `F`. Only meaningful for maskable
    /// fields; the type table marks which those are.
    pub fn masked<F: FieldType>(value: F::Value, mask: F::Value) -> Field {
        debug_assert!(F::MASKABLE, "{} does not take a mask", F::NAME);
        Field {
            mask: Some(mask.to_bits()),
            ..Field::of::<F>(value)
        }
    }

    pub fn namespace(&self) -> u16 {
        self.ns
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn width(&self) -> u32 {
        self.bits
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn value_bits(&self) -> u128 {
        self.value
    }

    pub fn mask_bits(&self) -> Option<u128> {
        self.mask
    }

    /// True if this field is an `F`.
    pub fn is<F: FieldType>(&self) -> bool {
        self.ns == F::NAMESPACE && self.code == F::CODE
    }

    /// The typed value, if this field is an `F`.
    pub fn value<F: FieldType>(&self) -> Option<F::Value> {
        self.is::<F>().then(|| F::Value::from_bits(self.value))
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Field) -> bool {
        (self.ns, self.code, self.value, self.mask)
            == (other.ns, other.code, other.value, other.mask)
    }
}

impl Eq for Field {}

impl PartialOrd for Field {
    fn partial_cmp(&self, other: &Field) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Field {
    fn cmp(&self, other: &Field) -> Ordering {
        (self.ns, self.code, self.value, self.mask).cmp(&(
            other.ns,
            other.code,
            other.value,
            other.mask,
        ))
    }
}

impl Hash for Field {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.ns, self.code, self.value, self.mask).hash(state);
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} = ", self.name)?;
        (self.print)(self.value, f)?;
        if let Some(mask) = self.mask {
            write!(f, " & {:#x}", mask)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Field({})", self)
    }
}

fn print_eth_type(bits: u128, f: &mut fmt::Formatter) -> fmt::Result {
    match bits {
        0x0800 => write!(f, "ipv4"),
        0x0806 => write!(f, "arp"),
        0x8100 => write!(f, "vlan"),
        0x86dd => write!(f, "ipv6"),
        other => write!(f, "{:#06x}", other),
    }
}

fn print_ip_proto(bits: u128, f: &mut fmt::Formatter) -> fmt::Result {
    match bits {
        1 => write!(f, "icmp"),
        6 => write!(f, "tcp"),
        17 => write!(f, "udp"),
        other => write!(f, "{}", other),
    }
}

fn print_arp_op(bits: u128, f: &mut fmt::Formatter) -> fmt::Result {
    match bits {
        1 => write!(f, "request"),
        2 => write!(f, "reply"),
        other => write!(f, "{}", other),
    }
}

macro_rules! define_field {
    ($(#[$attr:meta])*
     $marker:ident, $ctor:ident, $ns:expr, $code:expr, $bits:expr,
     $value:ty, maskable: $maskable:expr $(, print: $print:expr)?) => {
        $(#[$attr])*
        pub enum $marker {}

        impl FieldType for $marker {
            const NAMESPACE: u16 = $ns;
            const CODE: u8 = $code;
            const BITS: u32 = $bits;
            const MASKABLE: bool = $maskable;
            const NAME: &'static str = stringify!($ctor);

            type Value = $value;

            $(fn fmt_bits(bits: u128, f: &mut fmt::Formatter) -> fmt::Result {
                $print(bits, f)
            })?
        }

        $(#[$attr])*
        pub fn $ctor(value: $value) -> Field {
            Field::of::<$marker>(value)
        }
    };
}

// Synthetic fields: carried as matches for policy composition only.
define_field!(
    /// Identity of the switch a policy segment applies on.
    SwitchId, switch_id, ns::NON_OPENFLOW, 0, 64, u64, maskable: false
);
define_field!(
    /// Egress port; the target of `fwd`.
    OutPort, out_port, ns::NON_OPENFLOW, 1, 32, u32, maskable: false
);

// OpenFlow basic match fields, standard OXM codes.
define_field!(
    /// Ingress port.
    InPort, in_port, ns::OPENFLOW_BASIC, 0, 32, u32, maskable: false
);
define_field!(EthDst, eth_dst, ns::OPENFLOW_BASIC, 3, 48, EthAddr, maskable: true);
define_field!(EthSrc, eth_src, ns::OPENFLOW_BASIC, 4, 48, EthAddr, maskable: true);
define_field!(
    EthType, eth_type, ns::OPENFLOW_BASIC, 5, 16, u16, maskable: false,
    print: print_eth_type
);
define_field!(
    /// VLAN tag; reused here as the stitching token disambiguating
    /// concurrent multi-hop routes on a shared link.
    VlanVid, vlan_vid, ns::OPENFLOW_BASIC, 6, 16, u16, maskable: false
);
define_field!(
    IpProto, ip_proto, ns::OPENFLOW_BASIC, 10, 8, u8, maskable: false,
    print: print_ip_proto
);
define_field!(Ipv4Src, ipv4_src, ns::OPENFLOW_BASIC, 11, 32, Ipv4Addr, maskable: true);
define_field!(Ipv4Dst, ipv4_dst, ns::OPENFLOW_BASIC, 12, 32, Ipv4Addr, maskable: true);
define_field!(TcpSrc, tcp_src, ns::OPENFLOW_BASIC, 13, 16, u16, maskable: false);
define_field!(TcpDst, tcp_dst, ns::OPENFLOW_BASIC, 14, 16, u16, maskable: false);
define_field!(UdpSrc, udp_src, ns::OPENFLOW_BASIC, 15, 16, u16, maskable: false);
define_field!(UdpDst, udp_dst, ns::OPENFLOW_BASIC, 16, 16, u16, maskable: false);
define_field!(IcmpType, icmp_type, ns::OPENFLOW_BASIC, 19, 8, u8, maskable: false);
define_field!(IcmpCode, icmp_code, ns::OPENFLOW_BASIC, 20, 8, u8, maskable: false);
define_field!(
    ArpOp, arp_op, ns::OPENFLOW_BASIC, 21, 16, u16, maskable: false,
    print: print_arp_op
);
define_field!(ArpSpa, arp_spa, ns::OPENFLOW_BASIC, 22, 32, Ipv4Addr, maskable: true);
define_field!(ArpTpa, arp_tpa, ns::OPENFLOW_BASIC, 23, 32, Ipv4Addr, maskable: true);
define_field!(Ipv6Src, ipv6_src, ns::OPENFLOW_BASIC, 26, 128, Ipv6Addr, maskable: true);
define_field!(Ipv6Dst, ipv6_dst, ns::OPENFLOW_BASIC, 27, 128, Ipv6Addr, maskable: true);

/// Masked constructor for ethernet source.
pub fn eth_src_masked(value: EthAddr, mask: EthAddr) -> Field {
    Field::masked::<EthSrc>(value, mask)
}

/// Masked constructor for ethernet destination.
pub fn eth_dst_masked(value: EthAddr, mask: EthAddr) -> Field {
    Field::masked::<EthDst>(value, mask)
}

/// Masked constructor for IPv4 source.
pub fn ipv4_src_masked(value: Ipv4Addr, mask: Ipv4Addr) -> Field {
    Field::masked::<Ipv4Src>(value, mask)
}

/// Masked constructor for IPv4 destination.
pub fn ipv4_dst_masked(value: Ipv4Addr, mask: Ipv4Addr) -> Field {
    Field::masked::<Ipv4Dst>(value, mask)
}
