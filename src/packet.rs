//! Packet accessor boundary.
//!
//! The decision handler never sees raw packet bytes; it reads typed fields
//! through this interface. `load` is a plain read; `watch` additionally
//! records the field as an input the produced decision depends on, so the
//! execution engine knows when a cached decision must be recomputed.

use std::collections::{BTreeMap, BTreeSet};

use crate::oxm::{Field, FieldType, FieldValue};

/// Object-safe packet reader handed to data-dependent policies.
///
/// Fields are addressed by (namespace, code); the typed wrappers live on
/// [`PacketExt`]. Absent fields read as `None` (e.g. `tcp_src` on an ARP
/// packet).
pub trait Packet {
    /// Read a field's raw bits.
    fn load_bits(&self, ns: u16, code: u8) -> Option<u128>;

    /// Read a field's raw bits and record it as a dependency of the
    /// decision being computed.
    fn watch_bits(&mut self, ns: u16, code: u8) -> Option<u128>;
}

/// Typed convenience layer over [`Packet`].
pub trait PacketExt: Packet {
    fn load<F: FieldType>(&self) -> Option<F::Value> {
        self.load_bits(F::NAMESPACE, F::CODE).map(F::Value::from_bits)
    }

    fn watch<F: FieldType>(&mut self) -> Option<F::Value> {
        self.watch_bits(F::NAMESPACE, F::CODE).map(F::Value::from_bits)
    }
}

impl<P: Packet + ?Sized> PacketExt for P {}

/// An in-memory packet: a plain set of field values.
///
/// Used by tests and the demo binary in place of a live packet, and as the
/// model of the execution engine's dependency tracking (the watched set is
/// observable).
#[derive(Clone, Debug, Default)]
pub struct FieldSet {
    fields: BTreeMap<(u16, u8), u128>,
    watched: BTreeSet<(u16, u8)>,
}

impl FieldSet {
    pub fn new() -> FieldSet {
        FieldSet::default()
    }

    /// Set or overwrite one field.
    pub fn modify(&mut self, field: Field) {
        self.fields
            .insert((field.namespace(), field.code()), field.value_bits());
    }

    /// Builder-style [`FieldSet::modify`].
    pub fn with(mut self, field: Field) -> FieldSet {
        self.modify(field);
        self
    }

    /// The (namespace, code) pairs read through `watch` so far.
    pub fn watched(&self) -> impl Iterator<Item = (u16, u8)> + '_ {
        self.watched.iter().copied()
    }
}

impl Packet for FieldSet {
    fn load_bits(&self, ns: u16, code: u8) -> Option<u128> {
        self.fields.get(&(ns, code)).copied()
    }

    fn watch_bits(&mut self, ns: u16, code: u8) -> Option<u128> {
        self.watched.insert((ns, code));
        self.load_bits(ns, code)
    }
}
