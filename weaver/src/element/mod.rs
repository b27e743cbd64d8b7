//! Property-graph elements: nodes, directed edges, and their properties.
//!
//! Nodes and edges share timestamps and properties through an embedded
//! [`BaseElement`] rather than inheritance; every record carries a creation
//! and a deletion clock and is filtered through the
//! [`OrderOracle`](crate::order::OrderOracle) during traversal.

pub mod edge;
pub mod node;
pub mod property;

use std::io::Cursor;

use bytes::BytesMut;

use crate::codec::Wire;
use crate::error::CResult;
use crate::order::OrderOracle;
use crate::vclock::VectorClock;

use property::Property;

/// Opaque, client-chosen node identifier.
pub type NodeHandle = Vec<u8>;

/// Timestamps and properties common to nodes and edges, embedded by value.
#[derive(Clone, Debug, PartialEq)]
pub struct BaseElement {
    creat_time: VectorClock,
    del_time: VectorClock,
    properties: Vec<Property>,
}

impl BaseElement {
    /// A live element created at `creat`, never deleted.
    pub fn new(creat: VectorClock) -> Self {
        let width = creat.counters.len();
        BaseElement { creat_time: creat, del_time: VectorClock::never(width), properties: Vec::new() }
    }

    pub fn creat_time(&self) -> &VectorClock {
        &self.creat_time
    }

    pub fn del_time(&self) -> &VectorClock {
        &self.del_time
    }

    pub fn update_creat_time(&mut self, clk: VectorClock) {
        self.creat_time = clk;
    }

    pub fn update_del_time(&mut self, clk: VectorClock) {
        self.del_time = clk;
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn set_properties(&mut self, props: Vec<Property>) {
        self.properties = props;
    }

    /// Sets `key` to `value` at time `at`, tombstoning any previous value
    /// of the key that is still live at `at`.
    pub fn set_property(&mut self, key: Vec<u8>, value: Vec<u8>, at: VectorClock) {
        let oracle = OrderOracle::new();
        for p in self.properties.iter_mut() {
            if p.key == key && oracle.visible(&at, &p.creat_time, &p.del_time) {
                p.del_time = at.clone();
            }
        }
        self.properties.push(Property::new(key, value, at));
    }

    /// Lazy pass over the properties visible at `viewer`.
    pub fn visible_props<'a>(
        &'a self,
        viewer: &'a VectorClock,
        oracle: &'a OrderOracle,
    ) -> property::PropIter<'a> {
        property::PropIter::new(self.properties.iter(), viewer, oracle)
    }
}

/// Element fields on the wire: [creat][del][properties].
impl Wire for BaseElement {
    fn wire_size(&self) -> u64 {
        self.creat_time.wire_size() + self.del_time.wire_size() + self.properties.wire_size()
    }

    fn pack(&self, buf: &mut BytesMut) {
        self.creat_time.pack(buf);
        self.del_time.pack(buf);
        self.properties.pack(buf);
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        let creat_time = VectorClock::unpack(cur)?;
        let del_time = VectorClock::unpack(cur)?;
        let properties = Vec::<Property>::unpack(cur)?;
        Ok(BaseElement { creat_time, del_time, properties })
    }
}
