//! The transport-level packet envelope.
//!
//! A [`Packet`] is what channels move around: an identifier, a property map
//! that layered protocols (compression, encryption) use to record what they
//! did to the payload, and the payload bytes themselves.

use bytes::Bytes;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Tag naming a packet property. Values are chosen by the layer that owns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyTag(pub u16);

/// Open per-packet property map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketProperties {
    entries: BTreeMap<PropertyTag, Bytes>,
}

impl PacketProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: PropertyTag, value: impl Into<Bytes>) -> Option<Bytes> {
        self.entries.insert(tag, value.into())
    }

    pub fn get(&self, tag: PropertyTag) -> Option<&Bytes> {
        self.entries.get(&tag)
    }

    pub fn remove(&mut self, tag: PropertyTag) -> Option<Bytes> {
        self.entries.remove(&tag)
    }

    pub fn contains(&self, tag: PropertyTag) -> bool {
        self.entries.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PropertyTag, &Bytes)> {
        self.entries.iter()
    }
}

/// A unit of data moved by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: Uuid,
    pub properties: PacketProperties,
    pub data: Bytes,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            properties: PacketProperties::new(),
            data: data.into(),
        }
    }

    /// Build the answer to this packet: same properties, new id, new data.
    pub fn answer(&self, data: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            properties: self.properties.clone(),
            data: data.into(),
        }
    }

    pub fn with_property(mut self, tag: PropertyTag, value: impl Into<Bytes>) -> Self {
        self.properties.insert(tag, value);
        self
    }
}
