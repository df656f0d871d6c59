//! Identifiers shared by the producer and consumer sides of a data exchange.
//!
//! A [`ResultPartitionId`] names one output partition of one producer attempt. Consumers address a
//! slice of it by [`SubpartitionIndex`], hold it in the input slot given by [`ChannelIndex`], and,
//! for partitions produced on another host, reach it through the [`ConnectionId`] of the producer.
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::net::SocketAddr;
use uuid::Uuid;

/// Identifies one execution attempt of a producing task.
///
/// A restarted producer gets a fresh id, so partitions from different attempts never alias.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct ProducerId(Uuid);

impl ProducerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ProducerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ProducerId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl Display for ProducerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a partition within the intermediate result of its producer.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct PartitionSlot(u32);

impl PartitionSlot {
    pub fn new(slot: u32) -> Self {
        Self(slot)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for PartitionSlot {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Display for PartitionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The identity of a produced result partition: which slot, produced by which attempt.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct ResultPartitionId {
    producer: ProducerId,
    slot: PartitionSlot,
}

impl ResultPartitionId {
    pub fn new(producer: ProducerId, slot: PartitionSlot) -> Self {
        Self { producer, slot }
    }

    pub fn producer(&self) -> ProducerId {
        self.producer
    }

    pub fn slot(&self) -> PartitionSlot {
        self.slot
    }
}

impl Display for ResultPartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.slot, self.producer)
    }
}

/// Position of an input channel in the ordered channel list of its gate.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct ChannelIndex(usize);

impl ChannelIndex {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

impl From<usize> for ChannelIndex {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl Display for ChannelIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of the subpartition, i.e. the slice of a result partition meant for one consumer.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct SubpartitionIndex(u32);

impl SubpartitionIndex {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for SubpartitionIndex {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Display for SubpartitionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network-level identity of a remote input channel.
///
/// The producer side tags every response with this id so the connection can route it back to
/// the right channel; unlike [`ChannelIndex`] it is unique across gates.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct InputChannelId(Uuid);

impl InputChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InputChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for InputChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of a producer plus the index of the connection to use for it.
///
/// Several connections to the same host may exist, so the index is part of the key used by the
/// connection manager to share request clients.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct ConnectionId {
    address: SocketAddr,
    connection_index: u32,
}

impl ConnectionId {
    pub fn new(address: SocketAddr, connection_index: u32) -> Self {
        Self {
            address,
            connection_index,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn connection_index(&self) -> u32 {
        self.connection_index
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.address, self.connection_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_partition_id_display() {
        let producer = ProducerId::from(Uuid::nil());
        let id = ResultPartitionId::new(producer, PartitionSlot::new(3));
        assert_eq!(id.to_string(), "3@00000000-0000-0000-0000-000000000000");
        assert_eq!(id.producer(), producer);
        assert_eq!(id.slot().as_u32(), 3);
    }

    #[test]
    fn producer_ids_are_unique() {
        assert_ne!(ProducerId::new(), ProducerId::new());
        assert_ne!(InputChannelId::new(), InputChannelId::new());
    }

    #[test]
    fn connection_id_serde() {
        let id = ConnectionId::new(SocketAddr::from(([10, 0, 0, 7], 6121)), 2);
        let json = serde_json::to_string(&id).unwrap();
        let back: ConnectionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
        assert_eq!(id.to_string(), "10.0.0.7:6121 [2]");
    }
}
