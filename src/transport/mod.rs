//! Partitioned, durable publish/subscribe transport.
//!
//! The broker contract follows a Kafka-style log: topics are split into
//! partitions, a record's key picks its partition (so same-key records keep
//! their order), and consumer groups track committed offsets per partition.
//! A record is redelivered to a group until that group commits past it.

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryBroker;

#[cfg(feature = "kafka")]
pub use kafka::{KafkaBroker, KafkaBrokerConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

/// Where a sent record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl InboundRecord {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Append a record; resolves once the broker has acknowledged it.
    async fn send(&self, record: OutboundRecord) -> Result<DeliveryReceipt>;

    /// Join `group` and read `topics` from the group's committed offsets
    /// (earliest when nothing has been committed).
    async fn subscribe(&self, group: &str, topics: &[&str]) -> Result<Box<dyn BrokerSubscription>>;
}

#[async_trait]
pub trait BrokerSubscription: Send {
    /// Next record, or `None` if nothing arrived within `timeout`.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundRecord>>;

    /// Mark `record` and everything before it in its partition as processed.
    async fn commit(&mut self, record: &InboundRecord) -> Result<()>;

    /// Rewind the record's partition so the next poll returns it again.
    async fn seek(&mut self, record: &InboundRecord) -> Result<()>;
}

/// Kafka's default key hash (murmur2, seed `0x9747b28c`).
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = SEED ^ data.len() as u32;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();

    for chunk in chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Partition for a key, matching Kafka's default partitioner.
pub fn partition_for_key(key: &str, partitions: usize) -> i32 {
    if partitions == 0 {
        return 0;
    }
    ((murmur2(key.as_bytes()) & 0x7fff_ffff) as usize % partitions) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn murmur2_matches_kafka_reference_values() {
        assert_eq!(murmur2(b"21") as i32, -973_932_308);
        assert_eq!(murmur2(b"foobar") as i32, -790_332_482);
        assert_eq!(murmur2(b"a-little-bit-long-string") as i32, -985_981_536);
    }

    #[test]
    fn partition_is_stable_and_in_range() {
        for key in ["sess-1", "ws-2", "task-3", ""] {
            let p = partition_for_key(key, 6);
            assert!((0..6).contains(&p));
            assert_eq!(p, partition_for_key(key, 6));
        }
        assert_eq!(partition_for_key("anything", 0), 0);
    }
}
