//! The canonical flow record and its pool.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::decoders::Layer;

/// Wire format a flow was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    #[default]
    Unknown,
    NetflowV5,
    NetflowV9,
    Ipfix,
    Sflow5,
}

/// One unified record delivered downstream, whatever the wire format it
/// came from. Pooled: the transport's commit returns it to the
/// [`MessagePool`].
///
/// Addresses are raw network-order bytes (4 for IPv4, 16 for IPv6) so
/// formatters can decide how to render them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlowMessage {
    #[serde(rename = "type")]
    pub flow_type: FlowType,
    pub time_received_ns: u64,
    pub sequence_num: u32,
    /// Effective sampling rate applied to the counters; 1 when unsampled.
    pub sampling_rate: u64,
    pub sampler_address: Vec<u8>,
    pub sampler_hostname: String,
    pub time_flow_start_ns: u64,
    pub time_flow_end_ns: u64,
    pub bytes: u64,
    pub packets: u64,
    pub src_addr: Vec<u8>,
    pub dst_addr: Vec<u8>,
    pub etype: u32,
    pub proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub in_if: u32,
    pub out_if: u32,
    pub tcp_flags: u8,
    pub src_as: u32,
    pub dst_as: u32,
    pub src_country: String,
    pub dst_country: String,
    pub src_as_org: String,
    pub dst_as_org: String,
    pub as_path: Vec<u32>,
    pub lms_target_index: String,
    pub layer_stack: Vec<Layer>,
    /// Wire fields the decoder had no mapping for, keyed by field number.
    /// Formatters surface them when the mapping file names them.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub unknown_fields: BTreeMap<u16, Vec<u8>>,
}

impl FlowMessage {
    /// Clears every field while keeping allocated capacity, so a pooled
    /// message does not re-allocate on its next flow.
    pub fn reset(&mut self) {
        self.flow_type = FlowType::Unknown;
        self.time_received_ns = 0;
        self.sequence_num = 0;
        self.sampling_rate = 0;
        self.sampler_address.clear();
        self.sampler_hostname.clear();
        self.time_flow_start_ns = 0;
        self.time_flow_end_ns = 0;
        self.bytes = 0;
        self.packets = 0;
        self.src_addr.clear();
        self.dst_addr.clear();
        self.etype = 0;
        self.proto = 0;
        self.src_port = 0;
        self.dst_port = 0;
        self.in_if = 0;
        self.out_if = 0;
        self.tcp_flags = 0;
        self.src_as = 0;
        self.dst_as = 0;
        self.src_country.clear();
        self.dst_country.clear();
        self.src_as_org.clear();
        self.dst_as_org.clear();
        self.as_path.clear();
        self.lms_target_index.clear();
        self.layer_stack.clear();
        self.unknown_fields.clear();
    }
}

/// Bounded free-list of flow messages. `get` falls back to a fresh
/// allocation when the pool is empty; `put` drops the message when the pool
/// is full.
pub struct MessagePool {
    slots: Mutex<Vec<Box<FlowMessage>>>,
    cap: usize,
}

impl MessagePool {
    pub fn new(cap: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(cap.min(1024))),
            cap,
        }
    }

    pub fn get(&self) -> Box<FlowMessage> {
        self.slots
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(FlowMessage::default()))
    }

    pub fn put(&self, mut message: Box<FlowMessage>) {
        message.reset();
        let mut slots = self.slots.lock();
        if slots.len() < self.cap {
            slots.push(message);
        }
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self) -> usize {
        self.slots.lock().len()
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_resets_and_reuses() {
        let pool = MessagePool::new(4);
        let mut msg = pool.get();
        msg.bytes = 99;
        msg.src_country.push_str("CA");
        msg.as_path.extend([1, 0, 2]);
        pool.put(msg);

        assert_eq!(pool.pooled(), 1);
        let msg = pool.get();
        assert_eq!(msg.bytes, 0);
        assert!(msg.src_country.is_empty());
        assert!(msg.as_path.is_empty());
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn pool_is_bounded() {
        let pool = MessagePool::new(2);
        pool.put(Box::default());
        pool.put(Box::default());
        pool.put(Box::default());
        assert_eq!(pool.pooled(), 2);
    }
}
