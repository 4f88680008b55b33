//! Normalisation of decoded packets into canonical flow messages.
//!
//! The four wire formats meet here: [`produce`](FlowProducer::produce)
//! pattern-matches the [`IntermediateMessage`] variants in one place and
//! emits [`FlowMessage`]s with protocol-independent semantics — counters
//! scaled by the effective sampling rate, timestamps anchored to the
//! reception time, addresses as raw bytes. The raw producer skips all of
//! that and wraps the decoded packet for debugging outputs.

pub mod message;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::decoders::{uptime_to_ns, FlowRecord, IntermediateMessage, Layer};
use crate::enrich::Enricher;
use crate::producer::message::{FlowMessage, FlowType, MessagePool};
use crate::sampling::SamplingRegistry;
use crate::templates::ExporterKey;

/// Constant tag attached to every canonical flow.
pub const LMS_TARGET_INDEX: &str = "flowline.local";

/// Per-datagram context handed to the producer by the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct ProduceArgs {
    /// UDP source of the datagram.
    pub src: SocketAddr,
    /// Reception timestamp, nanoseconds since epoch.
    pub time_received_ns: u64,
}

#[derive(Debug, Error)]
pub enum ProduceError {
    #[error("raw producer serialisation failed: {0}")]
    Raw(#[from] serde_json::Error),
}

/// Decoded packet wrapped unprocessed, keeping the original structure.
/// Useful for debugging (e.g. inspecting NetFlow Options Templates).
#[derive(Debug, Clone, Serialize)]
pub struct RawMessage {
    #[serde(rename = "type")]
    pub type_name: &'static str,
    pub message: IntermediateMessage,
    pub src: SocketAddr,
    pub time_received_ns: u64,
}

/// What a producer hands to the formatter.
#[derive(Debug, Clone)]
pub enum ProducerMessage {
    Flow(Box<FlowMessage>),
    Raw(RawMessage),
}

/// Turns decoded packets into downstream messages.
pub trait FlowProducer: Send + Sync {
    fn produce(
        &self,
        msg: IntermediateMessage,
        args: &ProduceArgs,
    ) -> Result<Vec<ProducerMessage>, ProduceError>;

    /// Called after the transport accepted the batch; pooled resources are
    /// returned here.
    fn commit(&self, batch: Vec<ProducerMessage>);

    fn close(&self) {}
}

/// The sampling producer: normalises, scales and enriches.
pub struct SampleProducer {
    pool: MessagePool,
    sampling: Arc<SamplingRegistry>,
    enricher: Arc<Enricher>,
}

impl SampleProducer {
    pub fn new(sampling: Arc<SamplingRegistry>, enricher: Arc<Enricher>) -> Self {
        Self {
            pool: MessagePool::default(),
            sampling,
            enricher,
        }
    }

    fn base_message(
        &self,
        flow_type: FlowType,
        sampler_addr: IpAddr,
        args: &ProduceArgs,
    ) -> Box<FlowMessage> {
        let mut msg = self.pool.get();
        msg.flow_type = flow_type;
        msg.time_received_ns = args.time_received_ns;
        msg.sampler_address = ip_bytes(sampler_addr);
        msg.lms_target_index.push_str(LMS_TARGET_INDEX);
        msg
    }
}

impl FlowProducer for SampleProducer {
    fn produce(
        &self,
        msg: IntermediateMessage,
        args: &ProduceArgs,
    ) -> Result<Vec<ProducerMessage>, ProduceError> {
        let tr = args.time_received_ns;
        let mut out = Vec::new();

        match msg {
            IntermediateMessage::V5(packet) => {
                let header_rate = packet.header.sampling_rate() as u64;
                for record in &packet.records {
                    let rate = header_rate.max(1);
                    let mut flow =
                        self.base_message(FlowType::NetflowV5, args.src.ip(), args);
                    flow.sequence_num = packet.header.flow_sequence;
                    flow.sampling_rate = rate;
                    flow.bytes = u64::from(record.d_octets).saturating_mul(rate);
                    flow.packets = u64::from(record.d_pkts).saturating_mul(rate);
                    flow.src_addr = record.src_addr.octets().to_vec();
                    flow.dst_addr = record.dst_addr.octets().to_vec();
                    flow.etype = 0x0800;
                    flow.proto = record.protocol_number;
                    flow.src_port = record.src_port;
                    flow.dst_port = record.dst_port;
                    flow.in_if = u32::from(record.input);
                    flow.out_if = u32::from(record.output);
                    flow.tcp_flags = record.tcp_flags;
                    flow.src_as = u32::from(record.src_as);
                    flow.dst_as = u32::from(record.dst_as);
                    flow.time_flow_start_ns =
                        uptime_to_ns(tr, packet.header.sys_uptime, record.first);
                    flow.time_flow_end_ns =
                        uptime_to_ns(tr, packet.header.sys_uptime, record.last);
                    synthesise_layers(&mut flow);
                    self.enricher.enrich(&mut flow);
                    out.push(ProducerMessage::Flow(flow));
                }
            }
            IntermediateMessage::V9(packet) => {
                let exporter = ExporterKey::new(args.src.ip(), packet.header.source_id);
                for record in &packet.records {
                    let mut flow =
                        self.base_message(FlowType::NetflowV9, args.src.ip(), args);
                    flow.sequence_num = packet.header.sequence_number;
                    self.fill_from_record(&mut flow, record, &exporter);
                    flow.time_flow_start_ns = record.flow_start_ns.unwrap_or_else(|| {
                        match record.first_uptime_ms {
                            Some(ms) => uptime_to_ns(tr, packet.header.sys_uptime, ms),
                            None => tr,
                        }
                    });
                    flow.time_flow_end_ns = record.flow_end_ns.unwrap_or_else(|| {
                        match record.last_uptime_ms {
                            Some(ms) => uptime_to_ns(tr, packet.header.sys_uptime, ms),
                            None => tr,
                        }
                    });
                    self.enricher.enrich(&mut flow);
                    out.push(ProducerMessage::Flow(flow));
                }
            }
            IntermediateMessage::IPFix(packet) => {
                let exporter =
                    ExporterKey::new(args.src.ip(), packet.header.observation_domain_id);
                for record in &packet.records {
                    let mut flow = self.base_message(FlowType::Ipfix, args.src.ip(), args);
                    flow.sequence_num = packet.header.sequence_number;
                    self.fill_from_record(&mut flow, record, &exporter);
                    // IPFIX has no sysUptime anchor; absolute timestamp
                    // fields or the reception time.
                    flow.time_flow_start_ns = record.flow_start_ns.unwrap_or(tr);
                    flow.time_flow_end_ns = record.flow_end_ns.unwrap_or(tr);
                    self.enricher.enrich(&mut flow);
                    out.push(ProducerMessage::Flow(flow));
                }
            }
            IntermediateMessage::SFlow(datagram) => {
                let exporter = ExporterKey::legacy(datagram.agent_addr);
                for record in &datagram.records {
                    let mut flow =
                        self.base_message(FlowType::Sflow5, datagram.agent_addr, args);
                    flow.sequence_num = datagram.sequence_number;
                    self.fill_from_record(&mut flow, record, &exporter);
                    flow.time_flow_start_ns = tr;
                    flow.time_flow_end_ns = tr;
                    self.enricher.enrich(&mut flow);
                    out.push(ProducerMessage::Flow(flow));
                }
            }
        }

        Ok(out)
    }

    fn commit(&self, batch: Vec<ProducerMessage>) {
        for msg in batch {
            if let ProducerMessage::Flow(flow) = msg {
                self.pool.put(flow);
            }
        }
    }
}

impl SampleProducer {
    /// Protocol-independent part of normalisation, shared by the three
    /// record-bearing formats.
    fn fill_from_record(
        &self,
        flow: &mut FlowMessage,
        record: &FlowRecord,
        exporter: &ExporterKey,
    ) {
        let rate = if record.sampling_rate > 0 {
            u64::from(record.sampling_rate)
        } else {
            u64::from(self.sampling.lookup(exporter, record.sampler_id))
        };
        let rate = rate.max(1);

        flow.sampling_rate = rate;
        flow.bytes = record.bytes.saturating_mul(rate);
        flow.packets = record.packets.saturating_mul(rate);
        flow.src_addr = record.src_addr.map(ip_bytes).unwrap_or_default();
        flow.dst_addr = record.dst_addr.map(ip_bytes).unwrap_or_default();
        flow.etype = match record.src_addr.or(record.dst_addr) {
            Some(IpAddr::V4(_)) => 0x0800,
            Some(IpAddr::V6(_)) => 0x86DD,
            None => 0,
        };
        flow.proto = record.proto;
        flow.src_port = record.src_port;
        flow.dst_port = record.dst_port;
        flow.in_if = record.input_interface;
        flow.out_if = record.output_interface;
        flow.tcp_flags = record.tcp_flags;
        flow.src_as = record.src_as;
        flow.dst_as = record.dst_as;
        flow.layer_stack.extend_from_slice(&record.layer_stack);
        for unknown in &record.unknown_fields {
            flow.unknown_fields
                .insert(unknown.field_type, unknown.value.clone());
        }
        synthesise_layers(flow);
    }
}

/// The raw producer: no normalisation, no enrichment, no pooling.
pub struct RawProducer;

impl FlowProducer for RawProducer {
    fn produce(
        &self,
        msg: IntermediateMessage,
        args: &ProduceArgs,
    ) -> Result<Vec<ProducerMessage>, ProduceError> {
        Ok(vec![ProducerMessage::Raw(RawMessage {
            type_name: msg.type_name(),
            message: msg,
            src: args.src,
            time_received_ns: args.time_received_ns,
        })])
    }

    fn commit(&self, _batch: Vec<ProducerMessage>) {}
}

fn ip_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.octets().to_vec(),
            None => v6.octets().to_vec(),
        },
    }
}

/// Records without a sampled packet walk still get a layer stack derived
/// from the address family and protocol.
fn synthesise_layers(flow: &mut FlowMessage) {
    if !flow.layer_stack.is_empty() {
        return;
    }
    match flow.etype {
        0x0800 => flow.layer_stack.push(Layer::IPv4),
        0x86DD => flow.layer_stack.push(Layer::IPv6),
        _ => return,
    }
    match flow.proto {
        6 => flow.layer_stack.push(Layer::TCP),
        17 => flow.layer_stack.push(Layer::UDP),
        1 => flow.layer_stack.push(Layer::ICMP),
        58 => flow.layer_stack.push(Layer::ICMPv6),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::v9::{V9Header, V9Packet};
    use crate::enrich::dns::DnsCache;
    use crate::enrich::geoip::GeoIp;
    use std::net::Ipv4Addr;

    fn producer(sampling: Arc<SamplingRegistry>) -> SampleProducer {
        let enricher = Arc::new(Enricher::new(GeoIp::empty(), DnsCache::disconnected()));
        SampleProducer::new(sampling, enricher)
    }

    fn args() -> ProduceArgs {
        ProduceArgs {
            src: "10.0.0.1:2055".parse().unwrap(),
            time_received_ns: 1_700_000_000_000_000_000,
        }
    }

    fn v9_message(record: FlowRecord) -> IntermediateMessage {
        IntermediateMessage::V9(V9Packet {
            header: V9Header {
                version: 9,
                count: 1,
                sys_uptime: 10_000,
                unix_secs: 1_700_000_000,
                sequence_number: 77,
                source_id: 0,
            },
            records: vec![record],
            templates_learned: 0,
        })
    }

    #[test]
    fn registry_rate_scales_counters() {
        let sampling = Arc::new(SamplingRegistry::new());
        let exporter = ExporterKey::new("10.0.0.1".parse().unwrap(), 0);
        sampling.update(exporter, 1, 1024);
        let producer = producer(sampling);

        let record = FlowRecord {
            bytes: 500,
            packets: 2,
            sampler_id: 1,
            src_addr: Some(IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1))),
            ..FlowRecord::default()
        };
        let flows = producer.produce(v9_message(record), &args()).unwrap();
        assert_eq!(flows.len(), 1);
        let ProducerMessage::Flow(flow) = &flows[0] else {
            panic!("expected a flow");
        };
        assert_eq!(flow.bytes, 512_000);
        assert_eq!(flow.packets, 2048);
        assert_eq!(flow.sampling_rate, 1024);
    }

    #[test]
    fn unknown_sampler_passes_counters_through() {
        let sampling = Arc::new(SamplingRegistry::new());
        let exporter = ExporterKey::new("10.0.0.1".parse().unwrap(), 0);
        sampling.update(exporter, 1, 1024);
        let producer = producer(sampling);

        let record = FlowRecord {
            bytes: 500,
            sampler_id: 7,
            ..FlowRecord::default()
        };
        let flows = producer.produce(v9_message(record), &args()).unwrap();
        let ProducerMessage::Flow(flow) = &flows[0] else {
            panic!("expected a flow");
        };
        assert_eq!(flow.bytes, 500);
        assert_eq!(flow.sampling_rate, 1);
    }

    #[test]
    fn uptime_relative_times_are_anchored() {
        let sampling = Arc::new(SamplingRegistry::new());
        let producer = producer(sampling);

        let record = FlowRecord {
            first_uptime_ms: Some(9_000),
            last_uptime_ms: Some(10_000),
            ..FlowRecord::default()
        };
        let flows = producer.produce(v9_message(record), &args()).unwrap();
        let ProducerMessage::Flow(flow) = &flows[0] else {
            panic!("expected a flow");
        };
        // First switched 1000 ms before reception, last at reception.
        assert_eq!(
            flow.time_flow_start_ns,
            args().time_received_ns - 1_000_000_000
        );
        assert_eq!(flow.time_flow_end_ns, args().time_received_ns);
    }

    #[test]
    fn commit_returns_flows_to_the_pool() {
        let sampling = Arc::new(SamplingRegistry::new());
        let producer = producer(sampling);

        let flows = producer
            .produce(v9_message(FlowRecord::default()), &args())
            .unwrap();
        producer.commit(flows);
        assert_eq!(producer.pool.pooled(), 1);

        // The recycled message starts clean.
        let msg = producer.pool.get();
        assert_eq!(msg.bytes, 0);
        assert!(msg.lms_target_index.is_empty());
    }

    #[test]
    fn raw_producer_wraps_the_packet() {
        let raw = RawProducer;
        let flows = raw
            .produce(v9_message(FlowRecord::default()), &args())
            .unwrap();
        assert_eq!(flows.len(), 1);
        let ProducerMessage::Raw(msg) = &flows[0] else {
            panic!("expected raw");
        };
        assert_eq!(msg.type_name, "netflowv9");
        assert_eq!(msg.src, args().src);
    }
}
