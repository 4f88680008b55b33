//! Wire-format decoders.
//!
//! Each decoder consumes one full UDP payload and emits an
//! [`IntermediateMessage`]: the parsed packet header plus zero or more
//! [`FlowRecord`]s. NetFlow v9 and IPFIX additionally write through to the
//! shared [`TemplateCache`](crate::templates::TemplateCache) and
//! [`SamplingRegistry`](crate::sampling::SamplingRegistry) as Template Sets
//! and Options Data arrive.

pub mod fields;
pub mod ipfix;
pub mod sflow;
pub mod v5;
pub mod v9;

use serde::Serialize;
use thiserror::Error;

use crate::templates::ExporterKey;

/// Decoding failure for one datagram. Always local: the datagram is dropped,
/// counted, and the worker moves on.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("truncated datagram while reading {context} ({available} bytes available)")]
    Truncated {
        context: &'static str,
        available: usize,
    },

    #[error("unsupported wire version {version}")]
    UnsupportedVersion { version: u16 },

    #[error("header announced {expected} records, datagram carried {parsed}")]
    RecordCountMismatch { expected: u16, parsed: usize },

    #[error("set {set_id} declares bad length {length}")]
    BadSetLength { set_id: u16, length: u16 },

    #[error("unexpected set id {set_id}")]
    UnexpectedSet { set_id: u16 },

    #[error("field {field_type} has unparseable length {length}")]
    BadFieldLength { field_type: u16, length: u16 },

    /// Expected condition for v9/IPFIX: data arrived before its template.
    /// The remainder of the datagram is skipped; the cache is not poisoned.
    #[error("template {template_id} not found for exporter {exporter}")]
    TemplateNotFound {
        exporter: ExporterKey,
        template_id: u16,
    },

    #[error("malformed sample: {context}")]
    BadSample { context: &'static str },
}

impl DecodeError {
    /// Stable label for the `flowline_decode_errors_total` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::Truncated { .. } => "truncated",
            DecodeError::UnsupportedVersion { .. } => "unsupported_version",
            DecodeError::RecordCountMismatch { .. } => "count_mismatch",
            DecodeError::BadSetLength { .. } => "bad_set_length",
            DecodeError::UnexpectedSet { .. } => "unexpected_set",
            DecodeError::BadFieldLength { .. } => "bad_field_length",
            DecodeError::TemplateNotFound { .. } => "template_not_found",
            DecodeError::BadSample { .. } => "bad_sample",
        }
    }

    pub fn is_template_not_found(&self) -> bool {
        matches!(self, DecodeError::TemplateNotFound { .. })
    }
}

/// A protocol layer recognised while walking a raw packet header
/// (sFlow) or inferred from a decoded record (NetFlow/IPFIX).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Layer {
    Ethernet,
    Dot1Q,
    IPv4,
    IPv6,
    TCP,
    UDP,
    ICMP,
    ICMPv6,
}

/// One unknown template field preserved verbatim for downstream formatters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnknownField {
    pub field_type: u16,
    pub enterprise_number: Option<u32>,
    pub value: Vec<u8>,
}

/// Output of a decoder for a single flow. Protocol-independent shape; the
/// producer collapses these into the canonical [`FlowMessage`]
/// (crate::producer::message::FlowMessage).
#[derive(Debug, Default, Clone, Serialize)]
pub struct FlowRecord {
    pub src_addr: Option<std::net::IpAddr>,
    pub dst_addr: Option<std::net::IpAddr>,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub input_interface: u32,
    pub output_interface: u32,
    pub bytes: u64,
    pub packets: u64,
    /// sysUptime at flow start/end in milliseconds (v5, v9).
    pub first_uptime_ms: Option<u32>,
    pub last_uptime_ms: Option<u32>,
    /// Absolute flow start/end in nanoseconds since epoch (IPFIX).
    pub flow_start_ns: Option<u64>,
    pub flow_end_ns: Option<u64>,
    pub tcp_flags: u8,
    pub src_as: u32,
    pub dst_as: u32,
    /// Sampler that observed this flow, when the record carries one
    /// (v9 flowSamplerId, IPFIX selectorId).
    pub sampler_id: u64,
    /// Rate carried inline by the record itself (v5 header, sFlow sample);
    /// zero means "consult the sampling registry".
    pub sampling_rate: u32,
    pub layer_stack: Vec<Layer>,
    /// Fields the decoder has no mapping for, preserved for formatters.
    pub unknown_fields: Vec<UnknownField>,
}

/// Decoded form of one datagram, tagged by wire format and dispatched in
/// exactly one place (the producer).
#[derive(Debug, Clone, Serialize)]
pub enum IntermediateMessage {
    V5(v5::V5Packet),
    V9(v9::V9Packet),
    IPFix(ipfix::IpfixPacket),
    SFlow(sflow::SFlowDatagram),
}

impl IntermediateMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            IntermediateMessage::V5(_) => "netflowv5",
            IntermediateMessage::V9(_) => "netflowv9",
            IntermediateMessage::IPFix(_) => "ipfix",
            IntermediateMessage::SFlow(_) => "sflow",
        }
    }
}

/// Wire version from the first two bytes, used for scheme sniffing.
/// NetFlow headers start with a big-endian version (5, 9 or 10); an sFlow
/// datagram starts with a four-byte version, so its first u16 reads zero.
pub fn wire_version(payload: &[u8]) -> Option<u16> {
    if payload.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([payload[0], payload[1]]))
}

/// Converts a sysUptime-relative event time to nanoseconds since epoch,
/// anchored at the reception timestamp: the event happened
/// `(sys_uptime - event_ms)` milliseconds before the datagram arrived.
pub fn uptime_to_ns(time_received_ns: u64, sys_uptime_ms: u32, event_ms: u32) -> u64 {
    let delta_ms = (sys_uptime_ms as u64).saturating_sub(event_ms as u64);
    time_received_ns.saturating_sub(delta_ms * 1_000_000)
}
