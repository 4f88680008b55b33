//! sFlow v5.
//!
//! An sFlow datagram carries samples rather than flows: flow samples embed
//! the leading bytes of a raw packet, counter samples carry interface
//! counters. The decoder walks raw packet headers Ethernet -> (802.1Q) ->
//! IPv4/IPv6 -> TCP/UDP to a bounded depth; an unknown layer stops the walk
//! for that record without failing the datagram. Each flow sample carries
//! its own sampling rate inline, so sFlow never touches the sampling
//! registry.
//!
//! References:
//! - <https://sflow.org/sflow_version_5.txt>

use serde::Serialize;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::decoders::{DecodeError, FlowRecord, Layer};

const SAMPLE_FLOW: u32 = 1;
const SAMPLE_COUNTERS: u32 = 2;
const SAMPLE_FLOW_EXPANDED: u32 = 3;
const SAMPLE_COUNTERS_EXPANDED: u32 = 4;

const RECORD_RAW_PACKET_HEADER: u32 = 1;
const HEADER_PROTOCOL_ETHERNET: u32 = 1;

const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;

#[derive(Debug, Clone, Serialize)]
pub struct SFlowDatagram {
    pub version: u32,
    /// Address of the sampling agent; preferred over the UDP source when
    /// attributing flows (the datagram may be relayed).
    pub agent_addr: IpAddr,
    pub sub_agent_id: u32,
    pub sequence_number: u32,
    /// Agent uptime in milliseconds.
    pub uptime: u32,
    pub sample_count: u32,
    pub records: Vec<FlowRecord>,
}

/// Bounds-checked big-endian reader over one datagram.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::Truncated {
                context,
                available: self.buf.len(),
            });
        }
        let (taken, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(taken)
    }

    fn u32(&mut self, context: &'static str) -> Result<u32, DecodeError> {
        let bytes = self.take(4, context)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Decodes one sFlow v5 datagram.
pub fn decode(payload: &[u8]) -> Result<SFlowDatagram, DecodeError> {
    let mut r = Reader::new(payload);

    let version = r.u32("sFlow version")?;
    if version != 5 {
        return Err(DecodeError::UnsupportedVersion {
            version: version as u16,
        });
    }

    let agent_addr = match r.u32("sFlow agent address type")? {
        1 => {
            let b = r.take(4, "sFlow agent IPv4 address")?;
            IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
        }
        2 => {
            let b = r.take(16, "sFlow agent IPv6 address")?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(b);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => {
            return Err(DecodeError::BadSample {
                context: "unknown agent address type",
            });
        }
    };

    let sub_agent_id = r.u32("sFlow sub-agent id")?;
    let sequence_number = r.u32("sFlow sequence number")?;
    let uptime = r.u32("sFlow uptime")?;
    let sample_count = r.u32("sFlow sample count")?;

    let mut records = Vec::new();
    for _ in 0..sample_count {
        let sample_type = r.u32("sFlow sample type")?;
        let sample_length = r.u32("sFlow sample length")? as usize;
        let sample = r.take(sample_length, "sFlow sample body")?;

        let enterprise = sample_type >> 12;
        let format = sample_type & 0xFFF;
        if enterprise != 0 {
            // Vendor-specific sample; not ours to interpret.
            continue;
        }
        match format {
            SAMPLE_FLOW => records.extend(parse_flow_sample(sample, false)?),
            SAMPLE_FLOW_EXPANDED => records.extend(parse_flow_sample(sample, true)?),
            SAMPLE_COUNTERS | SAMPLE_COUNTERS_EXPANDED => {
                records.push(parse_counter_sample(sample, format == SAMPLE_COUNTERS_EXPANDED)?);
            }
            _ => continue,
        }
    }

    Ok(SFlowDatagram {
        version,
        agent_addr,
        sub_agent_id,
        sequence_number,
        uptime,
        sample_count,
        records,
    })
}

fn parse_flow_sample(sample: &[u8], expanded: bool) -> Result<Vec<FlowRecord>, DecodeError> {
    let mut r = Reader::new(sample);

    let _sequence = r.u32("flow sample sequence")?;
    if expanded {
        let _source_id_type = r.u32("flow sample source id type")?;
        let _source_id_index = r.u32("flow sample source id index")?;
    } else {
        let _source_id = r.u32("flow sample source id")?;
    }
    let sampling_rate = r.u32("flow sample sampling rate")?;
    let _sample_pool = r.u32("flow sample pool")?;
    let _drops = r.u32("flow sample drops")?;
    let (input, output) = if expanded {
        let _input_format = r.u32("flow sample input format")?;
        let input = r.u32("flow sample input value")?;
        let _output_format = r.u32("flow sample output format")?;
        let output = r.u32("flow sample output value")?;
        (input, output)
    } else {
        (r.u32("flow sample input")?, r.u32("flow sample output")?)
    };
    let record_count = r.u32("flow sample record count")?;

    let mut records = Vec::new();
    for _ in 0..record_count {
        let record_type = r.u32("flow record type")?;
        let record_length = r.u32("flow record length")? as usize;
        let body = r.take(record_length, "flow record body")?;

        if record_type >> 12 != 0 || record_type & 0xFFF != RECORD_RAW_PACKET_HEADER {
            continue;
        }

        let mut record = FlowRecord {
            sampling_rate,
            input_interface: input,
            output_interface: output,
            packets: 1,
            ..FlowRecord::default()
        };
        parse_raw_packet_record(body, &mut record)?;
        records.push(record);
    }

    Ok(records)
}

fn parse_raw_packet_record(body: &[u8], record: &mut FlowRecord) -> Result<(), DecodeError> {
    let mut r = Reader::new(body);

    let header_protocol = r.u32("raw packet header protocol")?;
    let frame_length = r.u32("raw packet frame length")?;
    let _stripped = r.u32("raw packet stripped")?;
    let header_size = r.u32("raw packet header size")? as usize;
    let header = r.take(header_size.min(r.buf.len()), "raw packet header")?;

    record.bytes = frame_length as u64;
    if header_protocol == HEADER_PROTOCOL_ETHERNET {
        parse_ethernet(header, record);
    }
    Ok(())
}

/// Counter samples carry no flow data; they surface as records with zero
/// counters so downstream accounting still sees the interface.
fn parse_counter_sample(sample: &[u8], expanded: bool) -> Result<FlowRecord, DecodeError> {
    let mut r = Reader::new(sample);

    let _sequence = r.u32("counter sample sequence")?;
    let input = if expanded {
        let _source_id_type = r.u32("counter sample source id type")?;
        r.u32("counter sample source id index")?
    } else {
        r.u32("counter sample source id")? & 0x00FF_FFFF
    };

    Ok(FlowRecord {
        input_interface: input,
        ..FlowRecord::default()
    })
}

/// Best-effort walk of a sampled packet header. Stops silently at the first
/// layer it does not understand; whatever was recognised so far stands.
fn parse_ethernet(header: &[u8], record: &mut FlowRecord) {
    if header.len() < 14 {
        return;
    }
    record.layer_stack.push(Layer::Ethernet);

    let mut ethertype = u16::from_be_bytes([header[12], header[13]]);
    let mut offset = 14usize;

    while ethertype == ETHERTYPE_VLAN {
        if header.len() < offset + 4 {
            return;
        }
        record.layer_stack.push(Layer::Dot1Q);
        ethertype = u16::from_be_bytes([header[offset + 2], header[offset + 3]]);
        offset += 4;
    }

    let proto = match ethertype {
        ETHERTYPE_IPV4 => {
            if header.len() < offset + 20 {
                return;
            }
            let ihl = ((header[offset] & 0x0F) as usize) * 4;
            if ihl < 20 || header.len() < offset + ihl {
                return;
            }
            record.layer_stack.push(Layer::IPv4);
            let proto = header[offset + 9];
            record.src_addr = Some(IpAddr::V4(Ipv4Addr::new(
                header[offset + 12],
                header[offset + 13],
                header[offset + 14],
                header[offset + 15],
            )));
            record.dst_addr = Some(IpAddr::V4(Ipv4Addr::new(
                header[offset + 16],
                header[offset + 17],
                header[offset + 18],
                header[offset + 19],
            )));
            offset += ihl;
            proto
        }
        ETHERTYPE_IPV6 => {
            if header.len() < offset + 40 {
                return;
            }
            record.layer_stack.push(Layer::IPv6);
            let proto = header[offset + 6];
            let mut src = [0u8; 16];
            src.copy_from_slice(&header[offset + 8..offset + 24]);
            let mut dst = [0u8; 16];
            dst.copy_from_slice(&header[offset + 24..offset + 40]);
            record.src_addr = Some(IpAddr::V6(Ipv6Addr::from(src)));
            record.dst_addr = Some(IpAddr::V6(Ipv6Addr::from(dst)));
            offset += 40;
            proto
        }
        _ => return,
    };

    record.proto = proto;
    match proto {
        6 => {
            if header.len() < offset + 14 {
                return;
            }
            record.layer_stack.push(Layer::TCP);
            record.src_port = u16::from_be_bytes([header[offset], header[offset + 1]]);
            record.dst_port = u16::from_be_bytes([header[offset + 2], header[offset + 3]]);
            record.tcp_flags = header[offset + 13];
        }
        17 => {
            if header.len() < offset + 8 {
                return;
            }
            record.layer_stack.push(Layer::UDP);
            record.src_port = u16::from_be_bytes([header[offset], header[offset + 1]]);
            record.dst_port = u16::from_be_bytes([header[offset + 2], header[offset + 3]]);
        }
        1 => record.layer_stack.push(Layer::ICMP),
        58 => record.layer_stack.push(Layer::ICMPv6),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ethernet + IPv4 + TCP header, 8080 -> 443, SYN|ACK.
    fn sampled_header() -> Vec<u8> {
        let mut h = Vec::new();
        h.extend([0x02, 0, 0, 0, 0, 1]); // dst mac
        h.extend([0x02, 0, 0, 0, 0, 2]); // src mac
        h.extend(ETHERTYPE_IPV4.to_be_bytes());
        // IPv4, IHL 5
        h.push(0x45);
        h.push(0); // tos
        h.extend(40u16.to_be_bytes()); // total length
        h.extend([0, 0, 0x40, 0]); // id, flags
        h.push(64); // ttl
        h.push(6); // TCP
        h.extend([0, 0]); // checksum
        h.extend([10, 0, 0, 1]); // src
        h.extend([192, 0, 2, 7]); // dst
        // TCP
        h.extend(8080u16.to_be_bytes());
        h.extend(443u16.to_be_bytes());
        h.extend(1u32.to_be_bytes()); // seq
        h.extend(0u32.to_be_bytes()); // ack
        h.push(0x50); // data offset
        h.push(0x12); // SYN|ACK
        h.extend([0xFF, 0xFF, 0, 0, 0, 0]); // window, checksum, urgent
        h
    }

    fn flow_sample(header: &[u8], sampling_rate: u32) -> Vec<u8> {
        let mut record = Vec::new();
        record.extend(HEADER_PROTOCOL_ETHERNET.to_be_bytes());
        record.extend(1500u32.to_be_bytes()); // frame length
        record.extend(0u32.to_be_bytes()); // stripped
        record.extend((header.len() as u32).to_be_bytes());
        record.extend(header);

        let mut sample = Vec::new();
        sample.extend(1u32.to_be_bytes()); // sequence
        sample.extend(0x0100_0003u32.to_be_bytes()); // source id
        sample.extend(sampling_rate.to_be_bytes());
        sample.extend(100u32.to_be_bytes()); // pool
        sample.extend(0u32.to_be_bytes()); // drops
        sample.extend(3u32.to_be_bytes()); // input
        sample.extend(4u32.to_be_bytes()); // output
        sample.extend(1u32.to_be_bytes()); // record count
        sample.extend(RECORD_RAW_PACKET_HEADER.to_be_bytes());
        sample.extend((record.len() as u32).to_be_bytes());
        sample.extend(record);
        sample
    }

    fn datagram(samples: &[(u32, Vec<u8>)]) -> Vec<u8> {
        let mut d = Vec::new();
        d.extend(5u32.to_be_bytes());
        d.extend(1u32.to_be_bytes()); // agent address type IPv4
        d.extend([198, 51, 100, 9]);
        d.extend(0u32.to_be_bytes()); // sub agent
        d.extend(42u32.to_be_bytes()); // sequence
        d.extend(123_456u32.to_be_bytes()); // uptime
        d.extend((samples.len() as u32).to_be_bytes());
        for (sample_type, body) in samples {
            d.extend(sample_type.to_be_bytes());
            d.extend((body.len() as u32).to_be_bytes());
            d.extend(body);
        }
        d
    }

    #[test]
    fn flow_sample_walks_packet_layers() {
        let payload = datagram(&[(SAMPLE_FLOW, flow_sample(&sampled_header(), 1024))]);
        let parsed = decode(&payload).unwrap();

        assert_eq!(parsed.agent_addr, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9)));
        assert_eq!(parsed.records.len(), 1);

        let rec = &parsed.records[0];
        assert_eq!(rec.src_addr, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert_eq!(rec.dst_addr, Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7))));
        assert_eq!(rec.src_port, 8080);
        assert_eq!(rec.dst_port, 443);
        assert_eq!(rec.proto, 6);
        assert_eq!(rec.tcp_flags, 0x12);
        assert_eq!(rec.bytes, 1500);
        assert_eq!(rec.packets, 1);
        assert_eq!(rec.sampling_rate, 1024);
        assert_eq!(rec.input_interface, 3);
        assert_eq!(
            rec.layer_stack,
            vec![Layer::Ethernet, Layer::IPv4, Layer::TCP]
        );
    }

    #[test]
    fn unknown_ethertype_stops_without_failing() {
        let mut header = sampled_header();
        header[12] = 0x88;
        header[13] = 0xCC; // LLDP
        let payload = datagram(&[(SAMPLE_FLOW, flow_sample(&header, 1))]);
        let parsed = decode(&payload).unwrap();

        let rec = &parsed.records[0];
        assert_eq!(rec.layer_stack, vec![Layer::Ethernet]);
        assert_eq!(rec.src_addr, None);
        assert_eq!(rec.bytes, 1500);
    }

    #[test]
    fn counter_sample_emits_zero_counters() {
        let mut counter = Vec::new();
        counter.extend(9u32.to_be_bytes()); // sequence
        counter.extend(0x0000_0007u32.to_be_bytes()); // source id
        counter.extend(0u32.to_be_bytes()); // record count

        let payload = datagram(&[(SAMPLE_COUNTERS, counter)]);
        let parsed = decode(&payload).unwrap();

        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].bytes, 0);
        assert_eq!(parsed.records[0].packets, 0);
        assert_eq!(parsed.records[0].input_interface, 7);
    }

    #[test]
    fn vlan_tag_is_recognised() {
        let mut header = sampled_header();
        // Splice a VLAN tag between the MACs and the IPv4 ethertype.
        let mut tagged = header[..12].to_vec();
        tagged.extend(ETHERTYPE_VLAN.to_be_bytes());
        tagged.extend([0x00, 0x64]); // VLAN 100
        tagged.extend_from_slice(&header.split_off(12));
        let payload = datagram(&[(SAMPLE_FLOW, flow_sample(&tagged, 1))]);
        let parsed = decode(&payload).unwrap();

        let rec = &parsed.records[0];
        assert_eq!(
            rec.layer_stack,
            vec![Layer::Ethernet, Layer::Dot1Q, Layer::IPv4, Layer::TCP]
        );
        assert_eq!(rec.src_port, 8080);
    }

    #[test]
    fn truncated_datagram_is_rejected() {
        let payload = datagram(&[]);
        let err = decode(&payload[..10]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut payload = datagram(&[]);
        payload[3] = 4;
        let err = decode(&payload).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedVersion { version: 4 }));
    }
}
