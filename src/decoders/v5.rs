//! NetFlow v5.
//!
//! Fixed-layout, big-endian: a 24-byte header followed by `count` records of
//! 48 bytes each. The sampling rate travels in the header (low 14 bits of
//! `sampling_interval`), so v5 never touches the sampling registry.
//!
//! References:
//! - <https://www.cisco.com/en/US/technologies/tk648/tk362/technologies_white_paper09186a00800a3db9.html>

use nom::number::complete::be_u32;
use nom_derive::*;
use serde::Serialize;

use std::net::Ipv4Addr;

use crate::decoders::DecodeError;
use crate::protocol::ProtocolTypes;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Nom)]
pub struct V5Header {
    /// NetFlow export format version number
    pub version: u16,
    /// Number of flows exported in this packet (1-30)
    pub count: u16,
    /// Current time in milliseconds since the export device booted
    pub sys_uptime: u32,
    /// Current count of seconds since 0000 UTC 1970
    pub unix_secs: u32,
    /// Residual nanoseconds since 0000 UTC 1970
    pub unix_nsecs: u32,
    /// Sequence counter of total flows seen
    pub flow_sequence: u32,
    /// Type of flow-switching engine
    pub engine_type: u8,
    /// Slot number of the flow-switching engine
    pub engine_id: u8,
    /// First two bits hold the sampling mode; remaining 14 bits hold the
    /// value of the sampling interval
    pub sampling_interval: u16,
}

impl V5Header {
    /// Sampling rate from the interval field; 0 when the exporter does not
    /// sample.
    pub fn sampling_rate(&self) -> u32 {
        (self.sampling_interval & 0x3FFF) as u32
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Nom)]
pub struct V5Record {
    /// Source IP address
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    pub src_addr: Ipv4Addr,
    /// Destination IP address
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    pub dst_addr: Ipv4Addr,
    /// IP address of next hop router
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    pub next_hop: Ipv4Addr,
    /// SNMP index of input interface
    pub input: u16,
    /// SNMP index of output interface
    pub output: u16,
    /// Packets in the flow
    pub d_pkts: u32,
    /// Total number of Layer 3 bytes in the packets of the flow
    pub d_octets: u32,
    /// SysUptime at start of flow, in milliseconds
    pub first: u32,
    /// SysUptime at the time the last packet of the flow was received
    pub last: u32,
    /// TCP/UDP source port number or equivalent
    pub src_port: u16,
    /// TCP/UDP destination port number or equivalent
    pub dst_port: u16,
    /// Unused (zero) bytes
    pub pad1: u8,
    /// Cumulative OR of TCP flags
    pub tcp_flags: u8,
    /// IP protocol type (for example, TCP = 6; UDP = 17)
    pub protocol_number: u8,
    #[nom(Value(ProtocolTypes::from(protocol_number)))]
    pub protocol_type: ProtocolTypes,
    /// IP type of service (ToS)
    pub tos: u8,
    /// Autonomous system number of the source, either origin or peer
    pub src_as: u16,
    /// Autonomous system number of the destination, either origin or peer
    pub dst_as: u16,
    /// Source address prefix mask bits
    pub src_mask: u8,
    /// Destination address prefix mask bits
    pub dst_mask: u8,
    /// Unused (zero) bytes
    pub pad2: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct V5Packet {
    pub header: V5Header,
    pub records: Vec<V5Record>,
}

/// Decodes one NetFlow v5 datagram.
pub fn decode(payload: &[u8]) -> Result<V5Packet, DecodeError> {
    let (mut remaining, header) =
        V5Header::parse(payload).map_err(|_| DecodeError::Truncated {
            context: "NetFlow v5 header",
            available: payload.len(),
        })?;

    if header.version != 5 {
        return Err(DecodeError::UnsupportedVersion {
            version: header.version,
        });
    }

    let mut records = Vec::with_capacity(header.count as usize);
    for _ in 0..header.count {
        match V5Record::parse(remaining) {
            Ok((rest, record)) => {
                remaining = rest;
                records.push(record);
            }
            Err(_) => {
                return Err(DecodeError::RecordCountMismatch {
                    expected: header.count,
                    parsed: records.len(),
                });
            }
        }
    }

    Ok(V5Packet { header, records })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Six-record export captured from a real v5 exporter.
    const SIX_RECORDS: &str = concat!(
        "00050006 0082c348 5bcdba1b 05976dc7 0000643d 08080000",
        "0a800279 0a800201 00000000 00090002 00000005 0000024e",
        "00829b8c 00829b90 1f90b918 001b0600 00000000 00000000",
        "0a800277 0a810201 00000000 00070001 00000002 00000094",
        "008295a9 00829afb 1f90c12c 00120600 00000000 00000000",
        "0a810201 0a800277 00000000 00010007 00000003 000000c2",
        "008295a9 00829afc c12c1f90 00160600 00000000 00000000",
        "0a800201 0a800279 00000000 00020009 00000005 000001f1",
        "00829b8c 00829b8f b9181f90 001b0600 00000000 00000000",
        "0a800201 0a800279 00000000 00020009 00000005 0000022e",
        "00829b90 00829b9d b91a1f90 001b0600 00000000 00000000",
        "0a800279 0a800201 00000000 00090002 00000005 00000bac",
        "00829b90 00829b9d 1f90b91a 001b0600 00000000 00000000",
    );

    fn fixture() -> Vec<u8> {
        hex::decode(SIX_RECORDS.replace(' ', "")).unwrap()
    }

    #[test]
    fn decodes_six_record_export() {
        let payload = fixture();
        assert_eq!(payload.len(), 24 + 6 * 48);

        let packet = decode(&payload).unwrap();
        assert_eq!(packet.header.version, 5);
        assert_eq!(packet.header.count, 6);
        assert_eq!(packet.records.len(), 6);

        let first = &packet.records[0];
        assert_eq!(first.input, 9);
        assert_eq!(first.output, 2);
        assert_eq!(first.src_port, 0x1F90);
        assert_eq!(first.src_port, 8080);
        assert_eq!(first.dst_port, 0xB918);
        assert_eq!(first.protocol_number, 6);
        assert_eq!(first.protocol_type, ProtocolTypes::TCP);
        assert_eq!(first.d_pkts, 5);
        assert_eq!(first.d_octets, 0x24E);
        assert_eq!(first.src_addr, Ipv4Addr::new(10, 128, 2, 121));
        assert_eq!(first.dst_addr, Ipv4Addr::new(10, 128, 2, 1));
    }

    #[test]
    fn truncated_header_is_rejected() {
        let payload = fixture();
        let err = decode(&payload[..20]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn short_record_is_a_count_mismatch() {
        let payload = fixture();
        // Cut into the middle of the fourth record.
        let err = decode(&payload[..24 + 3 * 48 + 10]).unwrap_err();
        match err {
            DecodeError::RecordCountMismatch { expected, parsed } => {
                assert_eq!(expected, 6);
                assert_eq!(parsed, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn sampling_rate_masks_mode_bits() {
        let payload = fixture();
        let packet = decode(&payload).unwrap();
        assert_eq!(packet.header.engine_type, 8);
        assert_eq!(packet.header.engine_id, 8);
        assert_eq!(packet.header.sampling_interval, 0);
        assert_eq!(packet.header.sampling_rate(), 0);

        // Mode bits (top two) never leak into the rate.
        let mut header = packet.header;
        header.sampling_interval = 0b0100_0000_0000_0100;
        assert_eq!(header.sampling_rate(), 4);
    }
}
