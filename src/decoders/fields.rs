//! Template-driven record parsing shared by NetFlow v9 and IPFIX.
//!
//! Both protocols describe data records as an ordered field list; only the
//! framing around the templates differs. This module walks a record
//! according to a [`Template`], folds the fields the collector understands
//! into a [`FlowRecord`], and preserves everything else verbatim.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::decoders::{DecodeError, FlowRecord, UnknownField};
use crate::templates::{Template, TemplateField};

// IANA Information Element / v9 field type numbers.
pub const IN_BYTES: u16 = 1;
pub const IN_PKTS: u16 = 2;
pub const PROTOCOL: u16 = 4;
pub const TCP_FLAGS: u16 = 6;
pub const L4_SRC_PORT: u16 = 7;
pub const IPV4_SRC_ADDR: u16 = 8;
pub const INPUT_SNMP: u16 = 10;
pub const L4_DST_PORT: u16 = 11;
pub const IPV4_DST_ADDR: u16 = 12;
pub const OUTPUT_SNMP: u16 = 14;
pub const SRC_AS: u16 = 16;
pub const DST_AS: u16 = 17;
pub const LAST_SWITCHED: u16 = 21;
pub const FIRST_SWITCHED: u16 = 22;
pub const OUT_BYTES: u16 = 23;
pub const OUT_PKTS: u16 = 24;
pub const IPV6_SRC_ADDR: u16 = 27;
pub const IPV6_DST_ADDR: u16 = 28;
pub const SAMPLING_INTERVAL: u16 = 34;
pub const FLOW_SAMPLER_ID: u16 = 48;
pub const FLOW_SAMPLER_RANDOM_INTERVAL: u16 = 50;
pub const FLOW_START_SECONDS: u16 = 150;
pub const FLOW_END_SECONDS: u16 = 151;
pub const FLOW_START_MILLISECONDS: u16 = 152;
pub const FLOW_END_MILLISECONDS: u16 = 153;
pub const SELECTOR_ID: u16 = 302;
pub const SAMPLING_PACKET_INTERVAL: u16 = 305;

/// v9 options scope type for "Interface" (RFC 3954 §6.1).
pub const SCOPE_INTERFACE: u16 = 2;

/// Big-endian unsigned integer of 1..=8 bytes; longer values keep the low
/// eight bytes, shorter ones zero-extend.
pub fn be_uint(bytes: &[u8]) -> u64 {
    let bytes = if bytes.len() > 8 {
        &bytes[bytes.len() - 8..]
    } else {
        bytes
    };
    let mut value = 0u64;
    for b in bytes {
        value = (value << 8) | u64::from(*b);
    }
    value
}

/// Reads one field value, honouring the IPFIX variable-length encoding:
/// a length of 0xFFFF in the template means the record carries a one-byte
/// length prefix, and a prefix of 255 means a u16 length follows.
pub fn read_field_value<'a>(
    input: &'a [u8],
    field: &TemplateField,
) -> Result<(&'a [u8], &'a [u8]), DecodeError> {
    let truncated = || DecodeError::Truncated {
        context: "data record field",
        available: input.len(),
    };

    if !field.is_variable_length() {
        let len = field.field_length as usize;
        if input.len() < len {
            return Err(truncated());
        }
        return Ok(input.split_at(len));
    }

    let (&first, rest) = input.split_first().ok_or_else(truncated)?;
    let (len, rest) = if first < 255 {
        (first as usize, rest)
    } else {
        if rest.len() < 2 {
            return Err(truncated());
        }
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        (len, &rest[2..])
    };
    if rest.len() < len {
        return Err(truncated());
    }
    Ok(rest.split_at(len))
}

/// Folds one field value into the record. Unrecognised fields (including all
/// enterprise-scoped ones) are preserved as opaque bytes.
pub fn apply_field(record: &mut FlowRecord, field: &TemplateField, value: &[u8]) {
    if field.enterprise_number.is_some() {
        record.unknown_fields.push(UnknownField {
            field_type: field.field_type,
            enterprise_number: field.enterprise_number,
            value: value.to_vec(),
        });
        return;
    }

    match field.field_type {
        IN_BYTES => record.bytes = be_uint(value),
        IN_PKTS => record.packets = be_uint(value),
        OUT_BYTES => {
            if record.bytes == 0 {
                record.bytes = be_uint(value);
            }
        }
        OUT_PKTS => {
            if record.packets == 0 {
                record.packets = be_uint(value);
            }
        }
        PROTOCOL => record.proto = be_uint(value) as u8,
        TCP_FLAGS => record.tcp_flags = be_uint(value) as u8,
        L4_SRC_PORT => record.src_port = be_uint(value) as u16,
        L4_DST_PORT => record.dst_port = be_uint(value) as u16,
        INPUT_SNMP => record.input_interface = be_uint(value) as u32,
        OUTPUT_SNMP => record.output_interface = be_uint(value) as u32,
        SRC_AS => record.src_as = be_uint(value) as u32,
        DST_AS => record.dst_as = be_uint(value) as u32,
        IPV4_SRC_ADDR if value.len() == 4 => {
            record.src_addr = Some(IpAddr::V4(Ipv4Addr::new(
                value[0], value[1], value[2], value[3],
            )));
        }
        IPV4_DST_ADDR if value.len() == 4 => {
            record.dst_addr = Some(IpAddr::V4(Ipv4Addr::new(
                value[0], value[1], value[2], value[3],
            )));
        }
        IPV6_SRC_ADDR if value.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(value);
            record.src_addr = Some(IpAddr::V6(Ipv6Addr::from(octets)));
        }
        IPV6_DST_ADDR if value.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(value);
            record.dst_addr = Some(IpAddr::V6(Ipv6Addr::from(octets)));
        }
        FIRST_SWITCHED => record.first_uptime_ms = Some(be_uint(value) as u32),
        LAST_SWITCHED => record.last_uptime_ms = Some(be_uint(value) as u32),
        FLOW_START_SECONDS => record.flow_start_ns = Some(be_uint(value) * 1_000_000_000),
        FLOW_END_SECONDS => record.flow_end_ns = Some(be_uint(value) * 1_000_000_000),
        FLOW_START_MILLISECONDS => record.flow_start_ns = Some(be_uint(value) * 1_000_000),
        FLOW_END_MILLISECONDS => record.flow_end_ns = Some(be_uint(value) * 1_000_000),
        FLOW_SAMPLER_ID | SELECTOR_ID => record.sampler_id = be_uint(value),
        SAMPLING_INTERVAL => record.sampling_rate = be_uint(value) as u32,
        FLOW_SAMPLER_RANDOM_INTERVAL => {
            if record.sampling_rate == 0 {
                record.sampling_rate = be_uint(value) as u32;
            }
        }
        _ => record.unknown_fields.push(UnknownField {
            field_type: field.field_type,
            enterprise_number: None,
            value: value.to_vec(),
        }),
    }
}

/// Parses every record of a data set against its template. Trailing bytes
/// shorter than one record are padding (RFC 7011 §3.3.1) and ignored.
pub fn parse_data_set(data: &[u8], template: &Template) -> Result<Vec<FlowRecord>, DecodeError> {
    if template.fields.is_empty() {
        return Err(DecodeError::BadSample {
            context: "data template without fields",
        });
    }

    let fixed_len = template.fixed_record_length();
    let mut records = Vec::new();
    let mut remaining = data;

    while !remaining.is_empty() {
        if let Some(len) = fixed_len {
            if len == 0 || remaining.len() < len {
                break;
            }
        } else if remaining.iter().all(|b| *b == 0) {
            break;
        }

        let mut record = FlowRecord::default();
        let mut parsed_all = true;
        for field in &template.fields {
            match read_field_value(remaining, field) {
                Ok((value, rest)) => {
                    apply_field(&mut record, field, value);
                    remaining = rest;
                }
                Err(err) => {
                    // A short first record is a real error; a short later
                    // one is padding.
                    if records.is_empty() {
                        return Err(err);
                    }
                    parsed_all = false;
                    remaining = &[];
                    break;
                }
            }
        }
        if parsed_all {
            records.push(record);
        }
    }

    Ok(records)
}

/// Sampling information extracted from one Options Data record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OptionsRecord {
    /// Sampler identity from a sampler-scoped field, or 0 for the
    /// exporter-wide default entry.
    pub sampler_id: u64,
    pub sampling_rate: Option<u32>,
    /// Precedence of the field that supplied the rate:
    /// samplingInterval > samplingPacketInterval > samplerRandomInterval.
    rate_rank: u8,
}

impl OptionsRecord {
    fn scan(&mut self, field_type: u16, is_scope: bool, value: &[u8]) {
        match field_type {
            FLOW_SAMPLER_ID | SELECTOR_ID => self.sampler_id = be_uint(value),
            SCOPE_INTERFACE if is_scope && self.sampler_id == 0 => {
                self.sampler_id = be_uint(value);
            }
            SAMPLING_INTERVAL => self.set_rate(be_uint(value) as u32, 3),
            SAMPLING_PACKET_INTERVAL => self.set_rate(be_uint(value) as u32, 2),
            FLOW_SAMPLER_RANDOM_INTERVAL => self.set_rate(be_uint(value) as u32, 1),
            _ => {}
        }
    }

    fn set_rate(&mut self, rate: u32, rank: u8) {
        if rank > self.rate_rank {
            self.sampling_rate = Some(rate);
            self.rate_rank = rank;
        }
    }
}

/// Parses the records of an Options Data set, extracting sampling
/// information from scope + option fields.
pub fn parse_options_set(
    data: &[u8],
    template: &Template,
) -> Result<Vec<OptionsRecord>, DecodeError> {
    if template.scope_fields.is_empty() && template.fields.is_empty() {
        return Err(DecodeError::BadSample {
            context: "options template without fields",
        });
    }

    let fixed_len = template.fixed_record_length();
    let mut records = Vec::new();
    let mut remaining = data;

    while !remaining.is_empty() {
        if let Some(len) = fixed_len {
            if len == 0 || remaining.len() < len {
                break;
            }
        } else if remaining.iter().all(|b| *b == 0) {
            break;
        }

        let mut options = OptionsRecord::default();
        let mut parsed_all = true;
        let scope_count = template.scope_fields.len();
        for (index, field) in template
            .scope_fields
            .iter()
            .chain(template.fields.iter())
            .enumerate()
        {
            match read_field_value(remaining, field) {
                Ok((value, rest)) => {
                    options.scan(field.field_type, index < scope_count, value);
                    remaining = rest;
                }
                Err(err) => {
                    if records.is_empty() {
                        return Err(err);
                    }
                    parsed_all = false;
                    remaining = &[];
                    break;
                }
            }
        }
        if parsed_all {
            records.push(options);
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::VARIABLE_FIELD_LENGTH;

    #[test]
    fn be_uint_handles_odd_widths() {
        assert_eq!(be_uint(&[]), 0);
        assert_eq!(be_uint(&[0x12]), 0x12);
        assert_eq!(be_uint(&[0x01, 0x00]), 256);
        assert_eq!(be_uint(&[0x00, 0x00, 0x01]), 1);
        assert_eq!(be_uint(&[0xFF; 8]), u64::MAX);
        // Wider than 8 bytes keeps the low 8.
        assert_eq!(be_uint(&[0x01, 0, 0, 0, 0, 0, 0, 0, 0x02]), 2);
    }

    #[test]
    fn variable_length_short_form() {
        let field = TemplateField::new(95, VARIABLE_FIELD_LENGTH);
        let input = [3, 0xAA, 0xBB, 0xCC, 0xDD];
        let (value, rest) = read_field_value(&input, &field).unwrap();
        assert_eq!(value, &[0xAA, 0xBB, 0xCC]);
        assert_eq!(rest, &[0xDD]);
    }

    #[test]
    fn variable_length_long_form() {
        let field = TemplateField::new(95, VARIABLE_FIELD_LENGTH);
        let mut input = vec![255, 0x01, 0x00];
        input.extend(std::iter::repeat(0x42).take(256));
        input.push(0x99);
        let (value, rest) = read_field_value(&input, &field).unwrap();
        assert_eq!(value.len(), 256);
        assert!(value.iter().all(|b| *b == 0x42));
        assert_eq!(rest, &[0x99]);
    }

    #[test]
    fn unknown_fields_are_preserved() {
        let template = Template::data(
            256,
            vec![TemplateField::new(IN_BYTES, 4), TemplateField::new(20000, 2)],
        );
        let data = [0, 0, 0, 7, 0xCA, 0xFE];
        let records = parse_data_set(&data, &template).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes, 7);
        assert_eq!(records[0].unknown_fields.len(), 1);
        assert_eq!(records[0].unknown_fields[0].field_type, 20000);
        assert_eq!(records[0].unknown_fields[0].value, vec![0xCA, 0xFE]);
    }

    #[test]
    fn data_set_trailing_padding_is_ignored() {
        let template = Template::data(256, vec![TemplateField::new(IN_BYTES, 4)]);
        let data = [0, 0, 0, 1, 0, 0, 0, 2, 0, 0];
        let records = parse_data_set(&data, &template).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].bytes, 1);
        assert_eq!(records[1].bytes, 2);
    }

    #[test]
    fn options_scan_prefers_sampling_interval() {
        let template = Template::options(
            257,
            vec![TemplateField::new(SCOPE_INTERFACE, 2)],
            vec![
                TemplateField::new(FLOW_SAMPLER_RANDOM_INTERVAL, 4),
                TemplateField::new(SAMPLING_INTERVAL, 4),
            ],
        );
        let data = [0, 3, 0, 0, 2, 0, 0, 0, 4, 0];
        let records = parse_options_set(&data, &template).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sampler_id, 3);
        assert_eq!(records[0].sampling_rate, Some(1024));
    }

    #[test]
    fn options_sampler_id_beats_interface_scope() {
        let template = Template::options(
            258,
            vec![TemplateField::new(SCOPE_INTERFACE, 2)],
            vec![
                TemplateField::new(FLOW_SAMPLER_ID, 2),
                TemplateField::new(SAMPLING_INTERVAL, 4),
            ],
        );
        let data = [0, 9, 0, 1, 0, 0, 1, 0];
        let records = parse_options_set(&data, &template).unwrap();
        assert_eq!(records[0].sampler_id, 1);
        assert_eq!(records[0].sampling_rate, Some(256));
    }
}
