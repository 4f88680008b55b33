//! IPFIX (NetFlow v10).
//!
//! Same template-driven shape as NetFlow v9 with three wire differences:
//! the 16-byte header carries a message length and an observation domain id,
//! template/options-template sets use ids 2 and 3, and field specifiers may
//! carry an enterprise bit (type MSB set, followed by a u32 enterprise
//! number) or declare a variable length (0xFFFF, resolved per record).
//!
//! References:
//! - <https://datatracker.ietf.org/doc/html/rfc7011>
//! - <https://www.iana.org/assignments/ipfix/ipfix.xhtml>

use nom_derive::*;
use serde::Serialize;

use std::net::IpAddr;

use crate::decoders::fields::{parse_data_set, parse_options_set};
use crate::decoders::{DecodeError, FlowRecord};
use crate::sampling::SamplingRegistry;
use crate::templates::{ExporterKey, Template, TemplateCache, TemplateField};

const TEMPLATE_SET_ID: u16 = 2;
const OPTIONS_TEMPLATE_SET_ID: u16 = 3;
const DATA_SET_MIN_ID: u16 = 256;
const ENTERPRISE_BIT: u16 = 0x8000;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Nom)]
pub struct IpfixHeader {
    /// 0x000a for IPFIX
    pub version: u16,
    /// Total length of the message in octets, including this header
    pub length: u16,
    /// Seconds since 0000 UTC 1970 at which the message left the exporter
    pub export_time: u32,
    /// Incremental sequence counter of data records (templates do not
    /// increase it)
    pub sequence_number: u32,
    /// Observation Domain ID, locally unique to the exporting process
    pub observation_domain_id: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct IpfixPacket {
    pub header: IpfixHeader,
    pub records: Vec<FlowRecord>,
    pub templates_learned: usize,
}

/// Decodes one IPFIX message from `addr`.
pub fn decode(
    payload: &[u8],
    addr: IpAddr,
    templates: &TemplateCache,
    sampling: &SamplingRegistry,
) -> Result<IpfixPacket, DecodeError> {
    let (remaining, header) = IpfixHeader::parse(payload).map_err(|_| DecodeError::Truncated {
        context: "IPFIX header",
        available: payload.len(),
    })?;

    if header.version != 10 {
        return Err(DecodeError::UnsupportedVersion {
            version: header.version,
        });
    }
    if (header.length as usize) > payload.len() || header.length < 16 {
        return Err(DecodeError::Truncated {
            context: "IPFIX message body",
            available: payload.len(),
        });
    }
    // Sets beyond the declared message length are not ours to parse.
    let mut remaining = &remaining[..header.length as usize - 16];

    let exporter = ExporterKey::new(addr, header.observation_domain_id);
    let mut records = Vec::new();
    let mut templates_learned = 0usize;

    while remaining.len() >= 4 {
        let set_id = u16::from_be_bytes([remaining[0], remaining[1]]);
        let length = u16::from_be_bytes([remaining[2], remaining[3]]);
        if length < 4 {
            return Err(DecodeError::BadSetLength { set_id, length });
        }
        if length as usize > remaining.len() {
            return Err(DecodeError::Truncated {
                context: "IPFIX set",
                available: remaining.len(),
            });
        }
        let body = &remaining[4..length as usize];
        remaining = &remaining[length as usize..];

        match set_id {
            TEMPLATE_SET_ID => {
                templates_learned += parse_template_set(body, &exporter, templates)?;
            }
            OPTIONS_TEMPLATE_SET_ID => {
                templates_learned += parse_options_template_set(body, &exporter, templates)?;
            }
            id if id >= DATA_SET_MIN_ID => {
                let template = templates.get(&exporter, id).ok_or(
                    DecodeError::TemplateNotFound {
                        exporter,
                        template_id: id,
                    },
                )?;
                if template.is_options_template {
                    for options in parse_options_set(body, &template)? {
                        if let Some(rate) = options.sampling_rate {
                            sampling.update(exporter, options.sampler_id, rate);
                        }
                    }
                } else {
                    records.extend(parse_data_set(body, &template)?);
                }
            }
            id => return Err(DecodeError::UnexpectedSet { set_id: id }),
        }
    }

    Ok(IpfixPacket {
        header,
        records,
        templates_learned,
    })
}

/// One field specifier, decoding the enterprise bit (RFC 7011 §3.2).
fn parse_field_specifier(body: &[u8]) -> Result<(TemplateField, &[u8]), DecodeError> {
    if body.len() < 4 {
        return Err(DecodeError::Truncated {
            context: "IPFIX field specifier",
            available: body.len(),
        });
    }
    let raw_type = u16::from_be_bytes([body[0], body[1]]);
    let length = u16::from_be_bytes([body[2], body[3]]);
    let body = &body[4..];

    if raw_type & ENTERPRISE_BIT != 0 {
        if body.len() < 4 {
            return Err(DecodeError::Truncated {
                context: "IPFIX enterprise number",
                available: body.len(),
            });
        }
        let enterprise = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        Ok((
            TemplateField::enterprise(enterprise, raw_type & !ENTERPRISE_BIT, length),
            &body[4..],
        ))
    } else {
        Ok((TemplateField::new(raw_type, length), body))
    }
}

fn parse_template_set(
    mut body: &[u8],
    exporter: &ExporterKey,
    cache: &TemplateCache,
) -> Result<usize, DecodeError> {
    let mut learned = 0usize;

    while body.len() >= 4 {
        let template_id = u16::from_be_bytes([body[0], body[1]]);
        if template_id == 0 {
            break;
        }
        let field_count = u16::from_be_bytes([body[2], body[3]]) as usize;
        body = &body[4..];

        // field_count == 0 is a template withdrawal; nothing to store.
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let (field, rest) = parse_field_specifier(body)?;
            fields.push(field);
            body = rest;
        }
        if !fields.is_empty() {
            cache.insert(*exporter, Template::data(template_id, fields));
            learned += 1;
        }
    }

    Ok(learned)
}

/// `(template_id, field_count, scope_field_count, specifiers...)` where the
/// first `scope_field_count` specifiers are the scope (RFC 7011 §3.4.2.2).
fn parse_options_template_set(
    mut body: &[u8],
    exporter: &ExporterKey,
    cache: &TemplateCache,
) -> Result<usize, DecodeError> {
    let mut learned = 0usize;

    while body.len() >= 6 {
        let template_id = u16::from_be_bytes([body[0], body[1]]);
        if template_id == 0 {
            break;
        }
        let field_count = u16::from_be_bytes([body[2], body[3]]) as usize;
        let scope_count = u16::from_be_bytes([body[4], body[5]]) as usize;
        body = &body[6..];

        let mut scope_fields = Vec::with_capacity(scope_count);
        for _ in 0..scope_count.min(field_count) {
            let (field, rest) = parse_field_specifier(body)?;
            scope_fields.push(field);
            body = rest;
        }
        let mut option_fields = Vec::with_capacity(field_count.saturating_sub(scope_count));
        for _ in 0..field_count.saturating_sub(scope_count) {
            let (field, rest) = parse_field_specifier(body)?;
            option_fields.push(field);
            body = rest;
        }

        if !scope_fields.is_empty() || !option_fields.is_empty() {
            cache.insert(
                *exporter,
                Template::options(template_id, scope_fields, option_fields),
            );
            learned += 1;
        }
    }

    Ok(learned)
}
