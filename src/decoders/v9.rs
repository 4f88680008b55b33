//! NetFlow v9.
//!
//! A datagram is a 20-byte header followed by FlowSets. Template FlowSets
//! (id 0) and Options Template FlowSets (id 1) are written through to the
//! shared [`TemplateCache`] under the datagram's [`ExporterKey`]; Data
//! FlowSets (id >= 256) are decoded against it. Within one datagram a
//! template that precedes a data set using it is honoured immediately.
//!
//! On a template miss the remainder of the datagram is dropped: later sets
//! may depend on templates the collector has not seen either, and the
//! exporter re-sends templates periodically.
//!
//! References:
//! - <https://www.ietf.org/rfc/rfc3954.txt>

use nom_derive::*;
use serde::Serialize;

use std::net::IpAddr;

use crate::decoders::fields::{parse_data_set, parse_options_set};
use crate::decoders::{DecodeError, FlowRecord};
use crate::sampling::SamplingRegistry;
use crate::templates::{ExporterKey, Template, TemplateCache, TemplateField};

const TEMPLATE_SET_ID: u16 = 0;
const OPTIONS_TEMPLATE_SET_ID: u16 = 1;
const DATA_SET_MIN_ID: u16 = 256;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Nom)]
pub struct V9Header {
    /// The version of NetFlow records exported in this packet; 9 here
    pub version: u16,
    /// Number of FlowSet records (both template and data) in this packet
    pub count: u16,
    /// Time in milliseconds since this device was first booted
    pub sys_uptime: u32,
    /// Seconds since 0000 UTC 1970
    pub unix_secs: u32,
    /// Incremental sequence counter of all export packets sent by this
    /// export device
    pub sequence_number: u32,
    /// Source ID: distinguishes export streams from one device. Combined
    /// with the source address it forms the exporter identity.
    pub source_id: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct V9Packet {
    pub header: V9Header,
    /// Flows decoded from data sets, in wire order.
    pub records: Vec<FlowRecord>,
    /// Templates written to the cache while decoding this datagram.
    pub templates_learned: usize,
}

/// Decodes one NetFlow v9 datagram from `addr`.
pub fn decode(
    payload: &[u8],
    addr: IpAddr,
    templates: &TemplateCache,
    sampling: &SamplingRegistry,
) -> Result<V9Packet, DecodeError> {
    let (mut remaining, header) = V9Header::parse(payload).map_err(|_| DecodeError::Truncated {
        context: "NetFlow v9 header",
        available: payload.len(),
    })?;

    if header.version != 9 {
        return Err(DecodeError::UnsupportedVersion {
            version: header.version,
        });
    }

    let exporter = ExporterKey::new(addr, header.source_id);
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
                context: "NetFlow v9 flow set",
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

    Ok(V9Packet {
        header,
        records,
        templates_learned,
    })
}

/// One or more `(template_id, field_count, fields...)` entries.
fn parse_template_set(
    mut body: &[u8],
    exporter: &ExporterKey,
    cache: &TemplateCache,
) -> Result<usize, DecodeError> {
    let mut learned = 0usize;

    while body.len() >= 4 {
        let template_id = u16::from_be_bytes([body[0], body[1]]);
        if template_id == 0 {
            // Zero padding at the end of the set.
            break;
        }
        let field_count = u16::from_be_bytes([body[2], body[3]]) as usize;
        body = &body[4..];

        if body.len() < field_count * 4 {
            return Err(DecodeError::Truncated {
                context: "NetFlow v9 template fields",
                available: body.len(),
            });
        }
        let mut fields = Vec::with_capacity(field_count);
        for chunk in body[..field_count * 4].chunks_exact(4) {
            fields.push(TemplateField::new(
                u16::from_be_bytes([chunk[0], chunk[1]]),
                u16::from_be_bytes([chunk[2], chunk[3]]),
            ));
        }
        body = &body[field_count * 4..];

        cache.insert(*exporter, Template::data(template_id, fields));
        learned += 1;
    }

    Ok(learned)
}

/// One or more `(template_id, scope_length, option_length, scopes, options)`
/// entries; lengths are in bytes (RFC 3954 §6.1).
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
        let scope_bytes = u16::from_be_bytes([body[2], body[3]]) as usize;
        let option_bytes = u16::from_be_bytes([body[4], body[5]]) as usize;
        body = &body[6..];

        if body.len() < scope_bytes + option_bytes {
            return Err(DecodeError::Truncated {
                context: "NetFlow v9 options template fields",
                available: body.len(),
            });
        }

        let mut scope_fields = Vec::with_capacity(scope_bytes / 4);
        for chunk in body[..scope_bytes].chunks_exact(4) {
            scope_fields.push(TemplateField::new(
                u16::from_be_bytes([chunk[0], chunk[1]]),
                u16::from_be_bytes([chunk[2], chunk[3]]),
            ));
        }
        let mut option_fields = Vec::with_capacity(option_bytes / 4);
        for chunk in body[scope_bytes..scope_bytes + option_bytes].chunks_exact(4) {
            option_fields.push(TemplateField::new(
                u16::from_be_bytes([chunk[0], chunk[1]]),
                u16::from_be_bytes([chunk[2], chunk[3]]),
            ));
        }
        body = &body[scope_bytes + option_bytes..];

        cache.insert(
            *exporter,
            Template::options(template_id, scope_fields, option_fields),
        );
        learned += 1;
    }

    Ok(learned)
}
