//! Pluggable serialisation of producer messages.
//!
//! A formatter turns one [`ProducerMessage`] into `(key, payload)` bytes;
//! the transport never looks inside either. Field selection, renaming and
//! rendering are driven by the mapping file through [`FieldMapper`].

pub mod mapping;

mod binary;
mod json;
mod text;

pub use binary::BinaryFormatter;
pub use json::JsonFormatter;
pub use text::TextFormatter;

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::format::mapping::{MappingConfig, RendererKind, UnknownFieldMapping};
use crate::producer::message::FlowMessage;
use crate::producer::ProducerMessage;
use crate::protocol::ProtocolTypes;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("json serialisation failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary serialisation failed: {0}")]
    Binary(#[from] bincode::Error),
}

/// One formatted message: opaque payload plus a partition/grouping key
/// (empty when the mapping declares no key fields).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedMessage {
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

pub trait Formatter: Send + Sync {
    fn format(&self, msg: &ProducerMessage) -> Result<FormattedMessage, FormatError>;
}

/// Formatter registry, mirroring the `--format` flag values.
pub fn find_format(name: &str, mapper: Arc<FieldMapper>) -> Option<Arc<dyn Formatter>> {
    match name {
        "json" => Some(Arc::new(JsonFormatter::new(mapper))),
        "text" => Some(Arc::new(TextFormatter::new(mapper))),
        "bin" => Some(Arc::new(BinaryFormatter::new(mapper))),
        _ => None,
    }
}

pub fn formats() -> &'static [&'static str] {
    &["json", "text", "bin"]
}

/// Canonical field order when the mapping file does not narrow it.
const DEFAULT_FIELDS: &[&str] = &[
    "type",
    "time_received_ns",
    "sequence_num",
    "sampling_rate",
    "sampler_address",
    "sampler_hostname",
    "time_flow_start_ns",
    "time_flow_end_ns",
    "bytes",
    "packets",
    "src_addr",
    "dst_addr",
    "etype",
    "proto",
    "src_port",
    "dst_port",
    "in_if",
    "out_if",
    "tcp_flags",
    "src_as",
    "dst_as",
    "src_country",
    "dst_country",
    "src_as_org",
    "dst_as_org",
    "as_path",
    "lms_target_index",
    "layer_stack",
];

/// Applies the mapping file to canonical flows: ordered field selection,
/// renames, renderers, array flags, unknown-field surfacing and the
/// transport key.
pub struct FieldMapper {
    fields: Vec<String>,
    key_fields: Vec<String>,
    rename: HashMap<String, String>,
    arrays: HashSet<String>,
    render: HashMap<String, RendererKind>,
    unknown: Vec<UnknownFieldMapping>,
}

impl Default for FieldMapper {
    fn default() -> Self {
        Self::new(MappingConfig::default())
    }
}

impl FieldMapper {
    pub fn new(cfg: MappingConfig) -> Self {
        let fields = if cfg.fields.is_empty() {
            DEFAULT_FIELDS.iter().map(|s| s.to_string()).collect()
        } else {
            cfg.fields
        };

        // Addresses render as text unless the mapping overrides them.
        let mut render = cfg.render;
        for addr_field in ["src_addr", "dst_addr", "sampler_address"] {
            render
                .entry(addr_field.to_string())
                .or_insert(RendererKind::Ip);
        }

        Self {
            fields,
            key_fields: cfg.key,
            rename: cfg.rename,
            arrays: cfg.array.into_iter().collect(),
            render,
            unknown: cfg.unknown,
        }
    }

    /// Ordered `(output_name, rendered_value)` pairs for one flow.
    pub fn project(&self, flow: &FlowMessage) -> Result<Vec<(String, Value)>, FormatError> {
        let Value::Object(raw) = serde_json::to_value(flow)? else {
            unreachable!("FlowMessage serialises to an object");
        };

        let mut out = Vec::with_capacity(self.fields.len() + self.unknown.len());
        for field in &self.fields {
            let Some(value) = raw.get(field.as_str()) else {
                continue;
            };
            let rendered = self.render_value(field, value.clone());
            out.push((self.output_name(field), rendered));
        }

        for unknown in &self.unknown {
            let Some(bytes) = flow.unknown_fields.get(&unknown.field) else {
                continue;
            };
            let value = if unknown.array {
                Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
            } else {
                Value::String(hex_string(bytes))
            };
            out.push((unknown.name.clone(), value));
        }

        Ok(out)
    }

    /// FNV-1a hash over the rendered key fields; empty without key fields.
    pub fn key(&self, flow: &FlowMessage) -> Result<Vec<u8>, FormatError> {
        if self.key_fields.is_empty() {
            return Ok(Vec::new());
        }
        let Value::Object(raw) = serde_json::to_value(flow)? else {
            unreachable!("FlowMessage serialises to an object");
        };
        let mut hash = 0x811C_9DC5u32;
        for field in &self.key_fields {
            if let Some(value) = raw.get(field.as_str()) {
                let rendered = self.render_value(field, value.clone());
                for byte in rendered.to_string().bytes() {
                    hash ^= u32::from(byte);
                    hash = hash.wrapping_mul(0x0100_0193);
                }
            }
        }
        Ok(hash.to_be_bytes().to_vec())
    }

    fn output_name(&self, field: &str) -> String {
        match self.rename.get(field) {
            Some(renamed) if !renamed.is_empty() => renamed.clone(),
            _ => field.to_string(),
        }
    }

    fn render_value(&self, field: &str, value: Value) -> Value {
        let renderer = self.render.get(field).copied().unwrap_or_default();
        if self.arrays.contains(field) {
            if let Value::Array(items) = value {
                return Value::Array(
                    items
                        .into_iter()
                        .map(|item| apply_renderer(renderer, item))
                        .collect(),
                );
            }
        }
        apply_renderer(renderer, value)
    }
}

fn apply_renderer(renderer: RendererKind, value: Value) -> Value {
    match renderer {
        RendererKind::None => value,
        RendererKind::Ip => match value_bytes(&value) {
            Some(bytes) => match bytes_to_ip(&bytes) {
                Some(ip) => Value::String(ip.to_string()),
                None => Value::String(hex_string(&bytes)),
            },
            None => value,
        },
        RendererKind::Hex => match value_bytes(&value) {
            Some(bytes) => Value::String(hex_string(&bytes)),
            None => value,
        },
        RendererKind::Proto => match value.as_u64() {
            Some(number) => Value::String(ProtocolTypes::from(number as u8).name().to_string()),
            None => value,
        },
    }
}

fn value_bytes(value: &Value) -> Option<Vec<u8>> {
    let Value::Array(items) = value else {
        return None;
    };
    items
        .iter()
        .map(|item| item.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect()
}

fn bytes_to_ip(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => Some(IpAddr::V4(Ipv4Addr::new(
            bytes[0], bytes[1], bytes[2], bytes[3],
        ))),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
