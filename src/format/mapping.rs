//! Mapping file: which fields go out, under what names, rendered how.
//!
//! The YAML document is entirely optional; without one the formatter emits
//! the default field list with default renderers. Unknown wire fields
//! (preserved by the decoders under their numeric ids) only appear in the
//! output when the mapping names them.
//!
//! ```yaml
//! fields: [time_received_ns, src_addr, dst_addr, bytes]
//! key: [sampler_address]
//! rename:
//!   src_addr: source
//! array: [as_path]
//! render:
//!   proto: proto
//! unknown:
//!   - field: 1001
//!     name: vendor_tag
//! ```

use std::collections::HashMap;
use std::io::Read;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RendererKind {
    /// Emit the serialised value as-is.
    #[default]
    None,
    /// Render 4/16 raw bytes as a textual IP address.
    Ip,
    /// Render raw bytes as a lowercase hex string.
    Hex,
    /// Render a protocol number by its IANA name.
    Proto,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnknownFieldMapping {
    /// Wire field number as preserved by the decoder.
    pub field: u16,
    /// Output name for the field.
    pub name: String,
    #[serde(default)]
    pub array: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingConfig {
    /// Ordered output field selection; empty means the default list.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Fields hashed into the transport key.
    #[serde(default)]
    pub key: Vec<String>,
    /// Output-name renames, `field -> new_name`.
    #[serde(default)]
    pub rename: HashMap<String, String>,
    /// Fields rendered element-wise as arrays.
    #[serde(default)]
    pub array: Vec<String>,
    /// Renderer selection per field.
    #[serde(default)]
    pub render: HashMap<String, RendererKind>,
    /// Unknown wire fields to surface, by number.
    #[serde(default)]
    pub unknown: Vec<UnknownFieldMapping>,
}

impl MappingConfig {
    pub fn from_yaml(reader: impl Read) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_reader(reader)
    }
}
