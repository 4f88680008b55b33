//! Length-delimited binary formatter: a varint length prefix followed by
//! the bincode encoding of the message.

use std::sync::Arc;

use crate::format::{FieldMapper, FormatError, FormattedMessage, Formatter};
use crate::producer::ProducerMessage;

pub struct BinaryFormatter {
    mapper: Arc<FieldMapper>,
}

impl BinaryFormatter {
    pub fn new(mapper: Arc<FieldMapper>) -> Self {
        Self { mapper }
    }
}

impl Formatter for BinaryFormatter {
    fn format(&self, msg: &ProducerMessage) -> Result<FormattedMessage, FormatError> {
        let (key, body) = match msg {
            ProducerMessage::Flow(flow) => {
                (self.mapper.key(flow)?, bincode::serialize(flow.as_ref())?)
            }
            ProducerMessage::Raw(raw) => (Vec::new(), bincode::serialize(raw)?),
        };

        let mut payload = Vec::with_capacity(body.len() + 2);
        write_varint(&mut payload, body.len() as u64);
        payload.extend_from_slice(&body);
        Ok(FormattedMessage { key, payload })
    }
}

/// LEB128 varint, as used by length-delimited protobuf streams.
fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            buf.push(byte | 0x80);
        } else {
            buf.push(byte);
            break;
        }
    }
}
