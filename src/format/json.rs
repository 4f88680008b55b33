//! JSON formatter: one object per message, newline-friendly.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::format::{FieldMapper, FormatError, FormattedMessage, Formatter};
use crate::producer::ProducerMessage;

pub struct JsonFormatter {
    mapper: Arc<FieldMapper>,
}

impl JsonFormatter {
    pub fn new(mapper: Arc<FieldMapper>) -> Self {
        Self { mapper }
    }
}

impl Formatter for JsonFormatter {
    fn format(&self, msg: &ProducerMessage) -> Result<FormattedMessage, FormatError> {
        match msg {
            ProducerMessage::Flow(flow) => {
                let mut object = Map::new();
                for (name, value) in self.mapper.project(flow)? {
                    object.insert(name, value);
                }
                Ok(FormattedMessage {
                    key: self.mapper.key(flow)?,
                    payload: serde_json::to_vec(&Value::Object(object))?,
                })
            }
            ProducerMessage::Raw(raw) => Ok(FormattedMessage {
                key: Vec::new(),
                payload: serde_json::to_vec(raw)?,
            }),
        }
    }
}
