//! Text formatter: space-separated `field=value` pairs in mapping order.

use std::sync::Arc;

use serde_json::Value;

use crate::format::{FieldMapper, FormatError, FormattedMessage, Formatter};
use crate::producer::ProducerMessage;

pub struct TextFormatter {
    mapper: Arc<FieldMapper>,
}

impl TextFormatter {
    pub fn new(mapper: Arc<FieldMapper>) -> Self {
        Self { mapper }
    }
}

impl Formatter for TextFormatter {
    fn format(&self, msg: &ProducerMessage) -> Result<FormattedMessage, FormatError> {
        match msg {
            ProducerMessage::Flow(flow) => {
                let fields = self.mapper.project(flow)?;
                let mut line = String::new();
                for (index, (name, value)) in fields.iter().enumerate() {
                    if index > 0 {
                        line.push(' ');
                    }
                    line.push_str(name);
                    line.push('=');
                    line.push_str(&render(value));
                }
                Ok(FormattedMessage {
                    key: self.mapper.key(flow)?,
                    payload: line.into_bytes(),
                })
            }
            ProducerMessage::Raw(raw) => {
                let line = format!(
                    "{} {}: {}",
                    raw.time_received_ns,
                    raw.src,
                    serde_json::to_string(&raw.message)?
                );
                Ok(FormattedMessage {
                    key: Vec::new(),
                    payload: line.into_bytes(),
                })
            }
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
