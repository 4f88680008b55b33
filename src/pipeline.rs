//! Listener pipes: scheme dispatch and the per-datagram path.
//!
//! A pipe is what a receiver worker invokes for each datagram: route by
//! scheme to the right decoder, hand the decoded packet to the producer,
//! format and send every resulting message, commit the batch. Everything in
//! here is synchronous; faults are isolated one layer up, in the worker's
//! panic guard.

use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

use crate::decoders::{ipfix, sflow, v5, v9, wire_version, DecodeError, IntermediateMessage};
use crate::format::{FormatError, Formatter};
use crate::producer::{FlowProducer, ProduceArgs, ProduceError};
use crate::receiver::{Datagram, DecodeFn};
use crate::sampling::SamplingRegistry;
use crate::templates::TemplateCache;
use crate::transport::{Transport, TransportError};

/// Everything that can go wrong for one datagram. All of it is local:
/// logged through the muter, counted, never fatal.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Produce(#[from] ProduceError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A decoder panic caught at the worker boundary, with the stack it
    /// left behind. The datagram is dropped; the worker continues.
    #[error("decoder panic: {message}")]
    Panic { message: String, backtrace: String },
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Decode(err) => err.kind(),
            PipelineError::Produce(_) => "produce",
            PipelineError::Format(_) => "format",
            PipelineError::Transport(_) => "transport",
            PipelineError::Panic { .. } => "panic",
        }
    }

    /// Errors that are expected under normal operation and should only
    /// ever reach the logs through the muter.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            PipelineError::Decode(DecodeError::TemplateNotFound { .. })
                | PipelineError::Panic { .. }
        )
    }
}

/// Listener scheme from the `--listen` URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    SFlow,
    NetFlow,
    /// Auto-detect between the NetFlow family and sFlow from the first
    /// header bytes.
    Flow,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::SFlow => "sflow",
            Scheme::NetFlow => "netflow",
            Scheme::Flow => "flow",
        }
    }
}

impl FromStr for Scheme {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sflow" => Ok(Scheme::SFlow),
            "netflow" => Ok(Scheme::NetFlow),
            "flow" => Ok(Scheme::Flow),
            _ => Err(()),
        }
    }
}

/// Shared state and collaborators a pipe runs against. Constructed once in
/// the supervisor and cloned per listener; no hidden globals, so several
/// independent pipelines can coexist in one process.
#[derive(Clone)]
pub struct PipeConfig {
    pub templates: Arc<TemplateCache>,
    pub sampling: Arc<SamplingRegistry>,
    pub producer: Arc<dyn FlowProducer>,
    pub formatter: Arc<dyn Formatter>,
    pub transport: Arc<dyn Transport>,
}

pub struct FlowPipe {
    scheme: Scheme,
    cfg: PipeConfig,
}

impl FlowPipe {
    pub fn new(scheme: Scheme, cfg: PipeConfig) -> Self {
        Self { scheme, cfg }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The full per-datagram path.
    pub fn decode(&self, datagram: &Datagram) -> Result<(), PipelineError> {
        let message = self.decode_message(datagram)?;
        let args = ProduceArgs {
            src: datagram.src,
            time_received_ns: datagram.time_received_ns,
        };

        let messages = self.cfg.producer.produce(message, &args)?;
        crate::metrics::record_flows_produced(self.scheme.as_str(), messages.len() as u64);

        let mut send_error = None;
        for message in &messages {
            let formatted = self.cfg.formatter.format(message)?;
            match self.cfg.transport.send(&formatted.key, &formatted.payload) {
                Ok(()) => crate::metrics::record_transport_send(),
                Err(err) => {
                    crate::metrics::record_transport_error();
                    send_error = Some(err);
                }
            }
        }
        self.cfg.producer.commit(messages);

        match send_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn decode_message(&self, datagram: &Datagram) -> Result<IntermediateMessage, DecodeError> {
        match self.scheme {
            Scheme::SFlow => Ok(IntermediateMessage::SFlow(sflow::decode(
                &datagram.payload,
            )?)),
            Scheme::NetFlow => self.decode_netflow(datagram),
            Scheme::Flow => match wire_version(&datagram.payload) {
                // NetFlow headers lead with a u16 version; an sFlow
                // datagram's u32 version makes the first u16 read zero.
                Some(5) | Some(9) | Some(10) => self.decode_netflow(datagram),
                _ => Ok(IntermediateMessage::SFlow(sflow::decode(
                    &datagram.payload,
                )?)),
            },
        }
    }

    fn decode_netflow(&self, datagram: &Datagram) -> Result<IntermediateMessage, DecodeError> {
        let version = wire_version(&datagram.payload).ok_or(DecodeError::Truncated {
            context: "NetFlow version",
            available: datagram.payload.len(),
        })?;
        match version {
            5 => Ok(IntermediateMessage::V5(v5::decode(&datagram.payload)?)),
            9 => Ok(IntermediateMessage::V9(v9::decode(
                &datagram.payload,
                datagram.src.ip(),
                &self.cfg.templates,
                &self.cfg.sampling,
            )?)),
            10 => Ok(IntermediateMessage::IPFix(ipfix::decode(
                &datagram.payload,
                datagram.src.ip(),
                &self.cfg.templates,
                &self.cfg.sampling,
            )?)),
            version => Err(DecodeError::UnsupportedVersion { version }),
        }
    }
}

/// Wraps a pipe into the receiver's decode entry point with per-scheme
/// decode/error accounting. Panic containment is the worker's part of the
/// composition; this is the metrics layer.
pub fn build_decode_fn(pipe: Arc<FlowPipe>) -> DecodeFn {
    let scheme = pipe.scheme().as_str();
    Arc::new(move |datagram: &Datagram| match pipe.decode(datagram) {
        Ok(()) => {
            crate::metrics::record_decoded(scheme);
            Ok(())
        }
        Err(err) => {
            crate::metrics::record_decode_error(scheme, err.kind());
            Err(err)
        }
    })
}
