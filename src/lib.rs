//! # flowline
//!
//! A collector for network-flow telemetry. Routers and switches export
//! sampled flow summaries over UDP (NetFlow v5, NetFlow v9, IPFIX, sFlow v5);
//! flowline ingests them from many exporters concurrently, decodes each
//! protocol, normalises the records into a single [`FlowMessage`], enriches
//! them (GeoIP country/ASN, reverse DNS of the exporter) and hands them to a
//! pluggable formatter + transport pair.
//!
//! The ingest pipeline is the core of the crate:
//!
//! 1. [`receiver::UdpReceiver`] — reuse-port socket groups feeding a bounded
//!    worker queue with explicit drop accounting.
//! 2. [`templates::TemplateCache`] — per-exporter store of v9/IPFIX
//!    templates; data records cannot be decoded before their template.
//! 3. [`sampling::SamplingRegistry`] — per-exporter sampling rates learned
//!    from Options Data records.
//! 4. [`decoders`] — the four wire-format parsers and the intermediate
//!    records they produce.
//! 5. [`producer`] — normalisation of all four formats into [`FlowMessage`].
//!
//! Everything else (formatters, transports, the HTTP surface) is glue around
//! that pipeline and kept behind narrow traits.

pub mod config;
pub mod decoders;
pub mod enrich;
pub mod format;
pub mod http;
pub mod metrics;
pub mod mute;
pub mod pipeline;
pub mod producer;
pub mod protocol;
pub mod receiver;
pub mod sampling;
pub mod templates;
pub mod transport;

pub use decoders::{DecodeError, IntermediateMessage};
pub use mute::BatchMute;
pub use pipeline::{FlowPipe, PipeConfig, PipelineError};
pub use producer::message::FlowMessage;
pub use receiver::{UdpReceiver, UdpReceiverConfig};
pub use sampling::SamplingRegistry;
pub use templates::{ExporterKey, Template, TemplateCache};
