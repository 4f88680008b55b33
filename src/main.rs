use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowline::config::ListenerSpec;
use flowline::enrich::dns::{DnsCache, HickoryResolver};
use flowline::enrich::geoip::GeoIp;
use flowline::enrich::Enricher;
use flowline::format::mapping::MappingConfig;
use flowline::format::{find_format, formats, FieldMapper};
use flowline::http::AppState;
use flowline::mute::BatchMute;
use flowline::pipeline::{build_decode_fn, FlowPipe, PipeConfig};
use flowline::producer::{FlowProducer, RawProducer, SampleProducer};
use flowline::receiver::UdpReceiver;
use flowline::sampling::SamplingRegistry;
use flowline::templates::TemplateCache;
use flowline::transport::{find_transport, transports, Transport, TransportError};

const DNS_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);
const HTTP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "flowline", version, about = "NetFlow/IPFIX/sFlow collector")]
struct Opts {
    /// Comma-separated listen addresses
    /// (scheme://host:port?count=N&workers=M&blocking=B&queue_size=K)
    #[arg(long, default_value = "sflow://:6343,netflow://:2055")]
    listen: String,

    /// Producer method (sample or raw)
    #[arg(long, default_value = "sample")]
    produce: String,

    /// Output format
    #[arg(long, default_value = "json")]
    format: String,

    /// Output transport
    #[arg(long, default_value = "file")]
    transport: String,

    /// File transport destination (stdout when unset)
    #[arg(long = "transport.file.path")]
    transport_file: Option<PathBuf>,

    /// Maximum errors per muting window
    #[arg(long = "err.cnt", default_value_t = 10)]
    err_cnt: u64,

    /// Muting window in seconds
    #[arg(long = "err.int", default_value_t = 10)]
    err_int: u64,

    /// HTTP server address for /metrics and /__health (empty disables)
    #[arg(long, default_value = ":8080")]
    addr: String,

    /// YAML mapping file for custom output fields
    #[arg(long)]
    mapping: Option<PathBuf>,

    /// Per-exporter template cache cap (unbounded when unset)
    #[arg(long = "templates.max")]
    templates_max: Option<std::num::NonZeroUsize>,

    /// GeoIP country ranges, IPv4 (CSV: intlow,inthigh,cc)
    #[arg(long = "geoip.cc")]
    geoip_cc: Option<PathBuf>,

    /// GeoIP country ranges, IPv6
    #[arg(long = "geoip.cc6")]
    geoip_cc6: Option<PathBuf>,

    /// GeoIP ASN ranges, IPv4 (CSV: intlow,inthigh,asn,org)
    #[arg(long = "geoip.asn")]
    geoip_asn: Option<PathBuf>,

    /// GeoIP ASN ranges, IPv6
    #[arg(long = "geoip.asn6")]
    geoip_asn6: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&opts.log_level)),
        )
        .init();

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("installing the metrics recorder")?;

    let geoip = GeoIp::load(
        opts.geoip_cc.as_deref(),
        opts.geoip_cc6.as_deref(),
        opts.geoip_asn.as_deref(),
        opts.geoip_asn6.as_deref(),
    )
    .context("loading GeoIP databases")?;
    if geoip.entry_count() > 0 {
        info!(entries = geoip.entry_count(), "GeoIP tables loaded");
    }

    let dns = DnsCache::new(Arc::new(HickoryResolver::new()));
    let dns_refresher = dns.start_refresher(DNS_REFRESH_INTERVAL);

    let templates = Arc::new(match opts.templates_max {
        Some(cap) => TemplateCache::with_capacity(cap),
        None => TemplateCache::new(),
    });
    let sampling = Arc::new(SamplingRegistry::new());
    let enricher = Arc::new(Enricher::new(geoip, dns));

    let producer: Arc<dyn FlowProducer> = match opts.produce.as_str() {
        "sample" => Arc::new(SampleProducer::new(Arc::clone(&sampling), enricher)),
        "raw" => Arc::new(RawProducer),
        other => bail!("producer {other} does not exist (sample, raw)"),
    };

    let mapper = match &opts.mapping {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("opening mapping file {}", path.display()))?;
            let cfg = MappingConfig::from_yaml(file)
                .with_context(|| format!("parsing mapping file {}", path.display()))?;
            Arc::new(FieldMapper::new(cfg))
        }
        None => Arc::new(FieldMapper::default()),
    };

    let Some(formatter) = find_format(&opts.format, Arc::clone(&mapper)) else {
        bail!("format {} does not exist ({})", opts.format, formats().join(", "));
    };
    let Some(transport) = find_transport(&opts.transport, opts.transport_file.as_deref()) else {
        bail!(
            "transport {} does not exist ({})",
            opts.transport,
            transports().join(", ")
        );
    };

    let pipe_cfg = PipeConfig {
        templates: Arc::clone(&templates),
        sampling: Arc::clone(&sampling),
        producer: Arc::clone(&producer),
        formatter,
        transport: Arc::clone(&transport),
    };

    let shutdown = CancellationToken::new();
    let collecting = Arc::new(AtomicBool::new(false));

    let mut receivers: Vec<Arc<UdpReceiver>> = Vec::new();
    let mut drains: Vec<JoinHandle<()>> = Vec::new();

    let specs = ListenerSpec::parse_list(&opts.listen).context("parsing listen addresses")?;
    if specs.is_empty() {
        bail!("no listen addresses configured");
    }
    for spec in specs {
        let receiver = Arc::new(
            UdpReceiver::new(spec.receiver.clone())
                .with_context(|| format!("configuring {}://{}:{}", spec.scheme.as_str(), spec.host, spec.port))?,
        );
        let pipe = Arc::new(FlowPipe::new(spec.scheme, pipe_cfg.clone()));
        receiver
            .start(&spec.host, spec.port, build_decode_fn(pipe))
            .with_context(|| format!("starting {}://{}:{}", spec.scheme.as_str(), spec.host, spec.port))?;
        info!(
            scheme = spec.scheme.as_str(),
            host = %spec.host,
            port = spec.port,
            sockets = spec.receiver.sockets,
            workers = spec.receiver.workers,
            blocking = spec.receiver.blocking,
            queue_size = spec.receiver.queue_size,
            "collection started"
        );

        let mute = Arc::new(BatchMute::new(
            Duration::from_secs(opts.err_int),
            opts.err_cnt,
        ));
        drains.push(spawn_error_drain(
            Arc::clone(&receiver),
            mute,
            shutdown.clone(),
        ));
        receivers.push(receiver);
    }

    if let Some(errors) = transport.errors() {
        let mute = Arc::new(BatchMute::new(
            Duration::from_secs(opts.err_int),
            opts.err_cnt,
        ));
        drains.push(spawn_transport_drain(errors, mute, shutdown.clone()));
    }

    let http_task = if opts.addr.is_empty() {
        None
    } else {
        let addr = parse_http_addr(&opts.addr)?;
        let state = AppState {
            metrics: Some(metrics_handle),
            collecting: Arc::clone(&collecting),
        };
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = flowline::http::serve(addr, state, token).await {
                warn!(error = %err, "HTTP server error");
            }
        }))
    };

    collecting.store(true, Ordering::SeqCst);
    info!("starting flowline");

    wait_for_signal().await;
    info!("shutting down");
    collecting.store(false, Ordering::SeqCst);

    for receiver in &receivers {
        receiver.stop().await;
    }
    shutdown.cancel();
    for drain in drains {
        let _ = drain.await;
    }
    producer.close();
    transport.close();
    dns_refresher.abort();

    if let Some(http_task) = http_task {
        let _ = tokio::time::timeout(HTTP_SHUTDOWN_TIMEOUT, http_task).await;
    }

    info!("closed flowline");
    Ok(())
}

/// Routes a receiver's error stream to the logs through the muter.
/// Expected per-datagram noise (template misses, caught panics) is
/// throttled; anything else is logged as-is.
fn spawn_error_drain(
    receiver: Arc<UdpReceiver>,
    mute: Arc<BatchMute>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let errors = receiver.errors();
    tokio::spawn(async move {
        loop {
            let error = tokio::select! {
                _ = shutdown.cancelled() => break,
                error = errors.recv() => match error {
                    Ok(error) => error,
                    Err(_) => break,
                },
            };
            if error.is_expected() {
                let (muted, skipped) = mute.increment();
                if !muted {
                    if skipped > 0 {
                        warn!(error = %error, skipped, "pipeline errors (throttled)");
                    } else {
                        warn!(error = %error, "pipeline error");
                    }
                }
            } else {
                warn!(error = %error, "pipeline error");
            }
        }
    })
}

fn spawn_transport_drain(
    errors: async_channel::Receiver<TransportError>,
    mute: Arc<BatchMute>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let error = tokio::select! {
                _ = shutdown.cancelled() => break,
                error = errors.recv() => match error {
                    Ok(error) => error,
                    Err(_) => break,
                },
            };
            let (muted, skipped) = mute.increment();
            if !muted {
                if skipped > 0 {
                    warn!(error = %error, skipped, "transport errors (throttled)");
                } else {
                    warn!(error = %error, "transport error");
                }
            }
        }
    })
}

fn parse_http_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .with_context(|| format!("invalid HTTP address {addr:?}"))
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
