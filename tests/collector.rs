//! End-to-end collector tests: datagrams in through a bound socket, JSON
//! lines out through the transport.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use flowline::decoders::fields::{FLOW_SAMPLER_ID, IN_BYTES, SAMPLING_INTERVAL};
use flowline::enrich::dns::DnsCache;
use flowline::enrich::geoip::GeoIp;
use flowline::enrich::Enricher;
use flowline::format::{FieldMapper, JsonFormatter};
use flowline::pipeline::{build_decode_fn, FlowPipe, PipeConfig, Scheme};
use flowline::producer::SampleProducer;
use flowline::receiver::{unix_now_ns, Datagram, UdpReceiver, UdpReceiverConfig};
use flowline::sampling::SamplingRegistry;
use flowline::templates::TemplateCache;
use flowline::transport::{FileTransport, Transport, TransportError};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn json_lines(&self) -> Vec<serde_json::Value> {
        let bytes = self.0.lock();
        String::from_utf8(bytes.clone())
            .unwrap()
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

/// File transport plus a send counter the tests can wait on (the file
/// transport itself buffers until close).
struct CountingTransport {
    inner: FileTransport,
    sends: AtomicUsize,
}

impl CountingTransport {
    fn new(output: SharedBuf) -> Self {
        Self {
            inner: FileTransport::new(Box::new(output)),
            sends: AtomicUsize::new(0),
        }
    }

    fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

impl Transport for CountingTransport {
    fn send(&self, key: &[u8], payload: &[u8]) -> Result<(), TransportError> {
        self.inner.send(key, payload)?;
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.inner.close();
    }
}

struct Harness {
    pipe: Arc<FlowPipe>,
    transport: Arc<CountingTransport>,
    output: SharedBuf,
}

impl Harness {
    fn new(scheme: Scheme) -> Self {
        let output = SharedBuf::default();
        let transport = Arc::new(CountingTransport::new(output.clone()));
        let sampling = Arc::new(SamplingRegistry::new());
        let enricher = Arc::new(Enricher::new(GeoIp::empty(), DnsCache::disconnected()));
        let cfg = PipeConfig {
            templates: Arc::new(TemplateCache::new()),
            sampling: Arc::clone(&sampling),
            producer: Arc::new(SampleProducer::new(sampling, enricher)),
            formatter: Arc::new(JsonFormatter::new(Arc::new(FieldMapper::default()))),
            transport: Arc::clone(&transport) as Arc<dyn Transport>,
        };
        Self {
            pipe: Arc::new(FlowPipe::new(scheme, cfg)),
            transport,
            output,
        }
    }

    async fn wait_for_sends(&self, expected: usize) {
        for _ in 0..200 {
            if self.transport.sends() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting for {expected} sends (saw {})",
            self.transport.sends()
        );
    }
}

fn datagram(payload: Vec<u8>) -> Datagram {
    Datagram {
        payload,
        src: "10.0.0.1:2055".parse().unwrap(),
        time_received_ns: unix_now_ns(),
    }
}

/// The six-record NetFlow v5 export used across the suite.
const V5_FIXTURE: &str = concat!(
    "00050006 0082c348 5bcdba1b 05976dc7 0000643d 08080000",
    "0a800279 0a800201 00000000 00090002 00000005 0000024e",
    "00829b8c 00829b90 1f90b918 001b0600 00000000 00000000",
    "0a800277 0a810201 00000000 00070001 00000002 00000094",
    "008295a9 00829afb 1f90c12c 00120600 00000000 00000000",
    "0a810201 0a800277 00000000 00010007 00000003 000000c2",
    "008295a9 00829afc c12c1f90 00160600 00000000 00000000",
    "0a800201 0a800279 00000000 00020009 00000005 000001f1",
    "00829b8c 00829b8f b9181f90 001b0600 00000000 00000000",
    "0a800201 0a800279 00000000 00020009 00000005 0000022e",
    "00829b90 00829b9d b91a1f90 001b0600 00000000 00000000",
    "0a800279 0a800201 00000000 00090002 00000005 00000bac",
    "00829b90 00829b9d 1f90b91a 001b0600 00000000 00000000",
);

fn v5_fixture() -> Vec<u8> {
    hex::decode(V5_FIXTURE.replace(' ', "")).unwrap()
}

fn v9_header(count: u16) -> Vec<u8> {
    let mut h = Vec::new();
    h.extend(9u16.to_be_bytes());
    h.extend(count.to_be_bytes());
    h.extend(60_000u32.to_be_bytes());
    h.extend(1_700_000_000u32.to_be_bytes());
    h.extend(1u32.to_be_bytes());
    h.extend(0u32.to_be_bytes());
    h
}

#[tokio::test]
async fn v5_six_record_packet_end_to_end() {
    let harness = Harness::new(Scheme::NetFlow);

    let receiver = Arc::new(
        UdpReceiver::new(UdpReceiverConfig {
            sockets: 1,
            workers: 2,
            queue_size: 64,
            blocking: false,
        })
        .unwrap(),
    );
    receiver
        .start("127.0.0.1", 0, build_decode_fn(Arc::clone(&harness.pipe)))
        .unwrap();
    let target = receiver.local_addr().unwrap();

    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(&v5_fixture(), target).await.unwrap();

    harness.wait_for_sends(6).await;
    receiver.stop().await;
    assert!(receiver.queue_is_empty());
    harness.transport.close();

    let lines = harness.output.json_lines();
    assert_eq!(lines.len(), 6);

    let first = &lines[0];
    assert_eq!(first["type"], "netflow_v5");
    assert_eq!(first["in_if"], 9);
    assert_eq!(first["src_port"], 8080);
    assert_eq!(first["dst_port"], 0xB918);
    assert_eq!(first["src_addr"], "10.128.2.121");
    assert_eq!(first["sampler_address"], "127.0.0.1");
    assert_eq!(first["src_country"], "??");
    assert_eq!(
        first["as_path"],
        serde_json::json!([0, 0, 0]),
        "empty path is synthesised even without AS data"
    );
}

#[tokio::test]
async fn sampling_rate_scales_flows_end_to_end() {
    let harness = Harness::new(Scheme::NetFlow);

    // Options template 260: scope System(4), option samplingInterval(4),
    // then an options data record announcing rate 1024 for the exporter
    // default sampler.
    let mut options = v9_header(2);
    options.extend(1u16.to_be_bytes());
    options.extend(20u16.to_be_bytes());
    options.extend(260u16.to_be_bytes());
    options.extend(4u16.to_be_bytes());
    options.extend(4u16.to_be_bytes());
    options.extend(1u16.to_be_bytes());
    options.extend(4u16.to_be_bytes());
    options.extend(SAMPLING_INTERVAL.to_be_bytes());
    options.extend(4u16.to_be_bytes());
    options.extend([0u8, 0]);
    options.extend(260u16.to_be_bytes());
    options.extend(12u16.to_be_bytes());
    options.extend(0u32.to_be_bytes());
    options.extend(1024u32.to_be_bytes());
    harness.pipe.decode(&datagram(options)).unwrap();

    // Data template 256: octet count + sampler id.
    let mut template = v9_header(1);
    template.extend(0u16.to_be_bytes());
    template.extend(16u16.to_be_bytes());
    template.extend(256u16.to_be_bytes());
    template.extend(2u16.to_be_bytes());
    template.extend(IN_BYTES.to_be_bytes());
    template.extend(4u16.to_be_bytes());
    template.extend(FLOW_SAMPLER_ID.to_be_bytes());
    template.extend(2u16.to_be_bytes());
    harness.pipe.decode(&datagram(template)).unwrap();

    // Two data records; both samplers resolve through the exporter default
    // entry learned above.
    let mut data = v9_header(1);
    data.extend(256u16.to_be_bytes());
    data.extend(16u16.to_be_bytes());
    data.extend(500u32.to_be_bytes());
    data.extend(0u16.to_be_bytes());
    data.extend(500u32.to_be_bytes());
    data.extend(7u16.to_be_bytes());
    harness.pipe.decode(&datagram(data)).unwrap();

    harness.transport.close();
    let lines = harness.output.json_lines();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["bytes"], 512_000);
    assert_eq!(lines[0]["sampling_rate"], 1024);
    assert_eq!(lines[1]["bytes"], 512_000);
}

#[tokio::test]
async fn template_gating_then_replay_end_to_end() {
    let harness = Harness::new(Scheme::NetFlow);

    let mut data = v9_header(1);
    data.extend(256u16.to_be_bytes());
    data.extend(8u16.to_be_bytes());
    data.extend(7u32.to_be_bytes());

    let err = harness.pipe.decode(&datagram(data.clone())).unwrap_err();
    assert_eq!(err.kind(), "template_not_found");
    assert_eq!(harness.transport.sends(), 0);

    let mut template = v9_header(1);
    template.extend(0u16.to_be_bytes());
    template.extend(12u16.to_be_bytes());
    template.extend(256u16.to_be_bytes());
    template.extend(1u16.to_be_bytes());
    template.extend(IN_BYTES.to_be_bytes());
    template.extend(4u16.to_be_bytes());
    harness.pipe.decode(&datagram(template)).unwrap();

    harness.pipe.decode(&datagram(data)).unwrap();

    harness.transport.close();
    let lines = harness.output.json_lines();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["bytes"], 7);
}

#[tokio::test]
async fn sflow_listener_end_to_end() {
    let harness = Harness::new(Scheme::SFlow);

    // One flow sample with an Ethernet/IPv4/UDP header, rate 512.
    let mut header = Vec::new();
    header.extend([0x02, 0, 0, 0, 0, 1]);
    header.extend([0x02, 0, 0, 0, 0, 2]);
    header.extend(0x0800u16.to_be_bytes());
    header.push(0x45);
    header.push(0);
    header.extend(56u16.to_be_bytes());
    header.extend([0, 0, 0x40, 0]);
    header.push(64);
    header.push(17); // UDP
    header.extend([0, 0]);
    header.extend([203, 0, 113, 5]);
    header.extend([198, 51, 100, 44]);
    header.extend(53u16.to_be_bytes());
    header.extend(33000u16.to_be_bytes());
    header.extend(36u16.to_be_bytes());
    header.extend([0, 0]);

    let mut record = Vec::new();
    record.extend(1u32.to_be_bytes()); // ethernet
    record.extend(90u32.to_be_bytes()); // frame length
    record.extend(0u32.to_be_bytes());
    record.extend((header.len() as u32).to_be_bytes());
    record.extend(&header);

    let mut sample = Vec::new();
    sample.extend(1u32.to_be_bytes());
    sample.extend(7u32.to_be_bytes());
    sample.extend(512u32.to_be_bytes());
    sample.extend(1000u32.to_be_bytes());
    sample.extend(0u32.to_be_bytes());
    sample.extend(10u32.to_be_bytes());
    sample.extend(20u32.to_be_bytes());
    sample.extend(1u32.to_be_bytes());
    sample.extend(1u32.to_be_bytes());
    sample.extend((record.len() as u32).to_be_bytes());
    sample.extend(&record);

    let mut payload = Vec::new();
    payload.extend(5u32.to_be_bytes());
    payload.extend(1u32.to_be_bytes());
    payload.extend([192, 0, 2, 99]); // agent address
    payload.extend(0u32.to_be_bytes());
    payload.extend(9u32.to_be_bytes());
    payload.extend(1000u32.to_be_bytes());
    payload.extend(1u32.to_be_bytes());
    payload.extend(1u32.to_be_bytes()); // sample type: flow
    payload.extend((sample.len() as u32).to_be_bytes());
    payload.extend(&sample);

    harness.pipe.decode(&datagram(payload)).unwrap();
    harness.transport.close();

    let lines = harness.output.json_lines();
    assert_eq!(lines.len(), 1);
    let flow = &lines[0];
    assert_eq!(flow["type"], "sflow5");
    // The agent address wins over the UDP source.
    assert_eq!(flow["sampler_address"], "192.0.2.99");
    assert_eq!(flow["src_addr"], "203.0.113.5");
    assert_eq!(flow["src_port"], 53);
    assert_eq!(flow["dst_port"], 33000);
    assert_eq!(flow["bytes"], 90 * 512);
    assert_eq!(flow["packets"], 512);
    assert_eq!(flow["sampling_rate"], 512);
    assert_eq!(
        flow["layer_stack"],
        serde_json::json!(["Ethernet", "IPv4", "UDP"])
    );
}
