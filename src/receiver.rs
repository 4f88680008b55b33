//! Multi-socket UDP receiver with a bounded worker queue.
//!
//! One receiver owns `sockets` reuse-port sockets feeding a single bounded
//! queue drained by `workers` tasks. The queue is the only buffer: with
//! `blocking = true` a full queue pushes back into the kernel socket buffer
//! (whose drops the OS accounts); with `blocking = false` the receiver
//! drops the datagram itself and counts it. Decoder panics are caught per
//! datagram; the worker reports them on the error stream and keeps going.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_channel::TrySendError;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pipeline::PipelineError;

pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Applied when `queue_size` is unset and the receiver is non-blocking.
pub const DEFAULT_QUEUE_SIZE: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpReceiverConfig {
    /// Parallel sockets bound to the same address (SO_REUSEPORT fan-out).
    pub sockets: usize,
    /// Worker tasks pulling from the shared queue.
    pub workers: usize,
    pub queue_size: usize,
    /// Whether readers wait for queue space instead of dropping.
    pub blocking: bool,
}

impl Default for UdpReceiverConfig {
    fn default() -> Self {
        Self {
            sockets: 1,
            workers: 2,
            queue_size: DEFAULT_QUEUE_SIZE,
            blocking: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("receiver needs at least one socket")]
    NoSockets,

    #[error("receiver needs at least one worker")]
    NoWorkers,

    #[error("binding {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("receiver already started")]
    AlreadyStarted,
}

/// One received datagram, timestamped at reception.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub src: SocketAddr,
    pub time_received_ns: u64,
}

/// Synchronous decode entry point; decoding is CPU-bound and never
/// suspends.
pub type DecodeFn = Arc<dyn Fn(&Datagram) -> Result<(), PipelineError> + Send + Sync>;

/// Nanoseconds since epoch, the reception clock of the whole pipeline.
pub fn unix_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Free-list of payload buffers so steady-state reception does not
/// allocate per datagram. Exhaustion falls back to fresh allocation.
struct BufferPool {
    slots: Mutex<Vec<Vec<u8>>>,
    cap: usize,
}

impl BufferPool {
    fn new(cap: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            cap,
        }
    }

    fn get(&self) -> Vec<u8> {
        self.slots.lock().pop().unwrap_or_default()
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut slots = self.slots.lock();
        if slots.len() < self.cap {
            slots.push(buf);
        }
    }
}

pub struct UdpReceiver {
    cfg: UdpReceiverConfig,
    queue_tx: async_channel::Sender<Datagram>,
    queue_rx: async_channel::Receiver<Datagram>,
    errors_tx: async_channel::Sender<PipelineError>,
    errors_rx: async_channel::Receiver<PipelineError>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    bound: Mutex<Vec<SocketAddr>>,
    pool: Arc<BufferPool>,
    dropped: Arc<AtomicU64>,
    label: Mutex<String>,
}

impl UdpReceiver {
    pub fn new(cfg: UdpReceiverConfig) -> Result<Self, ReceiverError> {
        if cfg.sockets == 0 {
            return Err(ReceiverError::NoSockets);
        }
        if cfg.workers == 0 {
            return Err(ReceiverError::NoWorkers);
        }
        let (queue_tx, queue_rx) = async_channel::bounded(cfg.queue_size.max(1));
        let (errors_tx, errors_rx) = async_channel::unbounded();
        Ok(Self {
            cfg,
            queue_tx,
            queue_rx,
            errors_tx,
            errors_rx,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            bound: Mutex::new(Vec::new()),
            pool: Arc::new(BufferPool::new(4096)),
            dropped: Arc::new(AtomicU64::new(0)),
            label: Mutex::new(String::new()),
        })
    }

    /// Binds the sockets and spawns reader and worker tasks. A bind failure
    /// rolls every prior bind back and nothing runs.
    pub fn start(&self, host: &str, port: u16, decode: DecodeFn) -> Result<(), ReceiverError> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Err(ReceiverError::AlreadyStarted);
        }

        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|_| ReceiverError::Bind {
                addr: SocketAddr::from(([0, 0, 0, 0], port)),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid host {host}"),
                ),
            })?;

        let mut sockets = Vec::with_capacity(self.cfg.sockets);
        for _ in 0..self.cfg.sockets {
            // Dropping `sockets` on error closes every prior bind.
            let socket = bind_reuseport(addr).map_err(|source| ReceiverError::Bind {
                addr,
                source,
            })?;
            sockets.push(socket);
        }

        let label = match sockets.first().and_then(|s| s.local_addr().ok()) {
            Some(local) => local.to_string(),
            None => addr.to_string(),
        };
        *self.label.lock() = label.clone();
        *self.bound.lock() = sockets
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .collect();

        for socket in sockets {
            tasks.push(self.spawn_reader(socket, label.clone()));
        }
        for _ in 0..self.cfg.workers {
            tasks.push(self.spawn_worker(Arc::clone(&decode)));
        }

        debug!(listener = %label, sockets = self.cfg.sockets, workers = self.cfg.workers,
               queue_size = self.cfg.queue_size, blocking = self.cfg.blocking,
               "receiver started");
        Ok(())
    }

    fn spawn_reader(&self, socket: UdpSocket, label: String) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let queue_tx = self.queue_tx.clone();
        let pool = Arc::clone(&self.pool);
        let dropped = Arc::clone(&self.dropped);
        let blocking = self.cfg.blocking;

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let (len, src) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok(received) => received,
                        Err(_) if cancel.is_cancelled() => break,
                        Err(_) => continue,
                    },
                };

                crate::metrics::record_received(&label);
                let mut payload = pool.get();
                payload.extend_from_slice(&buf[..len]);
                let datagram = Datagram {
                    payload,
                    src,
                    time_received_ns: unix_now_ns(),
                };

                if blocking {
                    if queue_tx.send(datagram).await.is_err() {
                        break;
                    }
                } else {
                    match queue_tx.try_send(datagram) {
                        Ok(()) => {}
                        Err(TrySendError::Full(datagram)) => {
                            dropped.fetch_add(1, Ordering::Relaxed);
                            crate::metrics::record_dropped(&label);
                            pool.put(datagram.payload);
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
            }
        })
    }

    fn spawn_worker(&self, decode: DecodeFn) -> JoinHandle<()> {
        let queue_rx = self.queue_rx.clone();
        let errors_tx = self.errors_tx.clone();
        let pool = Arc::clone(&self.pool);

        tokio::spawn(async move {
            // Drains to EOF: recv only errors once the queue is closed and
            // empty, which is exactly the stop() contract.
            while let Ok(datagram) = queue_rx.recv().await {
                let outcome =
                    std::panic::catch_unwind(AssertUnwindSafe(|| decode(&datagram)));
                pool.put(datagram.payload);
                let error = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err),
                    Err(panic) => Some(PipelineError::Panic {
                        message: panic_message(panic),
                        backtrace: std::backtrace::Backtrace::force_capture().to_string(),
                    }),
                };
                if let Some(error) = error {
                    let _ = errors_tx.try_send(error);
                }
            }
        })
    }

    /// Stream of non-fatal errors: decode failures, template misses,
    /// caught panics.
    pub fn errors(&self) -> async_channel::Receiver<PipelineError> {
        self.errors_rx.clone()
    }

    /// Datagrams dropped because the queue was full (non-blocking mode).
    pub fn dropped_packets(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Address of the first bound socket, once started. With `port = 0`
    /// this is where the kernel actually put us.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.lock().first().copied()
    }

    /// Closes the sockets (unblocking readers), lets the workers drain the
    /// queue to EOF, and joins every task. Safe to call once; later calls
    /// are no-ops.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.queue_tx.close();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.errors_tx.close();
    }

    /// True when every queued datagram has been consumed.
    pub fn queue_is_empty(&self) -> bool {
        self.queue_rx.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn push_for_test(&self, datagram: Datagram) -> bool {
        match self.queue_tx.try_send(datagram) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

fn bind_reuseport(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "decoder panicked".to_string()
    }
}
